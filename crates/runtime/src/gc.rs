//! Tri-color incremental mark/sweep (spec §4.4): `pause` → `propagate` →
//! `propagate_again` → `atomic` → `sweep_string` → `sweep` → `pause`.
//! `gc_step` does a bounded amount of work per call and returns; nothing
//! in this module ever walks the whole heap in one go except the single
//! uninterruptible `atomic` step the protocol requires.

use std::mem::{align_of, size_of};
use std::ptr::{self, NonNull};

use crate::allocator::Allocator;
use crate::object::{GcHeader, GcObject, Mark, ObjectKind};
use crate::table::{Table, WeakMode};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Pause,
    Propagate,
    PropagateAgain,
    Atomic,
    SweepString,
    Sweep,
}

/// Ziegler-Nichols-tuned proportional-integral controller over a
/// fixed-size ring of recent allocation/collection rate samples, used
/// to size the next `gc_step`'s work budget (spec §4.4).
pub struct PiController {
    samples: [f64; 32],
    cursor: usize,
    integral: f64,
}

impl PiController {
    const KP: f64 = 0.405;
    const KI: f64 = 0.1944;

    pub fn new() -> PiController {
        PiController { samples: [0.0; 32], cursor: 0, integral: 0.0 }
    }

    /// `error` is the gap between the target heap growth rate and the
    /// observed one this step; returns the next step's work budget in
    /// arbitrary "units" (object headers to visit).
    pub fn update(&mut self, error: f64) -> f64 {
        self.samples[self.cursor % self.samples.len()] = error;
        self.cursor = self.cursor.wrapping_add(1);
        self.integral += error * Self::KI;
        self.integral = self.integral.clamp(-1000.0, 1000.0);
        let mean: f64 = self.samples.iter().sum::<f64>() / self.samples.len() as f64;
        (Self::KP * mean + self.integral).max(8.0)
    }
}

impl Default for PiController {
    fn default() -> PiController {
        PiController::new()
    }
}

/// Everything a `propagate` step needs to blacken an object and push
/// its children back onto the gray list. Kept free of `Vm` so `gc.rs`
/// doesn't need to know the whole object graph's shape beyond what
/// each `trace_*` function below already encodes.
pub struct Collector {
    pub phase: Phase,
    pub current_white: Mark,
    pub all_objects: Option<NonNull<GcHeader>>,
    gray: Vec<NonNull<GcHeader>>,
    gray_again: Vec<NonNull<GcHeader>>,
    weak_tables: Vec<NonNull<Table>>,
    sweep_cursor: Option<NonNull<GcHeader>>,
    sweep_prev: Option<NonNull<GcHeader>>,
    pub controller: PiController,
    pub debt: f64,
}

impl Collector {
    pub fn new() -> Collector {
        Collector {
            phase: Phase::Pause,
            current_white: Mark::White0,
            all_objects: None,
            gray: Vec::new(),
            gray_again: Vec::new(),
            weak_tables: Vec::new(),
            sweep_cursor: None,
            sweep_prev: None,
            controller: PiController::new(),
            debt: 0.0,
        }
    }

    fn other_white(&self) -> Mark {
        match self.current_white {
            Mark::White0 => Mark::White1,
            _ => Mark::White0,
        }
    }

    /// Links a freshly allocated object into the all-objects list,
    /// white (collectable on the very next cycle unless referenced).
    ///
    /// # Safety
    /// `ptr` must be a pointer into a live object whose `header.next`
    /// has not already been linked anywhere.
    pub unsafe fn register<T: GcObject>(&mut self, ptr: NonNull<T>) {
        let header = unsafe { NonNull::new_unchecked(ptr.as_ptr() as *mut GcHeader) };
        unsafe { header.as_ref() }.next.set(self.all_objects);
        self.all_objects = Some(header);
    }

    /// Forward write barrier (spec §4.4): if `owner` is black and
    /// `referent` is white, gray the referent immediately rather than
    /// waiting for the next propagate step to rediscover it.
    ///
    /// # Safety
    /// Both pointers must be live.
    pub unsafe fn barrier_forward(&mut self, owner: *const GcHeader, referent: NonNull<GcHeader>) {
        unsafe {
            if (*owner).mark.get() == Mark::Black && referent.as_ref().mark.get().is_white(self.current_white) {
                self.mark_gray(referent);
            }
        }
    }

    /// Backward write barrier: re-gray a black owner so the next
    /// `propagate_again` pass rescans it wholesale. Cheaper to apply
    /// than a forward barrier for objects mutated often (tables).
    ///
    /// # Safety
    /// `owner` must be live.
    pub unsafe fn barrier_back(&mut self, owner: NonNull<GcHeader>) {
        unsafe {
            if owner.as_ref().mark.get() == Mark::Black {
                owner.as_ref().mark.set(Mark::Gray);
                self.gray_again.push(owner);
            }
        }
    }

    /// # Safety
    /// `ptr` must be live and not already gray/black.
    pub unsafe fn mark_gray(&mut self, ptr: NonNull<GcHeader>) {
        unsafe {
            if ptr.as_ref().mark.get() == Mark::Fixed {
                return;
            }
            ptr.as_ref().mark.set(Mark::Gray);
        }
        self.gray.push(ptr);
    }

    pub fn mark_root(&mut self, ptr: NonNull<GcHeader>) {
        if unsafe { ptr.as_ref().mark.get().is_white(self.current_white) } {
            unsafe { self.mark_gray(ptr) };
        }
    }

    /// Runs one bounded unit of work and returns the bytes the caller
    /// should treat as "newly reclaimable" once a full cycle completes
    /// (always 0 outside `Sweep`). `trace` blackens one gray object by
    /// invoking the supplied callback with every child it should mark.
    pub fn step<F: FnMut(&mut Collector, NonNull<GcHeader>)>(
        &mut self,
        budget: usize,
        allocator: &mut Allocator,
        mut trace: F,
        mut free_one: impl FnMut(&mut Allocator, NonNull<GcHeader>),
    ) {
        let mut work = budget;
        while work > 0 {
            match self.phase {
                Phase::Pause => {
                    tracing::trace!(budget, "starting a new collection cycle");
                    self.phase = Phase::Propagate;
                }
                Phase::Propagate => {
                    if let Some(obj) = self.gray.pop() {
                        unsafe { obj.as_ref() }.mark.set(Mark::Black);
                        trace(self, obj);
                        work -= 1;
                    } else {
                        self.phase = Phase::PropagateAgain;
                    }
                }
                Phase::PropagateAgain => {
                    if let Some(obj) = self.gray_again.pop() {
                        unsafe { obj.as_ref() }.mark.set(Mark::Black);
                        trace(self, obj);
                        work -= 1;
                    } else if !self.gray.is_empty() {
                        self.phase = Phase::Propagate;
                    } else {
                        self.phase = Phase::Atomic;
                    }
                }
                Phase::Atomic => {
                    self.atomic_step();
                    self.phase = Phase::SweepString;
                    self.sweep_cursor = self.all_objects;
                    self.sweep_prev = None;
                    work -= 1;
                }
                Phase::SweepString => {
                    if !self.sweep_one(ObjectKind::String, allocator, &mut free_one) {
                        self.phase = Phase::Sweep;
                        self.sweep_cursor = self.all_objects;
                        self.sweep_prev = None;
                    }
                    work -= 1;
                }
                Phase::Sweep => {
                    if !self.sweep_any(allocator, &mut free_one) {
                        self.phase = Phase::Pause;
                        return;
                    }
                    work -= 1;
                }
            }
        }
    }

    /// One uninterruptible pass (spec §4.4): clear dead weak-table
    /// entries and flip the current white so the sweep that follows
    /// reclaims exactly this cycle's garbage.
    fn atomic_step(&mut self) {
        let dead_white = self.other_white();
        let weak_table_count = self.weak_tables.len();
        for mut table in self.weak_tables.drain(..) {
            unsafe { table.as_mut() }.clear_dead_weak_entries(dead_white);
        }
        tracing::trace!(weak_table_count, "atomic step: cleared dead weak entries, flipping white");
        self.current_white = dead_white;
    }

    fn sweep_one(
        &mut self,
        kind: ObjectKind,
        allocator: &mut Allocator,
        free_one: &mut impl FnMut(&mut Allocator, NonNull<GcHeader>),
    ) -> bool {
        while let Some(cur) = self.sweep_cursor {
            let header = unsafe { cur.as_ref() };
            let next = header.next.get();
            if header.kind != kind {
                self.sweep_prev = Some(cur);
                self.sweep_cursor = next;
                continue;
            }
            self.sweep_cursor = next;
            if header.is_dead(self.current_white) && header.mark.get() != Mark::Fixed {
                self.unlink(cur, next);
                free_one(allocator, cur);
            } else {
                header.mark.set(self.current_white);
                self.sweep_prev = Some(cur);
            }
            return true;
        }
        false
    }

    fn sweep_any(
        &mut self,
        allocator: &mut Allocator,
        free_one: &mut impl FnMut(&mut Allocator, NonNull<GcHeader>),
    ) -> bool {
        let Some(cur) = self.sweep_cursor else { return false };
        let header = unsafe { cur.as_ref() };
        let next = header.next.get();
        self.sweep_cursor = next;
        if header.is_dead(self.current_white) && header.mark.get() != Mark::Fixed {
            self.unlink(cur, next);
            free_one(allocator, cur);
        } else if header.mark.get() != Mark::Fixed {
            header.mark.set(self.current_white);
            self.sweep_prev = Some(cur);
        } else {
            self.sweep_prev = Some(cur);
        }
        true
    }

    fn unlink(&mut self, cur: NonNull<GcHeader>, next: Option<NonNull<GcHeader>>) {
        match self.sweep_prev {
            Some(prev) => unsafe { prev.as_ref() }.next.set(next),
            None => self.all_objects = next,
        }
        let _ = cur;
    }

    pub fn defer_weak_table(&mut self, table: NonNull<Table>) {
        self.weak_tables.push(table);
    }
}

impl Default for Collector {
    fn default() -> Collector {
        Collector::new()
    }
}

/// Placement-allocates `value` through the size-class allocator and
/// returns a raw pointer, uninitialized as far as the GC is concerned
/// until the caller also calls `Collector::register`.
///
/// # Safety
/// Every `alloc_object::<T>` must be paired with exactly one
/// `free_object::<T>` once the object becomes unreachable; the caller
/// must not read or write through stale pointers afterward.
pub unsafe fn alloc_object<T>(allocator: &mut Allocator, value: T) -> NonNull<T> {
    let ptr = allocator.alloc(size_of::<T>(), align_of::<T>()).cast::<T>();
    unsafe { ptr.as_ptr().write(value) };
    ptr
}

/// # Safety
/// `ptr` must have come from `alloc_object::<T>` and not already be freed.
pub unsafe fn free_object<T>(allocator: &mut Allocator, ptr: NonNull<T>) {
    unsafe {
        ptr::drop_in_place(ptr.as_ptr());
        allocator.dealloc(ptr.cast(), size_of::<T>(), align_of::<T>());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn controller_output_stays_bounded_under_repeated_error() {
        let mut pi = PiController::new();
        let mut last = 0.0;
        for _ in 0..64 {
            last = pi.update(10.0);
        }
        assert!(last.is_finite());
        assert!(last > 0.0);
    }

    #[test]
    fn other_white_flips() {
        let mut c = Collector::new();
        assert_eq!(c.other_white(), Mark::White1);
        c.current_white = Mark::White1;
        assert_eq!(c.other_white(), Mark::White0);
    }
}
