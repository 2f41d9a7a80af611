//! The VM (spec §3.9): the single owner of the heap, the string-intern
//! table, the built-in metatables, the registry, and the root thread.
//! Everything in `gal-runtime` that allocates goes through a `&mut Vm`.

use std::collections::HashMap;
use std::ptr::NonNull;

use gal_core::{TaggedMethod, Value};

use crate::allocator::Allocator;
use crate::closure::{Closure, HostFn};
use crate::error::{RuntimeError, ThreadStatus};
use crate::gc::{self, Collector};
use crate::object::{GcHeader, Mark};
use crate::proto::Proto;
use crate::string::GalString;
use crate::table::Table;
use crate::thread::Thread;

/// Interrupt/panic/lifecycle/debug hook slots an embedder can install
/// through `embedder::set_callback` (spec §6.3).
#[derive(Default)]
pub struct Callbacks {
    pub interrupt: Option<fn(&mut Vm) -> bool>,
    pub panic: Option<fn(&mut Vm, &RuntimeError)>,
    pub thread_lifecycle: Option<fn(&mut Vm, NonNull<Thread>, created: bool)>,
}

pub struct Vm {
    pub allocator: Allocator,
    pub collector: Collector,
    strings: HashMap<Box<[u8]>, NonNull<GalString>>,
    pub globals: NonNull<Table>,
    pub registry: NonNull<Table>,
    basic_metatables: HashMap<&'static str, NonNull<Table>>,
    tagged_method_names: HashMap<TaggedMethod, NonNull<GalString>>,
    pub root_thread: NonNull<Thread>,
    pub current_thread: NonNull<Thread>,
    pub callbacks: Callbacks,
}

impl Vm {
    pub fn new() -> Vm {
        let mut allocator = Allocator::new();
        let mut collector = Collector::new();
        let white = collector.current_white;

        let globals = unsafe { Self::alloc_table(&mut allocator, &mut collector, white) };
        let registry = unsafe { Self::alloc_table(&mut allocator, &mut collector, white) };
        let root_thread = unsafe { gc::alloc_object(&mut allocator, Thread::new(white)) };
        unsafe { collector.register(root_thread) };

        let mut vm = Vm {
            allocator,
            collector,
            strings: HashMap::new(),
            globals,
            registry,
            basic_metatables: HashMap::new(),
            tagged_method_names: HashMap::new(),
            root_thread,
            current_thread: root_thread,
            callbacks: Callbacks::default(),
        };
        for tm in TaggedMethod::ALL {
            let s = vm.intern(tm.name().as_bytes());
            vm.tagged_method_names.insert(tm, s);
        }
        vm
    }

    unsafe fn alloc_table(allocator: &mut Allocator, collector: &mut Collector, white: Mark) -> NonNull<Table> {
        let ptr = unsafe { gc::alloc_object(allocator, Table::new(white)) };
        unsafe { collector.register(ptr) };
        ptr
    }

    /// Interns `bytes`, returning the shared `GalString` (spec §3.3).
    /// Subsequent calls with equal bytes return the same pointer, which
    /// is why table keys and `==` can usually short-circuit on pointer
    /// identity before falling back to `GalString::content_eq`.
    pub fn intern(&mut self, bytes: &[u8]) -> NonNull<GalString> {
        if let Some(&existing) = self.strings.get(bytes) {
            return existing;
        }
        let white = self.collector.current_white;
        let ptr = unsafe { gc::alloc_object(&mut self.allocator, GalString::new(bytes, white)) };
        unsafe { self.collector.register(ptr) };
        self.strings.insert(bytes.into(), ptr);
        ptr
    }

    pub fn intern_value(&mut self, bytes: &[u8]) -> Value {
        Value::from_object_ptr(self.intern(bytes).as_ptr() as *mut ())
    }

    pub fn tagged_method_name(&self, tm: TaggedMethod) -> NonNull<GalString> {
        *self.tagged_method_names.get(&tm).expect("populated in Vm::new")
    }

    pub fn basic_metatable(&self, type_name: &'static str) -> Option<NonNull<Table>> {
        self.basic_metatables.get(type_name).copied()
    }

    pub fn set_basic_metatable(&mut self, type_name: &'static str, table: NonNull<Table>) {
        self.basic_metatables.insert(type_name, table);
    }

    /// Loads a compiled chunk's prototypes into GC-owned `Proto`
    /// objects, wiring up `Constant::Closure` children by index, and
    /// returns the main prototype (spec §6.3's `load`).
    pub fn load_chunk(&mut self, chunk: gal_core::Chunk) -> NonNull<Proto> {
        let white = self.collector.current_white;
        let strings: std::rc::Rc<[NonNull<GalString>]> =
            chunk.strings.iter().map(|s| self.intern(s.as_bytes())).collect::<Vec<_>>().into();
        let protos: Vec<NonNull<Proto>> = chunk
            .prototypes
            .iter()
            .map(|p| {
                let ptr =
                    unsafe { gc::alloc_object(&mut self.allocator, Proto::new(p.clone(), strings.clone(), white)) };
                unsafe { self.collector.register(ptr) };
                ptr
            })
            .collect();
        let all_protos: std::rc::Rc<[NonNull<Proto>]> = protos.clone().into();
        for &proto in &protos {
            unsafe { (*proto.as_ptr()).all_protos = all_protos.clone() };
        }
        protos[chunk.main_prototype as usize]
    }

    pub fn new_host_closure(&mut self, func: HostFn, name: &'static str) -> NonNull<Closure> {
        let white = self.collector.current_white;
        let ptr = unsafe { gc::alloc_object(&mut self.allocator, Closure::host(func, name, white)) };
        unsafe { self.collector.register(ptr) };
        ptr
    }

    pub fn new_table(&mut self) -> NonNull<Table> {
        let white = self.collector.current_white;
        unsafe { Self::alloc_table(&mut self.allocator, &mut self.collector, white) }
    }

    pub fn new_thread(&mut self) -> NonNull<Thread> {
        let white = self.collector.current_white;
        let ptr = unsafe { gc::alloc_object(&mut self.allocator, Thread::new(white)) };
        unsafe { self.collector.register(ptr) };
        if let Some(hook) = self.callbacks.thread_lifecycle {
            hook(self, ptr, true);
        }
        ptr
    }

    /// Marks this `Vm`'s permanent roots: `globals`, `registry` and
    /// `root_thread` are reachable for as long as the `Vm` itself is,
    /// independent of anything a script has stored. Any other thread
    /// (one `new_thread` returned but nothing on the GC heap points to
    /// yet) is only kept alive by whatever the embedder anchors it in.
    fn mark_roots(&mut self) {
        self.collector.mark_root(unsafe { NonNull::new_unchecked(self.globals.as_ptr() as *mut GcHeader) });
        self.collector.mark_root(unsafe { NonNull::new_unchecked(self.registry.as_ptr() as *mut GcHeader) });
        self.collector.mark_root(unsafe { NonNull::new_unchecked(self.root_thread.as_ptr() as *mut GcHeader) });
    }

    /// Runs a bounded amount of incremental GC work (spec §6.3's
    /// `gc_step`). `budget` is the number of gray objects the `Propagate`
    /// phase may blacken before returning.
    pub fn gc_step(&mut self, budget: usize) {
        if self.collector.phase == crate::gc::Phase::Pause {
            self.mark_roots();
        }
        let collector = &mut self.collector;
        let allocator = &mut self.allocator;
        collector.step(
            budget,
            allocator,
            |c, header| unsafe { Vm::trace(c, header) },
            |alloc, header| unsafe { Vm::free_by_kind(alloc, header) },
        );
    }

    pub fn gc_full(&mut self) {
        loop {
            let before = self.collector.phase;
            self.gc_step(1 << 20);
            if matches!(before, crate::gc::Phase::Sweep) && self.collector.phase == crate::gc::Phase::Pause {
                break;
            }
            if self.collector.phase == crate::gc::Phase::Pause {
                // Needs at least one full lap through propagate+sweep.
                self.gc_step(1 << 20);
                break;
            }
        }
    }

    /// # Safety
    /// `header` must be a live object registered with this collector.
    unsafe fn trace(collector: &mut Collector, header: NonNull<GcHeader>) {
        let kind = unsafe { header.as_ref() }.kind;
        match kind {
            crate::object::ObjectKind::Table => {
                let table = unsafe { &*(header.as_ptr() as *const Table) };
                if let Some(meta) = table.metatable {
                    collector.mark_root(unsafe { NonNull::new_unchecked(meta.as_ptr() as *mut GcHeader) });
                }
                if table.weak_mode != crate::table::WeakMode::Strong {
                    collector.defer_weak_table(unsafe { NonNull::new_unchecked(header.as_ptr() as *mut Table) });
                    return;
                }
                for (k, v) in table.iter() {
                    Vm::mark_value(collector, k);
                    Vm::mark_value(collector, v);
                }
            }
            crate::object::ObjectKind::Closure => {
                let closure = unsafe { &*(header.as_ptr() as *const Closure) };
                if let crate::closure::ClosureBody::Script { proto, upvalues } = &closure.body {
                    collector.mark_root(unsafe { NonNull::new_unchecked(proto.as_ptr() as *mut GcHeader) });
                    for uv in upvalues {
                        collector.mark_root(unsafe { NonNull::new_unchecked(uv.as_ptr() as *mut GcHeader) });
                    }
                }
            }
            crate::object::ObjectKind::Prototype => {
                let proto = unsafe { &*(header.as_ptr() as *const Proto) };
                for child in proto.all_protos.iter() {
                    collector.mark_root(unsafe { NonNull::new_unchecked(child.as_ptr() as *mut GcHeader) });
                }
            }
            crate::object::ObjectKind::Upvalue => {
                let uv = unsafe { &*(header.as_ptr() as *const crate::upvalue::Upvalue) };
                if let crate::upvalue::UpvalueState::Closed(v) = uv.state {
                    Vm::mark_value(collector, v);
                }
            }
            crate::object::ObjectKind::Thread => {
                let thread = unsafe { &*(header.as_ptr() as *const Thread) };
                for v in &thread.stack {
                    Vm::mark_value(collector, *v);
                }
                for frame in &thread.call_stack {
                    collector
                        .mark_root(unsafe { NonNull::new_unchecked(frame.closure.as_ptr() as *mut GcHeader) });
                    for v in &frame.varargs {
                        Vm::mark_value(collector, *v);
                    }
                }
            }
            crate::object::ObjectKind::String | crate::object::ObjectKind::UserData | crate::object::ObjectKind::DeadKey => {}
        }
    }

    fn mark_value(collector: &mut Collector, v: Value) {
        if let Some(ptr) = v.as_object_ptr() {
            collector.mark_root(unsafe { NonNull::new_unchecked(ptr as *mut GcHeader) });
        }
    }

    /// # Safety
    /// `header` must point at a dead, unreferenced object of the kind
    /// its `ObjectKind` claims.
    unsafe fn free_by_kind(allocator: &mut Allocator, header: NonNull<GcHeader>) {
        let kind = unsafe { header.as_ref() }.kind;
        unsafe {
            match kind {
                crate::object::ObjectKind::String => gc::free_object(allocator, header.cast::<GalString>()),
                crate::object::ObjectKind::Table => gc::free_object(allocator, header.cast::<Table>()),
                crate::object::ObjectKind::Closure => gc::free_object(allocator, header.cast::<Closure>()),
                crate::object::ObjectKind::Prototype => gc::free_object(allocator, header.cast::<Proto>()),
                crate::object::ObjectKind::Upvalue => {
                    gc::free_object(allocator, header.cast::<crate::upvalue::Upvalue>())
                }
                crate::object::ObjectKind::Thread => gc::free_object(allocator, header.cast::<Thread>()),
                crate::object::ObjectKind::UserData | crate::object::ObjectKind::DeadKey => {}
            }
        }
    }

    pub fn status(&self, thread: NonNull<Thread>) -> ThreadStatus {
        unsafe { thread.as_ref() }.status
    }
}

impl Default for Vm {
    fn default() -> Vm {
        Vm::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interning_the_same_bytes_returns_the_same_pointer() {
        let mut vm = Vm::new();
        let a = vm.intern(b"hello");
        let b = vm.intern(b"hello");
        assert_eq!(a, b);
    }

    #[test]
    fn globals_table_starts_empty() {
        let mut vm = Vm::new();
        let v = unsafe { vm.globals.as_ref().get(vm.intern_value(b"x")) };
        assert!(v.is_null());
    }
}
