//! Hybrid array/hash table (spec §3.4): dense integer keys `1..=n` live
//! in a growable `Vec`, everything else in a hash part. A table may
//! carry a metatable pointer for tagged-method dispatch, a cached
//! absence bitmap so a miss on a metatable without `__index` costs one
//! bitwise test, and a 2-bit weak-mode flag read once when a metatable
//! with a `"mode"` string is attached.

use std::collections::HashMap;
use std::ptr::NonNull;

use gal_core::{TaggedMethod, Value};

use crate::equality::{value_str, TableKey};
use crate::object::{GcHeader, GcObject, Mark, ObjectKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WeakMode {
    #[default]
    Strong,
    WeakKeys,
    WeakValues,
    WeakBoth,
}

pub struct Table {
    pub header: GcHeader,
    array: Vec<Value>,
    hash: HashMap<TableKey, Value>,
    pub metatable: Option<NonNull<Table>>,
    /// Bit `i` set means `TaggedMethod::ALL[i]` is absent from
    /// `metatable` — read once per lookup instead of walking the chain.
    absent_tags: u32,
    pub mutable: bool,
    pub weak_mode: WeakMode,
}

impl Table {
    pub fn new(white: Mark) -> Table {
        Table {
            header: GcHeader::new(ObjectKind::Table, white),
            array: Vec::new(),
            hash: HashMap::new(),
            metatable: None,
            absent_tags: u32::MAX,
            mutable: true,
            weak_mode: WeakMode::Strong,
        }
    }

    fn array_index(key: Value) -> Option<usize> {
        let n = key.as_number()?;
        if n.fract() == 0.0 && n >= 1.0 && n <= u32::MAX as f64 {
            Some(n as usize - 1)
        } else {
            None
        }
    }

    /// # Safety
    /// Any object pointer reachable from `key` must still be live.
    pub unsafe fn get(&self, key: Value) -> Value {
        if let Some(i) = Table::array_index(key) {
            if i < self.array.len() {
                return self.array[i];
            }
        }
        self.hash.get(&TableKey(key)).copied().unwrap_or(Value::NULL)
    }

    /// # Safety
    /// Any object pointer reachable from `key` must still be live; the
    /// write barrier for `value` (if it references a heap object) must
    /// already have run or be unnecessary (e.g. this table is white).
    pub unsafe fn set(&mut self, key: Value, value: Value) {
        if let Some(i) = Table::array_index(key) {
            if i < self.array.len() {
                self.array[i] = value;
                return;
            }
            if i == self.array.len() {
                self.array.push(value);
                self.absorb_from_hash();
                return;
            }
        }
        if value.is_null() {
            self.hash.remove(&TableKey(key));
        } else {
            self.hash.insert(TableKey(key), value);
        }
    }

    /// After an append grows the array part, pulls any now-contiguous
    /// integer keys out of the hash part and into the array.
    fn absorb_from_hash(&mut self) {
        loop {
            let next_key = Value::from_number((self.array.len() + 1) as f64);
            match self.hash.remove(&TableKey(next_key)) {
                Some(v) => self.array.push(v),
                None => break,
            }
        }
    }

    /// Border length per the array part (spec's `#` operator over the
    /// dense prefix; holes inside the array part are not reconciled).
    pub fn len(&self) -> usize {
        self.array.iter().rposition(|v| !v.is_null()).map_or(0, |i| i + 1)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0 && self.hash.is_empty()
    }

    pub fn insert_list(&mut self, index: usize, value: Value) {
        if index >= self.array.len() {
            self.array.resize(index + 1, Value::NULL);
        }
        self.array[index] = value;
    }

    /// Called whenever `metatable` changes; recomputes the absence
    /// bitmap and the cached weak-mode flag in one pass (spec §3.4,
    /// §4.4's weak-table note: the mode string is read once, not on
    /// every GC sweep).
    ///
    /// # Safety
    /// `meta`, if set, must be a live table.
    pub unsafe fn attach_metatable(&mut self, meta: Option<NonNull<Table>>) {
        self.metatable = meta;
        self.absent_tags = u32::MAX;
        self.weak_mode = WeakMode::Strong;
        let Some(meta) = meta else { return };
        let meta = unsafe { meta.as_ref() };
        for tm in TaggedMethod::ALL {
            let present = meta.hash.keys().any(|k| unsafe { value_str(k.0) } == Some(tm.name()));
            if present {
                self.absent_tags &= !tm.bit();
            }
        }
        let mode = meta.hash.iter().find_map(|(k, v)| {
            (unsafe { value_str(k.0) } == Some("mode")).then(|| unsafe { value_str(*v) }).flatten()
        });
        self.weak_mode = match mode {
            Some("k") => WeakMode::WeakKeys,
            Some("v") => WeakMode::WeakValues,
            Some("kv") => WeakMode::WeakBoth,
            _ => WeakMode::Strong,
        };
    }

    pub fn tagged_method_present(&self, tm: TaggedMethod) -> bool {
        self.metatable.is_some() && self.absent_tags & tm.bit() == 0
    }

    /// # Safety
    /// `self.metatable` must still be live if present.
    pub unsafe fn tagged_method(&self, tm: TaggedMethod) -> Option<Value> {
        if !self.tagged_method_present(tm) {
            return None;
        }
        let meta = unsafe { self.metatable?.as_ref() };
        meta.hash.iter().find_map(|(k, v)| (unsafe { value_str(k.0) } == Some(tm.name())).then_some(*v))
    }

    /// Drops entries whose key or value (per `weak_mode`) points at an
    /// object that didn't survive this cycle's mark phase — called once
    /// per table from the collector's atomic step, before the white
    /// flip, so `dead_white` is still this cycle's garbage color.
    pub fn clear_dead_weak_entries(&mut self, dead_white: Mark) {
        if self.weak_mode == WeakMode::Strong {
            return;
        }
        let check_keys = matches!(self.weak_mode, WeakMode::WeakKeys | WeakMode::WeakBoth);
        let check_values = matches!(self.weak_mode, WeakMode::WeakValues | WeakMode::WeakBoth);
        let is_dead = |v: Value| match v.as_object_ptr() {
            Some(ptr) => unsafe { (*(ptr as *const GcHeader)).mark.get() == dead_white },
            None => false,
        };
        if check_values {
            for slot in self.array.iter_mut() {
                if is_dead(*slot) {
                    *slot = Value::NULL;
                }
            }
        }
        self.hash.retain(|k, v| !((check_keys && is_dead(k.0)) || (check_values && is_dead(*v))));
    }

    pub fn iter(&self) -> impl Iterator<Item = (Value, Value)> + '_ {
        self.array
            .iter()
            .enumerate()
            .filter(|(_, v)| !v.is_null())
            .map(|(i, v)| (Value::from_number((i + 1) as f64), *v))
            .chain(self.hash.iter().map(|(k, v)| (k.0, *v)))
    }
}

unsafe impl GcObject for Table {
    fn header(&self) -> &GcHeader {
        &self.header
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn array_part_absorbs_contiguous_hash_entries() {
        let mut t = Table::new(Mark::White0);
        unsafe {
            t.set(Value::from_number(2.0), Value::from_number(20.0));
            t.set(Value::from_number(1.0), Value::from_number(10.0));
        }
        assert_eq!(t.len(), 2);
        unsafe {
            assert_eq!(t.get(Value::from_number(1.0)).as_number(), Some(10.0));
            assert_eq!(t.get(Value::from_number(2.0)).as_number(), Some(20.0));
        }
    }

    #[test]
    fn missing_key_reads_null() {
        let t = Table::new(Mark::White0);
        unsafe {
            assert!(t.get(Value::from_number(99.0)).is_null());
        }
    }

    #[test]
    fn setting_null_removes_a_hash_entry() {
        let mut t = Table::new(Mark::White0);
        unsafe {
            t.set(Value::from_number(100.0), Value::from_number(1.0));
            t.set(Value::from_number(100.0), Value::NULL);
            assert!(t.get(Value::from_number(100.0)).is_null());
        }
    }
}
