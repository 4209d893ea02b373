use std::collections::HashMap;
use std::hash::{BuildHasherDefault, Hasher};
use std::ops::{Index, IndexMut};

use tracing::trace;

use crate::object::{
    BoundMethod, Class, Closure, Dict, Enum, Function, Instance, List, Object, ObjectType,
    StringObj, Upvalue,
};
use crate::value::Value;

/// A safe handle to a heap-allocated object.
/// This acts as an index into the Heap's object storage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Handle(pub usize);

/// 32-bit FNV-1a over raw bytes
pub fn fnv1a(bytes: &[u8]) -> u32 {
    let mut hash: u32 = 2_166_136_261;
    for &byte in bytes {
        hash ^= byte as u32;
        hash = hash.wrapping_mul(16_777_619);
    }
    hash
}

/// [`Hasher`] wrapper so the interner table probes with FNV-1a as well
pub struct Fnv1aHasher(u32);

impl Default for Fnv1aHasher {
    fn default() -> Self {
        Self(2_166_136_261)
    }
}

impl Hasher for Fnv1aHasher {
    fn write(&mut self, bytes: &[u8]) {
        for &byte in bytes {
            self.0 ^= byte as u32;
            self.0 = self.0.wrapping_mul(16_777_619);
        }
    }

    fn finish(&self) -> u64 {
        self.0 as u64
    }
}

type InternTable = HashMap<Box<str>, Handle, BuildHasherDefault<Fnv1aHasher>>;

/// Aggregated GC statistics
#[derive(Default, Debug, Clone)]
pub struct GcStats {
    pub cycles: u64,
    pub total_freed_bytes: usize,
    pub last_freed_bytes: usize,
    pub last_before_bytes: usize,
    pub last_after_bytes: usize,
    pub last_next_trigger_bytes: usize,
}

impl GcStats {
    fn record(&mut self, before: usize, freed: usize, after: usize, next_trigger: usize) {
        self.cycles += 1;
        self.total_freed_bytes += freed;
        self.last_freed_bytes = freed;
        self.last_before_bytes = before;
        self.last_after_bytes = after;
        self.last_next_trigger_bytes = next_trigger;
    }
}

/// Object header: mark bit and the size charged at allocation
struct Slot {
    is_marked: bool,
    size: usize,
    object: Object,
}

/// Owner of every heap object.
///
/// Allocation never collects by itself: the VM decides when to run a cycle
/// because only it knows the roots. See [`Vm::collect_garbage`](crate::vm::Vm::collect_garbage).
pub struct Heap {
    slots: Vec<Option<Slot>>,
    free_list: Vec<usize>,
    gray_stack: Vec<Handle>,

    /// Weak index of live strings; entries die with their string
    strings: InternTable,

    pub bytes_allocated: usize,
    pub next_gc: usize,
    min_threshold: usize,
    grow_factor: usize,
    stats: GcStats,
}

impl Heap {
    pub fn new() -> Self {
        Self::with_thresholds(1024 * 1024, 1024 * 1024, 2)
    }

    pub fn with_thresholds(initial: usize, min_threshold: usize, grow_factor: usize) -> Self {
        Self {
            slots: Vec::new(),
            free_list: Vec::new(),
            gray_stack: Vec::new(),
            strings: InternTable::default(),
            bytes_allocated: 0,
            next_gc: initial,
            min_threshold,
            grow_factor: grow_factor.max(1),
            stats: GcStats::default(),
        }
    }

    /// Allocate or return existing interned string
    pub fn intern(&mut self, s: &str) -> Handle {
        if let Some(&handle) = self.strings.get(s) {
            return handle;
        }
        self.alloc_string(Box::from(s))
    }

    /// Intern a string the caller already owns; the buffer is reused on a miss
    pub fn intern_owned(&mut self, s: String) -> Handle {
        if let Some(&handle) = self.strings.get(s.as_str()) {
            return handle;
        }
        self.alloc_string(s.into_boxed_str())
    }

    /// Look up an interned string without allocating
    pub fn find_string(&self, s: &str) -> Option<Handle> {
        self.strings.get(s).copied()
    }

    fn alloc_string(&mut self, chars: Box<str>) -> Handle {
        let hash = fnv1a(chars.as_bytes());
        let handle = self.alloc(Object::String(StringObj { chars: chars.clone(), hash }));
        self.strings.insert(chars, handle);
        handle
    }

    pub fn alloc_function(&mut self, f: Function) -> Handle {
        self.alloc(Object::Function(f))
    }

    pub fn alloc_closure(&mut self, function: Handle, upvalues: Vec<Handle>) -> Handle {
        self.alloc(Object::Closure(Closure { function, upvalues }))
    }

    pub fn alloc_upvalue(&mut self, slot: usize) -> Handle {
        self.alloc(Object::Upvalue(Upvalue::new(slot)))
    }

    pub fn alloc_class(&mut self, name: Handle) -> Handle {
        self.alloc(Object::Class(Class { name, methods: HashMap::new() }))
    }

    pub fn alloc_instance(&mut self, class: Handle) -> Handle {
        self.alloc(Object::Instance(Instance { class, fields: HashMap::new() }))
    }

    pub fn alloc_bound_method(&mut self, receiver: Value, method: Handle) -> Handle {
        self.alloc(Object::BoundMethod(BoundMethod { receiver, method }))
    }

    pub fn alloc(&mut self, obj: Object) -> Handle {
        let size = obj.size_bytes();
        self.bytes_allocated += size;
        let obj_type = obj.obj_type();

        let slot = Slot { is_marked: false, size, object: obj };
        let handle = if let Some(idx) = self.free_list.pop() {
            self.slots[idx] = Some(slot);
            Handle(idx)
        } else {
            self.slots.push(Some(slot));
            Handle(self.slots.len() - 1)
        };
        trace!(handle = handle.0, size, ?obj_type, "allocate");
        handle
    }

    /// Charge growth of an existing object (list append, new field, ...)
    pub fn charge(&mut self, handle: Handle, bytes: usize) {
        if let Some(Some(slot)) = self.slots.get_mut(handle.0) {
            slot.size += bytes;
            self.bytes_allocated += bytes;
        }
    }

    /// Release bytes previously charged to an object (dict entry removed, ...)
    pub fn discharge(&mut self, handle: Handle, bytes: usize) {
        if let Some(Some(slot)) = self.slots.get_mut(handle.0) {
            let bytes = bytes.min(slot.size);
            slot.size -= bytes;
            self.bytes_allocated = self.bytes_allocated.saturating_sub(bytes);
        }
    }

    pub fn get(&self, handle: Handle) -> Option<&Object> {
        self.slots.get(handle.0)?.as_ref().map(|slot| &slot.object)
    }

    pub fn get_mut(&mut self, handle: Handle) -> Option<&mut Object> {
        self.slots.get_mut(handle.0)?.as_mut().map(|slot| &mut slot.object)
    }

    pub fn obj_type(&self, value: Value) -> Option<ObjectType> {
        value.as_obj().and_then(|h| self.get(h)).map(Object::obj_type)
    }

    pub fn is_type(&self, value: Value, obj_type: ObjectType) -> bool {
        self.obj_type(value) == Some(obj_type)
    }

    pub fn get_string(&self, handle: Handle) -> Option<&str> {
        match self.get(handle)? {
            Object::String(s) => Some(&s.chars),
            _ => None,
        }
    }

    pub fn get_function(&self, handle: Handle) -> Option<&Function> {
        match self.get(handle)? {
            Object::Function(f) => Some(f),
            _ => None,
        }
    }

    pub fn get_closure(&self, handle: Handle) -> Option<&Closure> {
        match self.get(handle)? {
            Object::Closure(c) => Some(c),
            _ => None,
        }
    }

    pub fn get_closure_mut(&mut self, handle: Handle) -> Option<&mut Closure> {
        match self.get_mut(handle)? {
            Object::Closure(c) => Some(c),
            _ => None,
        }
    }

    pub fn get_upvalue(&self, handle: Handle) -> Option<&Upvalue> {
        match self.get(handle)? {
            Object::Upvalue(u) => Some(u),
            _ => None,
        }
    }

    pub fn get_upvalue_mut(&mut self, handle: Handle) -> Option<&mut Upvalue> {
        match self.get_mut(handle)? {
            Object::Upvalue(u) => Some(u),
            _ => None,
        }
    }

    pub fn get_class(&self, handle: Handle) -> Option<&Class> {
        match self.get(handle)? {
            Object::Class(c) => Some(c),
            _ => None,
        }
    }

    pub fn get_class_mut(&mut self, handle: Handle) -> Option<&mut Class> {
        match self.get_mut(handle)? {
            Object::Class(c) => Some(c),
            _ => None,
        }
    }

    pub fn get_instance(&self, handle: Handle) -> Option<&Instance> {
        match self.get(handle)? {
            Object::Instance(i) => Some(i),
            _ => None,
        }
    }

    pub fn get_instance_mut(&mut self, handle: Handle) -> Option<&mut Instance> {
        match self.get_mut(handle)? {
            Object::Instance(i) => Some(i),
            _ => None,
        }
    }

    pub fn get_bound_method(&self, handle: Handle) -> Option<&BoundMethod> {
        match self.get(handle)? {
            Object::BoundMethod(b) => Some(b),
            _ => None,
        }
    }

    pub fn get_list(&self, handle: Handle) -> Option<&List> {
        match self.get(handle)? {
            Object::List(l) => Some(l),
            _ => None,
        }
    }

    pub fn get_list_mut(&mut self, handle: Handle) -> Option<&mut List> {
        match self.get_mut(handle)? {
            Object::List(l) => Some(l),
            _ => None,
        }
    }

    pub fn get_dict(&self, handle: Handle) -> Option<&Dict> {
        match self.get(handle)? {
            Object::Dict(d) => Some(d),
            _ => None,
        }
    }

    pub fn get_dict_mut(&mut self, handle: Handle) -> Option<&mut Dict> {
        match self.get_mut(handle)? {
            Object::Dict(d) => Some(d),
            _ => None,
        }
    }

    pub fn get_enum(&self, handle: Handle) -> Option<&Enum> {
        match self.get(handle)? {
            Object::Enum(e) => Some(e),
            _ => None,
        }
    }

    pub fn get_enum_mut(&mut self, handle: Handle) -> Option<&mut Enum> {
        match self.get_mut(handle)? {
            Object::Enum(e) => Some(e),
            _ => None,
        }
    }

    /// String contents of a value, if it is a string
    pub fn value_str(&self, value: Value) -> Option<&str> {
        value.as_obj().and_then(|h| self.get_string(h))
    }

    /// Number of live objects
    pub fn object_count(&self) -> usize {
        self.slots.len() - self.free_list.len()
    }

    /// Number of strings in the interner
    pub fn interned_count(&self) -> usize {
        self.strings.len()
    }

    pub fn is_marked(&self, handle: Handle) -> bool {
        matches!(self.slots.get(handle.0), Some(Some(slot)) if slot.is_marked)
    }

    pub fn should_collect(&self) -> bool {
        self.bytes_allocated > self.next_gc
    }

    pub fn stats(&self) -> &GcStats {
        &self.stats
    }

    pub fn mark(&mut self, handle: Handle) {
        if let Some(Some(slot)) = self.slots.get_mut(handle.0) {
            if slot.is_marked {
                return;
            }
            slot.is_marked = true;
            self.gray_stack.push(handle);
        }
    }

    pub fn mark_value(&mut self, value: Value) {
        if let Value::Obj(handle) = value {
            self.mark(handle);
        }
    }

    pub fn trace_references(&mut self) {
        while let Some(handle) = self.gray_stack.pop() {
            // Children are collected first: marking needs `&mut self`
            let children = match self.get(handle) {
                Some(obj) => obj.children(),
                None => Vec::new(),
            };

            for child in children {
                self.mark(child);
            }
        }
    }

    /// Free every unmarked object, clear marks on survivors and recompute the
    /// next collection threshold. Returns the number of bytes freed.
    pub fn sweep(&mut self) -> usize {
        let before = self.bytes_allocated;

        // Dead strings leave the interner before their slots are reused
        let slots = &self.slots;
        self.strings.retain(|_, handle| {
            matches!(slots.get(handle.0), Some(Some(slot)) if slot.is_marked)
        });

        let mut freed_bytes = 0;
        for (i, entry) in self.slots.iter_mut().enumerate() {
            match entry {
                Some(slot) if slot.is_marked => slot.is_marked = false,
                Some(slot) => {
                    trace!(handle = i, size = slot.size, obj_type = ?slot.object.obj_type(), "free");
                    freed_bytes += slot.size;
                    *entry = None;
                    self.free_list.push(i);
                }
                None => {}
            }
        }

        self.bytes_allocated -= freed_bytes;

        // Adjust threshold
        self.next_gc = std::cmp::max(self.bytes_allocated * self.grow_factor, self.min_threshold);
        self.stats.record(before, freed_bytes, self.bytes_allocated, self.next_gc);
        freed_bytes
    }
}

impl Default for Heap {
    fn default() -> Self {
        Self::new()
    }
}

impl Index<Handle> for Heap {
    type Output = Object;

    fn index(&self, handle: Handle) -> &Object {
        match self.get(handle) {
            Some(obj) => obj,
            None => panic!("use of freed object {:?}", handle),
        }
    }
}

impl IndexMut<Handle> for Heap {
    fn index_mut(&mut self, handle: Handle) -> &mut Object {
        match self.get_mut(handle) {
            Some(obj) => obj,
            None => panic!("use of freed object {:?}", handle),
        }
    }
}
