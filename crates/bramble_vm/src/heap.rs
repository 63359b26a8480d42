use rustc_hash::FxHashMap;

use crate::object::{fnv1a, GcObject, GcRef, ObjData, UpvalueState};
use crate::value::Value;

pub const GROW_FACTOR: usize = 2;
const INITIAL_NEXT_GC: usize = 1024 * 1024;

/// Owns every runtime heap object. `Heap` only knows how to allocate,
/// intern, mark and sweep — it has no notion of "the VM's roots"; the
/// caller (the interpreter, and at compile time the compiler) is
/// responsible for calling [`Heap::mark_value`]/[`Heap::mark_object`] on
/// everything it considers reachable before calling
/// [`Heap::collect`]'s second half. This split is what lets
/// `heap.rs` stay unit-testable without spinning up a `Vm`.
pub struct Heap {
    head: Option<GcRef>,
    strings: FxHashMap<Box<str>, GcRef>,
    gray: Vec<GcRef>,
    pub bytes_allocated: usize,
    pub next_gc: usize,
}

/// A rough but stable proxy for "how many bytes did this allocation
/// cost" — exact enough that the heap-growth policy (double the live
/// set on every collection) behaves sensibly without tying the
/// threshold check to the real Rust allocator.
fn obj_size(data: &ObjData) -> usize {
    use std::mem::size_of_val;
    let base = size_of_val(&GcObject { marked: std::cell::Cell::new(false), next: std::cell::Cell::new(None), data: ObjData::Native(crate::object::ObjNative { name: "", function: |_| Ok(Value::Nil) }) });
    base + match data {
        ObjData::String { bytes, .. } => bytes.len(),
        ObjData::Function(f) => f.chunk.code.len() + f.chunk.constants.len() * size_of_val(&Value::Nil),
        ObjData::Native(_) => 0,
        ObjData::Closure(c) => c.upvalues.len() * size_of_val(&GcRef::dangling()),
        ObjData::Upvalue(_) => 0,
        ObjData::Class(c) => c.methods.len() * 2 * size_of_val(&GcRef::dangling()),
        ObjData::Instance(i) => i.fields.len() * 2 * size_of_val(&GcRef::dangling()),
        ObjData::BoundMethod(_) => 0,
    }
}

impl Heap {
    pub fn new() -> Self {
        Heap {
            head: None,
            strings: FxHashMap::default(),
            gray: Vec::new(),
            bytes_allocated: 0,
            next_gc: INITIAL_NEXT_GC,
        }
    }

    /// Allocates `data` and threads it onto the all-objects list. Does
    /// not itself decide whether to collect first — see `Vm::alloc`,
    /// which is the actual GC safety point.
    pub fn alloc_raw(&mut self, data: ObjData) -> GcRef {
        self.bytes_allocated += obj_size(&data);
        let obj = Box::new(GcObject {
            marked: std::cell::Cell::new(false),
            next: std::cell::Cell::new(self.head),
            data,
        });
        let r = GcRef::from(Box::leak(obj).into());
        self.head = Some(r);
        r
    }

    /// Interns `s`: returns the existing `GcRef` if an equal-contents
    /// string is already live, otherwise allocates a new one. Equal
    /// bytes always yield the same object.
    pub fn intern_string(&mut self, s: &str) -> GcRef {
        if let Some(&r) = self.strings.get(s) {
            return r;
        }
        let hash = fnv1a(s.as_bytes());
        let r = self.alloc_raw(ObjData::String { bytes: s.into(), hash });
        self.strings.insert(s.into(), r);
        r
    }

    pub fn mark_value(&mut self, v: Value) {
        if let Value::Obj(r) = v {
            self.mark_object(r);
        }
    }

    pub fn mark_object(&mut self, r: GcRef) {
        // SAFETY: every `GcRef` reachable from a root is still live —
        // the caller never hands us a dangling one.
        let already = unsafe { r.as_ref().marked.replace(true) };
        if already {
            return;
        }
        // Strings and natives have no outgoing references, so there's
        // no point graying them.
        let composite = !matches!(unsafe { &r.as_ref().data }, ObjData::String { .. } | ObjData::Native(_));
        if composite {
            self.gray.push(r);
        }
    }

    /// Pops the gray worklist, "blackening" each object by marking
    /// everything it directly references.
    pub fn trace_references(&mut self) {
        while let Some(r) = self.gray.pop() {
            // SAFETY: object came off our own gray stack; still live.
            let data_ptr: *const ObjData = unsafe { &r.as_ref().data };
            // Read fields we need before recursing through self, since
            // marking children calls back into &mut self.
            match unsafe { &*data_ptr } {
                ObjData::Function(f) => {
                    if let Some(name) = f.name {
                        self.mark_object(name);
                    }
                    let constants = f.chunk.constants.clone();
                    for c in constants {
                        self.mark_value(c);
                    }
                }
                ObjData::Closure(c) => {
                    self.mark_object(c.function);
                    let upvalues = c.upvalues.clone();
                    for uv in upvalues {
                        self.mark_object(uv);
                    }
                }
                ObjData::Upvalue(u) => {
                    if let UpvalueState::Closed(v) = u.state.get() {
                        self.mark_value(v);
                    }
                }
                ObjData::Class(c) => {
                    self.mark_object(c.name);
                    let methods: Vec<GcRef> = c.methods.values().copied().collect();
                    for m in methods {
                        self.mark_object(m);
                    }
                }
                ObjData::Instance(i) => {
                    self.mark_object(i.class);
                    let fields: Vec<Value> = i.fields.values().copied().collect();
                    for v in fields {
                        self.mark_value(v);
                    }
                }
                ObjData::BoundMethod(b) => {
                    self.mark_value(b.receiver);
                    self.mark_object(b.method);
                }
                ObjData::String { .. } | ObjData::Native(_) => {}
            }
        }
    }

    /// Removes any intern-table entry whose string is unmarked, so that
    /// the general sweep below is free to reclaim it.
    pub fn sweep_weak_interns(&mut self) {
        self.strings.retain(|_, r| unsafe { r.as_ref().marked.get() });
    }

    /// Frees every unmarked object, clears the `marked` bit on every
    /// survivor.
    pub fn sweep(&mut self) {
        let mut prev: Option<GcRef> = None;
        let mut cur = self.head;
        while let Some(r) = cur {
            // SAFETY: walking our own intrusive list.
            let marked = unsafe { r.as_ref().marked.get() };
            let next = unsafe { r.as_ref().next.get() };
            if marked {
                unsafe { r.as_ref().marked.set(false) };
                prev = Some(r);
                cur = next;
            } else {
                match prev {
                    Some(p) => unsafe { p.as_ref().next.set(next) },
                    None => self.head = next,
                }
                cur = next;
                // SAFETY: `r` is unreachable from every root (it failed
                // to get marked during this collection) and was
                // allocated by `alloc_raw` via `Box::new` +
                // `Box::leak`, so reconstituting and dropping the `Box`
                // here is the matching deallocation.
                let size = obj_size(unsafe { &r.as_ref().data });
                self.bytes_allocated = self.bytes_allocated.saturating_sub(size);
                unsafe { drop(Box::from_raw(r.as_ptr())) };
            }
        }
    }

    pub fn grow_threshold(&mut self) {
        self.next_gc = self.bytes_allocated * GROW_FACTOR;
    }

    #[cfg(test)]
    pub fn live_count(&self) -> usize {
        let mut n = 0;
        let mut cur = self.head;
        while let Some(r) = cur {
            n += 1;
            cur = unsafe { r.as_ref().next.get() };
        }
        n
    }
}

impl Drop for Heap {
    fn drop(&mut self) {
        // Walks the all-objects list, freeing each object in turn.
        let mut cur = self.head;
        while let Some(r) = cur {
            let next = unsafe { r.as_ref().next.get() };
            unsafe { drop(Box::from_raw(r.as_ptr())) };
            cur = next;
        }
        self.head = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interning_returns_same_object_for_equal_contents() {
        let mut heap = Heap::new();
        let a = heap.intern_string("hello");
        let b = heap.intern_string("hello");
        assert!(crate::object::obj_eq(a, b));
    }

    #[test]
    fn interning_distinguishes_different_contents() {
        let mut heap = Heap::new();
        let a = heap.intern_string("hello");
        let b = heap.intern_string("world");
        assert!(!crate::object::obj_eq(a, b));
    }

    #[test]
    fn unreachable_object_is_freed_by_sweep() {
        let mut heap = Heap::new();
        let _keep = heap.intern_string("kept");
        heap.intern_string("garbage");
        assert_eq!(heap.live_count(), 2);

        // Mark only "kept" as a root, then collect.
        heap.mark_object(_keep);
        heap.trace_references();
        heap.sweep_weak_interns();
        heap.sweep();

        assert_eq!(heap.live_count(), 1);
        assert!(heap.strings.contains_key("kept"));
        assert!(!heap.strings.contains_key("garbage"));
    }

    #[test]
    fn next_gc_is_monotone_as_live_set_grows() {
        let mut heap = Heap::new();
        let mut thresholds = Vec::new();
        for i in 0..5 {
            let r = heap.intern_string(&format!("s{i}"));
            heap.mark_object(r);
        }
        heap.trace_references();
        heap.grow_threshold();
        thresholds.push(heap.next_gc);
        for i in 5..10 {
            let r = heap.intern_string(&format!("s{i}"));
            heap.mark_object(r);
        }
        heap.trace_references();
        heap.grow_threshold();
        thresholds.push(heap.next_gc);
        assert!(thresholds[1] >= thresholds[0]);
    }
}
