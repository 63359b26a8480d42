use std::cell::Cell;
use std::hash::{Hash, Hasher};
use std::ptr::NonNull;

use indexmap::IndexMap;
use rustc_hash::FxHashMap;

use crate::chunk::Chunk;
use crate::value::Value;

/// Handle to a heap object. Two `GcRef`s are the same object iff the
/// pointers are equal — this is also how string interning's "equal
/// contents ⇒ equal identity" guarantee is observed from the rest of the
/// VM (compare `GcRef`s, never string contents, once a string is
/// interned).
pub type GcRef = NonNull<GcObject>;

pub fn obj_eq(a: GcRef, b: GcRef) -> bool {
    std::ptr::eq(a.as_ptr(), b.as_ptr())
}

/// Wraps a `GcRef` so it can key a `HashMap`/be put in a `HashSet` by
/// pointer identity — used for the string intern table and class method
/// tables, both of which are keyed on interned strings.
#[derive(Clone, Copy)]
pub struct GcKey(pub GcRef);

impl PartialEq for GcKey {
    fn eq(&self, other: &Self) -> bool {
        obj_eq(self.0, other.0)
    }
}
impl Eq for GcKey {}
impl Hash for GcKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        (self.0.as_ptr() as usize).hash(state);
    }
}

/// An upvalue is open while it still aliases a live stack slot and
/// closed once that slot would otherwise become invalid (scope exit,
/// return). Transitions only ever run open -> closed.
#[derive(Clone, Copy)]
pub enum UpvalueState {
    Open(usize),
    Closed(Value),
}

pub struct ObjUpvalue {
    pub state: Cell<UpvalueState>,
}

#[derive(Clone, Copy, PartialEq)]
pub enum FunctionKind {
    Function,
    Method,
    Initializer,
    Script,
}

pub struct ObjFunction {
    pub arity: u8,
    pub upvalue_count: u8,
    pub name: Option<GcRef>, // ObjString, None for the synthesized top-level script
    pub chunk: Chunk,
}

pub type NativeFn = fn(&[Value]) -> Result<Value, String>;

pub struct ObjNative {
    pub name: &'static str,
    pub function: NativeFn,
}

pub struct ObjClosure {
    pub function: GcRef, // ObjFunction
    pub upvalues: Vec<GcRef>, // ObjUpvalue
}

pub struct ObjClass {
    pub name: GcRef, // ObjString
    // IndexMap, not FxHashMap: INHERIT copies the superclass's table in
    // before METHOD overlays overrides, and keeping insertion order makes
    // that copy-then-overlay deterministic (and disassembly-friendly).
    pub methods: IndexMap<GcKey, GcRef>, // name -> ObjClosure
}

pub struct ObjInstance {
    pub class: GcRef, // ObjClass
    pub fields: FxHashMap<GcKey, Value>,
}

pub struct ObjBoundMethod {
    pub receiver: Value,
    pub method: GcRef, // ObjClosure
}

pub enum ObjData {
    String { bytes: Box<str>, hash: u32 },
    Function(ObjFunction),
    Native(ObjNative),
    Closure(ObjClosure),
    Upvalue(ObjUpvalue),
    Class(ObjClass),
    Instance(ObjInstance),
    BoundMethod(ObjBoundMethod),
}

impl ObjData {
    pub fn kind_name(&self) -> &'static str {
        match self {
            ObjData::String { .. } => "string",
            ObjData::Function(_) => "function",
            ObjData::Native(_) => "native function",
            ObjData::Closure(_) => "closure",
            ObjData::Upvalue(_) => "upvalue",
            ObjData::Class(_) => "class",
            ObjData::Instance(_) => "instance",
            ObjData::BoundMethod(_) => "bound method",
        }
    }
}

/// Every heap object's shared header plus payload: `kind` is implicit in
/// the `ObjData` variant rather than a separate tag field, since Rust's
/// enum already carries that discriminant. `next` threads every live
/// object into the VM's single intrusive all-objects list.
pub struct GcObject {
    pub marked: Cell<bool>,
    pub next: Cell<Option<GcRef>>,
    pub data: ObjData,
}

/// FNV-1a, 32-bit — the same hash clox uses for string interning.
pub fn fnv1a(bytes: &[u8]) -> u32 {
    let mut hash: u32 = 2166136261;
    for &b in bytes {
        hash ^= b as u32;
        hash = hash.wrapping_mul(16777619);
    }
    hash
}

/// # Safety
/// Callers must only invoke this on a `GcRef` whose `ObjData` variant is
/// actually `String`, and the returned reference must not outlive a
/// point where the object could be swept (i.e. it must stay rooted).
/// Every call site in this crate satisfies that from context: either the
/// ref was just produced by `Heap::intern_string`, or it was read off a
/// `Value::Obj` that is still on the stack or in a root table.
pub unsafe fn as_str<'a>(r: GcRef) -> &'a str {
    match &r.as_ref().data {
        ObjData::String { bytes, .. } => &*(&**bytes as *const str),
        other => panic!("as_str called on a {}", other.kind_name()),
    }
}

/// # Safety
/// Same contract as [`as_str`].
pub unsafe fn string_hash(r: GcRef) -> u32 {
    match &r.as_ref().data {
        ObjData::String { hash, .. } => *hash,
        other => panic!("string_hash called on a {}", other.kind_name()),
    }
}
