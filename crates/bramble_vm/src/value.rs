use std::fmt;

use crate::object::{as_str, obj_eq, GcRef, ObjData};

/// A Lox runtime value. Numbers, booleans and `nil` are inline; every
/// other case is a `GcRef` into heap memory the `Heap` owns. `Value` is
/// `Copy` — pushing/popping the VM's value stack is always a pointer- or
/// word-sized copy, never a clone of heap data. Equality for non-number,
/// non-string objects is reference identity, which a `Copy` handle makes
/// free to check.
#[derive(Clone, Copy)]
pub enum Value {
    Nil,
    Bool(bool),
    Number(f64),
    Obj(GcRef),
}

impl Value {
    pub fn is_truthy(&self) -> bool {
        !matches!(self, Value::Nil | Value::Bool(false))
    }

    pub fn is_falsey(&self) -> bool {
        !self.is_truthy()
    }

    pub fn as_obj(&self) -> Option<GcRef> {
        match self {
            Value::Obj(r) => Some(*r),
            _ => None,
        }
    }

    /// # Safety
    /// Only call while `self` (or the underlying object) is still
    /// rooted — i.e. not after a GC pass could have swept it.
    pub unsafe fn obj_data(&self) -> Option<&ObjData> {
        self.as_obj().map(|r| &r.as_ref().data)
    }

    pub fn is_string(&self) -> bool {
        matches!(unsafe { self.obj_data() }, Some(ObjData::String { .. }))
    }

    pub fn as_str(&self) -> Option<&str> {
        self.as_obj().and_then(|r| unsafe {
            match &r.as_ref().data {
                ObjData::String { .. } => Some(as_str(r)),
                _ => None,
            }
        })
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Nil => "nil",
            Value::Bool(_) => "boolean",
            Value::Number(_) => "number",
            Value::Obj(r) => unsafe { r.as_ref().data.kind_name() },
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Nil, Value::Nil) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Number(a), Value::Number(b)) => a == b,
            (Value::Obj(a), Value::Obj(b)) => obj_eq(*a, *b),
            _ => false,
        }
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self}")
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Nil => write!(f, "nil"),
            Value::Bool(b) => write!(f, "{}", if *b { "true" } else { "false" }),
            Value::Number(n) => write!(f, "{}", format_number(*n)),
            Value::Obj(r) => fmt_obj(*r, f),
        }
    }
}

/// Shortest round-trip decimal form, with the integral-valued special
/// case Lox prints without a trailing `.0`.
pub fn format_number(n: f64) -> String {
    if n.is_nan() {
        return "NaN".to_string();
    }
    if n.is_infinite() {
        return if n > 0.0 { "Infinity".to_string() } else { "-Infinity".to_string() };
    }
    let mut s = format!("{n}");
    if !s.contains('.') && !s.contains('e') {
        s.push_str(".0");
        // match clox's printf("%g") which drops the trailing .0 on exact
        // integers up to the precision limit; Lox test suites expect
        // "3" not "3.0" for whole-number literals, so trim it back off.
        if s.ends_with(".0") {
            s.truncate(s.len() - 2);
        }
    }
    s
}

fn fmt_obj(r: GcRef, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    // SAFETY: `Display` is only ever invoked (by `print`/debug paths) on
    // a `Value` that is still live on the interpreter's stack, hence
    // still rooted.
    let data = unsafe { &r.as_ref().data };
    match data {
        ObjData::String { bytes, .. } => write!(f, "{bytes}"),
        ObjData::Function(func) => match func.name {
            Some(name) => write!(f, "<fn {}>", unsafe { as_str(name) }),
            None => write!(f, "<script>"),
        },
        ObjData::Native(_) => write!(f, "<native fn>"),
        ObjData::Closure(c) => {
            // SAFETY: a Closure's `function` field always points at a
            // live ObjFunction for the closure's own lifetime.
            let func = unsafe { &c.function.as_ref().data };
            if let ObjData::Function(func) = func {
                match func.name {
                    Some(name) => write!(f, "<fn {}>", unsafe { as_str(name) }),
                    None => write!(f, "<script>"),
                }
            } else {
                unreachable!("closure.function is always an ObjFunction")
            }
        }
        ObjData::Upvalue(_) => write!(f, "<upvalue>"),
        ObjData::Class(c) => write!(f, "class {}", unsafe { as_str(c.name) }),
        ObjData::Instance(i) => {
            let class = unsafe { &i.class.as_ref().data };
            if let ObjData::Class(c) = class {
                write!(f, "{} instance", unsafe { as_str(c.name) })
            } else {
                unreachable!("instance.class is always an ObjClass")
            }
        }
        ObjData::BoundMethod(b) => {
            let closure = unsafe { &b.method.as_ref().data };
            if let ObjData::Closure(c) = closure {
                let func = unsafe { &c.function.as_ref().data };
                if let ObjData::Function(func) = func {
                    match func.name {
                        Some(name) => write!(f, "<fn {}>", unsafe { as_str(name) }),
                        None => write!(f, "<script>"),
                    }
                } else {
                    unreachable!()
                }
            } else {
                unreachable!("bound_method.method is always an ObjClosure")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truthiness_matches_nil_and_false_only() {
        assert!(Value::Nil.is_falsey());
        assert!(Value::Bool(false).is_falsey());
        assert!(Value::Bool(true).is_truthy());
        assert!(Value::Number(0.0).is_truthy());
    }

    #[test]
    fn number_formatting_drops_trailing_zero() {
        assert_eq!(format_number(7.0), "7");
        assert_eq!(format_number(3.5), "3.5");
        assert_eq!(format_number(-1.0), "-1");
    }
}
