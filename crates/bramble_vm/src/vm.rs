use std::cell::Cell;
use std::io::{self, Write};

use indexmap::IndexMap;
use rustc_hash::FxHashMap;

use crate::chunk::{Chunk, OpCode};
use crate::compiler::compile;
use crate::error::{InterpretError, RuntimeError, TraceFrame};
use crate::heap::Heap;
use crate::native;
use crate::object::{
    as_str, GcKey, GcRef, NativeFn, ObjBoundMethod, ObjClass, ObjClosure, ObjData, ObjInstance,
    ObjNative, ObjUpvalue, UpvalueState,
};
use crate::value::Value;

#[cfg(feature = "trace_execution")]
use crate::disassemble;

/// Hard cap on nested call frames. A program that recurses past
/// this raises "Stack overflow." rather than exhausting the host stack.
pub const FRAME_MAX: usize = 64;
/// Backstop on the value stack's growth, independent of `FRAME_MAX`.
pub const STACK_MAX: usize = 2048;

struct CallFrame {
    closure: GcRef, // ObjClosure
    ip: usize,
    base: usize, // stack index of this frame's slot 0
}

/// The stack-based interpreter. Owns the heap, the value stack,
/// the call-frame array, the globals table and the open-upvalue list —
/// everything the garbage collector needs root access to.
pub struct Vm {
    heap: Heap,
    stack: Vec<Value>,
    frames: Vec<CallFrame>,
    globals: FxHashMap<GcKey, Value>,
    open_upvalues: Vec<GcRef>, // ObjUpvalue, sorted by decreasing stack index
    init_string: GcRef,
    out: Box<dyn Write>,
}

impl Vm {
    pub fn new() -> Self {
        Self::with_writer(Box::new(io::stdout()))
    }

    /// Builds a `Vm` that writes `print` output to `out` instead of
    /// stdout — the seam tests use to capture program output.
    pub fn with_writer(out: Box<dyn Write>) -> Self {
        let mut heap = Heap::new();
        let init_string = heap.intern_string("init");
        let mut vm = Vm {
            heap,
            stack: Vec::new(),
            frames: Vec::new(),
            globals: FxHashMap::default(),
            open_upvalues: Vec::new(),
            init_string,
            out,
        };
        vm.define_native("clock", native::clock);
        vm
    }

    pub fn interpret(&mut self, source: &str) -> Result<(), InterpretError> {
        let function_ref = compile(source, &mut self.heap).map_err(InterpretError::Compile)?;
        #[cfg(feature = "trace_execution")]
        if let Some(ObjData::Function(f)) = unsafe { Value::Obj(function_ref).obj_data() } {
            disassemble::disassemble_chunk(&f.chunk, "script");
        }
        // function_ref has no root yet: push it before the alloc below can
        // trip the GC threshold and sweep it out from under the closure.
        self.push(Value::Obj(function_ref));
        let closure = self.alloc(ObjData::Closure(ObjClosure { function: function_ref, upvalues: Vec::new() }));
        self.pop();
        self.push(Value::Obj(closure));
        self.call_closure(closure, 0).map_err(InterpretError::Runtime)?;
        self.run().map_err(InterpretError::Runtime)
    }

    fn define_native(&mut self, name: &'static str, function: NativeFn) {
        let native_ref = self.alloc(ObjData::Native(ObjNative { name, function }));
        let name_ref = self.intern(name);
        self.globals.insert(GcKey(name_ref), Value::Obj(native_ref));
    }

    // ---- GC-integrated allocation --------------------------------------

    fn mark_roots(&mut self) {
        for &v in &self.stack {
            self.heap.mark_value(v);
        }
        for frame in &self.frames {
            self.heap.mark_object(frame.closure);
        }
        for &uv in &self.open_upvalues {
            self.heap.mark_object(uv);
        }
        let globals: Vec<(GcKey, Value)> = self.globals.iter().map(|(k, v)| (*k, *v)).collect();
        for (k, v) in globals {
            self.heap.mark_object(k.0);
            self.heap.mark_value(v);
        }
        self.heap.mark_object(self.init_string);
    }

    fn collect_garbage(&mut self) {
        self.mark_roots();
        self.heap.trace_references();
        self.heap.sweep_weak_interns();
        self.heap.sweep();
        self.heap.grow_threshold();
    }

    fn alloc(&mut self, data: ObjData) -> GcRef {
        if self.heap.bytes_allocated > self.heap.next_gc {
            self.collect_garbage();
        }
        self.heap.alloc_raw(data)
    }

    fn intern(&mut self, s: &str) -> GcRef {
        if self.heap.bytes_allocated > self.heap.next_gc {
            self.collect_garbage();
        }
        self.heap.intern_string(s)
    }

    // ---- stack helpers --------------------------------------------------

    fn push(&mut self, v: Value) {
        self.stack.push(v);
    }

    fn pop(&mut self) -> Value {
        self.stack.pop().expect("value stack underflow")
    }

    fn peek(&self, distance: usize) -> Value {
        self.stack[self.stack.len() - 1 - distance]
    }

    // ---- bytecode reading -------------------------------------------------

    fn current_chunk_ptr(&self) -> *const Chunk {
        let frame = self.frames.last().unwrap();
        unsafe {
            match &frame.closure.as_ref().data {
                ObjData::Closure(c) => match &c.function.as_ref().data {
                    ObjData::Function(f) => &f.chunk as *const Chunk,
                    _ => unreachable!("closure.function is always a Function"),
                },
                _ => unreachable!("frame.closure is always a Closure"),
            }
        }
    }

    fn read_byte(&mut self) -> u8 {
        let chunk_ptr = self.current_chunk_ptr();
        let frame = self.frames.last_mut().unwrap();
        let byte = unsafe { (*chunk_ptr).code[frame.ip] };
        frame.ip += 1;
        byte
    }

    fn read_u16(&mut self) -> u16 {
        let hi = self.read_byte();
        let lo = self.read_byte();
        u16::from_be_bytes([hi, lo])
    }

    fn read_constant(&mut self) -> Value {
        let idx = self.read_byte();
        let chunk_ptr = self.current_chunk_ptr();
        unsafe { (*chunk_ptr).constants[idx as usize] }
    }

    fn read_string(&mut self) -> GcRef {
        self.read_constant().as_obj().expect("string constant operand must be an object")
    }

    fn current_line(&self) -> u32 {
        let chunk_ptr = self.current_chunk_ptr();
        let ip = self.frames.last().unwrap().ip;
        unsafe { (*chunk_ptr).line_at(ip.saturating_sub(1)) }
    }

    // ---- upvalues -----------------------------------------------------

    fn current_upvalue(&self, idx: u8) -> GcRef {
        let frame = self.frames.last().unwrap();
        unsafe {
            match &frame.closure.as_ref().data {
                ObjData::Closure(c) => c.upvalues[idx as usize],
                _ => unreachable!(),
            }
        }
    }

    fn upvalue_value(&self, uv: GcRef) -> Value {
        let state = unsafe {
            match &uv.as_ref().data {
                ObjData::Upvalue(u) => u.state.get(),
                _ => unreachable!(),
            }
        };
        match state {
            UpvalueState::Open(idx) => self.stack[idx],
            UpvalueState::Closed(v) => v,
        }
    }

    fn set_upvalue_value(&mut self, uv: GcRef, v: Value) {
        let state = unsafe {
            match &uv.as_ref().data {
                ObjData::Upvalue(u) => u.state.get(),
                _ => unreachable!(),
            }
        };
        match state {
            UpvalueState::Open(idx) => self.stack[idx] = v,
            UpvalueState::Closed(_) => unsafe {
                match &uv.as_ref().data {
                    ObjData::Upvalue(u) => u.state.set(UpvalueState::Closed(v)),
                    _ => unreachable!(),
                }
            },
        }
    }

    /// Finds (or creates) the open upvalue aliasing `stack_index`,
    /// inserting new ones so `open_upvalues` stays sorted by decreasing
    /// stack address. Kept as the VM's own side table rather than
    /// threaded through the `Upvalue` objects themselves.
    fn capture_upvalue(&mut self, stack_index: usize) -> GcRef {
        for &uv in &self.open_upvalues {
            let existing = unsafe {
                match &uv.as_ref().data {
                    ObjData::Upvalue(u) => match u.state.get() {
                        UpvalueState::Open(i) => Some(i),
                        UpvalueState::Closed(_) => None,
                    },
                    _ => None,
                }
            };
            if existing == Some(stack_index) {
                return uv;
            }
        }
        let created = self.alloc(ObjData::Upvalue(ObjUpvalue { state: Cell::new(UpvalueState::Open(stack_index)) }));
        let pos = self
            .open_upvalues
            .iter()
            .position(|&uv| {
                let i = unsafe {
                    match &uv.as_ref().data {
                        ObjData::Upvalue(u) => match u.state.get() {
                            UpvalueState::Open(i) => i,
                            UpvalueState::Closed(_) => usize::MAX,
                        },
                        _ => usize::MAX,
                    }
                };
                i < stack_index
            })
            .unwrap_or(self.open_upvalues.len());
        self.open_upvalues.insert(pos, created);
        created
    }

    fn close_upvalues(&mut self, from_index: usize) {
        while let Some(&uv) = self.open_upvalues.first() {
            let stack_idx = unsafe {
                match &uv.as_ref().data {
                    ObjData::Upvalue(u) => match u.state.get() {
                        UpvalueState::Open(i) => i,
                        UpvalueState::Closed(_) => unreachable!("open_upvalues only holds open upvalues"),
                    },
                    _ => unreachable!(),
                }
            };
            if stack_idx < from_index {
                break;
            }
            let v = self.stack[stack_idx];
            unsafe {
                match &uv.as_ref().data {
                    ObjData::Upvalue(u) => u.state.set(UpvalueState::Closed(v)),
                    _ => unreachable!(),
                }
            }
            self.open_upvalues.remove(0);
        }
    }

    // ---- calls ----------------------------------------------------------

    fn call_closure(&mut self, closure_ref: GcRef, argc: u8) -> Result<(), RuntimeError> {
        let arity = unsafe {
            match &closure_ref.as_ref().data {
                ObjData::Closure(c) => match &c.function.as_ref().data {
                    ObjData::Function(f) => f.arity,
                    _ => unreachable!(),
                },
                _ => unreachable!(),
            }
        };
        if argc != arity {
            return Err(self.runtime_error(format!("Expected {arity} arguments but got {argc}.")));
        }
        if self.frames.len() >= FRAME_MAX {
            return Err(self.runtime_error("Stack overflow.".to_string()));
        }
        if self.stack.len() >= STACK_MAX {
            return Err(self.runtime_error("Stack overflow.".to_string()));
        }
        let base = self.stack.len() - argc as usize - 1;
        self.frames.push(CallFrame { closure: closure_ref, ip: 0, base });
        Ok(())
    }

    fn call_value(&mut self, callee: Value, argc: u8) -> Result<(), RuntimeError> {
        let r = match callee.as_obj() {
            Some(r) => r,
            None => return Err(self.runtime_error("Can only call functions and classes.".to_string())),
        };
        enum Kind {
            Closure,
            Native(NativeFn),
            Class,
            BoundMethod(Value, GcRef),
            Other,
        }
        let kind = unsafe {
            match &r.as_ref().data {
                ObjData::Closure(_) => Kind::Closure,
                ObjData::Native(n) => Kind::Native(n.function),
                ObjData::Class(_) => Kind::Class,
                ObjData::BoundMethod(b) => Kind::BoundMethod(b.receiver, b.method),
                _ => Kind::Other,
            }
        };
        match kind {
            Kind::Closure => self.call_closure(r, argc),
            Kind::Native(f) => {
                let start = self.stack.len() - argc as usize;
                let args: Vec<Value> = self.stack[start..].to_vec();
                match f(&args) {
                    Ok(v) => {
                        self.stack.truncate(start - 1);
                        self.push(v);
                        Ok(())
                    }
                    Err(msg) => Err(self.runtime_error(msg)),
                }
            }
            Kind::Class => {
                let instance = self.alloc(ObjData::Instance(ObjInstance { class: r, fields: FxHashMap::default() }));
                let base = self.stack.len() - argc as usize - 1;
                self.stack[base] = Value::Obj(instance);
                let initializer = unsafe {
                    match &r.as_ref().data {
                        ObjData::Class(c) => c.methods.get(&GcKey(self.init_string)).copied(),
                        _ => unreachable!(),
                    }
                };
                match initializer {
                    Some(init) => self.call_closure(init, argc),
                    None => {
                        if argc != 0 {
                            return Err(self.runtime_error(format!("Expected 0 arguments but got {argc}.")));
                        }
                        Ok(())
                    }
                }
            }
            Kind::BoundMethod(receiver, method) => {
                let base = self.stack.len() - argc as usize - 1;
                self.stack[base] = receiver;
                self.call_closure(method, argc)
            }
            Kind::Other => Err(self.runtime_error("Can only call functions and classes.".to_string())),
        }
    }

    fn bind_method(&mut self, receiver: Value, class_ref: GcRef, name: GcRef) -> Result<Value, RuntimeError> {
        let method = unsafe {
            match &class_ref.as_ref().data {
                ObjData::Class(c) => c.methods.get(&GcKey(name)).copied(),
                _ => unreachable!(),
            }
        };
        let method = match method {
            Some(m) => m,
            None => return Err(self.runtime_error(format!("Undefined property '{}'.", unsafe { as_str(name) }))),
        };
        let bound = self.alloc(ObjData::BoundMethod(ObjBoundMethod { receiver, method }));
        Ok(Value::Obj(bound))
    }

    fn invoke(&mut self, name: GcRef, argc: u8) -> Result<(), RuntimeError> {
        let receiver = self.peek(argc as usize);
        let inst_ref = match receiver.as_obj() {
            Some(r) if matches!(unsafe { &r.as_ref().data }, ObjData::Instance(_)) => r,
            _ => return Err(self.runtime_error("Only instances have methods.".to_string())),
        };
        let field = unsafe {
            match &inst_ref.as_ref().data {
                ObjData::Instance(i) => i.fields.get(&GcKey(name)).copied(),
                _ => unreachable!(),
            }
        };
        if let Some(v) = field {
            let base = self.stack.len() - argc as usize - 1;
            self.stack[base] = v;
            return self.call_value(v, argc);
        }
        let class_ref = unsafe {
            match &inst_ref.as_ref().data {
                ObjData::Instance(i) => i.class,
                _ => unreachable!(),
            }
        };
        self.invoke_from_class(class_ref, name, argc)
    }

    fn invoke_from_class(&mut self, class_ref: GcRef, name: GcRef, argc: u8) -> Result<(), RuntimeError> {
        let method = unsafe {
            match &class_ref.as_ref().data {
                ObjData::Class(c) => c.methods.get(&GcKey(name)).copied(),
                _ => unreachable!(),
            }
        };
        match method {
            Some(m) => self.call_closure(m, argc),
            None => Err(self.runtime_error(format!("Undefined property '{}'.", unsafe { as_str(name) }))),
        }
    }

    // ---- errors ---------------------------------------------------------

    fn runtime_error(&mut self, message: String) -> RuntimeError {
        let mut trace = Vec::new();
        for frame in self.frames.iter().rev() {
            let (chunk_ptr, name) = unsafe {
                match &frame.closure.as_ref().data {
                    ObjData::Closure(c) => match &c.function.as_ref().data {
                        ObjData::Function(f) => {
                            let name = match f.name {
                                Some(n) => as_str(n).to_string(),
                                None => "<script>".to_string(),
                            };
                            (&f.chunk as *const Chunk, name)
                        }
                        _ => unreachable!(),
                    },
                    _ => unreachable!(),
                }
            };
            let line = unsafe { (*chunk_ptr).line_at(frame.ip.saturating_sub(1)) };
            trace.push(TraceFrame { name, line });
        }
        self.stack.clear();
        self.frames.clear();
        self.open_upvalues.clear();
        RuntimeError { message, trace }
    }

    // ---- dispatch loop --------------------------------------------------

    fn run(&mut self) -> Result<(), RuntimeError> {
        loop {
            #[cfg(feature = "trace_execution")]
            {
                let chunk_ptr = self.current_chunk_ptr();
                let ip = self.frames.last().unwrap().ip;
                unsafe { disassemble::disassemble_instruction(&*chunk_ptr, ip) };
            }

            let byte = self.read_byte();
            let op = match OpCode::from_u8(byte) {
                Some(op) => op,
                None => return Err(self.runtime_error(format!("Unknown opcode {byte}."))),
            };

            match op {
                OpCode::Constant => {
                    let v = self.read_constant();
                    self.push(v);
                }
                OpCode::Nil => self.push(Value::Nil),
                OpCode::True => self.push(Value::Bool(true)),
                OpCode::False => self.push(Value::Bool(false)),
                OpCode::Pop => {
                    self.pop();
                }
                OpCode::GetLocal => {
                    let slot = self.read_byte();
                    let base = self.frames.last().unwrap().base;
                    self.push(self.stack[base + slot as usize]);
                }
                OpCode::SetLocal => {
                    let slot = self.read_byte();
                    let base = self.frames.last().unwrap().base;
                    let v = self.peek(0);
                    self.stack[base + slot as usize] = v;
                }
                OpCode::GetGlobal => {
                    let name = self.read_string();
                    match self.globals.get(&GcKey(name)) {
                        Some(&v) => self.push(v),
                        None => return Err(self.runtime_error(format!("Undefined variable '{}'.", unsafe { as_str(name) }))),
                    }
                }
                OpCode::DefineGlobal => {
                    let name = self.read_string();
                    let v = self.pop();
                    self.globals.insert(GcKey(name), v);
                }
                OpCode::SetGlobal => {
                    let name = self.read_string();
                    let v = self.peek(0);
                    if !self.globals.contains_key(&GcKey(name)) {
                        return Err(self.runtime_error(format!("Undefined variable '{}'.", unsafe { as_str(name) })));
                    }
                    self.globals.insert(GcKey(name), v);
                }
                OpCode::GetUpvalue => {
                    let idx = self.read_byte();
                    let uv = self.current_upvalue(idx);
                    self.push(self.upvalue_value(uv));
                }
                OpCode::SetUpvalue => {
                    let idx = self.read_byte();
                    let uv = self.current_upvalue(idx);
                    let v = self.peek(0);
                    self.set_upvalue_value(uv, v);
                }
                OpCode::GetProperty => {
                    let name = self.read_string();
                    let receiver = self.pop();
                    let inst_ref = match receiver.as_obj() {
                        Some(r) if matches!(unsafe { &r.as_ref().data }, ObjData::Instance(_)) => r,
                        _ => return Err(self.runtime_error("Only instances have properties.".to_string())),
                    };
                    let field = unsafe {
                        match &inst_ref.as_ref().data {
                            ObjData::Instance(i) => i.fields.get(&GcKey(name)).copied(),
                            _ => unreachable!(),
                        }
                    };
                    match field {
                        Some(v) => self.push(v),
                        None => {
                            let class_ref = unsafe {
                                match &inst_ref.as_ref().data {
                                    ObjData::Instance(i) => i.class,
                                    _ => unreachable!(),
                                }
                            };
                            let bound = self.bind_method(receiver, class_ref, name)?;
                            self.push(bound);
                        }
                    }
                }
                OpCode::SetProperty => {
                    let name = self.read_string();
                    let value = self.pop();
                    let receiver = self.pop();
                    let inst_ref = match receiver.as_obj() {
                        Some(r) if matches!(unsafe { &r.as_ref().data }, ObjData::Instance(_)) => r,
                        _ => return Err(self.runtime_error("Only instances have fields.".to_string())),
                    };
                    unsafe {
                        let obj = &mut *inst_ref.as_ptr();
                        if let ObjData::Instance(i) = &mut obj.data {
                            i.fields.insert(GcKey(name), value);
                        }
                    }
                    self.push(value);
                }
                OpCode::GetSuper => {
                    let name = self.read_string();
                    let superclass = self.pop();
                    let class_ref = superclass.as_obj().expect("GET_SUPER operand must be a class");
                    let receiver = self.pop();
                    let bound = self.bind_method(receiver, class_ref, name)?;
                    self.push(bound);
                }
                OpCode::Equal => {
                    let b = self.pop();
                    let a = self.pop();
                    self.push(Value::Bool(a == b));
                }
                OpCode::Greater => self.binary_compare(|a, b| a > b)?,
                OpCode::Less => self.binary_compare(|a, b| a < b)?,
                OpCode::Add => self.add()?,
                OpCode::Subtract => self.binary_number_op(|a, b| a - b)?,
                OpCode::Multiply => self.binary_number_op(|a, b| a * b)?,
                OpCode::Divide => self.binary_number_op(|a, b| a / b)?,
                OpCode::Not => {
                    let v = self.pop();
                    self.push(Value::Bool(v.is_falsey()));
                }
                OpCode::Negate => match self.peek(0) {
                    Value::Number(n) => {
                        self.pop();
                        self.push(Value::Number(-n));
                    }
                    _ => return Err(self.runtime_error("Operand must be a number.".to_string())),
                },
                OpCode::Print => {
                    let v = self.pop();
                    let _ = writeln!(self.out, "{v}");
                }
                OpCode::Jump => {
                    let offset = self.read_u16();
                    self.frames.last_mut().unwrap().ip += offset as usize;
                }
                OpCode::JumpIfFalse => {
                    let offset = self.read_u16();
                    if self.peek(0).is_falsey() {
                        self.frames.last_mut().unwrap().ip += offset as usize;
                    }
                }
                OpCode::Loop => {
                    let offset = self.read_u16();
                    self.frames.last_mut().unwrap().ip -= offset as usize;
                }
                OpCode::Call => {
                    let argc = self.read_byte();
                    let callee = self.peek(argc as usize);
                    self.call_value(callee, argc)?;
                }
                OpCode::Invoke => {
                    let name = self.read_string();
                    let argc = self.read_byte();
                    self.invoke(name, argc)?;
                }
                OpCode::SuperInvoke => {
                    let name = self.read_string();
                    let argc = self.read_byte();
                    let superclass = self.pop();
                    let class_ref = superclass.as_obj().expect("SUPER_INVOKE operand must be a class");
                    self.invoke_from_class(class_ref, name, argc)?;
                }
                OpCode::Closure => {
                    let func_val = self.read_constant();
                    let func_ref = func_val.as_obj().expect("CLOSURE operand must be a function");
                    let upvalue_count = unsafe {
                        match &func_ref.as_ref().data {
                            ObjData::Function(f) => f.upvalue_count,
                            _ => unreachable!(),
                        }
                    };
                    let mut upvalues = Vec::with_capacity(upvalue_count as usize);
                    for _ in 0..upvalue_count {
                        let is_local = self.read_byte() != 0;
                        let index = self.read_byte();
                        if is_local {
                            let base = self.frames.last().unwrap().base;
                            upvalues.push(self.capture_upvalue(base + index as usize));
                        } else {
                            upvalues.push(self.current_upvalue(index));
                        }
                    }
                    let closure = self.alloc(ObjData::Closure(ObjClosure { function: func_ref, upvalues }));
                    self.push(Value::Obj(closure));
                }
                OpCode::CloseUpvalue => {
                    let top = self.stack.len() - 1;
                    self.close_upvalues(top);
                    self.pop();
                }
                OpCode::Return => {
                    let result = self.pop();
                    let frame = self.frames.pop().unwrap();
                    self.close_upvalues(frame.base);
                    if self.frames.is_empty() {
                        self.pop();
                        return Ok(());
                    }
                    self.stack.truncate(frame.base);
                    self.push(result);
                }
                OpCode::Class => {
                    let name = self.read_string();
                    let class = self.alloc(ObjData::Class(ObjClass { name, methods: IndexMap::new() }));
                    self.push(Value::Obj(class));
                }
                OpCode::Inherit => {
                    let superclass = self.peek(1);
                    let super_ref = match superclass.as_obj() {
                        Some(r) if matches!(unsafe { &r.as_ref().data }, ObjData::Class(_)) => r,
                        _ => return Err(self.runtime_error("Superclass must be a class.".to_string())),
                    };
                    let subclass_ref = self.peek(0).as_obj().expect("INHERIT expects a class on top of the stack");
                    let methods: Vec<(GcKey, GcRef)> = unsafe {
                        match &super_ref.as_ref().data {
                            ObjData::Class(c) => c.methods.iter().map(|(k, v)| (*k, *v)).collect(),
                            _ => unreachable!(),
                        }
                    };
                    unsafe {
                        let obj = &mut *subclass_ref.as_ptr();
                        if let ObjData::Class(c) = &mut obj.data {
                            for (k, v) in methods {
                                c.methods.insert(k, v);
                            }
                        }
                    }
                    self.pop();
                }
                OpCode::Method => {
                    let name = self.read_string();
                    let method = self.pop();
                    let method_ref = method.as_obj().expect("METHOD expects a closure on top of the stack");
                    let class_ref = self.peek(0).as_obj().expect("METHOD expects a class below the closure");
                    unsafe {
                        let obj = &mut *class_ref.as_ptr();
                        if let ObjData::Class(c) = &mut obj.data {
                            c.methods.insert(GcKey(name), method_ref);
                        }
                    }
                }
            }
        }
    }

    fn binary_number_op(&mut self, f: impl Fn(f64, f64) -> f64) -> Result<(), RuntimeError> {
        let b = self.pop();
        let a = self.pop();
        match (a, b) {
            (Value::Number(x), Value::Number(y)) => {
                self.push(Value::Number(f(x, y)));
                Ok(())
            }
            _ => Err(self.runtime_error("Operands must be numbers.".to_string())),
        }
    }

    fn binary_compare(&mut self, f: impl Fn(f64, f64) -> bool) -> Result<(), RuntimeError> {
        let b = self.pop();
        let a = self.pop();
        match (a, b) {
            (Value::Number(x), Value::Number(y)) => {
                self.push(Value::Bool(f(x, y)));
                Ok(())
            }
            _ => Err(self.runtime_error("Operands must be numbers.".to_string())),
        }
    }

    /// `+` accepts two numbers or two strings. Both operands stay on the
    /// stack — hence rooted — while the concatenated string is allocated,
    /// and are only popped once the new string already has a home.
    fn add(&mut self) -> Result<(), RuntimeError> {
        let b = self.peek(0);
        let a = self.peek(1);
        match (a, b) {
            (Value::Number(x), Value::Number(y)) => {
                self.pop();
                self.pop();
                self.push(Value::Number(x + y));
                Ok(())
            }
            _ if a.is_string() && b.is_string() => {
                let mut s = a.as_str().unwrap().to_string();
                s.push_str(b.as_str().unwrap());
                let r = self.intern(&s);
                self.pop();
                self.pop();
                self.push(Value::Obj(r));
                Ok(())
            }
            _ => Err(self.runtime_error("Operands must be two numbers or two strings.".to_string())),
        }
    }
}

impl Default for Vm {
    fn default() -> Self {
        Vm::new()
    }
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::rc::Rc;

    use super::*;

    #[derive(Clone)]
    struct SharedBuf(Rc<RefCell<Vec<u8>>>);

    impl Write for SharedBuf {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.borrow_mut().write(buf)
        }
        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    fn run(src: &str) -> String {
        let buf = SharedBuf(Rc::new(RefCell::new(Vec::new())));
        let mut vm = Vm::with_writer(Box::new(buf.clone()));
        vm.interpret(src).expect("program should run without error");
        String::from_utf8(buf.0.borrow().clone()).unwrap()
    }

    #[test]
    fn arithmetic_precedence() {
        assert_eq!(run("print 1 + 2 * 3;"), "7\n");
    }

    #[test]
    fn string_concatenation() {
        assert_eq!(run(r#"var a = "he"; var b = "llo"; print a + b;"#), "hello\n");
    }

    #[test]
    fn closures_capture_upvalues() {
        assert_eq!(
            run("fun make(x) { fun inner() { return x; } return inner; } var f = make(42); print f();"),
            "42\n"
        );
    }

    #[test]
    fn class_inheritance_and_super() {
        assert_eq!(
            run(r#"class A { greet() { print "A"; } } class B < A { greet() { super.greet(); print "B"; } } B().greet();"#),
            "A\nB\n"
        );
    }

    #[test]
    fn for_loop_continue_skips_iteration() {
        assert_eq!(run("var i = 0; for (; i < 3; i = i + 1) { if (i == 1) continue; print i; }"), "0\n2\n");
    }

    #[test]
    fn class_init_sets_fields() {
        assert_eq!(run("class C { init(x) { this.x = x; } } print C(7).x;"), "7\n");
    }

    #[test]
    fn stack_overflow_on_unbounded_recursion() {
        let buf: Vec<u8> = Vec::new();
        let mut vm = Vm::with_writer(Box::new(buf));
        let err = vm.interpret("fun f() { return f(); } f();").unwrap_err();
        match err {
            InterpretError::Runtime(e) => assert!(e.message.contains("Stack overflow")),
            _ => panic!("expected a runtime error"),
        }
    }

    #[test]
    fn type_error_on_string_plus_number() {
        let buf: Vec<u8> = Vec::new();
        let mut vm = Vm::with_writer(Box::new(buf));
        let err = vm.interpret(r#""a" + 1;"#).unwrap_err();
        match err {
            InterpretError::Runtime(e) => assert!(e.message.contains("two numbers or two strings")),
            _ => panic!("expected a runtime error"),
        }
    }
}
