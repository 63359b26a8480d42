//! Read-only instruction tracer, compiled in only under the
//! `trace_execution` feature. Every step the dispatch loop takes is
//! written to stderr before it executes.
use crate::chunk::{Chunk, OpCode};
use crate::object::ObjData;

pub fn disassemble_chunk(chunk: &Chunk, name: &str) {
    eprintln!("== {name} ==");
    let mut offset = 0;
    while offset < chunk.len() {
        offset = disassemble_instruction(chunk, offset);
    }
}

pub fn disassemble_instruction(chunk: &Chunk, offset: usize) -> usize {
    eprint!("{offset:04} {:4} ", chunk.line_at(offset));
    let byte = chunk.code[offset];
    let op = match OpCode::from_u8(byte) {
        Some(op) => op,
        None => {
            eprintln!("Unknown opcode {byte}");
            return offset + 1;
        }
    };
    match op {
        OpCode::Constant => constant_instruction("CONSTANT", chunk, offset),
        OpCode::GetLocal => byte_instruction("GET_LOCAL", chunk, offset),
        OpCode::SetLocal => byte_instruction("SET_LOCAL", chunk, offset),
        OpCode::GetGlobal => constant_instruction("GET_GLOBAL", chunk, offset),
        OpCode::DefineGlobal => constant_instruction("DEFINE_GLOBAL", chunk, offset),
        OpCode::SetGlobal => constant_instruction("SET_GLOBAL", chunk, offset),
        OpCode::GetUpvalue => byte_instruction("GET_UPVALUE", chunk, offset),
        OpCode::SetUpvalue => byte_instruction("SET_UPVALUE", chunk, offset),
        OpCode::GetProperty => constant_instruction("GET_PROPERTY", chunk, offset),
        OpCode::SetProperty => constant_instruction("SET_PROPERTY", chunk, offset),
        OpCode::GetSuper => constant_instruction("GET_SUPER", chunk, offset),
        OpCode::Jump => jump_instruction("JUMP", 1, chunk, offset),
        OpCode::JumpIfFalse => jump_instruction("JUMP_IF_FALSE", 1, chunk, offset),
        OpCode::Loop => jump_instruction("LOOP", -1, chunk, offset),
        OpCode::Call => byte_instruction("CALL", chunk, offset),
        OpCode::Invoke => invoke_instruction("INVOKE", chunk, offset),
        OpCode::SuperInvoke => invoke_instruction("SUPER_INVOKE", chunk, offset),
        OpCode::Class => constant_instruction("CLASS", chunk, offset),
        OpCode::Method => constant_instruction("METHOD", chunk, offset),
        OpCode::Closure => closure_instruction(chunk, offset),
        simple => simple_instruction(simple_name(simple), offset),
    }
}

fn simple_name(op: OpCode) -> &'static str {
    match op {
        OpCode::Nil => "NIL",
        OpCode::True => "TRUE",
        OpCode::False => "FALSE",
        OpCode::Pop => "POP",
        OpCode::Equal => "EQUAL",
        OpCode::Greater => "GREATER",
        OpCode::Less => "LESS",
        OpCode::Add => "ADD",
        OpCode::Subtract => "SUBTRACT",
        OpCode::Multiply => "MULTIPLY",
        OpCode::Divide => "DIVIDE",
        OpCode::Not => "NOT",
        OpCode::Negate => "NEGATE",
        OpCode::Print => "PRINT",
        OpCode::CloseUpvalue => "CLOSE_UPVALUE",
        OpCode::Return => "RETURN",
        OpCode::Inherit => "INHERIT",
        _ => "UNKNOWN",
    }
}

fn simple_instruction(name: &str, offset: usize) -> usize {
    eprintln!("{name}");
    offset + 1
}

fn byte_instruction(name: &str, chunk: &Chunk, offset: usize) -> usize {
    let slot = chunk.code[offset + 1];
    eprintln!("{name:-16} {slot:4}");
    offset + 2
}

fn constant_instruction(name: &str, chunk: &Chunk, offset: usize) -> usize {
    let idx = chunk.code[offset + 1];
    eprintln!("{name:-16} {idx:4} '{}'", chunk.constants[idx as usize]);
    offset + 2
}

fn jump_instruction(name: &str, sign: i32, chunk: &Chunk, offset: usize) -> usize {
    let jump = chunk.read_u16(offset + 1) as i32;
    let target = offset as i32 + 3 + sign * jump;
    eprintln!("{name:-16} {offset:4} -> {target}");
    offset + 3
}

fn closure_instruction(chunk: &Chunk, offset: usize) -> usize {
    let idx = chunk.code[offset + 1];
    eprintln!("{:-16} {idx:4} '{}'", "CLOSURE", chunk.constants[idx as usize]);
    let upvalue_count = match unsafe { chunk.constants[idx as usize].obj_data() } {
        Some(ObjData::Function(f)) => f.upvalue_count,
        _ => 0,
    };
    let mut cursor = offset + 2;
    for _ in 0..upvalue_count {
        let is_local = chunk.code[cursor];
        let index = chunk.code[cursor + 1];
        eprintln!("{cursor:04}      |                     {} {index}", if is_local != 0 { "local" } else { "upvalue" });
        cursor += 2;
    }
    cursor
}

fn invoke_instruction(name: &str, chunk: &Chunk, offset: usize) -> usize {
    let idx = chunk.code[offset + 1];
    let argc = chunk.code[offset + 2];
    eprintln!("{name:-16} ({argc} args) {idx:4} '{}'", chunk.constants[idx as usize]);
    offset + 3
}
