use bramble_lexer::{Scanner, Token, TokenKind};

use crate::chunk::{Chunk, OpCode};
use crate::error::CompileError;
use crate::heap::Heap;
use crate::object::{FunctionKind, GcRef, ObjData, ObjFunction};
use crate::value::Value;

const MAX_LOCALS: usize = 256;
const MAX_UPVALUES: usize = 256;
const MAX_ARGS: usize = 255;

/// Compiles `source` directly to bytecode in a single pass — there is no
/// intermediate AST; the compiler emits bytecode as it parses.
/// Returns the top-level script as an `ObjFunction` on success, or every
/// `CompileError` panic-mode recovery turned up.
pub fn compile(source: &str, heap: &mut Heap) -> Result<GcRef, Vec<CompileError>> {
    let mut compiler = Compiler::new(source, heap);
    compiler.advance();
    while !compiler.check(TokenKind::Eof) {
        compiler.declaration();
    }
    compiler.consume(TokenKind::Eof, "end of expression");
    let function = compiler.end_function();
    if compiler.errors.is_empty() {
        Ok(compiler.heap.alloc_raw(ObjData::Function(function)))
    } else {
        Err(compiler.errors)
    }
}

#[derive(Clone, Copy, PartialEq, PartialOrd)]
#[repr(u8)]
enum Precedence {
    None,
    Assignment, // =
    Or,         // or
    And,        // and
    Equality,   // == !=
    Comparison, // < > <= >=
    Term,       // + -
    Factor,     // * /
    Unary,      // ! -
    Call,       // . ()
    Primary,
}

impl Precedence {
    fn next(self) -> Precedence {
        match self {
            Precedence::None => Precedence::Assignment,
            Precedence::Assignment => Precedence::Or,
            Precedence::Or => Precedence::And,
            Precedence::And => Precedence::Equality,
            Precedence::Equality => Precedence::Comparison,
            Precedence::Comparison => Precedence::Term,
            Precedence::Term => Precedence::Factor,
            Precedence::Factor => Precedence::Unary,
            Precedence::Unary => Precedence::Call,
            Precedence::Call | Precedence::Primary => Precedence::Primary,
        }
    }
}

type ParseFn = fn(&mut Compiler, bool);

struct ParseRule {
    prefix: Option<ParseFn>,
    infix: Option<ParseFn>,
    precedence: Precedence,
}

fn rule(kind: TokenKind) -> ParseRule {
    use TokenKind::*;
    let (prefix, infix, prec): (Option<ParseFn>, Option<ParseFn>, Precedence) = match kind {
        LeftParen => (Some(grouping), Some(call), Precedence::Call),
        Dot => (None, Some(dot), Precedence::Call),
        Minus => (Some(unary), Some(binary), Precedence::Term),
        Plus => (None, Some(binary), Precedence::Term),
        Slash => (None, Some(binary), Precedence::Factor),
        Star => (None, Some(binary), Precedence::Factor),
        Bang => (Some(unary), None, Precedence::None),
        BangEqual => (None, Some(binary), Precedence::Equality),
        EqualEqual => (None, Some(binary), Precedence::Equality),
        Greater => (None, Some(binary), Precedence::Comparison),
        GreaterEqual => (None, Some(binary), Precedence::Comparison),
        Less => (None, Some(binary), Precedence::Comparison),
        LessEqual => (None, Some(binary), Precedence::Comparison),
        Identifier => (Some(variable), None, Precedence::None),
        String => (Some(string), None, Precedence::None),
        Number => (Some(number), None, Precedence::None),
        And => (None, Some(and_), Precedence::And),
        Or => (None, Some(or_), Precedence::Or),
        False | True | Nil => (Some(literal), None, Precedence::None),
        This => (Some(this), None, Precedence::None),
        Super => (Some(super_), None, Precedence::None),
        _ => (None, None, Precedence::None),
    };
    ParseRule { prefix, infix, precedence: prec }
}

struct Local {
    name: String,
    depth: i32,
    is_captured: bool,
}

struct UpvalueDesc {
    index: u8,
    is_local: bool,
}

/// One loop's `break`/`continue` bookkeeping. `continue_target` is the
/// offset a `continue` loops back to — for a `for` loop this is the
/// increment clause (so the increment still runs), for `while` it's the
/// condition check. `break_jumps` are patched to the loop's exit once
/// it's known. break/continue apply to the innermost enclosing loop
/// only, each tracked on its own patch list so nested loops don't
/// interfere with each other.
struct LoopState {
    continue_target: usize,
    break_jumps: Vec<usize>,
    scope_depth: i32,
}

struct FrameState {
    function_name: Option<GcRef>,
    arity: u8,
    kind: FunctionKind,
    chunk: Chunk,
    locals: Vec<Local>,
    upvalues: Vec<UpvalueDesc>,
    scope_depth: i32,
    loops: Vec<LoopState>,
}

impl FrameState {
    fn new(kind: FunctionKind, function_name: Option<GcRef>) -> Self {
        // Slot 0 is reserved: `this` for methods/initializers, unusable
        // otherwise (clox's convention, carried over verbatim).
        let slot0_name = if matches!(kind, FunctionKind::Method | FunctionKind::Initializer) { "this" } else { "" };
        FrameState {
            function_name,
            arity: 0,
            kind,
            chunk: Chunk::new(),
            locals: vec![Local { name: slot0_name.to_string(), depth: 0, is_captured: false }],
            upvalues: Vec::new(),
            scope_depth: 0,
            loops: Vec::new(),
        }
    }
}

struct ClassState {
    has_superclass: bool,
}

struct Compiler<'a> {
    scanner: Scanner,
    heap: &'a mut Heap,
    previous: Token,
    current: Token,
    had_error: bool,
    panic_mode: bool,
    errors: Vec<CompileError>,
    frames: Vec<FrameState>,
    classes: Vec<ClassState>,
    /// Upvalue descriptors of the function `end_function` just popped,
    /// waiting to be emitted as the `Closure` instruction's operand
    /// bytes by the enclosing `function()` call.
    pending_upvalues: Vec<(u8, bool)>,
}

impl<'a> Compiler<'a> {
    fn new(source: &str, heap: &'a mut Heap) -> Self {
        Compiler {
            scanner: Scanner::new(source),
            heap,
            previous: Token::new(TokenKind::Eof, "", 0),
            current: Token::new(TokenKind::Eof, "", 0),
            had_error: false,
            panic_mode: false,
            errors: Vec::new(),
            frames: vec![FrameState::new(FunctionKind::Script, None)],
            classes: Vec::new(),
            pending_upvalues: Vec::new(),
        }
    }

    // ---- token stream -------------------------------------------------

    fn advance(&mut self) {
        std::mem::swap(&mut self.previous, &mut self.current);
        loop {
            self.current = self.scanner.scan_token();
            if self.current.kind != TokenKind::Error {
                break;
            }
            let msg = self.current.lexeme.clone();
            let line = self.current.line;
            self.error_at(line, "", &msg, true);
        }
    }

    fn check(&self, kind: TokenKind) -> bool {
        self.current.kind == kind
    }

    fn match_token(&mut self, kind: TokenKind) -> bool {
        if !self.check(kind) {
            return false;
        }
        self.advance();
        true
    }

    fn consume(&mut self, kind: TokenKind, what: &str) {
        if self.current.kind == kind {
            self.advance();
            return;
        }
        let line = self.current.line;
        if self.current.kind == TokenKind::Eof {
            self.push_error(CompileError::UnexpectedEof { expected: what.to_string(), line });
        } else {
            self.push_error(CompileError::UnexpectedToken { expected: what.to_string(), found: self.current.lexeme.clone(), line });
        }
    }

    fn error_at(&mut self, _line: u32, _what: &str, _msg: &str, _from_scan: bool) {
        // Scan errors surface as ordinary `UnexpectedToken`s via `consume`
        // on the next real parse step; nothing to report here beyond
        // flagging panic mode so statement-level recovery kicks in.
        self.had_error = true;
        self.panic_mode = true;
    }

    fn push_error(&mut self, err: CompileError) {
        if self.panic_mode {
            return;
        }
        self.panic_mode = true;
        self.had_error = true;
        self.errors.push(err);
    }

    fn synchronize(&mut self) {
        self.panic_mode = false;
        while self.current.kind != TokenKind::Eof {
            if self.previous.kind == TokenKind::Semicolon {
                return;
            }
            use TokenKind::*;
            match self.current.kind {
                Class | Fun | Var | For | If | While | Print | Return => return,
                _ => self.advance(),
            }
        }
    }

    // ---- bytecode emission --------------------------------------------

    fn frame(&mut self) -> &mut FrameState {
        self.frames.last_mut().unwrap()
    }

    fn chunk(&mut self) -> &mut Chunk {
        &mut self.frame().chunk
    }

    fn line(&self) -> u32 {
        self.previous.line
    }

    fn emit_op(&mut self, op: OpCode) {
        let line = self.line();
        self.chunk().write_op(op, line);
    }

    fn emit_byte(&mut self, byte: u8) {
        let line = self.line();
        self.chunk().write_u8(byte, line);
    }

    fn emit_ops(&mut self, op: OpCode, byte: u8) {
        self.emit_op(op);
        self.emit_byte(byte);
    }

    fn emit_constant(&mut self, value: Value) {
        let line = self.line();
        match self.chunk().add_constant(value) {
            Some(idx) => {
                self.chunk().write_op(OpCode::Constant, line);
                self.chunk().write_u8(idx, line);
            }
            None => self.push_error(CompileError::TooManyConstants { line }),
        }
    }

    fn emit_jump(&mut self, op: OpCode) -> usize {
        let line = self.line();
        self.chunk().write_op(op, line);
        let offset = self.chunk().len();
        self.chunk().write_u16(0xFFFF, line);
        offset
    }

    fn patch_jump(&mut self, offset: usize) {
        let line = self.line();
        let jump = self.chunk().len() - offset - 2;
        if jump > u16::MAX as usize {
            self.push_error(CompileError::JumpTooLarge { line });
            return;
        }
        let jump = jump as u16;
        let [hi, lo] = jump.to_be_bytes();
        self.chunk().code[offset] = hi;
        self.chunk().code[offset + 1] = lo;
    }

    fn emit_loop(&mut self, loop_start: usize) {
        let line = self.line();
        self.chunk().write_op(OpCode::Loop, line);
        let jump = self.chunk().len() - loop_start + 2;
        if jump > u16::MAX as usize {
            self.push_error(CompileError::JumpTooLarge { line });
            return;
        }
        self.chunk().write_u16(jump as u16, line);
    }

    fn emit_return(&mut self) {
        if self.frame().kind == FunctionKind::Initializer {
            self.emit_ops(OpCode::GetLocal, 0);
        } else {
            self.emit_op(OpCode::Nil);
        }
        self.emit_op(OpCode::Return);
    }

    fn identifier_constant(&mut self, name: &str) -> u8 {
        let r = self.heap.intern_string(name);
        let line = self.line();
        match self.chunk().add_constant(Value::Obj(r)) {
            Some(idx) => idx,
            None => {
                self.push_error(CompileError::TooManyConstants { line });
                0
            }
        }
    }

    // ---- scopes & variables --------------------------------------------

    fn begin_scope(&mut self) {
        self.frame().scope_depth += 1;
    }

    fn end_scope(&mut self) {
        self.frame().scope_depth -= 1;
        let depth = self.frame().scope_depth;
        loop {
            let stays = matches!(self.frame().locals.last(), Some(local) if local.depth > depth);
            if !stays {
                break;
            }
            let captured = self.frame().locals.last().unwrap().is_captured;
            if captured {
                self.emit_op(OpCode::CloseUpvalue);
            } else {
                self.emit_op(OpCode::Pop);
            }
            self.frame().locals.pop();
        }
    }

    /// Emits enough `Pop`/`CloseUpvalue` instructions to unwind every
    /// local declared more deeply than `target_depth`, WITHOUT touching
    /// the compiler's own `locals` bookkeeping — used by `break`/
    /// `continue`, which jump out of a scope without compile-time ending
    /// it (the enclosing block compile continues normally afterwards).
    fn discard_locals_above(&mut self, target_depth: i32) {
        let count = self.frame().locals.iter().rev().take_while(|l| l.depth > target_depth).count();
        let start = self.frame().locals.len() - count;
        for i in (start..self.frame().locals.len()).rev() {
            if self.frame().locals[i].is_captured {
                self.emit_op(OpCode::CloseUpvalue);
            } else {
                self.emit_op(OpCode::Pop);
            }
        }
    }

    fn declare_variable(&mut self, name: &str) {
        if self.frame().scope_depth == 0 {
            return;
        }
        let depth = self.frame().scope_depth;
        let line = self.line();
        for local in self.frame().locals.iter().rev() {
            if local.depth != -1 && local.depth < depth {
                break;
            }
            if local.name == name {
                self.push_error(CompileError::DuplicateLocal { name: name.to_string(), line });
                return;
            }
        }
        self.add_local(name);
    }

    fn add_local(&mut self, name: &str) {
        let line = self.line();
        if self.frame().locals.len() >= MAX_LOCALS {
            self.push_error(CompileError::TooManyLocals { line });
            return;
        }
        self.frame().locals.push(Local { name: name.to_string(), depth: -1, is_captured: false });
    }

    fn mark_initialized(&mut self) {
        if self.frame().scope_depth == 0 {
            return;
        }
        let depth = self.frame().scope_depth;
        self.frame().locals.last_mut().unwrap().depth = depth;
    }

    /// Parses a variable name, returning its global-name constant index
    /// (meaningless for locals, where `define_variable` is a no-op).
    fn parse_variable(&mut self, what: &str) -> u8 {
        self.consume(TokenKind::Identifier, what);
        let name = self.previous.lexeme.clone();
        self.declare_variable(&name);
        if self.frame().scope_depth > 0 {
            return 0;
        }
        self.identifier_constant(&name)
    }

    fn define_variable(&mut self, global: u8) {
        if self.frame().scope_depth > 0 {
            self.mark_initialized();
            return;
        }
        self.emit_ops(OpCode::DefineGlobal, global);
    }

    fn resolve_local(&self, frame_idx: usize, name: &str) -> Result<Option<u8>, CompileError> {
        let frame = &self.frames[frame_idx];
        for (i, local) in frame.locals.iter().enumerate().rev() {
            if local.name == name {
                if local.depth == -1 {
                    return Err(CompileError::ReadLocalInOwnInitializer { name: name.to_string(), line: self.line() });
                }
                return Ok(Some(i as u8));
            }
        }
        Ok(None)
    }

    fn resolve_upvalue(&mut self, frame_idx: usize, name: &str) -> Option<u8> {
        if frame_idx == 0 {
            return None;
        }
        match self.resolve_local(frame_idx - 1, name) {
            Ok(Some(local_idx)) => {
                self.frames[frame_idx - 1].locals[local_idx as usize].is_captured = true;
                return self.add_upvalue(frame_idx, local_idx, true);
            }
            Err(e) => {
                self.push_error(e);
                return None;
            }
            Ok(None) => {}
        }
        if let Some(up_idx) = self.resolve_upvalue(frame_idx - 1, name) {
            return self.add_upvalue(frame_idx, up_idx, false);
        }
        None
    }

    fn add_upvalue(&mut self, frame_idx: usize, index: u8, is_local: bool) -> Option<u8> {
        let line = self.line();
        let frame = &mut self.frames[frame_idx];
        for (i, u) in frame.upvalues.iter().enumerate() {
            if u.index == index && u.is_local == is_local {
                return Some(i as u8);
            }
        }
        if frame.upvalues.len() >= MAX_UPVALUES {
            self.push_error(CompileError::TooManyUpvalues { line });
            return None;
        }
        frame.upvalues.push(UpvalueDesc { index, is_local });
        Some((frame.upvalues.len() - 1) as u8)
    }

    // ---- declarations ---------------------------------------------------

    fn declaration(&mut self) {
        if self.match_token(TokenKind::Class) {
            self.class_declaration();
        } else if self.match_token(TokenKind::Fun) {
            self.fun_declaration();
        } else if self.match_token(TokenKind::Var) {
            self.var_declaration();
        } else {
            self.statement();
        }
        if self.panic_mode {
            self.synchronize();
        }
    }

    fn class_declaration(&mut self) {
        self.consume(TokenKind::Identifier, "a class name");
        let class_name = self.previous.lexeme.clone();
        let line = self.previous.line;
        let name_const = self.identifier_constant(&class_name);
        self.declare_variable(&class_name);
        self.emit_ops(OpCode::Class, name_const);
        self.define_variable(name_const);

        self.classes.push(ClassState { has_superclass: false });

        if self.match_token(TokenKind::Less) {
            self.consume(TokenKind::Identifier, "a superclass name");
            if self.previous.lexeme == class_name {
                self.push_error(CompileError::ClassInheritsFromItself { name: class_name.clone(), line });
            }
            variable(self, false);
            self.begin_scope();
            self.add_local("super");
            self.define_variable(0);
            self.named_variable(&class_name, false);
            self.emit_op(OpCode::Inherit);
            self.classes.last_mut().unwrap().has_superclass = true;
        }

        self.named_variable(&class_name, false);
        self.consume(TokenKind::LeftBrace, "'{' before class body");
        while !self.check(TokenKind::RightBrace) && !self.check(TokenKind::Eof) {
            self.method();
        }
        self.consume(TokenKind::RightBrace, "'}' after class body");
        self.emit_op(OpCode::Pop);

        if self.classes.last().unwrap().has_superclass {
            self.end_scope();
        }
        self.classes.pop();
    }

    fn method(&mut self) {
        self.consume(TokenKind::Identifier, "a method name");
        let name = self.previous.lexeme.clone();
        let name_const = self.identifier_constant(&name);
        let kind = if name == "init" { FunctionKind::Initializer } else { FunctionKind::Method };
        self.function(kind);
        self.emit_ops(OpCode::Method, name_const);
    }

    fn fun_declaration(&mut self) {
        let global = self.parse_variable("a function name");
        self.mark_initialized();
        self.function(FunctionKind::Function);
        self.define_variable(global);
    }

    fn function(&mut self, kind: FunctionKind) {
        let name = self.previous.lexeme.clone();
        let name_ref = self.heap.intern_string(&name);
        self.frames.push(FrameState::new(kind, Some(name_ref)));
        self.begin_scope();

        self.consume(TokenKind::LeftParen, "'(' after function name");
        if !self.check(TokenKind::RightParen) {
            loop {
                if self.frame().arity as usize >= MAX_ARGS {
                    let line = self.line();
                    self.push_error(CompileError::TooManyArguments { line });
                    break;
                }
                self.frame().arity += 1;
                let param = self.parse_variable("a parameter name");
                self.define_variable(param);
                if !self.match_token(TokenKind::Comma) {
                    break;
                }
            }
        }
        self.consume(TokenKind::RightParen, "')' after parameters");
        self.consume(TokenKind::LeftBrace, "'{' before function body");
        self.block();

        let function = self.end_function();
        let func_ref = self.heap.alloc_raw(ObjData::Function(function));
        let line = self.line();
        match self.chunk().add_constant(Value::Obj(func_ref)) {
            Some(idx) => {
                self.chunk().write_op(OpCode::Closure, line);
                self.chunk().write_u8(idx, line);
            }
            None => self.push_error(CompileError::TooManyConstants { line }),
        }
        for (index, is_local) in self.pending_upvalues.drain(..) {
            self.chunk().write_u8(is_local as u8, line);
            self.chunk().write_u8(index, line);
        }
    }

    /// Pops the current frame, finishing it into an `ObjFunction`. Stashes
    /// its upvalue descriptor list on `self.pending_upvalues` so `function`
    /// can emit the `Closure` operand bytes after the frame is gone.
    fn end_function(&mut self) -> ObjFunction {
        self.emit_return();
        let frame = self.frames.pop().unwrap();
        self.pending_upvalues = frame.upvalues.iter().map(|u| (u.index, u.is_local)).collect();
        ObjFunction {
            arity: frame.arity,
            upvalue_count: frame.upvalues.len() as u8,
            name: frame.function_name,
            chunk: frame.chunk,
        }
    }

    fn var_declaration(&mut self) {
        let global = self.parse_variable("a variable name");
        if self.match_token(TokenKind::Equal) {
            self.expression();
        } else {
            self.emit_op(OpCode::Nil);
        }
        self.consume(TokenKind::Semicolon, "';' after variable declaration");
        self.define_variable(global);
    }

    // ---- statements -------------------------------------------------------

    fn statement(&mut self) {
        if self.match_token(TokenKind::Print) {
            self.print_statement();
        } else if self.match_token(TokenKind::If) {
            self.if_statement();
        } else if self.match_token(TokenKind::Return) {
            self.return_statement();
        } else if self.match_token(TokenKind::While) {
            self.while_statement();
        } else if self.match_token(TokenKind::For) {
            self.for_statement();
        } else if self.match_token(TokenKind::Break) {
            self.break_statement();
        } else if self.match_token(TokenKind::Continue) {
            self.continue_statement();
        } else if self.match_token(TokenKind::LeftBrace) {
            self.begin_scope();
            self.block();
            self.end_scope();
        } else {
            self.expression_statement();
        }
    }

    fn block(&mut self) {
        while !self.check(TokenKind::RightBrace) && !self.check(TokenKind::Eof) {
            self.declaration();
        }
        self.consume(TokenKind::RightBrace, "'}' after block");
    }

    fn print_statement(&mut self) {
        self.expression();
        self.consume(TokenKind::Semicolon, "';' after value");
        self.emit_op(OpCode::Print);
    }

    fn expression_statement(&mut self) {
        self.expression();
        self.consume(TokenKind::Semicolon, "';' after expression");
        self.emit_op(OpCode::Pop);
    }

    fn if_statement(&mut self) {
        self.consume(TokenKind::LeftParen, "'(' after 'if'");
        self.expression();
        self.consume(TokenKind::RightParen, "')' after condition");

        let then_jump = self.emit_jump(OpCode::JumpIfFalse);
        self.emit_op(OpCode::Pop);
        self.statement();

        let else_jump = self.emit_jump(OpCode::Jump);
        self.patch_jump(then_jump);
        self.emit_op(OpCode::Pop);

        if self.match_token(TokenKind::Else) {
            self.statement();
        }
        self.patch_jump(else_jump);
    }

    fn while_statement(&mut self) {
        let loop_start = self.chunk().len();
        self.frame().loops.push(LoopState { continue_target: loop_start, break_jumps: Vec::new(), scope_depth: self.frame().scope_depth });

        self.consume(TokenKind::LeftParen, "'(' after 'while'");
        self.expression();
        self.consume(TokenKind::RightParen, "')' after condition");

        let exit_jump = self.emit_jump(OpCode::JumpIfFalse);
        self.emit_op(OpCode::Pop);
        self.statement();
        self.emit_loop(loop_start);

        self.patch_jump(exit_jump);
        self.emit_op(OpCode::Pop);
        self.end_loop();
    }

    fn for_statement(&mut self) {
        self.begin_scope();
        self.consume(TokenKind::LeftParen, "'(' after 'for'");
        if self.match_token(TokenKind::Semicolon) {
            // no initializer
        } else if self.match_token(TokenKind::Var) {
            self.var_declaration();
        } else {
            self.expression_statement();
        }

        let mut loop_start = self.chunk().len();
        let mut exit_jump: Option<usize> = None;
        if !self.match_token(TokenKind::Semicolon) {
            self.expression();
            self.consume(TokenKind::Semicolon, "';' after loop condition");
            exit_jump = Some(self.emit_jump(OpCode::JumpIfFalse));
            self.emit_op(OpCode::Pop);
        }

        if !self.match_token(TokenKind::RightParen) {
            let body_jump = self.emit_jump(OpCode::Jump);
            let increment_start = self.chunk().len();
            self.expression();
            self.emit_op(OpCode::Pop);
            self.consume(TokenKind::RightParen, "')' after for clauses");
            self.emit_loop(loop_start);
            loop_start = increment_start;
            self.patch_jump(body_jump);
        }

        self.frame().loops.push(LoopState { continue_target: loop_start, break_jumps: Vec::new(), scope_depth: self.frame().scope_depth });

        self.statement();
        self.emit_loop(loop_start);

        if let Some(exit) = exit_jump {
            self.patch_jump(exit);
            self.emit_op(OpCode::Pop);
        }
        self.end_loop();
        self.end_scope();
    }

    fn end_loop(&mut self) {
        let loop_state = self.frame().loops.pop().unwrap();
        for jump in loop_state.break_jumps {
            self.patch_jump(jump);
        }
    }

    fn break_statement(&mut self) {
        let line = self.previous.line;
        if self.frame().loops.is_empty() {
            self.push_error(CompileError::BreakOutsideLoop { line });
        } else {
            let depth = self.frame().loops.last().unwrap().scope_depth;
            self.discard_locals_above(depth);
            let jump = self.emit_jump(OpCode::Jump);
            self.frame().loops.last_mut().unwrap().break_jumps.push(jump);
        }
        self.consume(TokenKind::Semicolon, "';' after 'break'");
    }

    fn continue_statement(&mut self) {
        let line = self.previous.line;
        if self.frame().loops.is_empty() {
            self.push_error(CompileError::ContinueOutsideLoop { line });
        } else {
            let loop_state_depth = self.frame().loops.last().unwrap().scope_depth;
            let target = self.frame().loops.last().unwrap().continue_target;
            self.discard_locals_above(loop_state_depth);
            self.emit_loop(target);
        }
        self.consume(TokenKind::Semicolon, "';' after 'continue'");
    }

    fn return_statement(&mut self) {
        let line = self.previous.line;
        if self.frame().kind == FunctionKind::Script {
            self.push_error(CompileError::ReturnOutsideFunction { line });
        }
        if self.match_token(TokenKind::Semicolon) {
            self.emit_return();
        } else {
            if self.frame().kind == FunctionKind::Initializer {
                self.push_error(CompileError::ReturnValueFromInitializer { line });
            }
            self.expression();
            self.consume(TokenKind::Semicolon, "';' after return value");
            self.emit_op(OpCode::Return);
        }
    }

    // ---- expressions --------------------------------------------------

    fn expression(&mut self) {
        self.parse_precedence(Precedence::Assignment);
    }

    fn parse_precedence(&mut self, precedence: Precedence) {
        self.advance();
        let prefix = rule(self.previous.kind).prefix;
        let can_assign = precedence <= Precedence::Assignment;
        match prefix {
            Some(f) => f(self, can_assign),
            None => {
                let line = self.previous.line;
                self.push_error(CompileError::UnexpectedToken {
                    expected: "an expression".to_string(),
                    found: self.previous.lexeme.clone(),
                    line,
                });
                return;
            }
        }

        while precedence <= rule(self.current.kind).precedence {
            self.advance();
            if let Some(infix) = rule(self.previous.kind).infix {
                infix(self, can_assign);
            }
        }

        if can_assign && self.match_token(TokenKind::Equal) {
            let line = self.previous.line;
            self.push_error(CompileError::InvalidAssignTarget { line });
        }
    }

    fn named_variable(&mut self, name: &str, can_assign: bool) {
        let frame_idx = self.frames.len() - 1;
        let local = match self.resolve_local(frame_idx, name) {
            Ok(v) => v,
            Err(e) => {
                self.push_error(e);
                None
            }
        };
        let (get_op, set_op, arg) = if let Some(slot) = local {
            (OpCode::GetLocal, OpCode::SetLocal, slot)
        } else if let Some(up) = self.resolve_upvalue(frame_idx, name) {
            (OpCode::GetUpvalue, OpCode::SetUpvalue, up)
        } else {
            let idx = self.identifier_constant(name);
            (OpCode::GetGlobal, OpCode::SetGlobal, idx)
        };

        if can_assign && self.match_token(TokenKind::Equal) {
            self.expression();
            self.emit_ops(set_op, arg);
        } else {
            self.emit_ops(get_op, arg);
        }
    }

    fn argument_list(&mut self) -> u8 {
        let mut count: u32 = 0;
        if !self.check(TokenKind::RightParen) {
            loop {
                self.expression();
                if count as usize >= MAX_ARGS {
                    let line = self.previous.line;
                    self.push_error(CompileError::TooManyArguments { line });
                }
                count += 1;
                if !self.match_token(TokenKind::Comma) {
                    break;
                }
            }
        }
        self.consume(TokenKind::RightParen, "')' after arguments");
        count as u8
    }
}

fn number(c: &mut Compiler, _can_assign: bool) {
    let value: f64 = c.previous.lexeme.parse().unwrap_or(f64::NAN);
    c.emit_constant(Value::Number(value));
}

fn string(c: &mut Compiler, _can_assign: bool) {
    let lexeme = &c.previous.lexeme;
    let text = &lexeme[1..lexeme.len() - 1];
    let r = c.heap.intern_string(text);
    c.emit_constant(Value::Obj(r));
}

fn literal(c: &mut Compiler, _can_assign: bool) {
    match c.previous.kind {
        TokenKind::False => c.emit_op(OpCode::False),
        TokenKind::True => c.emit_op(OpCode::True),
        TokenKind::Nil => c.emit_op(OpCode::Nil),
        _ => unreachable!(),
    }
}

fn grouping(c: &mut Compiler, _can_assign: bool) {
    c.expression();
    c.consume(TokenKind::RightParen, "')' after expression");
}

fn unary(c: &mut Compiler, _can_assign: bool) {
    let op_kind = c.previous.kind;
    c.parse_precedence(Precedence::Unary);
    match op_kind {
        TokenKind::Minus => c.emit_op(OpCode::Negate),
        TokenKind::Bang => c.emit_op(OpCode::Not),
        _ => unreachable!(),
    }
}

fn binary(c: &mut Compiler, _can_assign: bool) {
    let op_kind = c.previous.kind;
    let r = rule(op_kind);
    c.parse_precedence(r.precedence.next());
    match op_kind {
        TokenKind::BangEqual => {
            c.emit_op(OpCode::Equal);
            c.emit_op(OpCode::Not);
        }
        TokenKind::EqualEqual => c.emit_op(OpCode::Equal),
        TokenKind::Greater => c.emit_op(OpCode::Greater),
        TokenKind::GreaterEqual => {
            c.emit_op(OpCode::Less);
            c.emit_op(OpCode::Not);
        }
        TokenKind::Less => c.emit_op(OpCode::Less),
        TokenKind::LessEqual => {
            c.emit_op(OpCode::Greater);
            c.emit_op(OpCode::Not);
        }
        TokenKind::Plus => c.emit_op(OpCode::Add),
        TokenKind::Minus => c.emit_op(OpCode::Subtract),
        TokenKind::Star => c.emit_op(OpCode::Multiply),
        TokenKind::Slash => c.emit_op(OpCode::Divide),
        _ => unreachable!(),
    }
}

fn and_(c: &mut Compiler, _can_assign: bool) {
    let end_jump = c.emit_jump(OpCode::JumpIfFalse);
    c.emit_op(OpCode::Pop);
    c.parse_precedence(Precedence::And);
    c.patch_jump(end_jump);
}

fn or_(c: &mut Compiler, _can_assign: bool) {
    let else_jump = c.emit_jump(OpCode::JumpIfFalse);
    let end_jump = c.emit_jump(OpCode::Jump);
    c.patch_jump(else_jump);
    c.emit_op(OpCode::Pop);
    c.parse_precedence(Precedence::Or);
    c.patch_jump(end_jump);
}

fn variable(c: &mut Compiler, can_assign: bool) {
    let name = c.previous.lexeme.clone();
    c.named_variable(&name, can_assign);
}

fn this(c: &mut Compiler, _can_assign: bool) {
    if c.classes.is_empty() {
        let line = c.previous.line;
        c.push_error(CompileError::ThisOutsideClass { line });
        return;
    }
    variable(c, false);
}

fn super_(c: &mut Compiler, _can_assign: bool) {
    let line = c.previous.line;
    if c.classes.is_empty() {
        c.push_error(CompileError::SuperOutsideClass { line });
    } else if !c.classes.last().unwrap().has_superclass {
        c.push_error(CompileError::SuperWithoutSuperclass { line });
    }
    c.consume(TokenKind::Dot, "'.' after 'super'");
    c.consume(TokenKind::Identifier, "a superclass method name");
    let name = c.previous.lexeme.clone();
    let name_const = c.identifier_constant(&name);

    c.named_variable("this", false);
    if c.match_token(TokenKind::LeftParen) {
        let arg_count = c.argument_list();
        c.named_variable("super", false);
        c.emit_op(OpCode::SuperInvoke);
        c.emit_byte(name_const);
        c.emit_byte(arg_count);
    } else {
        c.named_variable("super", false);
        c.emit_ops(OpCode::GetSuper, name_const);
    }
}

fn call(c: &mut Compiler, _can_assign: bool) {
    let arg_count = c.argument_list();
    c.emit_ops(OpCode::Call, arg_count);
}

fn dot(c: &mut Compiler, can_assign: bool) {
    c.consume(TokenKind::Identifier, "a property name after '.'");
    let name = c.previous.lexeme.clone();
    let name_const = c.identifier_constant(&name);

    if can_assign && c.match_token(TokenKind::Equal) {
        c.expression();
        c.emit_ops(OpCode::SetProperty, name_const);
    } else if c.match_token(TokenKind::LeftParen) {
        let arg_count = c.argument_list();
        c.emit_op(OpCode::Invoke);
        c.emit_byte(name_const);
        c.emit_byte(arg_count);
    } else {
        c.emit_ops(OpCode::GetProperty, name_const);
    }
}
