// File: src/compiler.rs
//
// Bytecode compiler for the Tmbdl language. Walks the AST and emits one
// chunk per function (main plus each nested song), tracking a stack of
// function contexts for lexical resolution and upvalue capture analysis.

use std::sync::Arc;

use crate::ast::{
    BinaryOp, Expr, ExprKind, FunctionLiteral, LogicalOp, Stmt, StmtKind, TemplatePart, UnaryOp,
    UpdateOp,
};
use crate::bytecode::{Chunk, CompiledFunction, Constant, OpCode};
use crate::errors::TmbdlError;

const MAX_SLOTS: usize = u8::MAX as usize + 1;

/// A local variable in the function being compiled. Its slot index is its
/// position in the context's locals list.
#[derive(Debug)]
struct Local {
    name: String,
    depth: usize,
    is_captured: bool,
}

/// An upvalue recorded for the function being compiled. `is_local` means
/// the capture refers to a local slot of the immediately enclosing
/// function; otherwise it chains through the parent's upvalues.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct UpvalueRef {
    index: u8,
    is_local: bool,
}

/// Per-function compiler state; `contexts` forms the lexical nesting chain
struct FunctionContext {
    chunk: Chunk,
    locals: Vec<Local>,
    upvalues: Vec<UpvalueRef>,
    scope_depth: usize,
    name: String,
    arity: u16,
}

impl FunctionContext {
    fn new(name: &str, arity: u16) -> Self {
        Self {
            chunk: Chunk::new(),
            locals: Vec::new(),
            upvalues: Vec::new(),
            scope_depth: 0,
            name: name.to_string(),
            arity,
        }
    }
}

/// An enclosing loop: where `onwards` jumps back to, and the `flee` jumps
/// still waiting for their exit offset.
struct LoopContext {
    start: usize,
    breaks: Vec<usize>,
    ctx: usize,
    /// Scope depth whose locals survive a `flee`; deeper locals are
    /// discarded at the jump site
    depth: usize,
}

pub struct Compiler {
    contexts: Vec<FunctionContext>,
    loops: Vec<LoopContext>,
}

impl Compiler {
    pub fn new() -> Self {
        Self { contexts: Vec::new(), loops: Vec::new() }
    }

    /// Compile a program into its main chunk. Nested songs are interned in
    /// their parent chunk's constant pool.
    pub fn compile(&mut self, program: &[Stmt]) -> Result<Chunk, TmbdlError> {
        self.contexts.clear();
        self.loops.clear();
        self.contexts.push(FunctionContext::new("<main>", 0));

        for stmt in program {
            self.compile_stmt(stmt)?;
        }
        let last_line = program.last().map(|s| s.line).unwrap_or(0);
        self.emit_op(OpCode::Halt, last_line);

        let ctx = self.contexts.pop().ok_or_else(|| {
            TmbdlError::internal("compiler context stack underflow".to_string())
        })?;
        Ok(ctx.chunk)
    }

    // === Emission helpers ===

    fn cur(&mut self) -> &mut FunctionContext {
        self.contexts.last_mut().expect("no active compiler context")
    }

    fn emit_op(&mut self, op: OpCode, line: u16) {
        self.cur().chunk.write_op(op, line);
    }

    fn emit_byte(&mut self, byte: u8, line: u16) {
        self.cur().chunk.write(byte, line);
    }

    fn emit_op_byte(&mut self, op: OpCode, byte: u8, line: u16) {
        self.emit_op(op, line);
        self.emit_byte(byte, line);
    }

    fn make_constant(&mut self, constant: Constant, line: u16) -> Result<u8, TmbdlError> {
        let index = self.cur().chunk.add_constant(constant);
        if index >= MAX_SLOTS {
            return Err(TmbdlError::compile_error(
                "Too many constants in one chunk".to_string(),
                line as usize,
            ));
        }
        Ok(index as u8)
    }

    fn emit_constant(&mut self, constant: Constant, line: u16) -> Result<(), TmbdlError> {
        let index = self.make_constant(constant, line)?;
        self.emit_op_byte(OpCode::PushConst, index, line);
        Ok(())
    }

    /// Emit a forward jump with a placeholder operand; returns the operand
    /// offset for later patching
    fn emit_jump(&mut self, op: OpCode, line: u16) -> usize {
        self.emit_op(op, line);
        self.emit_byte(0xff, line);
        self.cur().chunk.code.len() - 1
    }

    fn patch_jump(&mut self, operand_pos: usize, line: u16) -> Result<(), TmbdlError> {
        let distance = self.cur().chunk.code.len() - operand_pos - 1;
        if distance > u8::MAX as usize {
            return Err(TmbdlError::compile_error(
                "Too much code to jump over".to_string(),
                line as usize,
            ));
        }
        self.cur().chunk.code[operand_pos] = distance as u8;
        Ok(())
    }

    /// Emit a backward jump to `start`
    fn emit_loop(&mut self, start: usize, line: u16) -> Result<(), TmbdlError> {
        self.emit_op(OpCode::Loop, line);
        let distance = self.cur().chunk.code.len() + 1 - start;
        if distance > u8::MAX as usize {
            return Err(TmbdlError::compile_error(
                "Loop body too large".to_string(),
                line as usize,
            ));
        }
        self.emit_byte(distance as u8, line);
        Ok(())
    }

    // === Scope and variable resolution ===

    fn begin_scope(&mut self) {
        self.cur().scope_depth += 1;
    }

    /// Pop locals that belong to the scope being left. Captured locals get
    /// their upvalue closed instead of a plain pop so sharers keep seeing
    /// the value.
    fn end_scope(&mut self, line: u16) {
        self.cur().scope_depth -= 1;
        loop {
            let ctx = self.cur();
            let captured = match ctx.locals.last() {
                Some(local) if local.depth > ctx.scope_depth => local.is_captured,
                _ => break,
            };
            ctx.locals.pop();
            if captured {
                self.emit_op(OpCode::CloseUpvalue, line);
            } else {
                self.emit_op(OpCode::Pop, line);
            }
        }
    }

    /// Emit pops for locals that live in scopes inside the active loop,
    /// without forgetting them at compile time. `flee` and `onwards` jump
    /// past the scope-end code, so their stack slots must be discarded at
    /// the jump site.
    fn discard_loop_locals(&mut self, loop_depth: usize, line: u16) {
        let ctx = self.cur();
        let mut discards = Vec::new();
        for local in ctx.locals.iter().rev() {
            if local.depth <= loop_depth {
                break;
            }
            discards.push(local.is_captured);
        }
        for captured in discards {
            if captured {
                self.emit_op(OpCode::CloseUpvalue, line);
            } else {
                self.emit_op(OpCode::Pop, line);
            }
        }
    }

    fn at_module_top_level(&self) -> bool {
        self.contexts.len() == 1 && self.contexts[0].scope_depth == 0
    }

    fn declare_local(&mut self, name: &str, line: u16) -> Result<(), TmbdlError> {
        let ctx = self.cur();
        for local in ctx.locals.iter().rev() {
            if local.depth < ctx.scope_depth {
                break;
            }
            if local.name == name {
                return Err(TmbdlError::compile_error(
                    format!("A variable named '{}' already exists in this scope", name),
                    line as usize,
                ));
            }
        }
        if ctx.locals.len() >= MAX_SLOTS {
            return Err(TmbdlError::compile_error(
                "Too many local variables in one song".to_string(),
                line as usize,
            ));
        }
        let depth = ctx.scope_depth;
        ctx.locals.push(Local { name: name.to_string(), depth, is_captured: false });
        Ok(())
    }

    fn resolve_local(&self, ctx: usize, name: &str) -> Option<u8> {
        self.contexts[ctx]
            .locals
            .iter()
            .enumerate()
            .rev()
            .find(|(_, local)| local.name == name)
            .map(|(slot, _)| slot as u8)
    }

    /// Upvalue chaining: capture a local of the nearest enclosing function
    /// directly, or chain through each intermediate function's upvalues.
    fn resolve_upvalue(
        &mut self,
        ctx: usize,
        name: &str,
        line: u16,
    ) -> Result<Option<u8>, TmbdlError> {
        if ctx == 0 {
            return Ok(None);
        }
        let parent = ctx - 1;
        if let Some(slot) = self.resolve_local(parent, name) {
            self.contexts[parent].locals[slot as usize].is_captured = true;
            return Ok(Some(self.add_upvalue(ctx, slot, true, line)?));
        }
        if let Some(upvalue) = self.resolve_upvalue(parent, name, line)? {
            return Ok(Some(self.add_upvalue(ctx, upvalue, false, line)?));
        }
        Ok(None)
    }

    fn add_upvalue(
        &mut self,
        ctx: usize,
        index: u8,
        is_local: bool,
        line: u16,
    ) -> Result<u8, TmbdlError> {
        let wanted = UpvalueRef { index, is_local };
        if let Some(existing) = self.contexts[ctx].upvalues.iter().position(|u| *u == wanted) {
            return Ok(existing as u8);
        }
        if self.contexts[ctx].upvalues.len() >= MAX_SLOTS {
            return Err(TmbdlError::compile_error(
                "Too many captured variables in one song".to_string(),
                line as usize,
            ));
        }
        self.contexts[ctx].upvalues.push(wanted);
        Ok((self.contexts[ctx].upvalues.len() - 1) as u8)
    }

    fn compile_variable_load(&mut self, name: &str, line: u16) -> Result<(), TmbdlError> {
        let ctx = self.contexts.len() - 1;
        if let Some(slot) = self.resolve_local(ctx, name) {
            self.emit_op_byte(OpCode::LoadLocal, slot, line);
        } else if let Some(upvalue) = self.resolve_upvalue(ctx, name, line)? {
            self.emit_op_byte(OpCode::GetUpvalue, upvalue, line);
        } else {
            let index = self.make_constant(Constant::str(name), line)?;
            self.emit_op_byte(OpCode::LoadGlobal, index, line);
        }
        Ok(())
    }

    fn compile_variable_store(&mut self, name: &str, line: u16) -> Result<(), TmbdlError> {
        let ctx = self.contexts.len() - 1;
        if let Some(slot) = self.resolve_local(ctx, name) {
            self.emit_op_byte(OpCode::StoreLocal, slot, line);
        } else if let Some(upvalue) = self.resolve_upvalue(ctx, name, line)? {
            self.emit_op_byte(OpCode::SetUpvalue, upvalue, line);
        } else {
            let index = self.make_constant(Constant::str(name), line)?;
            self.emit_op_byte(OpCode::StoreGlobal, index, line);
        }
        Ok(())
    }

    // === Statements ===

    fn compile_stmt(&mut self, stmt: &Stmt) -> Result<(), TmbdlError> {
        let line = stmt.line;
        match &stmt.kind {
            StmtKind::ExprStmt(expr) => {
                self.compile_expr(expr)?;
                self.emit_op(OpCode::Pop, line);
            }

            StmtKind::Let { name, init } => {
                match init {
                    Some(expr) => self.compile_expr(expr)?,
                    None => self.emit_constant(Constant::Null, line)?,
                }
                if self.at_module_top_level() {
                    let index = self.make_constant(Constant::str(name), line)?;
                    self.emit_op_byte(OpCode::StoreGlobal, index, line);
                    self.emit_op(OpCode::Pop, line);
                } else {
                    // the initializer's stack slot becomes the local
                    self.declare_local(name, line)?;
                }
            }

            StmtKind::FuncDef(literal) => {
                if self.at_module_top_level() {
                    self.compile_function(literal)?;
                    let index = self.make_constant(Constant::str(&literal.name), line)?;
                    self.emit_op_byte(OpCode::StoreGlobal, index, line);
                    self.emit_op(OpCode::Pop, line);
                } else {
                    // declare first so the song can call itself through its slot
                    self.declare_local(&literal.name, line)?;
                    self.compile_function(literal)?;
                }
            }

            StmtKind::Return(value) => {
                if self.contexts.len() == 1 {
                    return Err(TmbdlError::compile_error(
                        "Can only answer inside a song".to_string(),
                        line as usize,
                    ));
                }
                match value {
                    Some(expr) => self.compile_expr(expr)?,
                    None => self.emit_constant(Constant::Null, line)?,
                }
                self.emit_op(OpCode::Return, line);
            }

            StmtKind::If { condition, then_branch, else_branch } => {
                self.compile_expr(condition)?;
                let else_jump = self.emit_jump(OpCode::JumpIfFalse, line);
                self.emit_op(OpCode::Pop, line);
                self.compile_block_scoped(then_branch, line)?;
                let end_jump = self.emit_jump(OpCode::Jump, line);
                self.patch_jump(else_jump, line)?;
                self.emit_op(OpCode::Pop, line);
                if let Some(else_branch) = else_branch {
                    self.compile_block_scoped(else_branch, line)?;
                }
                self.patch_jump(end_jump, line)?;
            }

            StmtKind::While { condition, body } => {
                let start = self.cur().chunk.code.len();
                let ctx = self.contexts.len() - 1;
                let depth = self.cur().scope_depth;
                self.loops.push(LoopContext { start, breaks: Vec::new(), ctx, depth });

                self.compile_expr(condition)?;
                let exit_jump = self.emit_jump(OpCode::JumpIfFalse, line);
                self.emit_op(OpCode::Pop, line);
                self.compile_block_scoped(body, line)?;
                self.emit_loop(start, line)?;
                self.patch_jump(exit_jump, line)?;
                self.emit_op(OpCode::Pop, line);

                let finished = self.loops.pop().ok_or_else(|| {
                    TmbdlError::internal("loop context stack underflow".to_string())
                })?;
                for break_jump in finished.breaks {
                    self.patch_jump(break_jump, line)?;
                }
            }

            StmtKind::For { var, iterable, body } => {
                self.begin_scope();
                let depth = self.cur().scope_depth;
                let iter_name = format!("__iter_{}", depth);
                let index_name = format!("__index_{}", depth);

                self.compile_expr(iterable)?;
                self.declare_local(&iter_name, line)?;
                self.emit_constant(Constant::Number(0.0), line)?;
                self.declare_local(&index_name, line)?;
                self.emit_constant(Constant::Null, line)?;
                self.declare_local(var, line)?;

                let head = self.cur().chunk.code.len();
                let ctx = self.contexts.len() - 1;
                let loop_depth = self.cur().scope_depth;
                self.loops.push(LoopContext { start: head, breaks: Vec::new(), ctx, depth: loop_depth });

                self.compile_variable_load(&index_name, line)?;
                self.compile_variable_load(&iter_name, line)?;
                self.emit_op(OpCode::Length, line);
                self.emit_op(OpCode::Less, line);
                let exit_jump = self.emit_jump(OpCode::JumpIfFalse, line);
                self.emit_op(OpCode::Pop, line);

                self.compile_variable_load(&iter_name, line)?;
                self.compile_variable_load(&index_name, line)?;
                self.emit_op(OpCode::IndexGet, line);
                self.compile_variable_store(var, line)?;
                self.emit_op(OpCode::Pop, line);

                self.compile_block_scoped(body, line)?;

                self.compile_variable_load(&index_name, line)?;
                self.emit_constant(Constant::Number(1.0), line)?;
                self.emit_op(OpCode::Add, line);
                self.compile_variable_store(&index_name, line)?;
                self.emit_op(OpCode::Pop, line);
                self.emit_loop(head, line)?;

                self.patch_jump(exit_jump, line)?;
                self.emit_op(OpCode::Pop, line);

                let finished = self.loops.pop().ok_or_else(|| {
                    TmbdlError::internal("loop context stack underflow".to_string())
                })?;
                for break_jump in finished.breaks {
                    self.patch_jump(break_jump, line)?;
                }
                self.end_scope(line);
            }

            StmtKind::Break => match self.loops.last() {
                None => {
                    return Err(TmbdlError::compile_error(
                        "'flee' outside of a loop".to_string(),
                        line as usize,
                    ))
                }
                Some(active) if active.ctx != self.contexts.len() - 1 => {
                    return Err(TmbdlError::compile_error(
                        "Cannot flee across a song boundary".to_string(),
                        line as usize,
                    ))
                }
                Some(active) => {
                    let depth = active.depth;
                    self.discard_loop_locals(depth, line);
                    let jump = self.emit_jump(OpCode::Jump, line);
                    if let Some(active) = self.loops.last_mut() {
                        active.breaks.push(jump);
                    }
                }
            },

            StmtKind::Continue => match self.loops.last() {
                None => {
                    return Err(TmbdlError::compile_error(
                        "'onwards' outside of a loop".to_string(),
                        line as usize,
                    ))
                }
                Some(active) if active.ctx != self.contexts.len() - 1 => {
                    return Err(TmbdlError::compile_error(
                        "Cannot continue across a song boundary".to_string(),
                        line as usize,
                    ))
                }
                Some(active) => {
                    let start = active.start;
                    let depth = active.depth;
                    self.discard_loop_locals(depth, line);
                    self.emit_loop(start, line)?;
                }
            },

            StmtKind::Block(stmts) => {
                self.compile_block_scoped(stmts, line)?;
            }

            StmtKind::Print(expr) => {
                self.compile_expr(expr)?;
                self.emit_op(OpCode::Print, line);
            }

            StmtKind::Debug { label, value } => {
                self.compile_expr(label)?;
                self.compile_expr(value)?;
                self.emit_op(OpCode::EyeOf, line);
            }

            StmtKind::Export { name, value } => {
                if !self.at_module_top_level() {
                    return Err(TmbdlError::compile_error(
                        "'share' is only allowed at the top level of a module".to_string(),
                        line as usize,
                    ));
                }
                self.compile_expr(value)?;
                let index = self.make_constant(Constant::str(name), line)?;
                self.emit_op_byte(OpCode::Export, index, line);
            }

            // The rescue block is not lowered in the bytecode path; the
            // attempt body runs unprotected.
            StmtKind::Try { try_block, .. } => {
                self.compile_block_scoped(try_block, line)?;
            }

            // realm declarations are accepted but produce no code
            StmtKind::Class { .. } => {}
        }
        Ok(())
    }

    fn compile_block_scoped(&mut self, stmts: &[Stmt], line: u16) -> Result<(), TmbdlError> {
        self.begin_scope();
        for stmt in stmts {
            self.compile_stmt(stmt)?;
        }
        self.end_scope(line);
        Ok(())
    }

    /// Compile a nested song: a fresh context, parameters as the first
    /// locals, an unconditional null return terminator, and a MAKE_CLOSURE
    /// in the parent followed by one (is_local, index) descriptor pair per
    /// captured variable.
    fn compile_function(&mut self, literal: &FunctionLiteral) -> Result<(), TmbdlError> {
        let line = literal.line;
        if literal.params.len() > u8::MAX as usize {
            return Err(TmbdlError::compile_error(
                "Too many parameters".to_string(),
                line as usize,
            ));
        }

        self.contexts.push(FunctionContext::new(&literal.name, literal.params.len() as u16));
        self.begin_scope();
        for param in &literal.params {
            self.declare_local(param, line)?;
        }
        for stmt in &literal.body {
            self.compile_stmt(stmt)?;
        }
        let end_line = literal.body.last().map(|s| s.line).unwrap_or(line);
        self.emit_constant(Constant::Null, end_line)?;
        self.emit_op(OpCode::Return, end_line);

        let ctx = self.contexts.pop().ok_or_else(|| {
            TmbdlError::internal("compiler context stack underflow".to_string())
        })?;
        let function = Arc::new(CompiledFunction {
            name: ctx.name,
            arity: ctx.arity,
            upvalue_count: ctx.upvalues.len() as u16,
            chunk: ctx.chunk,
        });

        let index = self.make_constant(Constant::Function(function), line)?;
        self.emit_op_byte(OpCode::MakeClosure, index, line);
        for upvalue in &ctx.upvalues {
            self.emit_byte(upvalue.is_local as u8, line);
            self.emit_byte(upvalue.index, line);
        }
        Ok(())
    }

    // === Expressions ===

    fn compile_expr(&mut self, expr: &Expr) -> Result<(), TmbdlError> {
        let line = expr.line;
        match &expr.kind {
            ExprKind::Null => self.emit_constant(Constant::Null, line)?,
            ExprKind::Bool(b) => self.emit_constant(Constant::Bool(*b), line)?,
            ExprKind::Number(n) => self.emit_constant(Constant::Number(*n), line)?,
            ExprKind::Str(s) => self.emit_constant(Constant::str(s.clone()), line)?,

            ExprKind::Template(parts) => {
                match parts.first() {
                    Some(TemplatePart::Text(text)) => {
                        self.emit_constant(Constant::str(text.clone()), line)?
                    }
                    _ => self.emit_constant(Constant::str(""), line)?,
                }
                for part in parts.iter().skip(1) {
                    match part {
                        TemplatePart::Text(text) => {
                            self.emit_constant(Constant::str(text.clone()), line)?
                        }
                        TemplatePart::Expr(inner) => self.compile_expr(inner)?,
                    }
                    self.emit_op(OpCode::Add, line);
                }
            }

            ExprKind::Array(elements) => {
                if elements.len() > u8::MAX as usize {
                    return Err(TmbdlError::compile_error(
                        "Too many elements in one array literal".to_string(),
                        line as usize,
                    ));
                }
                for element in elements {
                    self.compile_expr(element)?;
                }
                self.emit_op_byte(OpCode::MakeArray, elements.len() as u8, line);
            }

            ExprKind::MapLiteral(entries) => {
                if entries.len() > u8::MAX as usize {
                    return Err(TmbdlError::compile_error(
                        "Too many entries in one map literal".to_string(),
                        line as usize,
                    ));
                }
                for (key, value) in entries {
                    self.compile_expr(key)?;
                    self.compile_expr(value)?;
                }
                self.emit_op_byte(OpCode::MakeObject, entries.len() as u8, line);
            }

            ExprKind::Variable(name) => self.compile_variable_load(name, line)?,

            ExprKind::Assign { name, value } => {
                self.compile_expr(value)?;
                self.compile_variable_store(name, line)?;
            }

            ExprKind::CompoundAssign { name, op, value } => {
                self.compile_variable_load(name, line)?;
                self.compile_expr(value)?;
                self.emit_op(Self::binary_opcode(*op), line);
                self.compile_variable_store(name, line)?;
            }

            ExprKind::Update { name, op, prefix } => {
                self.compile_variable_load(name, line)?;
                if !prefix {
                    self.emit_op(OpCode::Dup, line);
                }
                self.emit_constant(Constant::Number(1.0), line)?;
                match op {
                    UpdateOp::Increment => self.emit_op(OpCode::Add, line),
                    UpdateOp::Decrement => self.emit_op(OpCode::Sub, line),
                }
                self.compile_variable_store(name, line)?;
                if !prefix {
                    // drop the stored value; the duplicated original is the result
                    self.emit_op(OpCode::Pop, line);
                }
            }

            ExprKind::IndexGet { object, index } => {
                self.compile_expr(object)?;
                self.compile_expr(index)?;
                self.emit_op(OpCode::IndexGet, line);
            }

            ExprKind::IndexSet { object, index, value } => {
                self.compile_expr(object)?;
                self.compile_expr(index)?;
                self.compile_expr(value)?;
                self.emit_op(OpCode::IndexSet, line);
            }

            ExprKind::PropGet { object, name } => {
                self.compile_expr(object)?;
                if name == "length" {
                    self.emit_op(OpCode::Length, line);
                } else {
                    let index = self.make_constant(Constant::str(name), line)?;
                    self.emit_op_byte(OpCode::GetProp, index, line);
                }
            }

            ExprKind::PropSet { object, name, value } => {
                self.compile_expr(object)?;
                self.compile_expr(value)?;
                let index = self.make_constant(Constant::str(name), line)?;
                self.emit_op_byte(OpCode::SetProp, index, line);
            }

            ExprKind::Binary { left, op, right } => {
                self.compile_expr(left)?;
                self.compile_expr(right)?;
                self.emit_op(Self::binary_opcode(*op), line);
            }

            ExprKind::Logical { left, op, right } => match op {
                // the conditional jump preserves the left operand, which
                // becomes the result when it short-circuits
                LogicalOp::And => {
                    self.compile_expr(left)?;
                    let end_jump = self.emit_jump(OpCode::JumpIfFalse, line);
                    self.emit_op(OpCode::Pop, line);
                    self.compile_expr(right)?;
                    self.patch_jump(end_jump, line)?;
                }
                LogicalOp::Or => {
                    self.compile_expr(left)?;
                    let rhs_jump = self.emit_jump(OpCode::JumpIfFalse, line);
                    let end_jump = self.emit_jump(OpCode::Jump, line);
                    self.patch_jump(rhs_jump, line)?;
                    self.emit_op(OpCode::Pop, line);
                    self.compile_expr(right)?;
                    self.patch_jump(end_jump, line)?;
                }
            },

            ExprKind::Unary { op, operand } => {
                self.compile_expr(operand)?;
                match op {
                    UnaryOp::Negate => self.emit_op(OpCode::Negate, line),
                    UnaryOp::Not => self.emit_op(OpCode::Not, line),
                }
            }

            ExprKind::Call { callee, args } => {
                if args.len() > u8::MAX as usize {
                    return Err(TmbdlError::compile_error(
                        "Too many call arguments".to_string(),
                        line as usize,
                    ));
                }
                self.compile_expr(callee)?;
                for arg in args {
                    self.compile_expr(arg)?;
                }
                self.emit_op_byte(OpCode::Call, args.len() as u8, line);
            }

            ExprKind::Lambda(literal) => self.compile_function(literal)?,

            ExprKind::Import(path) => {
                let index = self.make_constant(Constant::str(path.clone()), line)?;
                self.emit_op_byte(OpCode::Import, index, line);
            }
        }
        Ok(())
    }

    fn binary_opcode(op: BinaryOp) -> OpCode {
        match op {
            BinaryOp::Add => OpCode::Add,
            BinaryOp::Sub => OpCode::Sub,
            BinaryOp::Mul => OpCode::Mul,
            BinaryOp::Div => OpCode::Div,
            BinaryOp::Mod => OpCode::Mod,
            BinaryOp::Equal => OpCode::Equal,
            BinaryOp::NotEqual => OpCode::NotEqual,
            BinaryOp::Less => OpCode::Less,
            BinaryOp::LessEqual => OpCode::LessEqual,
            BinaryOp::Greater => OpCode::Greater,
            BinaryOp::GreaterEqual => OpCode::GreaterEqual,
        }
    }
}

impl Default for Compiler {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lexer::tokenize;
    use crate::parser::Parser;

    fn compile_source(source: &str) -> Result<Chunk, TmbdlError> {
        let tokens = tokenize(source).unwrap();
        let ast = Parser::new(tokens).parse().unwrap();
        Compiler::new().compile(&ast)
    }

    #[test]
    fn main_chunk_ends_with_halt() {
        let chunk = compile_source("sing 1").unwrap();
        assert_eq!(chunk.code.last().copied(), Some(OpCode::Halt as u8));
        assert_eq!(chunk.code.len(), chunk.lines.len());
    }

    #[test]
    fn break_outside_loop_is_rejected() {
        let err = compile_source("flee").unwrap_err();
        assert!(err.message.contains("flee"));
    }

    #[test]
    fn continue_outside_loop_is_rejected() {
        assert!(compile_source("onwards").is_err());
    }

    #[test]
    fn return_at_top_level_is_rejected() {
        assert!(compile_source("answer 1").is_err());
    }

    #[test]
    fn share_inside_a_song_is_rejected() {
        assert!(compile_source("song f() { share x = 1 }").is_err());
    }

    #[test]
    fn constant_pool_overflow_is_reported() {
        let mut source = String::new();
        for i in 0..300 {
            source.push_str(&format!("sing {}.5\n", i));
        }
        let err = compile_source(&source).unwrap_err();
        assert!(err.message.contains("Too many constants"));
    }

    #[test]
    fn constants_are_shared_between_statements() {
        let chunk = compile_source("sing 7 sing 7 sing 7").unwrap();
        let numbers = chunk
            .constants
            .iter()
            .filter(|c| matches!(c, Constant::Number(n) if *n == 7.0))
            .count();
        assert_eq!(numbers, 1);
    }

    #[test]
    fn sibling_closures_capturing_one_local_share_its_slot() {
        let chunk = compile_source(
            "song pair() {\n\
             ring x = 10\n\
             song getX() { answer x }\n\
             song setX(v) { x = v }\n\
             answer [getX, setX]\n\
             }",
        )
        .unwrap();
        let pair = chunk
            .constants
            .iter()
            .find_map(|c| match c {
                Constant::Function(f) => Some(f),
                _ => None,
            })
            .expect("pair song is interned in the main chunk");
        let inner: Vec<_> = pair
            .chunk
            .constants
            .iter()
            .filter_map(|c| match c {
                Constant::Function(f) => Some(f),
                _ => None,
            })
            .collect();
        assert_eq!(inner.len(), 2);
        for function in inner {
            assert_eq!(function.upvalue_count, 1);
        }
    }

    #[test]
    fn chained_capture_goes_through_the_middle_song() {
        let chunk = compile_source(
            "song outer() {\n\
             ring x = 1\n\
             song middle() {\n\
             song inner() { answer x }\n\
             answer inner\n\
             }\n\
             answer middle\n\
             }",
        )
        .unwrap();
        let outer = chunk
            .constants
            .iter()
            .find_map(|c| match c {
                Constant::Function(f) => Some(f),
                _ => None,
            })
            .unwrap();
        let middle = outer
            .chunk
            .constants
            .iter()
            .find_map(|c| match c {
                Constant::Function(f) => Some(f),
                _ => None,
            })
            .unwrap();
        let inner = middle
            .chunk
            .constants
            .iter()
            .find_map(|c| match c {
                Constant::Function(f) => Some(f),
                _ => None,
            })
            .unwrap();
        // middle captures x from outer's frame; inner chains through middle
        assert_eq!(middle.upvalue_count, 1);
        assert_eq!(inner.upvalue_count, 1);
    }

    #[test]
    fn every_jump_lands_inside_the_chunk() {
        let chunk = compile_source(
            "ring i = 0\n\
             wander (i < 10) {\n\
             i = i + 1\n\
             perhaps (i == 5) { onwards }\n\
             perhaps (i == 8) { flee }\n\
             }",
        )
        .unwrap();
        let mut offset = 0usize;
        while offset < chunk.code.len() {
            let op = OpCode::from_byte(chunk.code[offset]).expect("valid opcode stream");
            match op {
                OpCode::Jump | OpCode::JumpIfFalse | OpCode::JumpIfTrue => {
                    let distance = chunk.code[offset + 1] as usize;
                    assert!(offset + 2 + distance <= chunk.code.len());
                    offset += 2;
                }
                OpCode::Loop => {
                    let distance = chunk.code[offset + 1] as usize;
                    assert!(distance <= offset + 2);
                    offset += 2;
                }
                OpCode::PushConst
                | OpCode::LoadLocal
                | OpCode::StoreLocal
                | OpCode::LoadGlobal
                | OpCode::StoreGlobal
                | OpCode::Call
                | OpCode::MakeArray
                | OpCode::MakeObject
                | OpCode::GetUpvalue
                | OpCode::SetUpvalue
                | OpCode::GetProp
                | OpCode::SetProp
                | OpCode::Import
                | OpCode::Export => offset += 2,
                OpCode::MakeClosure => {
                    let index = chunk.code[offset + 1] as usize;
                    let count = match &chunk.constants[index] {
                        Constant::Function(f) => f.upvalue_count as usize,
                        other => panic!("MAKE_CLOSURE must reference a song, got {:?}", other),
                    };
                    offset += 2 + 2 * count;
                }
                _ => offset += 1,
            }
        }
        assert_eq!(offset, chunk.code.len());
    }

    #[test]
    fn constant_operands_stay_inside_the_pool() {
        let chunk =
            compile_source("ring a = 1 ring b = \"two\" sing a sing b sing `${a}:${b}`").unwrap();
        let mut offset = 0usize;
        while offset < chunk.code.len() {
            let op = OpCode::from_byte(chunk.code[offset]).unwrap();
            match op {
                OpCode::PushConst
                | OpCode::LoadGlobal
                | OpCode::StoreGlobal
                | OpCode::GetProp
                | OpCode::SetProp
                | OpCode::Import
                | OpCode::Export
                | OpCode::MakeClosure => {
                    assert!((chunk.code[offset + 1] as usize) < chunk.constants.len());
                    offset += 2;
                }
                OpCode::LoadLocal
                | OpCode::StoreLocal
                | OpCode::Call
                | OpCode::MakeArray
                | OpCode::MakeObject
                | OpCode::GetUpvalue
                | OpCode::SetUpvalue
                | OpCode::Jump
                | OpCode::JumpIfFalse
                | OpCode::JumpIfTrue
                | OpCode::Loop => offset += 2,
                _ => offset += 1,
            }
        }
    }
}
