/*
 * Copyright (c) 2026 Mohamad Al-Zawahreh (dba Sovereign Systems).
 *
 * WASM Native Code Generator for W++.
 *
 * Compiles the integer subset of the W++ AST directly to a WASM module via
 * `wasm-encoder`. This is a parallel backend to the bytecode compiler
 * (compiler.rs); the module is JIT-compiled and run by wasm_runner.rs.
 *
 * LICENSE: DUAL-LICENSED (AGPLv3 or COMMERCIAL).
 *
 * PATENT NOTICE: Protected by US Patent App #63/935,467.
 * NO IMPLIED LICENSE to rights of Mohamad Al-Zawahreh or Sovereign Systems.
 */

use crate::ast::{AssignTarget, BinaryOp, LambdaDef, Node, SwitchCase, UnaryOp};
use crate::runtime::RuntimeError;
use std::borrow::Cow;
use std::collections::HashMap;
use std::fmt;
use tracing::debug;
use wasm_encoder::{
    BlockType, CodeSection, ConstExpr, DataSection, ElementSection, Elements, EntityType,
    ExportKind, ExportSection, Function, FunctionSection, ImportSection, Instruction,
    MemorySection, MemoryType, Module, RefType, TableSection, TableType, TypeSection, ValType,
};

// =============================================================================
// Error Types
// =============================================================================

#[derive(Debug, Clone)]
pub struct WasmCompileError {
    pub error: RuntimeError,
    pub context: String,
}

impl WasmCompileError {
    fn new(error: RuntimeError, context: &str) -> Self {
        Self {
            error,
            context: context.to_string(),
        }
    }

    fn unsupported(node: &Node, context: &str) -> Self {
        Self::new(RuntimeError::UnsupportedNode(node.kind_name().to_string()), context)
    }
}

impl fmt::Display for WasmCompileError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "WASM compile error: {} ({})", self.error, self.context)
    }
}

impl std::error::Error for WasmCompileError {}

impl From<WasmCompileError> for RuntimeError {
    fn from(err: WasmCompileError) -> Self {
        err.error
    }
}

// =============================================================================
// Module Layout
// =============================================================================

/// Every W++ value is an `i32` in native code. Booleans are 0/1, null is 0,
/// functions are slots in table 0 and futures are host handles.
///
/// Function index space:
///   0..IMPORT_COUNT       host imports from `HOST_MODULE`
///   MAIN_FUNC_IDX         the program body, exported as `ENTRY_EXPORT`
///   MAIN_FUNC_IDX + 1 + n lifted lambda n, also table slot n
pub const HOST_MODULE: &str = "wpp_host";
pub const ENTRY_EXPORT: &str = "main";
pub const MEMORY_EXPORT: &str = "memory";

pub const IMPORT_PRINT_INT: u32 = 0;
pub const IMPORT_PRINT_STR: u32 = 1;
pub const IMPORT_FUTURE_RESOLVE: u32 = 2;
pub const IMPORT_FUTURE_AWAIT: u32 = 3;
pub const IMPORT_DIV_ZERO: u32 = 4;
const IMPORT_COUNT: u32 = 5;
const MAIN_FUNC_IDX: u32 = IMPORT_COUNT;

/// String literals live in linear memory from here on.
const STRING_MEMORY_START: i32 = 1024;

// =============================================================================
// Local Variable Tracking
// =============================================================================

struct LocalScope {
    locals: HashMap<String, u32>,
    next_local: u32,
    temps: u32,
}

impl LocalScope {
    fn with_params(params: &[String]) -> Self {
        let locals = params
            .iter()
            .enumerate()
            .map(|(i, name)| (name.clone(), i as u32))
            .collect();
        Self {
            locals,
            next_local: params.len() as u32,
            temps: 0,
        }
    }

    /// Get or allocate a local variable index for the given name.
    fn get_or_alloc(&mut self, name: &str) -> u32 {
        if let Some(&idx) = self.locals.get(name) {
            idx
        } else {
            let idx = self.next_local;
            self.locals.insert(name.to_string(), idx);
            self.next_local += 1;
            idx
        }
    }

    fn get(&self, name: &str) -> Option<u32> {
        self.locals.get(name).copied()
    }

    /// A fresh scratch local. `$` keeps it out of the identifier namespace.
    fn temp(&mut self) -> u32 {
        self.temps += 1;
        let name = format!("$t{}", self.temps);
        self.get_or_alloc(&name)
    }

    fn extra_local_count(&self, param_count: u32) -> u32 {
        self.next_local.saturating_sub(param_count)
    }
}

// =============================================================================
// Function Compilation Context
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LabelKind {
    Plain,
    Break,
    Continue,
}

struct FuncContext {
    scope: LocalScope,
    param_count: u32,
    instructions: Vec<Instruction<'static>>,
    labels: Vec<LabelKind>,
    is_async: bool,
}

impl FuncContext {
    fn new(params: &[String], is_async: bool) -> Self {
        Self {
            scope: LocalScope::with_params(params),
            param_count: params.len() as u32,
            instructions: Vec::new(),
            labels: Vec::new(),
            is_async,
        }
    }

    fn emit(&mut self, instr: Instruction<'static>) {
        self.instructions.push(instr);
    }

    fn open(&mut self, instr: Instruction<'static>, kind: LabelKind) {
        self.instructions.push(instr);
        self.labels.push(kind);
    }

    fn close(&mut self) {
        self.instructions.push(Instruction::End);
        self.labels.pop();
    }

    /// Relative `br` depth of the innermost label of `kind`.
    fn depth_of(&self, kind: LabelKind) -> Option<u32> {
        self.labels
            .iter()
            .rev()
            .position(|k| *k == kind)
            .map(|p| p as u32)
    }

    /// Return the value on top of the stack, wrapping it in a future first
    /// when compiling an async lambda.
    fn emit_return(&mut self) {
        if self.is_async {
            self.emit(Instruction::Call(IMPORT_FUTURE_RESOLVE));
        }
        self.emit(Instruction::Return);
    }
}

// =============================================================================
// Code Generator
// =============================================================================

pub struct WasmCodegen {
    types: Vec<(u32, u32)>,
    type_cache: HashMap<(u32, u32), u32>,
    lambdas: Vec<Option<(u32, FuncContext)>>,
    data_segments: Vec<(i32, Vec<u8>)>,
    next_data: i32,
}

impl Default for WasmCodegen {
    fn default() -> Self {
        Self::new()
    }
}

impl WasmCodegen {
    pub fn new() -> Self {
        Self {
            types: Vec::new(),
            type_cache: HashMap::new(),
            lambdas: Vec::new(),
            data_segments: Vec::new(),
            next_data: STRING_MEMORY_START,
        }
    }

    /// Compile a program to a complete WASM binary.
    pub fn compile_to_bytes(program: &[Node]) -> Result<Vec<u8>, WasmCompileError> {
        WasmCodegen::new().compile(program)
    }

    pub fn compile(mut self, program: &[Node]) -> Result<Vec<u8>, WasmCompileError> {
        // Import types first so their indices are stable.
        let print_int = self.type_index(1, 0);
        let print_str = self.type_index(2, 0);
        let unary = self.type_index(1, 1);
        let div_zero = self.type_index(0, 0);
        let import_types = [print_int, print_str, unary, unary, div_zero];

        let main_type = self.type_index(0, 1);
        let mut main = FuncContext::new(&[], false);
        for node in program {
            self.compile_stmt(&mut main, node)?;
        }
        main.emit(Instruction::I32Const(0));
        main.emit(Instruction::End);

        let mut lambdas = Vec::with_capacity(self.lambdas.len());
        for (slot, lambda) in self.lambdas.drain(..).enumerate() {
            let lambda = lambda.ok_or_else(|| {
                WasmCompileError::new(
                    RuntimeError::VmFault(format!("lambda slot {} was never filled", slot)),
                    "emit_module",
                )
            })?;
            lambdas.push(lambda);
        }
        debug!(
            lambdas = lambdas.len(),
            strings = self.data_segments.len(),
            "emitting native module"
        );
        Ok(self.emit_module(&import_types, (main_type, main), &lambdas))
    }

    /// Deduplicated `(i32 x params) -> (i32 x results)` signature.
    fn type_index(&mut self, params: u32, results: u32) -> u32 {
        if let Some(&idx) = self.type_cache.get(&(params, results)) {
            return idx;
        }
        let idx = self.types.len() as u32;
        self.types.push((params, results));
        self.type_cache.insert((params, results), idx);
        idx
    }

    fn intern_string(&mut self, text: &str) -> (i32, i32) {
        let offset = self.next_data;
        let bytes = text.as_bytes().to_vec();
        let len = bytes.len() as i32;
        self.data_segments.push((offset, bytes));
        self.next_data += len;
        (offset, len)
    }

    // -------------------------------------------------------------------------
    // Statements: leave nothing on the stack
    // -------------------------------------------------------------------------

    fn compile_stmt(&mut self, ctx: &mut FuncContext, node: &Node) -> Result<(), WasmCompileError> {
        match node {
            Node::VarDecl { name, value, .. } => {
                self.compile_expr(ctx, value)?;
                let idx = ctx.scope.get_or_alloc(name);
                ctx.emit(Instruction::LocalSet(idx));
            }
            Node::Assign {
                target: AssignTarget::Variable(name),
                value,
            } => {
                self.compile_expr(ctx, value)?;
                let idx = ctx.scope.get_or_alloc(name);
                ctx.emit(Instruction::LocalSet(idx));
            }
            Node::Print(value) => {
                if let Node::Str(text) = value.as_ref() {
                    let (ptr, len) = self.intern_string(text);
                    ctx.emit(Instruction::I32Const(ptr));
                    ctx.emit(Instruction::I32Const(len));
                    ctx.emit(Instruction::Call(IMPORT_PRINT_STR));
                } else {
                    self.compile_expr(ctx, value)?;
                    ctx.emit(Instruction::Call(IMPORT_PRINT_INT));
                }
            }
            Node::Block(stmts) => {
                for stmt in stmts {
                    self.compile_stmt(ctx, stmt)?;
                }
            }
            Node::If {
                condition,
                then_branch,
                else_branch,
            } => {
                self.compile_expr(ctx, condition)?;
                ctx.open(Instruction::If(BlockType::Empty), LabelKind::Plain);
                self.compile_stmt(ctx, then_branch)?;
                if let Some(else_branch) = else_branch {
                    ctx.emit(Instruction::Else);
                    self.compile_stmt(ctx, else_branch)?;
                }
                ctx.close();
            }
            Node::While { condition, body } => {
                self.compile_loop(ctx, Some(condition), None, body)?;
            }
            Node::For {
                init,
                condition,
                increment,
                body,
            } => {
                if let Some(init) = init {
                    self.compile_stmt(ctx, init)?;
                }
                self.compile_loop(ctx, condition.as_deref(), increment.as_deref(), body)?;
            }
            Node::Switch {
                discriminant,
                cases,
                default,
            } => {
                self.compile_switch(ctx, discriminant, cases, default.as_deref())?;
            }
            Node::Break => {
                let depth = ctx.depth_of(LabelKind::Break).ok_or_else(|| {
                    WasmCompileError::new(
                        RuntimeError::ControlFlowMisuse("break outside of a loop".to_string()),
                        "compile_stmt::break",
                    )
                })?;
                ctx.emit(Instruction::Br(depth));
            }
            Node::Continue => {
                let depth = ctx.depth_of(LabelKind::Continue).ok_or_else(|| {
                    WasmCompileError::new(
                        RuntimeError::ControlFlowMisuse("continue outside of a loop".to_string()),
                        "compile_stmt::continue",
                    )
                })?;
                ctx.emit(Instruction::Br(depth));
            }
            Node::Return(value) => {
                match value {
                    Some(value) => self.compile_expr(ctx, value)?,
                    None => ctx.emit(Instruction::I32Const(0)),
                }
                ctx.emit_return();
            }
            Node::Throw(_)
            | Node::TryCatch { .. }
            | Node::Import(_)
            | Node::Entity(_)
            | Node::Alter { .. }
            | Node::Assign { .. } => {
                return Err(WasmCompileError::unsupported(node, "compile_stmt"));
            }
            expr => {
                self.compile_expr(ctx, expr)?;
                ctx.emit(Instruction::Drop);
            }
        }
        Ok(())
    }

    /// Shared lowering for `while` and `for`:
    ///
    /// ```text
    /// block            ;; break target
    ///   loop
    ///     <cond> i32.eqz br_if 1
    ///     block        ;; continue target
    ///       <body>
    ///     end
    ///     <increment>
    ///     br 0
    ///   end
    /// end
    /// ```
    fn compile_loop(
        &mut self,
        ctx: &mut FuncContext,
        condition: Option<&Node>,
        increment: Option<&Node>,
        body: &Node,
    ) -> Result<(), WasmCompileError> {
        ctx.open(Instruction::Block(BlockType::Empty), LabelKind::Break);
        ctx.open(Instruction::Loop(BlockType::Empty), LabelKind::Plain);
        if let Some(condition) = condition {
            self.compile_expr(ctx, condition)?;
            ctx.emit(Instruction::I32Eqz);
            ctx.emit(Instruction::BrIf(1));
        }
        ctx.open(Instruction::Block(BlockType::Empty), LabelKind::Continue);
        self.compile_stmt(ctx, body)?;
        ctx.close();
        if let Some(increment) = increment {
            self.compile_stmt(ctx, increment)?;
        }
        ctx.emit(Instruction::Br(0));
        ctx.close();
        ctx.close();
        Ok(())
    }

    /// The first matching case runs; `break` leaves the switch.
    fn compile_switch(
        &mut self,
        ctx: &mut FuncContext,
        discriminant: &Node,
        cases: &[SwitchCase],
        default: Option<&[Node]>,
    ) -> Result<(), WasmCompileError> {
        let subject = ctx.scope.temp();
        self.compile_expr(ctx, discriminant)?;
        ctx.emit(Instruction::LocalSet(subject));

        ctx.open(Instruction::Block(BlockType::Empty), LabelKind::Break);
        for case in cases {
            ctx.emit(Instruction::LocalGet(subject));
            self.compile_expr(ctx, &case.value)?;
            ctx.emit(Instruction::I32Eq);
            ctx.open(Instruction::If(BlockType::Empty), LabelKind::Plain);
            for stmt in &case.body {
                self.compile_stmt(ctx, stmt)?;
            }
            ctx.emit(Instruction::Br(1));
            ctx.close();
        }
        for stmt in default.unwrap_or_default() {
            self.compile_stmt(ctx, stmt)?;
        }
        ctx.close();
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Expressions: leave exactly one i32 on the stack
    // -------------------------------------------------------------------------

    fn compile_expr(&mut self, ctx: &mut FuncContext, node: &Node) -> Result<(), WasmCompileError> {
        match node {
            Node::Number(n) => {
                if n.fract() != 0.0 || *n < i32::MIN as f64 || *n > i32::MAX as f64 {
                    return Err(WasmCompileError::new(
                        RuntimeError::TypeMismatch(format!(
                            "native code only supports 32-bit integers, got {}",
                            n
                        )),
                        "compile_expr::number",
                    ));
                }
                ctx.emit(Instruction::I32Const(*n as i32));
            }
            Node::Boolean(b) => ctx.emit(Instruction::I32Const(*b as i32)),
            Node::Null => ctx.emit(Instruction::I32Const(0)),
            Node::Str(_) => {
                return Err(WasmCompileError::new(
                    RuntimeError::TypeMismatch(
                        "strings are only supported as print arguments".to_string(),
                    ),
                    "compile_expr::string",
                ));
            }
            Node::Identifier(name) => {
                let idx = ctx.scope.get(name).ok_or_else(|| {
                    WasmCompileError::new(
                        RuntimeError::UndefinedVariable(name.clone()),
                        "compile_expr::identifier",
                    )
                })?;
                ctx.emit(Instruction::LocalGet(idx));
            }
            Node::Unary { op, operand } => match op {
                UnaryOp::Not => {
                    self.compile_expr(ctx, operand)?;
                    ctx.emit(Instruction::I32Eqz);
                }
                UnaryOp::Neg => {
                    ctx.emit(Instruction::I32Const(0));
                    self.compile_expr(ctx, operand)?;
                    ctx.emit(Instruction::I32Sub);
                }
            },
            Node::Binary { op, left, right } => self.compile_binary(ctx, *op, left, right)?,
            Node::Assign {
                target: AssignTarget::Variable(name),
                value,
            } => {
                self.compile_expr(ctx, value)?;
                let idx = ctx.scope.get_or_alloc(name);
                ctx.emit(Instruction::LocalTee(idx));
            }
            Node::Lambda(def) => {
                let slot = self.compile_lambda(def, false)?;
                ctx.emit(Instruction::I32Const(slot as i32));
            }
            Node::AsyncLambda(def) => {
                let slot = self.compile_lambda(def, true)?;
                ctx.emit(Instruction::I32Const(slot as i32));
            }
            Node::Call { callee, args } => {
                for arg in args {
                    self.compile_expr(ctx, arg)?;
                }
                self.compile_expr(ctx, callee)?;
                let type_index = self.type_index(args.len() as u32, 1);
                ctx.emit(Instruction::CallIndirect {
                    type_index,
                    table_index: 0,
                });
            }
            Node::Await(inner) => {
                self.compile_expr(ctx, inner)?;
                ctx.emit(Instruction::Call(IMPORT_FUTURE_AWAIT));
            }
            other => return Err(WasmCompileError::unsupported(other, "compile_expr")),
        }
        Ok(())
    }

    fn compile_binary(
        &mut self,
        ctx: &mut FuncContext,
        op: BinaryOp,
        left: &Node,
        right: &Node,
    ) -> Result<(), WasmCompileError> {
        match op {
            BinaryOp::And | BinaryOp::Or => {
                self.compile_expr(ctx, left)?;
                ctx.emit(Instruction::I32Const(0));
                ctx.emit(Instruction::I32Ne);
                self.compile_expr(ctx, right)?;
                ctx.emit(Instruction::I32Const(0));
                ctx.emit(Instruction::I32Ne);
                ctx.emit(if op == BinaryOp::And {
                    Instruction::I32And
                } else {
                    Instruction::I32Or
                });
                return Ok(());
            }
            BinaryOp::Coalesce => {
                return Err(WasmCompileError::new(
                    RuntimeError::UnsupportedNode(format!("Binary {}", op.symbol())),
                    "compile_binary",
                ));
            }
            _ => {}
        }

        self.compile_expr(ctx, left)?;
        self.compile_expr(ctx, right)?;
        let instr = match op {
            BinaryOp::Add => Instruction::I32Add,
            BinaryOp::Sub => Instruction::I32Sub,
            BinaryOp::Mul => Instruction::I32Mul,
            BinaryOp::Div | BinaryOp::Mod => {
                // A zero divisor reports to the host before trapping.
                let divisor = ctx.scope.temp();
                ctx.emit(Instruction::LocalTee(divisor));
                ctx.emit(Instruction::I32Eqz);
                ctx.open(Instruction::If(BlockType::Empty), LabelKind::Plain);
                ctx.emit(Instruction::Call(IMPORT_DIV_ZERO));
                ctx.emit(Instruction::Unreachable);
                ctx.close();
                ctx.emit(Instruction::LocalGet(divisor));
                if op == BinaryOp::Div {
                    Instruction::I32DivS
                } else {
                    Instruction::I32RemS
                }
            }
            BinaryOp::Eq => Instruction::I32Eq,
            BinaryOp::Ne => Instruction::I32Ne,
            BinaryOp::Lt => Instruction::I32LtS,
            BinaryOp::Gt => Instruction::I32GtS,
            BinaryOp::Le => Instruction::I32LeS,
            BinaryOp::Ge => Instruction::I32GeS,
            BinaryOp::And | BinaryOp::Or | BinaryOp::Coalesce => {
                return Err(WasmCompileError::new(
                    RuntimeError::UnsupportedNode(format!("Binary {}", op.symbol())),
                    "compile_binary",
                ));
            }
        };
        ctx.emit(instr);
        Ok(())
    }

    /// Lift a lambda into its own function and return its table slot.
    /// Lambdas see only their parameters and their own locals.
    fn compile_lambda(&mut self, def: &LambdaDef, is_async: bool) -> Result<u32, WasmCompileError> {
        let slot = self.lambdas.len();
        self.lambdas.push(None);

        let type_idx = self.type_index(def.params.len() as u32, 1);
        let mut ctx = FuncContext::new(&def.params, is_async);
        match &def.body {
            Node::Block(stmts) => {
                for stmt in stmts {
                    self.compile_stmt(&mut ctx, stmt)?;
                }
                ctx.emit(Instruction::I32Const(0));
            }
            expr => self.compile_expr(&mut ctx, expr)?,
        }
        if is_async {
            ctx.emit(Instruction::Call(IMPORT_FUTURE_RESOLVE));
        }
        ctx.emit(Instruction::End);

        self.lambdas[slot] = Some((type_idx, ctx));
        Ok(slot as u32)
    }

    // -------------------------------------------------------------------------
    // Module Emission
    // -------------------------------------------------------------------------

    fn emit_module(
        &self,
        import_types: &[u32],
        main: (u32, FuncContext),
        lambdas: &[(u32, FuncContext)],
    ) -> Vec<u8> {
        let mut module = Module::new();

        // --- Type Section ---
        let mut types = TypeSection::new();
        for &(params, results) in &self.types {
            types.ty().function(
                (0..params).map(|_| ValType::I32),
                (0..results).map(|_| ValType::I32),
            );
        }
        module.section(&types);

        // --- Import Section ---
        let mut imports = ImportSection::new();
        let names = [
            "print_int",
            "print_str",
            "future_resolve",
            "future_await",
            "div_zero",
        ];
        for (name, &ty) in names.iter().zip(import_types) {
            imports.import(HOST_MODULE, name, EntityType::Function(ty));
        }
        module.section(&imports);

        // --- Function Section ---
        let mut functions = FunctionSection::new();
        functions.function(main.0);
        for (ty, _) in lambdas {
            functions.function(*ty);
        }
        module.section(&functions);

        // --- Table Section (lambda slots) ---
        // Always present: `call_indirect` needs table 0 even with no lambdas.
        let mut tables = TableSection::new();
        tables.table(TableType {
            element_type: RefType::FUNCREF,
            minimum: lambdas.len() as u64,
            maximum: Some(lambdas.len() as u64),
            table64: false,
            shared: false,
        });
        module.section(&tables);

        // --- Memory Section ---
        let mut memories = MemorySection::new();
        memories.memory(MemoryType {
            minimum: 1,
            maximum: Some(16),
            memory64: false,
            shared: false,
            page_size_log2: None,
        });
        module.section(&memories);

        // --- Export Section ---
        let mut exports = ExportSection::new();
        exports.export(MEMORY_EXPORT, ExportKind::Memory, 0);
        exports.export(ENTRY_EXPORT, ExportKind::Func, MAIN_FUNC_IDX);
        module.section(&exports);

        // --- Element Section ---
        if !lambdas.is_empty() {
            let indices: Vec<u32> = (0..lambdas.len() as u32)
                .map(|slot| MAIN_FUNC_IDX + 1 + slot)
                .collect();
            let mut elements = ElementSection::new();
            elements.active(
                Some(0),
                &ConstExpr::i32_const(0),
                Elements::Functions(Cow::Borrowed(&indices)),
            );
            module.section(&elements);
        }

        // --- Code Section ---
        let mut codes = CodeSection::new();
        for ctx in std::iter::once(&main.1).chain(lambdas.iter().map(|(_, ctx)| ctx)) {
            let extra_locals = ctx.scope.extra_local_count(ctx.param_count);
            let locals: Vec<(u32, ValType)> = if extra_locals > 0 {
                vec![(extra_locals, ValType::I32)]
            } else {
                vec![]
            };
            let mut func = Function::new(locals);
            for instr in &ctx.instructions {
                func.instruction(instr);
            }
            codes.function(&func);
        }
        module.section(&codes);

        // --- Data Section (string constants) ---
        if !self.data_segments.is_empty() {
            let mut data = DataSection::new();
            for (offset, bytes) in &self.data_segments {
                data.active(0, &ConstExpr::i32_const(*offset), bytes.iter().copied());
            }
            module.section(&data);
        }

        module.finish()
    }
}
