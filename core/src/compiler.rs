use crate::ast::{AssignTarget, BinaryOp, Node, UnaryOp};
use crate::bytecode::{Chunk, Function, OpCode, UNRESOLVED};
use crate::runtime::{RuntimeError, Value};
use std::rc::Rc;

/// Pending jumps of the innermost enclosing loop.
#[derive(Default)]
struct LoopContext {
    breaks: Vec<usize>,
    continues: Vec<usize>,
}

/// Lowers the VM subset of the AST to bytecode. Every node leaves exactly
/// one value on the stack; statements leave `null`.
pub struct Compiler {
    pub chunk: Chunk,
    loops: Vec<LoopContext>,
}

impl Default for Compiler {
    fn default() -> Self {
        Self::new()
    }
}

impl Compiler {
    pub fn new() -> Self {
        Self {
            chunk: Chunk::new(),
            loops: Vec::new(),
        }
    }

    pub fn compile_program(nodes: &[Node]) -> Result<Function, RuntimeError> {
        let mut compiler = Compiler::new();
        compiler.sequence(nodes)?;
        compiler.chunk.write(OpCode::Return);
        Ok(Function {
            name: "<main>".to_string(),
            params: Vec::new(),
            chunk: compiler.chunk,
        })
    }

    fn sequence(&mut self, nodes: &[Node]) -> Result<(), RuntimeError> {
        if nodes.is_empty() {
            self.chunk.write(OpCode::LoadConst(Value::Null));
        }
        for (i, node) in nodes.iter().enumerate() {
            self.visit(node)?;
            if i + 1 < nodes.len() {
                self.chunk.write(OpCode::Pop);
            }
        }
        Ok(())
    }

    fn visit(&mut self, node: &Node) -> Result<(), RuntimeError> {
        match node {
            Node::Number(n) => {
                self.chunk.write(OpCode::LoadConst(Value::Number(*n)));
            }
            Node::Str(s) => {
                self.chunk.write(OpCode::LoadConst(Value::String(s.clone())));
            }
            Node::Boolean(b) => {
                self.chunk.write(OpCode::LoadConst(Value::bool(*b)));
            }
            Node::Null => {
                self.chunk.write(OpCode::LoadConst(Value::Null));
            }
            Node::Identifier(name) => {
                self.chunk.write(OpCode::LoadVar(name.clone()));
            }
            Node::Unary { op, operand } => {
                self.visit(operand)?;
                self.chunk.write(match op {
                    UnaryOp::Not => OpCode::Not,
                    UnaryOp::Neg => OpCode::Neg,
                });
            }
            Node::Binary { op, left, right } => {
                let opcode = match op {
                    BinaryOp::Add => OpCode::Add,
                    BinaryOp::Sub => OpCode::Sub,
                    BinaryOp::Mul => OpCode::Mul,
                    BinaryOp::Div => OpCode::Div,
                    BinaryOp::Mod => OpCode::Mod,
                    BinaryOp::Eq => OpCode::Eq,
                    BinaryOp::Ne => OpCode::Ne,
                    BinaryOp::Lt => OpCode::Lt,
                    BinaryOp::Gt => OpCode::Gt,
                    BinaryOp::Le => OpCode::Le,
                    BinaryOp::Ge => OpCode::Ge,
                    BinaryOp::And | BinaryOp::Or | BinaryOp::Coalesce => {
                        return Err(RuntimeError::UnsupportedNode(format!(
                            "Binary {}",
                            op.symbol()
                        )));
                    }
                };
                self.visit(left)?;
                self.visit(right)?;
                self.chunk.write(opcode);
            }
            Node::Assign { target, value } => match target {
                AssignTarget::Variable(name) => {
                    self.visit(value)?;
                    self.chunk.write(OpCode::StoreVar(name.clone()));
                    self.chunk.write(OpCode::LoadVar(name.clone()));
                }
                AssignTarget::Member { .. } => {
                    return Err(RuntimeError::UnsupportedNode("member assignment".into()));
                }
            },
            Node::VarDecl { name, value, .. } => {
                self.visit(value)?;
                self.chunk.write(OpCode::DeclareVar(name.clone()));
                self.chunk.write(OpCode::LoadConst(Value::Null));
            }
            Node::Print(value) => {
                self.visit(value)?;
                self.chunk.write(OpCode::Print);
                self.chunk.write(OpCode::LoadConst(Value::Null));
            }
            Node::Block(stmts) => self.sequence(stmts)?,
            Node::If {
                condition,
                then_branch,
                else_branch,
            } => {
                self.visit(condition)?;
                let jump_idx = self.chunk.write(OpCode::JumpIfFalse(UNRESOLVED));
                self.visit(then_branch)?;
                let else_jump_idx = self.chunk.write(OpCode::Jump(UNRESOLVED));

                self.chunk.patch_jump(jump_idx, self.chunk.len());
                match else_branch {
                    Some(other) => self.visit(other)?,
                    None => {
                        self.chunk.write(OpCode::LoadConst(Value::Null));
                    }
                }
                self.chunk.patch_jump(else_jump_idx, self.chunk.len());
            }
            Node::While { condition, body } => {
                let loop_start_idx = self.chunk.write(OpCode::Label("loop_start".into()));
                self.visit(condition)?;
                let exit_idx = self.chunk.write(OpCode::JumpIfFalse(UNRESOLVED));

                self.loops.push(LoopContext::default());
                self.visit(body)?;
                self.chunk.write(OpCode::Pop);
                self.chunk.write(OpCode::Jump(loop_start_idx));

                let end_idx = self.chunk.write(OpCode::Label("loop_end".into()));
                self.chunk.patch_jump(exit_idx, end_idx);
                self.close_loop(end_idx, loop_start_idx);
                self.chunk.write(OpCode::LoadConst(Value::Null));
            }
            Node::For {
                init,
                condition,
                increment,
                body,
            } => {
                if let Some(init) = init {
                    self.visit(init)?;
                    self.chunk.write(OpCode::Pop);
                }
                let loop_start_idx = self.chunk.write(OpCode::Label("loop_start".into()));
                let exit_idx = match condition {
                    Some(cond) => {
                        self.visit(cond)?;
                        Some(self.chunk.write(OpCode::JumpIfFalse(UNRESOLVED)))
                    }
                    None => None,
                };

                self.loops.push(LoopContext::default());
                self.visit(body)?;
                self.chunk.write(OpCode::Pop);

                let continue_idx = self.chunk.write(OpCode::Label("loop_continue".into()));
                if let Some(inc) = increment {
                    self.visit(inc)?;
                    self.chunk.write(OpCode::Pop);
                }
                self.chunk.write(OpCode::Jump(loop_start_idx));

                let end_idx = self.chunk.write(OpCode::Label("loop_end".into()));
                if let Some(exit_idx) = exit_idx {
                    self.chunk.patch_jump(exit_idx, end_idx);
                }
                self.close_loop(end_idx, continue_idx);
                self.chunk.write(OpCode::LoadConst(Value::Null));
            }
            Node::Break => {
                let idx = self.chunk.write(OpCode::Jump(UNRESOLVED));
                self.current_loop("break")?.breaks.push(idx);
            }
            Node::Continue => {
                let idx = self.chunk.write(OpCode::Jump(UNRESOLVED));
                self.current_loop("continue")?.continues.push(idx);
            }
            Node::Return(value) => {
                match value {
                    Some(v) => self.visit(v)?,
                    None => {
                        self.chunk.write(OpCode::LoadConst(Value::Null));
                    }
                }
                self.chunk.write(OpCode::Return);
            }
            Node::Lambda(def) => {
                // Lambdas get their own chunk and loop stack.
                let mut func_compiler = Compiler::new();
                func_compiler.visit(&def.body)?;
                func_compiler.chunk.write(OpCode::Return);

                let func = Function {
                    name: "<lambda>".to_string(),
                    params: def.params.clone(),
                    chunk: func_compiler.chunk,
                };
                self.chunk
                    .write(OpCode::LoadConst(Value::Compiled(Rc::new(func))));
            }
            Node::Call { callee, args } => {
                for arg in args {
                    self.visit(arg)?;
                }
                self.visit(callee)?;
                self.chunk.write(OpCode::Call(args.len()));
            }
            other => return Err(RuntimeError::UnsupportedNode(other.kind_name().to_string())),
        }
        Ok(())
    }

    fn current_loop(&mut self, keyword: &str) -> Result<&mut LoopContext, RuntimeError> {
        self.loops.last_mut().ok_or_else(|| {
            RuntimeError::ControlFlowMisuse(format!("{} used outside of a loop", keyword))
        })
    }

    fn close_loop(&mut self, break_target: usize, continue_target: usize) {
        if let Some(ctx) = self.loops.pop() {
            for idx in ctx.breaks {
                self.chunk.patch_jump(idx, break_target);
            }
            for idx in ctx.continues {
                self.chunk.patch_jump(idx, continue_target);
            }
        }
    }
}
