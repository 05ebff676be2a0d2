use crate::runtime::Value;

#[derive(Debug, Clone, PartialEq)]
pub enum OpCode {
    // Stack
    LoadConst(Value),
    Pop,

    // Arithmetic
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Neg,

    // Comparison
    Eq,
    Ne,
    Lt,
    Gt,
    Le,
    Ge,
    Not,

    // Variables
    LoadVar(String),
    StoreVar(String),
    DeclareVar(String),

    // Control Flow
    Jump(usize),
    JumpIfFalse(usize),
    Label(String),

    // Functions
    Call(usize), // Argument count
    Return,

    // System
    Print,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Chunk {
    pub code: Vec<OpCode>,
}

impl Chunk {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn write(&mut self, op: OpCode) -> usize {
        self.code.push(op);
        self.code.len() - 1
    }

    /// Rewrites the jump at `at` to land on `target`.
    pub fn patch_jump(&mut self, at: usize, target: usize) {
        match &mut self.code[at] {
            OpCode::Jump(t) | OpCode::JumpIfFalse(t) => *t = target,
            _ => {}
        }
    }

    pub fn len(&self) -> usize {
        self.code.len()
    }

    pub fn is_empty(&self) -> bool {
        self.code.is_empty()
    }
}

/// A compiled unit: the program entry or a lifted lambda.
#[derive(Debug, Clone, PartialEq)]
pub struct Function {
    pub name: String,
    pub params: Vec<String>,
    pub chunk: Chunk,
}

/// Jump placeholder written before its target is known.
pub const UNRESOLVED: usize = usize::MAX;
