use crate::bytecode::{Function, OpCode};
use crate::runtime::{Printer, RuntimeError, Value};
use std::collections::HashMap;
use std::rc::Rc;
use tracing::trace;

pub struct CallFrame {
    pub ip: usize,
    pub function: Rc<Function>,
    /// Stack height at entry; the frame's temporaries live above it.
    pub base: usize,
    pub locals: HashMap<String, Value>,
}

/// Stack machine for compiled programs. Top-level code reads and writes
/// `globals`; calls get a fresh `locals` map that falls back to globals.
pub struct VM {
    pub stack: Vec<Value>,
    pub frames: Vec<CallFrame>,
    pub globals: HashMap<String, Value>,
    printer: Printer,
}

fn underflow() -> RuntimeError {
    RuntimeError::VmFault("Stack underflow".into())
}

impl VM {
    pub fn new(main: Rc<Function>, printer: Printer) -> Self {
        Self {
            stack: Vec::new(),
            frames: vec![CallFrame {
                ip: 0,
                function: main,
                base: 0,
                locals: HashMap::new(),
            }],
            globals: HashMap::new(),
            printer,
        }
    }

    pub fn run(&mut self) -> Result<Value, RuntimeError> {
        loop {
            let frame = self.frames.last_mut().ok_or_else(|| {
                RuntimeError::VmFault("no active frame".into())
            })?;
            let op = frame
                .function
                .chunk
                .code
                .get(frame.ip)
                .cloned()
                .ok_or_else(|| RuntimeError::VmFault(format!("ip {} out of bounds", frame.ip)))?;
            trace!(ip = frame.ip, depth = self.stack.len(), op = ?op, "exec");
            frame.ip += 1;

            match op {
                OpCode::LoadConst(v) => self.stack.push(v),
                OpCode::Pop => {
                    self.stack.pop().ok_or_else(underflow)?;
                }

                OpCode::Add => self.binary_op(|a, b| Ok(Value::Number(a + b)))?,
                OpCode::Sub => self.binary_op(|a, b| Ok(Value::Number(a - b)))?,
                OpCode::Mul => self.binary_op(|a, b| Ok(Value::Number(a * b)))?,
                OpCode::Div => self.binary_op(|a, b| {
                    if b == 0.0 {
                        return Err(RuntimeError::DivideByZero);
                    }
                    Ok(Value::Number(a / b))
                })?,
                OpCode::Mod => self.binary_op(|a, b| {
                    if b == 0.0 {
                        return Err(RuntimeError::DivideByZero);
                    }
                    Ok(Value::Number(a % b))
                })?,
                OpCode::Lt => self.binary_op(|a, b| Ok(Value::bool(a < b)))?,
                OpCode::Gt => self.binary_op(|a, b| Ok(Value::bool(a > b)))?,
                OpCode::Le => self.binary_op(|a, b| Ok(Value::bool(a <= b)))?,
                OpCode::Ge => self.binary_op(|a, b| Ok(Value::bool(a >= b)))?,

                OpCode::Eq => self.equality(true)?,
                OpCode::Ne => self.equality(false)?,
                OpCode::Not => {
                    let a = self.stack.pop().ok_or_else(underflow)?.to_number()?;
                    self.stack.push(Value::bool(a == 0.0));
                }
                OpCode::Neg => {
                    let a = self.stack.pop().ok_or_else(underflow)?.to_number()?;
                    self.stack.push(Value::Number(-a));
                }

                OpCode::LoadVar(name) => {
                    let val = self
                        .find_var(&name)
                        .ok_or(RuntimeError::UndefinedVariable(name))?;
                    self.stack.push(val);
                }
                OpCode::StoreVar(name) => {
                    let val = self.stack.pop().ok_or_else(underflow)?;
                    self.store(name, val);
                }
                OpCode::DeclareVar(name) => {
                    let val = self.stack.pop().ok_or_else(underflow)?;
                    if self.frames.len() > 1 {
                        if let Some(frame) = self.frames.last_mut() {
                            frame.locals.insert(name, val);
                        }
                    } else {
                        self.globals.insert(name, val);
                    }
                }

                OpCode::Jump(target) => self.jump(target),
                OpCode::JumpIfFalse(target) => {
                    let cond = self.stack.pop().ok_or_else(underflow)?;
                    if cond.to_number()? == 0.0 {
                        self.jump(target);
                    }
                }
                OpCode::Label(_) => {}

                OpCode::Call(arg_count) => {
                    let callee = self.stack.pop().ok_or_else(underflow)?;
                    let Value::Compiled(function) = callee else {
                        return Err(RuntimeError::type_mismatch("callable", &callee));
                    };
                    if self.stack.len() < arg_count {
                        return Err(underflow());
                    }
                    let base = self.stack.len() - arg_count;
                    let mut args = self.stack.split_off(base).into_iter();
                    let locals = function
                        .params
                        .iter()
                        .map(|p| (p.clone(), args.next().unwrap_or(Value::Null)))
                        .collect();
                    self.frames.push(CallFrame {
                        ip: 0,
                        function,
                        base,
                        locals,
                    });
                }
                OpCode::Return => {
                    let result = self.stack.pop().unwrap_or(Value::Null);
                    let finished = self.frames.pop().ok_or_else(|| {
                        RuntimeError::VmFault("return without frame".into())
                    })?;
                    if self.frames.is_empty() {
                        return Ok(result);
                    }
                    self.stack.truncate(finished.base);
                    self.stack.push(result);
                }

                OpCode::Print => {
                    let val = self.stack.pop().ok_or_else(underflow)?;
                    self.printer.print_line(&val.to_string());
                }
            }
        }
    }

    fn jump(&mut self, target: usize) {
        if let Some(frame) = self.frames.last_mut() {
            frame.ip = target;
        }
    }

    fn binary_op<F>(&mut self, op_fn: F) -> Result<(), RuntimeError>
    where
        F: Fn(f64, f64) -> Result<Value, RuntimeError>,
    {
        let b = self.stack.pop().ok_or_else(underflow)?.to_number()?;
        let a = self.stack.pop().ok_or_else(underflow)?.to_number()?;
        let res = op_fn(a, b)?;
        self.stack.push(res);
        Ok(())
    }

    fn equality(&mut self, expect_equal: bool) -> Result<(), RuntimeError> {
        let b = self.stack.pop().ok_or_else(underflow)?;
        let a = self.stack.pop().ok_or_else(underflow)?;
        self.stack.push(Value::bool((a == b) == expect_equal));
        Ok(())
    }

    fn find_var(&self, name: &str) -> Option<Value> {
        if self.frames.len() > 1 {
            if let Some(val) = self.frames.last().and_then(|f| f.locals.get(name)) {
                return Some(val.clone());
            }
        }
        self.globals.get(name).cloned()
    }

    /// Writes an existing local, else an existing global, else a new
    /// binding in the current frame.
    fn store(&mut self, name: String, val: Value) {
        let in_call = self.frames.len() > 1;
        if let Some(frame) = self.frames.last_mut().filter(|_| in_call) {
            if frame.locals.contains_key(&name) || !self.globals.contains_key(&name) {
                frame.locals.insert(name, val);
                return;
            }
        }
        self.globals.insert(name, val);
    }
}
