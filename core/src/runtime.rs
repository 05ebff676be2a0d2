/*
 * Copyright (c) 2026 Mohamad Al-Zawahreh (dba Sovereign Systems).
 *
 * This file is part of the W++ Runtime.
 *
 * LICENSE: DUAL-LICENSED (AGPLv3 or COMMERCIAL).
 *
 * 1. OPEN SOURCE: You may use this file under the terms of the GNU Affero
 * General Public License v3.0. If you link to this code, your ENTIRE
 * application must be open-sourced under AGPLv3.
 *
 * 2. COMMERCIAL: For proprietary use, you must obtain a Commercial License
 * from Sovereign Systems.
 *
 * PATENT NOTICE: Protected by US Patent App #63/935,467.
 * NO IMPLIED LICENSE to rights of Mohamad Al-Zawahreh or Sovereign Systems.
 */

use crate::ast::{LambdaDef, MethodDef};
use crate::bytecode::Function;
use crate::entity::EntityId;

use indexmap::IndexMap;
use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt;
use std::rc::Rc;
use thiserror::Error;

pub type NativeFn = fn(&[Value]) -> Result<Value, RuntimeError>;
pub type InstanceRef = Rc<RefCell<Instance>>;

/// Reserved instance key recording the defining entity's name.
pub const ENTITY_KEY: &str = "__entity";

#[derive(Error, Debug, Clone, PartialEq)]
pub enum RuntimeError {
    #[error("Undefined variable: {0}")]
    UndefinedVariable(String),
    #[error("Variable '{0}' already declared.")]
    DuplicateDeclaration(String),
    #[error("Cannot assign to constant '{0}'.")]
    ConstAssignment(String),
    #[error("Type mismatch: {0}")]
    TypeMismatch(String),
    #[error("Division by zero")]
    DivideByZero,
    #[error("Undefined entity or method: {0}")]
    UndefinedEntityOrMethod(String),
    #[error("Unsupported node: {0}")]
    UnsupportedNode(String),
    #[error("Control flow misuse: {0}")]
    ControlFlowMisuse(String),
    #[error("Missing member: {0}")]
    MissingMember(String),
    #[error("{0}")]
    Thrown(String),
    #[error("Import failed: {0}")]
    Import(String),
    #[error("Host bridge error: {0}")]
    Host(String),
    #[error("VM fault: {0}")]
    VmFault(String),
}

impl RuntimeError {
    pub fn type_mismatch(expected: &str, got: &Value) -> Self {
        RuntimeError::TypeMismatch(format!("expected {}, got {}", expected, got.type_name()))
    }
}

#[derive(Debug, Clone)]
pub enum Value {
    Number(f64),
    String(String),
    Null,
    Object(IndexMap<String, Value>),
    List(Vec<Value>),
    Function(Rc<Closure>),
    AsyncFunction(Rc<Closure>),
    Instance(InstanceRef),
    Method(Rc<Method>),
    Future(Future),
    Native(NativeFn),
    /// A lambda compiled for the bytecode VM.
    Compiled(Rc<Function>),
    ExternHandle {
        type_name: String,
        member: Option<String>,
    },
}

impl Value {
    pub fn bool(b: bool) -> Value {
        Value::Number(if b { 1.0 } else { 0.0 })
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Number(_) => "number",
            Value::String(_) => "string",
            Value::Null => "null",
            Value::Object(_) => "object",
            Value::List(_) => "list",
            Value::Function(_) => "function",
            Value::AsyncFunction(_) => "async function",
            Value::Instance(_) => "entity instance",
            Value::Method(_) => "method",
            Value::Future(_) => "future",
            Value::Native(_) => "native function",
            Value::Compiled(_) => "compiled function",
            Value::ExternHandle { .. } => "extern handle",
        }
    }

    /// Numeric view used by arithmetic and truthiness. Null reads as 0.
    pub fn to_number(&self) -> Result<f64, RuntimeError> {
        match self {
            Value::Number(n) => Ok(*n),
            Value::Null => Ok(0.0),
            other => Err(RuntimeError::type_mismatch("number", other)),
        }
    }

    pub fn is_truthy(&self) -> Result<bool, RuntimeError> {
        Ok(self.to_number()? != 0.0)
    }

    fn fmt_nested(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::String(s) => write!(f, "{:?}", s),
            other => write!(f, "{}", other),
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Number(a), Value::Number(b)) => a == b,
            (Value::String(a), Value::String(b)) => a == b,
            (Value::Null, Value::Null) => true,
            (Value::Object(a), Value::Object(b)) => a == b,
            (Value::List(a), Value::List(b)) => a == b,
            (Value::Function(a), Value::Function(b)) => Rc::ptr_eq(a, b),
            (Value::AsyncFunction(a), Value::AsyncFunction(b)) => Rc::ptr_eq(a, b),
            (Value::Instance(a), Value::Instance(b)) => Rc::ptr_eq(a, b),
            (Value::Method(a), Value::Method(b)) => Rc::ptr_eq(a, b),
            (Value::Future(a), Value::Future(b)) => a.ptr_eq(b),
            (Value::Native(a), Value::Native(b)) => *a as usize == *b as usize,
            (Value::Compiled(a), Value::Compiled(b)) => Rc::ptr_eq(a, b),
            (
                Value::ExternHandle { type_name: t1, member: m1 },
                Value::ExternHandle { type_name: t2, member: m2 },
            ) => t1 == t2 && m1 == m2,
            _ => false,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Number(n) => write!(f, "{}", n),
            Value::String(s) => write!(f, "{}", s),
            Value::Null => write!(f, "null"),
            Value::Object(map) => {
                write!(f, "{{")?;
                for (i, (k, v)) in map.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}: ", k)?;
                    v.fmt_nested(f)?;
                }
                write!(f, "}}")
            }
            Value::List(items) => {
                write!(f, "[")?;
                for (i, v) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    v.fmt_nested(f)?;
                }
                write!(f, "]")
            }
            Value::Function(_) => write!(f, "<function>"),
            Value::AsyncFunction(_) => write!(f, "<async function>"),
            Value::Instance(inst) => write!(f, "<{} instance>", inst.borrow().entity_name()),
            Value::Method(m) => write!(f, "<method {}>", m.def.name),
            Value::Future(_) => write!(f, "<future>"),
            Value::Native(_) => write!(f, "<native function>"),
            Value::Compiled(func) => write!(f, "<compiled {}>", func.name),
            Value::ExternHandle { type_name, member } => match member {
                Some(m) => write!(f, "<extern {}.{}>", type_name, m),
                None => write!(f, "<extern {}>", type_name),
            },
        }
    }
}

/// A lambda plus the bindings it saw when it was created.
#[derive(Debug)]
pub struct Closure {
    pub def: Rc<LambdaDef>,
    pub env: Scope,
}

/// An entity method together with the entity that owns it.
#[derive(Debug)]
pub struct Method {
    pub owner: EntityId,
    pub def: Rc<MethodDef>,
    pub env: Scope,
}

#[derive(Debug)]
pub struct Instance {
    pub entity: EntityId,
    pub fields: IndexMap<String, Value>,
}

impl Instance {
    pub fn entity_name(&self) -> String {
        match self.fields.get(ENTITY_KEY) {
            Some(Value::String(name)) => name.clone(),
            _ => String::from("?"),
        }
    }
}

// ============================================================================
// Futures
// ============================================================================

type Job = Box<dyn FnOnce() -> Result<Value, RuntimeError>>;

enum FutureState {
    Ready(Result<Value, RuntimeError>),
    Pending(Job),
    /// An async call that has not started yet. Only the interpreter can run it.
    Deferred(Rc<Closure>, Vec<Value>),
    Running,
}

/// A deferred result. Waiting runs the pending job at most once and caches
/// its outcome, so every `await` of the same future observes the same value.
#[derive(Clone)]
pub struct Future(Rc<RefCell<FutureState>>);

impl Future {
    pub fn ready(result: Result<Value, RuntimeError>) -> Self {
        Future(Rc::new(RefCell::new(FutureState::Ready(result))))
    }

    pub fn pending(job: impl FnOnce() -> Result<Value, RuntimeError> + 'static) -> Self {
        Future(Rc::new(RefCell::new(FutureState::Pending(Box::new(job)))))
    }

    pub fn deferred(closure: Rc<Closure>, args: Vec<Value>) -> Self {
        Future(Rc::new(RefCell::new(FutureState::Deferred(closure, args))))
    }

    pub fn is_ready(&self) -> bool {
        matches!(&*self.0.borrow(), FutureState::Ready(_))
    }

    pub fn is_deferred(&self) -> bool {
        matches!(&*self.0.borrow(), FutureState::Deferred(..))
    }

    /// Claim a deferred call for execution. The future stays `Running` until
    /// `resolve` is called with the outcome.
    pub fn start(&self) -> Option<(Rc<Closure>, Vec<Value>)> {
        let mut state = self.0.borrow_mut();
        if !matches!(&*state, FutureState::Deferred(..)) {
            return None;
        }
        match std::mem::replace(&mut *state, FutureState::Running) {
            FutureState::Deferred(closure, args) => Some((closure, args)),
            _ => None,
        }
    }

    pub fn resolve(&self, result: Result<Value, RuntimeError>) {
        *self.0.borrow_mut() = FutureState::Ready(result);
    }

    pub fn wait(&self) -> Result<Value, RuntimeError> {
        let mut state = self.0.borrow_mut();
        let resolved = match std::mem::replace(&mut *state, FutureState::Running) {
            FutureState::Pending(job) => job(),
            FutureState::Ready(result) => result,
            deferred @ FutureState::Deferred(..) => {
                *state = deferred;
                return Err(RuntimeError::VmFault(
                    "async call awaited outside of an interpreter".into(),
                ));
            }
            FutureState::Running => {
                return Err(RuntimeError::ControlFlowMisuse(
                    "future awaited while it is still running".into(),
                ));
            }
        };
        *state = FutureState::Ready(resolved.clone());
        resolved
    }

    pub fn ptr_eq(&self, other: &Future) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }
}

impl fmt::Debug for Future {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &*self.0.borrow() {
            FutureState::Ready(r) => f.debug_tuple("Future::Ready").field(r).finish(),
            FutureState::Pending(_) => f.write_str("Future::Pending"),
            FutureState::Deferred(..) => f.write_str("Future::Deferred"),
            FutureState::Running => f.write_str("Future::Running"),
        }
    }
}

// ============================================================================
// Scopes
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
pub struct Binding {
    pub value: Value,
    pub constant: bool,
}

/// Lexical bindings for one function activation: a stack of block frames
/// over a base frame.
#[derive(Debug, Clone)]
pub struct Scope {
    frames: Vec<HashMap<String, Binding>>,
}

impl Default for Scope {
    fn default() -> Self {
        Scope::new()
    }
}

impl Scope {
    pub fn new() -> Self {
        Scope {
            frames: vec![HashMap::new()],
        }
    }

    pub fn depth(&self) -> usize {
        self.frames.len()
    }

    pub fn push_frame(&mut self) {
        self.frames.push(HashMap::new());
    }

    /// Drops frames above `depth`. The base frame always survives.
    pub fn truncate(&mut self, depth: usize) {
        self.frames.truncate(depth.max(1));
    }

    pub fn declare(&mut self, name: &str, value: Value, constant: bool) -> Result<(), RuntimeError> {
        let frame = self.innermost();
        if frame.contains_key(name) {
            return Err(RuntimeError::DuplicateDeclaration(name.to_string()));
        }
        frame.insert(name.to_string(), Binding { value, constant });
        Ok(())
    }

    /// Binds unconditionally in the innermost frame (parameters, catch variables).
    pub fn bind(&mut self, name: &str, value: Value) {
        self.innermost().insert(
            name.to_string(),
            Binding {
                value,
                constant: false,
            },
        );
    }

    pub fn get(&self, name: &str) -> Option<Value> {
        self.frames
            .iter()
            .rev()
            .find_map(|frame| frame.get(name))
            .map(|b| b.value.clone())
    }

    pub fn lookup(&self, name: &str) -> Result<Value, RuntimeError> {
        self.get(name)
            .ok_or_else(|| RuntimeError::UndefinedVariable(name.to_string()))
    }

    /// Assigning an unknown name declares it in the base frame.
    pub fn assign(&mut self, name: &str, value: Value) -> Result<(), RuntimeError> {
        for frame in self.frames.iter_mut().rev() {
            if let Some(binding) = frame.get_mut(name) {
                if binding.constant {
                    return Err(RuntimeError::ConstAssignment(name.to_string()));
                }
                binding.value = value;
                return Ok(());
            }
        }
        self.frames[0].insert(
            name.to_string(),
            Binding {
                value,
                constant: false,
            },
        );
        Ok(())
    }

    /// Flattened copy of every visible binding. Later writes to either side
    /// are not seen by the other.
    pub fn snapshot(&self) -> Scope {
        let mut flat = HashMap::new();
        for frame in &self.frames {
            for (name, binding) in frame {
                flat.insert(name.clone(), binding.clone());
            }
        }
        Scope { frames: vec![flat] }
    }

    fn innermost(&mut self) -> &mut HashMap<String, Binding> {
        if self.frames.is_empty() {
            self.frames.push(HashMap::new());
        }
        let last = self.frames.len() - 1;
        &mut self.frames[last]
    }
}

// ============================================================================
// Output
// ============================================================================

#[derive(Debug, Clone)]
enum Sink {
    Stdout,
    Capture(Rc<RefCell<String>>),
}

/// Destination for program output. Clones share the same sink.
#[derive(Debug, Clone)]
pub struct Printer {
    sink: Sink,
}

impl Default for Printer {
    fn default() -> Self {
        Printer::stdout()
    }
}

impl Printer {
    pub fn stdout() -> Self {
        Printer { sink: Sink::Stdout }
    }

    pub fn capture() -> Self {
        Printer {
            sink: Sink::Capture(Rc::new(RefCell::new(String::new()))),
        }
    }

    pub fn print_line(&self, line: &str) {
        match &self.sink {
            Sink::Stdout => println!("{}", line),
            Sink::Capture(buf) => {
                let mut buf = buf.borrow_mut();
                buf.push_str(line);
                buf.push('\n');
            }
        }
    }

    /// Everything written so far; empty for stdout printers.
    pub fn captured(&self) -> String {
        match &self.sink {
            Sink::Stdout => String::new(),
            Sink::Capture(buf) => buf.borrow().clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_redeclare_in_same_frame_fails() {
        let mut scope = Scope::new();
        scope.declare("x", Value::Number(1.0), false).unwrap();
        assert_eq!(
            scope.declare("x", Value::Number(2.0), false),
            Err(RuntimeError::DuplicateDeclaration("x".into()))
        );

        scope.push_frame();
        scope.declare("x", Value::Number(3.0), false).unwrap();
        assert_eq!(scope.get("x"), Some(Value::Number(3.0)));
        scope.truncate(1);
        assert_eq!(scope.get("x"), Some(Value::Number(1.0)));
    }

    #[test]
    fn test_const_and_implicit_assignment() {
        let mut scope = Scope::new();
        scope.declare("k", Value::Number(1.0), true).unwrap();
        assert_eq!(
            scope.assign("k", Value::Null),
            Err(RuntimeError::ConstAssignment("k".into()))
        );

        scope.push_frame();
        scope.assign("fresh", Value::Number(9.0)).unwrap();
        scope.truncate(1);
        assert_eq!(scope.get("fresh"), Some(Value::Number(9.0)));
    }

    #[test]
    fn test_snapshot_is_detached() {
        let mut scope = Scope::new();
        scope.declare("n", Value::Number(1.0), false).unwrap();
        let snap = scope.snapshot();
        scope.assign("n", Value::Number(2.0)).unwrap();
        assert_eq!(snap.get("n"), Some(Value::Number(1.0)));
    }

    #[test]
    fn test_future_caches_result() {
        let fut = Future::pending(|| Ok(Value::Number(7.0)));
        assert!(!fut.is_ready());
        assert_eq!(fut.wait(), Ok(Value::Number(7.0)));
        assert!(fut.is_ready());
        assert_eq!(fut.wait(), Ok(Value::Number(7.0)));
    }

    #[test]
    fn test_display() {
        let mut map = IndexMap::new();
        map.insert("a".to_string(), Value::Number(1.0));
        map.insert("b".to_string(), Value::List(vec![Value::String("x".into()), Value::Null]));
        insta::assert_snapshot!(Value::Object(map).to_string(), @r#"{a: 1, b: ["x", null]}"#);
        insta::assert_snapshot!(Value::Number(2.5).to_string(), @"2.5");
    }
}
