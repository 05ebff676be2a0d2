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

use crate::ast::{AssignTarget, BinaryOp, Node, SwitchCase, UnaryOp};
use crate::bridge::{ExternRegistry, HostBridge};
use crate::entity::{EntityId, EntityTable};
use crate::intrinsics;
use crate::loader::{Frontend, JsonFrontend};
use crate::runtime::{
    Closure, Future, InstanceRef, Method, Printer, RuntimeError, Scope, Value,
};

use indexmap::IndexMap;
use std::collections::HashSet;
use std::fs;
use std::path::PathBuf;
use std::rc::Rc;
use tracing::{debug, warn};

/// Non-value outcome of evaluating a node.
#[derive(Debug, Clone, PartialEq)]
pub enum Signal {
    Thrown(RuntimeError),
    Returned(Value),
    Broke,
    Continued,
}

impl From<RuntimeError> for Signal {
    fn from(err: RuntimeError) -> Self {
        Signal::Thrown(err)
    }
}

pub type Flow = Result<Value, Signal>;

/// Call-local binding for `me` and `ancestor`. Lives on the interpreter's
/// frame stack, not on the instance.
#[derive(Debug)]
struct MethodFrame {
    instance: Option<InstanceRef>,
    entity: EntityId,
}

/// Closures see a copy of the bindings visible at creation time.
fn make_closure_env(scope: &Scope) -> Scope {
    scope.snapshot()
}

/// Escaping a function body: `return` is the result, stray loop signals
/// are errors.
fn settle(flow: Flow) -> Result<Value, RuntimeError> {
    match flow {
        Ok(v) | Err(Signal::Returned(v)) => Ok(v),
        Err(Signal::Thrown(e)) => Err(e),
        Err(Signal::Broke) => Err(RuntimeError::ControlFlowMisuse("break outside of a loop".into())),
        Err(Signal::Continued) => Err(RuntimeError::ControlFlowMisuse(
            "continue outside of a loop".into(),
        )),
    }
}

pub struct Interpreter {
    entities: EntityTable,
    frames: Vec<MethodFrame>,
    imported: HashSet<PathBuf>,
    import_root: PathBuf,
    bridge: Box<dyn HostBridge>,
    frontend: Box<dyn Frontend>,
    printer: Printer,
    globals: Scope,
    /// Async calls made so far; any still unstarted run when the program ends.
    spawned: Vec<Future>,
}

impl Interpreter {
    pub fn new(printer: Printer) -> Self {
        let mut globals = Scope::new();
        intrinsics::install(&mut globals);
        Interpreter {
            entities: EntityTable::new(),
            frames: Vec::new(),
            imported: HashSet::new(),
            import_root: PathBuf::from("."),
            bridge: Box::new(ExternRegistry::with_defaults(&printer)),
            frontend: Box::new(JsonFrontend),
            printer,
            globals,
            spawned: Vec::new(),
        }
    }

    pub fn with_bridge(mut self, bridge: Box<dyn HostBridge>) -> Self {
        self.bridge = bridge;
        self
    }

    pub fn with_frontend(mut self, frontend: Box<dyn Frontend>) -> Self {
        self.frontend = frontend;
        self
    }

    pub fn with_import_root(mut self, root: PathBuf) -> Self {
        self.import_root = root;
        self
    }

    pub fn globals(&self) -> &Scope {
        &self.globals
    }

    pub fn entities(&self) -> &EntityTable {
        &self.entities
    }

    /// Runs top-level statements against the global scope. A top-level
    /// `return` ends the program with its value; otherwise the result is the
    /// last statement's value.
    pub fn run(&mut self, program: &[Node]) -> Result<Value, RuntimeError> {
        let mut scope = std::mem::take(&mut self.globals);
        let mut outcome = Ok(Value::Null);
        for node in program {
            match self.evaluate(node, &mut scope) {
                Ok(v) => outcome = Ok(v),
                other => {
                    outcome = settle(other);
                    break;
                }
            }
        }
        self.globals = scope;
        self.drain_spawned();
        outcome
    }

    /// Runs async calls that were never awaited, in call order.
    fn drain_spawned(&mut self) {
        while !self.spawned.is_empty() {
            for fut in std::mem::take(&mut self.spawned) {
                if !fut.is_deferred() {
                    continue;
                }
                if let Err(e) = self.await_future(&fut) {
                    warn!(error = %e, "un-awaited async call failed");
                }
            }
        }
    }

    /// Drives a future to completion. A deferred async call runs its body
    /// here, on first await; later awaits see the cached outcome.
    fn await_future(&mut self, fut: &Future) -> Result<Value, RuntimeError> {
        match fut.start() {
            Some((closure, args)) => {
                let outcome = self.call_closure(&closure, args);
                fut.resolve(outcome.clone());
                outcome
            }
            None => fut.wait(),
        }
    }

    pub fn evaluate(&mut self, node: &Node, scope: &mut Scope) -> Flow {
        match node {
            Node::Number(n) => Ok(Value::Number(*n)),
            Node::Str(s) => Ok(Value::String(s.clone())),
            Node::Boolean(b) => Ok(Value::bool(*b)),
            Node::Null => Ok(Value::Null),
            Node::Identifier(name) => match scope.get(name) {
                Some(v) => Ok(v),
                None if self.bridge.knows_type(name) => Ok(Value::ExternHandle {
                    type_name: name.clone(),
                    member: None,
                }),
                None => Err(RuntimeError::UndefinedVariable(name.clone()).into()),
            },
            Node::Unary { op, operand } => {
                let n = self.evaluate(operand, scope)?.to_number()?;
                Ok(match op {
                    UnaryOp::Not => Value::bool(n == 0.0),
                    UnaryOp::Neg => Value::Number(-n),
                })
            }
            Node::Binary { op, left, right } => {
                let l = self.evaluate(left, scope)?;
                let r = self.evaluate(right, scope)?;
                Ok(self.binary(*op, l, r)?)
            }
            Node::Assign { target, value } => {
                let v = self.evaluate(value, scope)?;
                match target {
                    AssignTarget::Variable(name) => scope.assign(name, v.clone())?,
                    AssignTarget::Member { object, property } => {
                        self.assign_member(object, property, v.clone(), scope)?
                    }
                }
                Ok(v)
            }
            Node::VarDecl {
                name,
                value,
                constant,
            } => {
                let v = self.evaluate(value, scope)?;
                scope.declare(name, v, *constant)?;
                Ok(Value::Null)
            }
            Node::Block(stmts) => self.scoped(scope, |interp, scope| interp.sequence(stmts, scope)),
            Node::If {
                condition,
                then_branch,
                else_branch,
            } => {
                if self.evaluate(condition, scope)?.is_truthy()? {
                    self.evaluate(then_branch, scope)
                } else if let Some(other) = else_branch {
                    self.evaluate(other, scope)
                } else {
                    Ok(Value::Null)
                }
            }
            Node::While { condition, body } => {
                while self.evaluate(condition, scope)?.is_truthy()? {
                    match self.evaluate(body, scope) {
                        Ok(_) | Err(Signal::Continued) => {}
                        Err(Signal::Broke) => break,
                        Err(other) => return Err(other),
                    }
                }
                Ok(Value::Null)
            }
            Node::For {
                init,
                condition,
                increment,
                body,
            } => self.scoped(scope, |interp, scope| {
                if let Some(init) = init {
                    interp.evaluate(init, scope)?;
                }
                loop {
                    if let Some(cond) = condition {
                        if !interp.evaluate(cond, scope)?.is_truthy()? {
                            break;
                        }
                    }
                    match interp.evaluate(body, scope) {
                        Ok(_) | Err(Signal::Continued) => {}
                        Err(Signal::Broke) => break,
                        Err(other) => return Err(other),
                    }
                    if let Some(inc) = increment {
                        interp.evaluate(inc, scope)?;
                    }
                }
                Ok(Value::Null)
            }),
            Node::Switch {
                discriminant,
                cases,
                default,
            } => self.switch(discriminant, cases, default.as_deref(), scope),
            Node::Break => Err(Signal::Broke),
            Node::Continue => Err(Signal::Continued),
            Node::Return(value) => {
                let v = match value {
                    Some(expr) => self.evaluate(expr, scope)?,
                    None => Value::Null,
                };
                Err(Signal::Returned(v))
            }
            Node::Throw(value) => {
                let v = self.evaluate(value, scope)?;
                Err(RuntimeError::Thrown(v.to_string()).into())
            }
            Node::TryCatch {
                body,
                catch_var,
                handler,
            } => match self.evaluate(body, scope) {
                Err(Signal::Thrown(err)) => {
                    debug!(error = %err, "caught");
                    self.scoped(scope, |interp, scope| {
                        scope.bind(catch_var, Value::String(err.to_string()));
                        interp.evaluate(handler, scope)
                    })
                }
                other => other,
            },
            Node::Lambda(def) => Ok(Value::Function(Rc::new(Closure {
                def: def.clone(),
                env: make_closure_env(scope),
            }))),
            Node::AsyncLambda(def) => Ok(Value::AsyncFunction(Rc::new(Closure {
                def: def.clone(),
                env: make_closure_env(scope),
            }))),
            Node::Await(expr) => match self.evaluate(expr, scope)? {
                Value::Future(fut) => Ok(self.await_future(&fut)?),
                other => Err(RuntimeError::type_mismatch("future in await", &other).into()),
            },
            Node::Call { callee, args } => self.call(callee, args, scope),
            Node::Member { object, property } => {
                let target = self.evaluate(object, scope)?;
                Ok(self.member(target, property)?)
            }
            Node::Object(props) => {
                let mut map = IndexMap::new();
                for (key, expr) in props {
                    let v = self.evaluate(expr, scope)?;
                    map.insert(key.clone(), v);
                }
                Ok(Value::Object(map))
            }
            Node::List(items) => Ok(Value::List(self.arguments(items, scope)?)),
            Node::Print(expr) => {
                let v = self.evaluate(expr, scope)?;
                self.printer.print_line(&v.to_string());
                Ok(Value::Null)
            }
            Node::Import(path) => self.import(path, scope),
            Node::Entity(decl) => {
                self.entities.define(decl, &make_closure_env(scope))?;
                Ok(Value::Null)
            }
            Node::Alter { target, methods } => {
                self.entities.alter(target, methods, &make_closure_env(scope))?;
                Ok(Value::Null)
            }
            Node::New(name) => Ok(Value::Instance(self.entities.instantiate(name)?)),
            Node::AncestorCall { method, args } => {
                let frame = self.frames.last().ok_or_else(|| {
                    RuntimeError::UndefinedEntityOrMethod(format!(
                        "ancestor.{} called outside of a method",
                        method
                    ))
                })?;
                let (context, instance) = (frame.entity, frame.instance.clone());
                let origin = self.entities.origin(context, method)?;
                let args = self.arguments(args, scope)?;
                self.invoke_method(&origin, instance, args)
            }
            Node::Me => match self.frames.last().and_then(|f| f.instance.clone()) {
                Some(inst) => Ok(Value::Instance(inst)),
                None => Err(RuntimeError::UndefinedVariable("me".into()).into()),
            },
            Node::ExternCall {
                type_name,
                method,
                args,
            } => {
                let args = self.arguments(args, scope)?;
                Ok(self.extern_call(type_name, method, &args))
            }
        }
    }

    /// Runs `f` inside a fresh block frame, dropping the frame on every exit path.
    fn scoped<F>(&mut self, scope: &mut Scope, f: F) -> Flow
    where
        F: FnOnce(&mut Self, &mut Scope) -> Flow,
    {
        let depth = scope.depth();
        scope.push_frame();
        let result = f(self, scope);
        scope.truncate(depth);
        result
    }

    fn sequence(&mut self, stmts: &[Node], scope: &mut Scope) -> Flow {
        let mut last = Value::Null;
        for stmt in stmts {
            last = self.evaluate(stmt, scope)?;
        }
        Ok(last)
    }

    fn arguments(&mut self, args: &[Node], scope: &mut Scope) -> Result<Vec<Value>, Signal> {
        let mut out = Vec::with_capacity(args.len());
        for arg in args {
            out.push(self.evaluate(arg, scope)?);
        }
        Ok(out)
    }

    fn binary(&mut self, op: BinaryOp, l: Value, r: Value) -> Result<Value, RuntimeError> {
        match op {
            // String `+` writes the concatenation out instead of producing it.
            BinaryOp::Add if matches!(l, Value::String(_)) || matches!(r, Value::String(_)) => {
                self.printer.print_line(&format!("{}{}", l, r));
                Ok(Value::Number(f64::NAN))
            }
            BinaryOp::Eq => Ok(Value::bool(l == r)),
            BinaryOp::Ne => Ok(Value::bool(l != r)),
            BinaryOp::Coalesce => Ok(if l == Value::Null { r } else { l }),
            _ => numeric(op, l.to_number()?, r.to_number()?),
        }
    }

    fn switch(
        &mut self,
        discriminant: &Node,
        cases: &[SwitchCase],
        default: Option<&[Node]>,
        scope: &mut Scope,
    ) -> Flow {
        let subject = self.evaluate(discriminant, scope)?;
        let mut chosen = default;
        for case in cases {
            if self.evaluate(&case.value, scope)? == subject {
                chosen = Some(&case.body);
                break;
            }
        }
        let Some(body) = chosen else {
            return Ok(Value::Null);
        };
        match self.scoped(scope, |interp, scope| interp.sequence(body, scope)) {
            Err(Signal::Broke) => Ok(Value::Null),
            other => other,
        }
    }

    // ------------------------------------------------------------------
    // Calls
    // ------------------------------------------------------------------

    fn call(&mut self, callee: &Node, args: &[Node], scope: &mut Scope) -> Flow {
        if let Node::Member { object, property } = callee {
            let target = self.evaluate(object, scope)?;
            if let Value::Instance(inst) = &target {
                let member = inst.borrow().fields.get(property).cloned();
                let member = member.ok_or_else(|| RuntimeError::MissingMember(property.clone()))?;
                let args = self.arguments(args, scope)?;
                return match member {
                    Value::Method(m) => self.invoke_method(&m, Some(inst.clone()), args),
                    other => self.call_value(other, args),
                };
            }
            let func = self.member(target, property)?;
            let args = self.arguments(args, scope)?;
            return self.call_value(func, args);
        }

        let func = self.evaluate(callee, scope)?;
        let args = self.arguments(args, scope)?;
        self.call_value(func, args)
    }

    pub fn call_value(&mut self, func: Value, args: Vec<Value>) -> Flow {
        match func {
            Value::Function(closure) => Ok(self.call_closure(&closure, args)?),
            Value::AsyncFunction(closure) => {
                let fut = Future::deferred(closure, args);
                self.spawned.push(fut.clone());
                Ok(Value::Future(fut))
            }
            Value::Method(m) => self.invoke_method(&m, None, args),
            Value::Native(f) => Ok(f(&args)?),
            Value::ExternHandle {
                type_name,
                member: Some(method),
            } => Ok(self.extern_call(&type_name, &method, &args)),
            other => Err(RuntimeError::type_mismatch("callable", &other).into()),
        }
    }

    fn call_closure(&mut self, closure: &Closure, args: Vec<Value>) -> Result<Value, RuntimeError> {
        let mut local = closure.env.clone();
        local.push_frame();
        bind_params(&mut local, &closure.def.params, args);
        settle(self.evaluate(&closure.def.body, &mut local))
    }

    fn invoke_method(
        &mut self,
        method: &Rc<Method>,
        instance: Option<InstanceRef>,
        args: Vec<Value>,
    ) -> Flow {
        let mut local = method.env.clone();
        local.push_frame();
        bind_params(&mut local, &method.def.params, args);

        self.frames.push(MethodFrame {
            instance,
            entity: method.owner,
        });
        let flow = self.evaluate(&method.def.body, &mut local);
        self.frames.pop();
        Ok(settle(flow)?)
    }

    fn extern_call(&mut self, type_name: &str, method: &str, args: &[Value]) -> Value {
        match self.bridge.invoke(type_name, method, args) {
            Ok(v) => v,
            Err(e) => {
                warn!(type_name, method, error = %e, "externcall failed, yielding null");
                Value::Null
            }
        }
    }

    // ------------------------------------------------------------------
    // Members
    // ------------------------------------------------------------------

    fn member(&self, target: Value, property: &str) -> Result<Value, RuntimeError> {
        match target {
            Value::Object(map) => map
                .get(property)
                .cloned()
                .ok_or_else(|| RuntimeError::MissingMember(property.to_string())),
            Value::Instance(inst) => inst
                .borrow()
                .fields
                .get(property)
                .cloned()
                .ok_or_else(|| RuntimeError::MissingMember(property.to_string())),
            Value::List(items) if property == "length" => Ok(Value::Number(items.len() as f64)),
            Value::String(s) if property == "length" => Ok(Value::Number(s.chars().count() as f64)),
            Value::ExternHandle { type_name, member } => Ok(Value::ExternHandle {
                type_name: match member {
                    Some(m) => format!("{}.{}", type_name, m),
                    None => type_name,
                },
                member: Some(property.to_string()),
            }),
            other => Err(RuntimeError::type_mismatch("object for member access", &other)),
        }
    }

    fn assign_member(
        &mut self,
        object: &Node,
        property: &str,
        value: Value,
        scope: &mut Scope,
    ) -> Result<(), Signal> {
        match object {
            Node::Identifier(name) => {
                let mut target = scope.lookup(name)?;
                let shared = matches!(target, Value::Instance(_));
                set_field(&mut target, property, value)?;
                if !shared {
                    scope.assign(name, target)?;
                }
                Ok(())
            }
            Node::Member {
                object: inner,
                property: outer,
            } => {
                let parent = self.evaluate(inner, scope)?;
                let mut target = self.member(parent, outer)?;
                let shared = matches!(target, Value::Instance(_));
                set_field(&mut target, property, value)?;
                if !shared {
                    self.assign_member(inner, outer, target, scope)?;
                }
                Ok(())
            }
            other => match self.evaluate(other, scope)? {
                Value::Instance(inst) => {
                    inst.borrow_mut().fields.insert(property.to_string(), value);
                    Ok(())
                }
                other => Err(RuntimeError::type_mismatch("assignable object", &other).into()),
            },
        }
    }

    // ------------------------------------------------------------------
    // Imports
    // ------------------------------------------------------------------

    fn import(&mut self, path: &str, scope: &mut Scope) -> Flow {
        let resolved = self.import_root.join(path);
        let key = fs::canonicalize(&resolved).unwrap_or_else(|_| resolved.clone());
        if self.imported.contains(&key) {
            debug!(path, "already imported");
            return Ok(Value::Null);
        }

        debug!(path = %resolved.display(), "importing");
        let source = fs::read_to_string(&resolved)
            .map_err(|e| RuntimeError::Import(format!("{}: {}", path, e)))?;
        let program = self
            .frontend
            .parse(&source)
            .map_err(|e| RuntimeError::Import(format!("{}: {}", path, e)))?;
        self.imported.insert(key);
        for node in &program {
            self.evaluate(node, scope)?;
        }
        Ok(Value::Null)
    }
}

fn numeric(op: BinaryOp, a: f64, b: f64) -> Result<Value, RuntimeError> {
    Ok(match op {
        BinaryOp::Add => Value::Number(a + b),
        BinaryOp::Sub => Value::Number(a - b),
        BinaryOp::Mul => Value::Number(a * b),
        BinaryOp::Div | BinaryOp::Mod if b == 0.0 => return Err(RuntimeError::DivideByZero),
        BinaryOp::Div => Value::Number(a / b),
        BinaryOp::Mod => Value::Number(a % b),
        BinaryOp::Lt => Value::bool(a < b),
        BinaryOp::Gt => Value::bool(a > b),
        BinaryOp::Le => Value::bool(a <= b),
        BinaryOp::Ge => Value::bool(a >= b),
        BinaryOp::Eq => Value::bool(a == b),
        BinaryOp::Ne => Value::bool(a != b),
        BinaryOp::And => Value::bool(a != 0.0 && b != 0.0),
        BinaryOp::Or => Value::bool(a != 0.0 || b != 0.0),
        BinaryOp::Coalesce => Value::Number(a),
    })
}

fn bind_params(scope: &mut Scope, params: &[String], args: Vec<Value>) {
    let mut args = args.into_iter();
    for name in params {
        scope.bind(name, args.next().unwrap_or(Value::Null));
    }
}

fn set_field(target: &mut Value, property: &str, value: Value) -> Result<(), RuntimeError> {
    match target {
        Value::Object(map) => {
            map.insert(property.to_string(), value);
            Ok(())
        }
        Value::Instance(inst) => {
            inst.borrow_mut().fields.insert(property.to_string(), value);
            Ok(())
        }
        other => Err(RuntimeError::type_mismatch("object for member assignment", other)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::{EntityDecl, LambdaDef, MethodDef};

    fn num(n: f64) -> Node {
        Node::Number(n)
    }

    fn s(text: &str) -> Node {
        Node::Str(text.to_string())
    }

    fn id(name: &str) -> Node {
        Node::Identifier(name.to_string())
    }

    fn bin(op: BinaryOp, l: Node, r: Node) -> Node {
        Node::Binary {
            op,
            left: Box::new(l),
            right: Box::new(r),
        }
    }

    fn let_(name: &str, value: Node) -> Node {
        Node::VarDecl {
            name: name.to_string(),
            value: Box::new(value),
            constant: false,
        }
    }

    fn set(name: &str, value: Node) -> Node {
        Node::Assign {
            target: AssignTarget::Variable(name.to_string()),
            value: Box::new(value),
        }
    }

    fn print(n: Node) -> Node {
        Node::Print(Box::new(n))
    }

    fn ret(n: Node) -> Node {
        Node::Return(Some(Box::new(n)))
    }

    fn call(callee: Node, args: Vec<Node>) -> Node {
        Node::Call {
            callee: Box::new(callee),
            args,
        }
    }

    fn member(object: Node, property: &str) -> Node {
        Node::Member {
            object: Box::new(object),
            property: property.to_string(),
        }
    }

    fn lambda(params: &[&str], body: Vec<Node>) -> Node {
        Node::Lambda(Rc::new(LambdaDef {
            params: params.iter().map(|p| p.to_string()).collect(),
            body: Node::Block(body),
        }))
    }

    fn method(name: &str, body: Vec<Node>) -> Rc<MethodDef> {
        Rc::new(MethodDef {
            name: name.to_string(),
            params: vec![],
            body: Node::Block(body),
        })
    }

    fn entity(name: &str, parent: Option<&str>, methods: Vec<Rc<MethodDef>>) -> Node {
        Node::Entity(Rc::new(EntityDecl {
            name: name.to_string(),
            parent: parent.map(str::to_string),
            disowns: false,
            methods,
        }))
    }

    fn run(program: Vec<Node>) -> (Result<Value, RuntimeError>, String) {
        let printer = Printer::capture();
        let mut interp = Interpreter::new(printer.clone());
        let result = interp.run(&program);
        (result, printer.captured())
    }

    #[test]
    fn test_arithmetic() {
        let (result, _) = run(vec![bin(BinaryOp::Add, num(5.0), num(10.0))]);
        assert_eq!(result, Ok(Value::Number(15.0)));

        let sum = bin(BinaryOp::Add, num(5.0), num(10.0));
        let (result, _) = run(vec![bin(BinaryOp::Div, sum, num(3.0))]);
        assert_eq!(result, Ok(Value::Number(5.0)));
    }

    #[test]
    fn test_divide_by_zero() {
        let (result, _) = run(vec![bin(BinaryOp::Div, num(5.0), num(0.0))]);
        assert_eq!(result, Err(RuntimeError::DivideByZero));
    }

    #[test]
    fn test_early_return_skips_rest_of_block() {
        let printer = Printer::capture();
        let mut interp = Interpreter::new(printer.clone());
        let block = Node::Block(vec![
            let_("x", num(5.0)),
            Node::If {
                condition: Box::new(bin(BinaryOp::Gt, id("x"), num(0.0))),
                then_branch: Box::new(Node::Block(vec![ret(s("early exit"))])),
                else_branch: None,
            },
            print(s("never")),
        ]);
        let mut scope = Scope::new();
        let flow = interp.evaluate(&block, &mut scope);
        assert_eq!(flow, Err(Signal::Returned(Value::String("early exit".into()))));
        assert_eq!(printer.captured(), "");
    }

    #[test]
    fn test_closure_captures_by_value() {
        let (result, _) = run(vec![
            let_("n", num(1.0)),
            let_("f", lambda(&[], vec![ret(id("n"))])),
            set("n", num(2.0)),
            call(id("f"), vec![]),
        ]);
        assert_eq!(result, Ok(Value::Number(1.0)));
    }

    #[test]
    fn test_while_loop_prints_in_order() {
        let (result, out) = run(vec![
            let_("i", num(0.0)),
            Node::While {
                condition: Box::new(bin(BinaryOp::Lt, id("i"), num(3.0))),
                body: Box::new(Node::Block(vec![
                    print(id("i")),
                    set("i", bin(BinaryOp::Add, id("i"), num(1.0))),
                ])),
            },
        ]);
        assert!(result.is_ok());
        insta::assert_snapshot!(out, @r"
        0
        1
        2
        ");
    }

    #[test]
    fn test_for_loop_break_and_continue() {
        let body = Node::Block(vec![
            Node::If {
                condition: Box::new(bin(BinaryOp::Eq, id("i"), num(1.0))),
                then_branch: Box::new(Node::Continue),
                else_branch: None,
            },
            Node::If {
                condition: Box::new(bin(BinaryOp::Eq, id("i"), num(3.0))),
                then_branch: Box::new(Node::Break),
                else_branch: None,
            },
            print(id("i")),
        ]);
        let (_, out) = run(vec![Node::For {
            init: Some(Box::new(let_("i", num(0.0)))),
            condition: Some(Box::new(bin(BinaryOp::Lt, id("i"), num(10.0)))),
            increment: Some(Box::new(set("i", bin(BinaryOp::Add, id("i"), num(1.0))))),
            body: Box::new(body),
        }]);
        insta::assert_snapshot!(out, @r"
        0
        2
        ");
    }

    #[test]
    fn test_entity_ancestor_dispatch() {
        let (result, out) = run(vec![
            entity("Animal", None, vec![method("whoami", vec![print(s("I am an animal"))])]),
            entity(
                "Cat",
                Some("Animal"),
                vec![method(
                    "whoami",
                    vec![
                        print(s("I am a cat")),
                        Node::AncestorCall {
                            method: "whoami".into(),
                            args: vec![],
                        },
                    ],
                )],
            ),
            entity("Dog", Some("Animal"), vec![]),
            let_("c", Node::New("Cat".into())),
            call(member(id("c"), "whoami"), vec![]),
            let_("d", Node::New("Dog".into())),
            call(member(id("d"), "whoami"), vec![]),
        ]);
        assert!(result.is_ok(), "{:?}", result);
        insta::assert_snapshot!(out, @r"
        I am a cat
        I am an animal
        I am an animal
        ");
    }

    #[test]
    fn test_alter_preserves_original_for_ancestor() {
        let (result, out) = run(vec![
            entity("Animal", None, vec![method("speak", vec![print(s("..."))])]),
            Node::Alter {
                target: "Animal".into(),
                methods: vec![method(
                    "speak",
                    vec![
                        print(s("loud")),
                        Node::AncestorCall {
                            method: "speak".into(),
                            args: vec![],
                        },
                    ],
                )],
            },
            call(member(Node::New("Animal".into()), "speak"), vec![]),
        ]);
        assert!(result.is_ok(), "{:?}", result);
        insta::assert_snapshot!(out, @r"
        loud
        ...
        ");
    }

    #[test]
    fn test_me_stores_state_on_instance() {
        let set_name = Rc::new(MethodDef {
            name: "rename".into(),
            params: vec!["n".into()],
            body: Node::Block(vec![Node::Assign {
                target: AssignTarget::Member {
                    object: Box::new(Node::Me),
                    property: "name".into(),
                },
                value: Box::new(id("n")),
            }]),
        });
        let (result, _) = run(vec![
            entity("Pet", None, vec![set_name]),
            let_("p", Node::New("Pet".into())),
            call(member(id("p"), "rename"), vec![s("Rex")]),
            member(id("p"), "name"),
        ]);
        assert_eq!(result, Ok(Value::String("Rex".into())));
    }

    #[test]
    fn test_me_outside_method_is_undefined() {
        let (result, _) = run(vec![Node::Me]);
        assert_eq!(result, Err(RuntimeError::UndefinedVariable("me".into())));
    }

    #[test]
    fn test_switch_runs_one_case() {
        let switch = |with_default: bool| Node::Switch {
            discriminant: Box::new(num(2.0)),
            cases: vec![
                SwitchCase {
                    value: num(1.0),
                    body: vec![print(s("one"))],
                },
                SwitchCase {
                    value: num(2.0),
                    body: vec![print(s("two")), Node::Break],
                },
            ],
            default: with_default.then(|| vec![print(s("default"))]),
        };
        for with_default in [true, false] {
            let (result, out) = run(vec![switch(with_default)]);
            assert!(result.is_ok());
            assert_eq!(out, "two\n");
        }
    }

    #[test]
    fn test_string_plus_prints_and_yields_nan() {
        let (result, out) = run(vec![bin(BinaryOp::Add, s("foo"), s("bar"))]);
        assert!(matches!(result, Ok(Value::Number(n)) if n.is_nan()));
        assert_eq!(out, "foobar\n");
    }

    #[test]
    fn test_arithmetic_on_strings_is_type_mismatch() {
        let (result, _) = run(vec![bin(BinaryOp::Mul, s("a"), num(2.0))]);
        assert!(matches!(result, Err(RuntimeError::TypeMismatch(_))));
    }

    #[test]
    fn test_try_catch_binds_message() {
        let (_, out) = run(vec![
            Node::TryCatch {
                body: Box::new(Node::Block(vec![Node::Throw(Box::new(s("boom")))])),
                catch_var: "e".into(),
                handler: Box::new(Node::Block(vec![print(id("e"))])),
            },
            Node::TryCatch {
                body: Box::new(Node::Block(vec![print(id("ghost"))])),
                catch_var: "e".into(),
                handler: Box::new(Node::Block(vec![print(id("e"))])),
            },
        ]);
        insta::assert_snapshot!(out, @r"
        boom
        Undefined variable: ghost
        ");
    }

    #[test]
    fn test_declaration_errors() {
        let (result, _) = run(vec![let_("x", num(1.0)), let_("x", num(2.0))]);
        assert_eq!(result, Err(RuntimeError::DuplicateDeclaration("x".into())));

        let (result, _) = run(vec![
            Node::VarDecl {
                name: "k".into(),
                value: Box::new(num(1.0)),
                constant: true,
            },
            set("k", num(2.0)),
        ]);
        assert_eq!(result, Err(RuntimeError::ConstAssignment("k".into())));
    }

    #[test]
    fn test_async_call_and_await() {
        let double = Node::AsyncLambda(Rc::new(LambdaDef {
            params: vec!["x".into()],
            body: Node::Block(vec![ret(bin(BinaryOp::Mul, id("x"), num(2.0)))]),
        }));
        let (result, _) = run(vec![
            let_("f", double),
            let_("pending", call(id("f"), vec![num(21.0)])),
            Node::Await(Box::new(id("pending"))),
        ]);
        assert_eq!(result, Ok(Value::Number(42.0)));

        let (result, _) = run(vec![Node::Await(Box::new(num(5.0)))]);
        assert!(matches!(result, Err(RuntimeError::TypeMismatch(_))));
    }

    #[test]
    fn test_async_failure_surfaces_at_await() {
        let failing = Node::AsyncLambda(Rc::new(LambdaDef {
            params: vec![],
            body: Node::Block(vec![Node::Throw(Box::new(s("nope")))]),
        }));
        let (result, out) = run(vec![
            let_("f", failing),
            let_("pending", call(id("f"), vec![])),
            print(s("called")),
            Node::TryCatch {
                body: Box::new(Node::Await(Box::new(id("pending")))),
                catch_var: "e".into(),
                handler: Box::new(print(id("e"))),
            },
        ]);
        assert!(result.is_ok());
        insta::assert_snapshot!(out, @r"
        called
        nope
        ");
    }

    #[test]
    fn test_extern_calls() {
        let abs = Node::ExternCall {
            type_name: "System.Math".into(),
            method: "Abs".into(),
            args: vec![num(-4.0)],
        };
        let (result, _) = run(vec![abs]);
        assert_eq!(result, Ok(Value::Number(4.0)));

        let missing = Node::ExternCall {
            type_name: "No.Such".into(),
            method: "Thing".into(),
            args: vec![],
        };
        let (result, _) = run(vec![missing]);
        assert_eq!(result, Ok(Value::Null));

        let via_handle = call(
            member(member(id("System"), "Math"), "Max"),
            vec![num(2.0), num(9.0)],
        );
        let (result, _) = run(vec![via_handle]);
        assert_eq!(result, Ok(Value::Number(9.0)));
    }

    #[test]
    fn test_object_member_assignment_and_lookup() {
        let (result, _) = run(vec![
            let_("o", Node::Object(vec![("a".into(), Node::Object(vec![]))])),
            Node::Assign {
                target: AssignTarget::Member {
                    object: Box::new(member(id("o"), "a")),
                    property: "b".into(),
                },
                value: Box::new(num(3.0)),
            },
            member(member(id("o"), "a"), "b"),
        ]);
        assert_eq!(result, Ok(Value::Number(3.0)));

        let (result, _) = run(vec![member(Node::Object(vec![]), "nope")]);
        assert_eq!(result, Err(RuntimeError::MissingMember("nope".into())));
    }

    #[test]
    fn test_coalesce_and_unary() {
        let (result, _) = run(vec![bin(BinaryOp::Coalesce, Node::Null, num(7.0))]);
        assert_eq!(result, Ok(Value::Number(7.0)));

        let (result, _) = run(vec![Node::Unary {
            op: UnaryOp::Not,
            operand: Box::new(Node::Boolean(false)),
        }]);
        assert_eq!(result, Ok(Value::Number(1.0)));
    }

    #[test]
    fn test_import_runs_once_into_shared_scope() {
        let dir = std::env::temp_dir().join(format!("wpp-import-{}", std::process::id()));
        fs::create_dir_all(&dir).unwrap();
        let lib = vec![print(s("loading lib")), let_("shared", num(41.0))];
        fs::write(dir.join("lib.json"), serde_json::to_string(&lib).unwrap()).unwrap();

        let printer = Printer::capture();
        let mut interp = Interpreter::new(printer.clone()).with_import_root(dir.clone());
        let result = interp.run(&[
            Node::Import("lib.json".into()),
            Node::Import("lib.json".into()),
            bin(BinaryOp::Add, id("shared"), num(1.0)),
        ]);
        fs::remove_dir_all(&dir).ok();

        assert_eq!(result, Ok(Value::Number(42.0)));
        assert_eq!(printer.captured(), "loading lib\n");
    }

    #[test]
    fn test_missing_import_is_an_error() {
        let (result, _) = run(vec![Node::Import("definitely/not/here.json".into())]);
        assert!(matches!(result, Err(RuntimeError::Import(_))));
    }

    #[test]
    fn test_switch_falls_back_to_default() {
        let (result, out) = run(vec![Node::Switch {
            discriminant: Box::new(num(9.0)),
            cases: vec![
                SwitchCase {
                    value: num(1.0),
                    body: vec![print(s("one")), Node::Break],
                },
                SwitchCase {
                    value: num(2.0),
                    body: vec![print(s("two")), Node::Break],
                },
            ],
            default: Some(vec![print(s("fallback"))]),
        }]);
        assert!(result.is_ok(), "{:?}", result);
        assert_eq!(out, "fallback\n");
    }

    #[test]
    fn test_ancestor_outside_method_is_undefined() {
        let (result, _) = run(vec![Node::AncestorCall {
            method: "m".into(),
            args: vec![],
        }]);
        assert!(matches!(result, Err(RuntimeError::UndefinedEntityOrMethod(_))));
    }

    #[test]
    fn test_break_cannot_escape_function() {
        let (result, out) = run(vec![
            let_("f", lambda(&[], vec![Node::Break])),
            Node::While {
                condition: Box::new(Node::Boolean(true)),
                body: Box::new(Node::Block(vec![call(id("f"), vec![]), print(s("unreachable"))])),
            },
        ]);
        assert_eq!(
            result,
            Err(RuntimeError::ControlFlowMisuse("break outside of a loop".into()))
        );
        assert_eq!(out, "");
    }

    #[test]
    fn test_async_body_runs_at_await() {
        let slow = Node::AsyncLambda(Rc::new(LambdaDef {
            params: vec![],
            body: Node::Block(vec![print(s("io resolves")), ret(num(1.0))]),
        }));
        let task = Node::AsyncLambda(Rc::new(LambdaDef {
            params: vec![],
            body: Node::Block(vec![
                print(s("body start")),
                Node::Await(Box::new(call(id("slow"), vec![]))),
                print(s("body end")),
                ret(num(2.0)),
            ]),
        }));
        let (result, out) = run(vec![
            let_("slow", slow),
            let_("f", task),
            let_("p", call(id("f"), vec![])),
            print(s("after call")),
            Node::Await(Box::new(id("p"))),
        ]);
        assert_eq!(result, Ok(Value::Number(2.0)));
        insta::assert_snapshot!(out, @r"
        after call
        body start
        io resolves
        body end
        ");
    }

    #[test]
    fn test_awaiting_twice_runs_body_once() {
        let counted = Node::AsyncLambda(Rc::new(LambdaDef {
            params: vec![],
            body: Node::Block(vec![print(s("ran")), ret(num(7.0))]),
        }));
        let (result, out) = run(vec![
            let_("f", counted),
            let_("p", call(id("f"), vec![])),
            Node::Await(Box::new(id("p"))),
            Node::Await(Box::new(id("p"))),
        ]);
        assert_eq!(result, Ok(Value::Number(7.0)));
        assert_eq!(out, "ran\n");
    }

    #[test]
    fn test_unawaited_async_call_runs_at_program_end() {
        let late = Node::AsyncLambda(Rc::new(LambdaDef {
            params: vec![],
            body: Node::Block(vec![print(s("late"))]),
        }));
        let (result, out) = run(vec![
            let_("g", late),
            call(id("g"), vec![]),
            print(s("main done")),
        ]);
        assert!(result.is_ok(), "{:?}", result);
        insta::assert_snapshot!(out, @r"
        main done
        late
        ");
    }

    #[test]
    fn test_failed_import_can_be_retried() {
        let dir = std::env::temp_dir().join(format!("wpp-reimport-{}", std::process::id()));
        fs::create_dir_all(&dir).unwrap();
        let printer = Printer::capture();
        let mut interp = Interpreter::new(printer.clone()).with_import_root(dir.clone());
        let import = [Node::Import("late.json".into())];

        let missing = interp.run(&import);
        fs::write(dir.join("late.json"), "not json").unwrap();
        let malformed = interp.run(&import);
        let lib = vec![print(s("late lib loaded"))];
        fs::write(dir.join("late.json"), serde_json::to_string(&lib).unwrap()).unwrap();
        let loaded = interp.run(&import);
        fs::remove_dir_all(&dir).ok();

        assert!(matches!(missing, Err(RuntimeError::Import(_))));
        assert!(matches!(malformed, Err(RuntimeError::Import(_))));
        assert_eq!(loaded, Ok(Value::Null));
        assert_eq!(printer.captured(), "late lib loaded\n");
    }

    #[test]
    fn test_object_keeps_insertion_order() {
        let literal = Node::Object(vec![("zeta".into(), num(1.0)), ("alpha".into(), num(2.0))]);
        let (result, out) = run(vec![
            let_("o", literal),
            print(id("o")),
            print(call(member(id("json"), "stringify"), vec![id("o")])),
            call(
                member(id("json"), "parse"),
                vec![s(r#"{"zeta": 1, "alpha": 2}"#)],
            ),
        ]);
        assert_eq!(result.map(|v| v.to_string()), Ok("{zeta: 1, alpha: 2}".to_string()));
        insta::assert_snapshot!(out, @r#"
        {zeta: 1, alpha: 2}
        {"zeta":1,"alpha":2}
        "#);
    }
}
