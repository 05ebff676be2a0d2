/*
 * Copyright (c) 2026 Mohamad Al-Zawahreh (dba Sovereign Systems).
 *
 * This file is part of the W++ Runtime.
 *
 * LICENSE: DUAL-LICENSED (AGPLv3 or COMMERCIAL).
 */

//! Compiled execution backends.
//!
//! Both backends accept only a subset of the language and fail at compile
//! time on anything outside it. The bytecode VM is the reference compiled
//! backend; the native backend trades range for speed and works on 32-bit
//! integers.

use crate::ast::Node;
use crate::bytecode::Function;
use crate::compiler::Compiler;
use crate::config::BackendKind;
use crate::runtime::{Printer, RuntimeError, Value};
use crate::vm::VM;
use crate::wasm_codegen::WasmCodegen;
use crate::wasm_runner::NativeModule;
use std::rc::Rc;
use tracing::debug;

pub trait CompiledBackend {
    fn name(&self) -> &'static str;

    fn compile(&self, program: &[Node]) -> Result<Box<dyn Executable>, RuntimeError>;
}

/// A compiled program. Each `run` starts from a clean state.
pub trait Executable {
    fn run(&mut self, printer: &Printer) -> Result<Value, RuntimeError>;
}

pub struct BytecodeBackend;

struct BytecodeProgram {
    main: Rc<Function>,
}

impl CompiledBackend for BytecodeBackend {
    fn name(&self) -> &'static str {
        "bytecode"
    }

    fn compile(&self, program: &[Node]) -> Result<Box<dyn Executable>, RuntimeError> {
        let main = Compiler::compile_program(program)?;
        debug!(ops = main.chunk.len(), "bytecode compiled");
        Ok(Box::new(BytecodeProgram {
            main: Rc::new(main),
        }))
    }
}

impl Executable for BytecodeProgram {
    fn run(&mut self, printer: &Printer) -> Result<Value, RuntimeError> {
        VM::new(self.main.clone(), printer.clone()).run()
    }
}

pub struct NativeBackend;

struct NativeProgram {
    module: NativeModule,
}

impl CompiledBackend for NativeBackend {
    fn name(&self) -> &'static str {
        "native"
    }

    fn compile(&self, program: &[Node]) -> Result<Box<dyn Executable>, RuntimeError> {
        let bytes = WasmCodegen::compile_to_bytes(program)?;
        let module = NativeModule::load(&bytes)?;
        Ok(Box::new(NativeProgram { module }))
    }
}

impl Executable for NativeProgram {
    fn run(&mut self, printer: &Printer) -> Result<Value, RuntimeError> {
        let result = self.module.run(printer)?;
        Ok(Value::Number(f64::from(result)))
    }
}

/// The compiled backend for `kind`, or `None` for the evaluator.
pub fn backend_for(kind: BackendKind) -> Option<Box<dyn CompiledBackend>> {
    match kind {
        BackendKind::Evaluator => None,
        BackendKind::Bytecode => Some(Box::new(BytecodeBackend)),
        BackendKind::Native => Some(Box::new(NativeBackend)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loader::load_program;

    const COUNTDOWN: &str = r#"[
        {"VarDecl": {"name": "n", "value": {"Number": 3}}},
        {"While": {
            "condition": {"Binary": {"op": ">", "left": {"Identifier": "n"}, "right": {"Number": 0}}},
            "body": {"Block": [
                {"Print": {"Identifier": "n"}},
                {"Assign": {"target": {"Variable": "n"}, "value": {"Binary": {"op": "-", "left": {"Identifier": "n"}, "right": {"Number": 1}}}}}
            ]}
        }},
        {"Return": {"Binary": {"op": "*", "left": {"Number": 6}, "right": {"Number": 7}}}}
    ]"#;

    fn compile_and_run(kind: BackendKind, json: &str) -> (Result<Value, RuntimeError>, String) {
        let program = load_program(json).unwrap();
        let backend = backend_for(kind).unwrap();
        let printer = Printer::capture();
        let result = backend
            .compile(&program)
            .and_then(|mut exe| exe.run(&printer));
        (result, printer.captured())
    }

    #[test]
    fn test_backends_agree_on_integer_program() {
        for kind in [BackendKind::Bytecode, BackendKind::Native] {
            let (result, out) = compile_and_run(kind, COUNTDOWN);
            assert_eq!(result, Ok(Value::Number(42.0)), "backend {:?}", kind);
            assert_eq!(out, "3\n2\n1\n", "backend {:?}", kind);
        }
    }

    #[test]
    fn test_executable_reruns_from_clean_state() {
        let program = load_program(COUNTDOWN).unwrap();
        let mut exe = BytecodeBackend.compile(&program).unwrap();
        let printer = Printer::capture();
        exe.run(&printer).unwrap();
        exe.run(&printer).unwrap();
        assert_eq!(printer.captured(), "3\n2\n1\n3\n2\n1\n");
    }

    #[test]
    fn test_native_truncates_integer_division() {
        let json = r#"[{"Print": {"Binary": {"op": "/", "left": {"Number": 7}, "right": {"Number": 2}}}}]"#;
        let (_, native) = compile_and_run(BackendKind::Native, json);
        let (_, bytecode) = compile_and_run(BackendKind::Bytecode, json);
        assert_eq!(native, "3\n");
        assert_eq!(bytecode, "3.5\n");
    }

    #[test]
    fn test_entities_rejected_by_compiled_backends() {
        let json = r#"[{"Entity": {"name": "Cat", "methods": []}}]"#;
        for kind in [BackendKind::Bytecode, BackendKind::Native] {
            let (result, _) = compile_and_run(kind, json);
            assert_eq!(
                result,
                Err(RuntimeError::UnsupportedNode("Entity".to_string())),
                "backend {:?}",
                kind
            );
        }
    }

    #[test]
    fn test_switch_default_only_on_native() {
        let json = r#"[{"Switch": {
            "discriminant": {"Number": 5},
            "cases": [{"value": {"Number": 1}, "body": [{"Print": {"Number": 1}}]}],
            "default": [{"Print": {"Number": 0}}]
        }}]"#;
        let (result, out) = compile_and_run(BackendKind::Native, json);
        assert!(result.is_ok(), "{:?}", result);
        assert_eq!(out, "0\n");

        let (result, _) = compile_and_run(BackendKind::Bytecode, json);
        assert_eq!(result, Err(RuntimeError::UnsupportedNode("Switch".to_string())));
    }

    #[test]
    fn test_evaluator_has_no_compiled_backend() {
        assert!(backend_for(BackendKind::Evaluator).is_none());
        assert_eq!(backend_for(BackendKind::Native).unwrap().name(), "native");
    }
}
