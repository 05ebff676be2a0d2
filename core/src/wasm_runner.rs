/*
 * Copyright (c) 2026 Mohamad Al-Zawahreh (dba Sovereign Systems).
 *
 * Wasmtime Runtime Execution for W++ native modules.
 *
 * JIT-compiles the modules produced by wasm_codegen.rs with wasmtime and
 * runs their `main` export. The module imports a handful of host functions
 * from `wpp_host`: integer and string printing, the future table used by
 * async lambdas, and a division-by-zero report hook.
 *
 * LICENSE: DUAL-LICENSED (AGPLv3 or COMMERCIAL).
 */

use crate::runtime::{Printer, RuntimeError};
use crate::wasm_codegen::{ENTRY_EXPORT, HOST_MODULE, MEMORY_EXPORT};
use std::fmt;
use tracing::{debug, warn};
use wasmtime::{Caller, Engine, Extern, Linker, Module, Store};

// =============================================================================
// Error Types
// =============================================================================

#[derive(Debug, Clone)]
pub struct WasmRunError {
    pub message: String,
    pub context: String,
}

impl fmt::Display for WasmRunError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "[{}] {}", self.context, self.message)
    }
}

impl std::error::Error for WasmRunError {}

impl From<WasmRunError> for RuntimeError {
    fn from(err: WasmRunError) -> Self {
        RuntimeError::VmFault(err.to_string())
    }
}

// =============================================================================
// Host State
// =============================================================================

/// Future handles count up from `i32::MIN` so ordinary integers are never
/// mistaken for them.
const FUTURE_HANDLE_BASE: i64 = i32::MIN as i64;

/// State shared with the host imports during one run.
#[derive(Debug, Default)]
pub struct HostState {
    /// Lines printed by the module, forwarded to the printer after the run.
    pub lines: Vec<String>,
    /// Resolved values of async lambda calls, indexed by handle.
    pub futures: Vec<i32>,
    /// The runtime error a host import reported before trapping.
    pub fault: Option<RuntimeError>,
}

impl HostState {
    fn resolve(&mut self, value: i32) -> i32 {
        self.futures.push(value);
        (FUTURE_HANDLE_BASE + self.futures.len() as i64 - 1) as i32
    }

    fn await_handle(&self, handle: i32) -> Option<i32> {
        let index = i64::from(handle) - FUTURE_HANDLE_BASE;
        usize::try_from(index)
            .ok()
            .and_then(|i| self.futures.get(i))
            .copied()
    }
}

// =============================================================================
// Public API
// =============================================================================

/// A validated, JIT-compiled native module ready to run.
pub struct NativeModule {
    engine: Engine,
    module: Module,
}

impl NativeModule {
    pub fn load(bytes: &[u8]) -> Result<Self, WasmRunError> {
        validate_wasm(bytes)?;
        let engine = Engine::default();
        let module = Module::from_binary(&engine, bytes).map_err(|e| WasmRunError {
            message: format!("Failed to load WASM module: {}", e),
            context: "native::load".to_string(),
        })?;
        debug!(size = bytes.len(), "native module compiled");
        Ok(Self { engine, module })
    }

    /// Instantiate the module in a fresh store and call its entry point.
    /// Printed lines reach `printer` even when the run traps.
    pub fn run(&self, printer: &Printer) -> Result<i32, RuntimeError> {
        let mut linker = Linker::<HostState>::new(&self.engine);
        link_host_imports(&mut linker)?;

        let mut store = Store::new(&self.engine, HostState::default());
        let instance = linker
            .instantiate(&mut store, &self.module)
            .map_err(|e| WasmRunError {
                message: format!("Failed to instantiate: {}", e),
                context: "native::instantiate".to_string(),
            })?;

        let entry = instance
            .get_typed_func::<(), i32>(&mut store, ENTRY_EXPORT)
            .map_err(|e| WasmRunError {
                message: format!("No {} export: {}", ENTRY_EXPORT, e),
                context: "native::get_entry".to_string(),
            })?;

        let outcome = entry.call(&mut store, ());
        let state = store.into_data();
        for line in &state.lines {
            printer.print_line(line);
        }

        match outcome {
            Ok(value) => Ok(value),
            Err(trap) => {
                if let Some(fault) = state.fault {
                    return Err(fault);
                }
                warn!(error = %trap, "native execution trapped");
                Err(RuntimeError::VmFault(format!("execution trapped: {}", trap)))
            }
        }
    }
}

/// Compile and run a native module in one step.
pub fn run_wasm(bytes: &[u8], printer: &Printer) -> Result<i32, RuntimeError> {
    NativeModule::load(bytes)?.run(printer)
}

/// Validate a WASM binary without executing it.
pub fn validate_wasm(bytes: &[u8]) -> Result<(), WasmRunError> {
    wasmparser::Validator::new()
        .validate_all(bytes)
        .map(|_| ())
        .map_err(|e| WasmRunError {
            message: format!("Invalid WASM module: {}", e),
            context: "native::validate".to_string(),
        })
}

// =============================================================================
// Host Imports
// =============================================================================

fn link_error(name: &str, e: impl fmt::Display) -> WasmRunError {
    WasmRunError {
        message: format!("Failed to link {}: {}", name, e),
        context: "native::link".to_string(),
    }
}

fn link_host_imports(linker: &mut Linker<HostState>) -> Result<(), WasmRunError> {
    linker
        .func_wrap(
            HOST_MODULE,
            "print_int",
            |mut caller: Caller<'_, HostState>, value: i32| {
                caller.data_mut().lines.push(value.to_string());
            },
        )
        .map_err(|e| link_error("print_int", e))?;

    linker
        .func_wrap(
            HOST_MODULE,
            "print_str",
            |mut caller: Caller<'_, HostState>, ptr: i32, len: i32| -> wasmtime::Result<()> {
                let text = match caller.get_export(MEMORY_EXPORT) {
                    Some(Extern::Memory(memory)) => {
                        let start = ptr as u32 as usize;
                        let end = start.saturating_add(len as u32 as usize);
                        memory
                            .data(&caller)
                            .get(start..end)
                            .map(|bytes| String::from_utf8_lossy(bytes).into_owned())
                    }
                    _ => None,
                };
                match text {
                    Some(text) => {
                        caller.data_mut().lines.push(text);
                        Ok(())
                    }
                    None => {
                        let fault = RuntimeError::VmFault(format!(
                            "string out of bounds at {} (+{})",
                            ptr, len
                        ));
                        caller.data_mut().fault = Some(fault.clone());
                        Err(wasmtime::Error::msg(fault.to_string()))
                    }
                }
            },
        )
        .map_err(|e| link_error("print_str", e))?;

    linker
        .func_wrap(
            HOST_MODULE,
            "future_resolve",
            |mut caller: Caller<'_, HostState>, value: i32| -> i32 {
                caller.data_mut().resolve(value)
            },
        )
        .map_err(|e| link_error("future_resolve", e))?;

    linker
        .func_wrap(
            HOST_MODULE,
            "future_await",
            |mut caller: Caller<'_, HostState>, handle: i32| -> wasmtime::Result<i32> {
                match caller.data().await_handle(handle) {
                    Some(value) => Ok(value),
                    None => {
                        let fault = RuntimeError::TypeMismatch(format!(
                            "await expects a future, got {}",
                            handle
                        ));
                        caller.data_mut().fault = Some(fault.clone());
                        Err(wasmtime::Error::msg(fault.to_string()))
                    }
                }
            },
        )
        .map_err(|e| link_error("future_await", e))?;

    linker
        .func_wrap(
            HOST_MODULE,
            "div_zero",
            |mut caller: Caller<'_, HostState>| {
                caller.data_mut().fault = Some(RuntimeError::DivideByZero);
            },
        )
        .map_err(|e| link_error("div_zero", e))?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loader::load_program;
    use crate::wasm_codegen::WasmCodegen;

    fn run(json: &str) -> (Result<i32, RuntimeError>, String) {
        let program = load_program(json).expect("program should parse");
        let bytes = WasmCodegen::compile_to_bytes(&program).expect("compile failed");
        let printer = Printer::capture();
        let result = run_wasm(&bytes, &printer);
        (result, printer.captured())
    }

    #[test]
    fn test_prints_integers_and_strings() {
        let (result, out) = run(
            r#"[
                {"Print": {"Binary": {"op": "+", "left": {"Number": 40}, "right": {"Number": 2}}}},
                {"Print": {"Str": "hello"}}
            ]"#,
        );
        assert_eq!(result, Ok(0));
        assert_eq!(out, "42\nhello\n");
    }

    #[test]
    fn test_loop_with_continue_and_break() {
        let (result, out) = run(
            r#"[
                {"VarDecl": {"name": "total", "value": {"Number": 0}}},
                {"For": {
                    "init": {"VarDecl": {"name": "i", "value": {"Number": 0}}},
                    "condition": {"Binary": {"op": "<", "left": {"Identifier": "i"}, "right": {"Number": 100}}},
                    "increment": {"Assign": {"target": {"Variable": "i"}, "value": {"Binary": {"op": "+", "left": {"Identifier": "i"}, "right": {"Number": 1}}}}},
                    "body": {"Block": [
                        {"If": {"condition": {"Binary": {"op": "==", "left": {"Identifier": "i"}, "right": {"Number": 2}}}, "then_branch": "Continue"}},
                        {"If": {"condition": {"Binary": {"op": ">", "left": {"Identifier": "i"}, "right": {"Number": 4}}}, "then_branch": "Break"}},
                        {"Assign": {"target": {"Variable": "total"}, "value": {"Binary": {"op": "+", "left": {"Identifier": "total"}, "right": {"Identifier": "i"}}}}}
                    ]}
                }},
                {"Print": {"Identifier": "total"}}
            ]"#,
        );
        assert_eq!(result, Ok(0));
        // 0 + 1 + 3 + 4
        assert_eq!(out, "8\n");
    }

    #[test]
    fn test_switch_picks_matching_case() {
        let (_, out) = run(
            r#"[
                {"Switch": {
                    "discriminant": {"Number": 2},
                    "cases": [
                        {"value": {"Number": 1}, "body": [{"Print": {"Str": "one"}}]},
                        {"value": {"Number": 2}, "body": [{"Print": {"Str": "two"}}, "Break", {"Print": {"Str": "unreached"}}]}
                    ],
                    "default": [{"Print": {"Str": "other"}}]
                }}
            ]"#,
        );
        assert_eq!(out, "two\n");
    }

    #[test]
    fn test_switch_without_match_runs_default() {
        let (result, out) = run(
            r#"[
                {"Switch": {
                    "discriminant": {"Number": 7},
                    "cases": [
                        {"value": {"Number": 1}, "body": [{"Print": {"Str": "one"}}, "Break"]},
                        {"value": {"Number": 2}, "body": [{"Print": {"Str": "two"}}, "Break"]}
                    ],
                    "default": [{"Print": {"Str": "other"}}]
                }},
                {"Print": {"Str": "after"}}
            ]"#,
        );
        assert!(result.is_ok(), "{:?}", result);
        assert_eq!(out, "other\nafter\n");
    }

    #[test]
    fn test_lambda_call_and_top_level_return() {
        let (result, out) = run(
            r#"[
                {"VarDecl": {"name": "mul", "value": {"Lambda": {"params": ["a", "b"], "body": {"Block": [
                    {"Return": {"Binary": {"op": "*", "left": {"Identifier": "a"}, "right": {"Identifier": "b"}}}}
                ]}}}}},
                {"Print": {"Call": {"callee": {"Identifier": "mul"}, "args": [{"Number": 6}, {"Number": 7}]}}},
                {"Return": {"Number": 9}}
            ]"#,
        );
        assert_eq!(result, Ok(9));
        assert_eq!(out, "42\n");
    }

    #[test]
    fn test_async_lambda_awaits_resolved_value() {
        let (result, out) = run(
            r#"[
                {"VarDecl": {"name": "later", "value": {"AsyncLambda": {"params": ["n"], "body": {"Binary": {"op": "+", "left": {"Identifier": "n"}, "right": {"Number": 1}}}}}}},
                {"Print": {"Await": {"Call": {"callee": {"Identifier": "later"}, "args": [{"Number": 41}]}}}}
            ]"#,
        );
        assert_eq!(result, Ok(0));
        assert_eq!(out, "42\n");
    }

    #[test]
    fn test_await_on_plain_integer_is_type_mismatch() {
        let (result, _) = run(r#"[{"Print": {"Await": {"Number": 3}}}]"#);
        assert!(matches!(result, Err(RuntimeError::TypeMismatch(_))));
    }

    #[test]
    fn test_division_by_zero_reported() {
        let (result, out) = run(
            r#"[
                {"Print": {"Number": 1}},
                {"VarDecl": {"name": "zero", "value": {"Number": 0}}},
                {"Print": {"Binary": {"op": "/", "left": {"Number": 10}, "right": {"Identifier": "zero"}}}}
            ]"#,
        );
        assert_eq!(result, Err(RuntimeError::DivideByZero));
        assert_eq!(out, "1\n");
    }

    #[test]
    fn test_invalid_module_rejected() {
        let err = NativeModule::load(b"not wasm").err().expect("load should fail");
        assert_eq!(err.context, "native::validate");
    }

    #[test]
    fn test_future_handles_do_not_collide_with_small_integers() {
        let mut state = HostState::default();
        let handle = state.resolve(7);
        assert_eq!(state.await_handle(handle), Some(7));
        assert_eq!(state.await_handle(0), None);
        assert_eq!(state.await_handle(-1), None);
    }
}
