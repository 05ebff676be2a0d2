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

pub mod ast;
pub mod backend;
pub mod bridge;
pub mod bytecode;
pub mod compiler;
pub mod config;
pub mod entity;
pub mod eval;
pub mod intrinsics;
pub mod loader;
pub mod runtime;
pub mod vm;
pub mod wasm_codegen;
pub mod wasm_runner;

pub use eval::Interpreter;
pub use runtime::{Printer, RuntimeError, Value};
