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

use clap::Parser;
use std::env;
use std::path::Path;
use std::process::ExitCode;
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;
use wpp_runtime::backend::backend_for;
use wpp_runtime::config::{Cli, RuntimeConfig, BACKEND_ENV};
use wpp_runtime::eval::Interpreter;
use wpp_runtime::loader::load_program_file;
use wpp_runtime::runtime::{Printer, RuntimeError, Value};

fn install_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

fn execute(
    config: &RuntimeConfig,
    program_path: &Path,
    printer: &Printer,
) -> Result<Value, String> {
    let program = load_program_file(program_path).map_err(|e| format!("Load Error: {}", e))?;
    info!(backend = %config.backend, statements = program.len(), "program loaded");

    let result: Result<Value, RuntimeError> = match backend_for(config.backend) {
        Some(backend) => {
            debug!(backend = backend.name(), "compiling");
            backend
                .compile(&program)
                .and_then(|mut exe| exe.run(printer))
        }
        None => {
            let import_root = config
                .import_root
                .clone()
                .or_else(|| program_path.parent().map(Path::to_path_buf))
                .unwrap_or_else(|| ".".into());
            Interpreter::new(printer.clone())
                .with_import_root(import_root)
                .run(&program)
        }
    };
    result.map_err(|e| format!("Execution Error: {}", e))
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    install_tracing();

    let env_backend = env::var(BACKEND_ENV).ok();
    let invocation = match cli.resolve(env_backend.as_deref()) {
        Ok(inv) => inv,
        Err(e) => {
            eprintln!("{}", e);
            return ExitCode::from(2);
        }
    };

    let config = &invocation.config;
    let printer = if config.capture_output {
        Printer::capture()
    } else {
        Printer::stdout()
    };

    let outcome = execute(config, &invocation.program, &printer);
    if config.capture_output {
        print!("{}", printer.captured());
    }

    match outcome {
        Ok(Value::Null) => ExitCode::SUCCESS,
        Ok(value) => {
            println!("Execution Result: {}", value);
            ExitCode::SUCCESS
        }
        Err(message) => {
            eprintln!("{}", message);
            ExitCode::FAILURE
        }
    }
}
