/*
 * Copyright (c) 2026 Mohamad Al-Zawahreh (dba Sovereign Systems).
 *
 * This file is part of the W++ Runtime.
 *
 * LICENSE: DUAL-LICENSED (AGPLv3 or COMMERCIAL).
 */

use clap::Parser;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use thiserror::Error;

/// Environment variable naming the backend, overridden by command-line flags.
pub const BACKEND_ENV: &str = "WPP_BACKEND";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Unknown backend '{0}' (expected evaluator, bytecode or native)")]
    UnknownBackend(String),
    #[error("Failed to read config: {0}")]
    Io(#[from] std::io::Error),
    #[error("Invalid config: {0}")]
    Parse(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    #[default]
    Evaluator,
    Bytecode,
    Native,
}

impl FromStr for BackendKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "evaluator" | "eval" => Ok(BackendKind::Evaluator),
            "bytecode" | "vm" | "jit" => Ok(BackendKind::Bytecode),
            "native" => Ok(BackendKind::Native),
            _ => Err(ConfigError::UnknownBackend(s.to_string())),
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            BackendKind::Evaluator => "evaluator",
            BackendKind::Bytecode => "bytecode",
            BackendKind::Native => "native",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    pub backend: BackendKind,
    /// Base directory for relative imports. Defaults to the program's directory.
    pub import_root: Option<PathBuf>,
    /// Buffer program output and emit it after the run completes.
    pub capture_output: bool,
}

impl RuntimeConfig {
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        Self::from_json(&fs::read_to_string(path)?)
    }
}

/// Command line for `wpp_run`. Flags override `WPP_BACKEND`, which
/// overrides the `--config` file, which overrides the defaults.
#[derive(Debug, Parser)]
#[command(name = "wpp_run", version, about = "Run a W++ program from its JSON syntax tree")]
pub struct Cli {
    /// JSON config file
    #[arg(long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// evaluator, bytecode or native
    #[arg(long, value_name = "NAME", conflicts_with_all = ["jit", "vm", "native"])]
    pub backend: Option<BackendKind>,

    /// Base directory for relative imports
    #[arg(long, value_name = "DIR")]
    pub import_root: Option<PathBuf>,

    /// Buffer program output until the run completes
    #[arg(long)]
    pub capture: bool,

    /// Run on the bytecode VM
    #[arg(long, conflicts_with = "native")]
    pub jit: bool,

    /// Same as --jit
    #[arg(long, conflicts_with = "native")]
    pub vm: bool,

    /// Compile to WebAssembly and run natively
    #[arg(long)]
    pub native: bool,

    /// Program file (a JSON syntax tree)
    pub program: PathBuf,
}

/// A resolved command line: what to run and how.
#[derive(Debug, Clone, PartialEq)]
pub struct Invocation {
    pub config: RuntimeConfig,
    pub program: PathBuf,
}

impl Cli {
    fn flag_backend(&self) -> Option<BackendKind> {
        if self.native {
            Some(BackendKind::Native)
        } else if self.jit || self.vm {
            Some(BackendKind::Bytecode)
        } else {
            self.backend
        }
    }

    /// Merge defaults, the config file, `env_backend` and the flags.
    pub fn resolve(self, env_backend: Option<&str>) -> Result<Invocation, ConfigError> {
        let mut config = match &self.config {
            Some(path) => RuntimeConfig::load(path)?,
            None => RuntimeConfig::default(),
        };
        if let Some(value) = env_backend.filter(|v| !v.trim().is_empty()) {
            config.backend = value.parse()?;
        }
        if let Some(kind) = self.flag_backend() {
            config.backend = kind;
        }
        if self.import_root.is_some() {
            config.import_root = self.import_root;
        }
        config.capture_output |= self.capture;

        Ok(Invocation {
            config,
            program: self.program,
        })
    }
}
