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

use crate::runtime::{Printer, RuntimeError, Value};
use std::collections::HashMap;
use std::fmt;
use std::rc::Rc;

pub type ExternFn = Rc<dyn Fn(&[Value]) -> Result<Value, RuntimeError>>;

/// Resolves `externcall(Type, Method, args...)` against the host.
pub trait HostBridge {
    fn invoke(&self, type_name: &str, method: &str, args: &[Value]) -> Result<Value, RuntimeError>;

    /// Whether `name` is a host type or namespace prefix, so a bare
    /// identifier can stand for an extern handle.
    fn knows_type(&self, _name: &str) -> bool {
        false
    }
}

#[derive(Clone)]
struct Overload {
    /// `None` accepts any argument count.
    arity: Option<usize>,
    func: ExternFn,
}

/// Explicit `(type, method) -> overloads` table standing in for host
/// reflection. Exact-arity overloads win over variadic ones.
#[derive(Clone, Default)]
pub struct ExternRegistry {
    entries: HashMap<(String, String), Vec<Overload>>,
}

impl ExternRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F>(&mut self, type_name: &str, method: &str, arity: Option<usize>, func: F)
    where
        F: Fn(&[Value]) -> Result<Value, RuntimeError> + 'static,
    {
        self.entries
            .entry((type_name.to_string(), method.to_string()))
            .or_default()
            .push(Overload {
                arity,
                func: Rc::new(func),
            });
    }

    /// The stock host surface: string helpers, `System.Math` and console output.
    pub fn with_defaults(printer: &Printer) -> Self {
        let mut reg = Self::new();

        reg.register("System.String", "Concat", None, |args| {
            Ok(Value::String(args.iter().map(|a| a.to_string()).collect()))
        });
        reg.register("System.String", "Length", Some(1), |args| match &args[0] {
            Value::String(s) => Ok(Value::Number(s.chars().count() as f64)),
            other => Err(RuntimeError::type_mismatch("string", other)),
        });

        reg.register("System.Math", "Abs", Some(1), |args| unary(args, f64::abs));
        reg.register("System.Math", "Sqrt", Some(1), |args| unary(args, f64::sqrt));
        reg.register("System.Math", "Floor", Some(1), |args| unary(args, f64::floor));
        reg.register("System.Math", "Max", Some(2), |args| binary(args, f64::max));
        reg.register("System.Math", "Min", Some(2), |args| binary(args, f64::min));
        reg.register("System.Math", "Pow", Some(2), |args| binary(args, f64::powf));

        let out = printer.clone();
        reg.register("System.Console", "WriteLine", None, move |args| {
            let line: Vec<String> = args.iter().map(|a| a.to_string()).collect();
            out.print_line(&line.join(" "));
            Ok(Value::Null)
        });

        reg
    }
}

fn unary(args: &[Value], f: fn(f64) -> f64) -> Result<Value, RuntimeError> {
    Ok(Value::Number(f(args[0].to_number()?)))
}

fn binary(args: &[Value], f: fn(f64, f64) -> f64) -> Result<Value, RuntimeError> {
    Ok(Value::Number(f(args[0].to_number()?, args[1].to_number()?)))
}

impl HostBridge for ExternRegistry {
    fn invoke(&self, type_name: &str, method: &str, args: &[Value]) -> Result<Value, RuntimeError> {
        let overloads = match self.entries.get(&(type_name.to_string(), method.to_string())) {
            Some(o) => o,
            None if !self.entries.keys().any(|(t, _)| t == type_name) => {
                return Err(RuntimeError::Host(format!("Type '{}' not found", type_name)));
            }
            None => {
                return Err(RuntimeError::Host(format!(
                    "Method '{}' not found on type '{}'",
                    method, type_name
                )));
            }
        };

        let chosen = overloads
            .iter()
            .find(|o| o.arity == Some(args.len()))
            .or_else(|| overloads.iter().find(|o| o.arity.is_none()))
            .ok_or_else(|| {
                RuntimeError::Host(format!(
                    "No overload of {}.{} takes {} argument(s)",
                    type_name,
                    method,
                    args.len()
                ))
            })?;
        (chosen.func)(args)
    }

    fn knows_type(&self, name: &str) -> bool {
        self.entries.keys().any(|(t, _)| {
            t == name || (t.starts_with(name) && t[name.len()..].starts_with('.'))
        })
    }
}

impl fmt::Debug for ExternRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<String> = self
            .entries
            .keys()
            .map(|(t, m)| format!("{}.{}", t, m))
            .collect();
        names.sort();
        f.debug_struct("ExternRegistry").field("entries", &names).finish()
    }
}
