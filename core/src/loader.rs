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

use crate::ast::Node;
use serde::Deserialize;
use serde_json::from_str;
use std::fs;
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum LoadError {
    #[error("JSON Parse Error: {0}")]
    ParseError(#[from] serde_json::Error),
    #[error("I/O Error: {0}")]
    Io(#[from] std::io::Error),
}

/// The parser seam. Turns source text into top-level statements; the
/// runtime does no syntax checking of its own.
pub trait Frontend {
    fn parse(&self, source: &str) -> Result<Vec<Node>, LoadError>;
}

/// Reads programs already lowered to the JSON AST form.
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonFrontend;

impl Frontend for JsonFrontend {
    fn parse(&self, source: &str) -> Result<Vec<Node>, LoadError> {
        load_program(source)
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum Document {
    Many(Vec<Node>),
    One(Node),
}

/// Accepts either a single statement or an array of statements.
pub fn load_program(json: &str) -> Result<Vec<Node>, LoadError> {
    let doc: Document = from_str(json)?;
    Ok(match doc {
        Document::Many(nodes) => nodes,
        Document::One(node) => vec![node],
    })
}

pub fn load_program_file(path: &Path) -> Result<Vec<Node>, LoadError> {
    let text = fs::read_to_string(path)?;
    load_program(&text)
}
