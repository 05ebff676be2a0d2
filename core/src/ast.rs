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

use serde::{Deserialize, Serialize};
use std::rc::Rc;

/// A W++ program node as delivered by the parser front end.
///
/// Nodes are immutable once loaded. Lambda, entity and method bodies sit
/// behind `Rc` so closures and the entity origin table can hold on to them
/// without deep copies.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum Node {
    Number(f64),
    Str(String),
    Boolean(bool),
    Null,
    Identifier(String),
    Unary {
        op: UnaryOp,
        operand: Box<Node>,
    },
    Binary {
        op: BinaryOp,
        left: Box<Node>,
        right: Box<Node>,
    },
    Assign {
        target: AssignTarget,
        value: Box<Node>,
    },
    VarDecl {
        name: String,
        value: Box<Node>,
        #[serde(default)]
        constant: bool,
    },
    Block(Vec<Node>),
    If {
        condition: Box<Node>,
        then_branch: Box<Node>,
        #[serde(default)]
        else_branch: Option<Box<Node>>,
    },
    While {
        condition: Box<Node>,
        body: Box<Node>,
    },
    For {
        #[serde(default)]
        init: Option<Box<Node>>,
        #[serde(default)]
        condition: Option<Box<Node>>,
        #[serde(default)]
        increment: Option<Box<Node>>,
        body: Box<Node>,
    },
    Switch {
        discriminant: Box<Node>,
        cases: Vec<SwitchCase>,
        #[serde(default)]
        default: Option<Vec<Node>>,
    },
    Break,
    Continue,
    Return(Option<Box<Node>>),
    Throw(Box<Node>),
    TryCatch {
        body: Box<Node>,
        catch_var: String,
        handler: Box<Node>,
    },
    Lambda(Rc<LambdaDef>),
    AsyncLambda(Rc<LambdaDef>),
    Await(Box<Node>),
    Call {
        callee: Box<Node>,
        #[serde(default)]
        args: Vec<Node>,
    },
    Member {
        object: Box<Node>,
        property: String,
    },
    Object(Vec<(String, Node)>),
    List(Vec<Node>),
    Print(Box<Node>),
    Import(String),
    Entity(Rc<EntityDecl>),
    Alter {
        target: String,
        methods: Vec<Rc<MethodDef>>,
    },
    New(String),
    AncestorCall {
        method: String,
        #[serde(default)]
        args: Vec<Node>,
    },
    Me,
    ExternCall {
        type_name: String,
        method: String,
        #[serde(default)]
        args: Vec<Node>,
    },
}

impl Node {
    /// Variant name, used in backend diagnostics.
    pub fn kind_name(&self) -> &'static str {
        match self {
            Node::Number(_) => "Number",
            Node::Str(_) => "Str",
            Node::Boolean(_) => "Boolean",
            Node::Null => "Null",
            Node::Identifier(_) => "Identifier",
            Node::Unary { .. } => "Unary",
            Node::Binary { .. } => "Binary",
            Node::Assign { .. } => "Assign",
            Node::VarDecl { .. } => "VarDecl",
            Node::Block(_) => "Block",
            Node::If { .. } => "If",
            Node::While { .. } => "While",
            Node::For { .. } => "For",
            Node::Switch { .. } => "Switch",
            Node::Break => "Break",
            Node::Continue => "Continue",
            Node::Return(_) => "Return",
            Node::Throw(_) => "Throw",
            Node::TryCatch { .. } => "TryCatch",
            Node::Lambda(_) => "Lambda",
            Node::AsyncLambda(_) => "AsyncLambda",
            Node::Await(_) => "Await",
            Node::Call { .. } => "Call",
            Node::Member { .. } => "Member",
            Node::Object(_) => "Object",
            Node::List(_) => "List",
            Node::Print(_) => "Print",
            Node::Import(_) => "Import",
            Node::Entity(_) => "Entity",
            Node::Alter { .. } => "Alter",
            Node::New(_) => "New",
            Node::AncestorCall { .. } => "AncestorCall",
            Node::Me => "Me",
            Node::ExternCall { .. } => "ExternCall",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum UnaryOp {
    #[serde(rename = "!")]
    Not,
    #[serde(rename = "-")]
    Neg,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum BinaryOp {
    #[serde(rename = "+")]
    Add,
    #[serde(rename = "-")]
    Sub,
    #[serde(rename = "*")]
    Mul,
    #[serde(rename = "/")]
    Div,
    #[serde(rename = "%")]
    Mod,
    #[serde(rename = "==")]
    Eq,
    #[serde(rename = "!=")]
    Ne,
    #[serde(rename = "<")]
    Lt,
    #[serde(rename = ">")]
    Gt,
    #[serde(rename = "<=")]
    Le,
    #[serde(rename = ">=")]
    Ge,
    #[serde(rename = "&&")]
    And,
    #[serde(rename = "||")]
    Or,
    #[serde(rename = "??")]
    Coalesce,
}

impl BinaryOp {
    pub fn symbol(&self) -> &'static str {
        match self {
            BinaryOp::Add => "+",
            BinaryOp::Sub => "-",
            BinaryOp::Mul => "*",
            BinaryOp::Div => "/",
            BinaryOp::Mod => "%",
            BinaryOp::Eq => "==",
            BinaryOp::Ne => "!=",
            BinaryOp::Lt => "<",
            BinaryOp::Gt => ">",
            BinaryOp::Le => "<=",
            BinaryOp::Ge => ">=",
            BinaryOp::And => "&&",
            BinaryOp::Or => "||",
            BinaryOp::Coalesce => "??",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum AssignTarget {
    Variable(String),
    Member { object: Box<Node>, property: String },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SwitchCase {
    pub value: Node,
    pub body: Vec<Node>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LambdaDef {
    pub params: Vec<String>,
    pub body: Node,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MethodDef {
    pub name: String,
    #[serde(default)]
    pub params: Vec<String>,
    pub body: Node,
}

/// `entity Name [alters Parent] { methods }`. `disowns` severs the link to
/// the parent for method visibility and ancestor lookups.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EntityDecl {
    pub name: String,
    #[serde(default)]
    pub parent: Option<String>,
    #[serde(default)]
    pub disowns: bool,
    pub methods: Vec<Rc<MethodDef>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_operators_use_source_spelling() {
        let json = r#"{"Binary":{"op":"??","left":"Null","right":{"Number":2.0}}}"#;
        let node: Node = serde_json::from_str(json).unwrap();
        match node {
            Node::Binary { op, .. } => assert_eq!(op, BinaryOp::Coalesce),
            other => panic!("unexpected node {:?}", other),
        }
    }

    #[test]
    fn test_optional_fields_default() {
        let json = r#"{"Entity":{"name":"Animal","methods":[]}}"#;
        let node: Node = serde_json::from_str(json).unwrap();
        let Node::Entity(decl) = node else {
            panic!("expected entity");
        };
        assert_eq!(decl.parent, None);
        assert!(!decl.disowns);
        assert_eq!(Node::Entity(decl).kind_name(), "Entity");
    }
}
