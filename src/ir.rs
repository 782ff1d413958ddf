//! Intermediate representation shared by both surface syntaxes.
//!
//! Nodes are plain data: expressions are kept as source text and are only
//! parsed by the code generator. Every node records where it came from.

use indexmap::IndexMap;
use std::rc::Rc;

/// The default render entry point of every template.
pub const CALL: &str = "__call__()";

/// Prefix of the function generated for `py:block name="n"`.
pub const BLOCK_PREFIX: &str = "_fpt_block_";

/// Name bound to the `py:call` caller closure inside the target expression.
pub const CALLER: &str = "_fpt_caller";

#[derive(Debug, Clone, PartialEq)]
pub struct Pos {
    pub file: Rc<str>,
    pub line: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Node {
    pub pos: Pos,
    pub kind: NodeKind,
}

#[derive(Debug, Clone, PartialEq)]
pub enum NodeKind {
    /// Literal output; suppressed when `guard` evaluates truthy.
    Text { text: String, guard: Option<String> },
    Expr(String),
    /// ` name="..."`; value parts are `Text`/`Expr` nodes.
    Attr {
        name: String,
        value: Vec<Node>,
        guard: Option<String>,
    },
    /// Attributes computed from a mapping.
    Attrs { expr: String, guard: Option<String> },
    For { header: String, body: Vec<Node> },
    If { test: String, body: Vec<Node> },
    Else { body: Vec<Node> },
    Switch { test: String, body: Vec<Node> },
    Case { value: String, body: Vec<Node> },
    /// A function local to the enclosing function body.
    InnerDef { signature: String, body: Vec<Node> },
    Call {
        caller: String,
        target: String,
        body: Vec<Node>,
    },
    Import { href: String, alias: Option<String> },
    Include { href: String },
    Extend { href: String },
    /// Host-code statements; module-level ones run once per template type.
    Python { code: String, module: bool },
}

impl Node {
    pub fn new(pos: Pos, kind: NodeKind) -> Self {
        Self { pos, kind }
    }

    pub fn text(pos: Pos, text: impl Into<String>) -> Self {
        Self::new(
            pos,
            NodeKind::Text {
                text: text.into(),
                guard: None,
            },
        )
    }
}

/// The IR root: module-level nodes plus the function table, keyed by
/// signature (`"__call__()"`, `"_fpt_block_title()"`, `"greet(name)"`).
#[derive(Debug, Clone, PartialEq)]
pub struct TemplateNode {
    pub module: Vec<Node>,
    pub functions: IndexMap<String, Vec<Node>>,
}

impl TemplateNode {
    pub fn new(module: Vec<Node>, call: Vec<Node>, defs: IndexMap<String, Vec<Node>>) -> Self {
        let mut functions = IndexMap::with_capacity(defs.len() + 1);
        functions.insert(CALL.to_string(), call);
        for (signature, body) in defs {
            if signature != CALL {
                functions.insert(signature, body);
            }
        }
        Self { module, functions }
    }
}
