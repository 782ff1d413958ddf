//! Code generation: IR to executable render functions.
//!
//! Each function-table entry becomes one [`Function`] whose body is a block of
//! instructions with every expression already parsed. Bodies are shared
//! (`Rc`) so instances, frames and closures never copy them.

use crate::ast::{Expr, LoopHeader, Param, Signature, Stmt};
use crate::error::{Error, Result};
use crate::ir::{self, Node, NodeKind, Pos, TemplateNode};
use crate::parser::{
    parse_expression, parse_loop_header, parse_param_list, parse_signature, parse_statements,
};
use indexmap::IndexMap;
use log::trace;
use std::rc::Rc;

pub(crate) type Block = Rc<[Instr]>;

#[derive(Debug)]
pub(crate) struct Instr {
    pub pos: Pos,
    pub op: Op,
}

#[derive(Debug)]
pub(crate) enum AttrPart {
    Text(String),
    /// Attribute values may span lines, so each expression keeps its own.
    Expr(Expr, Pos),
}

#[derive(Debug)]
pub(crate) enum Op {
    Text { text: Rc<str>, guard: Option<Expr> },
    Emit(Expr),
    Attr {
        name: String,
        value: Vec<AttrPart>,
        guard: Option<Expr>,
    },
    Attrs { expr: Expr, guard: Option<Expr> },
    For {
        targets: Rc<[String]>,
        iter: Expr,
        body: Block,
    },
    If { test: Expr, body: Block },
    Else { body: Block },
    Switch { test: Expr, body: Block },
    Case { value: Expr, body: Block },
    InnerDef(Rc<Function>),
    Call { caller: Rc<Function>, target: Expr },
    Import { href: String, alias: Option<String> },
    Include { href: String },
    Extend { href: String },
    Exec(Vec<Stmt>),
}

/// One compiled render function.
#[derive(Debug)]
pub struct Function {
    pub name: String,
    pub(crate) params: Vec<Param>,
    pub(crate) body: Block,
}

/// The compiled form of a template: module-level statements plus the
/// function table keyed by bare function name.
#[derive(Debug)]
pub struct Program {
    pub(crate) module: Vec<(Pos, Vec<Stmt>)>,
    pub(crate) functions: IndexMap<String, Rc<Function>>,
}

impl Program {
    pub fn function(&self, name: &str) -> Option<&Rc<Function>> {
        self.functions.get(name)
    }

    pub fn function_names(&self) -> impl Iterator<Item = &str> {
        self.functions.keys().map(String::as_str)
    }
}

fn at(pos: &Pos) -> impl Fn(String) -> Error + '_ {
    move |message| Error::Parse {
        file: pos.file.to_string(),
        line: pos.line,
        message,
    }
}

fn expr(pos: &Pos, src: &str) -> Result<Expr> {
    parse_expression(src).map_err(|message| at(pos)(format!("in expression {src:?}: {message}")))
}

fn guard(pos: &Pos, src: &Option<String>) -> Result<Option<Expr>> {
    src.as_deref().map(|g| expr(pos, g)).transpose()
}

/// Generate the program for a whole template.
pub fn generate(ir: &TemplateNode) -> Result<Program> {
    let mut module = Vec::new();
    for node in &ir.module {
        match &node.kind {
            NodeKind::Python { code, .. } => module.push((node.pos.clone(), statements(&node.pos, code)?)),
            other => {
                return Err(at(&node.pos)(format!(
                    "only host code may appear at module level, got {other:?}"
                )))
            }
        }
    }

    let mut functions = IndexMap::with_capacity(ir.functions.len());
    for (signature, body) in &ir.functions {
        let pos = body.first().map(|n| n.pos.clone()).unwrap_or_else(|| Pos {
            file: "<template>".into(),
            line: 1,
        });
        let function = function(&pos, signature, body)?;
        trace!("generated function {} ({} instructions)", function.name, function.body.len());
        if functions.contains_key(&function.name) {
            return Err(at(&pos)(format!("function `{}` is defined twice", function.name)));
        }
        functions.insert(function.name.clone(), Rc::new(function));
    }
    if !functions.contains_key("__call__") {
        return Err(at(&Pos {
            file: "<template>".into(),
            line: 1,
        })(format!("missing entry point {}", ir::CALL)));
    }
    Ok(Program { module, functions })
}

fn function(pos: &Pos, signature: &str, body: &[Node]) -> Result<Function> {
    let Signature { name, params } =
        parse_signature(signature).map_err(|m| at(pos)(format!("in signature {signature:?}: {m}")))?;
    Ok(Function {
        name,
        params,
        body: block(body)?,
    })
}

fn statements(pos: &Pos, code: &str) -> Result<Vec<Stmt>> {
    parse_statements(code).map_err(|m| at(pos)(format!("in host code {code:?}: {m}")))
}

fn block(nodes: &[Node]) -> Result<Block> {
    nodes.iter().map(instr).collect::<Result<Vec<_>>>().map(Rc::from)
}

fn instr(node: &Node) -> Result<Instr> {
    let pos = &node.pos;
    let op = match &node.kind {
        NodeKind::Text { text, guard: g } => Op::Text {
            text: Rc::from(text.as_str()),
            guard: guard(pos, g)?,
        },
        NodeKind::Expr(src) => Op::Emit(expr(pos, src)?),
        NodeKind::Attr {
            name,
            value,
            guard: g,
        } => Op::Attr {
            name: name.clone(),
            value: value
                .iter()
                .map(|part| match &part.kind {
                    NodeKind::Text { text, .. } => Ok(AttrPart::Text(text.clone())),
                    NodeKind::Expr(src) => Ok(AttrPart::Expr(expr(&part.pos, src)?, part.pos.clone())),
                    other => Err(at(&part.pos)(format!(
                        "unsupported node in attribute value: {other:?}"
                    ))),
                })
                .collect::<Result<_>>()?,
            guard: guard(pos, g)?,
        },
        NodeKind::Attrs { expr: src, guard: g } => Op::Attrs {
            expr: expr(pos, src)?,
            guard: guard(pos, g)?,
        },
        NodeKind::For { header, body } => {
            let LoopHeader { targets, iter } = parse_loop_header(header)
                .map_err(|m| at(pos)(format!("in loop header {header:?}: {m}")))?;
            Op::For {
                targets: targets.into(),
                iter,
                body: block(body)?,
            }
        }
        NodeKind::If { test, body } => Op::If {
            test: expr(pos, test)?,
            body: block(body)?,
        },
        NodeKind::Else { body } => Op::Else { body: block(body)? },
        NodeKind::Switch { test, body } => Op::Switch {
            test: expr(pos, test)?,
            body: block(body)?,
        },
        NodeKind::Case { value, body } => Op::Case {
            value: expr(pos, value)?,
            body: block(body)?,
        },
        NodeKind::InnerDef { signature, body } => {
            Op::InnerDef(Rc::new(function(pos, signature, body)?))
        }
        NodeKind::Call {
            caller,
            target,
            body,
        } => {
            let params = parse_param_list(caller)
                .map_err(|m| at(pos)(format!("in caller arguments {caller:?}: {m}")))?;
            Op::Call {
                caller: Rc::new(Function {
                    name: ir::CALLER.to_string(),
                    params,
                    body: block(body)?,
                }),
                target: expr(pos, target)?,
            }
        }
        NodeKind::Import { href, alias } => Op::Import {
            href: href.clone(),
            alias: alias.clone(),
        },
        NodeKind::Include { href } => Op::Include { href: href.clone() },
        NodeKind::Extend { href } => Op::Extend { href: href.clone() },
        NodeKind::Python { code, module } => {
            if *module {
                return Err(at(pos)("module-level host code inside a function".to_string()));
            }
            Op::Exec(statements(pos, code)?)
        }
    };
    Ok(Instr {
        pos: pos.clone(),
        op,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::text;

    #[test]
    fn functions_are_keyed_by_bare_name() {
        let ir = text::parse("t.txt", "%def greet(name, punct='!')\nHi $name$punct\n%end\n").unwrap();
        let program = generate(&ir).unwrap();
        let names: Vec<&str> = program.function_names().collect();
        assert_eq!(names, vec!["__call__", "greet"]);
        let greet = program.function("greet").unwrap();
        assert_eq!(greet.params.len(), 2);
        assert_eq!(greet.body.len(), 4);
    }

    #[test]
    fn invalid_expressions_fail_with_position() {
        let err = text::parse("t.txt", "line\n${a + }\n").unwrap_err();
        assert!(matches!(err, Error::ExpressionBoundary { line: 2, .. }));

        let ir = text::parse("t.txt", "\n{% for x y %}{% end %}").unwrap();
        let err = generate(&ir).unwrap_err();
        assert!(matches!(err, Error::Parse { line: 2, .. }), "{err:?}");
    }

    #[test]
    fn duplicate_function_names_are_rejected() {
        let ir = text::parse("t.txt", "%def f()\n%end\n%def f(x)\n%end\n").unwrap();
        assert!(generate(&ir).is_err());
    }

    #[test]
    fn host_code_is_parsed_once() {
        let ir = text::parse("t.txt", "%py% base = 10\n%py x = base + 1\n$x").unwrap();
        let program = generate(&ir).unwrap();
        assert_eq!(program.module.len(), 1);
        assert!(matches!(program.functions["__call__"].body[0].op, Op::Exec(_)));
    }
}
