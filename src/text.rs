//! Text syntax: token stream to IR.
//!
//! A single recursive pass. Block tags collect their body until a stop tag;
//! `case` and `else` push their stop tag back so the enclosing `switch` (or
//! the next `case`) sees it, which gives first-match chains sharing one `end`.

use crate::error::{Error, Result};
use crate::ir::{Node, NodeKind, Pos, TemplateNode};
use crate::lexer::{join_lines, tokenize, Token, TokenKind};
use indexmap::IndexMap;

/// Compile text-syntax source into IR.
pub fn parse(file: &str, source: &str) -> Result<TemplateNode> {
    let tokens = tokenize(file, source)?;
    TextParser::new(tokens).parse()
}

struct TextParser {
    tokens: std::vec::IntoIter<Token>,
    pushed: Vec<Token>,
    module: Vec<Node>,
    functions: IndexMap<String, Vec<Node>>,
    in_def: bool,
}

fn pos(token: &Token) -> Pos {
    Pos {
        file: token.file.clone(),
        line: token.line,
    }
}

fn parse_error(token: &Token, message: String) -> Error {
    Error::Parse {
        file: token.file.to_string(),
        line: token.line,
        message,
    }
}

impl TextParser {
    fn new(tokens: Vec<Token>) -> Self {
        Self {
            tokens: tokens.into_iter(),
            pushed: Vec::new(),
            module: Vec::new(),
            functions: IndexMap::new(),
            in_def: false,
        }
    }

    fn next_token(&mut self) -> Option<Token> {
        self.pushed.pop().or_else(|| self.tokens.next())
    }

    fn push_tok(&mut self, token: Token) {
        self.pushed.push(token);
    }

    fn parse(mut self) -> Result<TemplateNode> {
        let (body, _) = self.parse_body(&[], false)?;
        Ok(TemplateNode::new(self.module, body, self.functions))
    }

    /// Collect nodes until one of `stoptags` (returned) or end of input.
    fn parse_body(
        &mut self,
        stoptags: &[&str],
        in_switch: bool,
    ) -> Result<(Vec<Node>, Option<Token>)> {
        let mut nodes = Vec::new();
        while let Some(token) = self.next_token() {
            match &token.kind {
                TokenKind::Text => nodes.push(Node::text(pos(&token), join_lines(&token.text))),
                TokenKind::Expr => {
                    nodes.push(Node::new(pos(&token), NodeKind::Expr(token.text.clone())))
                }
                TokenKind::Tag { name, .. } => {
                    if stoptags.contains(&name.as_str()) {
                        return Ok((nodes, Some(token)));
                    }
                    nodes.extend(self.parse_tag(token, in_switch)?);
                }
            }
        }
        Ok((nodes, None))
    }

    /// Like `parse_body`, but running out of input is an error.
    fn parse_until(
        &mut self,
        opener: &Token,
        stoptags: &[&str],
        in_switch: bool,
    ) -> Result<(Vec<Node>, Token)> {
        match self.parse_body(stoptags, in_switch)? {
            (body, Some(stop)) => Ok((body, stop)),
            (_, None) => Err(parse_error(
                opener,
                format!("unterminated tag {:?}: expected {}", opener.text, stoptags.join(" or ")),
            )),
        }
    }

    fn parse_tag(&mut self, token: Token, in_switch: bool) -> Result<Vec<Node>> {
        let TokenKind::Tag { name, body } = &token.kind else {
            return Ok(Vec::new());
        };
        let body = body.clone();
        match name.as_str() {
            "for" => self.parse_for(token, body),
            "switch" => self.parse_switch(token, body),
            "case" if in_switch => self.parse_case(token, body),
            "else" if in_switch => self.parse_else(token),
            "if" => self.parse_if(token, body),
            "def" => self.parse_def(token, body),
            "py" => self.parse_py(token, body),
            "import" => parse_import(&token, &body),
            "include" => Ok(vec![Node::new(pos(&token), NodeKind::Include { href: body })]),
            other => Err(parse_error(&token, format!("unexpected tag `{other}`"))),
        }
    }

    fn parse_for(&mut self, token: Token, header: String) -> Result<Vec<Node>> {
        let (body, _) = self.parse_until(&token, &["end"], false)?;
        Ok(vec![Node::new(pos(&token), NodeKind::For { header, body })])
    }

    fn parse_switch(&mut self, token: Token, test: String) -> Result<Vec<Node>> {
        let (body, _) = self.parse_until(&token, &["end"], true)?;
        Ok(vec![Node::new(pos(&token), NodeKind::Switch { test, body })])
    }

    fn parse_case(&mut self, token: Token, value: String) -> Result<Vec<Node>> {
        let (body, stop) = self.parse_until(&token, &["case", "else", "end"], false)?;
        self.push_tok(stop);
        Ok(vec![Node::new(pos(&token), NodeKind::Case { value, body })])
    }

    fn parse_else(&mut self, token: Token) -> Result<Vec<Node>> {
        let (body, stop) = self.parse_until(&token, &["end"], false)?;
        self.push_tok(stop);
        Ok(vec![Node::new(pos(&token), NodeKind::Else { body })])
    }

    fn parse_if(&mut self, token: Token, test: String) -> Result<Vec<Node>> {
        let (body, stop) = self.parse_until(&token, &["else", "end"], false)?;
        let mut nodes = vec![Node::new(pos(&token), NodeKind::If { test, body })];
        if matches!(&stop.kind, TokenKind::Tag { name, .. } if name == "else") {
            let (body, _) = self.parse_until(&stop, &["end"], false)?;
            nodes.push(Node::new(pos(&stop), NodeKind::Else { body }));
        }
        Ok(nodes)
    }

    fn parse_def(&mut self, token: Token, signature: String) -> Result<Vec<Node>> {
        let was_in_def = std::mem::replace(&mut self.in_def, true);
        let parsed = self.parse_until(&token, &["end"], false);
        self.in_def = was_in_def;
        let (body, _) = parsed?;
        if was_in_def {
            return Ok(vec![Node::new(pos(&token), NodeKind::InnerDef { signature, body })]);
        }
        self.functions.insert(signature, body);
        Ok(Vec::new())
    }

    fn parse_py(&mut self, token: Token, code: String) -> Result<Vec<Node>> {
        match code.strip_prefix('%') {
            Some(module_code) => {
                self.module.push(Node::new(
                    pos(&token),
                    NodeKind::Python {
                        code: module_code.trim().to_string(),
                        module: true,
                    },
                ));
                Ok(Vec::new())
            }
            None => Ok(vec![Node::new(pos(&token), NodeKind::Python { code, module: false })]),
        }
    }
}

/// `%import href [as alias]`
fn parse_import(token: &Token, body: &str) -> Result<Vec<Node>> {
    let mut words = body.split_whitespace();
    let (href, alias) = match (words.next(), words.next(), words.next(), words.next()) {
        (Some(href), None, None, None) => (href, None),
        (Some(href), Some("as"), Some(alias), None) => (href, Some(alias.to_string())),
        _ => {
            return Err(parse_error(
                token,
                format!("expected `import <href> [as <alias>]`, got {body:?}"),
            ))
        }
    };
    Ok(vec![Node::new(
        pos(token),
        NodeKind::Import {
            href: href.to_string(),
            alias,
        },
    )])
}
