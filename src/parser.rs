//! Recursive-descent parser for the embedded expression language.
//!
//! Besides whole expressions it parses `def` signatures, `for` headers and
//! host-code statements, and it can parse the *prefix* of a string that forms
//! one complete expression, which is how a `${...}` finds its closing brace.

use crate::ast::*;
use crate::tokenizer::{Spanned, Token, Tokenizer};
use std::collections::VecDeque;

pub struct Parser<'a> {
    lexer: Tokenizer<'a>,
    buffer: VecDeque<Spanned>,
    end: usize,
}

impl<'a> Parser<'a> {
    pub fn new(input: &'a str) -> Self {
        Self {
            lexer: Tokenizer::new(input),
            buffer: VecDeque::new(),
            end: input.len(),
        }
    }

    fn peek_spanned(&mut self, n: usize) -> Result<Option<&Spanned>, String> {
        while self.buffer.len() <= n {
            match self.lexer.next_token()? {
                Some(token) => self.buffer.push_back(token),
                None => return Ok(None),
            }
        }
        Ok(self.buffer.get(n))
    }

    fn peek(&mut self, n: usize) -> Result<Option<&Token>, String> {
        Ok(self.peek_spanned(n)?.map(|s| &s.token))
    }

    fn consume(&mut self) -> Result<Option<Token>, String> {
        if let Some(spanned) = self.buffer.pop_front() {
            return Ok(Some(spanned.token));
        }
        Ok(self.lexer.next_token()?.map(|s| s.token))
    }

    fn expect(&mut self, token: Token) -> Result<(), String> {
        match self.consume()? {
            Some(t) if t == token => Ok(()),
            Some(t) => Err(format!("expected {:?}, got {:?}", token, t)),
            None => Err(format!("expected {:?}, got end of input", token)),
        }
    }

    fn eat(&mut self, token: &Token) -> Result<bool, String> {
        if self.peek(0)? == Some(token) {
            self.consume()?;
            return Ok(true);
        }
        Ok(false)
    }

    fn expect_eof(&mut self) -> Result<(), String> {
        match self.peek(0)? {
            None => Ok(()),
            Some(t) => Err(format!("unexpected {:?} after expression", t)),
        }
    }

    fn ident(&mut self, what: &str) -> Result<String, String> {
        match self.consume()? {
            Some(Token::Ident(name)) => Ok(name),
            t => Err(format!("expected {what}, got {:?}", t)),
        }
    }

    pub fn parse_expr(&mut self) -> Result<Expr, String> {
        let body = self.parse_or()?;
        if self.peek(0)? != Some(&Token::If) {
            return Ok(body);
        }
        self.consume()?;
        let test = self.parse_or()?;
        self.expect(Token::Else)?;
        let orelse = self.parse_expr()?;
        Ok(Expr::IfElse {
            test: Box::new(test),
            body: Box::new(body),
            orelse: Box::new(orelse),
        })
    }

    /// `a, b` without parentheses, as allowed on either side of `=`.
    fn parse_expr_list(&mut self) -> Result<Expr, String> {
        let first = self.parse_expr()?;
        if self.peek(0)? != Some(&Token::Comma) {
            return Ok(first);
        }
        let mut items = vec![first];
        while self.eat(&Token::Comma)? {
            if self.starts_expr()? {
                items.push(self.parse_expr()?);
            } else {
                break;
            }
        }
        Ok(Expr::Tuple(items))
    }

    fn starts_expr(&mut self) -> Result<bool, String> {
        Ok(!matches!(
            self.peek(0)?,
            None | Some(
                Token::Assign
                    | Token::Semicolon
                    | Token::RParen
                    | Token::RBracket
                    | Token::RBrace
                    | Token::Colon
            )
        ))
    }

    fn parse_or(&mut self) -> Result<Expr, String> {
        let mut lhs = self.parse_and()?;
        while self.eat(&Token::Or)? {
            let rhs = self.parse_and()?;
            lhs = Expr::BinOp(Box::new(lhs), BinOp::Or, Box::new(rhs));
        }
        Ok(lhs)
    }

    fn parse_and(&mut self) -> Result<Expr, String> {
        let mut lhs = self.parse_not()?;
        while self.eat(&Token::And)? {
            let rhs = self.parse_not()?;
            lhs = Expr::BinOp(Box::new(lhs), BinOp::And, Box::new(rhs));
        }
        Ok(lhs)
    }

    fn parse_not(&mut self) -> Result<Expr, String> {
        if self.eat(&Token::Not)? {
            let operand = self.parse_not()?;
            return Ok(Expr::Unary(UnaryOp::Not, Box::new(operand)));
        }
        self.parse_compare()
    }

    fn parse_compare(&mut self) -> Result<Expr, String> {
        let lhs = self.parse_add()?;
        let mut rest = Vec::new();
        loop {
            let op = match self.peek(0)?.cloned() {
                Some(Token::EqEq) => CmpOp::Eq,
                Some(Token::NotEq) => CmpOp::NotEq,
                Some(Token::Lt) => CmpOp::Lt,
                Some(Token::LtE) => CmpOp::LtE,
                Some(Token::Gt) => CmpOp::Gt,
                Some(Token::GtE) => CmpOp::GtE,
                Some(Token::In) => CmpOp::In,
                Some(Token::Not) if self.peek(1)? == Some(&Token::In) => {
                    self.consume()?;
                    CmpOp::NotIn
                }
                Some(Token::Is) if self.peek(1)? == Some(&Token::Not) => {
                    self.consume()?;
                    CmpOp::IsNot
                }
                Some(Token::Is) => CmpOp::Is,
                _ => break,
            };
            self.consume()?;
            rest.push((op, self.parse_add()?));
        }
        if rest.is_empty() {
            return Ok(lhs);
        }
        Ok(Expr::Compare(Box::new(lhs), rest))
    }

    fn parse_add(&mut self) -> Result<Expr, String> {
        let mut lhs = self.parse_mul()?;
        loop {
            let op = match self.peek(0)? {
                Some(Token::Plus) => BinOp::Add,
                Some(Token::Minus) => BinOp::Sub,
                _ => break,
            };
            self.consume()?;
            let rhs = self.parse_mul()?;
            lhs = Expr::BinOp(Box::new(lhs), op, Box::new(rhs));
        }
        Ok(lhs)
    }

    fn parse_mul(&mut self) -> Result<Expr, String> {
        let mut lhs = self.parse_unary()?;
        loop {
            let op = match self.peek(0)? {
                Some(Token::Star) => BinOp::Mul,
                Some(Token::Slash) => BinOp::Div,
                Some(Token::DoubleSlash) => BinOp::FloorDiv,
                Some(Token::Percent) => BinOp::Mod,
                _ => break,
            };
            self.consume()?;
            let rhs = self.parse_unary()?;
            lhs = Expr::BinOp(Box::new(lhs), op, Box::new(rhs));
        }
        Ok(lhs)
    }

    fn parse_unary(&mut self) -> Result<Expr, String> {
        let op = match self.peek(0)? {
            Some(Token::Minus) => UnaryOp::Neg,
            Some(Token::Plus) => UnaryOp::Pos,
            _ => return self.parse_postfix(),
        };
        self.consume()?;
        let operand = self.parse_unary()?;
        Ok(Expr::Unary(op, Box::new(operand)))
    }

    fn parse_postfix(&mut self) -> Result<Expr, String> {
        let mut expr = self.parse_primary()?;

        // Handle suffixes: .attr, ['key'], (args)
        loop {
            match self.peek(0)? {
                Some(Token::Dot) => {
                    self.consume()?; // .
                    let attr = self.ident("identifier after dot")?;
                    expr = Expr::Attribute(Box::new(expr), attr);
                }
                Some(Token::LBracket) => {
                    self.consume()?; // [
                    let idx = self.parse_expr()?;
                    self.expect(Token::RBracket)?;
                    expr = Expr::Index(Box::new(expr), Box::new(idx));
                }
                Some(Token::LParen) => {
                    self.consume()?; // (
                    let args = self.parse_args()?;
                    expr = Expr::Call(Box::new(expr), args);
                }
                _ => break,
            }
        }

        Ok(expr)
    }

    fn parse_args(&mut self) -> Result<Vec<Arg>, String> {
        let mut args = Vec::new();
        loop {
            if self.eat(&Token::RParen)? {
                return Ok(args);
            }
            let is_keyword = matches!(self.peek(0)?, Some(Token::Ident(_)))
                && self.peek(1)? == Some(&Token::Assign);
            if is_keyword {
                let name = self.ident("keyword")?;
                self.expect(Token::Assign)?;
                args.push(Arg::Keyword(name, self.parse_expr()?));
            } else {
                args.push(Arg::Positional(self.parse_expr()?));
            }
            if !self.eat(&Token::Comma)? {
                self.expect(Token::RParen)?;
                return Ok(args);
            }
        }
    }

    /// Comma-separated items up to `close`, allowing a trailing comma.
    fn parse_items(&mut self, close: Token) -> Result<(Vec<Expr>, bool), String> {
        let mut items = Vec::new();
        let mut saw_comma = false;
        loop {
            if self.eat(&close)? {
                return Ok((items, saw_comma));
            }
            items.push(self.parse_expr()?);
            if self.eat(&Token::Comma)? {
                saw_comma = true;
            } else {
                self.expect(close)?;
                return Ok((items, saw_comma));
            }
        }
    }

    fn parse_primary(&mut self) -> Result<Expr, String> {
        let expr = match self.consume()? {
            Some(Token::StringLit(mut s)) => {
                // Adjacent literals concatenate: 'a' 'b'
                while let Some(Token::StringLit(_)) = self.peek(0)? {
                    if let Some(Token::StringLit(next)) = self.consume()? {
                        s.push_str(&next);
                    }
                }
                Expr::StringLit(s)
            }
            Some(Token::Int(i)) => Expr::IntLit(i),
            Some(Token::Float(f)) => Expr::FloatLit(f),
            Some(Token::True) => Expr::BoolLit(true),
            Some(Token::False) => Expr::BoolLit(false),
            Some(Token::None) => Expr::None,
            Some(Token::Ident(s)) => Expr::Var(s),
            Some(Token::LParen) => {
                let (mut items, saw_comma) = self.parse_items(Token::RParen)?;
                if items.len() == 1 && !saw_comma {
                    items.remove(0)
                } else {
                    Expr::Tuple(items)
                }
            }
            Some(Token::LBracket) => Expr::List(self.parse_items(Token::RBracket)?.0),
            Some(Token::LBrace) => {
                let mut pairs = Vec::new();
                loop {
                    if self.eat(&Token::RBrace)? {
                        break;
                    }
                    let key = self.parse_expr()?;
                    self.expect(Token::Colon)?;
                    pairs.push((key, self.parse_expr()?));
                    if !self.eat(&Token::Comma)? {
                        self.expect(Token::RBrace)?;
                        break;
                    }
                }
                Expr::Dict(pairs)
            }
            t => return Err(format!("expected expression, got {:?}", t)),
        };
        Ok(expr)
    }

    fn parse_params(&mut self, close: Option<Token>) -> Result<Vec<Param>, String> {
        let mut params = Vec::new();
        loop {
            match (&close, self.peek(0)?.cloned()) {
                (Some(c), Some(t)) if t == *c => {
                    self.consume()?;
                    return Ok(params);
                }
                (None, None) => return Ok(params),
                _ => {}
            }
            let name = self.ident("parameter name")?;
            if params.iter().any(|p: &Param| p.name == name) {
                return Err(format!("duplicate parameter `{name}`"));
            }
            let default = if self.eat(&Token::Assign)? {
                Some(self.parse_expr()?)
            } else {
                if params.iter().any(|p| p.default.is_some()) {
                    return Err(format!(
                        "parameter `{name}` without a default follows one with a default"
                    ));
                }
                None
            };
            params.push(Param { name, default });
            if !self.eat(&Token::Comma)? {
                match close {
                    Some(c) => self.expect(c)?,
                    None => self.expect_eof()?,
                }
                return Ok(params);
            }
        }
    }

    fn parse_stmt(&mut self) -> Result<Stmt, String> {
        let lhs = self.parse_expr_list()?;
        if !self.eat(&Token::Assign)? {
            return Ok(Stmt::Expr(lhs));
        }
        let targets = match lhs {
            Expr::Var(name) => vec![name],
            Expr::Tuple(items) => items
                .into_iter()
                .map(|item| match item {
                    Expr::Var(name) => Ok(name),
                    other => Err(format!("cannot assign to {:?}", other)),
                })
                .collect::<Result<_, _>>()?,
            other => return Err(format!("cannot assign to {:?}", other)),
        };
        let value = self.parse_expr_list()?;
        Ok(Stmt::Assign(targets, value))
    }
}

/// Parse a complete expression; trailing input is an error.
pub fn parse_expression(src: &str) -> Result<Expr, String> {
    let mut parser = Parser::new(src);
    let expr = parser.parse_expr()?;
    parser.expect_eof()?;
    Ok(expr)
}

/// Parse the longest prefix of `src` that forms one expression followed by a
/// closing `}`. Returns the expression text's length and the offset just past
/// the brace.
pub fn parse_braced(src: &str) -> Result<(usize, usize), String> {
    let mut parser = Parser::new(src);
    parser.parse_expr()?;
    let next = parser.peek_spanned(0)?.cloned();
    match next {
        Some(Spanned {
            token: Token::RBrace,
            start,
            end,
        }) => Ok((start, end)),
        Some(other) => Err(format!("expected '}}', got {:?}", other.token)),
        None => Err(format!(
            "expected '}}', got end of input after {} bytes",
            parser.end
        )),
    }
}

/// `name(a, b=1)`
pub fn parse_signature(src: &str) -> Result<Signature, String> {
    let mut parser = Parser::new(src);
    let name = parser.ident("function name")?;
    let params = if parser.eat(&Token::LParen)? {
        parser.parse_params(Some(Token::RParen))?
    } else {
        Vec::new()
    };
    parser.expect_eof()?;
    Ok(Signature { name, params })
}

/// A bare parameter list such as `py:call args="x, y=2"`.
pub fn parse_param_list(src: &str) -> Result<Vec<Param>, String> {
    Parser::new(src).parse_params(None)
}

/// `x in items`, `k, v in pairs`, `(k, v) in pairs`
pub fn parse_loop_header(src: &str) -> Result<LoopHeader, String> {
    let mut parser = Parser::new(src);
    let parenthesized = parser.eat(&Token::LParen)?;
    let mut targets = vec![parser.ident("loop variable")?];
    while parser.eat(&Token::Comma)? {
        targets.push(parser.ident("loop variable")?);
    }
    if parenthesized {
        parser.expect(Token::RParen)?;
    }
    parser.expect(Token::In)?;
    let iter = parser.parse_expr_list()?;
    parser.expect_eof()?;
    Ok(LoopHeader { targets, iter })
}

/// Statements separated by `;` or simply juxtaposed (newlines are whitespace).
pub fn parse_statements(src: &str) -> Result<Vec<Stmt>, String> {
    let mut parser = Parser::new(src);
    let mut stmts = Vec::new();
    loop {
        while parser.eat(&Token::Semicolon)? {}
        if parser.peek(0)?.is_none() {
            return Ok(stmts);
        }
        stmts.push(parser.parse_stmt()?);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn var(name: &str) -> Expr {
        Expr::Var(name.to_string())
    }

    #[test]
    fn precedence_of_arithmetic_and_boolean_operators() {
        let expr = parse_expression("a + b * 2 == c or not d").unwrap();
        let expected = Expr::BinOp(
            Box::new(Expr::Compare(
                Box::new(Expr::BinOp(
                    Box::new(var("a")),
                    BinOp::Add,
                    Box::new(Expr::BinOp(
                        Box::new(var("b")),
                        BinOp::Mul,
                        Box::new(Expr::IntLit(2)),
                    )),
                )),
                vec![(CmpOp::Eq, var("c"))],
            )),
            BinOp::Or,
            Box::new(Expr::Unary(UnaryOp::Not, Box::new(var("d")))),
        );
        assert_eq!(expr, expected);
    }

    #[test]
    fn postfix_chain_with_keyword_arguments() {
        let expr = parse_expression("user.items[0](x, sep=', ')").unwrap();
        let expected = Expr::Call(
            Box::new(Expr::Index(
                Box::new(Expr::Attribute(Box::new(var("user")), "items".into())),
                Box::new(Expr::IntLit(0)),
            )),
            vec![
                Arg::Positional(var("x")),
                Arg::Keyword("sep".into(), Expr::StringLit(", ".into())),
            ],
        );
        assert_eq!(expr, expected);
    }

    #[test]
    fn not_in_and_is_not() {
        let expr = parse_expression("a not in b is not None").unwrap();
        assert_eq!(
            expr,
            Expr::Compare(
                Box::new(var("a")),
                vec![(CmpOp::NotIn, var("b")), (CmpOp::IsNot, Expr::None)]
            )
        );
    }

    #[test]
    fn conditional_expression() {
        let expr = parse_expression("'y' if ok else 'n'").unwrap();
        assert!(matches!(expr, Expr::IfElse { .. }));
    }

    #[test]
    fn tuple_list_and_dict_literals() {
        assert_eq!(parse_expression("(1,)").unwrap(), Expr::Tuple(vec![Expr::IntLit(1)]));
        assert_eq!(parse_expression("(1)").unwrap(), Expr::IntLit(1));
        assert_eq!(
            parse_expression("[1, 2,]").unwrap(),
            Expr::List(vec![Expr::IntLit(1), Expr::IntLit(2)])
        );
        assert_eq!(
            parse_expression("{'a': {'b': 1}}").unwrap(),
            Expr::Dict(vec![(
                Expr::StringLit("a".into()),
                Expr::Dict(vec![(Expr::StringLit("b".into()), Expr::IntLit(1))])
            )])
        );
    }

    #[test]
    fn trailing_input_is_rejected() {
        assert!(parse_expression("a b").is_err());
        assert!(parse_expression("a +").is_err());
    }

    #[test]
    fn braced_prefix_stops_at_the_closing_brace() {
        let src = "{'a': {'b': 1}}['a']} tail } more";
        let (expr_end, after) = parse_braced(src).unwrap();
        assert_eq!(&src[..expr_end], "{'a': {'b': 1}}['a']");
        assert_eq!(&src[after..], " tail } more");
    }

    #[test]
    fn braced_prefix_ignores_braces_inside_strings() {
        let src = "'}' + x }rest";
        let (expr_end, after) = parse_braced(src).unwrap();
        assert_eq!(src[..expr_end].trim(), "'}' + x");
        assert_eq!(&src[after..], "rest");
    }

    #[test]
    fn braced_prefix_without_brace_fails() {
        assert!(parse_braced("a + b").is_err());
        assert!(parse_braced("a b }").is_err());
    }

    #[test]
    fn signatures_with_defaults() {
        let sig = parse_signature("greet(name, greeting='Hello')").unwrap();
        assert_eq!(sig.name, "greet");
        assert_eq!(sig.params.len(), 2);
        assert_eq!(sig.params[1].default, Some(Expr::StringLit("Hello".into())));
        assert_eq!(parse_signature("_fpt_block_body()").unwrap().params, vec![]);
        assert!(parse_signature("f(a=1, b)").is_err());
        assert!(parse_signature("f(a, a)").is_err());
    }

    #[test]
    fn loop_headers() {
        let header = parse_loop_header("k, v in d.items()").unwrap();
        assert_eq!(header.targets, vec!["k".to_string(), "v".to_string()]);
        let header = parse_loop_header("x in [1,2,3]").unwrap();
        assert_eq!(header.targets, vec!["x".to_string()]);
        assert!(parse_loop_header("x of y").is_err());
    }

    #[test]
    fn statements_split_on_semicolons_and_juxtaposition() {
        let stmts = parse_statements("a = 1; b, c = 2, 3\nprint(a)").unwrap();
        assert_eq!(stmts.len(), 3);
        assert_eq!(stmts[0], Stmt::Assign(vec!["a".into()], Expr::IntLit(1)));
        assert_eq!(
            stmts[1],
            Stmt::Assign(
                vec!["b".into(), "c".into()],
                Expr::Tuple(vec![Expr::IntLit(2), Expr::IntLit(3)])
            )
        );
        assert!(parse_statements("1 = a").is_err());
    }
}
