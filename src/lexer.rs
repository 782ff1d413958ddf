//! Lexer for the line-oriented text syntax.
//!
//! Recognized forms, earliest match wins:
//! - `$$` is a literal `$`
//! - `$name`, `$name.attr` is a named expression
//! - `${expr}` is a braced expression, delimited by expression completeness
//! - `%tag body` at the start of a line is a bare tag running to end of line
//! - `{%tag body%}` is a delimited tag
//!
//! Everything in between is literal text. The same `$` handling is used for
//! text and attribute values in XML templates (see [`interpolate`]).

use crate::error::{Error, Result};
use crate::parser::parse_braced;
use std::rc::Rc;

#[derive(Debug, Clone, PartialEq)]
pub enum TokenKind {
    Text,
    Expr,
    Tag { name: String, body: String },
}

#[derive(Debug, Clone, PartialEq)]
pub struct Token {
    pub kind: TokenKind,
    pub file: Rc<str>,
    pub line: usize,
    pub text: String,
}

/// Tracks the line number of monotonically increasing byte offsets.
pub(crate) struct LineCounter {
    offset: usize,
    line: usize,
}

impl LineCounter {
    pub(crate) fn new(first_line: usize) -> Self {
        Self {
            offset: 0,
            line: first_line,
        }
    }

    pub(crate) fn line_at(&mut self, source: &str, offset: usize) -> usize {
        if offset > self.offset {
            self.line += source[self.offset..offset].matches('\n').count();
            self.offset = offset;
        }
        self.line
    }
}

pub struct Lexer<'a> {
    file: Rc<str>,
    source: &'a str,
    pos: usize,
    text_start: usize,
    lines: LineCounter,
    tags: bool,
    tokens: Vec<Token>,
}

impl<'a> Lexer<'a> {
    pub fn new(file: impl Into<Rc<str>>, source: &'a str) -> Self {
        Self {
            file: file.into(),
            source,
            pos: 0,
            text_start: 0,
            lines: LineCounter::new(1),
            tags: true,
            tokens: Vec::new(),
        }
    }

    fn line(&mut self, offset: usize) -> usize {
        self.lines.line_at(self.source, offset)
    }

    fn push(&mut self, kind: TokenKind, start: usize, text: &str) {
        let line = self.line(start);
        self.tokens.push(Token {
            kind,
            file: self.file.clone(),
            line,
            text: text.to_string(),
        });
    }

    fn flush_text(&mut self, end: usize) {
        if end > self.text_start {
            let source = self.source;
            self.push(TokenKind::Text, self.text_start, &source[self.text_start..end]);
        }
    }

    fn lex_error(&mut self, start: usize) -> Error {
        let source = self.source;
        let text = source[start..].lines().next().unwrap_or_default().to_string();
        Error::Lex {
            file: self.file.to_string(),
            line: self.line(start),
            text,
        }
    }

    pub fn tokenize(mut self) -> Result<Vec<Token>> {
        let bytes = self.source.as_bytes();
        while self.pos < bytes.len() {
            let at_line_start = self.pos == 0 || bytes[self.pos - 1] == b'\n';
            match bytes[self.pos] {
                b'$' => self.dollar()?,
                b'{' if self.tags && bytes.get(self.pos + 1) == Some(&b'%') => {
                    self.delimited_tag()?
                }
                b' ' | b'\t' | b'%' if self.tags && at_line_start => {
                    if !self.bare_tag() {
                        self.pos += 1;
                    }
                }
                _ => self.pos += 1,
            }
        }
        self.flush_text(self.pos);
        Ok(self.tokens)
    }

    fn dollar(&mut self) -> Result<()> {
        let start = self.pos;
        let source = self.source;
        let rest = &source[start + 1..];
        match rest.chars().next() {
            Some('$') => {
                self.flush_text(start);
                self.push(TokenKind::Text, start, "$");
                self.pos = start + 2;
            }
            Some(c) if c.is_ascii_alphabetic() || c == '_' => {
                let len = rest
                    .find(|c: char| !(c.is_ascii_alphanumeric() || c == '_' || c == '.'))
                    .unwrap_or(rest.len());
                // `$name.` at the end of a sentence keeps its period as text
                let name = rest[..len].trim_end_matches('.');
                self.flush_text(start);
                self.push(TokenKind::Expr, start, name);
                self.pos = start + 1 + name.len();
            }
            Some('{') => {
                let expr_start = start + 2;
                let (expr_len, after) = parse_braced(&source[expr_start..]).map_err(|message| {
                    Error::ExpressionBoundary {
                        file: self.file.to_string(),
                        line: self.line(start),
                        message,
                    }
                })?;
                self.flush_text(start);
                let expr = source[expr_start..expr_start + expr_len].trim();
                self.push(TokenKind::Expr, start, expr);
                self.pos = expr_start + after;
            }
            _ => return Err(self.lex_error(start)),
        }
        self.text_start = self.pos;
        Ok(())
    }

    /// `[ \t]*%name body\n`; returns false (literal text) if no tag name follows.
    fn bare_tag(&mut self) -> bool {
        let start = self.pos;
        let source = self.source;
        let indent = source[start..]
            .find(|c: char| c != ' ' && c != '\t')
            .unwrap_or(source.len() - start);
        let after_percent = start + indent + 1;
        if !source[start + indent..].starts_with('%') {
            self.pos = start + indent;
            return true;
        }
        let Some((name, name_end)) = tag_name(source, after_percent) else {
            return false;
        };
        let line_end = source[name_end..]
            .find('\n')
            .map(|i| name_end + i)
            .unwrap_or(source.len());
        let body = source[name_end..line_end].trim().to_string();
        self.flush_text(start);
        let raw = &source[start..line_end];
        self.push(TokenKind::Tag { name, body }, start, raw);
        self.pos = (line_end + 1).min(source.len());
        self.text_start = self.pos;
        true
    }

    /// `{%name body%}`
    fn delimited_tag(&mut self) -> Result<()> {
        let start = self.pos;
        let source = self.source;
        let Some((name, name_end)) = tag_name(source, start + 2) else {
            return Err(self.lex_error(start));
        };
        let Some(close) = source[name_end..].find("%}").map(|i| name_end + i) else {
            return Err(self.lex_error(start));
        };
        let body = source[name_end..close].trim().to_string();
        self.flush_text(start);
        let raw = &source[start..close + 2];
        self.push(TokenKind::Tag { name, body }, start, raw);
        self.pos = close + 2;
        self.text_start = self.pos;
        Ok(())
    }
}

/// Optional horizontal whitespace then `[a-zA-Z]+`, lowercased.
fn tag_name(source: &str, from: usize) -> Option<(String, usize)> {
    let rest = &source[from..];
    let skipped = rest.len() - rest.trim_start_matches([' ', '\t']).len();
    let rest = &rest[skipped..];
    let len = rest
        .find(|c: char| !c.is_ascii_alphabetic())
        .unwrap_or(rest.len());
    if len == 0 {
        return None;
    }
    Some((rest[..len].to_ascii_lowercase(), from + skipped + len))
}

/// Tokenize a text-syntax template.
pub fn tokenize(file: &str, source: &str) -> Result<Vec<Token>> {
    Lexer::new(file, source).tokenize()
}

/// Split XML text or an attribute value into text and expression tokens,
/// numbering lines from `first_line`.
pub fn interpolate(file: &Rc<str>, first_line: usize, source: &str) -> Result<Vec<Token>> {
    let mut lexer = Lexer::new(file.clone(), source);
    lexer.tags = false;
    lexer.lines = LineCounter::new(first_line);
    lexer.tokenize()
}

/// Remove backslash-newline line continuations (but not `\\` followed by a
/// newline, which is an escaped backslash).
pub fn join_lines(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut chars = text.chars().peekable();
    let mut prev_backslash = false;
    while let Some(c) = chars.next() {
        if c == '\\' && !prev_backslash && chars.peek() == Some(&'\n') {
            chars.next();
            prev_backslash = false;
            continue;
        }
        prev_backslash = c == '\\' && !prev_backslash;
        out.push(c);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(source: &str) -> Vec<(TokenKind, String)> {
        tokenize("<string>", source)
            .unwrap()
            .into_iter()
            .map(|t| (t.kind, t.text))
            .collect()
    }

    fn tag(name: &str, body: &str) -> TokenKind {
        TokenKind::Tag {
            name: name.into(),
            body: body.into(),
        }
    }

    #[test]
    fn escaped_dollar_and_named_expressions() {
        assert_eq!(
            kinds("a $$ b $user.name."),
            vec![
                (TokenKind::Text, "a ".into()),
                (TokenKind::Text, "$".into()),
                (TokenKind::Text, " b ".into()),
                (TokenKind::Expr, "user.name".into()),
                (TokenKind::Text, ".".into()),
            ]
        );
    }

    #[test]
    fn braced_expression_with_nested_braces() {
        assert_eq!(
            kinds("x${ {'k': 1}['k'] }y"),
            vec![
                (TokenKind::Text, "x".into()),
                (TokenKind::Expr, "{'k': 1}['k']".into()),
                (TokenKind::Text, "y".into()),
            ]
        );
    }

    #[test]
    fn delimited_and_bare_tags() {
        let tokens = kinds("{% for x in xs %}$x{%end%}\n  %switch y\nrest");
        assert_eq!(
            tokens,
            vec![
                (tag("for", "x in xs"), "{% for x in xs %}".into()),
                (TokenKind::Expr, "x".into()),
                (tag("end", ""), "{%end%}".into()),
                (TokenKind::Text, "\n".into()),
                (tag("switch", "y"), "  %switch y".into()),
                (TokenKind::Text, "rest".into()),
            ]
        );
    }

    #[test]
    fn percent_mid_line_or_without_name_is_text() {
        assert_eq!(
            kinds("100% sure\n% 5"),
            vec![(TokenKind::Text, "100% sure\n% 5".into())]
        );
    }

    #[test]
    fn tag_names_are_case_insensitive() {
        assert_eq!(kinds("{%END%}"), vec![(tag("end", ""), "{%END%}".into())]);
    }

    #[test]
    fn line_numbers_follow_newlines() {
        let tokens = tokenize("f.txt", "a\nb\n$x\n%end\nz").unwrap();
        let lines: Vec<usize> = tokens.iter().map(|t| t.line).collect();
        assert_eq!(lines, vec![1, 3, 3, 4, 5]);
        assert_eq!(&*tokens[1].file, "f.txt");
    }

    #[test]
    fn lone_dollar_is_a_lex_error() {
        let err = tokenize("t.txt", "ok\ncost: $5").unwrap_err();
        match err {
            Error::Lex { file, line, text } => {
                assert_eq!(file, "t.txt");
                assert_eq!(line, 2);
                assert_eq!(text, "$5");
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn unterminated_braced_expression_is_a_boundary_error() {
        let err = tokenize("t.txt", "${a + }").unwrap_err();
        assert!(matches!(err, Error::ExpressionBoundary { line: 1, .. }));
    }

    #[test]
    fn unclosed_delimited_tag_is_a_lex_error() {
        assert!(matches!(
            tokenize("t.txt", "{% for x in y"),
            Err(Error::Lex { .. })
        ));
    }

    #[test]
    fn interpolation_ignores_tags() {
        let file: Rc<str> = "page.xml".into();
        let tokens = interpolate(&file, 7, "{%x%} $y").unwrap();
        assert_eq!(tokens.len(), 2);
        assert_eq!(tokens[0].text, "{%x%} ");
        assert_eq!(tokens[1].kind, TokenKind::Expr);
        assert_eq!(tokens[1].line, 7);
    }

    #[test]
    fn line_continuations_are_joined() {
        assert_eq!(join_lines("a\\\nb"), "ab");
        assert_eq!(join_lines("a\\\\\nb"), "a\\\\\nb");
        assert_eq!(join_lines("a\nb"), "a\nb");
    }
}
