//! Tokenizer for the embedded expression language.
//!
//! Tokens carry byte offsets into the input so the parser can report exactly
//! where a complete expression stops, which is how `${...}` finds its end.

#[derive(Debug, Clone, PartialEq)]
pub enum Token {
    // Keywords
    If,
    Else,
    In,
    Not,
    And,
    Or,
    Is,
    True,
    False,
    None,

    // Symbols
    EqEq,        // ==
    NotEq,       // !=
    Lt,          // <
    LtE,         // <=
    Gt,          // >
    GtE,         // >=
    Assign,      // =
    Plus,        // +
    Minus,       // -
    Star,        // *
    Slash,       // /
    DoubleSlash, // //
    Percent,     // %
    Dot,         // .
    Comma,       // ,
    Colon,       // :
    Semicolon,   // ;
    LBracket,    // [
    RBracket,    // ]
    LParen,      // (
    RParen,      // )
    LBrace,      // {
    RBrace,      // }

    // Data
    Ident(String),
    StringLit(String),
    Int(i64),
    Float(f64),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Spanned {
    pub token: Token,
    pub start: usize,
    pub end: usize,
}

const SYMBOLS: &[(&str, Token)] = &[
    ("==", Token::EqEq),
    ("!=", Token::NotEq),
    ("<=", Token::LtE),
    (">=", Token::GtE),
    ("//", Token::DoubleSlash),
    ("<", Token::Lt),
    (">", Token::Gt),
    ("=", Token::Assign),
    ("+", Token::Plus),
    ("-", Token::Minus),
    ("*", Token::Star),
    ("/", Token::Slash),
    ("%", Token::Percent),
    (".", Token::Dot),
    (",", Token::Comma),
    (":", Token::Colon),
    (";", Token::Semicolon),
    ("[", Token::LBracket),
    ("]", Token::RBracket),
    ("(", Token::LParen),
    (")", Token::RParen),
    ("{", Token::LBrace),
    ("}", Token::RBrace),
];

#[derive(Clone)]
pub struct Tokenizer<'a> {
    input: &'a str,
    cursor: usize,
}

impl<'a> Tokenizer<'a> {
    pub fn new(input: &'a str) -> Self {
        Self { input, cursor: 0 }
    }

    fn remaining(&self) -> &'a str {
        &self.input[self.cursor..]
    }

    fn advance(&mut self, n: usize) {
        self.cursor += n;
    }

    pub fn next_token(&mut self) -> Result<Option<Spanned>, String> {
        let rest = self.remaining();
        let rest_trimmed = rest.trim_start();
        self.advance(rest.len() - rest_trimmed.len());

        let start = self.cursor;
        let rest = self.remaining();
        let Some(first) = rest.chars().next() else {
            return Ok(None);
        };

        let token = if first == '\'' || first == '"' {
            self.string_literal(first)?
        } else if first.is_ascii_digit() {
            self.number()?
        } else if first.is_alphabetic() || first == '_' {
            let len = rest
                .find(|c: char| !(c.is_alphanumeric() || c == '_'))
                .unwrap_or(rest.len());
            let ident = &rest[..len];
            self.advance(len);
            match ident {
                "if" => Token::If,
                "else" => Token::Else,
                "in" => Token::In,
                "not" => Token::Not,
                "and" => Token::And,
                "or" => Token::Or,
                "is" => Token::Is,
                "True" | "true" => Token::True,
                "False" | "false" => Token::False,
                "None" | "none" => Token::None,
                _ => Token::Ident(ident.to_string()),
            }
        } else {
            match SYMBOLS.iter().find(|(sym, _)| rest.starts_with(sym)) {
                Some((sym, token)) => {
                    self.advance(sym.len());
                    token.clone()
                }
                None => return Err(format!("unexpected character {first:?}")),
            }
        };

        Ok(Some(Spanned {
            token,
            start,
            end: self.cursor,
        }))
    }

    fn string_literal(&mut self, quote: char) -> Result<Token, String> {
        let rest = self.remaining();
        let mut s = String::new();
        let mut chars = rest.char_indices().skip(1);
        while let Some((idx, c)) = chars.next() {
            if c == quote {
                self.advance(idx + c.len_utf8());
                return Ok(Token::StringLit(s));
            }
            if c == '\\' {
                match chars.next() {
                    Some((_, 'n')) => s.push('\n'),
                    Some((_, 't')) => s.push('\t'),
                    Some((_, 'r')) => s.push('\r'),
                    Some((_, '0')) => s.push('\0'),
                    Some((_, esc)) => s.push(esc),
                    None => break,
                }
            } else {
                s.push(c);
            }
        }
        Err("unterminated string literal".to_string())
    }

    fn number(&mut self) -> Result<Token, String> {
        let rest = self.remaining();
        let bytes = rest.as_bytes();
        let digits = |from: usize| {
            from + bytes[from..]
                .iter()
                .take_while(|b| b.is_ascii_digit() || **b == b'_')
                .count()
        };

        let mut end = digits(0);
        let mut is_float = false;
        if bytes.get(end) == Some(&b'.') && bytes.get(end + 1).is_some_and(u8::is_ascii_digit) {
            is_float = true;
            end = digits(end + 1);
        }
        if matches!(bytes.get(end), Some(b'e' | b'E')) {
            let mut exp = end + 1;
            if matches!(bytes.get(exp), Some(b'+' | b'-')) {
                exp += 1;
            }
            if bytes.get(exp).is_some_and(u8::is_ascii_digit) {
                is_float = true;
                end = digits(exp);
            }
        }

        let text: String = rest[..end].chars().filter(|c| *c != '_').collect();
        self.advance(end);
        if is_float {
            text.parse::<f64>()
                .map(Token::Float)
                .map_err(|e| format!("invalid float literal {text:?}: {e}"))
        } else {
            text.parse::<i64>()
                .map(Token::Int)
                .map_err(|e| format!("invalid integer literal {text:?}: {e}"))
        }
    }
}
