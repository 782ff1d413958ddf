//! Expression and statement AST for the embedded host-expression language.

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    FloorDiv,
    Mod,
    And,
    Or,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum CmpOp {
    Eq,
    NotEq,
    Lt,
    LtE,
    Gt,
    GtE,
    In,
    NotIn,
    Is,
    IsNot,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum UnaryOp {
    Not,
    Neg,
    Pos,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    None,
    BoolLit(bool),
    IntLit(i64),
    FloatLit(f64),
    StringLit(String),
    Var(String),
    Attribute(Box<Expr>, String),      // foo.bar
    Index(Box<Expr>, Box<Expr>),       // foo['bar']
    Call(Box<Expr>, Vec<Arg>),         // foo(1, x=2)
    List(Vec<Expr>),
    Tuple(Vec<Expr>),
    Dict(Vec<(Expr, Expr)>),
    Unary(UnaryOp, Box<Expr>),
    BinOp(Box<Expr>, BinOp, Box<Expr>),
    Compare(Box<Expr>, Vec<(CmpOp, Expr)>), // a < b <= c
    IfElse {
        test: Box<Expr>,
        body: Box<Expr>,
        orelse: Box<Expr>,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub enum Arg {
    Positional(Expr),
    Keyword(String, Expr),
}

/// A host-code statement, as found in processing instructions and `%py` tags.
#[derive(Debug, Clone, PartialEq)]
pub enum Stmt {
    Assign(Vec<String>, Expr),
    Expr(Expr),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Param {
    pub name: String,
    pub default: Option<Expr>,
}

/// `name(a, b=1)` as written in `py:def`, `%def` and `py:call args`.
#[derive(Debug, Clone, PartialEq)]
pub struct Signature {
    pub name: String,
    pub params: Vec<Param>,
}

/// `x in items` / `k, v in pairs` as written in a `for` header.
#[derive(Debug, Clone, PartialEq)]
pub struct LoopHeader {
    pub targets: Vec<String>,
    pub iter: Expr,
}
