use crate::ast::*;
use crate::builtins;
use crate::error::EvalError;
use crate::value::{Callable, CallableKind, Value};
use indexmap::IndexMap;
use std::cell::RefCell;
use std::cmp::Ordering;
use std::rc::Rc;

/// One level of function-local variables. Nested levels come from caller
/// closures and inner functions.
#[derive(Default)]
pub(crate) struct Scope {
    vars: RefCell<IndexMap<String, Value>>,
    parent: Option<Rc<Scope>>,
}

impl Scope {
    pub fn root() -> Rc<Scope> {
        Rc::new(Scope::default())
    }

    pub fn child(parent: &Rc<Scope>) -> Rc<Scope> {
        Rc::new(Scope {
            vars: RefCell::default(),
            parent: Some(parent.clone()),
        })
    }

    pub fn get(&self, name: &str) -> Option<Value> {
        if let Some(value) = self.vars.borrow().get(name) {
            return Some(value.clone());
        }
        self.parent.as_ref().and_then(|p| p.get(name))
    }

    pub fn set(&self, name: &str, value: Value) {
        self.vars.borrow_mut().insert(name.to_string(), value);
    }
}

#[derive(Debug, Default)]
pub(crate) struct Args {
    pub positional: Vec<Value>,
    pub keyword: Vec<(String, Value)>,
}

impl Args {
    /// Reject keyword arguments for callables that only take positionals.
    pub fn into_positional(self, callee: &str) -> Result<Vec<Value>, EvalError> {
        match self.keyword.first() {
            Some((name, _)) => Err(EvalError::Arguments(format!(
                "{callee}() got an unexpected keyword argument '{name}'"
            ))),
            None => Ok(self.positional),
        }
    }
}

/// Name resolution and template calls, supplied by whoever runs the code.
pub(crate) trait Env {
    fn lookup(&self, name: &str) -> Option<Value>;
    fn assign(&self, name: &str, value: Value);
    /// Run a template function to completion and return its joined output.
    fn call_function(&self, callee: &Callable, args: Args) -> Result<Value, EvalError>;
}

pub(crate) struct Evaluator<'a> {
    env: &'a dyn Env,
}

impl<'a> Evaluator<'a> {
    pub fn new(env: &'a dyn Env) -> Self {
        Self { env }
    }

    pub fn exec(&self, stmts: &[Stmt]) -> Result<(), EvalError> {
        for stmt in stmts {
            match stmt {
                Stmt::Expr(expr) => {
                    self.eval_expr(expr)?;
                }
                Stmt::Assign(targets, expr) => {
                    let value = self.eval_expr(expr)?;
                    self.bind(targets, value)?;
                }
            }
        }
        Ok(())
    }

    /// Bind one value to `targets`, unpacking when there are several.
    pub fn bind(&self, targets: &[String], value: Value) -> Result<(), EvalError> {
        if let [name] = targets {
            self.env.assign(name, value);
            return Ok(());
        }
        let items = value.iter_items()?;
        if items.len() != targets.len() {
            return Err(EvalError::Type(format!(
                "cannot unpack {} values into {} names",
                items.len(),
                targets.len()
            )));
        }
        for (name, item) in targets.iter().zip(items) {
            self.env.assign(name, item);
        }
        Ok(())
    }

    pub fn eval_expr(&self, expr: &Expr) -> Result<Value, EvalError> {
        match expr {
            Expr::None => Ok(Value::None),
            Expr::BoolLit(b) => Ok(Value::Bool(*b)),
            Expr::IntLit(i) => Ok(Value::Int(*i)),
            Expr::FloatLit(f) => Ok(Value::Float(*f)),
            Expr::StringLit(s) => Ok(Value::from(s.as_str())),
            Expr::Var(name) => self
                .env
                .lookup(name)
                .or_else(|| builtins::lookup(name))
                .ok_or_else(|| EvalError::Undefined(name.clone())),
            Expr::Attribute(obj, attr) => {
                let value = self.eval_expr(obj)?;
                get_attr(&value, attr)
            }
            Expr::Index(obj, idx) => {
                let value = self.eval_expr(obj)?;
                let index = self.eval_expr(idx)?;
                get_item(&value, &index)
            }
            Expr::Call(callee, args) => {
                let callee = self.eval_expr(callee)?;
                let args = self.eval_args(args)?;
                self.call(&callee, args)
            }
            Expr::List(items) | Expr::Tuple(items) => Ok(Value::List(Rc::new(
                items
                    .iter()
                    .map(|item| self.eval_expr(item))
                    .collect::<Result<_, _>>()?,
            ))),
            Expr::Dict(pairs) => {
                let mut map = IndexMap::with_capacity(pairs.len());
                for (k, v) in pairs {
                    let key = match self.eval_expr(k)? {
                        Value::Str(s) => s.to_string(),
                        other => other.to_string(),
                    };
                    map.insert(key, self.eval_expr(v)?);
                }
                Ok(Value::from(map))
            }
            Expr::Unary(op, operand) => {
                let value = self.eval_expr(operand)?;
                unary(*op, value)
            }
            Expr::BinOp(lhs, BinOp::And, rhs) => {
                let l = self.eval_expr(lhs)?;
                if !l.is_truthy() {
                    return Ok(l);
                }
                self.eval_expr(rhs)
            }
            Expr::BinOp(lhs, BinOp::Or, rhs) => {
                let l = self.eval_expr(lhs)?;
                if l.is_truthy() {
                    return Ok(l);
                }
                self.eval_expr(rhs)
            }
            Expr::BinOp(lhs, op, rhs) => {
                let l = self.eval_expr(lhs)?;
                let r = self.eval_expr(rhs)?;
                binary(*op, l, r)
            }
            Expr::Compare(first, rest) => {
                let mut lhs = self.eval_expr(first)?;
                for (op, rhs) in rest {
                    let rhs = self.eval_expr(rhs)?;
                    if !compare(*op, &lhs, &rhs)? {
                        return Ok(Value::Bool(false));
                    }
                    lhs = rhs;
                }
                Ok(Value::Bool(true))
            }
            Expr::IfElse { test, body, orelse } => {
                if self.eval_expr(test)?.is_truthy() {
                    self.eval_expr(body)
                } else {
                    self.eval_expr(orelse)
                }
            }
        }
    }

    pub fn eval_args(&self, args: &[Arg]) -> Result<Args, EvalError> {
        let mut out = Args::default();
        for arg in args {
            match arg {
                Arg::Positional(expr) => out.positional.push(self.eval_expr(expr)?),
                Arg::Keyword(name, expr) => out.keyword.push((name.clone(), self.eval_expr(expr)?)),
            }
        }
        Ok(out)
    }

    pub fn call(&self, callee: &Value, args: Args) -> Result<Value, EvalError> {
        match callee {
            Value::Callable(callable) => match &callable.0 {
                CallableKind::Builtin(name) => builtins::call(name, args),
                CallableKind::Native(f) => f(&args.into_positional("function")?),
                CallableKind::Method(receiver, name) => builtins::call_method(receiver, name, args),
                CallableKind::Bound(..) | CallableKind::Closure(_) => {
                    self.env.call_function(callable, args)
                }
            },
            // `tpl(context)` or `tpl(name=value, ...)` instantiates
            Value::Template(template) => {
                let mut context = match args.positional.as_slice() {
                    [] => IndexMap::new(),
                    [Value::Dict(map)] => map.as_ref().clone(),
                    _ => {
                        return Err(EvalError::Arguments(
                            "a template takes at most one context mapping".into(),
                        ))
                    }
                };
                context.extend(args.keyword);
                Ok(Value::Instance(template.instantiate(context.into())))
            }
            other => Err(EvalError::NotCallable(other.type_name().into())),
        }
    }
}

pub(crate) fn get_attr(value: &Value, attr: &str) -> Result<Value, EvalError> {
    let found = match value {
        Value::Dict(map) => map.get(attr).cloned(),
        Value::Instance(instance) => instance.attribute(attr),
        _ => None,
    };
    if let Some(found) = found {
        return Ok(found);
    }
    if builtins::has_method(value, attr) {
        return Ok(Value::Callable(Callable(CallableKind::Method(
            Box::new(value.clone()),
            attr.into(),
        ))));
    }
    Err(EvalError::NoAttribute {
        type_name: value.type_name().into(),
        attr: attr.into(),
    })
}

fn normalize_index(index: i64, len: usize) -> Option<usize> {
    let len = i64::try_from(len).ok()?;
    let i = if index < 0 { index + len } else { index };
    (0..len).contains(&i).then_some(i as usize)
}

pub(crate) fn get_item(value: &Value, index: &Value) -> Result<Value, EvalError> {
    match (value, index) {
        (Value::Dict(map), key) => {
            let key = match key {
                Value::Str(s) => s.to_string(),
                other => other.to_string(),
            };
            map.get(&key)
                .cloned()
                .ok_or_else(|| EvalError::Index(format!("key {key:?} not found")))
        }
        (Value::List(items), Value::Int(i)) => normalize_index(*i, items.len())
            .map(|i| items[i].clone())
            .ok_or_else(|| EvalError::Index(format!("list index {i} out of range"))),
        (Value::Str(s), Value::Int(i)) => {
            let chars: Vec<char> = s.chars().collect();
            normalize_index(*i, chars.len())
                .map(|i| Value::from(chars[i].to_string()))
                .ok_or_else(|| EvalError::Index(format!("string index {i} out of range")))
        }
        (container, index) => Err(EvalError::Type(format!(
            "'{}' indices must be integers, not '{}'",
            container.type_name(),
            index.type_name()
        ))),
    }
}

fn unary(op: UnaryOp, value: Value) -> Result<Value, EvalError> {
    match (op, value) {
        (UnaryOp::Not, v) => Ok(Value::Bool(!v.is_truthy())),
        (UnaryOp::Neg, Value::Int(i)) => i.checked_neg().map(Value::Int).ok_or(EvalError::Overflow),
        (UnaryOp::Neg, Value::Float(f)) => Ok(Value::Float(-f)),
        (UnaryOp::Pos, v @ (Value::Int(_) | Value::Float(_))) => Ok(v),
        (_, v) => Err(EvalError::Type(format!(
            "bad operand type for unary operator: '{}'",
            v.type_name()
        ))),
    }
}

fn type_error(op: &str, l: &Value, r: &Value) -> EvalError {
    EvalError::Type(format!(
        "unsupported operand types for {op}: '{}' and '{}'",
        l.type_name(),
        r.type_name()
    ))
}

/// Repeat count and total length of `len` items repeated `times` times.
/// Negative counts repeat nothing.
fn repeat_len(len: usize, times: i64) -> Result<(usize, usize), EvalError> {
    let times = if len == 0 { 0 } else { usize::try_from(times).unwrap_or(0) };
    let total = len.checked_mul(times).ok_or(EvalError::Overflow)?;
    Ok((times, total))
}

fn repeat<T: Clone>(items: &[T], times: i64) -> Result<Vec<T>, EvalError> {
    let (times, total) = repeat_len(items.len(), times)?;
    let mut out = Vec::new();
    out.try_reserve_exact(total).map_err(|_| EvalError::Overflow)?;
    for _ in 0..times {
        out.extend_from_slice(items);
    }
    Ok(out)
}

fn repeat_str(s: &str, times: i64) -> Result<String, EvalError> {
    let (times, total) = repeat_len(s.len(), times)?;
    let mut out = String::new();
    out.try_reserve_exact(total).map_err(|_| EvalError::Overflow)?;
    for _ in 0..times {
        out.push_str(s);
    }
    Ok(out)
}

fn floor_div(a: i64, b: i64) -> Result<i64, EvalError> {
    if b == 0 {
        return Err(EvalError::ZeroDivision);
    }
    let q = a.checked_div(b).ok_or(EvalError::Overflow)?;
    Ok(if a % b != 0 && ((a < 0) != (b < 0)) { q - 1 } else { q })
}

fn modulo(a: i64, b: i64) -> Result<i64, EvalError> {
    if b == 0 {
        return Err(EvalError::ZeroDivision);
    }
    let r = a.checked_rem(b).ok_or(EvalError::Overflow)?;
    Ok(if r != 0 && ((r < 0) != (b < 0)) { r + b } else { r })
}

fn binary(op: BinOp, l: Value, r: Value) -> Result<Value, EvalError> {
    use Value::{Float, Int, List, Str};
    let symbol = match op {
        BinOp::Add => "+",
        BinOp::Sub => "-",
        BinOp::Mul => "*",
        BinOp::Div => "/",
        BinOp::FloorDiv => "//",
        BinOp::Mod => "%",
        BinOp::And => "and",
        BinOp::Or => "or",
    };
    match (op, &l, &r) {
        (BinOp::Add, Int(a), Int(b)) => a.checked_add(*b).map(Int).ok_or(EvalError::Overflow),
        (BinOp::Sub, Int(a), Int(b)) => a.checked_sub(*b).map(Int).ok_or(EvalError::Overflow),
        (BinOp::Mul, Int(a), Int(b)) => a.checked_mul(*b).map(Int).ok_or(EvalError::Overflow),
        (BinOp::FloorDiv, Int(a), Int(b)) => floor_div(*a, *b).map(Int),
        (BinOp::Mod, Int(a), Int(b)) => modulo(*a, *b).map(Int),
        (BinOp::Add, Str(a), Str(b)) => Ok(Value::from(format!("{a}{b}"))),
        (BinOp::Add, List(a), List(b)) => {
            Ok(Value::List(Rc::new(a.iter().chain(b.iter()).cloned().collect())))
        }
        (BinOp::Mul, Str(s), Int(n)) | (BinOp::Mul, Int(n), Str(s)) => {
            repeat_str(s, *n).map(Value::from)
        }
        (BinOp::Mul, List(items), Int(n)) | (BinOp::Mul, Int(n), List(items)) => {
            Ok(Value::List(Rc::new(repeat(items, *n)?)))
        }
        (_, Int(_) | Float(_), Int(_) | Float(_)) => {
            let (a, b) = (l.as_f64().unwrap_or_default(), r.as_f64().unwrap_or_default());
            match op {
                BinOp::Add => Ok(Float(a + b)),
                BinOp::Sub => Ok(Float(a - b)),
                BinOp::Mul => Ok(Float(a * b)),
                BinOp::Div if b == 0.0 => Err(EvalError::ZeroDivision),
                BinOp::Div => Ok(Float(a / b)),
                BinOp::FloorDiv | BinOp::Mod if b == 0.0 => Err(EvalError::ZeroDivision),
                BinOp::FloorDiv => Ok(Float((a / b).floor())),
                BinOp::Mod => Ok(Float(a - b * (a / b).floor())),
                BinOp::And | BinOp::Or => Err(type_error(symbol, &l, &r)),
            }
        }
        _ => Err(type_error(symbol, &l, &r)),
    }
}

pub(crate) fn ordering(l: &Value, r: &Value) -> Result<Ordering, EvalError> {
    match (l, r) {
        (Value::Str(a), Value::Str(b)) => Ok(a.cmp(b)),
        (Value::List(a), Value::List(b)) => {
            for (x, y) in a.iter().zip(b.iter()) {
                match ordering(x, y)? {
                    Ordering::Equal => continue,
                    other => return Ok(other),
                }
            }
            Ok(a.len().cmp(&b.len()))
        }
        _ => match (l.as_f64(), r.as_f64()) {
            (Some(a), Some(b)) => a
                .partial_cmp(&b)
                .ok_or_else(|| EvalError::Type("cannot order NaN".into())),
            _ => Err(EvalError::Type(format!(
                "'<' not supported between '{}' and '{}'",
                l.type_name(),
                r.type_name()
            ))),
        },
    }
}

fn contains(container: &Value, item: &Value) -> Result<bool, EvalError> {
    match (container, item) {
        (Value::List(items), item) => Ok(items.contains(item)),
        (Value::Dict(map), Value::Str(key)) => Ok(map.contains_key(&**key)),
        (Value::Dict(_), _) => Ok(false),
        (Value::Str(haystack), Value::Str(needle)) => Ok(haystack.contains(&**needle)),
        (container, item) => Err(EvalError::Type(format!(
            "'in <{}>' requires a container, got '{}'",
            container.type_name(),
            item.type_name()
        ))),
    }
}

fn is_same(l: &Value, r: &Value) -> bool {
    match (l, r) {
        (Value::List(a), Value::List(b)) => Rc::ptr_eq(a, b),
        (Value::Dict(a), Value::Dict(b)) => Rc::ptr_eq(a, b),
        (Value::Str(a), Value::Str(b)) => Rc::ptr_eq(a, b) || a == b,
        (Value::Bool(_), Value::Bool(_)) => l == r,
        (Value::Bool(_), _) | (_, Value::Bool(_)) => false,
        (Value::Int(_), Value::Float(_)) | (Value::Float(_), Value::Int(_)) => false,
        _ => l == r,
    }
}

fn compare(op: CmpOp, l: &Value, r: &Value) -> Result<bool, EvalError> {
    Ok(match op {
        CmpOp::Eq => l == r,
        CmpOp::NotEq => l != r,
        CmpOp::Lt => ordering(l, r)? == Ordering::Less,
        CmpOp::LtE => ordering(l, r)? != Ordering::Greater,
        CmpOp::Gt => ordering(l, r)? == Ordering::Greater,
        CmpOp::GtE => ordering(l, r)? != Ordering::Less,
        CmpOp::In => contains(r, l)?,
        CmpOp::NotIn => !contains(r, l)?,
        CmpOp::Is => is_same(l, r),
        CmpOp::IsNot => !is_same(l, r),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::{parse_expression, parse_statements};

    /// A flat variable map with no template functions.
    #[derive(Default)]
    struct Vars(RefCell<IndexMap<String, Value>>);

    impl Env for Vars {
        fn lookup(&self, name: &str) -> Option<Value> {
            self.0.borrow().get(name).cloned()
        }

        fn assign(&self, name: &str, value: Value) {
            self.0.borrow_mut().insert(name.to_string(), value);
        }

        fn call_function(&self, callee: &Callable, _: Args) -> Result<Value, EvalError> {
            Err(EvalError::Arguments(format!("cannot call {}", callee.name())))
        }
    }

    fn eval_with(vars: &Vars, src: &str) -> Result<Value, EvalError> {
        let expr = parse_expression(src).unwrap();
        Evaluator::new(vars).eval_expr(&expr)
    }

    fn eval(src: &str) -> Value {
        eval_with(&Vars::default(), src).unwrap()
    }

    #[test]
    fn arithmetic_follows_python_rules() {
        assert_eq!(eval("1 + 2 * 3"), Value::Int(7));
        assert_eq!(eval("7 / 2"), Value::Float(3.5));
        assert_eq!(eval("-7 // 2"), Value::Int(-4));
        assert_eq!(eval("7 // -2"), Value::Int(-4));
        assert_eq!(eval("-7 % 3"), Value::Int(2));
        assert_eq!(eval("'ab' * 2"), Value::from("abab"));
        assert_eq!(eval("'ab' * -1"), Value::from(""));
        assert_eq!(eval("[1] + [2]"), Value::list(vec![1, 2]));
        assert!(matches!(
            eval_with(&Vars::default(), "1 / 0"),
            Err(EvalError::ZeroDivision)
        ));
    }

    #[test]
    fn huge_repetition_is_an_overflow() {
        for src in [
            "'ab' * 9223372036854775807",
            "[1, 2] * 9223372036854775807",
            "9223372036854775807 * [1, 2]",
        ] {
            assert!(
                matches!(eval_with(&Vars::default(), src), Err(EvalError::Overflow)),
                "{src}"
            );
        }
        assert_eq!(eval("[] * 9223372036854775807"), Value::list(Vec::<Value>::new()));
    }

    #[test]
    fn boolean_operators_return_operands() {
        assert_eq!(eval("'' or 'fallback'"), Value::from("fallback"));
        assert_eq!(eval("0 and missing"), Value::Int(0));
        assert_eq!(eval("not []"), Value::Bool(true));
    }

    #[test]
    fn chained_comparisons_and_membership() {
        assert_eq!(eval("1 < 2 < 3"), Value::Bool(true));
        assert_eq!(eval("1 < 3 < 2"), Value::Bool(false));
        assert_eq!(eval("'b' in 'abc'"), Value::Bool(true));
        assert_eq!(eval("'k' in {'k': 1}"), Value::Bool(true));
        assert_eq!(eval("3 not in [1, 2]"), Value::Bool(true));
        assert_eq!(eval("None is None"), Value::Bool(true));
    }

    #[test]
    fn attribute_and_index_access() {
        let vars = Vars::default();
        vars.assign(
            "user",
            Value::dict([("name", Value::from("ada")), ("tags", Value::list(vec!["x", "y"]))]),
        );
        assert_eq!(eval_with(&vars, "user.name").unwrap(), Value::from("ada"));
        assert_eq!(eval_with(&vars, "user['tags'][-1]").unwrap(), Value::from("y"));
        assert_eq!(eval_with(&vars, "user.name.upper()").unwrap(), Value::from("ADA"));
        assert!(matches!(
            eval_with(&vars, "user.email"),
            Err(EvalError::NoAttribute { .. })
        ));
        assert!(matches!(
            eval_with(&vars, "user.tags[5]"),
            Err(EvalError::Index(_))
        ));
    }

    #[test]
    fn undefined_names_are_errors() {
        let err = eval_with(&Vars::default(), "nope + 1").unwrap_err();
        assert!(matches!(err, EvalError::Undefined(name) if name == "nope"));
    }

    #[test]
    fn native_functions_are_callable() {
        let vars = Vars::default();
        vars.assign(
            "double",
            Value::function(|args| match args {
                [Value::Int(i)] => Ok(Value::Int(i * 2)),
                _ => Err(EvalError::Arguments("double(int)".into())),
            }),
        );
        assert_eq!(eval_with(&vars, "double(21)").unwrap(), Value::Int(42));
        assert!(eval_with(&vars, "double(x=1)").is_err());
    }

    #[test]
    fn statements_assign_and_unpack() {
        let vars = Vars::default();
        let stmts = parse_statements("a, b = 1, 2; c = a + b").unwrap();
        Evaluator::new(&vars).exec(&stmts).unwrap();
        assert_eq!(vars.lookup("c"), Some(Value::Int(3)));

        let stmts = parse_statements("x, y = [1, 2, 3]").unwrap();
        assert!(Evaluator::new(&vars).exec(&stmts).is_err());
    }

    #[test]
    fn scopes_shadow_their_parents() {
        let root = Scope::root();
        root.set("x", Value::Int(1));
        let inner = Scope::child(&root);
        inner.set("x", Value::Int(2));
        assert_eq!(inner.get("x"), Some(Value::Int(2)));
        assert_eq!(root.get("x"), Some(Value::Int(1)));
    }
}
