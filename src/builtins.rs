//! Builtin functions and value methods available to every expression.

use crate::error::EvalError;
use crate::eval::{get_attr, ordering, Args};
use crate::value::{Callable, CallableKind, Value};
use std::cmp::Ordering;
use std::rc::Rc;

const FUNCTIONS: &[&str] = &[
    "abs", "bool", "enumerate", "float", "getattr", "hasattr", "int", "len", "list", "max", "min",
    "range", "repr", "reversed", "sorted", "str", "zip",
];

pub(crate) fn lookup(name: &str) -> Option<Value> {
    FUNCTIONS
        .iter()
        .find(|f| **f == name)
        .map(|f| Value::Callable(Callable(CallableKind::Builtin(*f))))
}

fn arity(name: &str, args: &[Value], min: usize, max: usize) -> Result<(), EvalError> {
    if (min..=max).contains(&args.len()) {
        return Ok(());
    }
    let expected = if min == max {
        format!("{min}")
    } else {
        format!("{min} to {max}")
    };
    Err(EvalError::Arguments(format!(
        "{name}() takes {expected} arguments ({} given)",
        args.len()
    )))
}

fn take_keyword(args: &mut Args, name: &str) -> Option<Value> {
    let i = args.keyword.iter().position(|(k, _)| k == name)?;
    Some(args.keyword.remove(i).1)
}

fn int_arg(name: &str, value: &Value) -> Result<i64, EvalError> {
    value.as_int().ok_or_else(|| {
        EvalError::Type(format!(
            "{name}() expected an integer, got '{}'",
            value.type_name()
        ))
    })
}

fn sort(items: &mut [Value]) -> Result<(), EvalError> {
    let mut failure = None;
    items.sort_by(|a, b| {
        ordering(a, b).unwrap_or_else(|e| {
            failure.get_or_insert(e);
            Ordering::Equal
        })
    });
    failure.map_or(Ok(()), Err)
}

fn extreme(name: &str, args: Vec<Value>, want: Ordering) -> Result<Value, EvalError> {
    let items = if args.len() == 1 {
        args[0].iter_items()?
    } else {
        args
    };
    let mut best: Option<Value> = None;
    for item in items {
        best = Some(match best {
            Some(current) if ordering(&item, &current)? != want => current,
            _ => item,
        });
    }
    best.ok_or_else(|| EvalError::Arguments(format!("{name}() arg is an empty sequence")))
}

pub(crate) fn call(name: &str, mut args: Args) -> Result<Value, EvalError> {
    match name {
        "sorted" => {
            let reverse = take_keyword(&mut args, "reverse").is_some_and(|v| v.is_truthy());
            let args = args.into_positional(name)?;
            arity(name, &args, 1, 1)?;
            let mut items = args[0].iter_items()?;
            sort(&mut items)?;
            if reverse {
                items.reverse();
            }
            return Ok(Value::list(items));
        }
        "enumerate" => {
            let start = take_keyword(&mut args, "start");
            let args = args.into_positional(name)?;
            arity(name, &args, 1, 2)?;
            let start = match start.as_ref().or(args.get(1)) {
                Some(v) => int_arg(name, v)?,
                None => 0,
            };
            let items = args[0].iter_items()?;
            let mut out = Vec::with_capacity(items.len());
            for (i, item) in (start..).zip(items) {
                out.push(Value::list(vec![Value::Int(i), item]));
            }
            return Ok(Value::list(out));
        }
        _ => {}
    }

    let args = args.into_positional(name)?;
    match name {
        "len" => {
            arity(name, &args, 1, 1)?;
            let len = match &args[0] {
                Value::Str(s) => s.chars().count(),
                Value::List(items) => items.len(),
                Value::Dict(map) => map.len(),
                other => {
                    return Err(EvalError::Type(format!(
                        "object of type '{}' has no len()",
                        other.type_name()
                    )))
                }
            };
            Ok(Value::from(len))
        }
        "str" => {
            arity(name, &args, 0, 1)?;
            Ok(Value::from(args.first().map(Value::to_string).unwrap_or_default()))
        }
        "repr" => {
            arity(name, &args, 1, 1)?;
            Ok(Value::from(args[0].repr()))
        }
        "bool" => {
            arity(name, &args, 0, 1)?;
            Ok(Value::Bool(args.first().is_some_and(Value::is_truthy)))
        }
        "int" => {
            arity(name, &args, 0, 1)?;
            match args.first() {
                None => Ok(Value::Int(0)),
                Some(Value::Float(f)) if f.is_finite() => Ok(Value::Int(f.trunc() as i64)),
                Some(Value::Str(s)) => s.trim().parse().map(Value::Int).map_err(|_| {
                    EvalError::Type(format!("invalid literal for int(): {:?}", s))
                }),
                Some(v) => v.as_int().map(Value::Int).ok_or_else(|| {
                    EvalError::Type(format!("int() argument must be a number, not '{}'", v.type_name()))
                }),
            }
        }
        "float" => {
            arity(name, &args, 0, 1)?;
            match args.first() {
                None => Ok(Value::Float(0.0)),
                Some(Value::Str(s)) => s.trim().parse().map(Value::Float).map_err(|_| {
                    EvalError::Type(format!("could not convert string to float: {:?}", s))
                }),
                Some(v) => v.as_f64().map(Value::Float).ok_or_else(|| {
                    EvalError::Type(format!("float() argument must be a number, not '{}'", v.type_name()))
                }),
            }
        }
        "abs" => {
            arity(name, &args, 1, 1)?;
            match &args[0] {
                Value::Int(i) => i.checked_abs().map(Value::Int).ok_or(EvalError::Overflow),
                Value::Float(f) => Ok(Value::Float(f.abs())),
                other => Err(EvalError::Type(format!(
                    "bad operand type for abs(): '{}'",
                    other.type_name()
                ))),
            }
        }
        "range" => {
            arity(name, &args, 1, 3)?;
            let ints = args
                .iter()
                .map(|a| int_arg(name, a))
                .collect::<Result<Vec<_>, _>>()?;
            let (start, stop, step) = match *ints.as_slice() {
                [stop] => (0, stop, 1),
                [start, stop] => (start, stop, 1),
                [start, stop, step] => (start, stop, step),
                _ => return Err(EvalError::Arguments("range() takes 1 to 3 arguments".into())),
            };
            if step == 0 {
                return Err(EvalError::Arguments("range() arg 3 must not be zero".into()));
            }
            let mut out = Vec::new();
            let mut i = start;
            while (step > 0 && i < stop) || (step < 0 && i > stop) {
                out.push(Value::Int(i));
                i = i.checked_add(step).ok_or(EvalError::Overflow)?;
            }
            Ok(Value::list(out))
        }
        "list" => {
            arity(name, &args, 0, 1)?;
            match args.first() {
                Some(v) => Ok(Value::list(v.iter_items()?)),
                None => Ok(Value::list(Vec::<Value>::new())),
            }
        }
        "reversed" => {
            arity(name, &args, 1, 1)?;
            let mut items = args[0].iter_items()?;
            items.reverse();
            Ok(Value::list(items))
        }
        "min" => extreme(name, args, Ordering::Less),
        "max" => extreme(name, args, Ordering::Greater),
        "zip" => {
            let columns = args
                .iter()
                .map(Value::iter_items)
                .collect::<Result<Vec<_>, _>>()?;
            let len = columns.iter().map(Vec::len).min().unwrap_or(0);
            Ok(Value::list(
                (0..len)
                    .map(|i| Value::list(columns.iter().map(|c| c[i].clone()).collect::<Vec<_>>()))
                    .collect::<Vec<_>>(),
            ))
        }
        "getattr" => {
            arity(name, &args, 2, 3)?;
            let attr = args[1]
                .as_str()
                .ok_or_else(|| EvalError::Type("getattr(): attribute name must be a string".into()))?;
            match (get_attr(&args[0], attr), args.get(2)) {
                (Err(EvalError::NoAttribute { .. }), Some(default)) => Ok(default.clone()),
                (result, _) => result,
            }
        }
        "hasattr" => {
            arity(name, &args, 2, 2)?;
            let attr = args[1]
                .as_str()
                .ok_or_else(|| EvalError::Type("hasattr(): attribute name must be a string".into()))?;
            Ok(Value::Bool(get_attr(&args[0], attr).is_ok()))
        }
        other => Err(EvalError::Undefined(other.to_string())),
    }
}

const STR_METHODS: &[&str] = &[
    "capitalize", "endswith", "join", "lower", "lstrip", "replace", "rstrip", "split",
    "startswith", "strip", "title", "upper",
];
const DICT_METHODS: &[&str] = &["get", "items", "keys", "values"];
const LIST_METHODS: &[&str] = &["count", "index"];
const INSTANCE_METHODS: &[&str] = &["render"];

pub(crate) fn has_method(value: &Value, name: &str) -> bool {
    let table = match value {
        Value::Str(_) => STR_METHODS,
        Value::Dict(_) => DICT_METHODS,
        Value::List(_) => LIST_METHODS,
        Value::Instance(_) => INSTANCE_METHODS,
        _ => return false,
    };
    table.contains(&name)
}

fn str_arg<'a>(method: &str, value: &'a Value) -> Result<&'a str, EvalError> {
    value.as_str().ok_or_else(|| {
        EvalError::Type(format!(
            "{method}() argument must be str, not '{}'",
            value.type_name()
        ))
    })
}

fn title_case(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut at_word_start = true;
    for c in s.chars() {
        if c.is_alphabetic() {
            if at_word_start {
                out.extend(c.to_uppercase());
            } else {
                out.extend(c.to_lowercase());
            }
            at_word_start = false;
        } else {
            out.push(c);
            at_word_start = true;
        }
    }
    out
}

fn strip<'a>(s: &'a str, chars: Option<&Value>, left: bool, right: bool) -> Result<&'a str, EvalError> {
    let set: Option<Vec<char>> = match chars {
        None | Some(Value::None) => None,
        Some(v) => Some(str_arg("strip", v)?.chars().collect()),
    };
    let matches = |c: char| match &set {
        Some(set) => set.contains(&c),
        None => c.is_whitespace(),
    };
    let mut out = s;
    if left {
        out = out.trim_start_matches(matches);
    }
    if right {
        out = out.trim_end_matches(matches);
    }
    Ok(out)
}

fn str_method(s: &str, name: &str, args: &[Value]) -> Result<Value, EvalError> {
    match name {
        "upper" => Ok(Value::from(s.to_uppercase())),
        "lower" => Ok(Value::from(s.to_lowercase())),
        "title" => Ok(Value::from(title_case(s))),
        "capitalize" => {
            let mut chars = s.chars();
            let Some(first) = chars.next() else {
                return Ok(Value::from(""));
            };
            let mut out: String = first.to_uppercase().collect();
            out.push_str(&chars.as_str().to_lowercase());
            Ok(Value::from(out))
        }
        "strip" | "lstrip" | "rstrip" => {
            arity(name, args, 0, 1)?;
            let (left, right) = match name {
                "lstrip" => (true, false),
                "rstrip" => (false, true),
                _ => (true, true),
            };
            Ok(Value::from(strip(s, args.first(), left, right)?))
        }
        "split" => {
            arity(name, args, 0, 1)?;
            let parts: Vec<Value> = match args.first() {
                None | Some(Value::None) => s.split_whitespace().map(Value::from).collect(),
                Some(sep) => {
                    let sep = str_arg(name, sep)?;
                    if sep.is_empty() {
                        return Err(EvalError::Arguments("empty separator".into()));
                    }
                    s.split(sep).map(Value::from).collect()
                }
            };
            Ok(Value::list(parts))
        }
        "join" => {
            arity(name, args, 1, 1)?;
            let items = args[0].iter_items()?;
            let parts: Vec<String> = items.iter().map(Value::to_string).collect();
            Ok(Value::from(parts.join(s)))
        }
        "replace" => {
            arity(name, args, 2, 2)?;
            Ok(Value::from(s.replace(str_arg(name, &args[0])?, str_arg(name, &args[1])?)))
        }
        "startswith" => {
            arity(name, args, 1, 1)?;
            Ok(Value::Bool(s.starts_with(str_arg(name, &args[0])?)))
        }
        "endswith" => {
            arity(name, args, 1, 1)?;
            Ok(Value::Bool(s.ends_with(str_arg(name, &args[0])?)))
        }
        other => Err(EvalError::NoAttribute {
            type_name: "str".into(),
            attr: other.into(),
        }),
    }
}

pub(crate) fn call_method(receiver: &Value, name: &str, args: Args) -> Result<Value, EvalError> {
    let args = args.into_positional(name)?;
    match receiver {
        Value::Str(s) => str_method(s, name, &args),
        Value::Dict(map) => match name {
            "get" => {
                arity(name, &args, 1, 2)?;
                let key = args[0].as_str().map_or_else(|| args[0].to_string(), str::to_string);
                Ok(map
                    .get(&key)
                    .cloned()
                    .unwrap_or_else(|| args.get(1).cloned().unwrap_or_default()))
            }
            "keys" => Ok(Value::list(map.keys().map(|k| Value::from(k.as_str())).collect::<Vec<_>>())),
            "values" => Ok(Value::list(map.values().cloned().collect::<Vec<_>>())),
            "items" => Ok(Value::list(
                map.iter()
                    .map(|(k, v)| Value::list(vec![Value::from(k.as_str()), v.clone()]))
                    .collect::<Vec<_>>(),
            )),
            _ => Err(EvalError::NoAttribute {
                type_name: "dict".into(),
                attr: name.into(),
            }),
        },
        Value::List(items) => match name {
            "count" => {
                arity(name, &args, 1, 1)?;
                Ok(Value::from(items.iter().filter(|v| **v == args[0]).count()))
            }
            "index" => {
                arity(name, &args, 1, 1)?;
                items
                    .iter()
                    .position(|v| *v == args[0])
                    .map(Value::from)
                    .ok_or_else(|| EvalError::Index(format!("{} is not in list", args[0].repr())))
            }
            _ => Err(EvalError::NoAttribute {
                type_name: "list".into(),
                attr: name.into(),
            }),
        },
        Value::Instance(instance) if name == "render" => {
            arity(name, &args, 0, 0)?;
            Ok(Value::Str(Rc::from(instance.render()?)))
        }
        other => Err(EvalError::NoAttribute {
            type_name: other.type_name().into(),
            attr: name.into(),
        }),
    }
}
