//! Lazy chunk production.
//!
//! Rendering is an explicit stack machine: every active function body, loop,
//! conditional branch and switch is a [`Frame`]. Each call to
//! [`Chunks::next`] runs instructions until at least one chunk is ready, so
//! abandoning the iterator simply drops the remaining frames (and with them
//! any switch values they pushed).

use crate::ast::Expr;
use crate::codegen::{AttrPart, Block, Function, Instr, Op};
use crate::error::{EvalError, Result};
use crate::eval::{Args, Env, Evaluator, Scope};
use crate::ir::{Pos, CALLER};
use crate::loader::Loader;
use crate::template::{Instance, SwitchGuard};
use crate::value::{Callable, CallableKind, Closure, Value};
use quick_xml::escape::escape;
use std::collections::VecDeque;
use std::iter::FusedIterator;
use std::rc::Rc;

/// The output of one render, produced on demand.
pub struct Chunks {
    stack: Vec<Frame>,
    pending: VecDeque<String>,
}

struct Frame {
    instance: Instance,
    scope: Rc<Scope>,
    body: Block,
    pc: usize,
    /// Outcome of the last `if`/`case` in this body, read by `else`.
    branch: Option<bool>,
    kind: FrameKind,
}

enum FrameKind {
    Body,
    Loop {
        targets: Rc<[String]>,
        items: std::vec::IntoIter<Value>,
        pos: Pos,
    },
    Switch {
        _guard: SwitchGuard,
    },
}

impl Frame {
    fn nested(parent: (&Instance, &Rc<Scope>), body: &Block, kind: FrameKind) -> Self {
        let pc = match kind {
            FrameKind::Loop { .. } => body.len(),
            _ => 0,
        };
        Self {
            instance: parent.0.clone(),
            scope: parent.1.clone(),
            body: body.clone(),
            pc,
            branch: None,
            kind,
        }
    }

    /// The `__call__` body of an instance.
    fn call(instance: &Instance) -> Option<Self> {
        let function = instance.template().function("__call__")?;
        Some(Self {
            instance: instance.clone(),
            scope: Scope::root(),
            body: function.body.clone(),
            pc: 0,
            branch: None,
            kind: FrameKind::Body,
        })
    }

    /// A template function or closure invocation with bound parameters.
    fn function(callee: &Callable, args: Args) -> Result<Self, EvalError> {
        let (instance, function, scope) = match &callee.0 {
            CallableKind::Bound(instance, function) => {
                (instance.clone(), function.clone(), Scope::root())
            }
            CallableKind::Closure(closure) => (
                closure.instance.clone(),
                closure.function.clone(),
                closure
                    .scope
                    .upgrade()
                    .map(|s| Scope::child(&s))
                    .unwrap_or_else(Scope::root),
            ),
            _ => return Err(EvalError::NotCallable("function")),
        };
        bind_params(&instance, &scope, &function, args)?;
        Ok(Self {
            instance,
            scope,
            body: function.body.clone(),
            pc: 0,
            branch: None,
            kind: FrameKind::Body,
        })
    }
}

fn bind_params(
    instance: &Instance,
    scope: &Rc<Scope>,
    function: &Function,
    args: Args,
) -> Result<(), EvalError> {
    let name = &function.name;
    let Args {
        positional,
        mut keyword,
    } = args;
    if positional.len() > function.params.len() {
        return Err(EvalError::Arguments(format!(
            "{name}() takes {} positional arguments but {} were given",
            function.params.len(),
            positional.len()
        )));
    }
    let mut positional = positional.into_iter();
    for param in &function.params {
        let by_name = keyword
            .iter()
            .position(|(k, _)| *k == param.name)
            .map(|i| keyword.remove(i).1);
        let value = match (positional.next(), by_name) {
            (Some(_), Some(_)) => {
                return Err(EvalError::Arguments(format!(
                    "{name}() got multiple values for argument '{}'",
                    param.name
                )))
            }
            (Some(value), None) | (None, Some(value)) => value,
            (None, None) => match &param.default {
                Some(default) => {
                    let env = FrameEnv { instance, scope };
                    Evaluator::new(&env).eval_expr(default)?
                }
                None => {
                    return Err(EvalError::Arguments(format!(
                        "{name}() missing required argument '{}'",
                        param.name
                    )))
                }
            },
        };
        scope.set(&param.name, value);
    }
    match keyword.first() {
        Some((unexpected, _)) => Err(EvalError::Arguments(format!(
            "{name}() got an unexpected keyword argument '{unexpected}'"
        ))),
        None => Ok(()),
    }
}

/// Name resolution inside a running frame: locals, then the instance.
struct FrameEnv<'a> {
    instance: &'a Instance,
    scope: &'a Rc<Scope>,
}

impl Env for FrameEnv<'_> {
    fn lookup(&self, name: &str) -> Option<Value> {
        self.scope.get(name).or_else(|| self.instance.lookup(name))
    }

    fn assign(&self, name: &str, value: Value) {
        self.scope.set(name, value);
    }

    fn call_function(&self, callee: &Callable, args: Args) -> Result<Value, EvalError> {
        let frame = Frame::function(callee, args)?;
        let out = Chunks::from_frame(frame).collect::<Result<String>>()?;
        Ok(Value::from(out))
    }
}

/// Render a value that appears in output position.
fn flat_string(value: &Value) -> Result<String, EvalError> {
    let mut leaves = Vec::new();
    value.flatten_into(&mut leaves);
    let mut out = String::new();
    for leaf in leaves {
        match leaf {
            Value::Instance(instance) => out.push_str(&render_embedded(&instance)?),
            other => out.push_str(&other.to_string()),
        }
    }
    Ok(out)
}

/// An instance used as a value renders its `__call__` in place.
fn render_embedded(instance: &Instance) -> Result<String> {
    match Frame::call(instance) {
        Some(frame) => Chunks::from_frame(frame).collect(),
        None => Ok(String::new()),
    }
}

fn attribute(name: &str, value: &str) -> String {
    format!(" {name}=\"{}\"", escape(value))
}

impl Chunks {
    pub(crate) fn empty() -> Self {
        Self {
            stack: Vec::new(),
            pending: VecDeque::new(),
        }
    }

    pub(crate) fn call(instance: &Instance) -> Self {
        let mut chunks = Self::empty();
        chunks.stack.extend(Frame::call(instance));
        chunks
    }

    fn from_frame(frame: Frame) -> Self {
        let mut chunks = Self::empty();
        chunks.stack.push(frame);
        chunks
    }

    fn branch(&self) -> Option<bool> {
        self.stack.last().and_then(|f| f.branch)
    }

    fn set_branch(&mut self, branch: Option<bool>) {
        if let Some(frame) = self.stack.last_mut() {
            frame.branch = branch;
        }
    }

    /// Advance by one instruction (or one loop iteration). Returns false once
    /// the stack is empty.
    fn step(&mut self) -> Result<bool> {
        let Some(frame) = self.stack.last_mut() else {
            return Ok(false);
        };
        if frame.pc >= frame.body.len() {
            if let FrameKind::Loop {
                targets,
                items,
                pos,
            } = &mut frame.kind
            {
                if let Some(item) = items.next() {
                    let env = FrameEnv {
                        instance: &frame.instance,
                        scope: &frame.scope,
                    };
                    Evaluator::new(&env)
                        .bind(targets, item)
                        .map_err(|e| e.at(&pos.file, pos.line))?;
                    frame.pc = 0;
                    frame.branch = None;
                    return Ok(true);
                }
            }
            self.stack.pop();
            return Ok(true);
        }
        let instance = frame.instance.clone();
        let scope = frame.scope.clone();
        let body = frame.body.clone();
        let instr = &body[frame.pc];
        frame.pc += 1;
        self.exec(&instance, &scope, instr)
            .map_err(|e| e.at(&instr.pos.file, instr.pos.line))?;
        Ok(true)
    }

    fn exec(&mut self, instance: &Instance, scope: &Rc<Scope>, instr: &Instr) -> Result<(), EvalError> {
        let env = FrameEnv { instance, scope };
        let eval = Evaluator::new(&env);
        let guarded = |guard: &Option<Expr>| -> Result<bool, EvalError> {
            match guard {
                Some(guard) => Ok(eval.eval_expr(guard)?.is_truthy()),
                None => Ok(false),
            }
        };
        match &instr.op {
            Op::Text { text, guard } => {
                if !text.is_empty() && !guarded(guard)? {
                    self.pending.push_back(text.to_string());
                }
            }
            Op::Emit(expr) => self.emit(&eval, expr, instance.template().autoescape())?,
            Op::Attr { name, value, guard } => {
                if guarded(guard)? {
                    return Ok(());
                }
                let part = |expr: &Expr, pos: &Pos| -> Result<Value, EvalError> {
                    eval.eval_expr(expr)
                        .map_err(|e| e.at(&pos.file, pos.line).into())
                };
                let rendered = match value.as_slice() {
                    [AttrPart::Expr(expr, pos)] => {
                        let value = part(expr, pos)?;
                        if value.is_none() {
                            return Ok(());
                        }
                        flat_string(&value)?
                    }
                    parts => {
                        let mut out = String::new();
                        for p in parts {
                            match p {
                                AttrPart::Text(text) => out.push_str(text),
                                AttrPart::Expr(expr, pos) => {
                                    out.push_str(&flat_string(&part(expr, pos)?)?)
                                }
                            }
                        }
                        out
                    }
                };
                self.pending.push_back(attribute(name, &rendered));
            }
            Op::Attrs { expr, guard } => {
                if guarded(guard)? {
                    return Ok(());
                }
                let pairs = match eval.eval_expr(expr)? {
                    Value::None => Vec::new(),
                    Value::Dict(map) => map.iter().map(|(k, v)| (k.clone(), v.clone())).collect(),
                    Value::List(items) => items
                        .iter()
                        .map(|item| match item.iter_items()?.as_slice() {
                            [k, v] => Ok((k.to_string(), v.clone())),
                            _ => Err(EvalError::Type("attribute pairs must have two items".into())),
                        })
                        .collect::<Result<Vec<_>, _>>()?,
                    other => {
                        return Err(EvalError::Type(format!(
                            "attributes must be a dict or a list of pairs, not '{}'",
                            other.type_name()
                        )))
                    }
                };
                for (name, value) in pairs {
                    if !value.is_none() {
                        self.pending.push_back(attribute(&name, &flat_string(&value)?));
                    }
                }
            }
            Op::For { targets, iter, body } => {
                let items = eval.eval_expr(iter)?.iter_items()?;
                let kind = FrameKind::Loop {
                    targets: targets.clone(),
                    items: items.into_iter(),
                    pos: instr.pos.clone(),
                };
                self.stack.push(Frame::nested((instance, scope), body, kind));
            }
            Op::If { test, body } => {
                let taken = eval.eval_expr(test)?.is_truthy();
                self.set_branch(Some(taken));
                if taken {
                    self.stack.push(Frame::nested((instance, scope), body, FrameKind::Body));
                }
            }
            Op::Else { body } => {
                let taken = self.branch() != Some(true);
                self.set_branch(None);
                if taken {
                    self.stack.push(Frame::nested((instance, scope), body, FrameKind::Body));
                }
            }
            Op::Switch { test, body } => {
                let guard = instance.push_switch(eval.eval_expr(test)?);
                let kind = FrameKind::Switch { _guard: guard };
                self.stack.push(Frame::nested((instance, scope), body, kind));
            }
            Op::Case { value, body } => {
                if self.branch() == Some(true) {
                    return Ok(());
                }
                if instance.case(&eval.eval_expr(value)?) {
                    self.set_branch(Some(true));
                    self.stack.push(Frame::nested((instance, scope), body, FrameKind::Body));
                }
            }
            Op::InnerDef(function) => {
                scope.set(&function.name, closure(instance, scope, function));
            }
            Op::Call { caller, target } => {
                let inner = Scope::child(scope);
                inner.set(CALLER, closure(instance, scope, caller));
                let env = FrameEnv {
                    instance,
                    scope: &inner,
                };
                self.emit(&Evaluator::new(&env), target, instance.template().autoescape())?;
            }
            Op::Import { href, alias } => {
                let template = instance.import_(href)?;
                let alias = alias
                    .clone()
                    .unwrap_or_else(|| Loader::default_alias_for(href));
                let imported = template.instantiate(instance.context().clone());
                instance.set_global(&alias, Value::Instance(imported));
            }
            Op::Include { href } => {
                let template = instance.import_(href)?;
                let included = template.instantiate(instance.context().clone());
                self.stack.extend(Frame::call(&included));
            }
            Op::Extend { href } => {
                let template = instance.import_(href)?;
                let parent = instance.extend(&template);
                self.stack.extend(Frame::call(&parent));
            }
            Op::Exec(stmts) => eval.exec(stmts)?,
        }
        Ok(())
    }

    /// Output an expression. A direct call of a template function runs
    /// lazily in its own frame; anything else is evaluated and flattened.
    fn emit(&mut self, eval: &Evaluator<'_>, expr: &Expr, escaped: bool) -> Result<(), EvalError> {
        let value = match expr {
            Expr::Call(callee, args) => {
                let callee = eval.eval_expr(callee)?;
                let args = eval.eval_args(args)?;
                match &callee {
                    Value::Callable(
                        callable @ Callable(CallableKind::Bound(..) | CallableKind::Closure(_)),
                    ) => {
                        self.stack.push(Frame::function(callable, args)?);
                        return Ok(());
                    }
                    _ => eval.call(&callee, args)?,
                }
            }
            expr => eval.eval_expr(expr)?,
        };
        let mut leaves = Vec::new();
        value.flatten_into(&mut leaves);
        for leaf in leaves {
            let chunk = match leaf {
                Value::Instance(embedded) => render_embedded(&embedded)?,
                other if escaped => escape(&other.to_string()).into_owned(),
                other => other.to_string(),
            };
            self.pending.push_back(chunk);
        }
        Ok(())
    }
}

fn closure(instance: &Instance, scope: &Rc<Scope>, function: &Rc<Function>) -> Value {
    Value::Callable(Callable(CallableKind::Closure(Rc::new(Closure {
        function: function.clone(),
        instance: instance.clone(),
        scope: Rc::downgrade(scope),
    }))))
}

impl Iterator for Chunks {
    type Item = Result<String>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(chunk) = self.pending.pop_front() {
                return Some(Ok(chunk));
            }
            match self.step() {
                Ok(true) => continue,
                Ok(false) => return None,
                Err(err) => {
                    self.stack.clear();
                    return Some(Err(err));
                }
            }
        }
    }
}

impl FusedIterator for Chunks {}
