//! Compiled templates and their runtime instances.
//!
//! A [`Template`] is a factory: [`Template::instantiate`] binds it to a
//! [`Context`] and yields an [`Instance`], which renders once. Instances hold
//! the inheritance links (`parent`, `child`, the leaf-most `self`), the
//! override table installed by `extend`, imported sub-templates and the
//! switch stack.

use crate::codegen::{self, Function, Program};
use crate::error::{Error, EvalError, Result};
use crate::eval::{Args, Env, Evaluator};
use crate::ir::TemplateNode;
use crate::loader::{Loader, LoaderInner, Mode};
use crate::render::Chunks;
use crate::value::{Callable, CallableKind, Value};
use crate::{text, xml};
use indexmap::IndexMap;
use log::{debug, trace};
use std::cell::{Cell, RefCell};
use std::fmt;
use std::rc::{Rc, Weak};

/// Names supplied by the application for one render.
#[derive(Clone, Default)]
pub struct Context(Rc<IndexMap<String, Value>>);

impl Context {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.set(name, value);
        self
    }

    pub fn set(&mut self, name: impl Into<String>, value: impl Into<Value>) {
        Rc::make_mut(&mut self.0).insert(name.into(), value.into());
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.0.get(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v))
    }
}

impl From<IndexMap<String, Value>> for Context {
    fn from(map: IndexMap<String, Value>) -> Self {
        Self(Rc::new(map))
    }
}

impl<K: Into<String>, V: Into<Value>> FromIterator<(K, V)> for Context {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self(Rc::new(
            iter.into_iter().map(|(k, v)| (k.into(), v.into())).collect(),
        ))
    }
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map().entries(self.0.iter()).finish()
    }
}

#[derive(Clone)]
pub struct Template(Rc<TemplateInner>);

struct TemplateInner {
    name: String,
    mode: Mode,
    program: Program,
    autoescape: bool,
    /// Names bound by module-level host code.
    defaults: IndexMap<String, Value>,
    loader: RefCell<Weak<LoaderInner>>,
}

/// Environment for module-level statements: only earlier module names and
/// builtins are visible.
struct ModuleEnv(RefCell<IndexMap<String, Value>>);

impl Env for ModuleEnv {
    fn lookup(&self, name: &str) -> Option<Value> {
        self.0.borrow().get(name).cloned()
    }

    fn assign(&self, name: &str, value: Value) {
        self.0.borrow_mut().insert(name.to_string(), value);
    }

    fn call_function(&self, callee: &Callable, _: Args) -> Result<Value, EvalError> {
        Err(EvalError::Type(format!(
            "template function `{}` cannot be called at module level",
            callee.name()
        )))
    }
}

impl Template {
    /// Compile source in the given syntax.
    pub fn compile(name: &str, source: &str, mode: Mode) -> Result<Self> {
        match mode {
            Mode::Text => Self::text(name, source),
            Mode::Xml | Mode::Html => Self::xml(name, source, mode),
        }
    }

    /// Compile a text-syntax template.
    pub fn text(name: &str, source: &str) -> Result<Self> {
        Self::from_ir(name, Mode::Text, &text::parse(name, source)?)
    }

    /// Compile an XML (or HTML-serialized) template.
    pub fn xml(name: &str, source: &str, mode: Mode) -> Result<Self> {
        Self::from_ir(name, mode, &xml::parse(name, source, mode)?)
    }

    /// Compile a text-syntax template whose expression output is
    /// XML-escaped.
    pub fn text_escaped(name: &str, source: &str) -> Result<Self> {
        Self::build(name, Mode::Text, &text::parse(name, source)?, true)
    }

    /// Generate code for an IR tree and run its module-level statements.
    pub fn from_ir(name: &str, mode: Mode, ir: &TemplateNode) -> Result<Self> {
        Self::build(name, mode, ir, false)
    }

    fn build(name: &str, mode: Mode, ir: &TemplateNode, autoescape: bool) -> Result<Self> {
        let program = codegen::generate(ir)?;
        let env = ModuleEnv(RefCell::default());
        for (pos, stmts) in &program.module {
            Evaluator::new(&env)
                .exec(stmts)
                .map_err(|e| e.at(&pos.file, pos.line))?;
        }
        debug!(
            "compiled template {name} ({mode:?}, {} functions)",
            program.functions.len()
        );
        Ok(Self(Rc::new(TemplateInner {
            name: name.to_string(),
            mode,
            program,
            autoescape,
            defaults: env.0.into_inner(),
            loader: RefCell::new(Weak::new()),
        })))
    }

    pub fn name(&self) -> &str {
        &self.0.name
    }

    pub fn mode(&self) -> Mode {
        self.0.mode
    }

    /// Whether expression output is XML-escaped.
    pub fn autoescape(&self) -> bool {
        self.0.autoescape
    }

    /// Names of the render functions, starting with `__call__`.
    pub fn function_names(&self) -> impl Iterator<Item = &str> {
        self.0.program.function_names()
    }

    /// A name bound by module-level host code.
    pub fn default(&self, name: &str) -> Option<&Value> {
        self.0.defaults.get(name)
    }

    pub fn loader(&self) -> Option<Loader> {
        self.0.loader.borrow().upgrade().map(Loader::from_inner)
    }

    pub(crate) fn set_loader(&self, loader: &Rc<LoaderInner>) {
        *self.0.loader.borrow_mut() = Rc::downgrade(loader);
    }

    pub(crate) fn function(&self, name: &str) -> Option<&Rc<Function>> {
        self.0.program.function(name)
    }

    pub fn ptr_eq(&self, other: &Template) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }

    pub fn instantiate(&self, context: Context) -> Instance {
        Instance::new(self.clone(), context)
    }

    /// Instantiate and render in one step.
    pub fn render(&self, context: Context) -> Result<String> {
        self.instantiate(context).render()
    }
}

impl fmt::Debug for Template {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Template")
            .field("name", &self.0.name)
            .field("mode", &self.0.mode)
            .finish_non_exhaustive()
    }
}

/// One render of a template.
#[derive(Clone)]
pub struct Instance(Rc<InstanceInner>);

pub(crate) struct InstanceInner {
    template: Template,
    context: Context,
    /// The leaf-most instance of the inheritance chain, when that is not
    /// this instance.
    leaf: RefCell<Option<Instance>>,
    /// Parents are owned by whoever renders them, children by their parent.
    parent: RefCell<Weak<InstanceInner>>,
    child: RefCell<Option<Instance>>,
    /// Imported sub-template instances.
    globals: RefCell<IndexMap<String, Value>>,
    /// Functions installed by descendants, consulted before our own.
    overrides: RefCell<IndexMap<String, (Instance, Rc<Function>)>>,
    switch_stack: RefCell<Vec<Value>>,
    consumed: Cell<bool>,
}

/// Pops the switch value it pushed when dropped.
pub struct SwitchGuard {
    instance: Instance,
}

impl Drop for SwitchGuard {
    fn drop(&mut self) {
        let popped = self.instance.0.switch_stack.borrow_mut().pop();
        trace!("pop_switch {popped:?}");
    }
}

impl Instance {
    fn new(template: Template, context: Context) -> Self {
        Self(Rc::new(InstanceInner {
            template,
            context,
            leaf: RefCell::new(None),
            parent: RefCell::new(Weak::new()),
            child: RefCell::new(None),
            globals: RefCell::default(),
            overrides: RefCell::default(),
            switch_stack: RefCell::default(),
            consumed: Cell::new(false),
        }))
    }

    fn bound(&self, function: &Rc<Function>) -> Value {
        Value::Callable(Callable(CallableKind::Bound(self.clone(), function.clone())))
    }

    pub fn template(&self) -> &Template {
        &self.0.template
    }

    pub fn context(&self) -> &Context {
        &self.0.context
    }

    /// The instance this one extends, while it is alive.
    pub fn parent(&self) -> Option<Instance> {
        self.0.parent.borrow().upgrade().map(Instance)
    }

    pub fn child(&self) -> Option<Instance> {
        self.0.child.borrow().clone()
    }

    pub fn ptr_eq(&self, other: &Instance) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }

    /// The leaf-most instance of the inheritance chain (`self` in templates).
    pub fn leaf(&self) -> Instance {
        self.0.leaf.borrow().clone().unwrap_or_else(|| self.clone())
    }

    /// Resolve a free name used by this instance's code. Function locals are
    /// consulted before this.
    pub(crate) fn lookup(&self, name: &str) -> Option<Value> {
        if let Some((owner, function)) = self.0.overrides.borrow().get(name) {
            return Some(owner.bound(function));
        }
        if let Some(function) = self.0.template.function(name) {
            return Some(self.bound(function));
        }
        let special = match name {
            "self" => Some(Value::Instance(self.leaf())),
            "local" => Some(Value::Instance(self.clone())),
            "parent" => self.parent().map(Value::Instance),
            "child" => self.child().map(Value::Instance),
            _ => None,
        };
        special
            .or_else(|| self.0.globals.borrow().get(name).cloned())
            .or_else(|| self.0.context.get(name).cloned())
            .or_else(|| self.0.template.default(name).cloned())
    }

    /// `instance.name`: own functions, then inherited ones, then imports and
    /// module-level names.
    pub(crate) fn attribute(&self, name: &str) -> Option<Value> {
        let mut current = Some(self.clone());
        while let Some(instance) = current {
            if let Some(function) = instance.0.template.function(name) {
                return Some(instance.bound(function));
            }
            current = instance.parent();
        }
        self.0
            .globals
            .borrow()
            .get(name)
            .cloned()
            .or_else(|| self.0.template.default(name).cloned())
    }

    pub(crate) fn set_global(&self, name: &str, value: Value) {
        self.0.globals.borrow_mut().insert(name.to_string(), value);
    }

    /// Resolve another template through this template's loader.
    pub fn import_(&self, name: &str) -> Result<Template> {
        let loader = self.0.template.loader().ok_or_else(|| Error::NoLoader {
            name: name.to_string(),
        })?;
        trace!("{} imports {name}", self.0.template.name());
        loader.resolve(name)
    }

    /// Make this instance the child of a fresh instance of `parent`, sharing
    /// the context. Every function of this instance except `__call__`
    /// overrides the parent's function of the same name; overrides this
    /// instance received from its own descendants are passed up unchanged.
    pub fn extend(&self, parent: &Template) -> Instance {
        trace!("{} extends {}", self.0.template.name(), parent.name());
        let p = parent.instantiate(self.0.context.clone());
        {
            let own = self.0.overrides.borrow();
            let mut installed = p.0.overrides.borrow_mut();
            for (name, function) in self.0.template.0.program.functions.iter() {
                if name == "__call__" {
                    continue;
                }
                let entry = own
                    .get(name)
                    .cloned()
                    .unwrap_or_else(|| (self.clone(), function.clone()));
                installed.insert(name.clone(), entry);
            }
            for (name, entry) in own.iter() {
                installed.entry(name.clone()).or_insert_with(|| entry.clone());
            }
        }
        *p.0.child.borrow_mut() = Some(self.clone());
        *p.0.leaf.borrow_mut() = Some(self.leaf());
        *self.0.parent.borrow_mut() = Rc::downgrade(&p.0);
        p
    }

    /// Push a switch value; it stays on top until the guard is dropped.
    pub fn push_switch(&self, value: Value) -> SwitchGuard {
        trace!("push_switch {value:?}");
        self.0.switch_stack.borrow_mut().push(value);
        SwitchGuard {
            instance: self.clone(),
        }
    }

    /// Does `value` equal the innermost active switch value?
    pub fn case(&self, value: &Value) -> bool {
        self.0.switch_stack.borrow().last() == Some(value)
    }

    /// The lazy chunk sequence of `__call__`. An instance renders once;
    /// later calls yield nothing.
    pub fn chunks(&self) -> Chunks {
        if self.0.consumed.replace(true) {
            return Chunks::empty();
        }
        Chunks::call(self)
    }

    /// Render everything into one string.
    pub fn render(&self) -> Result<String> {
        self.chunks().collect()
    }
}

impl fmt::Debug for Instance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Instance")
            .field("template", &self.0.template.name())
            .finish_non_exhaustive()
    }
}

impl IntoIterator for Instance {
    type Item = Result<String>;
    type IntoIter = Chunks;

    fn into_iter(self) -> Chunks {
        self.chunks()
    }
}

impl IntoIterator for &Instance {
    type Item = Result<String>;
    type IntoIter = Chunks;

    fn into_iter(self) -> Chunks {
        self.chunks()
    }
}
