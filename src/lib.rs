//! fastpt: a template compiler and runtime for line-oriented text templates
//! and XML/HTML markup templates.
//!
//! Both surface syntaxes compile to one intermediate representation
//! ([`ir::TemplateNode`]), which is lowered once per template type into a
//! [`codegen::Program`] of functions. Rendering instantiates a [`Template`]
//! with a [`Context`] and pulls output lazily from an [`Instance`] as a
//! sequence of string chunks, so abandoning iteration stops evaluation.
//!
//! Text syntax:
//! - `$name`, `$name.attr`, `${expr}` interpolate; `$$` is a literal `$`.
//! - `{% tag ... %}` on a line, or `%tag ...` at the start of a line.
//! - `for`, `if`/`else`, `switch`/`case`/`else`, `def`, `py`, `import`,
//!   `include`, closed by `end`.
//! - A backslash before a newline joins lines.
//!
//! XML syntax uses `py:` directive elements (`<py:for each="x in xs">`) or
//! their attribute shorthands (`<li py:for="x in xs">`), `py:block` and
//! `py:extends` for inheritance, and `<?py ...?>` for host code.
//!
//! Templates reference each other by name through a [`Loader`], which
//! compiles each name once and caches the result.

pub mod ast;
mod builtins;
pub mod codegen;
mod error;
mod eval;
pub mod ir;
pub mod lexer;
mod loader;
pub mod parser;
mod render;
mod template;
pub mod text;
mod tokenizer;
mod value;
pub mod xml;

pub use error::{Error, EvalError, Result};
pub use loader::{Fetched, FileSource, Loader, MemorySource, Mode, Source};
pub use render::Chunks;
pub use template::{Context, Instance, SwitchGuard, Template};
pub use value::{Callable, NativeFn, Value};
