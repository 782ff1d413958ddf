//! Template loading.
//!
//! A [`Loader`] resolves template names to compiled [`Template`]s and caches
//! them by name, so every reference to a name shares one compiled template.
//! Where the source text comes from is up to its [`Source`].

use crate::error::{Error, Result};
use crate::template::Template;
use log::{debug, trace};
use std::cell::RefCell;
use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::rc::Rc;
use std::time::SystemTime;

/// Surface syntax of a template source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// Line-oriented text syntax.
    Text,
    /// XML markup, empty elements serialized as `<p/>`.
    Xml,
    /// XML markup serialized as HTML (`<br>`, `<p></p>`).
    Html,
}

impl Mode {
    pub fn from_extension(ext: &str) -> Option<Mode> {
        match ext {
            "txt" => Some(Mode::Text),
            "xml" => Some(Mode::Xml),
            "html" | "html5" => Some(Mode::Html),
            _ => None,
        }
    }

    /// Mode for a template name, from its file extension.
    pub fn for_name(name: &str) -> Option<Mode> {
        Path::new(name)
            .extension()
            .and_then(|ext| ext.to_str())
            .and_then(Mode::from_extension)
    }
}

/// Source text fetched for one template name.
#[derive(Debug, Clone)]
pub struct Fetched {
    /// Used in diagnostics.
    pub filename: String,
    pub source: String,
    pub mode: Mode,
    /// XML-escape expression output of a text template.
    pub autoescape: bool,
}

/// Where template sources come from.
pub trait Source {
    fn fetch(&self, name: &str) -> Result<Fetched>;

    /// Whether a cached template for `name` should be recompiled.
    fn is_stale(&self, _name: &str) -> bool {
        false
    }
}

/// Resolves names to compiled templates, memoized by name.
#[derive(Clone)]
pub struct Loader(Rc<LoaderInner>);

pub(crate) struct LoaderInner {
    source: Box<dyn Source>,
    cache: RefCell<HashMap<String, Template>>,
}

impl Loader {
    pub fn new(source: impl Source + 'static) -> Self {
        Self(Rc::new(LoaderInner {
            source: Box::new(source),
            cache: RefCell::default(),
        }))
    }

    pub(crate) fn from_inner(inner: Rc<LoaderInner>) -> Self {
        Self(inner)
    }

    /// The compiled template for `name`. Compilation failures are returned
    /// and never cached.
    pub fn resolve(&self, name: &str) -> Result<Template> {
        let cached = self.0.cache.borrow().get(name).cloned();
        if let Some(template) = cached {
            if !self.0.source.is_stale(name) {
                trace!("loader cache hit for {name}");
                return Ok(template);
            }
            debug!("{name} changed, recompiling");
            self.invalidate(name);
        }
        debug!("loader cache miss for {name}");
        let fetched = self.0.source.fetch(name)?;
        let template = match fetched.mode {
            Mode::Text if fetched.autoescape => {
                Template::text_escaped(&fetched.filename, &fetched.source)?
            }
            mode => Template::compile(&fetched.filename, &fetched.source, mode)?,
        };
        self.insert(name, template.clone());
        Ok(template)
    }

    /// Register an already compiled template under `name`.
    pub fn insert(&self, name: &str, template: Template) {
        template.set_loader(&self.0);
        self.0.cache.borrow_mut().insert(name.to_string(), template);
    }

    /// Forget the cached template for `name`; returns whether one was cached.
    pub fn invalidate(&self, name: &str) -> bool {
        let removed = self.0.cache.borrow_mut().remove(name).is_some();
        if removed {
            debug!("invalidated {name}");
        }
        removed
    }

    pub fn is_cached(&self, name: &str) -> bool {
        self.0.cache.borrow().contains_key(name)
    }

    /// The name an `import` binds when no alias is given: the file stem.
    pub fn default_alias_for(name: &str) -> String {
        let path = Path::new(name);
        path.file_stem()
            .and_then(|stem| stem.to_str())
            .unwrap_or(name)
            .to_string()
    }
}

/// In-memory sources keyed by name; the syntax follows the name's extension
/// unless given explicitly.
#[derive(Debug, Default)]
pub struct MemorySource {
    sources: HashMap<String, (String, Mode)>,
}

impl MemorySource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(self, name: &str, source: &str) -> Self {
        let mode = Mode::for_name(name).unwrap_or(Mode::Text);
        self.with_mode(name, source, mode)
    }

    pub fn with_mode(mut self, name: &str, source: &str, mode: Mode) -> Self {
        self.sources
            .insert(name.to_string(), (source.to_string(), mode));
        self
    }
}

impl Source for MemorySource {
    fn fetch(&self, name: &str) -> Result<Fetched> {
        let (source, mode) = self.sources.get(name).ok_or_else(|| Error::UnknownTemplate {
            name: name.to_string(),
            reason: "no such template".to_string(),
        })?;
        Ok(Fetched {
            filename: name.to_string(),
            source: source.clone(),
            mode: *mode,
            autoescape: false,
        })
    }
}

/// Sources read from files under a base directory.
#[derive(Debug)]
pub struct FileSource {
    base: PathBuf,
    reload: bool,
    force_mode: Option<Mode>,
    autoescape_text: bool,
    mtimes: RefCell<HashMap<String, SystemTime>>,
}

impl FileSource {
    pub fn new(base: impl Into<PathBuf>) -> Self {
        Self {
            base: base.into(),
            reload: true,
            force_mode: None,
            autoescape_text: false,
            mtimes: RefCell::default(),
        }
    }

    /// Recompile templates whose file modification time changed.
    pub fn reload(mut self, reload: bool) -> Self {
        self.reload = reload;
        self
    }

    /// Use one syntax for every file regardless of extension.
    pub fn force_mode(mut self, mode: Mode) -> Self {
        self.force_mode = Some(mode);
        self
    }

    /// XML-escape the expression output of text-syntax files.
    pub fn autoescape_text(mut self, autoescape: bool) -> Self {
        self.autoescape_text = autoescape;
        self
    }

    fn path(&self, name: &str) -> PathBuf {
        self.base.join(name)
    }
}

fn modified(path: &Path) -> Option<SystemTime> {
    path.metadata().and_then(|m| m.modified()).ok()
}

impl Source for FileSource {
    fn fetch(&self, name: &str) -> Result<Fetched> {
        let path = self.path(name);
        let mode = self
            .force_mode
            .or_else(|| Mode::for_name(name))
            .ok_or_else(|| Error::UnknownTemplate {
                name: name.to_string(),
                reason: "no syntax is registered for its extension".to_string(),
            })?;
        let source = std::fs::read_to_string(&path).map_err(|err| match err.kind() {
            ErrorKind::NotFound => Error::UnknownTemplate {
                name: name.to_string(),
                reason: format!("{} does not exist", path.display()),
            },
            _ => Error::Io(err),
        })?;
        if self.reload {
            if let Some(mtime) = modified(&path) {
                self.mtimes.borrow_mut().insert(name.to_string(), mtime);
            }
        }
        Ok(Fetched {
            filename: path.display().to_string(),
            source,
            mode,
            autoescape: self.autoescape_text,
        })
    }

    fn is_stale(&self, name: &str) -> bool {
        if !self.reload {
            return false;
        }
        let recorded = self.mtimes.borrow().get(name).copied();
        recorded != modified(&self.path(name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::template::Context;

    #[test]
    fn modes_follow_extensions() {
        assert_eq!(Mode::for_name("a/b.txt"), Some(Mode::Text));
        assert_eq!(Mode::for_name("page.xml"), Some(Mode::Xml));
        assert_eq!(Mode::for_name("page.html5"), Some(Mode::Html));
        assert_eq!(Mode::for_name("README"), None);
    }

    #[test]
    fn default_alias_is_the_file_stem() {
        assert_eq!(Loader::default_alias_for("lib/helpers.txt"), "helpers");
        assert_eq!(Loader::default_alias_for("plain"), "plain");
    }

    #[test]
    fn resolve_is_memoized_by_name() {
        let loader = Loader::new(MemorySource::new().with("a.txt", "A"));
        let first = loader.resolve("a.txt").unwrap();
        let second = loader.resolve("a.txt").unwrap();
        assert!(first.ptr_eq(&second));
        assert!(first.loader().is_some());
        assert_eq!(first.render(Context::new()).unwrap(), "A");
    }

    #[test]
    fn failures_are_not_cached() {
        let loader = Loader::new(MemorySource::new().with("bad.txt", "cost: $5"));
        assert!(matches!(loader.resolve("bad.txt"), Err(Error::Lex { .. })));
        assert!(!loader.is_cached("bad.txt"));
        assert!(matches!(
            loader.resolve("missing.txt"),
            Err(Error::UnknownTemplate { .. })
        ));
    }

    #[test]
    fn invalidate_forces_recompilation() {
        let loader = Loader::new(MemorySource::new().with("a.txt", "A"));
        let first = loader.resolve("a.txt").unwrap();
        assert!(loader.invalidate("a.txt"));
        assert!(!loader.invalidate("a.txt"));
        let second = loader.resolve("a.txt").unwrap();
        assert!(!first.ptr_eq(&second));
    }
}
