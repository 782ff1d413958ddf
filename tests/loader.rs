use fastpt::{Context, Error, FileSource, Loader, MemorySource, Mode, Template};
use std::fs;
use std::time::{Duration, SystemTime};

// ── Memoization ──

#[test]
fn resolve_returns_one_template_per_name() {
    let loader = Loader::new(MemorySource::new().with("a.txt", "A").with("b.txt", "B"));
    let a1 = loader.resolve("a.txt").unwrap();
    let a2 = loader.resolve("a.txt").unwrap();
    let b = loader.resolve("b.txt").unwrap();
    assert!(a1.ptr_eq(&a2));
    assert!(!a1.ptr_eq(&b));
    assert_eq!(a1.name(), "a.txt");
}

#[test]
fn templates_with_syntax_errors_are_never_cached() {
    let loader = Loader::new(
        MemorySource::new()
            .with("lex.txt", "price: $5")
            .with("parse.txt", "{% case 1 %}")
            .with("markup.xml", "<p>"),
    );
    for name in ["lex.txt", "parse.txt", "markup.xml"] {
        assert!(loader.resolve(name).is_err(), "{name} should not compile");
        assert!(!loader.is_cached(name), "{name} was cached");
    }
}

#[test]
fn inserted_templates_can_be_imported() {
    let loader = Loader::new(MemorySource::new().with("page.txt", "%import lib\n${lib.hi()}"));
    let lib = Template::text("lib", "%def hi()\nhi!\\\n%end\n").unwrap();
    loader.insert("lib", lib.clone());
    assert!(lib.loader().is_some());
    let page = loader.resolve("page.txt").unwrap();
    assert_eq!(page.render(Context::new()).unwrap(), "hi!");
}

#[test]
fn memory_source_modes() {
    let loader = Loader::new(
        MemorySource::new()
            .with("p.html", "<p><br/></p>")
            .with_mode("raw", "<p><br/></p>", Mode::Xml),
    );
    assert_eq!(loader.resolve("p.html").unwrap().mode(), Mode::Html);
    let html = loader.resolve("p.html").unwrap().render(Context::new()).unwrap();
    assert_eq!(html, "<p><br></p>");
    let xml = loader.resolve("raw").unwrap().render(Context::new()).unwrap();
    assert_eq!(xml, "<p><br/></p>");
}

// ── Files ──

#[test]
fn file_source_reads_relative_to_its_base() {
    let dir = tempfile::tempdir().unwrap();
    fs::create_dir(dir.path().join("parts")).unwrap();
    fs::write(dir.path().join("parts/name.txt"), "[$who]").unwrap();
    fs::write(dir.path().join("main.txt"), "%include parts/name.txt\n!").unwrap();

    let loader = Loader::new(FileSource::new(dir.path()));
    let main = loader.resolve("main.txt").unwrap();
    assert_eq!(main.render(Context::new().with("who", "Ann")).unwrap(), "[Ann]!");
}

#[test]
fn file_source_reloads_changed_files() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("a.txt");
    fs::write(&path, "one").unwrap();

    let loader = Loader::new(FileSource::new(dir.path()));
    let first = loader.resolve("a.txt").unwrap();
    assert_eq!(first.render(Context::new()).unwrap(), "one");
    assert!(loader.resolve("a.txt").unwrap().ptr_eq(&first));

    fs::write(&path, "two").unwrap();
    let file = fs::File::options().write(true).open(&path).unwrap();
    file.set_modified(SystemTime::now() + Duration::from_secs(60)).unwrap();
    drop(file);

    let second = loader.resolve("a.txt").unwrap();
    assert!(!second.ptr_eq(&first));
    assert_eq!(second.render(Context::new()).unwrap(), "two");
}

#[test]
fn file_source_without_reload_keeps_the_first_compile() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("a.txt");
    fs::write(&path, "one").unwrap();

    let loader = Loader::new(FileSource::new(dir.path()).reload(false));
    let first = loader.resolve("a.txt").unwrap();
    fs::write(&path, "two").unwrap();
    let again = loader.resolve("a.txt").unwrap();
    assert!(again.ptr_eq(&first));
    assert_eq!(again.render(Context::new()).unwrap(), "one");
}

#[test]
fn file_source_errors() {
    let dir = tempfile::tempdir().unwrap();
    fs::write(dir.path().join("notes.md"), "# notes").unwrap();
    let loader = Loader::new(FileSource::new(dir.path()));

    assert!(matches!(
        loader.resolve("missing.txt"),
        Err(Error::UnknownTemplate { .. })
    ));
    assert!(matches!(
        loader.resolve("notes.md"),
        Err(Error::UnknownTemplate { .. })
    ));

    let forced = Loader::new(FileSource::new(dir.path()).force_mode(Mode::Text));
    let notes = forced.resolve("notes.md").unwrap();
    assert_eq!(notes.render(Context::new()).unwrap(), "# notes");
}

#[test]
fn file_source_can_autoescape_text_templates() {
    let dir = tempfile::tempdir().unwrap();
    fs::write(dir.path().join("a.txt"), "<i>${v}</i>").unwrap();
    fs::write(dir.path().join("b.xml"), "<i>${v}</i>").unwrap();
    let ctx = || Context::new().with("v", "<b>&</b>");

    let plain = Loader::new(FileSource::new(dir.path()));
    let a = plain.resolve("a.txt").unwrap();
    assert!(!a.autoescape());
    assert_eq!(a.render(ctx()).unwrap(), "<i><b>&</b></i>");

    let escaping = Loader::new(FileSource::new(dir.path()).autoescape_text(true));
    let a = escaping.resolve("a.txt").unwrap();
    assert!(a.autoescape());
    assert_eq!(a.render(ctx()).unwrap(), "<i>&lt;b&gt;&amp;&lt;/b&gt;</i>");
    let b = escaping.resolve("b.xml").unwrap();
    assert!(!b.autoescape());
    assert_eq!(b.render(ctx()).unwrap(), "<i><b>&</b></i>");
}
