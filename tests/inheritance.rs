use fastpt::{Context, Error, Loader, MemorySource, Mode, Template};

const BASE: &str = concat!(
    r#"<html><head><title><py:block name="title">Default</py:block></title></head>"#,
    r#"<body><py:block name="body">base body</py:block></body></html>"#,
);

fn loader(extra: &[(&str, &str)]) -> Loader {
    let mut source = MemorySource::new().with("base.xml", BASE);
    for (name, text) in extra {
        source = source.with(name, text);
    }
    Loader::new(source)
}

fn render(loader: &Loader, name: &str) -> String {
    loader
        .resolve(name)
        .unwrap()
        .render(Context::new().with("user", "Ann"))
        .unwrap()
}

// ── Block override ──

#[test]
fn parent_renders_its_own_blocks() {
    let loader = loader(&[]);
    assert_eq!(
        render(&loader, "base.xml"),
        "<html><head><title>Default</title></head><body>base body</body></html>"
    );
}

#[test]
fn child_overrides_one_block_and_keeps_the_other() {
    let loader = loader(&[(
        "child.xml",
        r#"<html py:extends="base.xml"><py:block name="title">Hi $user</py:block>ignored</html>"#,
    )]);
    assert_eq!(
        render(&loader, "child.xml"),
        "<html><head><title>Hi Ann</title></head><body>base body</body></html>"
    );
}

#[test]
fn override_can_call_the_parent_block() {
    let loader = loader(&[(
        "child.xml",
        r#"<html py:extends="base.xml"><py:block name="title">${parent_block()} and more</py:block></html>"#,
    )]);
    assert_eq!(
        render(&loader, "child.xml"),
        "<html><head><title>Default and more</title></head><body>base body</body></html>"
    );
}

#[test]
fn extends_as_an_element() {
    let loader = loader(&[(
        "child.xml",
        r#"<py:extends href="base.xml"/><py:block name="body">new body</py:block>"#,
    )]);
    assert_eq!(
        render(&loader, "child.xml"),
        "<html><head><title>Default</title></head><body>new body</body></html>"
    );
}

// ── Chains ──

#[test]
fn three_level_chain_resolves_to_the_nearest_override() {
    let loader = Loader::new(
        MemorySource::new()
            .with(
                "grand.xml",
                r#"<doc><py:block name="a">grand-a</py:block>|<py:block name="b">grand-b</py:block>|<py:block name="c">grand-c</py:block></doc>"#,
            )
            .with(
                "mid.xml",
                r#"<doc py:extends="grand.xml"><py:block name="a">mid-a</py:block><py:block name="b">mid-b</py:block></doc>"#,
            )
            .with(
                "leaf.xml",
                r#"<doc py:extends="mid.xml"><py:block name="a">leaf-a</py:block></doc>"#,
            ),
    );
    assert_eq!(render(&loader, "leaf.xml"), "<doc>leaf-a|mid-b|grand-c</doc>");
    assert_eq!(render(&loader, "mid.xml"), "<doc>mid-a|mid-b|grand-c</doc>");
}

#[test]
fn parent_defs_see_the_childs_overrides() {
    let loader = Loader::new(
        MemorySource::new()
            .with(
                "base.txt",
                "%def greeting()\nhello\\\n%end\n%def page()\n[${greeting()}|${self.greeting()}]\\\n%end\n${page()}",
            )
            .with(
                "child.xml",
                r#"<x py:extends="base.txt"><py:def function="greeting()">howdy</py:def></x>"#,
            ),
    );
    assert_eq!(render(&loader, "base.txt"), "[hello|hello]");
    assert_eq!(render(&loader, "child.xml"), "[howdy|howdy]");
}

#[test]
fn extended_parent_keeps_the_child_alive() {
    let child = Template::text("child.txt", "%def title()\nchild\n%end\n").unwrap();
    let parent = Template::text("parent.txt", "%def title()\nbase\n%end\n${title()}").unwrap();
    let p = child.instantiate(Context::new()).extend(&parent);
    assert!(p.child().is_some());
    assert_eq!(p.leaf().template().name(), "child.txt");
    assert_eq!(p.render().unwrap(), "child\n");
}

#[test]
fn overrides_can_use_the_childs_imports() {
    let loader = loader(&[
        ("lib.xml", r#"<lib><py:def function="hi()">hi from lib</py:def></lib>"#),
        (
            "child.xml",
            r#"<html py:extends="base.xml"><py:import href="lib.xml" alias="lib"/><py:block name="body">${lib.hi()}</py:block></html>"#,
        ),
    ]);
    assert_eq!(
        render(&loader, "child.xml"),
        "<html><head><title>Default</title></head><body>hi from lib</body></html>"
    );
}

#[test]
fn extend_links_the_instances() {
    let child = Template::text("child.txt", "").unwrap();
    let parent = Template::text("parent.txt", "").unwrap();
    let instance = child.instantiate(Context::new());
    let p = instance.extend(&parent);
    assert!(p.leaf().ptr_eq(&instance));
    assert!(p.child().is_some_and(|c| c.ptr_eq(&instance)));
    assert!(instance.parent().is_some_and(|pp| pp.ptr_eq(&p)));
    assert!(p.parent().is_none());
    drop(p);
    assert!(instance.parent().is_none());
}

// ── Failures ──

#[test]
fn extending_without_a_loader_fails_at_render() {
    let t = Template::xml("child.xml", r#"<x py:extends="base.xml"/>"#, Mode::Xml).unwrap();
    assert!(matches!(
        t.render(Context::new()),
        Err(Error::Runtime { .. }) | Err(Error::NoLoader { .. })
    ));
}

#[test]
fn unknown_parent_is_reported() {
    let loader = loader(&[("orphan.xml", r#"<x py:extends="missing.xml"/>"#)]);
    let err = loader
        .resolve("orphan.xml")
        .unwrap()
        .render(Context::new())
        .unwrap_err();
    assert!(
        matches!(err, Error::UnknownTemplate { ref name, .. } if name == "missing.xml"),
        "{err:?}"
    );
}
