use fastpt::{Context, Error, Loader, MemorySource, Mode, Template, Value};
use indoc::indoc;

fn render(source: &str, context: Context) -> String {
    Template::xml("t.xml", source, Mode::Xml)
        .unwrap()
        .render(context)
        .unwrap()
}

fn render_html(source: &str, context: Context) -> String {
    Template::xml("t.html", source, Mode::Html)
        .unwrap()
        .render(context)
        .unwrap()
}

// ── Directives ──

#[test]
fn for_attribute_repeats_the_element() {
    let out = render(
        r#"<ul><li py:for="x in items">$x</li></ul>"#,
        Context::new().with("items", vec![1, 2]),
    );
    assert_eq!(out, "<ul><li>1</li><li>2</li></ul>");
}

#[test]
fn if_and_else_elements() {
    let source = r#"<p><py:if test="ok">yes</py:if><py:else>no</py:else></p>"#;
    assert_eq!(render(source, Context::new().with("ok", true)), "<p>yes</p>");
    assert_eq!(render(source, Context::new().with("ok", false)), "<p>no</p>");
}

#[test]
fn switch_ignores_whitespace_between_cases() {
    let source = indoc! {r#"
        <py:switch test="n">
          <py:when value="1">one</py:when>
          <py:case value="2">two</py:case>
          <py:otherwise>many</py:otherwise>
        </py:switch>"#};
    assert_eq!(render(source, Context::new().with("n", 1)), "one");
    assert_eq!(render(source, Context::new().with("n", 2)), "two");
    assert_eq!(render(source, Context::new().with("n", 7)), "many");
}

#[test]
fn content_replace_and_strip() {
    let ctx = Context::new().with("msg", "hello").with("name", "Ann");
    assert_eq!(render(r#"<p py:content="msg">old</p>"#, ctx.clone()), "<p>hello</p>");
    assert_eq!(
        render(r#"<b><span py:replace="name">placeholder</span></b>"#, ctx.clone()),
        "<b>Ann</b>"
    );
    assert_eq!(render(r#"<div py:strip="">inner</div>"#, ctx.clone()), "inner");
    assert_eq!(
        render(r#"<div py:strip="len(msg) > 9" id="x">inner</div>"#, ctx),
        r#"<div id="x">inner</div>"#
    );
}

#[test]
fn def_and_call_with_a_caller() {
    let source = concat!(
        r#"<div><py:def function="wrap(inner)">[${inner('x')}]</py:def>"#,
        r#"<py:call args="v" function="wrap(%caller)">got $v</py:call></div>"#,
    );
    assert_eq!(render(source, Context::new()), "<div>[got x]</div>");
}

#[test]
fn nested_defs_are_local() {
    let source = concat!(
        r#"<r><py:def function="outer(word)">"#,
        r#"<py:def function="twice()">$word$word</py:def>${twice()}"#,
        r#"</py:def>${outer('ab')}</r>"#,
    );
    assert_eq!(render(source, Context::new()), "<r>abab</r>");
}

// ── Attributes ──

#[test]
fn attributes_are_escaped_and_none_is_omitted() {
    let ctx = Context::new()
        .with("url", "/x?a=1&b=2")
        .with("title", Value::None)
        .with("extra", Value::dict([("class", Value::from("big")), ("id", Value::None)]));
    let out = render(
        r#"<a href="$url" title="${title}" py:attrs="extra">x</a>"#,
        ctx,
    );
    assert_eq!(out, r#"<a href="/x?a=1&amp;b=2" class="big">x</a>"#);
}

#[test]
fn attrs_accept_a_list_of_pairs() {
    let pairs = Value::list([Value::list(["data-n", "1"]), Value::list(["lang", "en"])]);
    let out = render(r#"<p py:attrs="pairs"/>"#, Context::new().with("pairs", pairs));
    assert_eq!(out, r#"<p data-n="1" lang="en"/>"#);
}

#[test]
fn mixed_attribute_values_interpolate() {
    let out = render(r#"<img alt="photo of $who"/>"#, Context::new().with("who", "Ann"));
    assert_eq!(out, r#"<img alt="photo of Ann"/>"#);
}

// ── Serialization ──

#[test]
fn literal_text_is_reescaped_and_expressions_are_verbatim() {
    let out = render(
        r#"<p title="a &quot;b&quot;">1 &lt; 2 &amp; $tag</p>"#,
        Context::new().with("tag", "<b>"),
    );
    assert_eq!(out, r#"<p title="a &quot;b&quot;">1 &lt; 2 &amp; <b></p>"#);
}

#[test]
fn empty_elements_follow_the_mode() {
    let source = r#"<div><br/><p></p><img src="a.png"/></div>"#;
    assert_eq!(render(source, Context::new()), r#"<div><br/><p/><img src="a.png"/></div>"#);
    assert_eq!(
        render_html(source, Context::new()),
        r#"<div><br><p></p><img src="a.png"></div>"#
    );
}

#[test]
fn doctype_and_comments() {
    let source = "<!DOCTYPE html><p><!-- note --><!--! private --></p>";
    assert_eq!(render_html(source, Context::new()), "<!DOCTYPE html><p><!-- note --></p>");
}

#[test]
fn processing_instructions_run_host_code() {
    let source = "<?py %base = 10?><p><?py x = base * 2?>${x + 1}</p>";
    let t = Template::xml("t.xml", source, Mode::Xml).unwrap();
    assert_eq!(t.default("base"), Some(&Value::Int(10)));
    assert_eq!(t.render(Context::new()).unwrap(), "<p>21</p>");
}

// ── Linkage ──

#[test]
fn import_and_include_through_the_loader() {
    let loader = Loader::new(
        MemorySource::new()
            .with("lib.xml", r#"<lib><py:def function="shout(s)">${s.upper()}!</py:def></lib>"#)
            .with("part.xml", "<b>$who</b>")
            .with(
                "page.xml",
                r#"<p><py:import href="lib.xml" alias="h"/>${h.shout('hi')} <py:include href="part.xml"/></p>"#,
            ),
    );
    let page = loader.resolve("page.xml").unwrap();
    let out = page.render(Context::new().with("who", "Ann")).unwrap();
    assert_eq!(out, "<p>HI! <b>Ann</b></p>");
}

// ── Errors ──

#[test]
fn malformed_markup_is_an_xml_error() {
    for source in ["<p>&bogus;</p>", "<p><b></p>", "<p>"] {
        let err = Template::xml("t.xml", source, Mode::Xml).unwrap_err();
        assert!(matches!(err, Error::Xml { .. }), "{source}: {err:?}");
    }
}

#[test]
fn external_entities_are_never_resolved() {
    let source = r#"<!DOCTYPE p [<!ENTITY xxe SYSTEM "file:///etc/hostname">]><p>&xxe;</p>"#;
    match Template::xml("t.xml", source, Mode::Xml) {
        Err(Error::Xml { message, .. }) => assert!(message.contains("xxe"), "{message}"),
        other => panic!("expected an xml error, got {other:?}"),
    }
}

#[test]
fn attribute_errors_point_at_the_attribute_line() {
    let source = "<p>\n<a\n  class=\"x\"\n  href=\"${missing}\"/></p>";
    let t = Template::xml("page.xml", source, Mode::Xml).unwrap();
    match t.render(Context::new()) {
        Err(Error::Runtime { line, .. }) => assert_eq!(line, 4),
        other => panic!("expected a runtime error, got {other:?}"),
    }
}

#[test]
fn runtime_errors_point_into_the_markup() {
    let t = Template::xml("page.xml", "<p>\n\n${missing}</p>", Mode::Xml).unwrap();
    match t.render(Context::new()) {
        Err(Error::Runtime { file, line, .. }) => {
            assert_eq!(file, "page.xml");
            assert_eq!(line, 3);
        }
        other => panic!("expected a runtime error, got {other:?}"),
    }
}
