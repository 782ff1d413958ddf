//! XML syntax: markup to IR.
//!
//! Three passes. [`read_document`] builds a small DOM with quick-xml,
//! [`expand`] rewrites directive attributes into nested `py:` elements, and
//! [`XmlCompiler`] walks the result emitting IR nodes. Literal markup becomes
//! `Text` nodes; `$name` / `${expr}` inside text and attribute values are
//! split out by the text lexer in interpolation mode.

use crate::error::{Error, Result};
use crate::ir::{Node, NodeKind, Pos, TemplateNode, BLOCK_PREFIX, CALLER};
use crate::lexer::{interpolate, LineCounter, TokenKind};
use crate::loader::Mode;
use indexmap::IndexMap;
use quick_xml::escape::{partial_escape, resolve_html5_entity, resolve_xml_entity, unescape_with};
use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use std::rc::Rc;

/// Compile XML-syntax source into IR. `mode` only affects how empty
/// elements are serialized.
pub fn parse(file: &str, source: &str, mode: Mode) -> Result<TemplateNode> {
    let file: Rc<str> = file.into();
    let mut document = read_document(&file, source)?;
    expand_document(&mut document);
    XmlCompiler::new(file, mode).compile(document)
}

#[derive(Debug, Clone, PartialEq)]
enum XNode {
    Element(Element),
    Text { text: String, line: usize },
    Comment { text: String, line: usize },
    Pi { target: String, data: String, line: usize },
    DocType { text: String, line: usize },
}

#[derive(Debug, Clone, Default, PartialEq)]
struct Element {
    name: String,
    attrs: Vec<(String, String)>,
    children: Vec<XNode>,
    line: usize,
    /// Line on which each source attribute's value starts.
    attr_lines: Vec<(String, usize)>,
}

impl Element {
    fn directive(name: &str, attrs: Vec<(String, String)>, child: Element) -> Self {
        let line = child.line;
        Self {
            name: name.to_string(),
            attrs,
            children: vec![XNode::Element(child)],
            line,
            attr_lines: Vec::new(),
        }
    }

    fn attr_line(&self, name: &str) -> usize {
        self.attr_lines
            .iter()
            .find(|(key, _)| key == name)
            .map_or(self.line, |(_, line)| *line)
    }

    fn attr(&self, name: &str) -> Option<&str> {
        self.attrs
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.as_str())
    }

    fn take_attr(&mut self, name: &str) -> Option<String> {
        let index = self.attrs.iter().position(|(key, _)| key == name)?;
        Some(self.attrs.remove(index).1)
    }
}

// ── Reading ────────────────────────────────────────────────────────────────

fn xml_error(file: &str, line: usize, message: impl Into<String>) -> Error {
    Error::Xml {
        file: file.to_string(),
        line,
        message: message.into(),
    }
}

fn resolve_entity(name: &str) -> Option<&'static str> {
    resolve_xml_entity(name).or_else(|| resolve_html5_entity(name))
}

fn char_ref(name: &str) -> Option<char> {
    let code = if let Some(hex) = name.strip_prefix("#x").or_else(|| name.strip_prefix("#X")) {
        u32::from_str_radix(hex, 16).ok()?
    } else {
        name.strip_prefix('#')?.parse().ok()?
    };
    char::from_u32(code)
}

fn utf8<'a>(file: &str, line: usize, bytes: &'a [u8]) -> Result<&'a str> {
    std::str::from_utf8(bytes).map_err(|e| xml_error(file, line, e.to_string()))
}

/// Newlines seen before each quoted attribute value of a start tag.
fn value_offsets(tag: &[u8]) -> Vec<usize> {
    let mut offsets = Vec::new();
    let mut newlines = 0;
    let mut quote = None;
    for &b in tag {
        match (quote, b) {
            (_, b'\n') => newlines += 1,
            (None, b'"' | b'\'') => {
                offsets.push(newlines);
                quote = Some(b);
            }
            (Some(q), b) if q == b => quote = None,
            _ => {}
        }
    }
    offsets
}

fn element(file: &str, start: &BytesStart<'_>, line: usize) -> Result<Element> {
    let name = utf8(file, line, start.name().as_ref())?.to_string();
    let offsets = value_offsets(start);
    let mut attrs = Vec::new();
    let mut attr_lines = Vec::new();
    for (index, attr) in start.attributes().enumerate() {
        let attr = attr.map_err(|e| xml_error(file, line, e.to_string()))?;
        let key = utf8(file, line, attr.key.as_ref())?;
        if key == "xmlns:py" {
            continue;
        }
        attr_lines.push((key.to_string(), line + offsets.get(index).copied().unwrap_or(0)));
        let raw = utf8(file, line, &attr.value)?;
        let value = unescape_with(raw, resolve_entity)
            .map_err(|e| xml_error(file, line, format!("in attribute `{key}`: {e}")))?;
        attrs.push((key.to_string(), value.into_owned()));
    }
    Ok(Element {
        name,
        attrs,
        children: Vec::new(),
        line,
        attr_lines,
    })
}

fn push_text(children: &mut Vec<XNode>, text: &str, line: usize) {
    if let Some(XNode::Text { text: last, .. }) = children.last_mut() {
        last.push_str(text);
    } else {
        children.push(XNode::Text {
            text: text.to_string(),
            line,
        });
    }
}

fn children<'a>(stack: &'a mut [Element], top: &'a mut Vec<XNode>) -> &'a mut Vec<XNode> {
    match stack.last_mut() {
        Some(element) => &mut element.children,
        None => top,
    }
}

fn read_document(file: &Rc<str>, source: &str) -> Result<Vec<XNode>> {
    let mut reader = Reader::from_str(source);
    reader.config_mut().trim_text(false);
    let mut lines = LineCounter::new(1);
    let mut stack: Vec<Element> = Vec::new();
    let mut top = Vec::new();

    loop {
        let line = lines.line_at(source, reader.buffer_position() as usize);
        let event = reader.read_event().map_err(|e| {
            let line = lines.line_at(source, reader.error_position() as usize);
            xml_error(file, line, e.to_string())
        })?;
        let node = match event {
            Event::Start(e) => {
                stack.push(element(file, &e, line)?);
                continue;
            }
            Event::Empty(e) => XNode::Element(element(file, &e, line)?),
            Event::End(_) => match stack.pop() {
                Some(element) => XNode::Element(element),
                None => return Err(xml_error(file, line, "unexpected closing tag")),
            },
            Event::Text(e) => {
                let text = e.decode().map_err(|e| xml_error(file, line, e.to_string()))?;
                push_text(children(&mut stack, &mut top), &text, line);
                continue;
            }
            Event::GeneralRef(e) => {
                let name = e.decode().map_err(|e| xml_error(file, line, e.to_string()))?;
                let mut buf = [0; 4];
                let resolved = match char_ref(&name) {
                    Some(c) => &*c.encode_utf8(&mut buf),
                    None => resolve_entity(&name)
                        .ok_or_else(|| xml_error(file, line, format!("undefined entity `&{name};`")))?,
                };
                push_text(children(&mut stack, &mut top), resolved, line);
                continue;
            }
            Event::CData(e) => {
                let text = utf8(file, line, e.as_ref())?;
                push_text(children(&mut stack, &mut top), text, line);
                continue;
            }
            Event::Comment(e) => XNode::Comment {
                text: utf8(file, line, e.as_ref())?.to_string(),
                line,
            },
            Event::PI(e) => {
                let content = utf8(file, line, e.as_ref())?;
                let (target, data) = content
                    .split_once(char::is_whitespace)
                    .unwrap_or((content, ""));
                XNode::Pi {
                    target: target.to_string(),
                    data: data.trim().to_string(),
                    line,
                }
            }
            Event::DocType(e) => XNode::DocType {
                text: utf8(file, line, e.as_ref())?.trim().to_string(),
                line,
            },
            Event::Decl(_) => continue,
            Event::Eof => break,
        };
        children(&mut stack, &mut top).push(node);
    }

    if let Some(open) = stack.last() {
        return Err(xml_error(
            file,
            open.line,
            format!("element <{}> is never closed", open.name),
        ));
    }
    Ok(top)
}

// ── Directive expansion ────────────────────────────────────────────────────

/// Directive attributes in nesting order, outermost first, with the
/// attribute the directive element takes and the directive it becomes.
const SHORTHANDS: &[(&str, &str, &str)] = &[
    ("py:def", "function", "py:def"),
    ("py:call", "function", "py:call"),
    ("py:case", "value", "py:case"),
    ("py:when", "value", "py:case"),
    ("py:else", "", "py:else"),
    ("py:otherwise", "", "py:else"),
    ("py:for", "each", "py:for"),
    ("py:if", "test", "py:if"),
    ("py:switch", "test", "py:switch"),
    ("py:block", "name", "py:block"),
];

fn expand_document(document: &mut Vec<XNode>) {
    let hoisted = document.iter_mut().find_map(|node| match node {
        XNode::Element(root) => root.take_attr("py:extends").map(|href| (href, root.line)),
        _ => None,
    });
    for node in document.iter_mut() {
        expand(node);
    }
    if let Some((href, line)) = hoisted {
        document.insert(
            0,
            XNode::Element(Element {
                name: "py:extends".to_string(),
                attrs: vec![("href".to_string(), href)],
                children: Vec::new(),
                line,
                attr_lines: Vec::new(),
            }),
        );
    }
}

fn expand(node: &mut XNode) {
    let XNode::Element(element) = node else {
        return;
    };
    match element.name.as_str() {
        "py:when" => element.name = "py:case".to_string(),
        "py:otherwise" => element.name = "py:else".to_string(),
        _ => {}
    }
    if !element.name.starts_with("py:") {
        if let Some(value) = element.take_attr("py:replace") {
            element.attrs.push(("py:content".to_string(), value));
            element.attrs.push(("py:strip".to_string(), String::new()));
        }
        for &(attr, param, directive) in SHORTHANDS {
            if let Some(value) = element.take_attr(attr) {
                let attrs = if param.is_empty() {
                    Vec::new()
                } else {
                    vec![(param.to_string(), value)]
                };
                let inner = std::mem::take(element);
                *element = Element::directive(directive, attrs, inner);
                break;
            }
        }
    }
    for child in &mut element.children {
        expand(child);
    }
}

// ── Compilation ────────────────────────────────────────────────────────────

const VOID_ELEMENTS: &[&str] = &[
    "area", "base", "br", "col", "embed", "hr", "img", "input", "link", "meta", "param",
    "source", "track", "wbr",
];

struct XmlCompiler {
    file: Rc<str>,
    mode: Mode,
    module: Vec<Node>,
    functions: IndexMap<String, Vec<Node>>,
    in_def: bool,
    is_child: bool,
}

impl XmlCompiler {
    fn new(file: Rc<str>, mode: Mode) -> Self {
        Self {
            file,
            mode,
            module: Vec::new(),
            functions: IndexMap::new(),
            in_def: false,
            is_child: false,
        }
    }

    fn pos(&self, line: usize) -> Pos {
        Pos {
            file: self.file.clone(),
            line,
        }
    }

    fn parse_error(&self, line: usize, message: String) -> Error {
        Error::Parse {
            file: self.file.to_string(),
            line,
            message,
        }
    }

    fn compile(mut self, document: Vec<XNode>) -> Result<TemplateNode> {
        let mut body = self.compile_nodes(document)?;
        if self.is_child {
            body.retain(|node| {
                matches!(
                    node.kind,
                    NodeKind::Extend { .. } | NodeKind::Import { .. } | NodeKind::Python { .. }
                )
            });
            // Imports and host code run before the parent takes over.
            let (extends, mut rest): (Vec<Node>, Vec<Node>) = body
                .into_iter()
                .partition(|node| matches!(node.kind, NodeKind::Extend { .. }));
            rest.extend(extends);
            body = rest;
        }
        Ok(TemplateNode::new(self.module, body, self.functions))
    }

    fn compile_nodes(&mut self, nodes: Vec<XNode>) -> Result<Vec<Node>> {
        let mut out = Vec::new();
        for node in nodes {
            out.extend(self.compile_node(node)?);
        }
        Ok(out)
    }

    fn compile_node(&mut self, node: XNode) -> Result<Vec<Node>> {
        match node {
            XNode::Text { text, line } => self.text(&text, line),
            XNode::Comment { text, line } => {
                if text.starts_with('!') {
                    return Ok(Vec::new());
                }
                Ok(vec![Node::text(self.pos(line), format!("<!--{text}-->"))])
            }
            XNode::Pi { target, data, line } => Ok(self.processing_instruction(target, data, line)),
            XNode::DocType { text, line } => {
                Ok(vec![Node::text(self.pos(line), format!("<!DOCTYPE {text}>"))])
            }
            XNode::Element(element) if element.name.starts_with("py:") => self.directive(element),
            XNode::Element(element) => self.element(element),
        }
    }

    /// Literal text re-escaped, with interpolations split out.
    fn text(&self, text: &str, line: usize) -> Result<Vec<Node>> {
        let tokens = interpolate(&self.file, line, text)?;
        Ok(tokens
            .into_iter()
            .map(|token| {
                let pos = self.pos(token.line);
                match token.kind {
                    TokenKind::Expr => Node::new(pos, NodeKind::Expr(token.text)),
                    _ => Node::text(pos, partial_escape(&token.text)),
                }
            })
            .collect())
    }

    fn processing_instruction(&mut self, target: String, data: String, line: usize) -> Vec<Node> {
        if target != "py" {
            return vec![Node::text(self.pos(line), format!("<?{target} {data}?>"))];
        }
        match data.strip_prefix('%') {
            Some(code) => {
                let node = NodeKind::Python {
                    code: code.trim().to_string(),
                    module: true,
                };
                self.module.push(Node::new(self.pos(line), node));
                Vec::new()
            }
            None => vec![Node::new(
                self.pos(line),
                NodeKind::Python {
                    code: data,
                    module: false,
                },
            )],
        }
    }

    fn element(&mut self, mut element: Element) -> Result<Vec<Node>> {
        let line = element.line;
        let strip = element
            .take_attr("py:strip")
            .map(|s| if s.trim().is_empty() { "True".to_string() } else { s });
        let attrs = element.take_attr("py:attrs");
        let content = element.take_attr("py:content");
        let pos = self.pos(line);
        let tag = |text: String| {
            Node::new(
                pos.clone(),
                NodeKind::Text {
                    text,
                    guard: strip.clone(),
                },
            )
        };

        let mut nodes = vec![tag(format!("<{}", element.name))];
        for (name, value) in &element.attrs {
            let value = interpolate(&self.file, element.attr_line(name), value)?
                .into_iter()
                .map(|token| match token.kind {
                    TokenKind::Expr => Node::new(self.pos(token.line), NodeKind::Expr(token.text)),
                    _ => Node::text(self.pos(token.line), token.text),
                })
                .collect();
            nodes.push(Node::new(
                self.pos(element.attr_line(name)),
                NodeKind::Attr {
                    name: name.clone(),
                    value,
                    guard: strip.clone(),
                },
            ));
        }
        if let Some(expr) = attrs {
            nodes.push(Node::new(
                self.pos(line),
                NodeKind::Attrs {
                    expr,
                    guard: strip.clone(),
                },
            ));
        }

        let body = match content {
            Some(expr) => vec![Node::new(self.pos(line), NodeKind::Expr(expr))],
            None => self.compile_nodes(std::mem::take(&mut element.children))?,
        };
        if body.is_empty() {
            let close = match self.mode {
                Mode::Html if VOID_ELEMENTS.contains(&element.name.to_ascii_lowercase().as_str()) => {
                    ">".to_string()
                }
                Mode::Html => format!("></{}>", element.name),
                _ => "/>".to_string(),
            };
            nodes.push(tag(close));
        } else {
            nodes.push(tag(">".to_string()));
            nodes.extend(body);
            nodes.push(tag(format!("</{}>", element.name)));
        }
        Ok(nodes)
    }

    fn required(&self, element: &Element, attr: &str) -> Result<String> {
        element.attr(attr).map(str::to_string).ok_or_else(|| {
            self.parse_error(
                element.line,
                format!("<{}> requires a `{attr}` attribute", element.name),
            )
        })
    }

    fn directive(&mut self, element: Element) -> Result<Vec<Node>> {
        let line = element.line;
        let kind = match element.name.as_str() {
            "py:if" => NodeKind::If {
                test: self.required(&element, "test")?,
                body: self.compile_nodes(element.children)?,
            },
            "py:else" => NodeKind::Else {
                body: self.compile_nodes(element.children)?,
            },
            "py:switch" => {
                let test = self.required(&element, "test")?;
                let cases = element
                    .children
                    .into_iter()
                    .filter(|child| !matches!(child, XNode::Text { text, .. } if text.trim().is_empty()))
                    .collect();
                NodeKind::Switch {
                    test,
                    body: self.compile_nodes(cases)?,
                }
            }
            "py:case" => NodeKind::Case {
                value: self.required(&element, "value")?,
                body: self.compile_nodes(element.children)?,
            },
            "py:for" => NodeKind::For {
                header: self.required(&element, "each")?,
                body: self.compile_nodes(element.children)?,
            },
            "py:def" => {
                let signature = self.required(&element, "function")?;
                return self.def(signature, element.children, line);
            }
            "py:block" => {
                let name = self.required(&element, "name")?;
                return self.block(&name, element.children, line);
            }
            "py:call" => NodeKind::Call {
                caller: element.attr("args").unwrap_or_default().to_string(),
                target: self.required(&element, "function")?.replace("%caller", CALLER),
                body: self.compile_nodes(element.children)?,
            },
            "py:import" => NodeKind::Import {
                href: self.required(&element, "href")?,
                alias: element.attr("alias").map(str::to_string),
            },
            "py:include" => NodeKind::Include {
                href: self.required(&element, "href")?,
            },
            "py:extends" => {
                self.is_child = true;
                NodeKind::Extend {
                    href: self.required(&element, "href")?,
                }
            }
            other => return Err(self.parse_error(line, format!("unknown directive <{other}>"))),
        };
        Ok(vec![Node::new(self.pos(line), kind)])
    }

    fn def(&mut self, signature: String, children: Vec<XNode>, line: usize) -> Result<Vec<Node>> {
        let was_in_def = std::mem::replace(&mut self.in_def, true);
        let body = self.compile_nodes(children);
        self.in_def = was_in_def;
        let body = body?;
        if was_in_def {
            return Ok(vec![Node::new(self.pos(line), NodeKind::InnerDef { signature, body })]);
        }
        self.functions.insert(signature, body);
        Ok(Vec::new())
    }

    /// A block is a function; parents call it in place, children only
    /// override it and can reach the parent's version as `parent_block`.
    fn block(&mut self, name: &str, children: Vec<XNode>, line: usize) -> Result<Vec<Node>> {
        let function = format!("{BLOCK_PREFIX}{name}");
        let was_in_def = std::mem::replace(&mut self.in_def, true);
        let body = self.compile_nodes(children);
        self.in_def = was_in_def;
        let mut body = body?;
        if self.is_child {
            body.insert(
                0,
                Node::new(
                    self.pos(line),
                    NodeKind::Python {
                        code: format!("parent_block = getattr(parent, '{function}', None)"),
                        module: false,
                    },
                ),
            );
        }
        self.functions.insert(format!("{function}()"), body);
        if self.is_child {
            return Ok(Vec::new());
        }
        Ok(vec![Node::new(self.pos(line), NodeKind::Expr(format!("{function}()")))])
    }
}
