use std::collections::BTreeMap;

use html5ever::{LocalName, Namespace, QualName};
use kuchikiki::traits::TendrilSink;
use kuchikiki::{Attribute, ExpandedName, NodeRef};

const HTML_NS: &str = "http://www.w3.org/1999/xhtml";

/// One `<script>` element to inject into served HTML.
#[derive(Debug, Clone, Default)]
pub struct ScriptConfig {
    /// Inline script body; empty means an attribute-only tag (e.g. `src=`).
    pub content: String,
    pub attributes: BTreeMap<String, String>,
    /// Insert as the first child of `<head>` instead of the last.
    pub insert_first: bool,
}

/// Injects queued scripts into the `<head>` of an HTML document, creating
/// the `<head>` when the document lacks one.
///
/// This runs on every HTML response through the proxy, so parsing has to
/// accept real-world markup; html5ever's error-tolerant parser does.
#[derive(Debug, Default)]
pub struct HtmlInjector {
    scripts: Vec<ScriptConfig>,
}

fn html_element(name: &str, attributes: Vec<(ExpandedName, Attribute)>) -> NodeRef {
    NodeRef::new_element(
        QualName::new(None, Namespace::from(HTML_NS), LocalName::from(name)),
        attributes,
    )
}

fn find_element(root: &NodeRef, name: &str) -> Option<NodeRef> {
    root.descendants()
        .find(|node| node.as_element().is_some_and(|el| &*el.name.local == name))
}

/// Locate `<head>`, or create one as the first child of `<html>`.
fn ensure_head(document: &NodeRef) -> anyhow::Result<NodeRef> {
    if let Some(head) = find_element(document, "head") {
        return Ok(head);
    }

    let html = find_element(document, "html")
        .ok_or_else(|| anyhow::anyhow!("no <html> tag found in document"))?;

    let head = html_element("head", Vec::new());
    match html.first_child() {
        Some(first) => first.insert_before(head.clone()),
        None => html.append(head.clone()),
    }
    Ok(head)
}

impl HtmlInjector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_script(&mut self, config: ScriptConfig) {
        self.scripts.push(config);
    }

    /// Parse, inject every queued script, and re-serialize the document.
    pub fn inject(&self, content: &[u8]) -> anyhow::Result<Vec<u8>> {
        let source = String::from_utf8_lossy(content);
        let document = kuchikiki::parse_html().one(source.as_ref());

        let head = ensure_head(&document)?;

        for script in &self.scripts {
            let attributes = script
                .attributes
                .iter()
                .map(|(key, value)| {
                    (
                        ExpandedName::new(Namespace::from(""), LocalName::from(key.as_str())),
                        Attribute { prefix: None, value: value.clone() },
                    )
                })
                .collect();
            let node = html_element("script", attributes);
            if !script.content.is_empty() {
                node.append(NodeRef::new_text(script.content.trim()));
            }

            if script.insert_first {
                head.prepend(node);
            } else {
                head.append(node);
            }
        }

        let mut out = Vec::new();
        document
            .serialize(&mut out)
            .map_err(|e| anyhow::anyhow!("failed to render modified HTML: {e}"))?;
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rendered(injector: &HtmlInjector, html: &str) -> String {
        String::from_utf8(injector.inject(html.as_bytes()).unwrap()).unwrap()
    }

    #[test]
    fn insert_first_lands_before_existing_head_children() {
        let mut injector = HtmlInjector::new();
        injector.add_script(ScriptConfig {
            content: "console.log('a')".into(),
            insert_first: true,
            ..Default::default()
        });

        let out = rendered(
            &injector,
            "<html><head><title>t</title></head><body></body></html>",
        );
        let script = out.find("console.log('a')").unwrap();
        let title = out.find("<title>").unwrap();
        assert!(script < title, "script must precede existing head content: {out}");
    }

    #[test]
    fn later_insert_first_script_ends_up_earliest() {
        let mut injector = HtmlInjector::new();
        injector.add_script(ScriptConfig {
            content: "first()".into(),
            insert_first: true,
            ..Default::default()
        });
        injector.add_script(ScriptConfig {
            content: "second()".into(),
            insert_first: true,
            ..Default::default()
        });

        let out = rendered(&injector, "<html><head></head><body></body></html>");
        assert!(out.find("second()").unwrap() < out.find("first()").unwrap());
    }

    #[test]
    fn insert_last_appends_to_head() {
        let mut injector = HtmlInjector::new();
        injector.add_script(ScriptConfig {
            content: "tail()".into(),
            insert_first: false,
            ..Default::default()
        });

        let out = rendered(
            &injector,
            "<html><head><meta charset=\"utf-8\"></head><body></body></html>",
        );
        assert!(out.find("<meta").unwrap() < out.find("tail()").unwrap());
    }

    #[test]
    fn attributes_are_rendered_on_the_script_tag() {
        let mut injector = HtmlInjector::new();
        injector.add_script(ScriptConfig {
            attributes: BTreeMap::from([("src".to_string(), "/x.js".to_string())]),
            insert_first: true,
            ..Default::default()
        });

        let out = rendered(&injector, "<html><head></head></html>");
        assert!(out.contains(r#"src="/x.js""#), "{out}");
    }

    #[test]
    fn fragment_input_still_gets_a_head() {
        // The parser synthesizes the html/head skeleton for fragments.
        let mut injector = HtmlInjector::new();
        injector.add_script(ScriptConfig {
            content: "x()".into(),
            insert_first: true,
            ..Default::default()
        });

        let out = rendered(&injector, "<p>hello</p>");
        assert!(out.contains("x()"));
        assert_eq!(out.matches("<head>").count(), 1);
    }

    #[test]
    fn ensure_head_creates_head_under_html() {
        let document = NodeRef::new_document();
        let html = html_element("html", Vec::new());
        let body = html_element("body", Vec::new());
        html.append(body);
        document.append(html.clone());

        let head = ensure_head(&document).unwrap();
        let first = html.first_child().unwrap();
        assert!(first.as_element().is_some_and(|el| &*el.name.local == "head"));
        assert!(head.as_element().is_some());
    }

    #[test]
    fn ensure_head_fails_without_html_element() {
        let document = NodeRef::new_document();
        document.append(NodeRef::new_text("plain text"));

        let err = ensure_head(&document).unwrap_err();
        assert!(err.to_string().contains("no <html> tag"));
    }
}
