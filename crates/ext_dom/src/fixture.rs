//! JSON page fixtures for building and snapshotting documents.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::{Document, DomError, Namespace, NodeId, NodeKind};

/// One node of a page fixture. Either `tag` or `text` must be set.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tag: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub attributes: BTreeMap<String, String>,
    /// Inline declarations.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub style: BTreeMap<String, String>,
    /// Declarations coming from page stylesheets.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub sheet: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<NodeSpec>,
}

impl NodeSpec {
    pub fn element(tag: &str) -> Self {
        Self {
            tag: Some(tag.to_string()),
            ..Default::default()
        }
    }

    pub fn with_child(mut self, child: NodeSpec) -> Self {
        self.children.push(child);
        self
    }

    pub fn with_attribute(mut self, name: &str, value: &str) -> Self {
        self.attributes.insert(name.to_string(), value.to_string());
        self
    }
}

/// A whole page: host, rendering flags and the contents of `<head>` and `<body>`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PageSpec {
    pub host: String,
    #[serde(default)]
    pub hidden: bool,
    #[serde(default)]
    pub prefers_dark: bool,
    #[serde(default)]
    pub html_attributes: BTreeMap<String, String>,
    #[serde(default)]
    pub body_style: BTreeMap<String, String>,
    #[serde(default)]
    pub body_sheet: BTreeMap<String, String>,
    #[serde(default)]
    pub head: Vec<NodeSpec>,
    #[serde(default)]
    pub body: Vec<NodeSpec>,
}

impl Document {
    /// Build a document from a page fixture.
    pub fn from_page(page: &PageSpec) -> Result<Self, DomError> {
        let mut doc = Document::new(page.host.clone());
        doc.set_hidden(page.hidden);
        doc.set_prefers_dark_color_scheme(page.prefers_dark);

        let html = doc.document_element();
        for (name, value) in &page.html_attributes {
            doc.set_attribute(html, name, value)?;
        }
        let body = doc.body();
        for (property, value) in &page.body_style {
            doc.set_inline_style(body, property, value)?;
        }
        for (property, value) in &page.body_sheet {
            doc.set_sheet_style(body, property, value)?;
        }
        let head = doc.head();
        for spec in &page.head {
            doc.append_spec(head, spec)?;
        }
        for spec in &page.body {
            doc.append_spec(body, spec)?;
        }
        Ok(doc)
    }

    /// Build `spec` as a new subtree and append it to `parent`.
    ///
    /// The subtree is assembled detached and inserted in one step, so observers
    /// see a single child-list record.
    pub fn append_spec(&mut self, parent: NodeId, spec: &NodeSpec) -> Result<NodeId, DomError> {
        let in_svg = self.namespace(parent) == Some(Namespace::Svg);
        let node = self.build_spec(spec, in_svg)?;
        self.append_child(parent, node)?;
        Ok(node)
    }

    fn build_spec(&mut self, spec: &NodeSpec, in_svg: bool) -> Result<NodeId, DomError> {
        let node = match (&spec.tag, &spec.text) {
            (Some(tag), _) => {
                let svg = in_svg || tag.eq_ignore_ascii_case("svg");
                let namespace = if svg { Namespace::Svg } else { Namespace::Html };
                self.create_element_ns(namespace, tag)
            }
            (None, Some(text)) => return Ok(self.create_text(text)),
            (None, None) => {
                return Err(DomError::invalid_fixture("node needs either `tag` or `text`"));
            }
        };

        for (name, value) in &spec.attributes {
            self.set_attribute(node, name, value)?;
        }
        for (property, value) in &spec.style {
            self.set_inline_style(node, property, value)?;
        }
        for (property, value) in &spec.sheet {
            self.set_sheet_style(node, property, value)?;
        }
        let child_svg = self.namespace(node) == Some(Namespace::Svg);
        for child in &spec.children {
            let child_node = self.build_spec(child, child_svg)?;
            self.append_child(node, child_node)?;
        }
        Ok(node)
    }

    /// Snapshot a subtree back into fixture form (inline styles only in `style`).
    pub fn snapshot(&self, node: NodeId) -> NodeSpec {
        let Some(data) = self.nodes.get(node.0) else {
            return NodeSpec::default();
        };
        let (tag, text) = match &data.kind {
            NodeKind::Element { tag, .. } => (Some(tag.clone()), None),
            NodeKind::Text(text) => (None, Some(text.clone())),
            NodeKind::Document => (Some("#document".to_string()), None),
        };
        NodeSpec {
            tag,
            text,
            attributes: data.attributes.clone(),
            style: data.inline_style.clone(),
            sheet: data.sheet_style.clone(),
            children: data.children.iter().map(|c| self.snapshot(*c)).collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_page_from_json() {
        let json = r#"{
            "host": "news.example",
            "htmlAttributes": {"data-color-mode": "light"},
            "head": [{"tag": "meta", "attributes": {"name": "viewport"}}],
            "body": [
                {"tag": "main", "children": [
                    {"tag": "img", "attributes": {"src": "/a.png"}},
                    {"tag": "svg", "children": [{"tag": "image"}]}
                ]}
            ]
        }"#;
        let page: PageSpec = serde_json::from_str(json).unwrap();
        let doc = Document::from_page(&page).unwrap();

        assert_eq!(doc.host(), "news.example");
        assert_eq!(
            doc.attribute(doc.document_element(), "data-color-mode"),
            Some("light")
        );
        let main = doc.elements_by_tag(doc.body(), "main")[0];
        let children = doc.children(main);
        assert_eq!(doc.node_name(children[0]).as_deref(), Some("IMG"));
        assert_eq!(doc.node_name(children[1]).as_deref(), Some("svg"));
        let image = doc.children(children[1])[0];
        assert_eq!(doc.namespace(image), Some(Namespace::Svg));
        assert_eq!(doc.node_name(image).as_deref(), Some("image"));
    }

    #[test]
    fn test_spec_without_tag_or_text_is_rejected() {
        let mut doc = Document::new("example.com");
        let body = doc.body();
        let err = doc.append_spec(body, &NodeSpec::default()).unwrap_err();
        assert!(matches!(err, DomError::InvalidFixture { .. }));
    }

    #[test]
    fn test_snapshot_reflects_inline_style() {
        let mut doc = Document::new("example.com");
        let body = doc.body();
        let img = doc
            .append_spec(body, &NodeSpec::element("img").with_attribute("src", "/a.png"))
            .unwrap();
        doc.set_inline_style(img, "filter", "brightness(40%)").unwrap();

        let snapshot = doc.snapshot(body);
        assert_eq!(snapshot.children.len(), 1);
        assert_eq!(
            snapshot.children[0].style.get("filter").map(String::as_str),
            Some("brightness(40%)")
        );
    }
}
