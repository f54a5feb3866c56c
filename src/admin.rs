//! Admin entry points: kill-by-id and client listing. XSLT template
//! application is out of scope; this module only builds the small XML
//! document handed to that (external) rendering sink, matching the shape
//! `fserve_kill_client`/`fserve_list_clients_xml` build in `fserve.c`.

use std::fmt::Write as _;

/// A minimal XML element tree, just expressive enough for the two admin
/// responses this engine produces. Escaping is applied on render so callers
/// can pass arbitrary mount names/messages safely.
#[derive(Debug, Clone)]
pub struct XmlNode {
    pub tag: &'static str,
    pub attrs: Vec<(&'static str, String)>,
    pub text: Option<String>,
    pub children: Vec<XmlNode>,
}

impl XmlNode {
    pub fn new(tag: &'static str) -> Self {
        XmlNode {
            tag,
            attrs: Vec::new(),
            text: None,
            children: Vec::new(),
        }
    }

    pub fn with_text(tag: &'static str, text: impl Into<String>) -> Self {
        XmlNode {
            tag,
            attrs: Vec::new(),
            text: Some(text.into()),
            children: Vec::new(),
        }
    }

    pub fn attr(mut self, key: &'static str, value: impl Into<String>) -> Self {
        self.attrs.push((key, value.into()));
        self
    }

    pub fn child(mut self, node: XmlNode) -> Self {
        self.children.push(node);
        self
    }

    fn escape(s: &str) -> String {
        let mut out = String::with_capacity(s.len());
        for c in s.chars() {
            match c {
                '&' => out.push_str("&amp;"),
                '<' => out.push_str("&lt;"),
                '>' => out.push_str("&gt;"),
                '"' => out.push_str("&quot;"),
                _ => out.push(c),
            }
        }
        out
    }

    pub fn render(&self) -> String {
        let mut out = String::new();
        self.render_into(&mut out);
        out
    }

    fn render_into(&self, out: &mut String) {
        let _ = write!(out, "<{}", self.tag);
        for (k, v) in &self.attrs {
            let _ = write!(out, " {}=\"{}\"", k, Self::escape(v));
        }
        if self.text.is_none() && self.children.is_empty() {
            out.push_str("/>");
            return;
        }
        out.push('>');
        if let Some(text) = &self.text {
            out.push_str(&Self::escape(text));
        }
        for child in &self.children {
            child.render_into(out);
        }
        let _ = write!(out, "</{}>", self.tag);
    }
}

/// Result of a kill-by-id request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KillOutcome {
    Removed,
    NotFound,
}

pub fn kill_response_xml(id: u64, outcome: KillOutcome) -> XmlNode {
    let (message, ret) = match outcome {
        KillOutcome::Removed => (format!("Client {id} removed"), "1"),
        KillOutcome::NotFound => (format!("Client {id} not found"), "0"),
    };
    XmlNode::new("iceresponse")
        .child(XmlNode::with_text("message", message))
        .child(XmlNode::with_text("return", ret))
}

pub fn list_clients_xml(mount: &str, listener_ids: &[u64]) -> XmlNode {
    let mut source = XmlNode::new("source").attr("mount", mount.to_string());
    for id in listener_ids {
        source = source.child(XmlNode::with_text("listener", id.to_string()));
    }
    source = source.child(XmlNode::with_text("listeners", listener_ids.len().to_string()));
    XmlNode::new("icestats").child(source)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kill_response_removed() {
        let xml = kill_response_xml(42, KillOutcome::Removed).render();
        assert!(xml.contains("<message>Client 42 removed</message>"));
        assert!(xml.contains("<return>1</return>"));
    }

    #[test]
    fn kill_response_not_found() {
        let xml = kill_response_xml(7, KillOutcome::NotFound).render();
        assert!(xml.contains("<message>Client 7 not found</message>"));
        assert!(xml.contains("<return>0</return>"));
    }

    #[test]
    fn list_clients_renders_listeners_and_count() {
        let xml = list_clients_xml("/a.mp3", &[1, 2, 3]).render();
        assert!(xml.contains(r#"mount="/a.mp3""#));
        assert!(xml.contains("<listener>1</listener>"));
        assert!(xml.contains("<listeners>3</listeners>"));
    }

    #[test]
    fn escapes_special_characters_in_mount() {
        let xml = list_clients_xml("/a&b.mp3", &[]).render();
        assert!(xml.contains("/a&amp;b.mp3"));
    }
}
