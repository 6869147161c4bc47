//! Page observation: url, title, screenshot, and a simplified
//! accessibility-style tree derived from the live DOM.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

use autosurf_core_types::PageId;

use crate::session::BrowserSession;

/// Raw DOM walk evaluated inside the page. Emits a nested object per
/// element with just the fields the tree builder cares about. Script and
/// style subtrees carry no user-visible semantics and are skipped.
const CAPTURE_TREE_JS: &str = r#"(() => {
  const SKIP = new Set(["script", "style", "noscript", "template"]);
  const ownText = (el) => {
    let out = "";
    for (const node of el.childNodes) {
      if (node.nodeType === Node.TEXT_NODE) out += node.textContent;
    }
    return out.trim().slice(0, 120);
  };
  const labelText = (el) => {
    if (el.labels && el.labels.length > 0) {
      return el.labels[0].innerText.trim().slice(0, 120);
    }
    return "";
  };
  const walk = (el) => {
    const tag = el.tagName.toLowerCase();
    if (SKIP.has(tag)) return null;
    const attrs = {};
    for (const name of [
      "role", "aria-label", "aria-description", "aria-hidden", "aria-pressed",
      "aria-expanded", "aria-selected", "alt", "title", "type", "href",
      "placeholder",
    ]) {
      const value = el.getAttribute(name);
      if (value !== null) attrs[name] = value;
    }
    const out = {
      tag,
      attrs,
      text: ownText(el),
      label: labelText(el),
      value: typeof el.value === "string" ? el.value.slice(0, 120) : "",
      focused: el === document.activeElement,
      checked: el.checked === true,
      disabled: el.disabled === true || el.hasAttribute("disabled"),
      hidden: el.hidden === true || el.getAttribute("aria-hidden") === "true",
      required: el.required === true || el.hasAttribute("required"),
      selected: el.selected === true || el.getAttribute("aria-selected") === "true",
      children: [],
    };
    for (const child of el.children) {
      const sub = walk(child);
      if (sub) out.children.push(sub);
    }
    return out;
  };
  return walk(document.documentElement);
})()"#;

/// One node of the simplified accessibility tree.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct AccessibilityNode {
    pub role: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub states: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub children: Vec<AccessibilityNode>,
}

/// Everything the decision layer gets to see about a page at one instant.
#[derive(Clone, Debug, Default)]
pub struct Observation {
    pub url: String,
    pub title: String,
    pub screenshot_jpeg: Option<Vec<u8>>,
    pub tree: Option<AccessibilityNode>,
}

/// Captures observations. Every part degrades independently: a failed
/// screenshot or tree capture leaves that field empty rather than failing
/// the observation.
pub struct ObservationCollector {
    session: Arc<BrowserSession>,
}

impl ObservationCollector {
    pub fn new(session: Arc<BrowserSession>) -> Self {
        Self { session }
    }

    pub async fn snapshot(&self, page: PageId) -> Observation {
        let url = match self.session.evaluate(page, "location.href").await {
            Ok(Value::String(url)) => url,
            _ => self.session.recent_url(page).unwrap_or_default(),
        };
        let title = match self.session.evaluate(page, "document.title").await {
            Ok(Value::String(title)) => title,
            _ => String::new(),
        };

        let quality = self.session.config().screenshot_quality;
        let screenshot_jpeg = match self.session.screenshot_jpeg(page, quality).await {
            Ok(bytes) => Some(bytes),
            Err(err) => {
                warn!(target: "browser-host", %page, ?err, "screenshot capture failed");
                None
            }
        };

        let tree = match self.session.evaluate(page, CAPTURE_TREE_JS).await {
            Ok(raw) => build_tree(&raw),
            Err(err) => {
                warn!(target: "browser-host", %page, ?err, "tree capture failed");
                None
            }
        };

        Observation {
            url,
            title,
            screenshot_jpeg,
            tree,
        }
    }
}

/// Map a raw DOM walk into the simplified tree.
pub fn build_tree(raw: &Value) -> Option<AccessibilityNode> {
    let tag = raw.get("tag")?.as_str()?;
    let attrs = raw.get("attrs").cloned().unwrap_or(Value::Null);
    let attr = |name: &str| -> Option<String> {
        attrs
            .get(name)
            .and_then(Value::as_str)
            .map(str::to_string)
            .filter(|value| !value.is_empty())
    };
    let field = |name: &str| -> Option<String> {
        raw.get(name)
            .and_then(Value::as_str)
            .map(str::to_string)
            .filter(|value| !value.is_empty())
    };
    let flag = |name: &str| raw.get(name).and_then(Value::as_bool).unwrap_or(false);

    let role = attr("role").unwrap_or_else(|| implicit_role(tag, attr("type").as_deref()));

    // title describes, it does not name.
    let name = attr("aria-label")
        .or_else(|| field("label"))
        .or_else(|| attr("alt"))
        .or_else(|| attr("placeholder"))
        .or_else(|| field("text"));

    let description = attr("aria-description").or_else(|| attr("title"));
    let value = field("value");

    let mut states = Vec::new();
    if flag("disabled") {
        states.push("disabled".to_string());
    }
    if flag("hidden") {
        states.push("hidden".to_string());
    }
    if flag("required") {
        states.push("required".to_string());
    }
    if flag("checked") {
        states.push("checked".to_string());
    }
    if flag("selected") {
        states.push("selected".to_string());
    }
    if flag("focused") {
        states.push("focused".to_string());
    }
    if attr("aria-pressed").as_deref() == Some("true") {
        states.push("pressed".to_string());
    }
    if attr("aria-expanded").as_deref() == Some("true") {
        states.push("expanded".to_string());
    }

    let children = raw
        .get("children")
        .and_then(Value::as_array)
        .map(|items| items.iter().filter_map(build_tree).collect())
        .unwrap_or_default();

    Some(AccessibilityNode {
        role,
        name,
        description,
        value,
        states,
        children,
    })
}

fn implicit_role(tag: &str, input_type: Option<&str>) -> String {
    match tag {
        "a" => "link",
        "button" => "button",
        "select" => "combobox",
        "textarea" => "textbox",
        "img" => "img",
        "nav" => "navigation",
        "main" => "main",
        "form" => "form",
        "table" => "table",
        "li" => "listitem",
        "ul" | "ol" => "list",
        "h1" | "h2" | "h3" | "h4" | "h5" | "h6" => "heading",
        "input" => match input_type.unwrap_or("text") {
            "checkbox" => "checkbox",
            "radio" => "radio",
            "button" | "submit" | "reset" => "button",
            "range" => "slider",
            _ => "textbox",
        },
        _ => "generic",
    }
    .to_string()
}

/// Render the tree as an indented outline, capped at `max_nodes` lines.
/// Purely structural nodes with nothing to say are collapsed away.
pub fn format_outline(node: &AccessibilityNode, max_nodes: usize) -> String {
    let mut lines = Vec::new();
    let mut truncated = false;
    outline_into(node, 0, max_nodes, &mut lines, &mut truncated);
    if truncated {
        lines.push("... (outline truncated)".to_string());
    }
    lines.join("\n")
}

fn outline_into(
    node: &AccessibilityNode,
    depth: usize,
    max_nodes: usize,
    lines: &mut Vec<String>,
    truncated: &mut bool,
) {
    let interesting = node.role != "generic"
        || node.name.is_some()
        || node.value.is_some()
        || !node.states.is_empty();

    let child_depth = if interesting {
        if lines.len() >= max_nodes {
            *truncated = true;
            return;
        }
        let mut line = format!("{}{}", "  ".repeat(depth), node.role);
        if let Some(name) = &node.name {
            line.push_str(&format!(" \"{name}\""));
        }
        if let Some(value) = &node.value {
            line.push_str(&format!(" value={value:?}"));
        }
        if !node.states.is_empty() {
            line.push_str(&format!(" [{}]", node.states.join(", ")));
        }
        lines.push(line);
        depth + 1
    } else {
        depth
    };

    for child in &node.children {
        outline_into(child, child_depth, max_nodes, lines, truncated);
    }
}
