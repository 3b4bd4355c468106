//! Plugin metadata, read statically from source and carried as a sidecar manifest.
//!
//! Metadata is never obtained by executing an artifact. While compiling, the
//! rewritten source is searched for the object literal the plugin exposes as
//! `metadata`, in this order:
//!
//! 1. a top-level variable named `metadata` (`export const metadata = {...}`),
//! 2. a class field named `metadata`,
//! 3. a `get metadata()` accessor returning a literal or `this.<field>`,
//! 4. a class field named `_metadata`.
//!
//! The result is written next to the artifacts as `.manifests/<stem>.json` and
//! read back by the publisher.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tree_sitter::{Node, Tree};

use crate::error::LoadError;
use crate::transform::descendants_of_kind;

/// Directory (under the output directory) holding sidecar manifests.
pub const MANIFEST_DIR: &str = ".manifests";

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PluginMetadata {
    pub name: String,
    pub version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub author: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub icon: Option<String>,
}

impl PluginMetadata {
    /// Name and version become object-key path segments.
    pub fn validate(&self) -> Result<(), LoadError> {
        validate_segment("name", &self.name)?;
        validate_segment("version", &self.version)
    }
}

fn validate_segment(field: &str, value: &str) -> Result<(), LoadError> {
    if value.trim().is_empty() {
        return Err(LoadError::InvalidMetadata(format!("{field} must be non-empty")));
    }
    if value == "." || value == ".." {
        return Err(LoadError::InvalidMetadata(format!(
            "{field} `{value}` is not a valid path segment"
        )));
    }
    if value.chars().any(|c| c == '/' || c == '\\' || c.is_control()) {
        return Err(LoadError::InvalidMetadata(format!(
            "{field} `{value}` contains a path separator or control character"
        )));
    }
    Ok(())
}

/// Sidecar emitted by the compile step for one artifact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PluginManifest {
    pub metadata: PluginMetadata,
    /// Method names declared by the plugin class.
    pub capabilities: Vec<String>,
    pub source: PathBuf,
}

impl PluginManifest {
    pub fn missing_capability<'a>(&self, required: &'a [String]) -> Option<&'a str> {
        required
            .iter()
            .find(|cap| !self.capabilities.iter().any(|c| c == *cap))
            .map(String::as_str)
    }
}

pub fn manifest_path(output_dir: &Path, stem: &str) -> PathBuf {
    output_dir.join(MANIFEST_DIR).join(format!("{stem}.json"))
}

/// Extract the manifest, or `None` when the source declares no metadata object.
pub fn extract_manifest(tree: &Tree, source: &str, source_path: &Path) -> Option<PluginManifest> {
    let root = tree.root_node();
    let src = source.as_bytes();
    let object = find_metadata_object(root, src)?;

    let mut fields = HashMap::new();
    let mut cursor = object.walk();
    for pair in object.named_children(&mut cursor).filter(|n| n.kind() == "pair") {
        let (Some(key), Some(value)) = (
            pair.child_by_field_name("key").and_then(|k| key_text(k, src)),
            pair.child_by_field_name("value").and_then(|v| string_value(v, src)),
        ) else {
            continue;
        };
        fields.insert(key, value);
    }

    let metadata = PluginMetadata {
        name: fields.remove("name").unwrap_or_default(),
        version: fields.remove("version").unwrap_or_default(),
        author: fields.remove("author"),
        description: fields.remove("description"),
        icon: fields.remove("icon"),
    };

    Some(PluginManifest {
        metadata,
        capabilities: plugin_class(root, src)
            .map(|class| capabilities(class, src))
            .unwrap_or_default(),
        source: source_path.to_path_buf(),
    })
}

fn text<'a>(node: Node<'_>, src: &'a [u8]) -> &'a str {
    node.utf8_text(src).unwrap_or_default()
}

fn unwrap_expression(mut node: Node<'_>) -> Node<'_> {
    while matches!(
        node.kind(),
        "as_expression" | "satisfies_expression" | "parenthesized_expression" | "non_null_expression"
    ) {
        match node.named_child(0) {
            Some(inner) => node = inner,
            None => break,
        }
    }
    node
}

fn object_value(node: Option<Node<'_>>) -> Option<Node<'_>> {
    node.map(unwrap_expression).filter(|n| n.kind() == "object")
}

fn find_metadata_object<'t>(root: Node<'t>, src: &[u8]) -> Option<Node<'t>> {
    let mut cursor = root.walk();
    let top_level: Vec<Node<'t>> = root.named_children(&mut cursor).collect();
    for stmt in top_level {
        let decl = if stmt.kind() == "export_statement" {
            stmt.child_by_field_name("declaration")
        } else {
            Some(stmt)
        };
        let Some(decl) = decl.filter(|d| matches!(d.kind(), "lexical_declaration" | "variable_declaration"))
        else {
            continue;
        };
        let mut decl_cursor = decl.walk();
        for declarator in decl.named_children(&mut decl_cursor) {
            if declarator.kind() != "variable_declarator" {
                continue;
            }
            let named_metadata = declarator
                .child_by_field_name("name")
                .is_some_and(|n| text(n, src) == "metadata");
            if named_metadata {
                if let Some(obj) = object_value(declarator.child_by_field_name("value")) {
                    return Some(obj);
                }
            }
        }
    }

    let mut field_nodes = Vec::new();
    descendants_of_kind(root, "public_field_definition", &mut field_nodes);
    let fields: HashMap<&str, Node<'t>> = field_nodes
        .into_iter()
        .filter_map(|f| {
            let name = f.child_by_field_name("name").map(|n| text(n, src))?;
            let value = object_value(f.child_by_field_name("value"))?;
            Some((name, value))
        })
        .collect();

    if let Some(obj) = fields.get("metadata") {
        return Some(*obj);
    }
    if let Some(obj) = getter_object(root, src, &fields) {
        return Some(obj);
    }
    fields.get("_metadata").copied()
}

fn getter_object<'t>(
    root: Node<'t>,
    src: &[u8],
    fields: &HashMap<&str, Node<'t>>,
) -> Option<Node<'t>> {
    let mut methods = Vec::new();
    descendants_of_kind(root, "method_definition", &mut methods);
    for method in methods {
        if !is_accessor(method, "get")
            || method.child_by_field_name("name").map(|n| text(n, src)) != Some("metadata")
        {
            continue;
        }
        let Some(body) = method.child_by_field_name("body") else {
            continue;
        };
        let mut returns = Vec::new();
        descendants_of_kind(body, "return_statement", &mut returns);
        for ret in returns {
            let Some(value) = ret.named_child(0).map(unwrap_expression) else {
                continue;
            };
            match value.kind() {
                "object" => return Some(value),
                "member_expression" => {
                    let on_this = value
                        .child_by_field_name("object")
                        .is_some_and(|o| o.kind() == "this");
                    let field = value.child_by_field_name("property").map(|p| text(p, src));
                    if let (true, Some(field)) = (on_this, field) {
                        if let Some(obj) = fields.get(field) {
                            return Some(*obj);
                        }
                    }
                }
                _ => {}
            }
        }
    }
    None
}

fn is_accessor(method: Node<'_>, keyword: &str) -> bool {
    let mut cursor = method.walk();
    let found = method.children(&mut cursor).any(|c| c.kind() == keyword);
    found
}

fn key_text(key: Node<'_>, src: &[u8]) -> Option<String> {
    match key.kind() {
        "property_identifier" => Some(text(key, src).to_string()),
        "string" => string_value(key, src),
        _ => None,
    }
}

/// Literal string value of a `string` or substitution-free `template_string`.
fn string_value(node: Node<'_>, src: &[u8]) -> Option<String> {
    let node = unwrap_expression(node);
    match node.kind() {
        "string" | "template_string" => {
            let mut out = String::new();
            let mut cursor = node.walk();
            for part in node.named_children(&mut cursor) {
                match part.kind() {
                    "string_fragment" => out.push_str(text(part, src)),
                    "escape_sequence" => out.push_str(&unescape(text(part, src))),
                    _ => return None,
                }
            }
            Some(out)
        }
        _ => None,
    }
}

fn unescape(seq: &str) -> String {
    match seq {
        "\\n" => "\n".into(),
        "\\t" => "\t".into(),
        "\\r" => "\r".into(),
        "\\0" => "\0".into(),
        _ => seq.chars().skip(1).collect(),
    }
}

fn plugin_class<'t>(root: Node<'t>, src: &[u8]) -> Option<Node<'t>> {
    let mut classes = Vec::new();
    descendants_of_kind(root, "class_declaration", &mut classes);

    let mut cursor = root.walk();
    let exports: Vec<Node<'t>> = root
        .named_children(&mut cursor)
        .filter(|n| n.kind() == "export_statement")
        .collect();
    for export in exports {
        let mut export_cursor = export.walk();
        let is_default = export.children(&mut export_cursor).any(|c| c.kind() == "default");
        if !is_default {
            continue;
        }
        if let Some(decl) = export
            .child_by_field_name("declaration")
            .filter(|d| d.kind() == "class_declaration")
        {
            return Some(decl);
        }
        if let Some(value) = export.child_by_field_name("value") {
            let value = unwrap_expression(value);
            if value.kind() == "class" {
                return Some(value);
            }
            if value.kind() == "identifier" {
                let name = text(value, src);
                if let Some(class) = classes.iter().find(|c| {
                    c.child_by_field_name("name").map(|n| text(n, src)) == Some(name)
                }) {
                    return Some(*class);
                }
            }
        }
    }
    classes.into_iter().next()
}

fn capabilities(class: Node<'_>, src: &[u8]) -> Vec<String> {
    let Some(body) = class.child_by_field_name("body") else {
        return Vec::new();
    };
    let mut names = Vec::new();
    let mut cursor = body.walk();
    for member in body.named_children(&mut cursor) {
        if member.kind() != "method_definition" || is_accessor(member, "get") || is_accessor(member, "set") {
            continue;
        }
        if let Some(name) = member.child_by_field_name("name").map(|n| text(n, src)) {
            if name != "constructor" && !names.iter().any(|n| n == name) {
                names.push(name.to_string());
            }
        }
    }
    names
}

/// Read a sidecar written by the compile step.
pub async fn read_manifest(path: &Path) -> Result<PluginManifest, LoadError> {
    let raw = match tokio::fs::read(path).await {
        Ok(raw) => raw,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(LoadError::MissingManifest(path.to_path_buf()))
        }
        Err(e) => return Err(LoadError::Io(e)),
    };
    serde_json::from_slice(&raw).map_err(|e| LoadError::MalformedManifest {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })
}
