use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::Path;

use serde::{Deserialize, Serialize};

use skein_core::error::{Result, SkeinError};

/// Semantic type of one state field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldKind {
    Text,
    Number,
    List,
    Map,
}

impl FieldKind {
    /// Seed value for a fresh thread.
    pub fn empty_value(&self) -> serde_json::Value {
        match self {
            Self::Text => serde_json::Value::String(String::new()),
            Self::Number => serde_json::json!(0),
            Self::List => serde_json::json!([]),
            Self::Map => serde_json::json!({}),
        }
    }
}

/// A declarative base node: renders a template against current state into its
/// one output field.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeDef {
    pub name: String,
    /// `{field}` placeholders are replaced with current state values.
    pub template: String,
    /// State field this node writes. No other node may write it.
    pub output: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EdgeDef {
    pub from: String,
    pub to: String,
}

impl EdgeDef {
    pub fn new(from: impl Into<String>, to: impl Into<String>) -> Self {
        Self {
            from: from.into(),
            to: to.into(),
        }
    }
}

/// A reloadable workflow: state schema plus the base graph, before agent
/// injection. Replaced wholesale on hot-reload, never mutated in place.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    pub name: String,
    pub entry: String,
    #[serde(default)]
    pub schema: BTreeMap<String, FieldKind>,
    #[serde(default, rename = "node")]
    pub nodes: Vec<NodeDef>,
    #[serde(default, rename = "edge")]
    pub edges: Vec<EdgeDef>,
}

impl WorkflowDefinition {
    /// Load a definition from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|_| SkeinError::ConfigNotFound(path.display().to_string()))?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self> {
        let def: WorkflowDefinition =
            toml::from_str(content).map_err(|e| SkeinError::Config(e.to_string()))?;
        def.validate()?;
        Ok(def)
    }

    pub fn node(&self, name: &str) -> Option<&NodeDef> {
        self.nodes.iter().find(|n| n.name == name)
    }

    /// Structural checks: the graph must be connected and every field must
    /// have exactly one writer before execution is attempted.
    pub fn validate(&self) -> Result<()> {
        let mut names = HashSet::new();
        for node in &self.nodes {
            if !names.insert(node.name.as_str()) {
                return Err(SkeinError::Config(format!(
                    "duplicate node '{}' in workflow '{}'",
                    node.name, self.name
                )));
            }
        }

        if !names.contains(self.entry.as_str()) {
            return Err(SkeinError::Config(format!(
                "entry node '{}' not defined in workflow '{}'",
                self.entry, self.name
            )));
        }

        for edge in &self.edges {
            for end in [&edge.from, &edge.to] {
                if !names.contains(end.as_str()) {
                    return Err(SkeinError::Config(format!(
                        "edge references unknown node '{}' in workflow '{}'",
                        end, self.name
                    )));
                }
            }
        }

        // Every non-entry node needs an incoming edge, or it can never run.
        for node in &self.nodes {
            if node.name != self.entry && !self.edges.iter().any(|e| e.to == node.name) {
                return Err(SkeinError::Config(format!(
                    "node '{}' is unreachable in workflow '{}'",
                    node.name, self.name
                )));
            }
        }

        let mut writers: HashMap<&str, &str> = HashMap::new();
        for node in &self.nodes {
            if !self.schema.contains_key(&node.output) {
                return Err(SkeinError::Config(format!(
                    "node '{}' writes undeclared field '{}'",
                    node.name, node.output
                )));
            }
            if let Some(other) = writers.insert(node.output.as_str(), node.name.as_str()) {
                return Err(SkeinError::Config(format!(
                    "field '{}' written by both '{}' and '{}'",
                    node.output, other, node.name
                )));
            }
        }

        Ok(())
    }
}

/// Replace `{field}` placeholders with current state values.
///
/// Strings are substituted as-is; other values as their JSON rendering.
/// Unknown placeholders are left untouched.
pub fn render_template(template: &str, fields: &HashMap<String, serde_json::Value>) -> String {
    let mut rendered = template.to_string();
    for (key, value) in fields {
        let placeholder = format!("{{{}}}", key);
        if rendered.contains(&placeholder) {
            let display = match value {
                serde_json::Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            rendered = rendered.replace(&placeholder, &display);
        }
    }
    rendered
}
