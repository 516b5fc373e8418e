use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

use skein_core::error::{Result, SkeinError};
use skein_core::types::{AgentSpec, InsertAt};
use skein_provider::ProviderAdapter;

use crate::definition::{EdgeDef, FieldKind, WorkflowDefinition};

/// An executable node of the augmented graph.
#[derive(Debug)]
pub enum RuntimeNode {
    /// Base node carried over from the definition.
    Transform { template: String, output: String },
    /// Spliced agent node.
    Agent(AgentNode),
}

/// One injected agent: invokes its provider adapter and owns three namespaced
/// state fields, which no other node may write.
#[derive(Debug)]
pub struct AgentNode {
    pub role: String,
    pub task: Option<String>,
    pub adapter: Arc<dyn ProviderAdapter>,
    pub timeout: Duration,
}

impl AgentNode {
    pub fn output_field(&self) -> String {
        format!("{}_output", self.role)
    }

    pub fn session_field(&self) -> String {
        format!("{}_session", self.role)
    }

    pub fn cost_field(&self) -> String {
        format!("{}_cost", self.role)
    }
}

/// The executable graph handed to the engine: base nodes plus spliced agent
/// nodes, rewired edges, and the extended state schema.
///
/// Built as a fresh value from an immutable base definition — a reloaded
/// definition can never alias a graph already in flight.
#[derive(Debug)]
pub struct AugmentedGraph {
    pub name: String,
    pub entry: String,
    pub nodes: HashMap<String, RuntimeNode>,
    pub edges: Vec<EdgeDef>,
    pub schema: BTreeMap<String, FieldKind>,
}

impl AugmentedGraph {
    pub fn node(&self, name: &str) -> Option<&RuntimeNode> {
        self.nodes.get(name)
    }

    /// Successor of a node: the first matching edge wins.
    pub fn successor(&self, name: &str) -> Option<&str> {
        self.edges
            .iter()
            .find(|e| e.from == name)
            .map(|e| e.to.as_str())
    }
}

fn agent_fields(role: &str) -> [(String, FieldKind); 3] {
    [
        (format!("{}_output", role), FieldKind::Text),
        (format!("{}_session", role), FieldKind::Text),
        (format!("{}_cost", role), FieldKind::Number),
    ]
}

/// Produce an augmented executable graph from a base definition and resolved
/// agent specs.
///
/// Each spec's node lands at its declared insertion point by rewriting the one
/// edge that crosses it into two; all other edges are preserved. Two specs
/// naming the same point and polarity chain in declaration order rather than
/// conflicting. All structural violations (duplicate role, dangling insertion
/// point, field collision) are rejected here, before any execution attempt.
pub fn splice(
    base: &WorkflowDefinition,
    specs: &[AgentSpec],
    adapters: &HashMap<String, Arc<dyn ProviderAdapter>>,
) -> Result<AugmentedGraph> {
    base.validate()?;

    let mut nodes: HashMap<String, RuntimeNode> = base
        .nodes
        .iter()
        .map(|n| {
            (
                n.name.clone(),
                RuntimeNode::Transform {
                    template: n.template.clone(),
                    output: n.output.clone(),
                },
            )
        })
        .collect();
    let mut edges = base.edges.clone();
    let mut schema = base.schema.clone();
    let mut entry = base.entry.clone();

    let mut roles = HashSet::new();
    // Moving tail per `after` anchor, so same-point specs chain in
    // declaration order instead of stacking in reverse.
    let mut after_tail: HashMap<String, String> = HashMap::new();

    for spec in specs {
        if !roles.insert(spec.role.clone()) {
            return Err(SkeinError::Config(format!(
                "duplicate agent role '{}'",
                spec.role
            )));
        }
        if nodes.contains_key(&spec.role) {
            return Err(SkeinError::Config(format!(
                "agent role '{}' collides with a node name",
                spec.role
            )));
        }

        let insertion = spec.insertion()?;
        if !nodes.contains_key(insertion.anchor()) {
            return Err(SkeinError::Config(format!(
                "agent '{}' references unknown insertion point '{}'",
                spec.role,
                insertion.anchor()
            )));
        }

        let adapter = adapters.get(&spec.role).ok_or_else(|| {
            SkeinError::Config(format!("no adapter resolved for role '{}'", spec.role))
        })?;

        // Exclusive ownership of the namespaced fields, by construction: a
        // collision with the base schema (or another role) never splices.
        for (field, kind) in agent_fields(&spec.role) {
            if schema.contains_key(&field) {
                return Err(SkeinError::Config(format!(
                    "state field '{}' already exists; cannot splice role '{}'",
                    field, spec.role
                )));
            }
            schema.insert(field, kind);
        }

        match &insertion {
            InsertAt::After(point) => {
                let anchor = after_tail.get(point).cloned().unwrap_or_else(|| point.clone());
                match edges.iter().position(|e| e.from == anchor) {
                    Some(i) => {
                        let old_to = std::mem::replace(&mut edges[i].to, spec.role.clone());
                        edges.push(EdgeDef::new(spec.role.clone(), old_to));
                    }
                    None => {
                        // Anchor was terminal; the agent becomes the new tail.
                        edges.push(EdgeDef::new(anchor.clone(), spec.role.clone()));
                    }
                }
                after_tail.insert(point.clone(), spec.role.clone());
            }
            InsertAt::Before(point) => {
                if *point == entry {
                    edges.push(EdgeDef::new(spec.role.clone(), point.clone()));
                    entry = spec.role.clone();
                } else {
                    // validate() guarantees a non-entry node has an incoming
                    // edge; repeated specs chain because the rewritten edge
                    // into `point` is found again next round.
                    let i = edges
                        .iter()
                        .position(|e| e.to == *point)
                        .ok_or_else(|| {
                            SkeinError::Config(format!(
                                "no edge crosses insertion point '{}'",
                                point
                            ))
                        })?;
                    let old_from = std::mem::replace(&mut edges[i].from, spec.role.clone());
                    edges.push(EdgeDef::new(old_from, spec.role.clone()));
                }
            }
        }

        debug!(role = %spec.role, provider = %spec.provider, "Agent node spliced");
        nodes.insert(
            spec.role.clone(),
            RuntimeNode::Agent(AgentNode {
                role: spec.role.clone(),
                task: spec.task.clone(),
                adapter: Arc::clone(adapter),
                timeout: spec.timeout(),
            }),
        );
    }

    Ok(AugmentedGraph {
        name: base.name.clone(),
        entry,
        nodes,
        edges,
        schema,
    })
}
