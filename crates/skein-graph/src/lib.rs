pub mod definition;
pub mod splice;

pub use definition::{render_template, EdgeDef, FieldKind, NodeDef, WorkflowDefinition};
pub use splice::{splice, AgentNode, AugmentedGraph, RuntimeNode};
