//! Static playbook model: definitions, nodes, transitions, and templates.
//!
//! Everything here is validated at load time. A playbook that loads is safe
//! to walk: every transition target exists and no node touches a reserved
//! system key.

pub mod definition;
pub mod node;
pub mod registry;
pub mod template;
pub mod transition;

pub use definition::{InputParam, PlaybookDefinition};
pub use node::{
    EmitNode, EnterSessionNode, GenerateNode, InvocationMode, InvokeNode, InvokeToolNode,
    LeaveSessionNode, Node, NodeKind, RecordNode, ReflectNode,
};
pub use registry::PlaybookRegistry;
pub use template::Template;
pub use transition::{ConditionalNext, Predicate};
