//! Playbook execution engine.
//!
//! A playbook is a named graph of typed nodes. The [`Engine`] walks it from
//! the start node, dispatching each node to its executor and following
//! `conditional_next` / `next` transitions until a terminal node, a
//! cancellation point, or an error. Nested sessions ("threads") partition the
//! model's context window recursively; see [`thread`].

pub mod checkpoint;
mod executor;
pub mod interpreter;
pub mod playbook;
pub mod profile;
pub mod run_log;
pub mod session;
pub mod state;
pub mod thread;

pub use checkpoint::HierarchyStore;
pub use interpreter::{Engine, RunOutcome, RunStatus};
pub use playbook::{Node, NodeKind, PlaybookDefinition, PlaybookRegistry};
pub use profile::{ProfileName, ProfileResolver};
pub use run_log::RunLogger;
pub use session::SessionRegistry;
pub use state::{ExecutionState, NodeRegion, Output, OutputFragment, OutputKind, SystemContext};
pub use thread::{Thread, ThreadHierarchy, ThreadLimits, ThreadStatus};
