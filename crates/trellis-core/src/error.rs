use thiserror::Error;

/// Problems found while loading a playbook. Any of these rejects the whole
/// playbook before a run can start.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum DefinitionError {
    #[error("playbook document could not be parsed: {0}")]
    Malformed(String),

    #[error("playbook '{playbook}' has no nodes")]
    Empty { playbook: String },

    #[error("playbook '{playbook}': start node '{node}' does not exist")]
    MissingStart { playbook: String, node: String },

    #[error("playbook '{playbook}': duplicate node id '{node}'")]
    DuplicateNode { playbook: String, node: String },

    #[error("playbook '{playbook}': node '{from}' transitions to missing node '{to}'")]
    MissingTarget {
        playbook: String,
        from: String,
        to: String,
    },

    #[error("playbook '{playbook}': node '{node}' uses reserved system key '{key}'")]
    ReservedKey {
        playbook: String,
        node: String,
        key: String,
    },

    #[error("playbook '{playbook}': input parameter '{param}' is declared twice")]
    DuplicateParam { playbook: String, param: String },

    #[error("playbook '{playbook}': node '{node}' has an invalid predicate '{expr}': {reason}")]
    InvalidPredicate {
        playbook: String,
        node: String,
        expr: String,
        reason: String,
    },

    #[error("playbook '{playbook}': node '{node}' has unknown type '{node_type}'")]
    UnknownNodeType {
        playbook: String,
        node: String,
        node_type: String,
    },

    #[error("playbook '{playbook}': node '{node}' declares an invalid response schema: {reason}")]
    InvalidSchema {
        playbook: String,
        node: String,
        reason: String,
    },

    #[error("playbook '{playbook}': node '{node}' window ratio {ratio} is outside (0, 1]")]
    InvalidWindowRatio {
        playbook: String,
        node: String,
        ratio: f64,
    },

    #[error("playbook '{playbook}': node '{node}' invokes unknown playbook '{callee}'")]
    UnknownCallee {
        playbook: String,
        node: String,
        callee: String,
    },

    #[error("playbook '{playbook}': node '{node}' calls '{callee}' with mismatched arguments: {reason}")]
    ArgumentMismatch {
        playbook: String,
        node: String,
        callee: String,
        reason: String,
    },

    #[error("duplicate playbook name '{0}'")]
    DuplicatePlaybook(String),
}

#[derive(Debug, Error)]
pub enum TrellisError {
    // Definition errors
    #[error("Invalid playbook: {0}")]
    Definition(#[from] DefinitionError),

    #[error("Playbook not found: {0}")]
    PlaybookNotFound(String),

    #[error("Node '{node}' not found in playbook '{playbook}'")]
    NodeNotFound { playbook: String, node: String },

    // Depth / budget errors
    #[error("Nested session rejected: depth {depth} would exceed max depth {max_depth}")]
    DepthExceeded { depth: usize, max_depth: usize },

    #[error("No nested session to leave")]
    NoOpenSession,

    #[error("Thread not found: {0}")]
    ThreadNotFound(String),

    // Model errors
    #[error("Model request failed: {0}")]
    ModelRequest(String),

    #[error("Structured output violates response schema: {0}")]
    SchemaViolation(String),

    // Tool errors
    #[error("Tool not found: {0}")]
    ToolNotFound(String),

    #[error("Tool execution failed: {tool}: {message}")]
    ToolExecution { tool: String, message: String },

    #[error("Tool timeout after {timeout_secs}s: {tool}")]
    ToolTimeout { tool: String, timeout_secs: u64 },

    #[error("Tool input validation failed: {0}")]
    ToolValidation(String),

    // Interpreter errors
    #[error("Undefined variable '{0}' in template")]
    MissingVariable(String),

    #[error("Key '{0}' is reserved for the system region")]
    ReservedKey(String),

    #[error("Argument mismatch calling '{playbook}': {reason}")]
    ArgumentMismatch { playbook: String, reason: String },

    #[error("Run exceeded max steps ({0})")]
    StepLimitExceeded(usize),

    #[error("Sub-workflow call depth exceeded ({0})")]
    CallDepthExceeded(usize),

    // Side-effect errors
    #[error("Memory store error: {0}")]
    Memory(String),

    #[error("Surface delivery failed: {0}")]
    Surface(String),

    // Config errors
    #[error("Config error: {0}")]
    Config(String),

    #[error("Config file not found: {0}")]
    ConfigNotFound(String),

    // Storage errors
    #[error("Database error: {0}")]
    Database(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // JSON errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl TrellisError {
    /// Depth and budget errors reject a single operation; the run carries on.
    pub fn is_rejection(&self) -> bool {
        matches!(self, Self::DepthExceeded { .. } | Self::NoOpenSession)
    }
}

pub type Result<T> = std::result::Result<T, TrellisError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rejections_are_depth_and_leave_only() {
        assert!(TrellisError::NoOpenSession.is_rejection());
        assert!(TrellisError::DepthExceeded { depth: 4, max_depth: 3 }.is_rejection());
        assert!(!TrellisError::StepLimitExceeded(10).is_rejection());
        assert!(!TrellisError::CallDepthExceeded(8).is_rejection());
    }

    #[test]
    fn test_missing_node_names_node_and_playbook() {
        let err = TrellisError::NodeNotFound {
            playbook: "triage".into(),
            node: "route".into(),
        };
        assert_eq!(err.to_string(), "Node 'route' not found in playbook 'triage'");
        assert!(!err.is_rejection());
    }
}
