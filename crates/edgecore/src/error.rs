use thiserror::Error;

#[derive(Error, Debug)]
pub enum FlowError {
    #[error("Node error: {0}")]
    Node(#[from] NodeError),

    #[error("Graph error: {0}")]
    Graph(#[from] GraphError),

    #[error("Delivery error: {0}")]
    Delivery(#[from] DeliveryError),

    #[error("Execution error: {0}")]
    Execution(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum NodeError {
    #[error("Missing required input: {0}")]
    MissingInput(String),

    #[error("Invalid input type for '{field}': expected {expected}, got {actual}")]
    InvalidInputType {
        field: String,
        expected: String,
        actual: String,
    },

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Read failed: {0}")]
    ReadFailed(String),

    #[error("Processing failed: {0}")]
    ProcessingFailed(String),

    #[error("Node initialization failed: {0}")]
    InitializationFailed(String),

    #[error("Unknown output stream index {0}")]
    UnknownStream(u32),

    #[error("Timeout after {millis}ms")]
    Timeout { millis: u64 },

    #[error("Cancelled")]
    Cancelled,
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum GraphError {
    #[error("Invalid graph: {0}")]
    Invalid(String),

    #[error("Cyclic dependency detected")]
    CyclicDependency,

    #[error("Node not found: {0}")]
    NodeNotFound(String),

    #[error("Duplicate node id: {0}")]
    DuplicateNode(String),

    #[error("Unknown node type: {0}")]
    UnknownNodeType(String),

    #[error("Invalid connection: {0}")]
    InvalidConnection(String),

    #[error("Node '{node}' declares stream index {index} more than once")]
    DuplicateStreamIndex { node: String, index: u32 },

    #[error("Node '{node}' has no output stream with index {index}")]
    UnknownStream { node: String, index: u32 },

    #[error("Graph must have exactly one acquisition node, found {0}")]
    RootCount(usize),

    #[error("Node '{0}' is not reachable from the acquisition root")]
    Unreachable(String),

    #[error("Stream '{stream}' has sample rate {rate} outside [0, 1]")]
    SampleRate { stream: String, rate: f64 },
}

/// Errors reported by a storage backend.
///
/// Only `Retryable` errors enter the retry queue.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DeliveryError {
    #[error("Retryable delivery failure: {0}")]
    Retryable(String),

    #[error("Terminal delivery failure: {0}")]
    Terminal(String),
}

impl DeliveryError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, DeliveryError::Retryable(_))
    }
}
