use edgecore::{GraphError, NodeError, NodeInstance, NodeRole, NodeSpec, Value};
use std::collections::HashMap;
use std::sync::Arc;

/// Factory trait for creating node instances
pub trait NodeFactory: Send + Sync {
    /// Create a new instance of the node with given configuration
    fn create(&self, config: &HashMap<String, Value>) -> Result<NodeInstance, NodeError>;

    /// Get node type identifier
    fn node_type(&self) -> &str;

    fn role(&self) -> NodeRole;

    /// Check a configuration without keeping the instance.
    fn validate_config(&self, config: &HashMap<String, Value>) -> Result<(), NodeError> {
        self.create(config).map(|_| ())
    }

    /// Optional: Get node metadata (description, output streams, etc.)
    fn metadata(&self) -> NodeMetadata {
        NodeMetadata::default()
    }
}

/// Metadata about a node type
#[derive(Debug, Clone)]
pub struct NodeMetadata {
    pub description: String,
    pub category: String,
    pub outputs: Vec<PortDefinition>,
}

impl Default for NodeMetadata {
    fn default() -> Self {
        Self {
            description: String::new(),
            category: "general".to_string(),
            outputs: Vec::new(),
        }
    }
}

/// A conventional output stream of a node type.
#[derive(Debug, Clone)]
pub struct PortDefinition {
    pub index: u32,
    pub name: String,
    pub description: String,
}

/// Registry of available node types
pub struct NodeRegistry {
    factories: HashMap<String, Arc<dyn NodeFactory>>,
}

impl NodeRegistry {
    pub fn new() -> Self {
        Self {
            factories: HashMap::new(),
        }
    }

    /// Register a node factory
    pub fn register(&mut self, factory: Arc<dyn NodeFactory>) {
        let node_type = factory.node_type().to_string();
        tracing::info!("Registering node type: {}", node_type);
        self.factories.insert(node_type, factory);
    }

    pub fn contains(&self, node_type: &str) -> bool {
        self.factories.contains_key(node_type)
    }

    pub fn role_of(&self, node_type: &str) -> Option<NodeRole> {
        self.factories.get(node_type).map(|f| f.role())
    }

    fn factory_for(&self, spec: &NodeSpec) -> Result<&Arc<dyn NodeFactory>, GraphError> {
        let factory = self
            .factories
            .get(&spec.node_type)
            .ok_or_else(|| GraphError::UnknownNodeType(spec.node_type.clone()))?;

        if factory.role() != spec.role {
            return Err(GraphError::Invalid(format!(
                "Node {} declares role {:?} but {} is a {:?} node",
                spec.id,
                spec.role,
                spec.node_type,
                factory.role()
            )));
        }
        Ok(factory)
    }

    /// Validate a node spec against its factory without instantiating it for use.
    pub fn validate_node(&self, spec: &NodeSpec) -> Result<(), GraphError> {
        self.factory_for(spec)?
            .validate_config(&spec.config)
            .map_err(|e| GraphError::Invalid(format!("Node {}: {}", spec.id, e)))
    }

    /// Create a node instance from a node spec
    pub fn create_node(&self, spec: &NodeSpec) -> Result<NodeInstance, GraphError> {
        self.factory_for(spec)?
            .create(&spec.config)
            .map_err(|e| GraphError::Invalid(format!("Failed to create node {}: {}", spec.id, e)))
    }

    /// Get all registered node types, sorted
    pub fn list_node_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.factories.keys().cloned().collect();
        types.sort();
        types
    }

    /// Get metadata for a node type
    pub fn get_metadata(&self, node_type: &str) -> Option<NodeMetadata> {
        self.factories.get(node_type).map(|f| f.metadata())
    }
}

impl Default for NodeRegistry {
    fn default() -> Self {
        Self::new()
    }
}
