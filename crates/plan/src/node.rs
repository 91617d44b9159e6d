use crate::auth::AuthenticationSpec;
use crate::connection::ConnectionSpec;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;

/// Backend tag used to pick a store executor.
///
/// Open-ended: anything other than the built-in tags is dispatched to
/// whichever executor registered that name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BackendKind(String);

impl BackendKind {
    pub const RELATIONAL: &'static str = "Relational";
    pub const SERVICE: &'static str = "Service";
    pub const IN_MEMORY: &'static str = "InMemory";
    pub const SEQUENCE: &'static str = "Sequence";

    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn relational() -> Self {
        Self::new(Self::RELATIONAL)
    }

    pub fn service() -> Self {
        Self::new(Self::SERVICE)
    }

    pub fn in_memory() -> Self {
        Self::new(Self::IN_MEMORY)
    }

    pub fn sequence() -> Self {
        Self::new(Self::SEQUENCE)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for BackendKind {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

/// What a node's result is expected to look like.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ResultShape {
    ClassMapping {
        class: String,
        #[serde(default)]
        properties: Vec<String>,
    },
    Relation {
        columns: Vec<String>,
    },
    /// Opaque payload passed through untouched (e.g. a file or HTTP body).
    Raw { type_name: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum InMemorySource {
    Literal { value: Value },
    /// A result published earlier in the same execution.
    Reference { name: String },
}

/// Row transform applied by the in-memory executor. Rows are JSON objects.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op")]
pub enum TransformOp {
    Project { columns: Vec<String> },
    Filter { column: String, equals: Value },
    Limit { count: usize },
    Rename { from: String, to: String },
}

fn default_method() -> String {
    "GET".to_string()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum NodeKind {
    Relational {
        connection: ConnectionSpec,
        sql: String,
    },
    Service {
        url: String,
        #[serde(default = "default_method")]
        method: String,
        #[serde(default)]
        headers: BTreeMap<String, String>,
        #[serde(default)]
        body: Option<String>,
        #[serde(default)]
        auth: AuthenticationSpec,
    },
    InMemory {
        source: InMemorySource,
        #[serde(default)]
        operations: Vec<TransformOp>,
    },
    Sequence,
    Other {
        backend: String,
        #[serde(default)]
        config: Value,
    },
}

/// One typed step of the plan tree. Parents own their children.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionNode {
    /// Results of named nodes are published into the execution state.
    #[serde(default)]
    pub name: Option<String>,
    pub kind: NodeKind,
    #[serde(default)]
    pub children: Vec<ExecutionNode>,
    #[serde(default)]
    pub result_shape: Option<ResultShape>,
    /// Plan variables this node needs at execution time.
    #[serde(default)]
    pub parameters: Vec<String>,
    /// A failure of this node is recorded and its siblings keep running.
    #[serde(default)]
    pub best_effort: bool,
}

impl ExecutionNode {
    pub fn new(kind: NodeKind) -> Self {
        Self {
            name: None,
            kind,
            children: Vec::new(),
            result_shape: None,
            parameters: Vec::new(),
            best_effort: false,
        }
    }

    pub fn relational(connection: ConnectionSpec, sql: impl Into<String>) -> Self {
        Self::new(NodeKind::Relational {
            connection,
            sql: sql.into(),
        })
    }

    pub fn service(url: impl Into<String>) -> Self {
        Self::new(NodeKind::Service {
            url: url.into(),
            method: default_method(),
            headers: BTreeMap::new(),
            body: None,
            auth: AuthenticationSpec::None,
        })
    }

    pub fn in_memory(source: InMemorySource, operations: Vec<TransformOp>) -> Self {
        Self::new(NodeKind::InMemory { source, operations })
    }

    pub fn literal(value: Value) -> Self {
        Self::in_memory(InMemorySource::Literal { value }, Vec::new())
    }

    pub fn sequence(children: Vec<ExecutionNode>) -> Self {
        Self::new(NodeKind::Sequence).with_children(children)
    }

    pub fn other(backend: impl Into<String>, config: Value) -> Self {
        Self::new(NodeKind::Other {
            backend: backend.into(),
            config,
        })
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_children(mut self, children: Vec<ExecutionNode>) -> Self {
        self.children = children;
        self
    }

    pub fn with_result_shape(mut self, shape: ResultShape) -> Self {
        self.result_shape = Some(shape);
        self
    }

    pub fn with_parameters<I, S>(mut self, parameters: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.parameters = parameters.into_iter().map(Into::into).collect();
        self
    }

    pub fn best_effort(mut self) -> Self {
        self.best_effort = true;
        self
    }

    pub fn backend_kind(&self) -> BackendKind {
        match &self.kind {
            NodeKind::Relational { .. } => BackendKind::relational(),
            NodeKind::Service { .. } => BackendKind::service(),
            NodeKind::InMemory { .. } => BackendKind::in_memory(),
            NodeKind::Sequence => BackendKind::sequence(),
            NodeKind::Other { backend, .. } => BackendKind::new(backend.clone()),
        }
    }

    pub fn is_sequence(&self) -> bool {
        matches!(self.kind, NodeKind::Sequence)
    }

    /// Raw strings carrying `${var}` placeholders.
    pub fn template_texts(&self) -> Vec<&str> {
        match &self.kind {
            NodeKind::Relational { sql, .. } => vec![sql.as_str()],
            NodeKind::Service {
                url, headers, body, ..
            } => {
                let mut texts = vec![url.as_str()];
                texts.extend(headers.values().map(String::as_str));
                texts.extend(body.as_deref());
                texts
            }
            _ => Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_backend_kind_per_node() {
        let spec = ConnectionSpec::new("sqlite");
        assert_eq!(
            ExecutionNode::relational(spec, "SELECT 1").backend_kind(),
            BackendKind::relational()
        );
        assert_eq!(
            ExecutionNode::other("Quantum", Value::Null)
                .backend_kind()
                .as_str(),
            "Quantum"
        );
        assert!(ExecutionNode::sequence(vec![]).is_sequence());
    }

    #[test]
    fn test_node_wire_shape() {
        let node: ExecutionNode = serde_json::from_value(json!({
            "name": "orders",
            "kind": {
                "type": "Service",
                "url": "http://svc/orders?region=${region}",
                "headers": {"X-Tenant": "${tenant}"}
            },
            "result_shape": {"type": "Raw", "type_name": "application/json"},
            "best_effort": true
        }))
        .unwrap();

        assert_eq!(node.name.as_deref(), Some("orders"));
        assert!(node.best_effort);
        assert_eq!(
            node.template_texts(),
            vec!["http://svc/orders?region=${region}", "${tenant}"]
        );
        match node.kind {
            NodeKind::Service { method, auth, .. } => {
                assert_eq!(method, "GET");
                assert_eq!(auth, AuthenticationSpec::None);
            }
            other => panic!("unexpected kind {:?}", other),
        }
    }

    #[test]
    fn test_transform_wire_shape() {
        let ops: Vec<TransformOp> = serde_json::from_value(json!([
            {"op": "Filter", "column": "region", "equals": "EU"},
            {"op": "Limit", "count": 2}
        ]))
        .unwrap();
        assert_eq!(ops[1], TransformOp::Limit { count: 2 });
    }
}
