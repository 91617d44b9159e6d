use crate::node::{ExecutionNode, NodeKind};
use crate::path::NodePath;
use crate::template::{is_identifier, Template};
use arbor_error::{ArborError, ErrorCode, ErrorContext, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// A compiled, store-agnostic plan. Immutable once built.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionPlan {
    pub root: ExecutionNode,
    /// Execution needs a non-anonymous identity.
    #[serde(default)]
    pub auth_dependent: bool,
    /// Legacy principal override; the caller must hold a Kerberos credential for it.
    #[serde(default)]
    pub kerberos: Option<String>,
    /// Default output format when the caller does not ask for one.
    #[serde(default)]
    pub serializer: Option<String>,
    /// Template functions child nodes may use in `${fn(var)}` placeholders.
    #[serde(default)]
    pub template_functions: Vec<String>,
}

impl ExecutionPlan {
    pub fn new(root: ExecutionNode) -> Self {
        Self {
            root,
            auth_dependent: false,
            kerberos: None,
            serializer: None,
            template_functions: Vec::new(),
        }
    }

    pub fn auth_dependent(mut self) -> Self {
        self.auth_dependent = true;
        self
    }

    pub fn with_kerberos(mut self, principal: impl Into<String>) -> Self {
        self.kerberos = Some(principal.into());
        self
    }

    pub fn with_serializer(mut self, serializer: impl Into<String>) -> Self {
        self.serializer = Some(serializer.into());
        self
    }

    pub fn with_template_functions<I, S>(mut self, functions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.template_functions = functions.into_iter().map(Into::into).collect();
        self
    }

    /// Parse the compiler's JSON wire shape and validate it.
    pub fn from_json(json: &str) -> Result<Self> {
        let plan: ExecutionPlan = serde_json::from_str(json).map_err(|e| {
            ArborError::new(ErrorCode::InvalidPlan, format!("Malformed plan: {}", e))
        })?;
        plan.validate()?;
        Ok(plan)
    }

    /// Visit every node pre-order with its path.
    pub fn walk<'a, F>(&'a self, mut visit: F)
    where
        F: FnMut(&NodePath, &'a ExecutionNode),
    {
        fn go<'a, F>(node: &'a ExecutionNode, path: NodePath, visit: &mut F)
        where
            F: FnMut(&NodePath, &'a ExecutionNode),
        {
            visit(&path, node);
            for (i, child) in node.children.iter().enumerate() {
                go(child, path.child(i), visit);
            }
        }
        go(&self.root, NodePath::root(), &mut visit);
    }

    pub fn node_count(&self) -> usize {
        let mut count = 0;
        self.walk(|_, _| count += 1);
        count
    }

    /// Structural checks that do not need any backend.
    ///
    /// - sibling names are unique
    /// - declared parameters are identifiers
    /// - placeholders parse and only use declared template functions
    /// - sequences have at least one child
    pub fn validate(&self) -> Result<()> {
        let mut failure: Option<ArborError> = None;

        self.walk(|path, node| {
            if failure.is_some() {
                return;
            }
            failure = self.validate_node(path, node).err();
        });

        match failure {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn validate_node(&self, path: &NodePath, node: &ExecutionNode) -> Result<()> {
        let backend = node.backend_kind();
        let invalid = |message: String| {
            ArborError::new(ErrorCode::InvalidPlan, message).at_node(path.as_str(), backend.as_str())
        };

        if matches!(node.kind, NodeKind::Sequence) && node.children.is_empty() {
            return Err(invalid("Sequence node has no children".to_string()));
        }

        let mut seen = HashSet::new();
        for child in &node.children {
            if let Some(name) = &child.name {
                if !seen.insert(name.as_str()) {
                    return Err(invalid(format!("Duplicate child name '{}'", name)));
                }
            }
        }

        for parameter in &node.parameters {
            if !is_identifier(parameter) {
                return Err(invalid(format!("Malformed parameter name '{}'", parameter)));
            }
        }

        for text in node.template_texts() {
            let template = Template::parse(text).map_err(|e| e.at_node(path.as_str(), backend.as_str()))?;
            for function in template.functions() {
                if !self.template_functions.iter().any(|f| f == function.name()) {
                    return Err(invalid(format!(
                        "Template function '{}' is not declared by the plan",
                        function
                    ))
                    .with_context(ErrorContext::Parameter {
                        name: function.name().to_string(),
                        available: self.template_functions.clone(),
                    }));
                }
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::ConnectionSpec;
    use serde_json::json;

    fn sqlite() -> ConnectionSpec {
        ConnectionSpec::new("sqlite").with_database(":memory:")
    }

    #[test]
    fn test_walk_is_pre_order() {
        let plan = ExecutionPlan::new(ExecutionNode::sequence(vec![
            ExecutionNode::literal(json!([])).named("A"),
            ExecutionNode::sequence(vec![ExecutionNode::literal(json!([])).named("B")]),
            ExecutionNode::literal(json!([])).named("C"),
        ]));

        let mut paths = Vec::new();
        plan.walk(|path, _| paths.push(path.to_string()));
        assert_eq!(paths, vec!["root", "root/0", "root/1", "root/1/0", "root/2"]);
        assert_eq!(plan.node_count(), 5);
    }

    #[test]
    fn test_duplicate_sibling_names_rejected() {
        let plan = ExecutionPlan::new(ExecutionNode::sequence(vec![
            ExecutionNode::literal(json!([])).named("A"),
            ExecutionNode::literal(json!([])).named("A"),
        ]));
        let err = plan.validate().unwrap_err();
        assert_eq!(err.code, ErrorCode::InvalidPlan);
        assert_eq!(err.node_path.as_deref(), Some("root"));
    }

    #[test]
    fn test_undeclared_template_function_rejected() {
        let node = ExecutionNode::relational(sqlite(), "SELECT * FROM t WHERE r = ${upper(r)}");
        let plan = ExecutionPlan::new(node.clone());
        assert_eq!(plan.validate().unwrap_err().code, ErrorCode::InvalidPlan);

        let declared = ExecutionPlan::new(node).with_template_functions(["upper"]);
        assert!(declared.validate().is_ok());
    }

    #[test]
    fn test_empty_sequence_and_bad_parameter_rejected() {
        let empty = ExecutionPlan::new(ExecutionNode::sequence(vec![]));
        assert!(empty.validate().is_err());

        let bad_param = ExecutionPlan::new(
            ExecutionNode::relational(sqlite(), "SELECT 1").with_parameters(["not valid"]),
        );
        assert!(bad_param.validate().is_err());
    }

    #[test]
    fn test_from_json() {
        let plan = ExecutionPlan::from_json(
            r#"{
                "auth_dependent": true,
                "serializer": "csv",
                "root": {
                    "kind": {
                        "type": "Relational",
                        "connection": {"driver": "sqlite", "database": ":memory:"},
                        "sql": "SELECT 1 AS col"
                    }
                }
            }"#,
        )
        .unwrap();
        assert!(plan.auth_dependent);
        assert_eq!(plan.serializer.as_deref(), Some("csv"));

        let err = ExecutionPlan::from_json(r#"{"root": {"kind": {"type": "Nope"}}}"#).unwrap_err();
        assert_eq!(err.code, ErrorCode::InvalidPlan);
    }
}
