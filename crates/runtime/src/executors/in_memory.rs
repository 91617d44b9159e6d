//! Literal and previously published data, with simple row transforms.

use super::{NodeContext, StoreExecutor};
use crate::result::{ConstantResult, ExecutionResult};
use crate::state::PublishedResult;
use arbor_error::{ArborError, ErrorCode, Result};
use arbor_plan::{BackendKind, InMemorySource, NodeKind, ResultShape, TransformOp};
use async_trait::async_trait;
use serde_json::{Map, Value};

pub struct InMemoryExecutor;

fn load(ctx: &NodeContext<'_>, source: &InMemorySource) -> Result<Value> {
    match source {
        InMemorySource::Literal { value } => Ok(value.clone()),
        InMemorySource::Reference { name } => match ctx.state.published(name) {
            Some(PublishedResult::Value(value)) => Ok(value),
            Some(PublishedResult::Streaming { .. }) => Err(ArborError::new(
                ErrorCode::InvalidPlan,
                format!("Result '{}' is still streaming and cannot be referenced", name),
            )),
            _ => ctx.state.resolve_variable(name),
        },
    }
}

/// Apply `operations` in order. Non-array input is treated as a single row.
pub fn apply_operations(value: Value, operations: &[TransformOp]) -> Result<Value> {
    if operations.is_empty() {
        return Ok(value);
    }
    let mut rows = match value {
        Value::Array(items) => items,
        other => vec![other],
    };
    for op in operations {
        rows = match op {
            TransformOp::Project { columns } => rows
                .into_iter()
                .map(|row| -> Result<Value> {
                    let map = as_object(row, op)?;
                    Ok(Value::Object(
                        columns
                            .iter()
                            .map(|c| (c.clone(), map.get(c).cloned().unwrap_or(Value::Null)))
                            .collect(),
                    ))
                })
                .collect::<Result<_>>()?,
            TransformOp::Filter { column, equals } => rows
                .into_iter()
                .filter(|row| row.get(column) == Some(equals))
                .collect(),
            TransformOp::Limit { count } => {
                rows.truncate(*count);
                rows
            }
            TransformOp::Rename { from, to } => rows
                .into_iter()
                .map(|row| -> Result<Value> {
                    let map = as_object(row, op)?;
                    Ok(Value::Object(
                        map.into_iter()
                            .map(|(k, v)| if &k == from { (to.clone(), v) } else { (k, v) })
                            .collect(),
                    ))
                })
                .collect::<Result<_>>()?,
        };
    }
    Ok(Value::Array(rows))
}

fn as_object(row: Value, op: &TransformOp) -> Result<Map<String, Value>> {
    match row {
        Value::Object(map) => Ok(map),
        other => Err(ArborError::new(
            ErrorCode::BackendExecutionFailed,
            format!("{:?} needs object rows, got {}", op, other),
        )),
    }
}

#[async_trait]
impl StoreExecutor for InMemoryExecutor {
    fn backend_kind(&self) -> BackendKind {
        BackendKind::in_memory()
    }

    async fn run(&self, ctx: NodeContext<'_>) -> Result<ExecutionResult> {
        let NodeKind::InMemory { source, operations } = &ctx.node.kind else {
            return Err(ctx.mismatch("InMemory"));
        };
        let value = apply_operations(load(&ctx, source)?, operations)?;
        let columns = match &ctx.node.result_shape {
            Some(ResultShape::Relation { columns }) => columns.clone(),
            _ => Vec::new(),
        };
        Ok(ExecutionResult::Constant(
            ConstantResult::new(value).with_columns(columns),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn people() -> Value {
        json!([
            {"id": 1, "name": "ada", "team": "core"},
            {"id": 2, "name": "bob", "team": "web"},
            {"id": 3, "name": "cy", "team": "core"}
        ])
    }

    #[test]
    fn test_filter_project_limit() {
        let ops = vec![
            TransformOp::Filter {
                column: "team".into(),
                equals: json!("core"),
            },
            TransformOp::Project {
                columns: vec!["name".into(), "missing".into()],
            },
            TransformOp::Limit { count: 1 },
        ];
        assert_eq!(
            apply_operations(people(), &ops).unwrap(),
            json!([{"name": "ada", "missing": null}])
        );
    }

    #[test]
    fn test_rename_keeps_column_order() {
        let ops = vec![TransformOp::Rename {
            from: "name".into(),
            to: "login".into(),
        }];
        let out = apply_operations(json!({"id": 1, "name": "ada", "team": "x"}), &ops).unwrap();
        let keys: Vec<&String> = out[0].as_object().unwrap().keys().collect();
        assert_eq!(keys, vec!["id", "login", "team"]);
    }

    #[test]
    fn test_no_operations_is_identity() {
        assert_eq!(apply_operations(json!(42), &[]).unwrap(), json!(42));
    }

    #[test]
    fn test_project_on_scalar_rows_fails() {
        let ops = vec![TransformOp::Project {
            columns: vec!["a".into()],
        }];
        let err = apply_operations(json!([1, 2]), &ops).unwrap_err();
        assert_eq!(err.code, ErrorCode::BackendExecutionFailed);
    }
}
