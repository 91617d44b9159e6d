use arbor_error::ErrorCode;
use arbor_plan::{
    AuthenticationSpec, BackendKind, ExecutionPlan, InMemorySource, NodeKind, ResultShape,
    SecretRef, TransformOp,
};
use serde_json::json;

const PLAN: &str = r#"{
  "auth_dependent": true,
  "serializer": "csv",
  "template_functions": ["upper"],
  "root": {
    "kind": { "type": "Sequence" },
    "children": [
      {
        "name": "orders",
        "kind": {
          "type": "Relational",
          "connection": {
            "driver": "sqlite",
            "database": "/var/lib/arbor/orders.db",
            "options": { "pool.max_size": "4" },
            "auth": {
              "type": "user_password",
              "username": "svc_orders",
              "password": { "vault": "env", "key": "orders_db" }
            }
          },
          "sql": "SELECT id, total FROM orders WHERE region = ${upper(region)}"
        },
        "parameters": ["region"],
        "result_shape": { "type": "Relation", "columns": ["id", "total"] }
      },
      {
        "name": "rates",
        "best_effort": true,
        "kind": {
          "type": "Service",
          "url": "https://rates.example.com/v1/${region}",
          "auth": { "type": "static_token", "token": { "vault": "env", "key": "rates" } }
        }
      },
      {
        "kind": {
          "type": "InMemory",
          "source": { "type": "Reference", "name": "orders" },
          "operations": [
            { "op": "Filter", "column": "total", "equals": 10 },
            { "op": "Limit", "count": 5 }
          ]
        }
      }
    ]
  }
}"#;

#[test]
fn test_full_plan_document() {
    let plan = ExecutionPlan::from_json(PLAN).unwrap();
    assert!(plan.auth_dependent);
    assert_eq!(plan.serializer.as_deref(), Some("csv"));
    assert_eq!(plan.node_count(), 4);

    let mut visited = Vec::new();
    plan.walk(|path, node| visited.push((path.to_string(), node.backend_kind())));
    assert_eq!(
        visited,
        vec![
            ("root".to_string(), BackendKind::sequence()),
            ("root/0".to_string(), BackendKind::relational()),
            ("root/1".to_string(), BackendKind::service()),
            ("root/2".to_string(), BackendKind::in_memory()),
        ]
    );

    let orders = &plan.root.children[0];
    match &orders.kind {
        NodeKind::Relational { connection, .. } => {
            assert_eq!(connection.options["pool.max_size"], "4");
            assert_eq!(
                connection.auth,
                AuthenticationSpec::UserPassword {
                    username: "svc_orders".into(),
                    password: SecretRef::new("env", "orders_db"),
                }
            );
        }
        other => panic!("unexpected kind {:?}", other),
    }
    assert_eq!(
        orders.result_shape,
        Some(ResultShape::Relation {
            columns: vec!["id".into(), "total".into()]
        })
    );

    let service = &plan.root.children[1];
    assert!(service.best_effort);
    match &service.kind {
        NodeKind::Service { method, .. } => assert_eq!(method, "GET"),
        other => panic!("unexpected kind {:?}", other),
    }

    match &plan.root.children[2].kind {
        NodeKind::InMemory { source, operations } => {
            assert_eq!(source, &InMemorySource::Reference { name: "orders".into() });
            assert_eq!(
                operations[0],
                TransformOp::Filter {
                    column: "total".into(),
                    equals: json!(10)
                }
            );
        }
        other => panic!("unexpected kind {:?}", other),
    }
}

#[test]
fn test_plan_survives_serialization() {
    let plan = ExecutionPlan::from_json(PLAN).unwrap();
    let text = serde_json::to_string(&plan).unwrap();
    assert_eq!(ExecutionPlan::from_json(&text).unwrap(), plan);
}

#[test]
fn test_undeclared_function_is_rejected_at_node() {
    let doc = PLAN.replace(r#""template_functions": ["upper"],"#, "");
    let err = ExecutionPlan::from_json(&doc).unwrap_err();
    assert_eq!(err.code, ErrorCode::InvalidPlan);
    assert_eq!(err.node_path.as_deref(), Some("root/0"));
}

#[test]
fn test_unknown_node_type_is_invalid() {
    let err = ExecutionPlan::from_json(r#"{"root": {"kind": {"type": "Teleport"}}}"#).unwrap_err();
    assert_eq!(err.code, ErrorCode::InvalidPlan);
    assert!(err.message.starts_with("Malformed plan"));
}
