use arbor_error::{ArborError, ErrorCode, ErrorContext};
use serde_json::Value;

#[test]
fn test_json_serialization() {
    let error = ArborError::new(ErrorCode::UnsupportedBackend, "No executor for 'Servise'")
        .with_context(ErrorContext::UnsupportedBackend {
            backend: "Servise".to_string(),
            registered_backends: vec!["Relational".to_string(), "Service".to_string()],
        })
        .with_hint("Did you mean 'Service'?")
        .at_node("root", "Servise");

    let json = error.to_json();
    println!("JSON: {}", json);

    let v: Value = serde_json::from_str(&json).expect("valid json");

    assert_eq!(v["code"], "ARBOR-1005");
    assert_eq!(v["message"], "No executor for 'Servise'");
    assert_eq!(v["hint"], "Did you mean 'Service'?");
    assert_eq!(v["node_path"], "root");
    assert_eq!(v["backend"], "Servise");
    assert_eq!(v["context"]["type"], "unsupported_backend");
    assert_eq!(v["context"]["backend"], "Servise");
}

#[test]
fn test_json_deserialization_restores_code() {
    let json = r#"{"code":"ARBOR-4001","message":"vault down"}"#;
    let err: ArborError = serde_json::from_str(json).unwrap();
    assert_eq!(err.code, ErrorCode::CredentialResolutionFailed);
    assert!(err.node_path.is_none());
}

#[test]
fn test_error_code_parsing() {
    let code: ErrorCode = "ARBOR-1004".to_string().try_into().unwrap();
    assert_eq!(code, ErrorCode::PoolExhausted);
}
