//! HTTP service calls.

use super::{NodeContext, StoreExecutor};
use crate::format::Chunk;
use crate::result::{ConstantResult, ExecutionResult, StreamingResult};
use arbor_common::auth::Credential;
use arbor_common::config::RetrySettings;
use arbor_common::retry::retry_async_if;
use arbor_common::scrubber::scrub;
use arbor_error::{ArborError, ErrorCode, ErrorContext, Result};
use arbor_plan::{BackendKind, NodeKind, ResultShape};
use async_trait::async_trait;
use futures::StreamExt;
use reqwest::Method;
use secrecy::ExposeSecret;
use serde_json::Value;
use tracing::debug;

/// Header carrying a delegated Kerberos principal to trusted services.
pub const DELEGATED_PRINCIPAL_HEADER: &str = "X-Forwarded-User";

pub struct ServiceExecutor {
    client: reqwest::Client,
    retry: RetrySettings,
}

struct PreparedRequest {
    method: Method,
    url: String,
    headers: Vec<(String, String)>,
    body: Option<String>,
    credential: Credential,
}

impl ServiceExecutor {
    pub fn new(client: reqwest::Client, retry: RetrySettings) -> Self {
        Self { client, retry }
    }

    async fn send(&self, request: &PreparedRequest) -> Result<reqwest::Response> {
        let mut builder = self
            .client
            .request(request.method.clone(), &request.url);
        for (name, value) in &request.headers {
            builder = builder.header(name, value);
        }
        if let Some(body) = &request.body {
            builder = builder.body(body.clone());
        }
        builder = match &request.credential {
            Credential::Anonymous => builder,
            Credential::Token { token, .. } => builder.bearer_auth(token.expose_secret()),
            Credential::UsernamePassword { username, password } => {
                builder.basic_auth(username, Some(password.expose_secret()))
            }
            Credential::Kerberos { principal, .. } => {
                builder.header(DELEGATED_PRINCIPAL_HEADER, principal)
            }
        };

        let response = builder.send().await.map_err(|e| {
            let code = if e.is_connect() || e.is_timeout() {
                ErrorCode::ConnectionFailed
            } else {
                ErrorCode::BackendExecutionFailed
            };
            ArborError::new(code, format!("Request to {} failed: {}", scrub(&request.url), e))
                .with_context(ErrorContext::Http {
                    url: scrub(&request.url),
                    status: None,
                })
        })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ArborError::backend_failure(format!(
                "Service returned {}: {}",
                status,
                scrub(body.trim())
            ))
            .with_context(ErrorContext::Http {
                url: scrub(&request.url),
                status: Some(status.as_u16()),
            }));
        }
        Ok(response)
    }
}

fn is_transient(err: &ArborError) -> bool {
    match (&err.code, &err.context) {
        (ErrorCode::ConnectionFailed, _) => true,
        (
            ErrorCode::BackendExecutionFailed,
            Some(ErrorContext::Http {
                status: Some(status),
                ..
            }),
        ) => matches!(status, 502..=504),
        _ => false,
    }
}

#[async_trait]
impl StoreExecutor for ServiceExecutor {
    fn backend_kind(&self) -> BackendKind {
        BackendKind::service()
    }

    async fn run(&self, ctx: NodeContext<'_>) -> Result<ExecutionResult> {
        let NodeKind::Service {
            url,
            method,
            headers,
            body,
            auth,
        } = &ctx.node.kind
        else {
            return Err(ctx.mismatch("Service"));
        };

        let method = Method::from_bytes(method.to_ascii_uppercase().as_bytes()).map_err(|_| {
            ArborError::new(
                ErrorCode::InvalidPlan,
                format!("Invalid HTTP method '{}'", method),
            )
        })?;
        let request = PreparedRequest {
            method,
            url: ctx.render(url)?,
            headers: headers
                .iter()
                .map(|(name, value)| -> Result<(String, String)> {
                    Ok((name.clone(), ctx.render(value)?))
                })
                .collect::<Result<_>>()?,
            body: body.as_deref().map(|b| ctx.render(b)).transpose()?,
            credential: ctx
                .pools
                .resolvers()
                .resolve(auth, ctx.state.identity())
                .await?,
        };
        debug!(
            node = %ctx.path,
            method = %request.method,
            url = %scrub(&request.url),
            "Calling service"
        );

        let response = retry_async_if(
            "service call",
            self.retry,
            || self.send(&request),
            is_transient,
        )
        .await?;

        match &ctx.node.result_shape {
            Some(ResultShape::Raw { .. }) => {
                let url = scrub(&request.url);
                let body = response.bytes_stream().map(move |chunk| {
                    chunk.map(Chunk::Bytes).map_err(|e| {
                        ArborError::backend_failure(format!("Reading body from {} failed: {}", url, e))
                    })
                });
                Ok(ExecutionResult::Streaming(StreamingResult::new(
                    Vec::new(),
                    Vec::new(),
                    body.boxed(),
                )))
            }
            shape => {
                let bytes = response.bytes().await.map_err(|e| {
                    ArborError::backend_failure(format!("Reading response body failed: {}", e))
                })?;
                let value: Value = serde_json::from_slice(&bytes).map_err(|e| {
                    ArborError::new(
                        ErrorCode::SerializationFailed,
                        format!("Service response is not JSON: {}", e),
                    )
                })?;
                let columns = match shape {
                    Some(ResultShape::Relation { columns }) => columns.clone(),
                    Some(ResultShape::ClassMapping { properties, .. }) => properties.clone(),
                    _ => Vec::new(),
                };
                Ok(ExecutionResult::Constant(
                    ConstantResult::new(value).with_columns(columns),
                ))
            }
        }
    }
}
