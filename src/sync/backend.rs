//! The remote data backend, as seen by the sync coordinator.

use async_trait::async_trait;
use color_eyre::{eyre::eyre, Result};
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION};
use reqwest::Method;
use serde_json::Value;
use url::Url;

use crate::queue::{OperationKind, PendingOperation};

/// Failure of a single replayed operation.
#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum BackendError {
  /// The operation failed; other operations may still succeed
  #[error("retryable: {0}")]
  Retryable(String),
  /// The pass cannot continue (e.g. connectivity lost)
  #[error("fatal: {0}")]
  Fatal(String),
}

#[async_trait]
pub trait Backend: Send + Sync {
  /// Apply one queued mutation.
  async fn apply(&self, op: &PendingOperation) -> Result<(), BackendError>;
}

/// REST backend: one request per operation against `{base}/{entity}`.
#[derive(Clone)]
pub struct HttpBackend {
  client: reqwest::Client,
  base: Url,
}

impl HttpBackend {
  pub fn new(api_url: &Url, schema_path: &str, api_key: Option<&str>) -> Result<Self> {
    let mut headers = HeaderMap::new();
    if let Some(key) = api_key {
      let value =
        HeaderValue::from_str(key).map_err(|e| eyre!("Invalid API key header: {}", e))?;
      let bearer = HeaderValue::from_str(&format!("Bearer {}", key))
        .map_err(|e| eyre!("Invalid API key header: {}", e))?;
      headers.insert("apikey", value);
      headers.insert(AUTHORIZATION, bearer);
    }
    headers.insert("prefer", HeaderValue::from_static("return=minimal"));

    let client = reqwest::Client::builder()
      .default_headers(headers)
      .build()
      .map_err(|e| eyre!("Failed to build HTTP client: {}", e))?;

    let base = api_url
      .join(&format!("{}/", schema_path.trim_end_matches('/')))
      .map_err(|e| eyre!("Invalid API schema path '{}': {}", schema_path, e))?;

    Ok(Self { client, base })
  }

  /// Target URL for an operation; updates and deletes address the row by id.
  fn endpoint(&self, op: &PendingOperation) -> Result<Url, BackendError> {
    let mut url = self
      .base
      .join(op.target_entity.trim_start_matches('/'))
      .map_err(|e| BackendError::Retryable(format!("bad entity '{}': {}", op.target_entity, e)))?;

    if op.kind != OperationKind::Create {
      // Without a row filter the request would hit every row in the table
      let id = match op.payload.get("id") {
        None | Some(Value::Null) => {
          return Err(BackendError::Retryable(format!(
            "{} payload has no id",
            op.kind
          )))
        }
        Some(Value::String(s)) => s.clone(),
        Some(other) => other.to_string(),
      };
      url.query_pairs_mut().append_pair("id", &format!("eq.{}", id));
    }
    Ok(url)
  }
}

fn method_for(kind: OperationKind) -> Method {
  match kind {
    OperationKind::Create => Method::POST,
    OperationKind::Update => Method::PATCH,
    OperationKind::Delete => Method::DELETE,
  }
}

#[async_trait]
impl Backend for HttpBackend {
  async fn apply(&self, op: &PendingOperation) -> Result<(), BackendError> {
    let url = self.endpoint(op)?;

    let response = self
      .client
      .request(method_for(op.kind), url)
      .json(&op.payload)
      .send()
      .await
      // No response at all: treat as lost connectivity
      .map_err(|e| BackendError::Fatal(e.to_string()))?;

    let status = response.status();
    if status.is_success() {
      return Ok(());
    }

    let body = response.text().await.unwrap_or_default();
    // 4xx will likely never succeed; like 5xx it runs out the retry budget
    // and surfaces as a terminal failure
    Err(BackendError::Retryable(format!(
      "HTTP {}: {}",
      status.as_u16(),
      body.trim()
    )))
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::queue::OperationStatus;
  use chrono::Utc;
  use serde_json::json;
  use wiremock::matchers::{body_json, header, method, path, query_param};
  use wiremock::{Mock, MockServer, ResponseTemplate};

  fn op(kind: OperationKind, payload: Value) -> PendingOperation {
    PendingOperation {
      id: 1,
      seq: 1,
      kind,
      target_entity: "items".to_string(),
      payload,
      created_at: Utc::now(),
      retry_count: 0,
      status: OperationStatus::Syncing,
      last_error: None,
    }
  }

  async fn backend(server: &MockServer) -> HttpBackend {
    let url = Url::parse(&server.uri()).unwrap();
    HttpBackend::new(&url, "/rest/v1", Some("anon-key")).unwrap()
  }

  #[tokio::test]
  async fn test_create_posts_payload() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
      .and(path("/rest/v1/items"))
      .and(header("apikey", "anon-key"))
      .and(header("authorization", "Bearer anon-key"))
      .and(body_json(json!({ "name": "bolts", "qty": 10 })))
      .respond_with(ResponseTemplate::new(201))
      .expect(1)
      .mount(&server)
      .await;

    let backend = backend(&server).await;
    backend
      .apply(&op(OperationKind::Create, json!({ "name": "bolts", "qty": 10 })))
      .await
      .unwrap();
  }

  #[tokio::test]
  async fn test_update_and_delete_target_row() {
    let server = MockServer::start().await;
    Mock::given(method("PATCH"))
      .and(path("/rest/v1/items"))
      .and(query_param("id", "eq.42"))
      .respond_with(ResponseTemplate::new(204))
      .expect(1)
      .mount(&server)
      .await;
    Mock::given(method("DELETE"))
      .and(path("/rest/v1/items"))
      .and(query_param("id", "eq.abc"))
      .respond_with(ResponseTemplate::new(204))
      .expect(1)
      .mount(&server)
      .await;

    let backend = backend(&server).await;
    backend
      .apply(&op(OperationKind::Update, json!({ "id": 42, "qty": 3 })))
      .await
      .unwrap();
    backend
      .apply(&op(OperationKind::Delete, json!({ "id": "abc" })))
      .await
      .unwrap();
  }

  #[tokio::test]
  async fn test_update_and_delete_without_id_send_nothing() {
    let server = MockServer::start().await;
    Mock::given(method("DELETE"))
      .respond_with(ResponseTemplate::new(204))
      .expect(0)
      .mount(&server)
      .await;
    Mock::given(method("PATCH"))
      .respond_with(ResponseTemplate::new(204))
      .expect(0)
      .mount(&server)
      .await;

    let backend = backend(&server).await;
    let err = backend
      .apply(&op(OperationKind::Delete, json!({ "name": "bolts" })))
      .await
      .unwrap_err();
    assert_eq!(err, BackendError::Retryable("delete payload has no id".to_string()));

    let err = backend
      .apply(&op(OperationKind::Update, json!({ "id": null, "qty": 1 })))
      .await
      .unwrap_err();
    assert!(matches!(err, BackendError::Retryable(_)));
  }

  #[tokio::test]
  async fn test_error_statuses_are_retryable() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
      .respond_with(ResponseTemplate::new(503).set_body_string("maintenance"))
      .mount(&server)
      .await;

    let backend = backend(&server).await;
    let err = backend
      .apply(&op(OperationKind::Create, json!({})))
      .await
      .unwrap_err();
    assert_eq!(err, BackendError::Retryable("HTTP 503: maintenance".to_string()));
  }

  #[tokio::test]
  async fn test_unreachable_backend_is_fatal() {
    let url = Url::parse("http://127.0.0.1:9").unwrap();
    let backend = HttpBackend::new(&url, "/rest/v1", None).unwrap();
    let err = backend
      .apply(&op(OperationKind::Create, json!({})))
      .await
      .unwrap_err();
    assert!(matches!(err, BackendError::Fatal(_)));
  }
}
