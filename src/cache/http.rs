//! Live network fetcher backed by reqwest.

use async_trait::async_trait;
use color_eyre::{eyre::eyre, Result};
use std::time::Duration;

use super::traits::{Fetcher, Request, Response};

#[derive(Clone)]
pub struct HttpFetcher {
  client: reqwest::Client,
}

impl HttpFetcher {
  pub fn new(timeout: Duration) -> Result<Self> {
    let client = reqwest::Client::builder()
      .timeout(timeout)
      .build()
      .map_err(|e| eyre!("Failed to build HTTP client: {}", e))?;
    Ok(Self { client })
  }
}

#[async_trait]
impl Fetcher for HttpFetcher {
  async fn fetch(&self, request: &Request) -> Result<Response> {
    let mut builder = self
      .client
      .request(request.method.clone(), request.url.clone());
    for (name, value) in &request.headers {
      builder = builder.header(name.as_str(), value.as_str());
    }

    let response = builder
      .send()
      .await
      .map_err(|e| eyre!("Request to {} failed: {}", request.url, e))?;

    let status = response.status().as_u16();
    let headers = response
      .headers()
      .iter()
      .filter_map(|(name, value)| {
        value
          .to_str()
          .ok()
          .map(|v| (name.as_str().to_string(), v.to_string()))
      })
      .collect();
    let body = response
      .bytes()
      .await
      .map_err(|e| eyre!("Failed to read body of {}: {}", request.url, e))?
      .to_vec();

    Ok(Response {
      status,
      headers,
      body,
    })
  }
}
