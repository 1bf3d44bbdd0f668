//! Shared HTTP client for backend traffic.
//!
//! One `reqwest::Client` with the configured request timeout serves every
//! backend; adapters pass absolute URLs and an optional bearer credential.
//! All failures come back already normalized.

use super::{classify_http, classify_transport};
use crate::error::{CoreError, ErrorKind, NormalizedError};
use reqwest::Client;
use serde_json::Value;
use std::time::Duration;

#[derive(Clone)]
pub struct BackendHttp {
    http: Client,
}

impl BackendHttp {
    pub fn new(timeout: Duration) -> Result<Self, CoreError> {
        let http = Client::builder().timeout(timeout).build()?;
        Ok(Self { http })
    }

    /// POST a JSON body and parse a JSON response.
    pub async fn post_json(
        &self,
        url: &str,
        bearer: Option<&str>,
        body: &Value,
    ) -> Result<Value, NormalizedError> {
        let mut req = self.http.post(url).json(body);
        if let Some(token) = bearer {
            req = req.bearer_auth(token);
        }
        let resp = req.send().await.map_err(|e| classify_transport(&e))?;
        Self::read_json(resp).await
    }

    /// GET a JSON response.
    pub async fn get_json(
        &self,
        url: &str,
        bearer: Option<&str>,
    ) -> Result<Value, NormalizedError> {
        let mut req = self.http.get(url);
        if let Some(token) = bearer {
            req = req.bearer_auth(token);
        }
        let resp = req.send().await.map_err(|e| classify_transport(&e))?;
        Self::read_json(resp).await
    }

    async fn read_json(resp: reqwest::Response) -> Result<Value, NormalizedError> {
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(classify_http(status.as_u16(), &body));
        }
        resp.json::<Value>().await.map_err(|e| {
            NormalizedError::new(
                ErrorKind::Other,
                format!("backend returned malformed JSON: {e}"),
            )
        })
    }
}
