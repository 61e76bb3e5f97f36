//! REST backend access
//!
//! [`ApiClient`] owns the HTTP plumbing shared by every endpoint group:
//! base URL, bearer header, status-to-error mapping and the session teardown
//! rule. Each endpoint group is a trait with an HTTP implementation so the
//! coordinator and checkout can be driven by mocks.

use reqwest::{Client, Method, RequestBuilder, StatusCode, Url};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::session::{SessionStore, SignOutReason};
use crate::{Result, StorefrontError};

pub mod auth;
pub mod cart;
pub mod catalog;
pub mod orders;
pub mod payments;

pub use auth::{AuthApi, HttpAuthApi};
pub use cart::{CartGateway, CartSnapshot, HttpCartGateway, NewCartLine};
pub use catalog::{CatalogApi, HttpCatalogApi};
pub use orders::{HttpOrdersApi, OrdersApi};
pub use payments::{HttpPaymentsApi, PaymentSession, PaymentsApi, VerificationRequest};

#[derive(Clone, Debug)]
pub struct ApiClient {
    http: Client,
    base_url: Url,
    session: Arc<SessionStore>,
}

impl ApiClient {
    pub fn new(base_url: &str, timeout: Duration, session: Arc<SessionStore>) -> Result<Self> {
        let base_url = Url::parse(base_url.trim())
            .ok()
            .filter(|url| !url.cannot_be_a_base())
            .ok_or_else(|| StorefrontError::Config(format!("invalid API base URL '{base_url}'")))?;
        let http = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| StorefrontError::Config(format!("http client: {e}")))?;
        Ok(Self { http, base_url, session })
    }

    pub fn session(&self) -> &Arc<SessionStore> { &self.session }

    pub(crate) async fn get<T: DeserializeOwned>(&self, path: &[&str]) -> Result<T> {
        self.send(Method::GET, path, |b| b).await
    }

    pub(crate) async fn get_query<T: DeserializeOwned, Q: Serialize + ?Sized>(&self, path: &[&str], query: &Q) -> Result<T> {
        self.send(Method::GET, path, |b| b.query(query)).await
    }

    pub(crate) async fn post<B: Serialize + ?Sized, T: DeserializeOwned>(&self, path: &[&str], body: &B) -> Result<T> {
        self.send(Method::POST, path, |b| b.json(body)).await
    }

    pub(crate) async fn put<B: Serialize + ?Sized, T: DeserializeOwned>(&self, path: &[&str], body: &B) -> Result<T> {
        self.send(Method::PUT, path, |b| b.json(body)).await
    }

    pub(crate) async fn delete<T: DeserializeOwned>(&self, path: &[&str]) -> Result<T> {
        self.send(Method::DELETE, path, |b| b).await
    }

    /// Base URL plus one percent-encoded segment per element, so an id
    /// containing `/` or `?` stays inside its own segment.
    fn url(&self, path: &[&str]) -> Result<Url> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| StorefrontError::Config(format!("API base URL '{}' cannot carry a path", self.base_url)))?
            .pop_if_empty()
            .extend(path);
        Ok(url)
    }

    async fn send<T: DeserializeOwned>(
        &self,
        method: Method,
        path: &[&str],
        prepare: impl FnOnce(RequestBuilder) -> RequestBuilder,
    ) -> Result<T> {
        let url = self.url(path)?;
        let builder = prepare(self.http.request(method.clone(), url.clone()));
        self.execute(method, url.path(), builder).await
    }

    async fn execute<T: DeserializeOwned>(&self, method: Method, path: &str, builder: RequestBuilder) -> Result<T> {
        let token = self.session.token();
        let authenticated = token.is_some();
        let builder = match token {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        };

        debug!(%method, path, authenticated, "API request");
        let response = builder.send().await.map_err(|e| {
            warn!(%method, path, error = %e, "API request did not complete");
            if e.is_timeout() { StorefrontError::Network("request timed out".into()) } else { StorefrontError::Network(e.to_string()) }
        })?;

        let status = response.status();
        let body = response.text().await.map_err(|e| StorefrontError::Network(e.to_string()))?;

        if matches!(status, StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN) && authenticated {
            warn!(%method, path, status = status.as_u16(), "Session rejected, signing out");
            if let Err(e) = self.session.sign_out(SignOutReason::Rejected { status: status.as_u16() }) {
                warn!(error = %e, "Failed to clear rejected session");
            }
            return Err(StorefrontError::Auth { status: status.as_u16() });
        }

        if !status.is_success() {
            let message = extract_message(&body, status);
            warn!(%method, path, status = status.as_u16(), %message, "API request failed");
            return Err(StorefrontError::Api { status: status.as_u16(), message });
        }

        let body = if body.trim().is_empty() { "null" } else { body.as_str() };
        serde_json::from_str(body).map_err(|e| StorefrontError::Decode(format!("{method} {path}: {e}")))
    }
}

/// Error text from a failed response: JSON `message`, `error` or `detail`,
/// then the raw body, then the status reason.
pub fn extract_message(body: &str, status: StatusCode) -> String {
    if let Ok(serde_json::Value::Object(map)) = serde_json::from_str::<serde_json::Value>(body) {
        let found = ["message", "error", "detail"]
            .iter()
            .find_map(|k| map.get(*k).and_then(|v| v.as_str()).map(str::trim).filter(|s| !s.is_empty()));
        if let Some(message) = found { return message.to_string(); }
    } else if !body.trim().is_empty() {
        return body.trim().chars().take(200).collect();
    }
    status.canonical_reason().unwrap_or("Request failed").to_string()
}

/// Hands out increasing request numbers so a late response to an older
/// request can be recognised and dropped.
#[derive(Debug, Default)]
pub struct RequestSequence(AtomicU64);

impl RequestSequence {
    pub fn new() -> Self { Self::default() }
    pub fn next(&self) -> u64 { self.0.fetch_add(1, Ordering::SeqCst) + 1 }
    pub fn is_latest(&self, seq: u64) -> bool { self.0.load(Ordering::SeqCst) == seq }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStorage;

    #[test]
    fn test_message_extraction_chain() {
        assert_eq!(extract_message(r#"{"message":"Out of stock"}"#, StatusCode::CONFLICT), "Out of stock");
        assert_eq!(extract_message(r#"{"message":"","error":"Bad product"}"#, StatusCode::BAD_REQUEST), "Bad product");
        assert_eq!(extract_message(r#"{"detail":"nope"}"#, StatusCode::BAD_REQUEST), "nope");
        assert_eq!(extract_message("plain failure", StatusCode::BAD_GATEWAY), "plain failure");
        assert_eq!(extract_message("{}", StatusCode::NOT_FOUND), "Not Found");
        assert_eq!(extract_message("", StatusCode::INTERNAL_SERVER_ERROR), "Internal Server Error");
    }

    fn client(base_url: &str) -> Result<ApiClient> {
        let session = SessionStore::restore(Arc::new(MemoryStorage::new()))?;
        ApiClient::new(base_url, Duration::from_secs(1), Arc::new(session))
    }

    #[test]
    fn test_ids_stay_inside_their_path_segment() {
        let client = client("http://localhost:8080/api/").unwrap();
        let url = client.url(&["cart", "items", "7/../../orders?all=1"]).unwrap();
        assert_eq!(url.path(), "/api/cart/items/7%2F..%2F..%2Forders%3Fall=1");
        assert_eq!(url.query(), None);
        assert_eq!(client.url(&["orders"]).unwrap().as_str(), "http://localhost:8080/api/orders");
    }

    #[test]
    fn test_invalid_base_url_is_a_config_error() {
        assert!(matches!(client("localhost:8080/api"), Err(StorefrontError::Config(_))));
        assert!(matches!(client("not a url"), Err(StorefrontError::Config(_))));
    }

    #[test]
    fn test_request_sequence() {
        let seq = RequestSequence::new();
        let first = seq.next();
        let second = seq.next();
        assert!(!seq.is_latest(first));
        assert!(seq.is_latest(second));
    }
}
