//! Authentication endpoints.

use async_trait::async_trait;
use mockall::automock;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::api::ApiClient;
use crate::Result;

#[derive(Clone, Serialize)]
pub struct Credentials {
    pub email: String,
    pub password: String,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials").field("email", &self.email).finish_non_exhaustive()
    }
}

#[derive(Clone, Serialize)]
pub struct Registration {
    pub name: String,
    pub email: String,
    pub password: String,
}

impl fmt::Debug for Registration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registration").field("name", &self.name).field("email", &self.email).finish_non_exhaustive()
    }
}

#[derive(Clone, Deserialize)]
pub struct AuthResponse {
    pub token: String,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
}

impl fmt::Debug for AuthResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthResponse").field("email", &self.email).field("name", &self.name).finish_non_exhaustive()
    }
}

#[derive(Clone, Debug)]
pub struct HttpAuthApi {
    client: ApiClient,
}

impl HttpAuthApi {
    pub fn new(client: ApiClient) -> Self { Self { client } }
}

#[async_trait]
impl AuthApi for HttpAuthApi {
    async fn login(&self, credentials: Credentials) -> Result<AuthResponse> {
        self.client.post(&["auth", "login"], &credentials).await
    }

    async fn register(&self, registration: Registration) -> Result<AuthResponse> {
        self.client.post(&["auth", "register"], &registration).await
    }

    async fn logout(&self) -> Result<()> {
        let _: serde::de::IgnoredAny = self.client.post(&["auth", "logout"], &serde_json::json!({})).await?;
        Ok(())
    }
}

#[automock]
#[async_trait]
pub trait AuthApi: Send + Sync {
    async fn login(&self, credentials: Credentials) -> Result<AuthResponse>;
    async fn register(&self, registration: Registration) -> Result<AuthResponse>;
    async fn logout(&self) -> Result<()>;
}
