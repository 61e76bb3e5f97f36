//! Catalog reads.

use async_trait::async_trait;
use mockall::automock;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::debug;

use crate::api::{ApiClient, RequestSequence};
use crate::domain::aggregates::Product;
use crate::domain::value_objects::ProductId;
use crate::Result;

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct ProductQuery {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub page: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size: Option<u32>,
}

/// The list endpoints answer either with a bare array or a page object.
#[derive(Deserialize)]
#[serde(untagged)]
enum ProductList {
    Plain(Vec<Product>),
    Paged {
        #[serde(alias = "content", alias = "items")]
        data: Vec<Product>,
    },
}

impl From<ProductList> for Vec<Product> {
    fn from(list: ProductList) -> Self {
        match list { ProductList::Plain(items) | ProductList::Paged { data: items } => items }
    }
}

#[derive(Clone, Debug)]
pub struct HttpCatalogApi {
    client: ApiClient,
}

impl HttpCatalogApi {
    pub fn new(client: ApiClient) -> Self { Self { client } }
}

#[async_trait]
impl CatalogApi for HttpCatalogApi {
    async fn list(&self, query: ProductQuery) -> Result<Vec<Product>> {
        let list: ProductList = self.client.get_query(&["products"], &query).await?;
        Ok(list.into())
    }

    async fn get(&self, id: ProductId) -> Result<Product> {
        self.client.get(&["products", id.as_str()]).await
    }

    async fn search(&self, query: String) -> Result<Vec<Product>> {
        let list: ProductList = self.client.get_query(&["products", "search"], &[("query", query.as_str())]).await?;
        Ok(list.into())
    }
}

#[automock]
#[async_trait]
pub trait CatalogApi: Send + Sync {
    async fn list(&self, query: ProductQuery) -> Result<Vec<Product>>;
    async fn get(&self, id: ProductId) -> Result<Product>;
    async fn search(&self, query: String) -> Result<Vec<Product>>;
}

/// Search-as-you-type: only the response to the newest query is delivered.
#[derive(Clone)]
pub struct ProductSearch {
    api: Arc<dyn CatalogApi>,
    sequence: Arc<RequestSequence>,
}

impl ProductSearch {
    pub fn new(api: Arc<dyn CatalogApi>) -> Self {
        Self { api, sequence: Arc::new(RequestSequence::new()) }
    }

    /// `Ok(None)` when a newer search was started before this one resolved.
    pub async fn search(&self, query: &str) -> Result<Option<Vec<Product>>> {
        let seq = self.sequence.next();
        let query = query.trim();
        if query.is_empty() { return Ok(Some(Vec::new())); }
        let results = self.api.search(query.to_string()).await;
        if !self.sequence.is_latest(seq) {
            debug!(seq, query, "Dropping superseded search response");
            return Ok(None);
        }
        results.map(Some)
    }
}
