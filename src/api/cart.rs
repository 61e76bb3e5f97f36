//! Server cart gateway.
//!
//! Every mutating endpoint answers with the whole cart, never a delta, so
//! callers replace their local copy with the response.

use async_trait::async_trait;
use mockall::automock;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::api::ApiClient;
use crate::domain::aggregates::CartItem;
use crate::domain::value_objects::{LineId, ProductId};
use crate::Result;

/// Full cart as returned by the backend, items still in wire shape.
#[derive(Clone, Debug, Default, PartialEq, Deserialize)]
pub struct CartSnapshot {
    #[serde(default)]
    pub items: Vec<Value>,
}

/// Body of an add-to-cart request.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NewCartLine {
    pub product_id: ProductId,
    pub name: String,
    #[serde(with = "rust_decimal::serde::float")]
    pub price: Decimal,
    pub image: String,
    pub brand: String,
    pub category: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub color: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub volume: Option<String>,
    pub quantity: u32,
}

impl From<&CartItem> for NewCartLine {
    fn from(item: &CartItem) -> Self {
        Self {
            product_id: item.product_id.clone(),
            name: item.name.clone(),
            price: item.price,
            image: item.image.clone(),
            brand: item.brand.clone(),
            category: item.category.clone(),
            color: item.color.clone(),
            size: item.size.clone(),
            volume: item.volume.clone(),
            quantity: item.quantity.value(),
        }
    }
}

#[derive(Serialize)]
struct QuantityBody { quantity: u32 }

#[derive(Clone, Debug)]
pub struct HttpCartGateway {
    client: ApiClient,
}

impl HttpCartGateway {
    pub fn new(client: ApiClient) -> Self { Self { client } }
}

#[async_trait]
impl CartGateway for HttpCartGateway {
    async fn fetch(&self) -> Result<CartSnapshot> {
        self.client.get(&["cart"]).await
    }

    async fn add(&self, line: NewCartLine) -> Result<CartSnapshot> {
        self.client.post(&["cart", "add"], &line).await
    }

    async fn update_quantity(&self, id: LineId, quantity: u32) -> Result<CartSnapshot> {
        self.client.put(&["cart", "items", id.as_str()], &QuantityBody { quantity }).await
    }

    async fn remove(&self, id: LineId) -> Result<CartSnapshot> {
        self.client.delete(&["cart", "items", id.as_str()]).await
    }

    async fn clear(&self) -> Result<()> {
        let _: serde::de::IgnoredAny = self.client.delete(&["cart"]).await?;
        Ok(())
    }
}

#[automock]
#[async_trait]
pub trait CartGateway: Send + Sync {
    /// Current server cart of the signed-in user.
    async fn fetch(&self) -> Result<CartSnapshot>;

    /// Adds a line; the server merges same-variant lines.
    async fn add(&self, line: NewCartLine) -> Result<CartSnapshot>;

    async fn update_quantity(&self, id: LineId, quantity: u32) -> Result<CartSnapshot>;

    async fn remove(&self, id: LineId) -> Result<CartSnapshot>;

    async fn clear(&self) -> Result<()>;
}
