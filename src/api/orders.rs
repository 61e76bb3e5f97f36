//! Orders endpoints.

use async_trait::async_trait;
use mockall::automock;
use serde::Serialize;

use crate::api::ApiClient;
use crate::domain::aggregates::{Order, OrderId};
use crate::Result;

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct CreateOrderBody<'a> { shipping_address: &'a str }

#[derive(Clone, Debug)]
pub struct HttpOrdersApi {
    client: ApiClient,
}

impl HttpOrdersApi {
    pub fn new(client: ApiClient) -> Self { Self { client } }
}

#[async_trait]
impl OrdersApi for HttpOrdersApi {
    async fn create(&self, shipping_address: String) -> Result<Order> {
        self.client.post(&["orders"], &CreateOrderBody { shipping_address: &shipping_address }).await
    }

    async fn get(&self, id: OrderId) -> Result<Order> {
        self.client.get(&["orders", id.as_str()]).await
    }

    async fn list(&self) -> Result<Vec<Order>> {
        self.client.get(&["orders"]).await
    }
}

#[automock]
#[async_trait]
pub trait OrdersApi: Send + Sync {
    /// Creates an order from the caller's current server cart.
    async fn create(&self, shipping_address: String) -> Result<Order>;

    async fn get(&self, id: OrderId) -> Result<Order>;

    /// Orders of the signed-in user, newest first.
    async fn list(&self) -> Result<Vec<Order>>;
}
