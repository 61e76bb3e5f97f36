//! Storefront client driver
//!
//! Restores the local session and reports on it from the command line:
//!
//! ```text
//! storefront [cart]          current cart and checkout totals
//! storefront search <terms>  catalog search, remembered in recent searches
//! storefront orders          orders of the signed-in user
//! ```

use anyhow::{bail, Result};
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use storefront_core::api::catalog::ProductSearch;
use storefront_core::api::{ApiClient, HttpCartGateway, HttpCatalogApi, HttpOrdersApi, OrdersApi};
use storefront_core::checkout::DeliveryMethod;
use storefront_core::guest::GuestCartStore;
use storefront_core::session::SessionStore;
use storefront_core::storage::{FileStorage, SearchHistory, SharedStorage};
use storefront_core::{CartCoordinator, StorefrontConfig};

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = StorefrontConfig::from_env()?;
    let storage: SharedStorage = Arc::new(FileStorage::open(config.storage_path.clone())?);
    let session = Arc::new(SessionStore::restore(storage.clone())?);
    let client = ApiClient::new(&config.api_base_url, config.request_timeout, session.clone())?;
    info!(state = ?session.state(), storage = %config.storage_path.display(), "Session restored");

    let args: Vec<String> = std::env::args().skip(1).collect();
    match args.first().map(String::as_str) {
        None | Some("cart") => show_cart(&config, storage, session, client).await,
        Some("search") => search(storage, client, &config.currency, &args[1..].join(" ")).await,
        Some("orders") => list_orders(session, client).await,
        Some(other) => bail!("unknown command '{other}', expected cart, search or orders"),
    }
}

async fn show_cart(config: &StorefrontConfig, storage: SharedStorage, session: Arc<SessionStore>, client: ApiClient) -> Result<()> {
    let coordinator = CartCoordinator::new(
        session,
        Arc::new(HttpCartGateway::new(client)),
        GuestCartStore::new(storage, &config.currency),
        config.guest_cart_policy,
    );
    if let Err(e) = coordinator.sync_with_auth().await {
        warn!(error = %e, "Cart could not be loaded");
    }

    let cart = coordinator.cart();
    for item in cart.items() {
        let variant = item.volume.as_deref().or(item.size.as_deref()).unwrap_or("-");
        info!(line = %item.id, product = %item.product_id, name = %item.name, variant, quantity = item.quantity.value(), price = %item.price, "Cart line");
    }
    let fees = config.fee_policy();
    for delivery in [DeliveryMethod::Standard, DeliveryMethod::Express] {
        let totals = fees.totals(&cart.total(), delivery);
        info!(?delivery, subtotal = %totals.subtotal, fee = %totals.delivery_fee, total = %totals.total, "Checkout totals");
    }
    info!(authenticated = coordinator.is_authenticated(), items = cart.count(), "Cart loaded");
    Ok(())
}

async fn search(storage: SharedStorage, client: ApiClient, currency: &str, query: &str) -> Result<()> {
    let history = SearchHistory::new(storage);
    if query.trim().is_empty() {
        info!(recent = ?history.terms()?, "Recent searches");
        return Ok(());
    }
    let search = ProductSearch::new(Arc::new(HttpCatalogApi::new(client)));
    let products = search.search(query).await?.unwrap_or_default();
    history.record(query)?;
    for product in &products {
        info!(id = %product.id, name = %product.name, price = %product.unit_price(currency), "Match");
    }
    info!(query, matches = products.len(), "Search finished");
    Ok(())
}

async fn list_orders(session: Arc<SessionStore>, client: ApiClient) -> Result<()> {
    if !session.is_authenticated() {
        bail!("sign in to see orders");
    }
    let orders = HttpOrdersApi::new(client).list().await?;
    for order in &orders {
        info!(id = %order.id, status = ?order.status, total = ?order.total_price, lines = order.items.len(), "Order");
    }
    info!(count = orders.len(), "Orders loaded");
    Ok(())
}
