//! Cart Coordinator
//!
//! The one cart the UI talks to. It reads the session to decide where the
//! cart lives (guest storage or the server), routes every mutation there and
//! replaces its in-memory copy with the normalized result. A failed mutation
//! leaves the copy untouched and surfaces the error on the `error` channel.
//!
//! Mutations and auth syncs run one at a time under an async lock, so the
//! merge-or-append decision always sees the latest cart. Fetches carry a
//! request sequence number and a response that is no longer the newest is
//! dropped.

use std::future::Future;
use std::sync::{Arc, RwLock};
use tokio::sync::{broadcast, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::api::{CartGateway, CartSnapshot, NewCartLine, RequestSequence};
use crate::config::GuestCartPolicy;
use crate::domain::aggregates::{Cart, CartItem, Product};
use crate::domain::events::{CartEvent, DomainEvent};
use crate::domain::value_objects::{LineId, Money, Quantity};
use crate::guest::GuestCartStore;
use crate::normalize::{normalize, normalize_all, RawCartItem};
use crate::session::SessionStore;
use crate::{FieldErrors, Result, StorefrontError};

const EVENT_CAPACITY: usize = 64;

pub struct CartCoordinator {
    session: Arc<SessionStore>,
    gateway: Arc<dyn CartGateway>,
    guest: GuestCartStore,
    policy: GuestCartPolicy,
    currency: String,
    cart: RwLock<Cart>,
    loading: watch::Sender<bool>,
    error: watch::Sender<Option<StorefrontError>>,
    mutations: Mutex<()>,
    fetches: RequestSequence,
    events: broadcast::Sender<DomainEvent>,
}

impl CartCoordinator {
    pub fn new(session: Arc<SessionStore>, gateway: Arc<dyn CartGateway>, guest: GuestCartStore, policy: GuestCartPolicy) -> Self {
        let currency = guest.currency().to_string();
        let (loading, _) = watch::channel(false);
        let (error, _) = watch::channel(None);
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            session,
            gateway,
            guest,
            policy,
            cart: RwLock::new(Cart::new(&currency)),
            currency,
            loading,
            error,
            mutations: Mutex::new(()),
            fetches: RequestSequence::new(),
            events,
        }
    }

    // =========================================================================
    // Reads
    // =========================================================================

    pub fn cart(&self) -> Cart { self.read_cart(Cart::clone) }
    pub fn items(&self) -> Vec<CartItem> { self.read_cart(|c| c.items().to_vec()) }
    pub fn cart_total(&self) -> Money { self.read_cart(Cart::total) }
    pub fn cart_count(&self) -> u32 { self.read_cart(Cart::count) }
    pub fn is_authenticated(&self) -> bool { self.session.is_authenticated() }

    pub fn loading(&self) -> watch::Receiver<bool> { self.loading.subscribe() }
    pub fn error(&self) -> watch::Receiver<Option<StorefrontError>> { self.error.subscribe() }
    pub fn dismiss_error(&self) { self.error.send_replace(None); }

    pub fn subscribe_events(&self) -> broadcast::Receiver<DomainEvent> { self.events.subscribe() }
    pub fn event_sender(&self) -> broadcast::Sender<DomainEvent> { self.events.clone() }

    /// Events are fire-and-forget; nobody listening is fine.
    pub fn publish(&self, event: DomainEvent) { let _ = self.events.send(event); }

    // =========================================================================
    // Auth state
    // =========================================================================

    /// Loads the cart for the current auth state. Signed in, the guest cart
    /// is merged or discarded per policy and then the server cart fetched.
    pub async fn sync_with_auth(&self) -> Result<()> {
        let _guard = self.mutations.lock().await;
        if !self.session.is_authenticated() {
            // A server response still in flight belongs to the old session.
            self.fetches.next();
            self.loading.send_replace(false);
            self.apply(self.guest.load())?;
            self.publish_cart(CartEvent::Loaded { items: self.read_cart(|c| c.items().len()), authenticated: false });
            return Ok(());
        }

        let handed_over = match self.policy {
            GuestCartPolicy::Merge => self.merge_guest_cart().await,
            GuestCartPolicy::Discard => self.discard_guest_cart(),
        };
        let fetched = self.fetch_server().await;
        handed_over.and(fetched)
    }

    /// Re-syncs the cart on every auth state change until the handle is aborted.
    pub fn watch_auth(self: &Arc<Self>) -> JoinHandle<()> {
        let coordinator = Arc::clone(self);
        let mut changes = self.session.subscribe();
        tokio::spawn(async move {
            while changes.changed().await.is_ok() {
                let state = *changes.borrow_and_update();
                debug!(?state, "Auth state changed, syncing cart");
                if let Err(e) = coordinator.sync_with_auth().await {
                    warn!(error = %e, "Cart sync after auth change failed");
                }
            }
        })
    }

    /// Explicit re-read of the current cart source.
    pub async fn refresh_cart(&self) -> Result<()> {
        if self.session.is_authenticated() { self.fetch_server().await } else { self.apply(self.guest.load()) }
    }

    async fn merge_guest_cart(&self) -> Result<()> {
        let guest = self.guest.load()?;
        if guest.is_empty() { return Ok(()); }
        let mut merged = 0;
        for item in guest.items() {
            if let Err(e) = self.gateway.add(NewCartLine::from(item)).await {
                // Lines already merged are gone from the guest store; the rest stay for the next sync.
                warn!(error = %e, merged, remaining = guest.items().len() - merged, "Guest cart merge stopped");
                self.surface(&e);
                return Err(e);
            }
            self.guest.remove(&item.id)?;
            merged += 1;
        }
        self.guest.clear()?;
        info!(items = merged, "Guest cart merged into server cart");
        self.publish_cart(CartEvent::GuestCartMerged { items: merged });
        Ok(())
    }

    fn discard_guest_cart(&self) -> Result<()> {
        let items = self.guest.load()?.items().len();
        if items > 0 {
            self.guest.clear()?;
            info!(items, "Guest cart discarded on sign in");
            self.publish_cart(CartEvent::GuestCartDiscarded { items });
        }
        Ok(())
    }

    async fn fetch_server(&self) -> Result<()> {
        let seq = self.fetches.next();
        self.loading.send_replace(true);
        let result = self.gateway.fetch().await;
        if !self.fetches.is_latest(seq) {
            debug!(seq, "Dropping superseded cart response");
            return Ok(());
        }
        self.loading.send_replace(false);
        match result {
            Ok(snapshot) => {
                let cart = self.cart_from(snapshot);
                let items = cart.items().len();
                self.replace(cart);
                self.error.send_replace(None);
                self.publish_cart(CartEvent::Loaded { items, authenticated: true });
                Ok(())
            }
            Err(e) => {
                warn!(error = %e, "Server cart fetch failed");
                self.replace(Cart::new(&self.currency));
                self.surface(&e);
                Err(e)
            }
        }
    }

    // =========================================================================
    // Mutations
    // =========================================================================

    pub async fn add_to_cart(&self, product: &Product, color: Option<&str>, size: Option<&str>, quantity: i64) -> Result<()> {
        let quantity = Quantity::new(quantity).ok_or_else(invalid_quantity)?;
        let item = normalize(RawCartItem::from(&CartItem::from_product(product, color, size, quantity)));
        let key = item.variant_key();

        let _guard = self.mutations.lock().await;
        if self.session.is_authenticated() {
            let line = NewCartLine::from(&item);
            self.apply_remote(async { self.gateway.add(line).await.map(|s| self.cart_from(s)) }).await?;
        } else {
            self.apply(self.guest.add_item(item))?;
        }

        let line_id = self.read_cart(|c| c.items().iter().find(|i| i.variant_key() == key).map(|i| i.id.clone()));
        info!(product = %product.id, quantity = quantity.value(), "Added to cart");
        self.publish_cart(CartEvent::ItemAdded { line_id, product_id: product.id.clone(), quantity: quantity.value() });
        Ok(())
    }

    /// Anything below one removes the line.
    pub async fn update_quantity(&self, id: &LineId, quantity: i64) -> Result<()> {
        let Some(quantity) = Quantity::new(quantity) else { return self.remove_from_cart(id).await };

        let _guard = self.mutations.lock().await;
        if self.session.is_authenticated() {
            let request = self.gateway.update_quantity(id.clone(), quantity.value());
            self.apply_remote(async { request.await.map(|s| self.cart_from(s)) }).await?;
        } else {
            self.apply(self.guest.update_quantity(id, i64::from(quantity.value())))?;
        }
        self.publish_cart(CartEvent::QuantityChanged { line_id: id.clone(), quantity: quantity.value() });
        Ok(())
    }

    pub async fn remove_from_cart(&self, id: &LineId) -> Result<()> {
        let _guard = self.mutations.lock().await;
        if self.session.is_authenticated() {
            let request = self.gateway.remove(id.clone());
            self.apply_remote(async { request.await.map(|s| self.cart_from(s)) }).await?;
        } else {
            self.apply(self.guest.remove(id))?;
        }
        self.publish_cart(CartEvent::ItemRemoved { line_id: id.clone() });
        Ok(())
    }

    pub async fn clear_cart(&self) -> Result<()> {
        let _guard = self.mutations.lock().await;
        if self.session.is_authenticated() {
            let request = self.gateway.clear();
            self.apply_remote(async { request.await.map(|_| Cart::new(&self.currency)) }).await?;
        } else {
            self.apply(self.guest.clear().map(|_| Cart::new(&self.currency)))?;
        }
        info!("Cart cleared");
        self.publish_cart(CartEvent::Cleared);
        Ok(())
    }

    // =========================================================================
    // Internals
    // =========================================================================

    /// Server mutations answer with the whole cart; the newest answer wins
    /// and any fetch still in flight is superseded.
    async fn apply_remote(&self, request: impl Future<Output = Result<Cart>>) -> Result<()> {
        self.fetches.next();
        self.loading.send_replace(true);
        let result = request.await;
        self.loading.send_replace(false);
        self.apply(result)
    }

    fn apply(&self, result: Result<Cart>) -> Result<()> {
        match result {
            Ok(cart) => {
                self.replace(cart);
                self.error.send_replace(None);
                Ok(())
            }
            Err(e) => {
                self.surface(&e);
                Err(e)
            }
        }
    }

    /// Auth failures end the session instead of showing inline.
    fn surface(&self, error: &StorefrontError) {
        if matches!(error, StorefrontError::Auth { .. }) { return; }
        self.error.send_replace(Some(error.clone()));
    }

    fn cart_from(&self, snapshot: CartSnapshot) -> Cart {
        let items = normalize_all(snapshot.items.into_iter().filter_map(RawCartItem::server).collect());
        Cart::with_items(&self.currency, items)
    }

    fn replace(&self, cart: Cart) {
        match self.cart.write() {
            Ok(mut guard) => *guard = cart,
            Err(poisoned) => *poisoned.into_inner() = cart,
        }
    }

    fn read_cart<T>(&self, f: impl FnOnce(&Cart) -> T) -> T {
        match self.cart.read() {
            Ok(guard) => f(&guard),
            Err(poisoned) => f(&poisoned.into_inner()),
        }
    }

    fn publish_cart(&self, event: CartEvent) { self.publish(DomainEvent::Cart(event)); }
}

fn invalid_quantity() -> StorefrontError {
    let mut errors = FieldErrors::default();
    errors.insert("quantity", "Quantity must be at least 1");
    StorefrontError::Validation(errors)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::api::cart::MockCartGateway;
    use crate::domain::value_objects::ProductId;
    use crate::session::tests::valid_token;
    use crate::session::UserSession;
    use crate::storage::{MemoryStorage, SharedStorage, Storage, GUEST_CART_KEY};
    use async_trait::async_trait;
    use rust_decimal::Decimal;
    use serde_json::{json, Value};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    pub(crate) struct Harness {
        pub coordinator: Arc<CartCoordinator>,
        pub session: Arc<SessionStore>,
        pub storage: SharedStorage,
    }

    pub(crate) fn harness(gateway: impl CartGateway + 'static, policy: GuestCartPolicy) -> Harness {
        let storage: SharedStorage = Arc::new(MemoryStorage::new());
        let session = Arc::new(SessionStore::restore(storage.clone()).unwrap());
        let guest = GuestCartStore::new(storage.clone(), "INR");
        let coordinator = Arc::new(CartCoordinator::new(session.clone(), Arc::new(gateway), guest, policy));
        Harness { coordinator, session, storage }
    }

    pub(crate) fn sign_in(session: &SessionStore) {
        session.sign_in(UserSession::new(valid_token(), Some("asha@example.com".into()), None).unwrap()).unwrap();
    }

    pub(crate) fn snapshot(items: Value) -> CartSnapshot {
        CartSnapshot { items: items.as_array().cloned().unwrap_or_default() }
    }

    pub(crate) fn product(id: &str, price: i64) -> Product {
        Product {
            id: ProductId::new(id).unwrap(), name: format!("Product {id}"), brand: Some("GroomUp".into()),
            category: Some("Shirts".into()), description: None, price: Decimal::new(price, 0),
            images: vec![format!("/{id}.jpg")], image_url: None, colors: vec![], sizes: vec!["M".into()],
        }
    }

    #[tokio::test]
    async fn test_guest_cart_totals() {
        let h = harness(MockCartGateway::new(), GuestCartPolicy::Merge);
        h.storage.set(GUEST_CART_KEY, r#"[
            {"id": "a", "productId": "P1", "name": "Shirt", "price": 100, "quantity": 2},
            {"id": "b", "productId": "P2", "name": "Tee", "price": 50, "quantity": 1}
        ]"#).unwrap();
        h.coordinator.sync_with_auth().await.unwrap();
        assert_eq!(h.coordinator.cart_total().amount(), Decimal::new(250, 0));
        assert_eq!(h.coordinator.cart_count(), 3);
    }

    #[tokio::test]
    async fn test_rapid_guest_adds_of_same_variant_merge() {
        let mut gateway = MockCartGateway::new();
        gateway.expect_add().never();
        let h = harness(gateway, GuestCartPolicy::Merge);
        let shirt = product("101", 100);
        let (first, second) = tokio::join!(
            h.coordinator.add_to_cart(&shirt, Some("Blue"), Some("M"), 1),
            h.coordinator.add_to_cart(&shirt, Some("Blue"), Some("M"), 1),
        );
        first.unwrap();
        second.unwrap();
        assert_eq!(h.coordinator.items().len(), 1);
        assert_eq!(h.coordinator.cart_count(), 2);
    }

    #[tokio::test]
    async fn test_zero_quantity_is_rejected_on_add() {
        let h = harness(MockCartGateway::new(), GuestCartPolicy::Merge);
        let err = h.coordinator.add_to_cart(&product("101", 100), None, None, 0).await.unwrap_err();
        assert!(matches!(err, StorefrontError::Validation(_)));
        assert!(h.coordinator.cart().is_empty());
    }

    #[tokio::test]
    async fn test_server_quantity_floor_removes_line() {
        let mut gateway = MockCartGateway::new();
        gateway.expect_fetch().returning(|| Ok(snapshot(json!([{"id": 7, "productId": 3, "price": 100, "quantity": 2}]))));
        gateway.expect_update_quantity().never();
        gateway.expect_remove()
            .withf(|id| id.as_str() == "7")
            .times(2)
            .returning(|_| Ok(snapshot(json!([]))));
        let h = harness(gateway, GuestCartPolicy::Merge);
        sign_in(&h.session);
        h.coordinator.sync_with_auth().await.unwrap();
        assert_eq!(h.coordinator.cart_count(), 2);

        h.coordinator.update_quantity(&LineId::from("7"), 0).await.unwrap();
        assert!(h.coordinator.cart().is_empty());
        h.coordinator.update_quantity(&LineId::from("7"), -1).await.unwrap();
        assert!(h.coordinator.cart().is_empty());
    }

    #[tokio::test]
    async fn test_failed_mutation_keeps_cart_and_surfaces_error() {
        let mut gateway = MockCartGateway::new();
        gateway.expect_fetch().returning(|| Ok(snapshot(json!([{"id": 1, "productId": 3, "price": 100, "quantity": 1}]))));
        gateway.expect_add().returning(|_| Err(StorefrontError::Api { status: 409, message: "Out of stock".into() }));
        let h = harness(gateway, GuestCartPolicy::Merge);
        sign_in(&h.session);
        h.coordinator.sync_with_auth().await.unwrap();

        let err = h.coordinator.add_to_cart(&product("9", 10), Some("Red"), Some("L"), 1).await.unwrap_err();
        assert_eq!(err.to_string(), "Out of stock");
        assert_eq!(h.coordinator.items().len(), 1);
        let error = h.coordinator.error();
        assert_eq!(*error.borrow(), Some(err));

        h.coordinator.dismiss_error();
        assert_eq!(*error.borrow(), None);
    }

    #[tokio::test]
    async fn test_login_merges_guest_cart_into_server() {
        let mut gateway = MockCartGateway::new();
        gateway.expect_add()
            .withf(|line| line.product_id.as_str() == "101" && line.quantity == 2 && line.size.as_deref() == Some("M"))
            .times(1)
            .returning(|_| Ok(snapshot(json!([{"id": 55, "productId": 101, "price": 100, "quantity": 2}]))));
        gateway.expect_fetch().times(1).returning(|| Ok(snapshot(json!([
            {"id": 55, "productId": 101, "price": 100, "quantity": 2},
            {"id": 56, "productId": 202, "price": 40, "quantity": 1}
        ]))));
        let h = harness(gateway, GuestCartPolicy::Merge);
        h.coordinator.add_to_cart(&product("101", 100), Some("Blue"), Some("M"), 2).await.unwrap();
        let mut events = h.coordinator.subscribe_events();

        sign_in(&h.session);
        h.coordinator.sync_with_auth().await.unwrap();

        assert_eq!(h.storage.get(GUEST_CART_KEY).unwrap(), None);
        assert_eq!(h.coordinator.items().len(), 2);
        assert_eq!(h.coordinator.cart_total().amount(), Decimal::new(240, 0));
        assert_eq!(events.recv().await.unwrap(), DomainEvent::Cart(CartEvent::GuestCartMerged { items: 1 }));
    }

    #[tokio::test]
    async fn test_login_discard_policy_drops_guest_cart() {
        let mut gateway = MockCartGateway::new();
        gateway.expect_add().never();
        gateway.expect_fetch().returning(|| Ok(snapshot(json!([{"id": 56, "productId": 202, "price": 40, "quantity": 1}]))));
        let h = harness(gateway, GuestCartPolicy::Discard);
        h.coordinator.add_to_cart(&product("101", 100), Some("Blue"), Some("M"), 2).await.unwrap();

        sign_in(&h.session);
        h.coordinator.sync_with_auth().await.unwrap();

        assert_eq!(h.storage.get(GUEST_CART_KEY).unwrap(), None);
        assert_eq!(h.coordinator.items()[0].product_id.as_str(), "202");
        assert_eq!(h.coordinator.cart_count(), 1);
    }

    #[tokio::test]
    async fn test_fetch_failure_leaves_cart_empty() {
        let mut gateway = MockCartGateway::new();
        gateway.expect_fetch().returning(|| Err(StorefrontError::Network("connection refused".into())));
        let h = harness(gateway, GuestCartPolicy::Merge);
        sign_in(&h.session);
        assert!(h.coordinator.sync_with_auth().await.is_err());
        assert!(h.coordinator.cart().is_empty());
        assert_eq!(*h.coordinator.error().borrow(), Some(StorefrontError::Network("connection refused".into())));
        assert!(!*h.coordinator.loading().borrow());
    }

    #[tokio::test]
    async fn test_auth_failure_is_not_shown_inline() {
        let mut gateway = MockCartGateway::new();
        gateway.expect_fetch().returning(|| Err(StorefrontError::Auth { status: 401 }));
        let h = harness(gateway, GuestCartPolicy::Merge);
        sign_in(&h.session);
        assert!(h.coordinator.refresh_cart().await.is_err());
        assert_eq!(*h.coordinator.error().borrow(), None);
    }

    /// First fetch answers slowly with an old cart; later fetches answer at once.
    struct SlowFirstFetch(AtomicUsize);

    #[async_trait]
    impl CartGateway for SlowFirstFetch {
        async fn fetch(&self) -> Result<CartSnapshot> {
            if self.0.fetch_add(1, Ordering::SeqCst) == 0 {
                tokio::time::sleep(Duration::from_millis(500)).await;
                return Ok(snapshot(json!([{"id": 1, "productId": 1, "price": 10, "quantity": 9}])));
            }
            Ok(snapshot(json!([{"id": 2, "productId": 2, "price": 20, "quantity": 1}])))
        }
        async fn add(&self, _line: NewCartLine) -> Result<CartSnapshot> { Ok(CartSnapshot::default()) }
        async fn update_quantity(&self, _id: LineId, _quantity: u32) -> Result<CartSnapshot> { Ok(CartSnapshot::default()) }
        async fn remove(&self, _id: LineId) -> Result<CartSnapshot> { Ok(CartSnapshot::default()) }
        async fn clear(&self) -> Result<()> { Ok(()) }
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_fetch_response_is_dropped() {
        let h = harness(SlowFirstFetch(AtomicUsize::new(0)), GuestCartPolicy::Merge);
        sign_in(&h.session);
        let (older, newer) = tokio::join!(h.coordinator.refresh_cart(), async {
            tokio::time::sleep(Duration::from_millis(10)).await;
            h.coordinator.refresh_cart().await
        });
        older.unwrap();
        newer.unwrap();
        assert_eq!(h.coordinator.items()[0].product_id.as_str(), "2");
        assert_eq!(h.coordinator.cart_count(), 1);
    }

    #[tokio::test]
    async fn test_watch_auth_resyncs_on_logout() {
        let mut gateway = MockCartGateway::new();
        gateway.expect_fetch().returning(|| Ok(snapshot(json!([{"id": 2, "productId": 2, "price": 20, "quantity": 1}]))));
        let h = harness(gateway, GuestCartPolicy::Merge);
        sign_in(&h.session);
        h.coordinator.sync_with_auth().await.unwrap();
        let mut events = h.coordinator.subscribe_events();
        let watcher = h.coordinator.watch_auth();

        h.session.sign_out(crate::session::SignOutReason::UserRequested).unwrap();
        assert_eq!(events.recv().await.unwrap(), DomainEvent::Cart(CartEvent::Loaded { items: 0, authenticated: false }));
        assert!(h.coordinator.cart().is_empty());
        watcher.abort();
    }
}
