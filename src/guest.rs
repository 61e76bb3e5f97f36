//! Guest cart store
//!
//! Cart of a shopper who is not signed in, kept under [`GUEST_CART_KEY`].
//! Each operation re-reads storage before mutating and writes back before
//! returning, so the decision to merge or append always sees the newest
//! persisted state.

use serde_json::Value;
use tracing::{debug, warn};

use crate::domain::aggregates::{Cart, CartItem, Product};
use crate::domain::value_objects::{LineId, Quantity};
use crate::normalize::{normalize, normalize_all, RawCartItem};
use crate::storage::{SharedStorage, GUEST_CART_KEY};
use crate::{Result, StorefrontError};

#[derive(Clone)]
pub struct GuestCartStore {
    storage: SharedStorage,
    currency: String,
}

impl GuestCartStore {
    pub fn new(storage: SharedStorage, currency: &str) -> Self {
        Self { storage, currency: currency.to_string() }
    }

    pub fn currency(&self) -> &str { &self.currency }

    pub fn load(&self) -> Result<Cart> {
        let raw = match self.storage.get(GUEST_CART_KEY)? {
            Some(raw) => raw,
            None => return Ok(Cart::new(&self.currency)),
        };
        let values: Vec<Value> = match serde_json::from_str(&raw) {
            Ok(values) => values,
            Err(e) => {
                warn!(error = %e, "Guest cart in storage is unreadable, starting empty");
                return Ok(Cart::new(&self.currency));
            }
        };
        let items = normalize_all(values.into_iter().filter_map(RawCartItem::guest).collect());
        Ok(Cart::with_items(&self.currency, items))
    }

    /// Adds `quantity` of a product variant, merging into an existing line
    /// with the same product, colour and size or volume.
    pub fn add(&self, product: &Product, color: Option<&str>, size: Option<&str>, quantity: Quantity) -> Result<Cart> {
        let item = normalize(RawCartItem::from(&CartItem::from_product(product, color, size, quantity)));
        self.add_item(item)
    }

    /// Inserts an already normalized line.
    pub fn add_item(&self, item: CartItem) -> Result<Cart> {
        let mut cart = self.load()?;
        let product = item.product_id.clone();
        let line = cart.add_item(item);
        debug!(%line, %product, "Guest cart line added");
        self.save(&cart)?;
        Ok(cart)
    }

    /// Below one delegates to [`remove`](Self::remove).
    pub fn update_quantity(&self, id: &LineId, quantity: i64) -> Result<Cart> {
        if quantity < 1 { return self.remove(id); }
        let mut cart = self.load()?;
        if cart.update_quantity(id, quantity).is_err() {
            debug!(%id, "Guest cart line not found for quantity update");
        }
        self.save(&cart)?;
        Ok(cart)
    }

    /// Removing a line that is not there leaves the cart unchanged.
    pub fn remove(&self, id: &LineId) -> Result<Cart> {
        let mut cart = self.load()?;
        if cart.remove_item(id).is_err() {
            debug!(%id, "Guest cart line not found for removal");
        }
        self.save(&cart)?;
        Ok(cart)
    }

    pub fn clear(&self) -> Result<()> { self.storage.remove(GUEST_CART_KEY) }

    fn save(&self, cart: &Cart) -> Result<()> {
        let json = serde_json::to_string(cart.items()).map_err(|e| StorefrontError::Storage(e.to_string()))?;
        self.storage.set(GUEST_CART_KEY, &json)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::value_objects::ProductId;
    use crate::storage::{MemoryStorage, Storage};
    use rust_decimal::Decimal;
    use std::sync::Arc;

    fn shirt() -> Product {
        Product {
            id: ProductId::new("101").unwrap(), name: "Oxford Shirt".into(), brand: Some("GroomUp".into()),
            category: Some("Shirts".into()), description: None, price: Decimal::new(100, 0),
            images: vec!["/oxford.jpg".into()], image_url: None, colors: vec![], sizes: vec!["M".into()],
        }
    }

    fn store() -> (GuestCartStore, SharedStorage) {
        let storage: SharedStorage = Arc::new(MemoryStorage::new());
        (GuestCartStore::new(storage.clone(), "INR"), storage)
    }

    #[test]
    fn test_add_same_variant_twice_merges() {
        let (guest, _) = store();
        guest.add(&shirt(), Some("Blue"), Some("M"), Quantity::ONE).unwrap();
        let cart = guest.add(&shirt(), Some("Blue"), Some("M"), Quantity::new(2).unwrap()).unwrap();
        assert_eq!(cart.items().len(), 1);
        assert_eq!(cart.count(), 3);
    }

    #[test]
    fn test_mutations_are_persisted() {
        let (guest, storage) = store();
        let cart = guest.add(&shirt(), Some("Blue"), Some("M"), Quantity::ONE).unwrap();
        let id = cart.items()[0].id.clone();
        let reopened = GuestCartStore::new(storage.clone(), "INR");
        assert_eq!(reopened.load().unwrap().count(), 1);

        reopened.update_quantity(&id, 4).unwrap();
        assert_eq!(guest.load().unwrap().count(), 4);

        guest.update_quantity(&id, 0).unwrap();
        assert!(reopened.load().unwrap().is_empty());
    }

    #[test]
    fn test_remove_and_clear() {
        let (guest, storage) = store();
        let cart = guest.add(&shirt(), Some("Blue"), Some("M"), Quantity::ONE).unwrap();
        guest.add(&shirt(), Some("Red"), Some("M"), Quantity::ONE).unwrap();
        let cart_after = guest.remove(&cart.items()[0].id).unwrap();
        assert_eq!(cart_after.items().len(), 1);
        guest.clear().unwrap();
        assert_eq!(storage.get(GUEST_CART_KEY).unwrap(), None);
        assert!(guest.load().unwrap().is_empty());
    }

    #[test]
    fn test_loads_legacy_shapes_and_survives_garbage() {
        let (guest, storage) = store();
        storage.set(GUEST_CART_KEY, r#"[{"id": 1718000000000, "productId": 7, "name": "Tee", "price": 499, "quantity": 2}, 5, {"productId": 8, "quantity": 0}]"#).unwrap();
        let cart = guest.load().unwrap();
        assert_eq!(cart.items().len(), 1);
        assert_eq!(cart.items()[0].id.as_str(), "1718000000000");
        assert_eq!(cart.total().amount(), Decimal::new(998, 0));

        storage.set(GUEST_CART_KEY, "not json").unwrap();
        assert!(guest.load().unwrap().is_empty());
    }
}
