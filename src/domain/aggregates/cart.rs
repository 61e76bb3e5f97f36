//! Cart Aggregate

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use crate::domain::aggregates::product::{Product, VariantKind};
use crate::domain::value_objects::{LineId, Money, ProductId, Quantity};

/// Canonical cart line. Every source is normalized into this shape before it
/// reaches a [`Cart`].
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CartItem {
    pub id: LineId,
    pub product_id: ProductId,
    pub name: String,
    pub brand: String,
    pub category: String,
    #[serde(with = "rust_decimal::serde::float")]
    pub price: Decimal,
    pub quantity: Quantity,
    pub image: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub color: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub volume: Option<String>,
}

/// The triple that must be unique within a cart.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct VariantKey {
    pub product_id: ProductId,
    pub color: Option<String>,
    pub size_or_volume: Option<String>,
}

impl CartItem {
    pub fn variant_kind(&self) -> VariantKind { VariantKind::for_category(Some(&self.category)) }

    pub fn variant_key(&self) -> VariantKey {
        match self.variant_kind() {
            VariantKind::Volume => VariantKey { product_id: self.product_id.clone(), color: None, size_or_volume: self.volume.clone() },
            VariantKind::ColorAndSize => VariantKey { product_id: self.product_id.clone(), color: self.color.clone(), size_or_volume: self.size.clone() },
        }
    }

    pub fn line_total(&self) -> Decimal { self.price * Decimal::from(self.quantity.value()) }

    /// Builds a new guest line from a catalog product and the shopper's picks.
    /// For serums the picked size is the volume; for everything else a missing
    /// colour or size falls back to the product's first option.
    pub fn from_product(product: &Product, color: Option<&str>, size: Option<&str>, quantity: Quantity) -> Self {
        let pick = |s: Option<&str>| s.map(str::trim).filter(|s| !s.is_empty()).map(str::to_string);
        let (color, size, volume) = match product.variant_kind() {
            VariantKind::Volume => (None, None, pick(size)),
            VariantKind::ColorAndSize => (
                pick(color).or_else(|| product.colors.first().map(|c| c.name.clone())).or_else(|| Some("Default".to_string())),
                pick(size).or_else(|| product.sizes.first().cloned()),
                None,
            ),
        };
        let image = product.image_for_color(color.as_deref()).unwrap_or_default().to_string();
        Self {
            id: LineId::generate(),
            product_id: product.id.clone(),
            name: product.name.clone(),
            brand: product.brand.clone().unwrap_or_default(),
            category: product.category.clone().unwrap_or_default(),
            price: product.price,
            quantity,
            image,
            color,
            size,
            volume,
        }
    }
}

#[derive(Clone, Debug)]
pub struct Cart {
    items: Vec<CartItem>,
    currency: String,
    updated_at: DateTime<Utc>,
}

impl Cart {
    pub fn new(currency: &str) -> Self {
        Self { items: vec![], currency: currency.to_string(), updated_at: Utc::now() }
    }

    pub fn with_items(currency: &str, items: Vec<CartItem>) -> Self {
        let mut cart = Self::new(currency);
        for item in items { cart.add_item(item); }
        cart
    }

    pub fn items(&self) -> &[CartItem] { &self.items }
    pub fn currency(&self) -> &str { &self.currency }
    pub fn updated_at(&self) -> DateTime<Utc> { self.updated_at }
    pub fn is_empty(&self) -> bool { self.items.is_empty() }
    pub fn find(&self, id: &LineId) -> Option<&CartItem> { self.items.iter().find(|i| &i.id == id) }

    /// Σ(price × quantity)
    pub fn total(&self) -> Money {
        Money::new(self.items.iter().map(CartItem::line_total).sum(), &self.currency)
    }

    /// Σ(quantity)
    pub fn count(&self) -> u32 { self.items.iter().map(|i| i.quantity.value()).sum() }

    /// Adds a line, or bumps the quantity of the line with the same variant key.
    /// Returns the id of the line that now holds the item.
    pub fn add_item(&mut self, item: CartItem) -> LineId {
        let key = item.variant_key();
        let id = if let Some(existing) = self.items.iter_mut().find(|i| i.variant_key() == key) {
            existing.quantity = existing.quantity.add(item.quantity);
            existing.id.clone()
        } else {
            let id = item.id.clone();
            self.items.push(item);
            id
        };
        self.touch();
        id
    }

    /// Sets a line's quantity; anything below one removes the line.
    pub fn update_quantity(&mut self, id: &LineId, quantity: i64) -> Result<(), CartError> {
        let Some(quantity) = Quantity::new(quantity) else { return self.remove_item(id) };
        let item = self.items.iter_mut().find(|i| &i.id == id).ok_or(CartError::ItemNotFound)?;
        item.quantity = quantity;
        self.touch();
        Ok(())
    }

    pub fn remove_item(&mut self, id: &LineId) -> Result<(), CartError> {
        let before = self.items.len();
        self.items.retain(|i| &i.id != id);
        if self.items.len() == before { return Err(CartError::ItemNotFound); }
        self.touch();
        Ok(())
    }

    pub fn clear(&mut self) { self.items.clear(); self.touch(); }

    fn touch(&mut self) { self.updated_at = Utc::now(); }
}

#[derive(Debug, Clone, PartialEq, Eq)] pub enum CartError { ItemNotFound }
impl std::error::Error for CartError {}
impl std::fmt::Display for CartError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result { write!(f, "Item not found") }
}
