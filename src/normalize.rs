//! Item normalization
//!
//! Guest storage and the cart endpoints describe the same line with
//! different field names, and either may leave fields out. Each source is
//! captured as its own loosely-typed record and mapped to [`CartItem`] by one
//! total function, so a malformed record degrades to defaults instead of
//! failing the whole cart.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use rust_decimal::Decimal;
use serde::Deserialize;
use serde_json::Value;
use std::str::FromStr;
use tracing::warn;

use crate::domain::aggregates::{CartItem, VariantKind};
use crate::domain::value_objects::{LineId, ProductId, Quantity};

pub const UNNAMED_PRODUCT: &str = "Unnamed Product";

/// A cart line as stored by the guest cart.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct GuestItem {
    pub id: Option<Value>,
    pub product_id: Option<Value>,
    pub product_name: Option<Value>,
    pub name: Option<Value>,
    pub brand: Option<Value>,
    pub category: Option<Value>,
    pub price: Option<Value>,
    pub quantity: Option<Value>,
    pub image: Option<Value>,
    pub image_url: Option<Value>,
    pub color: Option<Value>,
    pub size: Option<Value>,
    pub volume: Option<Value>,
}

/// A cart line as returned by the cart endpoints.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServerItem {
    pub id: Option<Value>,
    pub cart_item_id: Option<Value>,
    pub product_id: Option<Value>,
    pub product_name: Option<Value>,
    pub name: Option<Value>,
    pub brand: Option<Value>,
    pub category: Option<Value>,
    pub price: Option<Value>,
    pub unit_price: Option<Value>,
    pub line_total: Option<Value>,
    pub quantity: Option<Value>,
    pub product_image: Option<Value>,
    pub image: Option<Value>,
    pub image_url: Option<Value>,
    pub color: Option<Value>,
    pub size: Option<Value>,
    pub volume: Option<Value>,
}

#[derive(Clone, Debug)]
pub enum RawCartItem {
    Guest(GuestItem),
    Server(ServerItem),
}

impl RawCartItem {
    pub fn guest(value: Value) -> Option<Self> { parse(value).map(Self::Guest) }
    pub fn server(value: Value) -> Option<Self> { parse(value).map(Self::Server) }
}

fn parse<T: for<'de> Deserialize<'de>>(value: Value) -> Option<T> {
    match serde_json::from_value(value) {
        Ok(item) => Some(item),
        Err(e) => {
            warn!(error = %e, "Skipping cart entry that is not an object");
            None
        }
    }
}

impl From<&CartItem> for RawCartItem {
    fn from(item: &CartItem) -> Self {
        let text = |s: &str| Some(Value::String(s.to_string()));
        RawCartItem::Guest(GuestItem {
            id: text(item.id.as_str()),
            product_id: text(item.product_id.as_str()),
            product_name: None,
            name: text(&item.name),
            brand: text(&item.brand),
            category: text(&item.category),
            price: text(&item.price.to_string()),
            quantity: Some(Value::from(item.quantity.value())),
            image: text(&item.image),
            image_url: None,
            color: item.color.as_deref().and_then(text),
            size: item.size.as_deref().and_then(text),
            volume: item.volume.as_deref().and_then(text),
        })
    }
}

/// Maps any raw item to the canonical shape. Never fails.
pub fn normalize(raw: RawCartItem) -> CartItem {
    let fields = match raw {
        RawCartItem::Guest(g) => Fields {
            id: text_of(&[&g.id]),
            product_id: text_of(&[&g.product_id, &g.id]),
            name: text_of(&[&g.product_name, &g.name]),
            brand: text_of(&[&g.brand]),
            category: text_of(&[&g.category]),
            price: decimal_of(&[&g.price]),
            quantity: quantity_of(&g.quantity),
            image: text_of(&[&g.image, &g.image_url]),
            color: text_of(&[&g.color]),
            size: text_of(&[&g.size]),
            volume: text_of(&[&g.volume]),
        },
        RawCartItem::Server(s) => {
            let quantity = quantity_of(&s.quantity);
            let per_unit = decimal_of(&[&s.line_total])
                .zip(quantity.filter(|q| *q > 0))
                .map(|(total, q)| total / Decimal::from(q));
            Fields {
                id: text_of(&[&s.id, &s.cart_item_id, &s.product_id]),
                product_id: text_of(&[&s.product_id]),
                name: text_of(&[&s.product_name, &s.name]),
                brand: text_of(&[&s.brand]),
                category: text_of(&[&s.category]),
                price: decimal_of(&[&s.price, &s.unit_price]).or(per_unit),
                quantity,
                image: text_of(&[&s.product_image, &s.image, &s.image_url]),
                color: text_of(&[&s.color]),
                size: text_of(&[&s.size]),
                volume: text_of(&[&s.volume]),
            }
        }
    };
    fields.into_item()
}

/// Normalizes a list, dropping lines whose quantity is explicitly below one.
pub fn normalize_all(raw: Vec<RawCartItem>) -> Vec<CartItem> {
    raw.into_iter()
        .filter(|r| {
            let q = match r { RawCartItem::Guest(g) => &g.quantity, RawCartItem::Server(s) => &s.quantity };
            !matches!(quantity_of(q), Some(n) if n < 1)
        })
        .map(normalize)
        .collect()
}

struct Fields {
    id: Option<String>,
    product_id: Option<String>,
    name: Option<String>,
    brand: Option<String>,
    category: Option<String>,
    price: Option<Decimal>,
    quantity: Option<i64>,
    image: Option<String>,
    color: Option<String>,
    size: Option<String>,
    volume: Option<String>,
}

impl Fields {
    fn into_item(self) -> CartItem {
        let category = self.category.unwrap_or_default();
        let product_id = self.product_id.and_then(|p| ProductId::new(p).ok()).unwrap_or_else(ProductId::unknown);
        let (color, size, volume) = match VariantKind::for_category(Some(&category)) {
            VariantKind::Volume => (None, None, self.volume.or(self.size)),
            VariantKind::ColorAndSize => (self.color, self.size, None),
        };
        let id = self.id.map(LineId::from).unwrap_or_else(|| {
            let attr = volume.as_deref().or(size.as_deref()).unwrap_or("");
            LineId::from(format!("{}:{}:{}", product_id, color.as_deref().unwrap_or(""), attr))
        });
        let image = self.image.unwrap_or_else(|| placeholder_image(&category));
        CartItem {
            id,
            product_id,
            name: self.name.unwrap_or_else(|| UNNAMED_PRODUCT.to_string()),
            brand: self.brand.unwrap_or_default(),
            category,
            price: self.price.filter(|p| !p.is_sign_negative()).unwrap_or(Decimal::ZERO).normalize(),
            quantity: self.quantity.and_then(Quantity::saturating).unwrap_or(Quantity::ONE),
            image,
            color,
            size,
            volume,
        }
    }
}

/// Inline SVG shown when an item has no usable image.
pub fn placeholder_image(category: &str) -> String {
    let label = match category.trim() {
        "" => "Product".to_string(),
        c => c.chars().filter(|ch| ch.is_alphanumeric() || *ch == ' ').collect(),
    };
    let svg = format!(
        "<svg width=\"300\" height=\"400\" xmlns=\"http://www.w3.org/2000/svg\"><rect width=\"100%\" height=\"100%\" fill=\"#f5f5f5\"/>\
         <text x=\"50%\" y=\"50%\" font-family=\"Arial, sans-serif\" font-size=\"12\" fill=\"#999\" text-anchor=\"middle\" dominant-baseline=\"middle\">{label}</text></svg>"
    );
    format!("data:image/svg+xml;base64,{}", BASE64.encode(svg))
}

fn text_of(candidates: &[&Option<Value>]) -> Option<String> {
    candidates.iter().find_map(|v| match v {
        Some(Value::String(s)) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Some(Value::Number(n)) => Some(n.to_string()),
        _ => None,
    })
}

fn decimal_of(candidates: &[&Option<Value>]) -> Option<Decimal> {
    candidates.iter().find_map(|v| match v {
        Some(Value::Number(n)) => {
            let s = n.to_string();
            Decimal::from_str(&s).or_else(|_| Decimal::from_scientific(&s)).ok()
        }
        Some(Value::String(s)) => Decimal::from_str(s.trim()).ok(),
        _ => None,
    })
}

fn quantity_of(value: &Option<Value>) -> Option<i64> {
    match value {
        Some(Value::Number(n)) => n.as_i64().or_else(|| n.as_f64().map(|f| f.trunc() as i64)),
        Some(Value::String(s)) => s.trim().parse().ok(),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn guest(v: Value) -> RawCartItem { RawCartItem::guest(v).unwrap() }
    fn server(v: Value) -> RawCartItem { RawCartItem::server(v).unwrap() }

    #[test]
    fn test_empty_object_gets_defaults() {
        let item = normalize(guest(json!({})));
        assert_eq!(item.name, UNNAMED_PRODUCT);
        assert_eq!(item.product_id, ProductId::unknown());
        assert_eq!(item.quantity, Quantity::ONE);
        assert_eq!(item.price, Decimal::ZERO);
        assert!(item.image.starts_with("data:image/svg+xml;base64,"));
    }

    #[test]
    fn test_server_fallback_chains() {
        let item = normalize(server(json!({
            "productId": 5, "productName": "Beard Oil", "name": "ignored", "unitPrice": "349.00",
            "quantity": 2, "imageUrl": "/oil.png", "image": "/preferred.png"
        })));
        assert_eq!(item.id.as_str(), "5");
        assert_eq!(item.name, "Beard Oil");
        assert_eq!(item.price, Decimal::new(349, 0));
        assert_eq!(item.image, "/preferred.png");
    }

    #[test]
    fn test_price_from_line_total() {
        let item = normalize(server(json!({"productId": 1, "lineTotal": 300, "quantity": 3})));
        assert_eq!(item.price, Decimal::new(100, 0));
    }

    #[test]
    fn test_serum_size_becomes_volume() {
        let item = normalize(guest(json!({"productId": "s1", "category": "Vitamin C Serum", "color": "Amber", "size": "30ml"})));
        assert_eq!(item.volume.as_deref(), Some("30ml"));
        assert_eq!(item.color, None);
        assert_eq!(item.size, None);
    }

    #[test]
    fn test_guest_product_id_falls_back_to_id() {
        let item = normalize(guest(json!({"id": 42, "name": "Tee", "price": -5})));
        assert_eq!(item.product_id.as_str(), "42");
        assert_eq!(item.price, Decimal::ZERO);
    }

    #[test]
    fn test_normalization_is_idempotent() {
        let shapes = vec![
            guest(json!({})),
            guest(json!({"productId": "p", "name": "  Shirt ", "price": 999.5, "quantity": "2", "color": "Red", "size": "L"})),
            guest(json!({"id": 3, "category": "serum", "size": "50ml"})),
            server(json!({"cartItemId": 9, "productId": 4, "lineTotal": 500, "quantity": 4, "productImage": ""})),
            server(json!({"productId": 8, "price": 1.2e3})),
        ];
        for raw in shapes {
            let once = normalize(raw);
            let twice = normalize(RawCartItem::from(&once));
            assert_eq!(once, twice);
        }
    }

    #[test]
    fn test_oversized_quantity_saturates() {
        let item = normalize(server(json!({"cartItemId": 3, "productId": 8, "quantity": 5_000_000_000_i64})));
        assert_eq!(item.quantity.value(), u32::MAX);
        assert_eq!(normalize(RawCartItem::from(&item)), item);
    }

    #[test]
    fn test_normalize_all_drops_non_positive_quantities() {
        let items = normalize_all(vec![
            guest(json!({"productId": "a", "quantity": 0})),
            guest(json!({"productId": "b", "quantity": -2})),
            guest(json!({"productId": "c"})),
        ]);
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].product_id.as_str(), "c");
    }

    #[test]
    fn test_non_object_is_skipped() {
        assert!(RawCartItem::guest(json!("nope")).is_none());
    }
}
