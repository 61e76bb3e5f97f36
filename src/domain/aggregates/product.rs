//! Product read model
//!
//! The storefront never mutates products; this is the shape the catalog
//! endpoints return and what the cart is fed from.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use crate::domain::value_objects::{Money, ProductId};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Product {
    pub id: ProductId,
    pub name: String,
    #[serde(default)]
    pub brand: Option<String>,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    pub price: Decimal,
    #[serde(default)]
    pub images: Vec<String>,
    #[serde(default)]
    pub image_url: Option<String>,
    #[serde(default)]
    pub colors: Vec<ProductColor>,
    #[serde(default)]
    pub sizes: Vec<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProductColor { pub name: String, #[serde(default)] pub image: Option<String> }

/// Which variant attributes identify a line for a given category.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum VariantKind {
    /// Serums are sold by volume; colour is meaningless.
    Volume,
    /// Everything else is picked by colour and size.
    ColorAndSize,
}

impl VariantKind {
    pub fn for_category(category: Option<&str>) -> Self {
        match category {
            Some(c) if c.to_lowercase().contains("serum") => Self::Volume,
            _ => Self::ColorAndSize,
        }
    }
}

impl Product {
    pub fn variant_kind(&self) -> VariantKind { VariantKind::for_category(self.category.as_deref()) }

    pub fn unit_price(&self, currency: &str) -> Money { Money::new(self.price, currency) }

    /// First usable image: the gallery, then the single `imageUrl` field.
    pub fn primary_image(&self) -> Option<&str> {
        self.images
            .iter()
            .map(|s| s.trim())
            .find(|s| !s.is_empty())
            .or_else(|| self.image_url.as_deref().map(str::trim).filter(|s| !s.is_empty()))
    }

    /// Image shown for a colour swatch, falling back to the primary image.
    pub fn image_for_color(&self, color: Option<&str>) -> Option<&str> {
        color
            .and_then(|name| self.colors.iter().find(|c| c.name == name))
            .and_then(|c| c.image.as_deref())
            .filter(|s| !s.trim().is_empty())
            .or_else(|| self.primary_image())
    }
}
