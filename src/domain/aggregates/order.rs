//! Order Aggregate
//!
//! Orders are owned by the backend. The client only builds the shipping
//! address it submits and reads the status it gets back.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use crate::domain::value_objects::ProductId;

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "serde_json::Value")]
pub struct OrderId(String);

impl OrderId {
    pub fn new(value: impl Into<String>) -> Self { Self(value.into()) }
    pub fn as_str(&self) -> &str { &self.0 }
}

impl From<serde_json::Value> for OrderId {
    fn from(value: serde_json::Value) -> Self {
        match value {
            serde_json::Value::String(s) => Self(s),
            other => Self(other.to_string()),
        }
    }
}

impl fmt::Display for OrderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { write!(f, "{}", self.0) }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Order {
    pub id: OrderId,
    #[serde(default)]
    pub status: OrderStatus,
    #[serde(default)]
    pub total_price: Option<Decimal>,
    #[serde(default)]
    pub items: Vec<OrderLine>,
    #[serde(default)]
    pub shipping_address: Option<String>,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderLine {
    pub product_id: ProductId,
    #[serde(default)]
    pub product_name: Option<String>,
    pub quantity: u32,
    #[serde(default)]
    pub price: Option<Decimal>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(from = "String")]
pub enum OrderStatus { #[default] Pending, Paid, Cancelled, Failed, Other(String) }

impl From<String> for OrderStatus {
    fn from(raw: String) -> Self {
        match raw.trim().to_ascii_uppercase().as_str() {
            "PENDING" | "CREATED" => Self::Pending,
            "PAID" => Self::Paid,
            "CANCELLED" | "CANCELED" => Self::Cancelled,
            "FAILED" => Self::Failed,
            _ => Self::Other(raw),
        }
    }
}

/// Status of the latest payment attempt for an order.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(from = "String")]
pub enum PaymentStatus { Initiated, #[default] Pending, Success, Failed, Cancelled, Expired, Refunded, Other(String) }

impl From<String> for PaymentStatus {
    fn from(raw: String) -> Self {
        match raw.trim().to_ascii_uppercase().as_str() {
            "INITIATED" => Self::Initiated,
            "PENDING" => Self::Pending,
            "SUCCESS" | "PAID" | "CAPTURED" => Self::Success,
            "FAILED" => Self::Failed,
            "CANCELLED" | "CANCELED" => Self::Cancelled,
            "EXPIRED" => Self::Expired,
            "REFUNDED" => Self::Refunded,
            _ => Self::Other(raw),
        }
    }
}

impl PaymentStatus {
    pub fn is_success(&self) -> bool { matches!(self, Self::Success) }
    /// Terminal and not a success: polling stops.
    pub fn is_failure(&self) -> bool { matches!(self, Self::Failed | Self::Cancelled | Self::Expired) }
}

/// Shipping details as collected at checkout, already sanitized.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ShippingAddress {
    pub first_name: String,
    pub last_name: String,
    pub email: String,
    pub phone: String,
    pub street: String,
    pub city: String,
    pub state: Option<String>,
    pub pincode: String,
}

impl ShippingAddress {
    /// Single-line form the order endpoint stores.
    pub fn to_line(&self) -> String {
        let name = format!("{} {}", self.first_name, self.last_name).trim().to_string();
        let region = match self.state.as_deref().map(str::trim).filter(|s| !s.is_empty()) {
            Some(state) => format!("{}, {} - {}", self.city, state, self.pincode),
            None => format!("{} - {}", self.city, self.pincode),
        };
        format!("{name}, {}, {region}. Phone: {}. Email: {}", self.street, self.phone, self.email)
    }
}
