//! Storefront client core
//!
//! The stateful part of the storefront client: the cart that lives either in
//! local storage (guests) or on the backend (signed-in users), checkout, and
//! confirmation of payments made through an external gateway.
//!
//! ## Features
//! - Item normalization across guest and server cart shapes
//! - Guest cart persisted to durable client storage
//! - Server cart gateway over the REST backend
//! - Cart coordinator switching source on auth state, with guest merge on login
//! - Checkout validation, delivery fee policy and order creation
//! - Payment confirmation by signature verification or bounded status polling

use std::collections::BTreeMap;
use std::fmt;
use thiserror::Error;

pub mod api;
pub mod checkout;
pub mod config;
pub mod coordinator;
pub mod domain;
pub mod guest;
pub mod normalize;
pub mod payment;
pub mod session;
pub mod storage;

pub use config::StorefrontConfig;
pub use coordinator::CartCoordinator;
pub use domain::aggregates::{Cart, CartItem, Order, OrderId, Product};

// =============================================================================
// Error Types
// =============================================================================

/// Field name to human-readable message, ordered by field name.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct FieldErrors(BTreeMap<String, String>);

impl FieldErrors {
    pub fn insert(&mut self, field: impl Into<String>, message: impl Into<String>) {
        self.0.insert(field.into(), message.into());
    }
    pub fn get(&self, field: &str) -> Option<&str> { self.0.get(field).map(String::as_str) }
    pub fn fields(&self) -> impl Iterator<Item = &str> { self.0.keys().map(String::as_str) }
    pub fn is_empty(&self) -> bool { self.0.is_empty() }
    pub fn len(&self) -> usize { self.0.len() }
}

impl fmt::Display for FieldErrors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let fields: Vec<&str> = self.fields().collect();
        write!(f, "{}", fields.join(", "))
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum StorefrontError {
    #[error("Validation failed for: {0}")]
    Validation(FieldErrors),

    #[error("Network error: {0}")]
    Network(String),

    #[error("{message}")]
    Api { status: u16, message: String },

    #[error("Session rejected by server (status {status})")]
    Auth { status: u16 },

    #[error("Invalid payment response: {0}")]
    PaymentCallback(String),

    #[error("Payment for order {order_id} not confirmed: {reason}")]
    PaymentVerification { order_id: String, reason: String },

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Unexpected response: {0}")]
    Decode(String),
}

impl StorefrontError {
    /// The backend refused because the resource already exists, e.g. a
    /// resubmitted order.
    pub fn is_conflict(&self) -> bool { matches!(self, Self::Api { status: 409, .. }) }
}

pub type Result<T> = std::result::Result<T, StorefrontError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_field_errors_display() {
        let mut errors = FieldErrors::default();
        errors.insert("phone", "Enter a valid 10-digit mobile number");
        errors.insert("email", "Enter a valid email address");
        assert_eq!(StorefrontError::Validation(errors).to_string(), "Validation failed for: email, phone");
    }

    #[test]
    fn test_conflict_detection() {
        assert!(StorefrontError::Api { status: 409, message: "exists".into() }.is_conflict());
        assert!(!StorefrontError::Api { status: 400, message: "bad".into() }.is_conflict());
    }
}
