//! Domain events
use crate::domain::aggregates::OrderId;
use crate::domain::value_objects::{LineId, ProductId};
use rust_decimal::Decimal;

#[derive(Clone, Debug, PartialEq)]
pub enum DomainEvent {
    Cart(CartEvent),
    Checkout(CheckoutEvent),
    Payment(PaymentEvent),
}

#[derive(Clone, Debug, PartialEq)]
pub enum CartEvent {
    Loaded { items: usize, authenticated: bool },
    ItemAdded { line_id: Option<LineId>, product_id: ProductId, quantity: u32 },
    QuantityChanged { line_id: LineId, quantity: u32 },
    ItemRemoved { line_id: LineId },
    Cleared,
    GuestCartMerged { items: usize },
    GuestCartDiscarded { items: usize },
}

#[derive(Clone, Debug, PartialEq)]
pub enum CheckoutEvent {
    ValidationFailed { fields: Vec<String> },
    OrderCreated { order_id: OrderId, total: Decimal },
    DuplicateSubmission,
    Completed { order_id: OrderId },
    Failed { order_id: Option<OrderId>, reason: String },
}

#[derive(Clone, Debug, PartialEq)]
pub enum PaymentEvent {
    GatewayOpened { order_id: OrderId, gateway_order_id: String, amount_minor: i64 },
    CallbackReceived { order_id: OrderId, payment_id: Option<String> },
    PollAttempt { order_id: OrderId, attempt: u32 },
    Verified { order_id: OrderId, payment_id: String },
    VerificationFailed { order_id: OrderId, reason: String },
    UserCancelled { order_id: OrderId },
    GatewayFailed { order_id: OrderId, code: String },
}
