//! Checkout
//!
//! ```text
//! Idle -> Validating -> Submitting -> AwaitingPayment -> Completed | Failed
//! ```
//!
//! The form is sanitized and validated locally first; nothing reaches the
//! backend until every field passes. Cash on delivery completes as soon as
//! the order exists. Card and UPI hand over to [`PaymentProtocol`].

use once_cell::sync::Lazy;
use regex::Regex;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::{watch, Mutex};
use tracing::{debug, info, warn};
use validator::{Validate, ValidationErrors};

use crate::api::{OrdersApi, PaymentsApi};
use crate::coordinator::CartCoordinator;
use crate::domain::aggregates::{OrderId, ShippingAddress};
use crate::domain::events::{CheckoutEvent, DomainEvent};
use crate::domain::value_objects::Money;
use crate::payment::{FailureReason, Navigation, PaymentProtocol};
use crate::{FieldErrors, StorefrontError};

/// Indian mobile number: ten digits, first one 6-9.
static PHONE_PATTERN: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[6-9]\d{9}$").expect("phone pattern compiles"));
/// Six digits, not starting with 0.
static PINCODE_PATTERN: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[1-9]\d{5}$").expect("pincode pattern compiles"));

const STRIPPED: [char; 5] = ['<', '>', '\'', '"', '&'];

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PaymentMethod {
    #[default]
    Card,
    Upi,
    #[serde(rename = "cod")]
    CashOnDelivery,
}

impl PaymentMethod {
    pub fn uses_gateway(&self) -> bool { !matches!(self, Self::CashOnDelivery) }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryMethod {
    #[default]
    Standard,
    Express,
}

// =============================================================================
// Fees
// =============================================================================

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FeePolicy {
    pub standard_fee: Decimal,
    pub express_fee: Decimal,
    /// Standard delivery is free at or above this subtotal.
    pub free_standard_above: Option<Decimal>,
}

impl Default for FeePolicy {
    fn default() -> Self {
        Self { standard_fee: Decimal::ZERO, express_fee: Decimal::new(250, 0), free_standard_above: None }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OrderTotals {
    pub subtotal: Money,
    pub delivery_fee: Money,
    pub total: Money,
}

impl FeePolicy {
    pub fn delivery_fee(&self, subtotal: Decimal, method: DeliveryMethod) -> Decimal {
        match method {
            DeliveryMethod::Express => self.express_fee,
            DeliveryMethod::Standard => match self.free_standard_above {
                Some(threshold) if subtotal >= threshold => Decimal::ZERO,
                _ => self.standard_fee,
            },
        }
    }

    pub fn totals(&self, subtotal: &Money, method: DeliveryMethod) -> OrderTotals {
        let fee = self.delivery_fee(subtotal.amount(), method);
        OrderTotals {
            subtotal: subtotal.clone(),
            delivery_fee: Money::new(fee, subtotal.currency()),
            total: Money::new(subtotal.amount() + fee, subtotal.currency()),
        }
    }
}

// =============================================================================
// Form
// =============================================================================

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct CheckoutForm {
    #[validate(length(min = 2, message = "First name must be at least 2 characters"))]
    pub first_name: String,
    #[validate(length(min = 1, message = "Last name is required"))]
    pub last_name: String,
    #[validate(email(message = "Enter a valid email address"))]
    pub email: String,
    #[validate(regex(path = "PHONE_PATTERN", message = "Enter a valid 10-digit mobile number"))]
    pub phone: String,
    #[validate(length(min = 5, message = "Address must be at least 5 characters"))]
    pub address: String,
    #[validate(length(min = 2, message = "City must be at least 2 characters"))]
    pub city: String,
    #[serde(default)]
    pub state: Option<String>,
    #[validate(regex(path = "PINCODE_PATTERN", message = "Enter a valid 6-digit pincode"))]
    pub pincode: String,
    #[serde(default)]
    pub delivery: DeliveryMethod,
    #[serde(default)]
    pub payment: PaymentMethod,
}

/// Drops characters that could break out of markup or headers downstream.
pub fn sanitize(input: &str) -> String {
    input.chars().filter(|c| !STRIPPED.contains(c)).collect::<String>().trim().to_string()
}

impl CheckoutForm {
    pub fn sanitized(&self) -> Self {
        let digits = |s: &str| sanitize(s).chars().filter(|c| !c.is_whitespace()).collect::<String>();
        Self {
            first_name: sanitize(&self.first_name),
            last_name: sanitize(&self.last_name),
            email: sanitize(&self.email),
            phone: digits(&self.phone),
            address: sanitize(&self.address),
            city: sanitize(&self.city),
            state: self.state.as_deref().map(sanitize).filter(|s| !s.is_empty()),
            pincode: digits(&self.pincode),
            delivery: self.delivery,
            payment: self.payment,
        }
    }

    /// Sanitizes and validates; the shipping address is only built from a
    /// form that passed.
    pub fn check(&self) -> Result<ShippingAddress, FieldErrors> {
        let clean = self.sanitized();
        clean.validate().map_err(field_errors)?;
        Ok(ShippingAddress {
            first_name: clean.first_name,
            last_name: clean.last_name,
            email: clean.email,
            phone: clean.phone,
            street: clean.address,
            city: clean.city,
            state: clean.state,
            pincode: clean.pincode,
        })
    }
}

fn field_errors(errors: ValidationErrors) -> FieldErrors {
    let mut fields = FieldErrors::default();
    for (field, errs) in errors.field_errors() {
        let message = errs
            .first()
            .and_then(|e| e.message.as_ref())
            .map(|m| m.to_string())
            .unwrap_or_else(|| format!("{field} is invalid"));
        fields.insert(field, message);
    }
    fields
}

// =============================================================================
// Controller
// =============================================================================

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum CheckoutState {
    #[default]
    Idle,
    Validating,
    Submitting,
    AwaitingPayment,
    Completed,
    Failed,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CheckoutOutcome {
    /// Shown inline next to the fields; nothing was sent.
    Invalid(FieldErrors),
    /// The session is gone; route to login.
    LoginRequired,
    /// The order may already exist; stay on the page.
    Duplicate { message: String },
    Navigate(Navigation),
}

pub struct CheckoutController {
    orders: Arc<dyn OrdersApi>,
    payments: Arc<dyn PaymentsApi>,
    coordinator: Arc<CartCoordinator>,
    protocol: Arc<PaymentProtocol>,
    fees: FeePolicy,
    state: watch::Sender<CheckoutState>,
    running: Mutex<()>,
}

impl CheckoutController {
    pub fn new(
        orders: Arc<dyn OrdersApi>,
        payments: Arc<dyn PaymentsApi>,
        coordinator: Arc<CartCoordinator>,
        protocol: Arc<PaymentProtocol>,
        fees: FeePolicy,
    ) -> Self {
        let (state, _) = watch::channel(CheckoutState::Idle);
        Self { orders, payments, coordinator, protocol, fees, state, running: Mutex::new(()) }
    }

    pub fn state(&self) -> watch::Receiver<CheckoutState> { self.state.subscribe() }

    /// Totals for the current cart and delivery choice.
    pub fn totals(&self, delivery: DeliveryMethod) -> OrderTotals {
        self.fees.totals(&self.coordinator.cart_total(), delivery)
    }

    pub async fn submit(&self, form: &CheckoutForm) -> CheckoutOutcome {
        let Ok(_running) = self.running.try_lock() else {
            debug!("Checkout already in progress");
            return CheckoutOutcome::Duplicate { message: "Your order is already being placed".into() };
        };

        self.transition(CheckoutState::Validating);
        let address = match form.check() {
            Ok(address) => address,
            Err(fields) => {
                debug!(%fields, "Checkout form rejected");
                self.publish(CheckoutEvent::ValidationFailed { fields: fields.fields().map(String::from).collect() });
                self.transition(CheckoutState::Idle);
                return CheckoutOutcome::Invalid(fields);
            }
        };
        let cart = self.coordinator.cart();
        if cart.is_empty() {
            let mut fields = FieldErrors::default();
            fields.insert("cart", "Your cart is empty");
            self.transition(CheckoutState::Idle);
            return CheckoutOutcome::Invalid(fields);
        }
        if !self.coordinator.is_authenticated() {
            self.transition(CheckoutState::Idle);
            return CheckoutOutcome::LoginRequired;
        }

        let totals = self.fees.totals(&cart.total(), form.delivery);
        self.transition(CheckoutState::Submitting);
        let order = match self.orders.create(address.to_line()).await {
            Ok(order) => order,
            Err(e) if e.is_conflict() => {
                warn!(error = %e, "Order already submitted");
                self.publish(CheckoutEvent::DuplicateSubmission);
                self.transition(CheckoutState::Idle);
                return CheckoutOutcome::Duplicate { message: e.to_string() };
            }
            Err(StorefrontError::Auth { .. }) => {
                self.transition(CheckoutState::Idle);
                return CheckoutOutcome::LoginRequired;
            }
            Err(e) => {
                warn!(error = %e, "Order creation failed");
                let reason = match e {
                    StorefrontError::Network(_) => FailureReason::NetworkError,
                    _ => FailureReason::OrderCreationFailed,
                };
                return self.finish(Navigation::failure(reason, None));
            }
        };
        info!(order_id = %order.id, total = %totals.total, payment = ?form.payment, "Order created");
        self.publish(CheckoutEvent::OrderCreated { order_id: order.id.clone(), total: totals.total.amount() });

        if !form.payment.uses_gateway() {
            if let Err(e) = self.coordinator.clear_cart().await {
                warn!(order_id = %order.id, error = %e, "Order placed but the cart could not be cleared");
            }
            return self.finish(Navigation::Success { order_id: order.id, payment_id: None });
        }

        self.transition(CheckoutState::AwaitingPayment);
        let session = match self.payments.create_session(order.id.clone(), form.payment).await {
            Ok(session) => session,
            Err(e) => {
                warn!(order_id = %order.id, error = %e, "Payment session could not be created");
                let reason = match e {
                    StorefrontError::Network(_) => FailureReason::NetworkError,
                    _ => FailureReason::PaymentFailed,
                };
                return self.finish(Navigation::failure(reason, Some(&order.id)));
            }
        };
        let navigation = self.protocol.confirm(&order.id, &session, &describe(&order.id)).await;
        self.finish(navigation)
    }

    fn finish(&self, navigation: Navigation) -> CheckoutOutcome {
        match &navigation {
            Navigation::Success { order_id, .. } => {
                self.publish(CheckoutEvent::Completed { order_id: order_id.clone() });
                self.transition(CheckoutState::Completed);
            }
            Navigation::Failure { reason, order_id } => {
                self.publish(CheckoutEvent::Failed { order_id: order_id.clone(), reason: reason.code().to_string() });
                self.transition(CheckoutState::Failed);
            }
        }
        CheckoutOutcome::Navigate(navigation)
    }

    fn transition(&self, state: CheckoutState) {
        debug!(?state, "Checkout state");
        self.state.send_replace(state);
    }

    fn publish(&self, event: CheckoutEvent) { self.coordinator.publish(DomainEvent::Checkout(event)); }
}

fn describe(order_id: &OrderId) -> String { format!("Order #{order_id}") }

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::cart::MockCartGateway;
    use crate::api::orders::MockOrdersApi;
    use crate::api::payments::{MockPaymentsApi, PaymentSession};
    use crate::config::GuestCartPolicy;
    use crate::coordinator::tests::{harness, sign_in, snapshot, Harness};
    use crate::domain::aggregates::Order;
    use crate::payment::{GatewayCallback, MockPaymentWidget, PollSettings, WidgetOutcome};
    use serde_json::json;

    fn form() -> CheckoutForm {
        CheckoutForm {
            first_name: "Asha".into(),
            last_name: "Rao".into(),
            email: "asha@example.com".into(),
            phone: "9876543210".into(),
            address: "12 MG Road".into(),
            city: "Pune".into(),
            state: Some("MH".into()),
            pincode: "411001".into(),
            delivery: DeliveryMethod::Standard,
            payment: PaymentMethod::CashOnDelivery,
        }
    }

    fn order(id: u64) -> Order { serde_json::from_value(json!({"id": id, "status": "PENDING"})).unwrap() }

    async fn signed_in_with_cart() -> Harness {
        let mut gateway = MockCartGateway::new();
        gateway.expect_fetch().returning(|| Ok(snapshot(json!([{"id": 7, "productId": 3, "price": 100, "quantity": 2}]))));
        gateway.expect_clear().returning(|| Ok(()));
        let h = harness(gateway, GuestCartPolicy::Merge);
        sign_in(&h.session);
        h.coordinator.sync_with_auth().await.unwrap();
        h
    }

    fn controller(h: &Harness, orders: MockOrdersApi, payments: MockPaymentsApi, widget: MockPaymentWidget) -> CheckoutController {
        let orders: Arc<dyn OrdersApi> = Arc::new(orders);
        let payments: Arc<dyn PaymentsApi> = Arc::new(payments);
        let protocol = PaymentProtocol::new(payments.clone(), orders.clone(), Arc::new(widget), h.coordinator.clone(), PollSettings::default());
        CheckoutController::new(orders, payments, h.coordinator.clone(), Arc::new(protocol), FeePolicy::default())
    }

    #[test]
    fn test_delivery_fee_policies() {
        let later = FeePolicy::default();
        let subtotal = Money::inr(Decimal::new(250, 0));
        assert_eq!(later.totals(&subtotal, DeliveryMethod::Standard).total.amount(), Decimal::new(250, 0));
        assert_eq!(later.totals(&subtotal, DeliveryMethod::Express).total.amount(), Decimal::new(500, 0));

        let earlier = FeePolicy { standard_fee: Decimal::new(148, 0), express_fee: Decimal::new(250, 0), free_standard_above: Some(Decimal::new(999, 0)) };
        assert_eq!(earlier.delivery_fee(Decimal::new(500, 0), DeliveryMethod::Standard), Decimal::new(148, 0));
        assert_eq!(earlier.delivery_fee(Decimal::new(999, 0), DeliveryMethod::Standard), Decimal::ZERO);
    }

    #[test]
    fn test_sanitize_strips_markup_characters() {
        assert_eq!(sanitize(" <b>Flat 4 & 5</b> \"A\" "), "bFlat 4  5/b A");
        let mut dirty = form();
        dirty.phone = " 98765 43210 ".into();
        dirty.city = "<Pune>".into();
        let address = dirty.check().unwrap();
        assert_eq!(address.phone, "9876543210");
        assert_eq!(address.city, "Pune");
    }

    #[test]
    fn test_field_level_errors() {
        let mut bad = form();
        bad.phone = "12345".into();
        bad.pincode = "011001".into();
        bad.email = "not-an-email".into();
        let fields = bad.check().unwrap_err();
        assert_eq!(fields.len(), 3);
        assert_eq!(fields.get("phone"), Some("Enter a valid 10-digit mobile number"));
        assert!(fields.get("pincode").is_some());
        assert!(fields.get("email").is_some());
    }

    #[tokio::test]
    async fn test_invalid_phone_never_reaches_backend() {
        let h = signed_in_with_cart().await;
        let mut orders = MockOrdersApi::new();
        orders.expect_create().never();
        let checkout = controller(&h, orders, MockPaymentsApi::new(), MockPaymentWidget::new());

        let mut bad = form();
        bad.phone = "12345".into();
        let outcome = checkout.submit(&bad).await;
        assert!(matches!(outcome, CheckoutOutcome::Invalid(ref f) if f.get("phone").is_some()));
        assert_eq!(*checkout.state().borrow(), CheckoutState::Idle);
        assert_eq!(h.coordinator.cart_count(), 2);
    }

    #[tokio::test]
    async fn test_cash_on_delivery_completes_without_gateway() {
        let h = signed_in_with_cart().await;
        let mut orders = MockOrdersApi::new();
        orders.expect_create()
            .withf(|address| address.contains("Phone: 9876543210") && address.contains("Pune, MH - 411001"))
            .times(1)
            .returning(|_| Ok(order(42)));
        let mut payments = MockPaymentsApi::new();
        payments.expect_create_session().never();
        let mut widget = MockPaymentWidget::new();
        widget.expect_open().never();
        let checkout = controller(&h, orders, payments, widget);

        let outcome = checkout.submit(&form()).await;
        assert_eq!(outcome, CheckoutOutcome::Navigate(Navigation::Success { order_id: OrderId::new("42"), payment_id: None }));
        assert_eq!(*checkout.state().borrow(), CheckoutState::Completed);
        assert!(h.coordinator.cart().is_empty());
    }

    #[tokio::test]
    async fn test_card_payment_verified_by_signature() {
        let h = signed_in_with_cart().await;
        let mut orders = MockOrdersApi::new();
        orders.expect_create().times(1).returning(|_| Ok(order(43)));
        let mut payments = MockPaymentsApi::new();
        payments.expect_create_session()
            .withf(|id, method| id.as_str() == "43" && *method == PaymentMethod::Card)
            .returning(|_, _| Ok(PaymentSession {
                gateway_order_id: "gw_43".into(),
                gateway_key_id: "key".into(),
                amount: Decimal::new(200, 0),
                currency: "INR".into(),
            }));
        payments.expect_verify().times(1).returning(|_| Ok(true));
        let mut widget = MockPaymentWidget::new();
        widget.expect_open()
            .withf(|r| r.amount_minor == 20000 && r.description == "Order #43")
            .returning(|_| WidgetOutcome::Callback(GatewayCallback {
                payment_id: Some("pay_9".into()),
                order_id: Some("gw_43".into()),
                signature: Some("sig".into()),
            }));
        let checkout = controller(&h, orders, payments, widget);

        let mut card = form();
        card.payment = PaymentMethod::Card;
        let outcome = checkout.submit(&card).await;
        assert_eq!(outcome, CheckoutOutcome::Navigate(Navigation::Success { order_id: OrderId::new("43"), payment_id: Some("pay_9".into()) }));
        assert!(h.coordinator.cart().is_empty());
    }

    #[tokio::test]
    async fn test_conflict_keeps_shopper_on_checkout() {
        let h = signed_in_with_cart().await;
        let mut orders = MockOrdersApi::new();
        orders.expect_create().returning(|_| Err(StorefrontError::Api { status: 409, message: "Order already exists".into() }));
        let checkout = controller(&h, orders, MockPaymentsApi::new(), MockPaymentWidget::new());

        let outcome = checkout.submit(&form()).await;
        assert_eq!(outcome, CheckoutOutcome::Duplicate { message: "Order already exists".into() });
        assert_eq!(*checkout.state().borrow(), CheckoutState::Idle);
        assert_eq!(h.coordinator.cart_count(), 2);
    }

    #[tokio::test]
    async fn test_order_creation_network_failure_routes_to_failure() {
        let h = signed_in_with_cart().await;
        let mut orders = MockOrdersApi::new();
        orders.expect_create().returning(|_| Err(StorefrontError::Network("connection reset".into())));
        let checkout = controller(&h, orders, MockPaymentsApi::new(), MockPaymentWidget::new());

        let outcome = checkout.submit(&form()).await;
        assert_eq!(outcome, CheckoutOutcome::Navigate(Navigation::failure(FailureReason::NetworkError, None)));
        assert_eq!(*checkout.state().borrow(), CheckoutState::Failed);
        assert_eq!(h.coordinator.cart_count(), 2);
    }

    #[tokio::test]
    async fn test_guest_must_sign_in_before_ordering() {
        let h = harness(MockCartGateway::new(), GuestCartPolicy::Merge);
        h.coordinator.add_to_cart(&crate::coordinator::tests::product("101", 100), None, None, 1).await.unwrap();
        let mut orders = MockOrdersApi::new();
        orders.expect_create().never();
        let checkout = controller(&h, orders, MockPaymentsApi::new(), MockPaymentWidget::new());
        assert_eq!(checkout.submit(&form()).await, CheckoutOutcome::LoginRequired);
    }
}
