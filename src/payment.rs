//! Payment confirmation
//!
//! Bridges the shopper's action in the external payment widget to a
//! confirmed (or explicitly unconfirmed) payment for an order.
//!
//! ```text
//! GatewayOpened -> CallbackReceived -> Verifying -> Verified
//!                                               \-> VerificationFailed
//!               \-> UserCancelled
//!               \-> GatewayFailed
//! ```
//!
//! A callback carrying a signature is checked once by the verify endpoint.
//! Without a signature the latest payment status is polled at a fixed
//! interval for a bounded number of attempts. Running out of attempts is
//! reported as `verification_pending`, never as a failed payment.

use async_trait::async_trait;
use mockall::automock;
use serde::Deserialize;
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::api::{OrdersApi, PaymentSession, PaymentsApi, VerificationRequest};
use crate::coordinator::CartCoordinator;
use crate::domain::aggregates::{OrderId, OrderStatus};
use crate::domain::events::{DomainEvent, PaymentEvent};
use crate::domain::value_objects::Money;
use crate::{Result, StorefrontError};

// =============================================================================
// Failure reasons
// =============================================================================

/// Machine-readable reason carried to the failure view.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FailureReason {
    PaymentCancelled,
    PaymentFailed,
    NetworkError,
    Timeout,
    InsufficientFunds,
    InvalidPaymentResponse,
    VerificationPending,
    OrderCreationFailed,
    Other(String),
}

impl FailureReason {
    pub fn code(&self) -> &str {
        match self {
            Self::PaymentCancelled => "payment_cancelled",
            Self::PaymentFailed => "payment_failed",
            Self::NetworkError => "network_error",
            Self::Timeout => "timeout",
            Self::InsufficientFunds => "insufficient_funds",
            Self::InvalidPaymentResponse => "invalid_payment_response",
            Self::VerificationPending => "verification_pending",
            Self::OrderCreationFailed => "order_creation_failed",
            Self::Other(code) => code,
        }
    }

    pub fn from_code(code: &str) -> Self {
        match code.trim().to_ascii_lowercase().as_str() {
            "payment_cancelled" => Self::PaymentCancelled,
            "payment_failed" => Self::PaymentFailed,
            "network_error" => Self::NetworkError,
            "timeout" => Self::Timeout,
            "insufficient_funds" => Self::InsufficientFunds,
            "invalid_payment_response" => Self::InvalidPaymentResponse,
            "verification_pending" => Self::VerificationPending,
            "order_creation_failed" => Self::OrderCreationFailed,
            _ => Self::Other(code.to_string()),
        }
    }

    /// Text shown to the shopper.
    pub fn message(&self) -> &'static str {
        match self {
            Self::PaymentCancelled => "Payment was cancelled. Please try again.",
            Self::PaymentFailed => "Payment failed. Please check your payment details and try again.",
            Self::NetworkError => "Network error occurred. Please check your connection and try again.",
            Self::Timeout => "Payment request timed out. Please try again.",
            Self::InsufficientFunds => "Insufficient funds. Please use a different payment method.",
            Self::InvalidPaymentResponse => "We could not read the payment response. If money was deducted, your order will be updated shortly.",
            Self::VerificationPending => "We could not confirm your payment yet. If it completes, your order will be processed automatically.",
            Self::OrderCreationFailed => "We could not place your order. Please try again.",
            Self::Other(_) => "Payment failed or was cancelled.",
        }
    }
}

/// Where the UI should go once a flow settles.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Navigation {
    Success { order_id: OrderId, payment_id: Option<String> },
    Failure { reason: FailureReason, order_id: Option<OrderId> },
}

impl Navigation {
    pub fn failure(reason: FailureReason, order_id: Option<&OrderId>) -> Self {
        Self::Failure { reason, order_id: order_id.cloned() }
    }

    pub fn is_success(&self) -> bool { matches!(self, Self::Success { .. }) }
}

// =============================================================================
// Gateway widget
// =============================================================================

/// What the widget needs to take a payment.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WidgetRequest {
    pub key_id: String,
    /// Minor currency units (paise for INR).
    pub amount_minor: i64,
    pub currency: String,
    pub description: String,
    pub gateway_order_id: String,
}

/// Fields the gateway hands back to the success handler.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct GatewayCallback {
    pub payment_id: Option<String>,
    pub order_id: Option<String>,
    pub signature: Option<String>,
}

impl GatewayCallback {
    /// Payment id and gateway order id, both present and matching the session.
    pub fn correlation(&self, expected_gateway_order: &str) -> Result<(String, String)> {
        let present = |v: &Option<String>| v.as_deref().map(str::trim).filter(|s| !s.is_empty()).map(str::to_string);
        let payment_id = present(&self.payment_id).ok_or_else(|| StorefrontError::PaymentCallback("missing payment id".into()))?;
        let order_id = present(&self.order_id).ok_or_else(|| StorefrontError::PaymentCallback("missing gateway order id".into()))?;
        if order_id != expected_gateway_order {
            return Err(StorefrontError::PaymentCallback(format!("callback for gateway order {order_id}, expected {expected_gateway_order}")));
        }
        Ok((payment_id, order_id))
    }

    fn signature(&self) -> Option<String> {
        self.signature.as_deref().map(str::trim).filter(|s| !s.is_empty()).map(str::to_string)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum WidgetOutcome {
    Callback(GatewayCallback),
    /// Closed by the shopper.
    Dismissed,
    /// The gateway reported the payment as failed.
    Failed { code: String, description: String },
}

/// The external checkout widget. Resolves once the shopper finishes with it.
#[automock]
#[async_trait]
pub trait PaymentWidget: Send + Sync {
    async fn open(&self, request: WidgetRequest) -> WidgetOutcome;
}

// =============================================================================
// Polling
// =============================================================================

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PollSettings {
    pub interval: Duration,
    pub max_attempts: u32,
}

impl Default for PollSettings {
    fn default() -> Self { Self { interval: Duration::from_millis(5000), max_attempts: 24 } }
}

impl PollSettings {
    /// attempts × interval, plus one interval for the last request to land.
    pub fn deadline(&self) -> Duration { self.interval.saturating_mul(self.max_attempts.saturating_add(1)) }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PollOutcome {
    Confirmed,
    Rejected(FailureReason),
    Exhausted,
}

enum StatusCheck {
    Confirmed,
    Rejected(FailureReason),
    Pending,
}

/// A polling task that is aborted when the handle is dropped.
pub struct PollHandle<T> {
    task: JoinHandle<T>,
}

impl<T> PollHandle<T> {
    pub fn abort(&self) { self.task.abort(); }

    /// `None` if the task was aborted.
    pub async fn join(mut self) -> Option<T> { (&mut self.task).await.ok() }
}

impl<T> Drop for PollHandle<T> {
    fn drop(&mut self) { self.task.abort(); }
}

fn spawn_poll<F, Fut>(settings: PollSettings, check_first: bool, mut check: F) -> PollHandle<PollOutcome>
where
    F: FnMut(u32) -> Fut + Send + 'static,
    Fut: Future<Output = StatusCheck> + Send + 'static,
{
    let task = tokio::spawn(async move {
        for attempt in 1..=settings.max_attempts {
            if attempt > 1 || !check_first {
                tokio::time::sleep(settings.interval).await;
            }
            match check(attempt).await {
                StatusCheck::Confirmed => return PollOutcome::Confirmed,
                StatusCheck::Rejected(reason) => return PollOutcome::Rejected(reason),
                StatusCheck::Pending => {}
            }
        }
        PollOutcome::Exhausted
    });
    PollHandle { task }
}

async fn settle(settings: PollSettings, handle: PollHandle<PollOutcome>) -> PollOutcome {
    match tokio::time::timeout(settings.deadline(), handle.join()).await {
        Ok(Some(outcome)) => outcome,
        Ok(None) => PollOutcome::Exhausted,
        Err(_) => {
            warn!(deadline = ?settings.deadline(), "Polling deadline reached");
            PollOutcome::Exhausted
        }
    }
}

// =============================================================================
// Protocol
// =============================================================================

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ConfirmationState {
    #[default]
    Idle,
    GatewayOpened,
    CallbackReceived,
    Verifying,
    Verified,
    VerificationFailed,
    UserCancelled,
    GatewayFailed,
}

enum Verdict {
    Confirmed,
    NotConfirmed(FailureReason),
}

type Settled = Mutex<HashMap<String, Option<Navigation>>>;

fn lock(settled: &Settled) -> std::sync::MutexGuard<'_, HashMap<String, Option<Navigation>>> {
    settled.lock().unwrap_or_else(|p| p.into_inner())
}

enum Settlement<'a> {
    Confirmed(Navigation),
    InFlight,
    Claimed(Claim<'a>),
}

/// An in-flight payment id. Unless confirmed, the id is released on drop,
/// including when the confirmation future is dropped mid-verification.
struct Claim<'a> {
    settled: &'a Settled,
    payment_id: String,
    confirmed: bool,
}

impl Claim<'_> {
    fn confirm(mut self, navigation: Navigation) {
        lock(self.settled).insert(self.payment_id.clone(), Some(navigation));
        self.confirmed = true;
    }
}

impl Drop for Claim<'_> {
    fn drop(&mut self) {
        if !self.confirmed {
            lock(self.settled).remove(&self.payment_id);
        }
    }
}

pub struct PaymentProtocol {
    payments: Arc<dyn PaymentsApi>,
    orders: Arc<dyn OrdersApi>,
    widget: Arc<dyn PaymentWidget>,
    coordinator: Arc<CartCoordinator>,
    settings: PollSettings,
    state: watch::Sender<ConfirmationState>,
    /// Payment id -> navigation once confirmed; `None` while verifying.
    settled: Settled,
}

impl PaymentProtocol {
    pub fn new(
        payments: Arc<dyn PaymentsApi>,
        orders: Arc<dyn OrdersApi>,
        widget: Arc<dyn PaymentWidget>,
        coordinator: Arc<CartCoordinator>,
        settings: PollSettings,
    ) -> Self {
        let (state, _) = watch::channel(ConfirmationState::Idle);
        Self { payments, orders, widget, coordinator, settings, state, settled: Mutex::new(HashMap::new()) }
    }

    pub fn state(&self) -> watch::Receiver<ConfirmationState> { self.state.subscribe() }

    /// Opens the widget for a payment session and follows it to a navigation.
    pub async fn confirm(&self, order_id: &OrderId, session: &PaymentSession, description: &str) -> Navigation {
        let amount_minor = match Money::new(session.amount, &session.currency).minor_units() {
            Ok(amount) => amount,
            Err(e) => {
                warn!(%order_id, amount = %session.amount, error = %e, "Payment amount cannot be sent to the gateway");
                self.transition(ConfirmationState::GatewayFailed);
                return Navigation::failure(FailureReason::PaymentFailed, Some(order_id));
            }
        };

        self.transition(ConfirmationState::GatewayOpened);
        self.publish(PaymentEvent::GatewayOpened {
            order_id: order_id.clone(),
            gateway_order_id: session.gateway_order_id.clone(),
            amount_minor,
        });
        let request = WidgetRequest {
            key_id: session.gateway_key_id.clone(),
            amount_minor,
            currency: session.currency.clone(),
            description: description.to_string(),
            gateway_order_id: session.gateway_order_id.clone(),
        };

        match self.widget.open(request).await {
            WidgetOutcome::Callback(callback) => self.handle_callback(order_id, session, callback).await,
            WidgetOutcome::Dismissed => {
                info!(%order_id, "Payment widget dismissed");
                self.transition(ConfirmationState::UserCancelled);
                self.publish(PaymentEvent::UserCancelled { order_id: order_id.clone() });
                Navigation::failure(FailureReason::PaymentCancelled, Some(order_id))
            }
            WidgetOutcome::Failed { code, description } => {
                warn!(%order_id, %code, %description, "Gateway reported payment failure");
                self.transition(ConfirmationState::GatewayFailed);
                self.publish(PaymentEvent::GatewayFailed { order_id: order_id.clone(), code: code.clone() });
                let reason = match FailureReason::from_code(&code) {
                    reason @ (FailureReason::InsufficientFunds | FailureReason::Timeout | FailureReason::NetworkError) => reason,
                    _ => FailureReason::PaymentFailed,
                };
                Navigation::failure(reason, Some(order_id))
            }
        }
    }

    /// Handles a success callback from the gateway. Safe to call again with
    /// the same payment id: a confirmed payment is returned as is and the
    /// cart is not cleared twice.
    pub async fn handle_callback(&self, order_id: &OrderId, session: &PaymentSession, callback: GatewayCallback) -> Navigation {
        self.transition(ConfirmationState::CallbackReceived);
        self.publish(PaymentEvent::CallbackReceived { order_id: order_id.clone(), payment_id: callback.payment_id.clone() });

        let (payment_id, gateway_order_id) = match callback.correlation(&session.gateway_order_id) {
            Ok(ids) => ids,
            Err(e) => {
                warn!(%order_id, error = %e, "Rejecting payment callback");
                return self.verification_failed(order_id, FailureReason::InvalidPaymentResponse);
            }
        };

        let claim = match self.claim(&payment_id) {
            Settlement::Confirmed(navigation) => {
                debug!(%order_id, %payment_id, "Repeated callback for a confirmed payment");
                return navigation;
            }
            Settlement::InFlight => {
                debug!(%order_id, %payment_id, "Callback while the same payment is being verified");
                return Navigation::failure(FailureReason::VerificationPending, Some(order_id));
            }
            Settlement::Claimed(claim) => claim,
        };

        self.transition(ConfirmationState::Verifying);
        let verdict = match callback.signature() {
            Some(signature) => self.verify_signature(order_id, &payment_id, gateway_order_id, signature).await,
            None => self.poll_payment_status(order_id).await,
        };

        match verdict {
            Verdict::Confirmed => {
                let navigation = self.verified(order_id, Some(payment_id)).await;
                claim.confirm(navigation.clone());
                navigation
            }
            Verdict::NotConfirmed(reason) => self.verification_failed(order_id, reason),
        }
    }

    /// Failure-view recovery: waits for the order itself to turn `PAID`,
    /// checking straight away and then at the poll interval.
    pub async fn await_order_paid(&self, order_id: &OrderId) -> Navigation {
        let orders = Arc::clone(&self.orders);
        let id = order_id.clone();
        let handle = spawn_poll(self.settings, true, move |attempt| {
            let orders = Arc::clone(&orders);
            let id = id.clone();
            async move {
                match orders.get(id).await {
                    Ok(order) if order.status == OrderStatus::Paid => StatusCheck::Confirmed,
                    Ok(_) => StatusCheck::Pending,
                    Err(e) => {
                        debug!(attempt, error = %e, "Order status check failed");
                        StatusCheck::Pending
                    }
                }
            }
        });

        match settle(self.settings, handle).await {
            PollOutcome::Confirmed => self.verified(order_id, None).await,
            PollOutcome::Rejected(reason) => Navigation::failure(reason, Some(order_id)),
            PollOutcome::Exhausted => Navigation::failure(FailureReason::VerificationPending, Some(order_id)),
        }
    }

    async fn verify_signature(&self, order_id: &OrderId, payment_id: &str, gateway_order_id: String, signature: String) -> Verdict {
        let request = VerificationRequest {
            order_id: order_id.clone(),
            gateway_payment_id: payment_id.to_string(),
            gateway_order_id,
            signature,
        };
        match self.payments.verify(request).await {
            Ok(true) => Verdict::Confirmed,
            Ok(false) => {
                warn!(%order_id, %payment_id, "Payment signature rejected");
                Verdict::NotConfirmed(FailureReason::PaymentFailed)
            }
            // The payment may well have gone through; only the check is unknown.
            Err(e @ (StorefrontError::Network(_) | StorefrontError::Decode(_) | StorefrontError::Api { status: 500..=599, .. })) => {
                warn!(%order_id, %payment_id, error = %e, "Payment verification did not complete");
                Verdict::NotConfirmed(FailureReason::VerificationPending)
            }
            Err(e) => {
                warn!(%order_id, %payment_id, error = %e, "Payment verification refused");
                Verdict::NotConfirmed(FailureReason::PaymentFailed)
            }
        }
    }

    async fn poll_payment_status(&self, order_id: &OrderId) -> Verdict {
        let payments = Arc::clone(&self.payments);
        let events = self.coordinator.event_sender();
        let id = order_id.clone();
        let handle = spawn_poll(self.settings, false, move |attempt| {
            let payments = Arc::clone(&payments);
            let events = events.clone();
            let id = id.clone();
            async move {
                let _ = events.send(DomainEvent::Payment(PaymentEvent::PollAttempt { order_id: id.clone(), attempt }));
                match payments.latest_status(id).await {
                    Ok(status) if status.is_success() => StatusCheck::Confirmed,
                    Ok(status) if status.is_failure() => StatusCheck::Rejected(FailureReason::PaymentFailed),
                    Ok(status) => {
                        debug!(attempt, ?status, "Payment not settled yet");
                        StatusCheck::Pending
                    }
                    Err(e) => {
                        debug!(attempt, error = %e, "Payment status check failed");
                        StatusCheck::Pending
                    }
                }
            }
        });

        match settle(self.settings, handle).await {
            PollOutcome::Confirmed => Verdict::Confirmed,
            PollOutcome::Rejected(reason) => Verdict::NotConfirmed(reason),
            PollOutcome::Exhausted => {
                warn!(%order_id, attempts = self.settings.max_attempts, "Payment still unconfirmed after polling");
                Verdict::NotConfirmed(FailureReason::VerificationPending)
            }
        }
    }

    async fn verified(&self, order_id: &OrderId, payment_id: Option<String>) -> Navigation {
        if let Err(e) = self.coordinator.clear_cart().await {
            warn!(%order_id, error = %e, "Payment confirmed but the cart could not be cleared");
        }
        self.transition(ConfirmationState::Verified);
        info!(%order_id, payment_id = ?payment_id, "Payment confirmed");
        if let Some(payment_id) = &payment_id {
            self.publish(PaymentEvent::Verified { order_id: order_id.clone(), payment_id: payment_id.clone() });
        }
        Navigation::Success { order_id: order_id.clone(), payment_id }
    }

    fn verification_failed(&self, order_id: &OrderId, reason: FailureReason) -> Navigation {
        self.transition(ConfirmationState::VerificationFailed);
        self.publish(PaymentEvent::VerificationFailed { order_id: order_id.clone(), reason: reason.code().to_string() });
        Navigation::failure(reason, Some(order_id))
    }

    /// Marks a payment id as in flight unless it already has an entry.
    fn claim(&self, payment_id: &str) -> Settlement<'_> {
        let mut settled = lock(&self.settled);
        if let Some(entry) = settled.get(payment_id) {
            return match entry {
                Some(navigation) => Settlement::Confirmed(navigation.clone()),
                None => Settlement::InFlight,
            };
        }
        settled.insert(payment_id.to_string(), None);
        Settlement::Claimed(Claim { settled: &self.settled, payment_id: payment_id.to_string(), confirmed: false })
    }

    fn transition(&self, state: ConfirmationState) {
        debug!(?state, "Payment confirmation state");
        self.state.send_replace(state);
    }

    fn publish(&self, event: PaymentEvent) { self.coordinator.publish(DomainEvent::Payment(event)); }
}
