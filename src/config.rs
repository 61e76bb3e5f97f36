//! Storefront configuration, read from the environment (and `.env`).

use dotenvy::dotenv;
use rust_decimal::Decimal;
use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::checkout::FeePolicy;
use crate::payment::PollSettings;
use crate::{Result, StorefrontError};

/// What happens to a guest cart when the shopper signs in.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum GuestCartPolicy {
    /// Post every guest line to the server cart, then drop the guest copy.
    #[default]
    Merge,
    /// Drop the guest copy and show the server cart as is.
    Discard,
}

impl FromStr for GuestCartPolicy {
    type Err = StorefrontError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "merge" => Ok(Self::Merge),
            "discard" => Ok(Self::Discard),
            other => Err(StorefrontError::Config(format!("Invalid STOREFRONT_GUEST_CART_POLICY '{other}', expected merge or discard"))),
        }
    }
}

#[derive(Debug, Clone)]
pub struct StorefrontConfig {
    pub api_base_url: String,
    pub storage_path: PathBuf,
    pub currency: String,
    pub standard_delivery_fee: Decimal,
    pub express_delivery_fee: Decimal,
    pub free_delivery_threshold: Option<Decimal>,
    pub payment_poll_interval: Duration,
    pub payment_poll_max_attempts: u32,
    pub guest_cart_policy: GuestCartPolicy,
    pub request_timeout: Duration,
}

impl Default for StorefrontConfig {
    fn default() -> Self {
        Self {
            api_base_url: "http://localhost:8080/api".to_string(),
            storage_path: PathBuf::from(".storefront/storage.json"),
            currency: "INR".to_string(),
            standard_delivery_fee: Decimal::ZERO,
            express_delivery_fee: Decimal::new(250, 0),
            free_delivery_threshold: None,
            payment_poll_interval: Duration::from_millis(5000),
            payment_poll_max_attempts: 24,
            guest_cart_policy: GuestCartPolicy::Merge,
            request_timeout: Duration::from_secs(15),
        }
    }
}

impl StorefrontConfig {
    pub fn from_env() -> Result<Self> {
        dotenv().ok();
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Builds the config from any key lookup; unset keys take their defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());
        let defaults = Self::default();

        let config = Self {
            api_base_url: get("STOREFRONT_API_BASE_URL").unwrap_or(defaults.api_base_url),
            storage_path: get("STOREFRONT_STORAGE_PATH").map(PathBuf::from).unwrap_or(defaults.storage_path),
            currency: get("STOREFRONT_CURRENCY").map(|c| c.to_ascii_uppercase()).unwrap_or(defaults.currency),
            standard_delivery_fee: parse(&get, "STOREFRONT_STANDARD_DELIVERY_FEE")?.unwrap_or(defaults.standard_delivery_fee),
            express_delivery_fee: parse(&get, "STOREFRONT_EXPRESS_DELIVERY_FEE")?.unwrap_or(defaults.express_delivery_fee),
            free_delivery_threshold: parse(&get, "STOREFRONT_FREE_DELIVERY_THRESHOLD")?,
            payment_poll_interval: parse::<u64>(&get, "STOREFRONT_PAYMENT_POLL_INTERVAL_MS")?
                .map(Duration::from_millis)
                .unwrap_or(defaults.payment_poll_interval),
            payment_poll_max_attempts: parse(&get, "STOREFRONT_PAYMENT_POLL_MAX_ATTEMPTS")?.unwrap_or(defaults.payment_poll_max_attempts),
            guest_cart_policy: get("STOREFRONT_GUEST_CART_POLICY").map(|p| p.parse()).transpose()?.unwrap_or_default(),
            request_timeout: parse::<u64>(&get, "STOREFRONT_REQUEST_TIMEOUT_SECS")?
                .map(Duration::from_secs)
                .unwrap_or(defaults.request_timeout),
        };

        for (name, fee) in [("STOREFRONT_STANDARD_DELIVERY_FEE", config.standard_delivery_fee), ("STOREFRONT_EXPRESS_DELIVERY_FEE", config.express_delivery_fee)] {
            if fee.is_sign_negative() {
                return Err(StorefrontError::Config(format!("Invalid {name}: must not be negative")));
            }
        }
        if config.payment_poll_max_attempts == 0 {
            return Err(StorefrontError::Config("Invalid STOREFRONT_PAYMENT_POLL_MAX_ATTEMPTS: must be at least 1".into()));
        }
        if config.payment_poll_interval.is_zero() || config.request_timeout.is_zero() {
            return Err(StorefrontError::Config("Poll interval and request timeout must be greater than zero".into()));
        }

        tracing::info!(api = %config.api_base_url, policy = ?config.guest_cart_policy, "Storefront configuration loaded");
        Ok(config)
    }

    pub fn fee_policy(&self) -> FeePolicy {
        FeePolicy {
            standard_fee: self.standard_delivery_fee,
            express_fee: self.express_delivery_fee,
            free_standard_above: self.free_delivery_threshold,
        }
    }

    pub fn poll_settings(&self) -> PollSettings {
        PollSettings { interval: self.payment_poll_interval, max_attempts: self.payment_poll_max_attempts }
    }
}

fn parse<T: FromStr>(get: &impl Fn(&str) -> Option<String>, key: &str) -> Result<Option<T>>
where
    T::Err: std::fmt::Display,
{
    get(key)
        .map(|raw| raw.parse::<T>().map_err(|e| StorefrontError::Config(format!("Invalid {key} '{raw}': {e}"))))
        .transpose()
}
