//! Payment gateway plug-ins and their per-gateway fee configuration.

use crate::models::Invoice;
use crate::provisioning::SettingField;
use crate::services::error::BillingError;
use async_trait::async_trait;
use rust_decimal::{Decimal, RoundingStrategy};
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;

/// A third-party payment provider. Captured payments come back through
/// `Ledger::invoice_add_payment`.
#[async_trait]
pub trait Gateway: Send + Sync {
    fn name(&self) -> &str;

    fn settings(&self) -> Vec<SettingField>;

    /// Start a one-off payment and return the URL to send the user to.
    /// `total` already includes the gateway fee.
    async fn pay(&self, invoice: &Invoice, user_id: i32, total: Decimal)
        -> anyhow::Result<String>;
}

/// Surcharge added on top of the invoice amount.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GatewayFee {
    Fixed(Decimal),
    /// Percentage of the invoice amount, e.g. `2.5` for 2.5%.
    Percent(Decimal),
}

impl GatewayFee {
    /// Amount to charge, rounded up to the cent.
    pub fn total(&self, amount: Decimal) -> Decimal {
        let total = match self {
            GatewayFee::Fixed(fee) => amount + *fee,
            GatewayFee::Percent(pct) => amount + amount * *pct / Decimal::ONE_HUNDRED,
        };
        total.round_dp_with_strategy(2, RoundingStrategy::ToPositiveInfinity)
    }
}

impl FromStr for GatewayFee {
    type Err = BillingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let (digits, percent) = match s.strip_suffix('%') {
            Some(digits) => (digits.trim(), true),
            None => (s, false),
        };

        let value = Decimal::from_str(digits)
            .map_err(|e| BillingError::Validation(format!("invalid gateway fee {:?}: {}", s, e)))?;
        if value.is_sign_negative() {
            return Err(BillingError::Validation(format!(
                "gateway fee must not be negative: {}",
                s
            )));
        }

        Ok(if percent {
            GatewayFee::Percent(value)
        } else {
            GatewayFee::Fixed(value)
        })
    }
}

struct GatewayEntry {
    gateway: Arc<dyn Gateway>,
    enabled: bool,
    fee: Option<GatewayFee>,
}

/// Gateways by name with their admin-controlled state.
#[derive(Default)]
pub struct GatewayRegistry {
    gateways: HashMap<String, GatewayEntry>,
}

impl GatewayRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, gateway: Arc<dyn Gateway>, enabled: bool, fee: Option<GatewayFee>) {
        tracing::info!(gateway = %gateway.name(), enabled = enabled, "Gateway registered");
        self.gateways.insert(
            gateway.name().to_string(),
            GatewayEntry {
                gateway,
                enabled,
                fee,
            },
        );
    }

    /// A gateway usable for payment. Disabled gateways, or ones without a
    /// configured fee, are refused.
    pub fn payable(&self, name: &str) -> Result<(Arc<dyn Gateway>, GatewayFee), BillingError> {
        let entry = self
            .gateways
            .get(name)
            .ok_or_else(|| BillingError::GatewayNotFound(name.to_string()))?;

        match (entry.enabled, entry.fee) {
            (true, Some(fee)) => Ok((Arc::clone(&entry.gateway), fee)),
            _ => Err(BillingError::Forbidden),
        }
    }

    pub fn enabled_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .gateways
            .iter()
            .filter(|(_, entry)| entry.enabled && entry.fee.is_some())
            .map(|(name, _)| name.clone())
            .collect();
        names.sort();
        names
    }
}
