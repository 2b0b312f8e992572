//! Runtime settings.
//!
//! Operators change limits, rates and prices through an external key/value
//! store reached via [`ConfigProvider`]. Each operation loads one
//! [`ConfigSnapshot`] up front and never re-reads it, so a change made
//! mid-operation cannot split an operation across two configurations.

use crate::config::ConfigError;
use crate::money::Amount;
use crate::types::AssetKind;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

pub mod keys {
    pub const WITHDRAW_OPEN: &str = "withdraw_open";
    pub const WITHDRAW_AMOUNT_MAX: &str = "withdraw_amount_max";
    pub const WITHDRAW_AMOUNT_MIN: &str = "withdraw_amount_min";
    pub const WITHDRAW_AMOUNT_BNBS_MAX: &str = "withdraw_amount_bnbs_max";
    pub const WITHDRAW_AMOUNT_BNBS_MIN: &str = "withdraw_amount_bnbs_min";
    pub const WITHDRAW_FEE_RATE: &str = "withdraw_fee_rate";
    pub const EXCHANGE_RATE: &str = "exchange_rate";
    pub const B_PRICE: &str = "b_price";
    pub const B_PRICE_BASE: &str = "b_price_base";
    pub const TRADE_FEE_RATE: &str = "withdraw_rate";
    pub const TRADE_BURN_RATE: &str = "withdraw_destroy_rate";
    pub const DEPOSIT_REWARD_RATES: &str = "deposit_reward_rates";
    pub const TRADE_REWARD_RATES: &str = "trade_reward_rates";

    pub const ALL: [&str; 13] = [
        WITHDRAW_OPEN,
        WITHDRAW_AMOUNT_MAX,
        WITHDRAW_AMOUNT_MIN,
        WITHDRAW_AMOUNT_BNBS_MAX,
        WITHDRAW_AMOUNT_BNBS_MIN,
        WITHDRAW_FEE_RATE,
        EXCHANGE_RATE,
        B_PRICE,
        B_PRICE_BASE,
        TRADE_FEE_RATE,
        TRADE_BURN_RATE,
        DEPOSIT_REWARD_RATES,
        TRADE_REWARD_RATES,
    ];
}

#[async_trait]
pub trait ConfigProvider: Send + Sync {
    /// Values for the keys that exist. Missing keys are simply absent.
    async fn get_by_keys(&self, keys: &[&str]) -> Result<HashMap<String, String>, ConfigError>;
}

/// Inclusive per-asset withdraw bounds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WithdrawLimits {
    pub min: Amount,
    pub max: Amount,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigSnapshot {
    pub withdraw_open: bool,
    pub primary_withdraw: WithdrawLimits,
    pub reward_token_withdraw: WithdrawLimits,
    // percent of the withdrawn amount kept as fee
    pub withdraw_fee_rate: u32,
    // per-mille of the converted amount kept as exchange fee
    pub exchange_rate: u32,
    pub price: i64,
    pub price_base: i64,
    // percent of each trade leg kept as fee, and burned
    pub trade_fee_rate: u32,
    pub trade_burn_rate: u32,
    pub deposit_reward_rates: Vec<u32>,
    pub trade_reward_rates: Vec<u32>,
}

impl Default for ConfigSnapshot {
    fn default() -> Self {
        Self {
            withdraw_open: false,
            primary_withdraw: WithdrawLimits {
                min: Amount::from_units(10),
                max: Amount::from_units(10_000),
            },
            reward_token_withdraw: WithdrawLimits {
                min: Amount::from_units(100),
                max: Amount::from_units(1_000_000),
            },
            withdraw_fee_rate: 0,
            exchange_rate: 0,
            price: 1,
            price_base: 1,
            trade_fee_rate: 0,
            trade_burn_rate: 0,
            deposit_reward_rates: Vec::new(),
            trade_reward_rates: Vec::new(),
        }
    }
}

impl ConfigSnapshot {
    pub async fn load<P: ConfigProvider + ?Sized>(provider: &P) -> Result<Self, ConfigError> {
        let values = provider.get_by_keys(&keys::ALL).await?;
        Self::from_values(&values)
    }

    /// Missing keys keep their defaults; present but unparsable values are errors.
    pub fn from_values(values: &HashMap<String, String>) -> Result<Self, ConfigError> {
        let mut snapshot = Self::default();
        let get = |key: &str| values.get(key).map(|v| v.trim()).filter(|v| !v.is_empty());

        if let Some(value) = get(keys::WITHDRAW_OPEN) {
            snapshot.withdraw_open = value == "1";
        }
        if let Some(value) = get(keys::WITHDRAW_AMOUNT_MAX) {
            snapshot.primary_withdraw.max = parse_amount(keys::WITHDRAW_AMOUNT_MAX, value)?;
        }
        if let Some(value) = get(keys::WITHDRAW_AMOUNT_MIN) {
            snapshot.primary_withdraw.min = parse_amount(keys::WITHDRAW_AMOUNT_MIN, value)?;
        }
        if let Some(value) = get(keys::WITHDRAW_AMOUNT_BNBS_MAX) {
            snapshot.reward_token_withdraw.max = parse_amount(keys::WITHDRAW_AMOUNT_BNBS_MAX, value)?;
        }
        if let Some(value) = get(keys::WITHDRAW_AMOUNT_BNBS_MIN) {
            snapshot.reward_token_withdraw.min = parse_amount(keys::WITHDRAW_AMOUNT_BNBS_MIN, value)?;
        }
        if let Some(value) = get(keys::WITHDRAW_FEE_RATE) {
            snapshot.withdraw_fee_rate = parse_percent(keys::WITHDRAW_FEE_RATE, value)?;
        }
        if let Some(value) = get(keys::EXCHANGE_RATE) {
            snapshot.exchange_rate = parse_rate(keys::EXCHANGE_RATE, value, 1000)?;
        }
        if let Some(value) = get(keys::B_PRICE) {
            snapshot.price = parse_price(keys::B_PRICE, value)?;
        }
        if let Some(value) = get(keys::B_PRICE_BASE) {
            snapshot.price_base = parse_price(keys::B_PRICE_BASE, value)?;
        }
        if let Some(value) = get(keys::TRADE_FEE_RATE) {
            snapshot.trade_fee_rate = parse_percent(keys::TRADE_FEE_RATE, value)?;
        }
        if let Some(value) = get(keys::TRADE_BURN_RATE) {
            snapshot.trade_burn_rate = parse_percent(keys::TRADE_BURN_RATE, value)?;
        }
        if let Some(value) = get(keys::DEPOSIT_REWARD_RATES) {
            snapshot.deposit_reward_rates = parse_rates(keys::DEPOSIT_REWARD_RATES, value)?;
        }
        if let Some(value) = get(keys::TRADE_REWARD_RATES) {
            snapshot.trade_reward_rates = parse_rates(keys::TRADE_REWARD_RATES, value)?;
        }

        if snapshot.trade_fee_rate + snapshot.trade_burn_rate > 100 {
            return Err(ConfigError::Malformed {
                key: format!("{}+{}", keys::TRADE_FEE_RATE, keys::TRADE_BURN_RATE),
                value: (snapshot.trade_fee_rate + snapshot.trade_burn_rate).to_string(),
            });
        }

        Ok(snapshot)
    }

    /// Bounds for withdrawable assets, `None` for the rest.
    pub fn withdraw_limits(&self, asset: AssetKind) -> Option<WithdrawLimits> {
        match asset {
            AssetKind::Primary => Some(self.primary_withdraw),
            AssetKind::RewardToken => Some(self.reward_token_withdraw),
            AssetKind::Secondary => None,
        }
    }
}

fn malformed(key: &str, value: &str) -> ConfigError {
    ConfigError::Malformed {
        key: key.to_string(),
        value: value.to_string(),
    }
}

fn parse_amount(key: &str, value: &str) -> Result<Amount, ConfigError> {
    match Amount::parse(value) {
        Some(amount) if !amount.is_negative() => Ok(amount),
        _ => Err(malformed(key, value)),
    }
}

fn parse_rate(key: &str, value: &str, ceiling: u32) -> Result<u32, ConfigError> {
    match value.parse::<u32>() {
        Ok(rate) if rate <= ceiling => Ok(rate),
        _ => Err(malformed(key, value)),
    }
}

fn parse_percent(key: &str, value: &str) -> Result<u32, ConfigError> {
    parse_rate(key, value, 100)
}

fn parse_price(key: &str, value: &str) -> Result<i64, ConfigError> {
    match value.parse::<i64>() {
        Ok(price) if price > 0 => Ok(price),
        _ => Err(malformed(key, value)),
    }
}

fn parse_rates(key: &str, value: &str) -> Result<Vec<u32>, ConfigError> {
    value
        .split(',')
        .map(|part| parse_percent(key, part.trim()))
        .collect()
}

/// Key/value provider backed by a map. Used by the simulator and tests.
#[derive(Debug, Clone, Default)]
pub struct MemoryConfigProvider {
    values: Arc<RwLock<HashMap<String, String>>>,
}

impl MemoryConfigProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Withdrawals open, two reward levels on deposits and trades, 1:1 price.
    pub fn standard() -> Self {
        let values = [
            (keys::WITHDRAW_OPEN, "1"),
            (keys::WITHDRAW_AMOUNT_MAX, "1000"),
            (keys::WITHDRAW_AMOUNT_MIN, "10"),
            (keys::WITHDRAW_AMOUNT_BNBS_MAX, "100000"),
            (keys::WITHDRAW_AMOUNT_BNBS_MIN, "100"),
            (keys::WITHDRAW_FEE_RATE, "5"),
            (keys::EXCHANGE_RATE, "10"),
            (keys::B_PRICE, "1"),
            (keys::B_PRICE_BASE, "1"),
            (keys::TRADE_FEE_RATE, "5"),
            (keys::TRADE_BURN_RATE, "5"),
            (keys::DEPOSIT_REWARD_RATES, "10,5"),
            (keys::TRADE_REWARD_RATES, "10,5"),
        ];
        let map = values
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Self {
            values: Arc::new(RwLock::new(map)),
        }
    }

    pub async fn set(&self, key: &str, value: &str) {
        self.values
            .write()
            .await
            .insert(key.to_string(), value.to_string());
    }

    pub async fn remove(&self, key: &str) {
        self.values.write().await.remove(key);
    }
}

#[async_trait]
impl ConfigProvider for MemoryConfigProvider {
    async fn get_by_keys(&self, keys: &[&str]) -> Result<HashMap<String, String>, ConfigError> {
        let values = self.values.read().await;
        Ok(keys
            .iter()
            .filter_map(|k| values.get(*k).map(|v| (k.to_string(), v.clone())))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn map(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn missing_keys_fall_back_to_defaults() {
        let snapshot = ConfigSnapshot::from_values(&HashMap::new()).unwrap();
        assert_eq!(snapshot, ConfigSnapshot::default());
        assert!(!snapshot.withdraw_open);
    }

    #[test]
    fn withdraw_bounds_are_whole_units() {
        let snapshot = ConfigSnapshot::from_values(&map(&[
            (keys::WITHDRAW_AMOUNT_MAX, "1000"),
            (keys::WITHDRAW_AMOUNT_MIN, "10"),
        ]))
        .unwrap();
        assert_eq!(snapshot.primary_withdraw.max, Amount::from_raw(100_000_000));
        assert_eq!(snapshot.primary_withdraw.min, Amount::from_raw(1_000_000));
    }

    #[test]
    fn rate_tables_parse_in_order() {
        let snapshot = ConfigSnapshot::from_values(&map(&[(keys::DEPOSIT_REWARD_RATES, "10, 5,2")])).unwrap();
        assert_eq!(snapshot.deposit_reward_rates, vec![10, 5, 2]);
    }

    #[test]
    fn malformed_values_are_errors() {
        assert!(ConfigSnapshot::from_values(&map(&[(keys::WITHDRAW_FEE_RATE, "abc")])).is_err());
        assert!(ConfigSnapshot::from_values(&map(&[(keys::B_PRICE_BASE, "0")])).is_err());
        assert!(ConfigSnapshot::from_values(&map(&[(keys::TRADE_REWARD_RATES, "10,x")])).is_err());
        assert!(ConfigSnapshot::from_values(&map(&[(keys::WITHDRAW_AMOUNT_MAX, "-5")])).is_err());
    }

    #[test]
    fn trade_rates_cannot_exceed_whole() {
        let result = ConfigSnapshot::from_values(&map(&[
            (keys::TRADE_FEE_RATE, "60"),
            (keys::TRADE_BURN_RATE, "50"),
        ]));
        assert!(matches!(result, Err(ConfigError::Malformed { .. })));
    }

    #[test]
    fn secondary_is_not_withdrawable() {
        assert!(ConfigSnapshot::default().withdraw_limits(AssetKind::Secondary).is_none());
    }

    #[tokio::test]
    async fn provider_round_trip() {
        let provider = MemoryConfigProvider::standard();
        provider.set(keys::WITHDRAW_OPEN, "0").await;
        let snapshot = ConfigSnapshot::load(&provider).await.unwrap();
        assert!(!snapshot.withdraw_open);
        assert_eq!(snapshot.deposit_reward_rates, vec![10, 5]);
    }
}
