// 7.0 config.rs: static service settings. deadlines, lock timeouts, dust floors,
// which asset rewards pay out in. values that operators change at runtime
// (withdraw limits, rates, prices) live in settings.rs instead.

use crate::money::Amount;
use crate::types::AssetKind;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/** 7.1: smallest amounts an operation accepts, per asset. */
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DustConfig {
    // Minimum primary transfer
    pub primary: Amount,
    // Minimum secondary transfer
    pub secondary: Amount,
    // Minimum reward token transfer
    pub reward_token: Amount,
    // Minimum reward token amount for an exchange
    pub exchange_min: Amount,
}

impl Default for DustConfig {
    fn default() -> Self {
        Self {
            primary: Amount::from_raw(1_000_000),       // 10 USDT
            secondary: Amount::from_raw(1_000_000),     // 10 USDT2
            reward_token: Amount::from_raw(10_000_000), // 100 DHB
            exchange_min: Amount::from_raw(100_000),    // 1 DHB
        }
    }
}

impl DustConfig {
    pub fn for_asset(&self, asset: AssetKind) -> Amount {
        match asset {
            AssetKind::Primary => self.primary,
            AssetKind::Secondary => self.secondary,
            AssetKind::RewardToken => self.reward_token,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    // How long an operation waits for another user's row lock
    pub lock_timeout_ms: u64,
    // Deadline applied when the caller does not bring one
    pub default_deadline_ms: u64,
    pub dust: DustConfig,
    // Invite code that onboards a user with no referrer
    pub root_invite_code: String,
    // Asset referral rewards are credited in
    pub reward_asset: AssetKind,
    // Asset whose movements count toward team volume
    pub team_volume_asset: AssetKind,
    // Hard cap on ancestor levels visited by one distribution
    pub max_reward_depth: usize,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            lock_timeout_ms: 2_000,
            default_deadline_ms: 10_000,
            dust: DustConfig::default(),
            root_invite_code: "GENESIS".to_string(),
            reward_asset: AssetKind::Primary,
            team_volume_asset: AssetKind::Primary,
            max_reward_depth: 32,
        }
    }
}

impl ServiceConfig {
    // Short timeouts so contention tests fail fast
    pub fn testing() -> Self {
        let mut config = Self::default();
        config.lock_timeout_ms = 200;
        config.default_deadline_ms = 2_000;
        config
    }

    pub fn production() -> Self {
        let mut config = Self::default();
        config.lock_timeout_ms = 5_000;
        config.default_deadline_ms = 30_000;
        config
    }

    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }

    pub fn default_deadline(&self) -> Duration {
        Duration::from_millis(self.default_deadline_ms)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.lock_timeout_ms == 0 {
            return Err(ConfigError::InvalidTimeouts {
                reason: "lock timeout must be positive".to_string(),
            });
        }

        // an operation must be able to wait out at least one lock
        if self.default_deadline_ms < self.lock_timeout_ms {
            return Err(ConfigError::InvalidTimeouts {
                reason: "deadline shorter than lock timeout".to_string(),
            });
        }

        let dust = &self.dust;
        if [dust.primary, dust.secondary, dust.reward_token]
            .iter()
            .any(|d| d.is_negative())
        {
            return Err(ConfigError::InvalidDust {
                reason: "dust thresholds cannot be negative".to_string(),
            });
        }

        if !dust.exchange_min.is_positive() {
            return Err(ConfigError::InvalidDust {
                reason: "exchange minimum must be positive".to_string(),
            });
        }

        if self.root_invite_code.trim().is_empty() {
            return Err(ConfigError::InvalidReferral {
                reason: "root invite code is empty".to_string(),
            });
        }

        if self.max_reward_depth == 0 {
            return Err(ConfigError::InvalidReferral {
                reason: "reward depth must be at least 1".to_string(),
            });
        }

        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("invalid timeouts: {reason}")]
    InvalidTimeouts { reason: String },
    #[error("invalid dust settings: {reason}")]
    InvalidDust { reason: String },
    #[error("invalid referral settings: {reason}")]
    InvalidReferral { reason: String },
    #[error("malformed value {value:?} for {key}")]
    Malformed { key: String, value: String },
    #[error("config provider failed: {0}")]
    Provider(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Environment {
    Development,
    Testing,
    Production,
}

impl Environment {
    pub fn config(&self) -> ServiceConfig {
        match self {
            Environment::Development => ServiceConfig::default(),
            Environment::Testing => ServiceConfig::testing(),
            Environment::Production => ServiceConfig::production(),
        }
    }
}
