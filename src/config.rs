use crate::domain::penalty::{PenaltyBasis, PenaltyPolicy};
use crate::domain::reservation::DEFAULT_EXPIRATION_HOURS;
use crate::domain::OrgId;
use rust_decimal::Decimal;
use std::env;
use thiserror::Error;

/// Top-level configuration, read from the environment (and `.env`).
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub telemetry: TelemetryConfig,
    pub penalty: PenaltyDefaults,
    pub reservations: ReservationDefaults,
}

/// Tracing controls.
#[derive(Debug, Clone)]
pub struct TelemetryConfig {
    pub log_level: String,
}

/// Late-payment policy applied to organizations without their own.
#[derive(Debug, Clone)]
pub struct PenaltyDefaults {
    pub rate: Decimal,
    pub basis: PenaltyBasis,
    pub grace_period_days: u32,
}

impl PenaltyDefaults {
    pub fn policy_for(&self, org_id: OrgId) -> crate::error::Result<PenaltyPolicy> {
        PenaltyPolicy::new(org_id, self.basis, self.rate, self.grace_period_days)
    }
}

#[derive(Debug, Clone)]
pub struct ReservationDefaults {
    pub expiration_hours: u32,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{key} must be {expected}, got '{value}'")]
    Invalid {
        key: &'static str,
        expected: &'static str,
        value: String,
    },
}

impl AppConfig {
    pub fn load() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Builds the config from any key lookup, so tests need not touch the
    /// process environment.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let log_level = lookup("HOA_LOG_LEVEL").unwrap_or_else(|| "info".to_string());

        let rate = parse(&lookup, "HOA_PENALTY_RATE", "a non-negative decimal", Decimal::TWO)?;
        if rate < Decimal::ZERO {
            return Err(ConfigError::Invalid {
                key: "HOA_PENALTY_RATE",
                expected: "a non-negative decimal",
                value: rate.to_string(),
            });
        }
        let basis = parse(&lookup, "HOA_PENALTY_BASIS", "percent or flat", PenaltyBasis::Percent)?;
        let grace_period_days = parse(&lookup, "HOA_GRACE_PERIOD_DAYS", "a whole number of days", 15)?;
        let expiration_hours = parse(
            &lookup,
            "HOA_RESERVATION_EXPIRATION_HOURS",
            "a whole number of hours",
            DEFAULT_EXPIRATION_HOURS,
        )?;

        Ok(Self {
            telemetry: TelemetryConfig { log_level },
            penalty: PenaltyDefaults {
                rate,
                basis,
                grace_period_days,
            },
            reservations: ReservationDefaults { expiration_hours },
        })
    }
}

fn parse<F, T>(lookup: &F, key: &'static str, expected: &'static str, default: T) -> Result<T, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
{
    match lookup(key) {
        Some(value) => value.trim().parse().map_err(|_| ConfigError::Invalid {
            key,
            expected,
            value,
        }),
        None => Ok(default),
    }
}
