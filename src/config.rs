use std::str::FromStr;
use std::time::Duration;

use config::ConfigError;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::Deserialize;

/// Worker configuration, read from the environment once at process start.
/// Every knob that influences settlement correctness lives here so that no
/// component ever consults ambient state at call time.
#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub database_url: String,
    pub currency: String,
    /// Minor units per major unit (100 for ZAR cents)
    pub minor_unit_divisor: i64,

    // Locking
    pub lock_wait_timeout: Duration,
    pub schedule_lock_ttl: Duration,
    pub lock_heartbeat: Duration,
    pub business_lock_ttl: Duration,

    // Idempotency
    pub idempotency_ttl: Duration,
    pub dedup_window: Duration,

    // Circuit breaker
    pub breaker_failure_threshold: u32,
    pub breaker_open_timeout: Duration,
    pub breaker_half_open_successes: u32,

    // Retry
    pub retry_max_attempts: u32,
    pub retry_initial_delay: Duration,
    pub retry_backoff_multiplier: f64,
    pub retry_max_delay: Duration,

    // Escrow
    pub deposit_fee_rate: Decimal,
    pub reservation_ttl: Duration,
    pub reservation_cleanup_timeout: Duration,

    // Ledger
    pub posting_delay: Duration,

    // Orchestration
    pub stuck_job_timeout: Duration,
    pub settlement_tick: Duration,

    // Reconciliation
    pub reconciliation_interval: Duration,
    pub reconciliation_auto_fix_max_minor: i64,

    // Gateway
    pub gateway_mode: GatewayMode,
    pub gateway_success_rate: f64,
    pub gateway_decline_rate: f64,
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
pub enum GatewayMode {
    Mock,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        let cfg = Self {
            database_url: std::env::var("DATABASE_URL")
                .unwrap_or_else(|_| "postgresql://localhost/paycore".to_string()),
            currency: std::env::var("CURRENCY").unwrap_or_else(|_| "ZAR".to_string()),
            minor_unit_divisor: env_parse("MINOR_UNIT_DIVISOR", 100)?,

            lock_wait_timeout: env_secs("LOCK_WAIT_TIMEOUT_SECS", 10)?,
            schedule_lock_ttl: env_secs("SCHEDULE_LOCK_TTL_SECS", 600)?,
            lock_heartbeat: env_secs("LOCK_HEARTBEAT_SECS", 300)?,
            business_lock_ttl: env_secs("BUSINESS_LOCK_TTL_SECS", 30)?,

            idempotency_ttl: env_secs("IDEMPOTENCY_TTL_SECS", 7 * 24 * 3600)?,
            dedup_window: env_secs("DEDUP_WINDOW_SECS", 300)?,

            breaker_failure_threshold: env_parse("BREAKER_FAILURE_THRESHOLD", 5)?,
            breaker_open_timeout: env_secs("BREAKER_OPEN_TIMEOUT_SECS", 60)?,
            breaker_half_open_successes: env_parse("BREAKER_HALF_OPEN_SUCCESSES", 3)?,

            retry_max_attempts: env_parse("RETRY_MAX_ATTEMPTS", 3)?,
            retry_initial_delay: env_millis("RETRY_INITIAL_DELAY_MS", 100)?,
            retry_backoff_multiplier: env_parse("RETRY_BACKOFF_MULTIPLIER", 2.0)?,
            retry_max_delay: env_millis("RETRY_MAX_DELAY_MS", 5_000)?,

            deposit_fee_rate: env_parse("DEPOSIT_FEE_RATE", dec!(0.015))?,
            reservation_ttl: env_secs("RESERVATION_TTL_SECS", 3600)?,
            reservation_cleanup_timeout: env_secs("RESERVATION_CLEANUP_TIMEOUT_SECS", 3600)?,

            posting_delay: env_secs("POSTING_DELAY_SECS", 0)?,

            stuck_job_timeout: env_secs("STUCK_JOB_TIMEOUT_HOURS", 2).map(|d| d * 3600)?,
            settlement_tick: env_secs("SETTLEMENT_TICK_SECS", 60)?,

            reconciliation_interval: env_secs("RECONCILIATION_INTERVAL_MINUTES", 60)
                .map(|d| d * 60)?,
            reconciliation_auto_fix_max_minor: env_parse("RECONCILIATION_AUTO_FIX_MAX_MINOR", 100)?,

            gateway_mode: GatewayMode::Mock,
            gateway_success_rate: env_parse("GATEWAY_SUCCESS_RATE", 1.0)?,
            gateway_decline_rate: env_parse("GATEWAY_DECLINE_RATE", 0.0)?,
        };

        cfg.validate()?;
        Ok(cfg)
    }

    /// Cross-field invariants. A reservation must outlive the longest
    /// legitimate job-processing window, otherwise the stale sweep can
    /// release funds out from under a live worker.
    fn validate(&self) -> Result<(), ConfigError> {
        if self.reservation_ttl < self.schedule_lock_ttl {
            return Err(ConfigError::Message(format!(
                "RESERVATION_TTL_SECS ({}s) must be >= SCHEDULE_LOCK_TTL_SECS ({}s)",
                self.reservation_ttl.as_secs(),
                self.schedule_lock_ttl.as_secs()
            )));
        }
        for (name, rate) in [
            ("GATEWAY_SUCCESS_RATE", self.gateway_success_rate),
            ("GATEWAY_DECLINE_RATE", self.gateway_decline_rate),
        ] {
            if !(0.0..=1.0).contains(&rate) {
                return Err(ConfigError::Message(format!(
                    "{name} must be within [0, 1], got {rate}"
                )));
            }
        }
        if self.deposit_fee_rate < Decimal::ZERO || self.deposit_fee_rate >= Decimal::ONE {
            return Err(ConfigError::Message(format!(
                "DEPOSIT_FEE_RATE must be within [0, 1), got {}",
                self.deposit_fee_rate
            )));
        }
        if self.minor_unit_divisor <= 0 {
            return Err(ConfigError::Message(
                "MINOR_UNIT_DIVISOR must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

impl Default for Config {
    /// Defaults used by tests; mirrors `from_env` with no variables set.
    fn default() -> Self {
        Self {
            database_url: "postgresql://localhost/paycore".to_string(),
            currency: "ZAR".to_string(),
            minor_unit_divisor: 100,
            lock_wait_timeout: Duration::from_secs(10),
            schedule_lock_ttl: Duration::from_secs(600),
            lock_heartbeat: Duration::from_secs(300),
            business_lock_ttl: Duration::from_secs(30),
            idempotency_ttl: Duration::from_secs(7 * 24 * 3600),
            dedup_window: Duration::from_secs(300),
            breaker_failure_threshold: 5,
            breaker_open_timeout: Duration::from_secs(60),
            breaker_half_open_successes: 3,
            retry_max_attempts: 3,
            retry_initial_delay: Duration::from_millis(100),
            retry_backoff_multiplier: 2.0,
            retry_max_delay: Duration::from_millis(5_000),
            deposit_fee_rate: dec!(0.015),
            reservation_ttl: Duration::from_secs(3600),
            reservation_cleanup_timeout: Duration::from_secs(3600),
            posting_delay: Duration::ZERO,
            stuck_job_timeout: Duration::from_secs(2 * 3600),
            settlement_tick: Duration::from_secs(60),
            reconciliation_interval: Duration::from_secs(3600),
            reconciliation_auto_fix_max_minor: 100,
            gateway_mode: GatewayMode::Mock,
            gateway_success_rate: 1.0,
            gateway_decline_rate: 0.0,
        }
    }
}

fn env_parse<T: FromStr>(name: &str, default: T) -> Result<T, ConfigError>
where
    T::Err: std::fmt::Display,
{
    match std::env::var(name) {
        Ok(raw) => raw
            .parse::<T>()
            .map_err(|e| ConfigError::Message(format!("invalid {name}: {e}"))),
        Err(_) => Ok(default),
    }
}

fn env_secs(name: &str, default_secs: u64) -> Result<Duration, ConfigError> {
    env_parse(name, default_secs).map(Duration::from_secs)
}

fn env_millis(name: &str, default_ms: u64) -> Result<Duration, ConfigError> {
    env_parse(name, default_ms).map(Duration::from_millis)
}
