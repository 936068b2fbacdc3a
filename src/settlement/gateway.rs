use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rand::Rng;
use uuid::Uuid;

use crate::config::Config;
use crate::error::{AppResult, GatewayError};

/// Dependency key used by the circuit breaker; one per rail, not per request.
pub const GATEWAY_BREAKER_KEY: &str = "gateway:payout";

#[derive(Debug, Clone)]
pub struct SettlementRequest {
    pub job_id: Uuid,
    pub business_id: Uuid,
    pub recipient_id: Uuid,
    pub amount_minor: i64,
    pub currency: String,
}

#[derive(Debug, Clone)]
pub struct GatewayReceipt {
    pub reference: String,
    pub settled_at: DateTime<Utc>,
}

/// Payment rail seam. Real rail adapters implement this; the worker ships
/// with the mock only.
#[async_trait]
pub trait SettlementGateway: Send + Sync {
    async fn settle(&self, request: &SettlementRequest) -> AppResult<GatewayReceipt>;
}

/// Configurable-outcome gateway for development and tests. Declines are
/// sampled before outages so a decline rate of 1.0 always declines.
pub struct MockGateway {
    success_rate: f64,
    decline_rate: f64,
}

impl MockGateway {
    pub fn new(success_rate: f64, decline_rate: f64) -> Self {
        Self {
            success_rate,
            decline_rate,
        }
    }

    pub fn from_config(cfg: &Config) -> Self {
        Self::new(cfg.gateway_success_rate, cfg.gateway_decline_rate)
    }

    /// Always succeeds.
    pub fn reliable() -> Self {
        Self::new(1.0, 0.0)
    }
}

#[async_trait]
impl SettlementGateway for MockGateway {
    async fn settle(&self, request: &SettlementRequest) -> AppResult<GatewayReceipt> {
        let roll: f64 = rand::thread_rng().gen();
        if roll < self.decline_rate {
            return Err(GatewayError::Declined(format!(
                "mock decline for recipient {}",
                request.recipient_id
            ))
            .into());
        }
        if roll >= self.decline_rate + self.success_rate {
            return Err(GatewayError::Unavailable("mock outage".to_string()).into());
        }
        Ok(GatewayReceipt {
            reference: format!("mock-{}", Uuid::new_v4()),
            settled_at: Utc::now(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::AppError;

    fn request() -> SettlementRequest {
        SettlementRequest {
            job_id: Uuid::new_v4(),
            business_id: Uuid::new_v4(),
            recipient_id: Uuid::new_v4(),
            amount_minor: 50_000,
            currency: "ZAR".to_string(),
        }
    }

    #[tokio::test]
    async fn reliable_gateway_always_settles() {
        let gateway = MockGateway::reliable();
        for _ in 0..20 {
            let receipt = gateway.settle(&request()).await.unwrap();
            assert!(receipt.reference.starts_with("mock-"));
        }
    }

    #[tokio::test]
    async fn full_decline_rate_always_declines() {
        let gateway = MockGateway::new(0.0, 1.0);
        for _ in 0..20 {
            let err = gateway.settle(&request()).await.unwrap_err();
            assert!(matches!(err, AppError::Gateway(GatewayError::Declined(_))));
            assert!(!err.is_transient());
        }
    }

    #[tokio::test]
    async fn zero_rates_mean_outage() {
        let gateway = MockGateway::new(0.0, 0.0);
        let err = gateway.settle(&request()).await.unwrap_err();
        assert!(matches!(
            err,
            AppError::Gateway(GatewayError::Unavailable(_))
        ));
        assert!(err.is_transient());
    }
}
