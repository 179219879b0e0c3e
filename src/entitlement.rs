//! Subscription tier lookup against RevenueCat.
//!
//! The checker fails open to the free tier: a missing API key, a network
//! error, an unknown subscriber, or a malformed response all mean `Free`.
//! Quota limits are the real enforcement point, so a billing outage only
//! ever costs a user their premium allowance, never the service.

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::protocol::Tier;

const DEFAULT_BASE_URL: &str = "https://api.revenuecat.com/v1";
const ENTITLEMENT_ID: &str = "premium";

/// Resolves the subscription tier for a device at session start.
#[async_trait]
pub trait EntitlementChecker: Send + Sync {
    async fn check(&self, device_id: &str) -> Tier;
}

/// RevenueCat-backed checker. `GET /subscribers/{device_id}` with the
/// device id as the app user id.
pub struct RevenueCat {
    http: reqwest::Client,
    api_key: Option<String>,
    base_url: String,
}

impl RevenueCat {
    pub fn new(http: reqwest::Client, api_key: Option<String>) -> Self {
        Self {
            http,
            api_key,
            base_url: DEFAULT_BASE_URL.to_string(),
        }
    }

    #[cfg(test)]
    fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }
}

#[async_trait]
impl EntitlementChecker for RevenueCat {
    async fn check(&self, device_id: &str) -> Tier {
        let Some(key) = self.api_key.as_deref() else {
            debug!("no RevenueCat key configured, defaulting to free tier");
            return Tier::Free;
        };

        let url = format!("{}/subscribers/{device_id}", self.base_url);
        let resp = match self
            .http
            .get(&url)
            .header("Authorization", format!("Bearer {key}"))
            .send()
            .await
        {
            Ok(resp) => resp,
            Err(err) => {
                warn!(device_id = %device_id, error = %err, "entitlement lookup failed");
                return Tier::Free;
            }
        };

        if !resp.status().is_success() {
            debug!(device_id = %device_id, status = %resp.status(), "subscriber not found or lookup rejected");
            return Tier::Free;
        }

        match resp.json::<serde_json::Value>().await {
            Ok(body) => tier_from_subscriber(&body),
            Err(err) => {
                warn!(device_id = %device_id, error = %err, "unparseable entitlement response");
                Tier::Free
            }
        }
    }
}

/// Premium requires an active `premium` entitlement: present, and either
/// without an expiry or expiring in the future.
fn tier_from_subscriber(body: &serde_json::Value) -> Tier {
    let entitlement = &body["subscriber"]["entitlements"][ENTITLEMENT_ID];
    if entitlement.is_null() {
        return Tier::Free;
    }

    match entitlement["expires_date"].as_str() {
        None => Tier::Premium,
        Some(expires) => match chrono::DateTime::parse_from_rfc3339(expires) {
            Ok(when) if when > chrono::Utc::now() => Tier::Premium,
            Ok(_) => Tier::Free,
            Err(_) => Tier::Free,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn missing_entitlement_is_free() {
        let body = json!({"subscriber": {"entitlements": {}}});
        assert_eq!(tier_from_subscriber(&body), Tier::Free);
    }

    #[test]
    fn lifetime_entitlement_is_premium() {
        let body = json!({"subscriber": {"entitlements": {
            "premium": {"product_identifier": "lifetime"}
        }}});
        assert_eq!(tier_from_subscriber(&body), Tier::Premium);
    }

    #[test]
    fn active_subscription_is_premium() {
        let body = json!({"subscriber": {"entitlements": {
            "premium": {"expires_date": "2099-01-01T00:00:00Z"}
        }}});
        assert_eq!(tier_from_subscriber(&body), Tier::Premium);
    }

    #[test]
    fn lapsed_subscription_is_free() {
        let body = json!({"subscriber": {"entitlements": {
            "premium": {"expires_date": "2020-01-01T00:00:00Z"}
        }}});
        assert_eq!(tier_from_subscriber(&body), Tier::Free);
    }

    #[test]
    fn garbage_expiry_is_free() {
        let body = json!({"subscriber": {"entitlements": {
            "premium": {"expires_date": "soon"}
        }}});
        assert_eq!(tier_from_subscriber(&body), Tier::Free);
    }

    #[tokio::test]
    async fn missing_key_defaults_free() {
        let checker = RevenueCat::new(reqwest::Client::new(), None)
            .with_base_url("http://127.0.0.1:1");
        assert_eq!(checker.check("dev-1").await, Tier::Free);
    }

    #[tokio::test]
    async fn unreachable_backend_defaults_free() {
        let checker = RevenueCat::new(reqwest::Client::new(), Some("sk_test".into()))
            .with_base_url("http://127.0.0.1:1");
        assert_eq!(checker.check("dev-1").await, Tier::Free);
    }
}
