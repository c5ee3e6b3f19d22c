//! Per-plan policy selection.
//!
//! Callers are matched to a tier by the `plan` on their [`Identity`]. Callers
//! without an identity, without a plan, or with a plan that has no tier of its
//! own fall through to the mandatory `default` tier.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::info;

use super::{build_algorithm, Identity, Policy, PolicyConfig, WindowAlgorithm};
use crate::clock::SharedClock;
use crate::error::{Result, TurnstileError};
use crate::store::CounterStore;

/// Tier every selector must define.
pub const DEFAULT_TIER: &str = "default";

/// Maps a caller's plan to the algorithm that limits it.
pub struct TieredPolicySelector {
    default: Arc<dyn WindowAlgorithm>,
    tiers: HashMap<String, Arc<dyn WindowAlgorithm>>,
}

/// The tier chosen for one request.
pub struct TierSelection<'a> {
    pub tier: &'a str,
    pub algorithm: &'a Arc<dyn WindowAlgorithm>,
}

impl TierSelection<'_> {
    /// Salt `subject` with the tier name so tiers never share a bucket.
    pub fn salted_key(&self, subject: &str) -> String {
        format!("tier:{}:{}", self.tier, subject)
    }
}

impl std::fmt::Debug for TieredPolicySelector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut tiers: Vec<_> = self.tiers().collect();
        tiers.sort_unstable();
        f.debug_struct("TieredPolicySelector").field("tiers", &tiers).finish()
    }
}

impl TieredPolicySelector {
    /// Build a selector from ready algorithms.
    ///
    /// Fails if there is no `default` tier.
    pub fn new(mut tiers: HashMap<String, Arc<dyn WindowAlgorithm>>) -> Result<Self> {
        let default = tiers.remove(DEFAULT_TIER).ok_or_else(|| {
            TurnstileError::Config(format!("tier table must define a '{}' tier", DEFAULT_TIER))
        })?;
        Ok(Self { default, tiers })
    }

    /// Validate every tier's policy and build its algorithm over `store`.
    pub fn from_configs(
        configs: &HashMap<String, PolicyConfig>,
        store: Arc<dyn CounterStore>,
        clock: SharedClock,
    ) -> Result<Self> {
        let mut tiers = HashMap::with_capacity(configs.len());
        for (tier, config) in configs {
            let policy = Policy::from_config(config)?;
            info!(
                tier = %tier,
                policy = %policy.name(),
                max = policy.max(),
                window_ms = policy.window_ms(),
                "Loaded rate limit tier"
            );
            tiers.insert(
                tier.clone(),
                build_algorithm(Arc::new(policy), store.clone(), clock.clone()),
            );
        }
        Self::new(tiers)
    }

    /// Pick the tier for `identity`.
    pub fn select(&self, identity: Option<&Identity>) -> TierSelection<'_> {
        identity
            .and_then(|identity| identity.plan.as_deref())
            .and_then(|plan| self.tiers.get_key_value(plan))
            .map(|(tier, algorithm)| TierSelection {
                tier: tier.as_str(),
                algorithm,
            })
            .unwrap_or(TierSelection {
                tier: DEFAULT_TIER,
                algorithm: &self.default,
            })
    }

    /// Every tier's algorithm, `default` first.
    pub fn algorithms(&self) -> impl Iterator<Item = &Arc<dyn WindowAlgorithm>> {
        std::iter::once(&self.default).chain(self.tiers.values())
    }

    /// Names of every configured tier, `default` included.
    pub fn tiers(&self) -> impl Iterator<Item = &str> {
        std::iter::once(DEFAULT_TIER).chain(self.tiers.keys().map(String::as_str))
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::clock::ManualClock;
    use crate::store::MemoryStore;

    fn selector() -> (TieredPolicySelector, MemoryStore) {
        let clock: SharedClock = Arc::new(ManualClock::new(0));
        let store = MemoryStore::with_clock(clock.clone());

        let mut configs = HashMap::new();
        configs.insert(
            "default".to_string(),
            PolicyConfig::new("api", Duration::from_secs(60), 2),
        );
        configs.insert(
            "pro".to_string(),
            PolicyConfig::new("api", Duration::from_secs(60), 100),
        );

        let selector = TieredPolicySelector::from_configs(&configs, Arc::new(store.clone()), clock).unwrap();
        (selector, store)
    }

    #[test]
    fn test_requires_default_tier() {
        let clock: SharedClock = Arc::new(ManualClock::new(0));
        let mut configs = HashMap::new();
        configs.insert(
            "pro".to_string(),
            PolicyConfig::new("api", Duration::from_secs(60), 100),
        );

        let result = TieredPolicySelector::from_configs(&configs, Arc::new(MemoryStore::new()), clock);
        assert!(matches!(result, Err(TurnstileError::Config(_))));
    }

    #[test]
    fn test_invalid_tier_policy_is_rejected() {
        let clock: SharedClock = Arc::new(ManualClock::new(0));
        let mut configs = HashMap::new();
        configs.insert(
            "default".to_string(),
            PolicyConfig::new("api", Duration::from_secs(60), 0),
        );

        let result = TieredPolicySelector::from_configs(&configs, Arc::new(MemoryStore::new()), clock);
        assert!(result.is_err());
    }

    #[test]
    fn test_select_by_plan() {
        let (selector, _store) = selector();

        let pro = Identity::new("42").with_plan("pro");
        let free = Identity::new("43").with_plan("free");
        let anonymous = Identity::new("44");

        assert_eq!(selector.select(Some(&pro)).tier, "pro");
        assert_eq!(selector.select(Some(&pro)).algorithm.policy().max(), 100);
        assert_eq!(selector.select(Some(&free)).tier, DEFAULT_TIER);
        assert_eq!(selector.select(Some(&anonymous)).tier, DEFAULT_TIER);
        assert_eq!(selector.select(None).tier, DEFAULT_TIER);
    }

    #[tokio::test]
    async fn test_tiers_do_not_share_quota() {
        let (selector, store) = selector();
        let basic = Identity::new("42");
        let upgraded = Identity::new("42").with_plan("pro");

        let selection = selector.select(Some(&basic));
        let key = selection.salted_key("user:42");
        assert_eq!(key, "tier:default:user:42");
        for _ in 0..2 {
            assert!(selection.algorithm.check(&key).await.unwrap().allowed);
        }
        assert!(!selection.algorithm.check(&key).await.unwrap().allowed);

        let selection = selector.select(Some(&upgraded));
        let key = selection.salted_key("user:42");
        let decision = selection.algorithm.check(&key).await.unwrap();
        assert!(decision.allowed);
        assert_eq!(decision.remaining, 99);

        assert!(store.get("api:tier:default:user:42").await.unwrap().is_some());
        assert!(store.get("api:tier:pro:user:42").await.unwrap().is_some());
    }
}
