use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::debug;

use tether_core::{Result, TetherError};

use crate::provider::{Model, ModelProvider};

const DEFAULT_TTL: Duration = Duration::from_secs(300);

/// Caches provider-resolved model instances with a TTL, and maps logical
/// tiers ("fast", "default", ...) to concrete model names.
pub struct ProviderPool {
    provider: Arc<dyn ModelProvider>,
    ttl: Duration,
    tiers: HashMap<String, String>,
    cache: Mutex<HashMap<String, CachedModel>>,
}

struct CachedModel {
    model: Arc<dyn Model>,
    resolved_at: Instant,
}

impl ProviderPool {
    pub fn new(provider: Arc<dyn ModelProvider>) -> Self {
        Self {
            provider,
            ttl: DEFAULT_TTL,
            tiers: HashMap::new(),
            cache: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    /// Map a logical tier to a concrete model name.
    pub fn with_tier(mut self, tier: impl Into<String>, model: impl Into<String>) -> Self {
        self.tiers.insert(tier.into(), model.into());
        self
    }

    pub fn provider_name(&self) -> &str {
        self.provider.name()
    }

    /// Resolve a model by concrete name, reusing a cached instance while its
    /// TTL holds.
    pub async fn model(&self, name: &str) -> Result<Arc<dyn Model>> {
        if name.trim().is_empty() {
            return Err(TetherError::ModelNotFound("(empty)".into()));
        }
        {
            let cache = self.cache.lock();
            if let Some(cached) = cache.get(name) {
                if cached.resolved_at.elapsed() < self.ttl {
                    return Ok(Arc::clone(&cached.model));
                }
            }
        }
        let model = self.provider.model(name).await?;
        debug!(model = name, provider = self.provider.name(), "model resolved");
        self.cache.lock().insert(
            name.to_string(),
            CachedModel {
                model: Arc::clone(&model),
                resolved_at: Instant::now(),
            },
        );
        Ok(model)
    }

    /// Resolve a model through the tier map; unknown tiers are treated as
    /// concrete model names.
    pub async fn model_for_tier(&self, tier: &str) -> Result<Arc<dyn Model>> {
        let name = self.tiers.get(tier).map(|s| s.as_str()).unwrap_or(tier);
        self.model(name).await
    }

    /// Concrete model name for a tier, if mapped.
    pub fn tier_name(&self, tier: &str) -> Option<&str> {
        self.tiers.get(tier).map(|s| s.as_str())
    }

    /// Drop cached instances (e.g. after a provider credential change).
    pub fn invalidate(&self) {
        self.cache.lock().clear();
    }
}
