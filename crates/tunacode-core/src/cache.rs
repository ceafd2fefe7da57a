// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tunacode_config::AgentConfig;
use tunacode_message::ModelProvider;
use tunacode_tools::ToolRegistry;

use crate::agent::Agent;
use crate::runtime_context::AgentRuntimeContext;

type CacheKey = (String, String, u64);

/// Caches constructed [`Agent`]s keyed by `(provider name, model name, config hash)`.
///
/// `Agent` fields are immutable after construction, so a cache hit hands out
/// a shared `Arc<Agent>` with no locking beyond the lookup itself. A config
/// change produces a different hash, which naturally evicts the stale entry
/// on the next lookup instead of mutating anything in place.
#[derive(Default)]
pub struct AgentCache {
    entries: Mutex<HashMap<CacheKey, Arc<Agent>>>,
}

impl AgentCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the cached agent for this provider+config combination,
    /// constructing a new one on a cache miss.
    pub fn get_or_create_agent(
        &self,
        model: Arc<dyn ModelProvider>,
        tools: Arc<ToolRegistry>,
        config: Arc<AgentConfig>,
        runtime: AgentRuntimeContext,
    ) -> Arc<Agent> {
        let key = cache_key(model.as_ref(), &config);
        let mut entries = self.entries.lock().expect("agent cache mutex poisoned");
        if let Some(agent) = entries.get(&key) {
            return Arc::clone(agent);
        }
        let agent = Arc::new(Agent::new(model, tools, config, runtime));
        entries.insert(key, Arc::clone(&agent));
        agent
    }

    /// Number of cached agents. Exposed for tests and diagnostics.
    pub fn len(&self) -> usize {
        self.entries.lock().expect("agent cache mutex poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every cached agent, forcing the next lookup to rebuild.
    pub fn clear(&self) {
        self.entries.lock().expect("agent cache mutex poisoned").clear();
    }
}

fn cache_key(model: &dyn ModelProvider, config: &AgentConfig) -> CacheKey {
    (model.name().to_string(), model.model_name().to_string(), config_version_hash(config))
}

/// Hash the config by serializing it rather than deriving `Hash` directly:
/// `threshold`/`reserve_fraction` are `f32`, which has no `Eq`/`Hash` impl.
fn config_version_hash(config: &AgentConfig) -> u64 {
    use std::hash::{Hash, Hasher};
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    let json = serde_json::to_string(config).expect("AgentConfig always serializes");
    json.hash(&mut hasher);
    hasher.finish()
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
