//! Registry mapping LLM config names to services.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;

use cv_domain::config::LlmDefaults;

use crate::service::LlmService;

/// Named LLM services plus role-default resolution.
///
/// Resolution order: the explicit config name, then the `agents` role
/// default, then any registered service.
#[derive(Default)]
pub struct LlmRegistry {
    services: RwLock<HashMap<String, Arc<dyn LlmService>>>,
}

impl LlmRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, config_name: impl Into<String>, service: Arc<dyn LlmService>) {
        self.services.write().insert(config_name.into(), service);
    }

    pub fn get(&self, config_name: &str) -> Option<Arc<dyn LlmService>> {
        self.services.read().get(config_name).cloned()
    }

    /// Resolve the service for an agent.
    pub fn resolve(
        &self,
        config_name: Option<&str>,
        defaults: &LlmDefaults,
    ) -> Option<Arc<dyn LlmService>> {
        if let Some(name) = config_name {
            if let Some(service) = self.get(name) {
                return Some(service);
            }
        }
        if let Some(service) = self.get(&defaults.agents) {
            return Some(service);
        }
        // Any registered service, by name order for determinism.
        let services = self.services.read();
        let mut names: Vec<_> = services.keys().collect();
        names.sort();
        names.first().and_then(|n| services.get(*n).cloned())
    }

    pub fn is_empty(&self) -> bool {
        self.services.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scripted::ScriptedLlm;

    #[test]
    fn resolve_prefers_explicit_then_role_default() {
        let registry = LlmRegistry::new();
        let fast: Arc<dyn LlmService> = Arc::new(ScriptedLlm::new());
        let smart: Arc<dyn LlmService> = Arc::new(ScriptedLlm::new());
        registry.insert("fast", fast.clone());
        registry.insert("smart", smart.clone());

        let defaults = LlmDefaults {
            agents: "smart".into(),
            ..Default::default()
        };

        let explicit = registry.resolve(Some("fast"), &defaults).unwrap();
        assert!(Arc::ptr_eq(&explicit, &fast));

        let fallback = registry.resolve(None, &defaults).unwrap();
        assert!(Arc::ptr_eq(&fallback, &smart));
    }

    #[test]
    fn resolve_falls_back_to_any_service() {
        let registry = LlmRegistry::new();
        registry.insert("only", Arc::new(ScriptedLlm::new()));
        let defaults = LlmDefaults::default();
        assert!(registry.resolve(Some("missing"), &defaults).is_some());
    }

    #[test]
    fn empty_registry_resolves_nothing() {
        let registry = LlmRegistry::new();
        assert!(registry.resolve(None, &LlmDefaults::default()).is_none());
    }
}
