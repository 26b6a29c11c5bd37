use std::collections::BTreeMap;
use std::sync::Arc;

use arc_swap::ArcSwap;
use parking_lot::Mutex;

use super::{BackendDescriptor, BackendDiscovery, DiscoveryFailure};
use crate::error::{EngineError, EngineResult};

/// Name → descriptor map populated from a [`BackendDiscovery`].
///
/// Readers get a snapshot without locking; discovery replaces the whole map.
pub struct BackendRegistry {
    backends: ArcSwap<BTreeMap<String, BackendDescriptor>>,
    failures: Mutex<Vec<DiscoveryFailure>>,
}

impl Default for BackendRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl BackendRegistry {
    pub fn new() -> Self {
        Self {
            backends: ArcSwap::from_pointee(BTreeMap::new()),
            failures: Mutex::new(Vec::new()),
        }
    }

    /// Merges everything `discovery` finds into the registry and returns the
    /// number of registered backends. Entries that fail to load are skipped
    /// and kept for [`failures`](Self::failures).
    pub fn discover(&self, discovery: &dyn BackendDiscovery) -> EngineResult<usize> {
        let found = discovery
            .discover()
            .map_err(|err| EngineError::DiscoveryUnavailable(format!("{err:#}")))?;

        let mut next = BTreeMap::clone(&self.backends.load());
        let mut failures = Vec::new();
        for entry in found {
            match entry {
                Ok(descriptor) => {
                    tracing::debug!(backend = %descriptor.name, "backend discovered");
                    next.insert(descriptor.name.clone(), descriptor);
                }
                Err(failure) => {
                    tracing::warn!(
                        source = %failure.source,
                        reason = %failure.reason,
                        "skipping backend that failed to load"
                    );
                    failures.push(failure);
                }
            }
        }

        let count = next.len();
        self.backends.store(Arc::new(next));
        *self.failures.lock() = failures;
        tracing::info!(count, "backend discovery finished");
        Ok(count)
    }

    pub fn available(&self) -> Vec<BackendDescriptor> {
        self.backends.load().values().cloned().collect()
    }

    pub fn get(&self, name: &str) -> Option<BackendDescriptor> {
        self.backends.load().get(name).cloned()
    }

    pub fn len(&self) -> usize {
        self.backends.load().len()
    }

    pub fn is_empty(&self) -> bool {
        self.backends.load().is_empty()
    }

    /// Load failures recorded by the last discovery pass.
    pub fn failures(&self) -> Vec<DiscoveryFailure> {
        self.failures.lock().clone()
    }

    /// `false` only when a single backend is registered and it can run
    /// without configuration.
    pub fn setup_required(&self) -> bool {
        let backends = self.backends.load();
        if backends.len() != 1 {
            return true;
        }
        !backends
            .values()
            .next()
            .is_some_and(|descriptor| descriptor.factory.already_configured())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Weak;

    use anyhow::{anyhow, Result};

    use super::*;
    use crate::backend::{
        AudioBackend, BackendCapabilities, BackendFactory, BackendHost, Discovered,
    };

    struct NeverFactory {
        configured: bool,
    }

    impl BackendFactory for NeverFactory {
        fn instantiate(
            &self,
            _host: Weak<dyn BackendHost>,
            _arg1: &str,
            _arg2: &str,
        ) -> Result<Box<dyn AudioBackend>> {
            Err(anyhow!("not constructible"))
        }

        fn already_configured(&self) -> bool {
            self.configured
        }
    }

    fn descriptor(name: &str, configured: bool) -> BackendDescriptor {
        BackendDescriptor::new(
            name,
            BackendCapabilities::default(),
            Arc::new(NeverFactory { configured }),
        )
    }

    struct Fixed(Vec<Discovered>);

    impl BackendDiscovery for Fixed {
        fn discover(&self) -> Result<Vec<Discovered>> {
            Ok(self.0.clone())
        }
    }

    struct Unavailable;

    impl BackendDiscovery for Unavailable {
        fn discover(&self) -> Result<Vec<Discovered>> {
            Err(anyhow!("plugin directory missing"))
        }
    }

    #[test]
    fn discovery_skips_failures_and_is_idempotent() {
        let registry = BackendRegistry::new();
        let discovery = Fixed(vec![
            Ok(descriptor("alsa", false)),
            Err(DiscoveryFailure {
                source: "libbroken.so".into(),
                reason: "missing symbol".into(),
            }),
            Ok(descriptor("jack", false)),
        ]);

        assert_eq!(registry.discover(&discovery).unwrap(), 2);
        assert_eq!(registry.discover(&discovery).unwrap(), 2);
        assert_eq!(registry.failures().len(), 1);
        let names: Vec<_> = registry.available().into_iter().map(|d| d.name).collect();
        assert_eq!(names, ["alsa", "jack"]);
        assert!(registry.get("jack").is_some());
        assert!(registry.get("coreaudio").is_none());
    }

    #[test]
    fn unavailable_discovery_is_an_error() {
        let registry = BackendRegistry::new();
        let err = registry.discover(&Unavailable).unwrap_err();
        assert!(matches!(err, EngineError::DiscoveryUnavailable(_)));
        assert!(registry.is_empty());
    }

    #[test]
    fn setup_required_unless_single_configured_backend() {
        let registry = BackendRegistry::new();
        assert!(registry.setup_required());

        registry
            .discover(&Fixed(vec![Ok(descriptor("jack", true))]))
            .unwrap();
        assert!(!registry.setup_required());

        registry
            .discover(&Fixed(vec![Ok(descriptor("alsa", true))]))
            .unwrap();
        assert!(registry.setup_required());
    }
}
