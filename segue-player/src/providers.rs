//! Optional processing nodes supplied by external providers
//!
//! A provider contributes one node to a named service ("stream_element",
//! "postprocessing_element", "sink_element"). A [`ProviderChain`] renders the
//! providers of one service, lowest priority first, inside a provider slot
//! node. Rebuilding the chain swaps the inner nodes but keeps the slot, so
//! whatever is linked to the slot from outside stays linked.

use crate::backend::{Backend, NodeId, NodeKind, NodeState};
use crate::error::{Error, Result};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};

/// Service names
pub mod services {
    /// Per-stream processing, between resampler and stream volume
    pub const STREAM_ELEMENT: &str = "stream_element";
    /// Shared processing after the mixer buffer
    pub const POSTPROCESSING_ELEMENT: &str = "postprocessing_element";
    /// Processing right in front of the master volume
    pub const SINK_ELEMENT: &str = "sink_element";
}

/// Supplier of a processing node
pub trait ElementProvider: Send + Sync {
    /// Unique name within a service
    fn name(&self) -> &str;

    /// Position in the chain, 0-100, lower comes first
    fn priority(&self) -> u8 {
        50
    }

    /// Create the node this provider contributes
    fn build(&self, backend: &mut dyn Backend) -> Result<NodeId>;
}

/// Provider backed by a backend node factory name
pub struct FactoryProvider {
    name: String,
    factory: String,
    priority: u8,
}

impl FactoryProvider {
    pub fn new(name: impl Into<String>, factory: impl Into<String>, priority: u8) -> Self {
        Self {
            name: name.into(),
            factory: factory.into(),
            priority: priority.min(100),
        }
    }
}

impl ElementProvider for FactoryProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn priority(&self) -> u8 {
        self.priority
    }

    fn build(&self, backend: &mut dyn Backend) -> Result<NodeId> {
        backend.make_node(NodeKind::Effect(self.factory.clone()), &self.name)
    }
}

/// Registered providers, per service
#[derive(Default, Clone)]
pub struct ProviderRegistry {
    services: HashMap<String, Vec<Arc<dyn ElementProvider>>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a provider; a provider with the same name is replaced
    pub fn register(&mut self, service: &str, provider: Arc<dyn ElementProvider>) {
        let entries = self.services.entry(service.to_string()).or_default();
        entries.retain(|p| p.name() != provider.name());
        debug!(
            "Registered provider '{}' for {} (priority {})",
            provider.name(),
            service,
            provider.priority()
        );
        entries.push(provider);
    }

    /// Remove a provider by name; returns whether it was registered
    pub fn unregister(&mut self, service: &str, name: &str) -> bool {
        let Some(entries) = self.services.get_mut(service) else {
            return false;
        };
        let before = entries.len();
        entries.retain(|p| p.name() != name);
        before != entries.len()
    }

    /// Providers of a service in chain order (priority, then registration)
    pub fn providers(&self, service: &str) -> Vec<Arc<dyn ElementProvider>> {
        let mut list = self.services.get(service).cloned().unwrap_or_default();
        // stable sort keeps registration order within a priority
        list.sort_by_key(|p| p.priority());
        list
    }
}

/// Provider slot plus the chain currently built inside it
#[derive(Debug)]
pub struct ProviderChain {
    service: String,
    slot: NodeId,
    inner: Vec<NodeId>,
}

impl ProviderChain {
    /// Create the slot and build the chain for `service`
    pub fn new(
        backend: &mut dyn Backend,
        registry: &ProviderRegistry,
        service: &str,
        name: &str,
    ) -> Result<Self> {
        let slot = backend.make_node(NodeKind::ProviderSlot, name)?;
        let mut chain = Self {
            service: service.to_string(),
            slot,
            inner: Vec::new(),
        };
        chain.rebuild(backend, registry)?;
        Ok(chain)
    }

    /// The node outsiders link to
    pub fn slot(&self) -> NodeId {
        self.slot
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    /// Inner nodes in signal order
    pub fn nodes(&self) -> &[NodeId] {
        &self.inner
    }

    /// Replace the inner chain with the registry's current providers
    ///
    /// A provider whose node cannot be built is skipped with a warning. An
    /// empty chain is closed with a pass-through node. The new nodes are
    /// brought to the slot's current state.
    pub fn rebuild(&mut self, backend: &mut dyn Backend, registry: &ProviderRegistry) -> Result<()> {
        self.teardown(backend);

        let mut built = Vec::new();
        for provider in registry.providers(&self.service) {
            match provider.build(backend) {
                Ok(node) => built.push(node),
                Err(e) => warn!(
                    "Provider '{}' for {} failed to build: {}",
                    provider.name(),
                    self.service,
                    e
                ),
            }
        }
        if built.is_empty() {
            built.push(backend.make_node(NodeKind::Identity, "identity")?);
        }

        for node in &built {
            backend.add_to_bin(self.slot, *node)?;
        }
        for pair in built.windows(2) {
            backend.link(pair[0], pair[1])?;
        }

        let first = built[0];
        let last = built[built.len() - 1];
        backend.set_slot_targets(self.slot, first, last)?;

        let state = backend.state(self.slot);
        if state > NodeState::Null {
            for node in &built {
                backend.set_state(*node, state)?;
            }
        }

        debug!("{} chain rebuilt with {} node(s)", self.service, built.len());
        self.inner = built;
        Ok(())
    }

    fn teardown(&mut self, backend: &mut dyn Backend) {
        for pair in self.inner.windows(2) {
            if let Err(e) = backend.unlink(pair[0], pair[1]) {
                debug!("unlink during {} rebuild: {}", self.service, e);
            }
        }
        for node in self.inner.drain(..) {
            let _ = backend.set_state(node, NodeState::Null);
            if let Err(e) = backend.remove_node(node) {
                debug!("remove during {} rebuild: {}", self.service, e);
            }
        }
    }

    /// Remove the slot and everything in it
    pub fn destroy(mut self, backend: &mut dyn Backend) -> Result<()> {
        self.teardown(backend);
        backend
            .remove_node(self.slot)
            .map_err(|e| Error::backend(format!("removing {} slot: {}", self.service, e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::sim::SimBackend;
    use crate::clock::ManualClock;

    struct Broken;

    impl ElementProvider for Broken {
        fn name(&self) -> &str {
            "broken"
        }

        fn build(&self, _backend: &mut dyn Backend) -> Result<NodeId> {
            Err(Error::backend("no such factory"))
        }
    }

    fn sim() -> SimBackend {
        SimBackend::new(Arc::new(ManualClock::new()))
    }

    #[test]
    fn test_registry_orders_by_priority() {
        let mut registry = ProviderRegistry::new();
        registry.register("svc", Arc::new(FactoryProvider::new("late", "echo", 90)));
        registry.register("svc", Arc::new(FactoryProvider::new("early", "eq", 10)));
        registry.register("svc", Arc::new(FactoryProvider::new("mid", "comp", 50)));

        let names: Vec<String> = registry
            .providers("svc")
            .iter()
            .map(|p| p.name().to_string())
            .collect();
        assert_eq!(names, vec!["early", "mid", "late"]);

        assert!(registry.unregister("svc", "mid"));
        assert!(!registry.unregister("svc", "mid"));
        assert!(registry.providers("other").is_empty());
    }

    #[test]
    fn test_empty_chain_is_pass_through() {
        let mut backend = sim();
        let chain = ProviderChain::new(
            &mut backend,
            &ProviderRegistry::new(),
            services::POSTPROCESSING_ELEMENT,
            "postprocessing",
        )
        .unwrap();

        assert_eq!(chain.nodes().len(), 1);
        assert_eq!(backend.kind(chain.nodes()[0]), Some(NodeKind::Identity));
        assert_eq!(
            backend.slot_targets(chain.slot()),
            Some((chain.nodes()[0], chain.nodes()[0]))
        );
    }

    #[test]
    fn test_rebuild_keeps_slot_and_outer_links() {
        let mut backend = sim();
        let mut registry = ProviderRegistry::new();
        let mut chain =
            ProviderChain::new(&mut backend, &registry, services::STREAM_ELEMENT, "slot").unwrap();
        let downstream = backend.make_node(NodeKind::Volume, "vol").unwrap();
        backend.link(chain.slot(), downstream).unwrap();
        let slot = chain.slot();

        registry.register(
            services::STREAM_ELEMENT,
            Arc::new(FactoryProvider::new("eq", "equalizer", 20)),
        );
        registry.register(services::STREAM_ELEMENT, Arc::new(Broken));
        registry.register(
            services::STREAM_ELEMENT,
            Arc::new(FactoryProvider::new("rg", "replaygain", 10)),
        );
        chain.rebuild(&mut backend, &registry).unwrap();

        assert_eq!(chain.slot(), slot);
        assert!(backend.is_linked(slot, downstream));
        let inner = chain.nodes().to_vec();
        assert_eq!(inner.len(), 2);
        assert_eq!(backend.kind(inner[0]), Some(NodeKind::Effect("replaygain".into())));
        assert!(backend.is_linked(inner[0], inner[1]));
        assert_eq!(backend.children(slot), inner);
    }
}
