//! Engine-scoped observer registry
//!
//! Callbacks registered here live exactly as long as the engine that owns
//! the registry; dropping the engine drops them. For async consumers the
//! same events also go out on the broadcast `EventBus`.

use segue_common::events::PlayerEvent;

/// Handle returned by [`ObserverRegistry::observe`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObserverId(u64);

type Callback = Box<dyn FnMut(&PlayerEvent) + Send>;

#[derive(Default)]
pub struct ObserverRegistry {
    next_id: u64,
    observers: Vec<(ObserverId, Callback)>,
}

impl ObserverRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn observe<F>(&mut self, callback: F) -> ObserverId
    where
        F: FnMut(&PlayerEvent) + Send + 'static,
    {
        let id = ObserverId(self.next_id);
        self.next_id += 1;
        self.observers.push((id, Box::new(callback)));
        id
    }

    /// Remove an observer; returns whether it was registered
    pub fn unobserve(&mut self, id: ObserverId) -> bool {
        let before = self.observers.len();
        self.observers.retain(|(oid, _)| *oid != id);
        before != self.observers.len()
    }

    /// Call every observer, in registration order
    pub fn notify(&mut self, event: &PlayerEvent) {
        for (_, callback) in self.observers.iter_mut() {
            callback(event);
        }
    }

    pub fn len(&self) -> usize {
        self.observers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.observers.is_empty()
    }

    pub fn clear(&mut self) {
        self.observers.clear();
    }
}
