use futures::future::BoxFuture;
use futures::FutureExt;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

use crate::message::{Message, PlatformId};

pub type ListenerFuture = BoxFuture<'static, anyhow::Result<()>>;

/// Callback invoked with (destination channel, message) for every routed
/// message whose destination is on the listener's platform.
pub type ListenerFn = Arc<dyn Fn(PlatformId, Arc<Message>) -> ListenerFuture + Send + Sync>;

/// Erase an async callback into a [`ListenerFn`].
pub fn boxed_listener<F, Fut>(listener: F) -> ListenerFn
where
    F: Fn(PlatformId, Arc<Message>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    Arc::new(move |channel: PlatformId, message: Arc<Message>| listener(channel, message).boxed())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ListenerId(Uuid);

impl ListenerId {
    pub(crate) fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for ListenerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Listeners grouped by destination platform tag. Several listeners may share
/// a tag and all of them are invoked.
#[derive(Default)]
pub struct ListenerRegistry {
    listeners: RwLock<HashMap<String, Vec<(ListenerId, ListenerFn)>>>,
}

impl ListenerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, platform: &str, listener: ListenerFn) -> ListenerId {
        let id = ListenerId::new();
        self.listeners
            .write()
            .entry(platform.to_string())
            .or_default()
            .push((id, listener));
        debug!("Registered listener {} for platform {}", id, platform);
        id
    }

    /// Returns false if the listener was not registered (e.g. already removed).
    pub fn remove(&self, platform: &str, id: ListenerId) -> bool {
        let mut listeners = self.listeners.write();
        let Some(entries) = listeners.get_mut(platform) else {
            return false;
        };
        let before = entries.len();
        entries.retain(|(existing, _)| *existing != id);
        let removed = entries.len() != before;
        if entries.is_empty() {
            listeners.remove(platform);
        }
        removed
    }

    /// Registration-ordered snapshot, so callbacks run without holding the lock.
    pub fn for_platform(&self, platform: &str) -> Vec<(ListenerId, ListenerFn)> {
        self.listeners
            .read()
            .get(platform)
            .cloned()
            .unwrap_or_default()
    }

    pub fn contains(&self, platform: &str, id: ListenerId) -> bool {
        self.listeners
            .read()
            .get(platform)
            .is_some_and(|entries| entries.iter().any(|(existing, _)| *existing == id))
    }

    pub fn count(&self, platform: &str) -> usize {
        self.listeners.read().get(platform).map_or(0, Vec::len)
    }
}
