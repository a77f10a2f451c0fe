//! Desired-state source.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use tokio::sync::RwLock;
use vigil_types::{DesiredState, DropletId};

use crate::error::{ProviderError, ProviderResult};

/// Callback receiving one droplet's desired state per invocation.
pub type DropletSink<'a> = dyn FnMut(DropletId, DesiredState) + Send + 'a;

/// Pulls desired state from the control plane.
#[async_trait]
pub trait DesiredStateProvider: Send + Sync {
    /// Page through every droplet, calling `sink` once per droplet.
    ///
    /// Returns the number of droplets yielded. Each call starts paging from
    /// the beginning, so calling again right after exhaustion is fine.
    async fn each_droplet(&self, sink: &mut DropletSink<'_>) -> ProviderResult<usize>;
}

/// Fixed, mutable set of desired states. Used by tests and as a stand-in source.
#[derive(Default)]
pub struct InMemoryDesiredStateProvider {
    droplets: RwLock<BTreeMap<DropletId, DesiredState>>,
    failing: AtomicBool,
    calls: AtomicUsize,
}

impl InMemoryDesiredStateProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn set(&self, id: DropletId, desired: DesiredState) {
        self.droplets.write().await.insert(id, desired);
    }

    pub async fn remove(&self, id: &DropletId) -> Option<DesiredState> {
        self.droplets.write().await.remove(id)
    }

    /// Make every following fetch fail until cleared.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Number of fetches started so far.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DesiredStateProvider for InMemoryDesiredStateProvider {
    async fn each_droplet(&self, sink: &mut DropletSink<'_>) -> ProviderResult<usize> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.failing.load(Ordering::SeqCst) {
            return Err(ProviderError::Unavailable("provider switched off".to_string()));
        }

        let droplets = self.droplets.read().await;
        for (id, desired) in droplets.iter() {
            sink(id.clone(), desired.clone());
        }
        Ok(droplets.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vigil_types::{AppState, PackageState, Timestamp};

    fn desired() -> DesiredState {
        DesiredState {
            num_instances: 1,
            state: AppState::Started,
            live_version: "v1".to_string(),
            package_state: PackageState::Staged,
            last_updated: Timestamp::from_secs(1.0),
        }
    }

    #[tokio::test]
    async fn test_each_droplet_is_restartable() {
        let provider = InMemoryDesiredStateProvider::new();
        provider.set(DropletId::new("a"), desired()).await;
        provider.set(DropletId::new("b"), desired()).await;

        for _ in 0..2 {
            let mut seen = Vec::new();
            let count = provider
                .each_droplet(&mut |id, _| seen.push(id))
                .await
                .unwrap();
            assert_eq!(count, 2);
            assert_eq!(seen, vec![DropletId::new("a"), DropletId::new("b")]);
        }
        assert_eq!(provider.calls(), 2);
    }

    #[tokio::test]
    async fn test_failing_provider() {
        let provider = InMemoryDesiredStateProvider::new();
        provider.set_failing(true);
        let result = provider.each_droplet(&mut |_, _| {}).await;
        assert!(matches!(result, Err(ProviderError::Unavailable(_))));
    }
}
