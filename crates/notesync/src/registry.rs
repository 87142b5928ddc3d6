//! Manual sync registry.
//!
//! Modules register a handler; the shell's "sync now" button runs every
//! handler's pull then push, all modules concurrently. A failed pull does
//! not stop that module's push, and one module failing never stops the
//! others; failures are collected in the report.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use anyhow::Context;
use async_trait::async_trait;
use futures::future::join_all;

use notesync_sync::BatchSyncCoordinator;

/// A module's explicit sync entry points.
#[async_trait]
pub trait ManualSync: Send + Sync {
    async fn pull(&self) -> anyhow::Result<()>;

    async fn push(&self) -> anyhow::Result<()>;

    /// Drop local state and resync.
    async fn reset(&self) -> anyhow::Result<()>;
}

#[async_trait]
impl ManualSync for BatchSyncCoordinator {
    async fn pull(&self) -> anyhow::Result<()> {
        self.pull_queued(false).await?;
        Ok(())
    }

    async fn push(&self) -> anyhow::Result<()> {
        self.push_pending().await?;
        Ok(())
    }

    async fn reset(&self) -> anyhow::Result<()> {
        BatchSyncCoordinator::reset(self).await?;
        Ok(())
    }
}

type Handler = Arc<dyn ManualSync>;

#[derive(Default)]
struct Inner {
    handlers: BTreeMap<u64, (String, Handler)>,
    next_id: u64,
    generation: u64,
    active: bool,
}

/// Registry of manual sync handlers, owned by the application shell.
///
/// Cloning shares the registry.
#[derive(Clone, Default)]
pub struct ManualSyncRegistry {
    inner: Arc<Mutex<Inner>>,
}

fn lock(inner: &Mutex<Inner>) -> MutexGuard<'_, Inner> {
    inner.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Both steps' errors when both failed.
fn combine(pulled: anyhow::Result<()>, pushed: anyhow::Result<()>) -> anyhow::Result<()> {
    match (pulled, pushed) {
        (Err(pull), Err(push)) => Err(anyhow::anyhow!("{pull:#}; {push:#}")),
        (Err(e), Ok(())) | (Ok(()), Err(e)) => Err(e),
        (Ok(()), Ok(())) => Ok(()),
    }
}

impl ManualSyncRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a handler. It stays registered until the returned
    /// [`Registration`] is dropped.
    pub fn register(&self, name: impl Into<String>, handler: Handler) -> Registration {
        let name = name.into();
        let mut inner = lock(&self.inner);

        if !inner.active {
            inner.active = true;
            inner.generation += 1;
            tracing::debug!(generation = inner.generation, "manual sync registry activated");
        }

        let id = inner.next_id;
        inner.next_id += 1;
        inner.handlers.insert(id, (name.clone(), handler));
        tracing::debug!(module = %name, "manual sync handler registered");

        Registration {
            registry: Arc::downgrade(&self.inner),
            id,
            name,
        }
    }

    /// Whether at least one handler is registered.
    pub fn is_active(&self) -> bool {
        lock(&self.inner).active
    }

    /// Incremented each time the registry goes from empty to active.
    pub fn generation(&self) -> u64 {
        lock(&self.inner).generation
    }

    pub fn len(&self) -> usize {
        lock(&self.inner).handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Registered module names, in registration order.
    pub fn names(&self) -> Vec<String> {
        lock(&self.inner)
            .handlers
            .values()
            .map(|(name, _)| name.clone())
            .collect()
    }

    fn snapshot(&self) -> Vec<(String, Handler)> {
        lock(&self.inner).handlers.values().cloned().collect()
    }

    /// Pull then push every module, modules concurrently. Push runs even
    /// when the pull failed.
    pub async fn sync_now(&self) -> SyncNowReport {
        let handlers = self.snapshot();
        let runs = handlers.into_iter().map(|(name, handler)| async move {
            let pulled = handler.pull().await.context("pull failed");
            let pushed = handler.push().await.context("push failed");
            (name, combine(pulled, pushed))
        });

        let report = SyncNowReport::collect(join_all(runs).await);
        tracing::info!(
            succeeded = report.succeeded.len(),
            failed = report.failed.len(),
            "manual sync finished"
        );
        report
    }

    /// Reset every module, modules concurrently.
    pub async fn reset_all(&self) -> SyncNowReport {
        let handlers = self.snapshot();
        let runs = handlers.into_iter().map(|(name, handler)| async move {
            let result = handler.reset().await.context("reset failed");
            (name, result)
        });

        let report = SyncNowReport::collect(join_all(runs).await);
        tracing::info!(
            succeeded = report.succeeded.len(),
            failed = report.failed.len(),
            "reset finished"
        );
        report
    }
}

/// Keeps a handler registered. Dropping it unregisters.
pub struct Registration {
    registry: Weak<Mutex<Inner>>,
    id: u64,
    name: String,
}

impl Registration {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn unregister(self) {}
}

impl fmt::Debug for Registration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registration")
            .field("name", &self.name)
            .field("id", &self.id)
            .finish()
    }
}

impl Drop for Registration {
    fn drop(&mut self) {
        let Some(registry) = self.registry.upgrade() else {
            return;
        };
        let mut inner = lock(&registry);
        inner.handlers.remove(&self.id);
        tracing::debug!(module = %self.name, "manual sync handler unregistered");

        if inner.handlers.is_empty() && inner.active {
            inner.active = false;
            tracing::debug!(generation = inner.generation, "manual sync registry torn down");
        }
    }
}

/// Per-module outcome of [`ManualSyncRegistry::sync_now`] or
/// [`ManualSyncRegistry::reset_all`].
#[derive(Debug, Default)]
pub struct SyncNowReport {
    pub succeeded: Vec<String>,
    pub failed: Vec<(String, anyhow::Error)>,
}

impl SyncNowReport {
    fn collect(results: Vec<(String, anyhow::Result<()>)>) -> Self {
        let mut report = Self::default();
        for (name, result) in results {
            match result {
                Ok(()) => report.succeeded.push(name),
                Err(e) => {
                    tracing::warn!(module = %name, error = %format!("{e:#}"), "module sync failed");
                    report.failed.push((name, e));
                }
            }
        }
        report
    }

    pub fn is_success(&self) -> bool {
        self.failed.is_empty()
    }

    pub fn failure(&self, module: &str) -> Option<&anyhow::Error> {
        self.failed
            .iter()
            .find(|(name, _)| name == module)
            .map(|(_, e)| e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct Counting {
        pulls: AtomicUsize,
        pushes: AtomicUsize,
        resets: AtomicUsize,
        fail_pull: bool,
        fail_push: bool,
    }

    #[async_trait]
    impl ManualSync for Counting {
        async fn pull(&self) -> anyhow::Result<()> {
            self.pulls.fetch_add(1, Ordering::SeqCst);
            if self.fail_pull {
                anyhow::bail!("remote unreachable");
            }
            Ok(())
        }

        async fn push(&self) -> anyhow::Result<()> {
            self.pushes.fetch_add(1, Ordering::SeqCst);
            if self.fail_push {
                anyhow::bail!("push rejected");
            }
            Ok(())
        }

        async fn reset(&self) -> anyhow::Result<()> {
            self.resets.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_failure_is_isolated_per_module() {
        let registry = ManualSyncRegistry::new();
        let healthy = Arc::new(Counting::default());
        let broken = Arc::new(Counting {
            fail_pull: true,
            ..Counting::default()
        });

        let _a = registry.register("tasks", healthy.clone());
        let _b = registry.register("journal", broken.clone());

        let report = registry.sync_now().await;

        assert_eq!(report.succeeded, vec!["tasks".to_string()]);
        assert!(report.failure("journal").is_some());
        assert_eq!(healthy.pushes.load(Ordering::SeqCst), 1);
        // Pending edits still go out when the pull fails.
        assert_eq!(broken.pushes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_both_failures_are_reported() {
        let registry = ManualSyncRegistry::new();
        let broken = Arc::new(Counting {
            fail_pull: true,
            fail_push: true,
            ..Counting::default()
        });
        let _r = registry.register("journal", broken.clone());

        let report = registry.sync_now().await;

        let message = format!("{:#}", report.failure("journal").unwrap());
        assert!(message.contains("pull failed: remote unreachable"), "{message}");
        assert!(message.contains("push failed: push rejected"), "{message}");
        assert_eq!(broken.pulls.load(Ordering::SeqCst), 1);
        assert_eq!(broken.pushes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_reset_all_reaches_every_module() {
        let registry = ManualSyncRegistry::new();
        let a = Arc::new(Counting::default());
        let b = Arc::new(Counting::default());
        let _ra = registry.register("a", a.clone());
        let _rb = registry.register("b", b.clone());

        assert!(registry.reset_all().await.is_success());
        assert_eq!(a.resets.load(Ordering::SeqCst), 1);
        assert_eq!(b.resets.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_lifecycle_follows_registrations() {
        let registry = ManualSyncRegistry::new();
        assert!(!registry.is_active());
        assert_eq!(registry.generation(), 0);

        let first = registry.register("a", Arc::new(Counting::default()));
        let second = registry.register("b", Arc::new(Counting::default()));
        assert!(registry.is_active());
        assert_eq!(registry.generation(), 1);

        first.unregister();
        assert!(registry.is_active());
        assert_eq!(registry.names(), vec!["b".to_string()]);

        drop(second);
        assert!(!registry.is_active());
        assert!(registry.is_empty());

        let _again = registry.register("c", Arc::new(Counting::default()));
        assert_eq!(registry.generation(), 2);
    }

    #[tokio::test]
    async fn test_unregistered_module_is_not_synced() {
        let registry = ManualSyncRegistry::new();
        let module = Arc::new(Counting::default());
        registry.register("gone", module.clone()).unregister();

        let report = registry.sync_now().await;
        assert!(report.succeeded.is_empty());
        assert_eq!(module.pulls.load(Ordering::SeqCst), 0);
    }
}
