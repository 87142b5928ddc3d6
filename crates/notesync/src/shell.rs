//! The application shell: one per context.
//!
//! Wires the local store, the remote, the device identity, the cross-context
//! bus and the manual sync registry together. Coordinators and document
//! adapters created through the shell are registered for manual sync and
//! listen on the bus until the shell shuts down.

use std::sync::{Arc, Mutex, PoisonError};

use notesync_core::{Clock, DeviceId, SystemClock, UserId};
use notesync_store::{DeviceIdentity, KvStore};
use notesync_sync::{
    BatchSyncCoordinator, BusMessage, ChannelHub, CoordinatorContext, CrossContextBus, Listener,
    RemoteDocuments, RemoteSyncClient,
};

use crate::config::ShellConfig;
use crate::document::DocumentSyncAdapter;
use crate::error::Result;
use crate::registry::{ManualSyncRegistry, Registration, SyncNowReport};

/// A coordinator or adapter kept alive by the shell.
struct Attached {
    coordinator: Option<Arc<BatchSyncCoordinator>>,
    _registration: Registration,
    _listener: Listener,
}

/// Builder for [`SyncShell`].
pub struct SyncShellBuilder {
    store: Arc<dyn KvStore>,
    remote: Arc<dyn RemoteSyncClient>,
    documents: Arc<dyn RemoteDocuments>,
    config: ShellConfig,
    clock: Arc<dyn Clock>,
    hub: Option<ChannelHub>,
    registry: Option<ManualSyncRegistry>,
}

impl SyncShellBuilder {
    pub fn config(mut self, config: ShellConfig) -> Self {
        self.config = config;
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Join the broadcast channels of `hub` (other tabs of the process).
    pub fn channel_hub(mut self, hub: ChannelHub) -> Self {
        self.hub = Some(hub);
        self
    }

    /// Share an existing registry instead of creating one.
    pub fn registry(mut self, registry: ManualSyncRegistry) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Load (or create) the device id and assemble the shell.
    pub async fn build(self, user_id: impl Into<UserId>) -> Result<SyncShell> {
        let user_id = user_id.into();
        let device_id = DeviceIdentity::load_or_create(self.store.as_ref()).await?;

        let mut bus = CrossContextBus::new(self.config.bus.clone()).connect_storage(Arc::clone(&self.store));
        if let Some(hub) = &self.hub {
            bus = bus.connect_channel(hub);
        }

        let context = CoordinatorContext::new(
            Arc::clone(&self.store),
            self.remote,
            Arc::clone(&self.clock),
            user_id.clone(),
            device_id.clone(),
        );

        tracing::info!(%user_id, %device_id, context = %bus.id(), "sync shell ready");

        Ok(SyncShell {
            config: self.config,
            store: self.store,
            documents: self.documents,
            clock: self.clock,
            user_id,
            device_id,
            bus: Arc::new(bus),
            registry: self.registry.unwrap_or_default(),
            context,
            attached: Mutex::new(Vec::new()),
        })
    }
}

/// Composition root for one context (tab, window, widget).
pub struct SyncShell {
    config: ShellConfig,
    store: Arc<dyn KvStore>,
    documents: Arc<dyn RemoteDocuments>,
    clock: Arc<dyn Clock>,
    user_id: UserId,
    device_id: DeviceId,
    bus: Arc<CrossContextBus>,
    registry: ManualSyncRegistry,
    context: CoordinatorContext,
    attached: Mutex<Vec<Attached>>,
}

impl SyncShell {
    /// Start building a shell over `store`, talking to `remote` for rows
    /// and `documents` for whole documents.
    pub fn builder(
        store: Arc<dyn KvStore>,
        remote: Arc<dyn RemoteSyncClient>,
        documents: Arc<dyn RemoteDocuments>,
    ) -> SyncShellBuilder {
        SyncShellBuilder {
            store,
            remote,
            documents,
            config: ShellConfig::default(),
            clock: Arc::new(SystemClock),
            hub: None,
            registry: None,
        }
    }

    pub fn user_id(&self) -> &UserId {
        &self.user_id
    }

    pub fn device_id(&self) -> &DeviceId {
        &self.device_id
    }

    pub fn config(&self) -> &ShellConfig {
        &self.config
    }

    pub fn bus(&self) -> &Arc<CrossContextBus> {
        &self.bus
    }

    pub fn registry(&self) -> &ManualSyncRegistry {
        &self.registry
    }

    pub fn store(&self) -> &Arc<dyn KvStore> {
        &self.store
    }

    /// An unmounted coordinator using this shell's context and config.
    /// Customize it (e.g. `with_defaults`) and hand it to [`attach`](Self::attach).
    pub fn new_coordinator<I, T>(&self, group: &str, tables: I) -> BatchSyncCoordinator
    where
        I: IntoIterator<Item = T>,
        T: Into<String>,
    {
        BatchSyncCoordinator::new(
            self.context.clone(),
            group,
            tables,
            self.config.coordinator.clone(),
        )
    }

    /// Mount a coordinator, register it for manual sync, subscribe it to
    /// the bus and start polling if configured.
    pub async fn attach(&self, coordinator: BatchSyncCoordinator) -> Result<Arc<BatchSyncCoordinator>> {
        let coordinator = Arc::new(coordinator);
        coordinator.mount().await?;
        if self.config.auto_poll {
            coordinator.spawn_polling();
        }

        let registration = self
            .registry
            .register(coordinator.group().as_str(), coordinator.clone());
        let listener = self.bus.listen(coordinator.clone());

        self.lock_attached().push(Attached {
            coordinator: Some(coordinator.clone()),
            _registration: registration,
            _listener: listener,
        });
        Ok(coordinator)
    }

    /// Create, mount and attach a coordinator for `group`.
    pub async fn coordinator<I, T>(&self, group: &str, tables: I) -> Result<Arc<BatchSyncCoordinator>>
    where
        I: IntoIterator<Item = T>,
        T: Into<String>,
    {
        self.attach(self.new_coordinator(group, tables)).await
    }

    /// Create a document adapter for `keys`, registered under `name`.
    pub fn document_adapter<I, K>(&self, name: &str, keys: I) -> Arc<DocumentSyncAdapter>
    where
        I: IntoIterator<Item = K>,
        K: Into<String>,
    {
        let adapter = Arc::new(
            DocumentSyncAdapter::new(
                Arc::clone(&self.store),
                Arc::clone(&self.documents),
                Arc::clone(&self.clock),
                self.user_id.clone(),
                self.device_id.clone(),
                keys,
            )
            .with_bus(Arc::clone(&self.bus)),
        );

        let registration = self.registry.register(name, adapter.clone());
        let listener = self.bus.listen(adapter.clone());
        self.lock_attached().push(Attached {
            coordinator: None,
            _registration: registration,
            _listener: listener,
        });
        adapter
    }

    /// Run every registered module's pull then push, then tell the other
    /// contexts to pull.
    pub async fn sync_now(&self) -> SyncNowReport {
        let report = self.registry.sync_now().await;
        if let Err(e) = self.bus.publish(BusMessage::Pull).await {
            tracing::warn!(error = %e, "could not signal other contexts");
        }
        report
    }

    /// Reset every registered module, then tell the other contexts to
    /// reset too.
    pub async fn reset_all(&self) -> SyncNowReport {
        let report = self.registry.reset_all().await;
        if let Err(e) = self.bus.publish(BusMessage::Reset).await {
            tracing::warn!(error = %e, "could not signal other contexts");
        }
        report
    }

    /// Unmount every coordinator, stop listening and unregister everything.
    pub fn shutdown(&self) {
        let attached = std::mem::take(&mut *self.lock_attached());
        for module in &attached {
            if let Some(coordinator) = &module.coordinator {
                coordinator.unmount();
            }
        }
        if !attached.is_empty() {
            tracing::info!(modules = attached.len(), "sync shell shut down");
        }
    }

    fn lock_attached(&self) -> std::sync::MutexGuard<'_, Vec<Attached>> {
        self.attached.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for SyncShell {
    fn drop(&mut self) {
        self.shutdown();
    }
}
