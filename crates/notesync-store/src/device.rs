//! Device identity: generated once per profile, then reused.

use notesync_core::DeviceId;

use crate::error::Result;
use crate::traits::KvStore;

/// Storage key holding the device id.
pub const DEVICE_ID_KEY: &str = "sync:device_id";

/// Loads or creates the device id for a store.
pub struct DeviceIdentity;

impl DeviceIdentity {
    /// Return the persisted device id, generating and persisting one on
    /// first use. A blank stored value is replaced.
    pub async fn load_or_create<S: KvStore + ?Sized>(store: &S) -> Result<DeviceId> {
        if let Some(existing) = store.get(DEVICE_ID_KEY).await? {
            let existing = existing.trim();
            if !existing.is_empty() {
                return Ok(DeviceId::new(existing));
            }
        }

        let id = DeviceId::random();
        store.set(DEVICE_ID_KEY, id.as_str()).await?;
        tracing::info!(device_id = %id, "generated device identity");
        Ok(id)
    }
}
