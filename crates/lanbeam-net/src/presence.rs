//! Discovered-device tracking.
//!
//! Maintains an in-memory map of devices announced through the registry,
//! keyed by their stable device id. The session key each record was last
//! seen on is kept alongside so handshakes can be addressed and so
//! disconnect notices can evict the right records.

use std::collections::HashMap;

use lanbeam_shared::types::{DeviceId, DeviceRecord, SessionKey};
use tracing::debug;

/// What [`PresenceTable::upsert`] did with a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    /// First record for this id.
    Inserted,
    /// Existing record replaced by a newer announcement.
    Refreshed,
    /// Incoming record was older than the stored one.
    Stale,
    /// Record describes the local device.
    SelfRecord,
    /// Record has no usable id.
    Invalid,
}

/// Table of currently visible peers. Owned by a single event loop.
#[derive(Debug, Clone)]
pub struct PresenceTable {
    local_id: DeviceId,
    devices: HashMap<DeviceId, DeviceRecord>,
}

impl PresenceTable {
    /// Create an empty table that will never hold `local_id`.
    pub fn new(local_id: DeviceId) -> Self {
        Self {
            local_id,
            devices: HashMap::new(),
        }
    }

    /// Insert or refresh a device.
    ///
    /// One record per id is kept; the one with the most recent `last_seen`
    /// wins and carries the session key it arrived on.
    pub fn upsert(&mut self, record: DeviceRecord) -> UpsertOutcome {
        if record.id.is_empty() {
            return UpsertOutcome::Invalid;
        }
        if record.id == self.local_id {
            return UpsertOutcome::SelfRecord;
        }

        match self.devices.get_mut(&record.id) {
            Some(existing) if existing.last_seen > record.last_seen => {
                debug!(device = %record.id, "Ignoring stale announcement");
                UpsertOutcome::Stale
            }
            Some(existing) => {
                // A host record carries no session; keep the routable one.
                let previous_key = existing.session_key.take();
                *existing = record;
                if existing.session_key.is_none() {
                    existing.session_key = previous_key;
                }
                UpsertOutcome::Refreshed
            }
            None => {
                debug!(
                    device = %record.id,
                    name = %record.name,
                    address = %record.address,
                    "Tracking new device"
                );
                self.devices.insert(record.id.clone(), record);
                UpsertOutcome::Inserted
            }
        }
    }

    /// Drop every record last seen on `session_key`, returning them.
    pub fn evict_session(&mut self, session_key: &SessionKey) -> Vec<DeviceRecord> {
        let ids: Vec<DeviceId> = self
            .devices
            .values()
            .filter(|d| d.session_key.as_ref() == Some(session_key))
            .map(|d| d.id.clone())
            .collect();

        ids.into_iter()
            .filter_map(|id| self.devices.remove(&id))
            .inspect(|d| debug!(device = %d.id, session = %session_key.short(), "Evicted device"))
            .collect()
    }

    /// Forget everything (used by a rescan).
    pub fn clear(&mut self) {
        self.devices.clear();
    }

    pub fn get(&self, id: &DeviceId) -> Option<&DeviceRecord> {
        self.devices.get(id)
    }

    /// Registry session a device can currently be reached on.
    pub fn session_key_of(&self, id: &DeviceId) -> Option<&SessionKey> {
        self.devices.get(id).and_then(|d| d.session_key.as_ref())
    }

    /// Snapshot of all devices, ordered by name then id.
    pub fn devices(&self) -> Vec<DeviceRecord> {
        let mut list: Vec<DeviceRecord> = self.devices.values().cloned().collect();
        list.sort_by(|a, b| a.name.cmp(&b.name).then_with(|| a.id.cmp(&b.id)));
        list
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    pub fn contains(&self, id: &DeviceId) -> bool {
        self.devices.contains_key(id)
    }
}
