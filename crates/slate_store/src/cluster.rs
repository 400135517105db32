//! Slot ownership registers and persisted cluster topology.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::{Arc, RwLock};

use anyhow::Context;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::store::Store;

const NO_SLOT: i32 = -1;

/// Write rejected because the slot has moved (or is moving) off this node.
#[derive(Debug, Error)]
#[error("MOVED {slot} {destination}")]
pub struct SlotMoved {
    pub slot: u16,
    pub destination: String,
}

/// Atomic slot registers read by every worker thread on the hot path and
/// written only by the migrator. Loads are acquire, stores release.
pub struct SlotGate {
    migrating: AtomicI32,
    forbidden: AtomicI32,
    failed: AtomicI32,
    /// Endpoint redirected-to while a cutover is in flight and topology has
    /// not been updated yet.
    destination: RwLock<Option<String>>,
}

impl Default for SlotGate {
    fn default() -> Self {
        Self::new()
    }
}

impl SlotGate {
    pub fn new() -> Self {
        Self {
            migrating: AtomicI32::new(NO_SLOT),
            forbidden: AtomicI32::new(NO_SLOT),
            failed: AtomicI32::new(NO_SLOT),
            destination: RwLock::new(None),
        }
    }

    pub fn set_destination(&self, addr: Option<String>) {
        let mut destination = self.destination.write().unwrap_or_else(|p| p.into_inner());
        *destination = addr;
    }

    pub fn destination(&self) -> Option<String> {
        let destination = self.destination.read().unwrap_or_else(|p| p.into_inner());
        destination.clone()
    }

    /// Claim the single migration slot. Fails if one is already running.
    pub fn try_begin(&self, slot: u16) -> bool {
        self.migrating
            .compare_exchange(NO_SLOT, slot as i32, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Release the migration slot claimed by [`SlotGate::try_begin`].
    pub fn end(&self) {
        self.migrating.store(NO_SLOT, Ordering::Release);
    }

    pub fn migrating_slot(&self) -> Option<u16> {
        slot_of(self.migrating.load(Ordering::Acquire))
    }

    pub fn forbidden_slot(&self) -> Option<u16> {
        slot_of(self.forbidden.load(Ordering::Acquire))
    }

    pub fn failed_slot(&self) -> Option<u16> {
        slot_of(self.failed.load(Ordering::Acquire))
    }

    pub fn set_forbidden(&self, slot: u16) {
        self.forbidden.store(slot as i32, Ordering::Release);
    }

    pub fn release_forbidden(&self) {
        self.forbidden.store(NO_SLOT, Ordering::Release);
    }

    pub fn set_failed(&self, slot: u16) {
        self.failed.store(slot as i32, Ordering::Release);
    }

    pub fn clear_failed(&self) {
        self.failed.store(NO_SLOT, Ordering::Release);
    }
}

fn slot_of(raw: i32) -> Option<u16> {
    (raw >= 0).then_some(raw as u16)
}

/// Persisted owner of a migrated slot.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SlotOwner {
    pub node_id: String,
    pub addr: String,
}

/// Slot ownership as this node knows it. Only slots migrated away are
/// recorded; everything else is implicitly local. Survives restarts through
/// a dedicated partition in the store's keyspace.
pub struct Topology {
    store: Arc<Store>,
    owners: RwLock<HashMap<u16, SlotOwner>>,
}

impl Topology {
    const PARTITION: &'static str = "topology";

    pub fn open(store: Arc<Store>) -> anyhow::Result<Self> {
        let partition = store.open_partition(Self::PARTITION)?;
        let mut owners = HashMap::new();
        for item in partition.range(Vec::new()..) {
            let (key, value) = item.context("load topology")?;
            anyhow::ensure!(key.len() >= 2, "short topology key");
            let slot = u16::from_be_bytes([key[0], key[1]]);
            let owner: SlotOwner =
                serde_json::from_slice(&value).context("decode slot owner")?;
            owners.insert(slot, owner);
        }
        Ok(Self {
            store,
            owners: RwLock::new(owners),
        })
    }

    /// Record that `slot` is now served by `owner`. From the moment this
    /// returns, the source redirects reads of the slot.
    pub fn set_slot_migrated(&self, slot: u16, owner: SlotOwner) -> anyhow::Result<()> {
        let partition = self.store.open_partition(Self::PARTITION)?;
        partition
            .insert(slot.to_be_bytes(), serde_json::to_vec(&owner)?)
            .context("persist slot owner")?;
        let mut owners = self.owners.write().unwrap_or_else(|p| p.into_inner());
        owners.insert(slot, owner);
        Ok(())
    }

    pub fn owner(&self, slot: u16) -> Option<SlotOwner> {
        let owners = self.owners.read().unwrap_or_else(|p| p.into_inner());
        owners.get(&slot).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gate_admits_one_migration_at_a_time() {
        let gate = SlotGate::new();
        assert!(gate.try_begin(7));
        assert!(!gate.try_begin(8), "second claim must fail");
        assert_eq!(gate.migrating_slot(), Some(7));
        gate.end();
        assert_eq!(gate.migrating_slot(), None);
        assert!(gate.try_begin(8));
    }

    #[test]
    fn forbidden_and_failed_registers_are_independent() {
        let gate = SlotGate::new();
        gate.set_forbidden(3);
        gate.set_failed(4);
        assert_eq!(gate.forbidden_slot(), Some(3));
        assert_eq!(gate.failed_slot(), Some(4));
        gate.release_forbidden();
        gate.clear_failed();
        assert_eq!(gate.forbidden_slot(), None);
        assert_eq!(gate.failed_slot(), None);
    }

    #[test]
    fn topology_survives_reopen() {
        let dir = tempfile::tempdir().expect("create temp dir");
        let owner = SlotOwner {
            node_id: "node-b".to_string(),
            addr: "127.0.0.1:6666".to_string(),
        };
        {
            let store = Store::open(dir.path()).expect("open store");
            let topology = Topology::open(store).expect("open topology");
            topology
                .set_slot_migrated(12, owner.clone())
                .expect("persist owner");
        }
        let store = Store::open(dir.path()).expect("reopen store");
        let topology = Topology::open(store).expect("reopen topology");
        assert_eq!(topology.owner(12), Some(owner));
        assert_eq!(topology.owner(13), None);
    }
}
