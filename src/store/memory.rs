//! In-Memory Store Adapter
//!
//! A [`ClusterStore`] holding objects in process memory with the API server
//! semantics the engine depends on: resource versions with optimistic
//! concurrency, server-assigned UIDs, status subresource separation,
//! finalizer-aware deletion of NfsPvcs and initial `Pending` phases.
//!
//! Helpers prefixed with `external_` act as other writers in the cluster
//! (users, the volume binder) and are not counted as engine writes.

use crate::crd::{NfsPvc, CLAIM_KIND, NFSPVC_KIND, VOLUME_KIND};
use crate::domain::ports::ClusterStore;
use crate::error::{Error, Result};
use async_trait::async_trait;
use chrono::Utc;
use k8s_openapi::api::core::v1::{
    PersistentVolume, PersistentVolumeClaim, PersistentVolumeClaimStatus, PersistentVolumeStatus,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, Time};
use kube::ResourceExt;
use parking_lot::{Mutex, RwLock};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

// =============================================================================
// Fault Injection
// =============================================================================

/// Store operations that can be made to fail
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum StoreOp {
    GetNfsPvc,
    ReplaceNfsPvc,
    ReplaceNfsPvcStatus,
    GetVolume,
    CreateVolume,
    ReplaceVolume,
    DeleteVolume,
    GetClaim,
    CreateClaim,
    ReplaceClaim,
    DeleteClaim,
}

/// Failure returned by an injected fault
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    /// Version conflict, as if another writer got there first
    Conflict,
    /// Store unreachable
    Unavailable,
}

// =============================================================================
// Store State
// =============================================================================

type NamespacedKey = (String, String);

#[derive(Default)]
struct StoreState {
    nfs_pvcs: BTreeMap<NamespacedKey, NfsPvc>,
    volumes: BTreeMap<String, PersistentVolume>,
    claims: BTreeMap<NamespacedKey, PersistentVolumeClaim>,
    /// Monotonic revision used for resource versions and UIDs
    revision: u64,
}

impl StoreState {
    fn next_revision(&mut self) -> String {
        self.revision += 1;
        self.revision.to_string()
    }

    fn stamp_new(&mut self, meta: &mut ObjectMeta) {
        let revision = self.next_revision();
        meta.uid = Some(format!("uid-{:08}", revision));
        meta.resource_version = Some(revision);
        meta.creation_timestamp = Some(Time(Utc::now()));
        meta.deletion_timestamp = None;
    }
}

/// Reject a write whose resource version does not match the stored one.
///
/// A missing version on the incoming object is an unconditional write.
fn check_version(incoming: &ObjectMeta, stored: &ObjectMeta, kind: &str, name: &str) -> Result<()> {
    match &incoming.resource_version {
        Some(version) if Some(version) != stored.resource_version.as_ref() => Err(Error::Conflict {
            kind: kind.into(),
            name: name.into(),
        }),
        _ => Ok(()),
    }
}

fn not_found(kind: &str, name: &str) -> Error {
    Error::ResourceNotFound {
        kind: kind.into(),
        name: name.into(),
    }
}

// =============================================================================
// In-Memory Store
// =============================================================================

/// Object store kept in process memory
#[derive(Default)]
pub struct InMemoryStore {
    state: RwLock<StoreState>,
    faults: Mutex<BTreeMap<StoreOp, (Fault, u32)>>,
    writes: AtomicU64,
}

impl InMemoryStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of successful writes issued through the [`ClusterStore`] port
    pub fn writes(&self) -> u64 {
        self.writes.load(Ordering::SeqCst)
    }

    /// Make the next `times` calls of `op` fail with `fault`
    pub fn inject_fault(&self, op: StoreOp, fault: Fault, times: u32) {
        if times > 0 {
            self.faults.lock().insert(op, (fault, times));
        }
    }

    /// Clear all injected faults
    pub fn clear_faults(&self) {
        self.faults.lock().clear();
    }

    fn take_fault(&self, op: StoreOp, kind: &str, name: &str) -> Result<()> {
        let mut faults = self.faults.lock();
        let Some((fault, remaining)) = faults.get_mut(&op) else {
            return Ok(());
        };
        let fault = *fault;
        *remaining -= 1;
        if *remaining == 0 {
            faults.remove(&op);
        }

        match fault {
            Fault::Conflict => Err(Error::Conflict {
                kind: kind.into(),
                name: name.into(),
            }),
            Fault::Unavailable => Err(Error::Internal(format!(
                "store unavailable during {:?} on {}/{}",
                op, kind, name
            ))),
        }
    }

    fn record_write(&self) {
        self.writes.fetch_add(1, Ordering::SeqCst);
    }

    // =========================================================================
    // External Writers
    // =========================================================================

    /// Create an NfsPvc as a user would
    pub fn external_create_nfs_pvc(&self, mut nfspvc: NfsPvc) -> Result<NfsPvc> {
        let name = nfspvc.name_any();
        let namespace = nfspvc.namespace_or_err()?;
        let key = (namespace, name.clone());

        let mut state = self.state.write();
        if state.nfs_pvcs.contains_key(&key) {
            return Err(Error::ResourceExists {
                kind: NFSPVC_KIND.into(),
                name,
            });
        }
        state.stamp_new(&mut nfspvc.metadata);
        state.nfs_pvcs.insert(key, nfspvc.clone());
        Ok(nfspvc)
    }

    /// Request deletion of an NfsPvc as a user would.
    ///
    /// With finalizers present the object only gets a deletion timestamp.
    pub fn external_delete_nfs_pvc(&self, name: &str, namespace: &str) -> Result<()> {
        let key = (namespace.to_string(), name.to_string());
        let mut state = self.state.write();
        let revision = state.next_revision();

        let Some(existing) = state.nfs_pvcs.get_mut(&key) else {
            return Err(not_found(NFSPVC_KIND, name));
        };
        if existing.finalizers().is_empty() {
            state.nfs_pvcs.remove(&key);
        } else if existing.metadata.deletion_timestamp.is_none() {
            existing.metadata.deletion_timestamp = Some(Time(Utc::now()));
            existing.metadata.resource_version = Some(revision);
        }
        Ok(())
    }

    /// Mutate a PersistentVolume as another controller would, status included
    pub fn external_update_volume(
        &self,
        name: &str,
        mutate: impl FnOnce(&mut PersistentVolume),
    ) -> Result<PersistentVolume> {
        let mut state = self.state.write();
        let revision = state.next_revision();
        let volume = state
            .volumes
            .get_mut(name)
            .ok_or_else(|| not_found(VOLUME_KIND, name))?;
        mutate(volume);
        volume.metadata.resource_version = Some(revision);
        Ok(volume.clone())
    }

    /// Mutate a PersistentVolumeClaim as another controller would, status included
    pub fn external_update_claim(
        &self,
        name: &str,
        namespace: &str,
        mutate: impl FnOnce(&mut PersistentVolumeClaim),
    ) -> Result<PersistentVolumeClaim> {
        let key = (namespace.to_string(), name.to_string());
        let mut state = self.state.write();
        let revision = state.next_revision();
        let claim = state
            .claims
            .get_mut(&key)
            .ok_or_else(|| not_found(CLAIM_KIND, name))?;
        mutate(claim);
        claim.metadata.resource_version = Some(revision);
        Ok(claim.clone())
    }

    /// Delete a PersistentVolumeClaim as a user would
    pub fn external_delete_claim(&self, name: &str, namespace: &str) -> Result<()> {
        let key = (namespace.to_string(), name.to_string());
        self.state
            .write()
            .claims
            .remove(&key)
            .map(|_| ())
            .ok_or_else(|| not_found(CLAIM_KIND, name))
    }

    /// Bind a volume and claim the way the volume binder does
    pub fn external_bind(&self, volume: &str, claim: &str, namespace: &str) -> Result<()> {
        let claim_uid = self
            .external_update_claim(claim, namespace, |pvc| {
                pvc.status = Some(PersistentVolumeClaimStatus {
                    phase: Some("Bound".into()),
                    ..Default::default()
                });
                pvc.metadata
                    .annotations
                    .get_or_insert_with(BTreeMap::new)
                    .insert("pv.kubernetes.io/bind-completed".into(), "yes".into());
            })?
            .metadata
            .uid;

        self.external_update_volume(volume, |pv| {
            if let Some(spec) = pv.spec.as_mut() {
                let claim_ref = spec.claim_ref.get_or_insert_with(Default::default);
                claim_ref.name = Some(claim.into());
                claim_ref.namespace = Some(namespace.into());
                claim_ref.uid = claim_uid;
            }
            pv.status = Some(PersistentVolumeStatus {
                phase: Some("Bound".into()),
                ..Default::default()
            });
        })?;
        Ok(())
    }
}

#[async_trait]
impl ClusterStore for InMemoryStore {
    async fn get_nfs_pvc(&self, name: &str, namespace: &str) -> Result<Option<NfsPvc>> {
        self.take_fault(StoreOp::GetNfsPvc, NFSPVC_KIND, name)?;
        let key = (namespace.to_string(), name.to_string());
        Ok(self.state.read().nfs_pvcs.get(&key).cloned())
    }

    async fn replace_nfs_pvc(&self, mut nfspvc: NfsPvc) -> Result<NfsPvc> {
        let name = nfspvc.name_any();
        self.take_fault(StoreOp::ReplaceNfsPvc, NFSPVC_KIND, &name)?;
        let key = (nfspvc.namespace_or_err()?, name.clone());

        let mut state = self.state.write();
        let stored = state
            .nfs_pvcs
            .get(&key)
            .ok_or_else(|| not_found(NFSPVC_KIND, &name))?;
        check_version(&nfspvc.metadata, &stored.metadata, NFSPVC_KIND, &name)?;

        // Status, identity and the deletion timestamp are server-owned.
        nfspvc.status = stored.status.clone();
        nfspvc.metadata.uid = stored.metadata.uid.clone();
        nfspvc.metadata.creation_timestamp = stored.metadata.creation_timestamp.clone();
        nfspvc.metadata.deletion_timestamp = stored.metadata.deletion_timestamp.clone();
        nfspvc.metadata.resource_version = Some(state.next_revision());

        if nfspvc.is_deleting() && nfspvc.finalizers().is_empty() {
            state.nfs_pvcs.remove(&key);
        } else {
            state.nfs_pvcs.insert(key, nfspvc.clone());
        }
        drop(state);

        self.record_write();
        Ok(nfspvc)
    }

    async fn replace_nfs_pvc_status(&self, nfspvc: NfsPvc) -> Result<NfsPvc> {
        let name = nfspvc.name_any();
        self.take_fault(StoreOp::ReplaceNfsPvcStatus, NFSPVC_KIND, &name)?;
        let key = (nfspvc.namespace_or_err()?, name.clone());

        let mut state = self.state.write();
        let revision = state.next_revision();
        let stored = state
            .nfs_pvcs
            .get_mut(&key)
            .ok_or_else(|| not_found(NFSPVC_KIND, &name))?;
        check_version(&nfspvc.metadata, &stored.metadata, NFSPVC_KIND, &name)?;

        stored.status = nfspvc.status;
        stored.metadata.resource_version = Some(revision);
        let updated = stored.clone();
        drop(state);

        self.record_write();
        Ok(updated)
    }

    async fn get_volume(&self, name: &str) -> Result<Option<PersistentVolume>> {
        self.take_fault(StoreOp::GetVolume, VOLUME_KIND, name)?;
        Ok(self.state.read().volumes.get(name).cloned())
    }

    async fn create_volume(&self, mut volume: PersistentVolume) -> Result<PersistentVolume> {
        let name = volume.name_any();
        self.take_fault(StoreOp::CreateVolume, VOLUME_KIND, &name)?;

        let mut state = self.state.write();
        if state.volumes.contains_key(&name) {
            return Err(Error::ResourceExists {
                kind: VOLUME_KIND.into(),
                name,
            });
        }
        state.stamp_new(&mut volume.metadata);
        volume.status = Some(PersistentVolumeStatus {
            phase: Some("Pending".into()),
            ..Default::default()
        });
        state.volumes.insert(name, volume.clone());
        drop(state);

        self.record_write();
        Ok(volume)
    }

    async fn replace_volume(&self, mut volume: PersistentVolume) -> Result<PersistentVolume> {
        let name = volume.name_any();
        self.take_fault(StoreOp::ReplaceVolume, VOLUME_KIND, &name)?;

        let mut state = self.state.write();
        let revision = state.next_revision();
        let stored = state
            .volumes
            .get_mut(&name)
            .ok_or_else(|| not_found(VOLUME_KIND, &name))?;
        check_version(&volume.metadata, &stored.metadata, VOLUME_KIND, &name)?;

        volume.status = stored.status.clone();
        volume.metadata.uid = stored.metadata.uid.clone();
        volume.metadata.resource_version = Some(revision);
        *stored = volume.clone();
        drop(state);

        self.record_write();
        Ok(volume)
    }

    async fn delete_volume(&self, name: &str) -> Result<()> {
        self.take_fault(StoreOp::DeleteVolume, VOLUME_KIND, name)?;
        self.state
            .write()
            .volumes
            .remove(name)
            .ok_or_else(|| not_found(VOLUME_KIND, name))?;
        self.record_write();
        Ok(())
    }

    async fn get_claim(
        &self,
        name: &str,
        namespace: &str,
    ) -> Result<Option<PersistentVolumeClaim>> {
        self.take_fault(StoreOp::GetClaim, CLAIM_KIND, name)?;
        let key = (namespace.to_string(), name.to_string());
        Ok(self.state.read().claims.get(&key).cloned())
    }

    async fn create_claim(&self, mut claim: PersistentVolumeClaim) -> Result<PersistentVolumeClaim> {
        let name = claim.name_any();
        self.take_fault(StoreOp::CreateClaim, CLAIM_KIND, &name)?;
        let namespace = claim.namespace().ok_or_else(|| Error::InvalidResource {
            kind: CLAIM_KIND.into(),
            name: name.clone(),
            reason: "object has no namespace".into(),
        })?;
        let key = (namespace, name.clone());

        let mut state = self.state.write();
        if state.claims.contains_key(&key) {
            return Err(Error::ResourceExists {
                kind: CLAIM_KIND.into(),
                name,
            });
        }
        state.stamp_new(&mut claim.metadata);
        claim.status = Some(PersistentVolumeClaimStatus {
            phase: Some("Pending".into()),
            ..Default::default()
        });
        state.claims.insert(key, claim.clone());
        drop(state);

        self.record_write();
        Ok(claim)
    }

    async fn replace_claim(&self, mut claim: PersistentVolumeClaim) -> Result<PersistentVolumeClaim> {
        let name = claim.name_any();
        self.take_fault(StoreOp::ReplaceClaim, CLAIM_KIND, &name)?;
        let key = (claim.namespace().unwrap_or_default(), name.clone());

        let mut state = self.state.write();
        let revision = state.next_revision();
        let stored = state
            .claims
            .get_mut(&key)
            .ok_or_else(|| not_found(CLAIM_KIND, &name))?;
        check_version(&claim.metadata, &stored.metadata, CLAIM_KIND, &name)?;

        claim.status = stored.status.clone();
        claim.metadata.uid = stored.metadata.uid.clone();
        claim.metadata.resource_version = Some(revision);
        *stored = claim.clone();
        drop(state);

        self.record_write();
        Ok(claim)
    }

    async fn delete_claim(&self, name: &str, namespace: &str) -> Result<()> {
        self.take_fault(StoreOp::DeleteClaim, CLAIM_KIND, name)?;
        let key = (namespace.to_string(), name.to_string());
        self.state
            .write()
            .claims
            .remove(&key)
            .ok_or_else(|| not_found(CLAIM_KIND, name))?;
        self.record_write();
        Ok(())
    }
}
