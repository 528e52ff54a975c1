//! Domain Ports - Object store boundary of the reconciliation engine
//!
//! The engine never talks to the Kubernetes API directly. Everything it reads
//! or writes goes through [`ClusterStore`], which the Kubernetes adapter and
//! the in-memory adapter implement.

use crate::crd::NfsPvc;
use crate::error::Result;
use async_trait::async_trait;
use k8s_openapi::api::core::v1::{PersistentVolume, PersistentVolumeClaim};
use std::sync::Arc;

// =============================================================================
// Cluster Store Port
// =============================================================================

/// Port for the object store holding NfsPvcs, PersistentVolumes and claims.
///
/// Semantics every adapter must honour:
/// - `get_*` returns `Ok(None)` for a missing object, never an error
/// - `replace_*` fails with [`crate::Error::Conflict`] when the object's
///   resource version is stale
/// - `create_*` fails with [`crate::Error::ResourceExists`] on a name collision
/// - `delete_*` fails with [`crate::Error::ResourceNotFound`] for a missing object
#[async_trait]
pub trait ClusterStore: Send + Sync {
    // -------------------------------------------------------------------------
    // NfsPvc
    // -------------------------------------------------------------------------

    /// Fetch an NfsPvc
    async fn get_nfs_pvc(&self, name: &str, namespace: &str) -> Result<Option<NfsPvc>>;

    /// Replace an NfsPvc's metadata and spec
    async fn replace_nfs_pvc(&self, nfspvc: NfsPvc) -> Result<NfsPvc>;

    /// Replace an NfsPvc's status subresource
    async fn replace_nfs_pvc_status(&self, nfspvc: NfsPvc) -> Result<NfsPvc>;

    // -------------------------------------------------------------------------
    // PersistentVolume (cluster scoped)
    // -------------------------------------------------------------------------

    /// Fetch a PersistentVolume
    async fn get_volume(&self, name: &str) -> Result<Option<PersistentVolume>>;

    /// Create a PersistentVolume
    async fn create_volume(&self, volume: PersistentVolume) -> Result<PersistentVolume>;

    /// Replace a PersistentVolume
    async fn replace_volume(&self, volume: PersistentVolume) -> Result<PersistentVolume>;

    /// Delete a PersistentVolume
    async fn delete_volume(&self, name: &str) -> Result<()>;

    // -------------------------------------------------------------------------
    // PersistentVolumeClaim
    // -------------------------------------------------------------------------

    /// Fetch a PersistentVolumeClaim
    async fn get_claim(&self, name: &str, namespace: &str)
        -> Result<Option<PersistentVolumeClaim>>;

    /// Create a PersistentVolumeClaim
    async fn create_claim(&self, claim: PersistentVolumeClaim) -> Result<PersistentVolumeClaim>;

    /// Replace a PersistentVolumeClaim
    async fn replace_claim(&self, claim: PersistentVolumeClaim) -> Result<PersistentVolumeClaim>;

    /// Delete a PersistentVolumeClaim
    async fn delete_claim(&self, name: &str, namespace: &str) -> Result<()>;
}

// =============================================================================
// Type Aliases for Arc'd Traits
// =============================================================================

pub type ClusterStoreRef = Arc<dyn ClusterStore>;
