//! Finalizer protocol
//!
//! The `nfspvc.dana.io/nfspvc-protection` finalizer keeps an NfsPvc in the
//! store until both of its storage objects are confirmed gone.
//!
//! ```text
//!   Active ──(deletion requested)──▶ Terminating ──(claim + volume absent)──▶ Released
//! ```

use super::retry::{update_with_retry, RetryPolicy};
use crate::crd::{NfsPvc, NFSPVC_FINALIZER, NFSPVC_KIND};
use crate::domain::ClusterStore;
use crate::error::{ignore_not_found, Result};
use kube::ResourceExt;
use tracing::{debug, info};

/// Result of one cleanup pass over a terminating NfsPvc
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CleanupOutcome {
    /// Storage objects are gone and the finalizer has been removed
    Released,
    /// The claim is gone but the volume still exists; a delete was issued
    VolumePending,
    /// Deletes were issued for the remaining storage objects
    Deleting,
}

/// Add the finalizer unless it is already present.
///
/// Must run before any storage object is created for the resource. Returns
/// `true` when the live object carries the finalizer and is not terminating,
/// which is the only state in which storage may be created.
pub async fn ensure(store: &dyn ClusterStore, policy: &RetryPolicy, nfspvc: &NfsPvc) -> Result<bool> {
    if nfspvc.has_finalizer() {
        return Ok(!nfspvc.is_deleting());
    }

    let name = nfspvc.name_any();
    let namespace = nfspvc.namespace_or_err()?;
    let mut added = false;

    let current = update_with_retry(
        policy,
        NFSPVC_KIND,
        &name,
        || store.get_nfs_pvc(&name, &namespace),
        |current| {
            if current.has_finalizer() || current.is_deleting() {
                added = false;
                return false;
            }
            current.finalizers_mut().push(NFSPVC_FINALIZER.to_string());
            added = true;
            true
        },
        |updated| store.replace_nfs_pvc(updated),
    )
    .await?;

    let Some(current) = current else {
        debug!(name = %name, namespace = %namespace, "NfsPvc vanished before finalizer was added");
        return Ok(false);
    };

    if added {
        info!(name = %name, namespace = %namespace, "Added finalizer");
    }
    Ok(current.has_finalizer() && !current.is_deleting())
}

/// Remove the finalizer, releasing the resource to the store
pub async fn remove(store: &dyn ClusterStore, policy: &RetryPolicy, nfspvc: &NfsPvc) -> Result<()> {
    let name = nfspvc.name_any();
    let namespace = nfspvc.namespace_or_err()?;

    update_with_retry(
        policy,
        NFSPVC_KIND,
        &name,
        || store.get_nfs_pvc(&name, &namespace),
        |current| {
            let before = current.finalizers().len();
            current.finalizers_mut().retain(|f| f != NFSPVC_FINALIZER);
            current.finalizers().len() != before
        },
        |updated| store.replace_nfs_pvc(updated),
    )
    .await?;

    info!(name = %name, namespace = %namespace, "Removed finalizer");
    Ok(())
}

/// Run one cleanup pass for an NfsPvc whose deletion was requested
pub async fn handle_delete(
    store: &dyn ClusterStore,
    policy: &RetryPolicy,
    nfspvc: &NfsPvc,
) -> Result<CleanupOutcome> {
    if !nfspvc.has_finalizer() {
        return Ok(CleanupOutcome::Released);
    }

    let name = nfspvc.name_any();
    let namespace = nfspvc.namespace_or_err()?;
    let volume_name = nfspvc.volume_name()?;

    let claim = store.get_claim(&name, &namespace).await?;
    let volume = store.get_volume(&volume_name).await?;

    match (claim.is_some(), volume.is_some()) {
        (false, false) => {
            remove(store, policy, nfspvc).await?;
            Ok(CleanupOutcome::Released)
        }
        (false, true) => {
            debug!(volume = %volume_name, "Claim gone, deleting volume");
            ignore_not_found(store.delete_volume(&volume_name).await)?;
            Ok(CleanupOutcome::VolumePending)
        }
        _ => {
            info!(
                name = %name,
                namespace = %namespace,
                volume = %volume_name,
                "Deleting storage objects"
            );
            ignore_not_found(store.delete_claim(&name, &namespace).await)?;
            ignore_not_found(store.delete_volume(&volume_name).await)?;
            Ok(CleanupOutcome::Deleting)
        }
    }
}
