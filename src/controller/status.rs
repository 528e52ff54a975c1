//! Status projection
//!
//! Mirrors the live phases of the claim and volume onto the NfsPvc status
//! subresource and records failed passes as an `Error` condition.

use super::retry::{update_with_retry, RetryPolicy};
use crate::crd::{ConditionStatus, NfsPvc, NfsPvcCondition, ERROR_CONDITION, NFSPVC_KIND};
use crate::domain::ClusterStore;
use crate::error::{Error, Result};
use chrono::Utc;
use kube::ResourceExt;
use tracing::{debug, warn};

/// Phase reported for a storage object that does not exist
pub const PHASE_NOT_FOUND: &str = "NotFound";

/// Phase reported for a storage object that could not be read. An object
/// that exists without a phase is mirrored as the empty string.
pub const PHASE_UNKNOWN: &str = "Unknown";

fn observed_phase<T>(
    lookup: Result<Option<T>>,
    phase: impl FnOnce(&T) -> Option<String>,
    kind: &str,
) -> String {
    match lookup {
        Ok(Some(object)) => phase(&object).unwrap_or_default(),
        Ok(None) => PHASE_NOT_FOUND.to_string(),
        Err(err) => {
            warn!(kind = %kind, error = %err, "Could not read phase");
            PHASE_UNKNOWN.to_string()
        }
    }
}

/// Apply observed phases to an NfsPvc, returning whether anything changed
fn apply_phases(nfspvc: &mut NfsPvc, claim_phase: &str, volume_phase: &str) -> bool {
    let mut status = nfspvc.status_or_default();
    let mut changed = false;

    if status.pvc_phase != claim_phase {
        status.pvc_phase = claim_phase.to_string();
        changed = true;
    }
    if status.pv_phase != volume_phase {
        status.pv_phase = volume_phase.to_string();
        changed = true;
    }
    if status.has_error() {
        status.set_condition(NfsPvcCondition {
            r#type: ERROR_CONDITION.into(),
            status: ConditionStatus::False,
            last_transition_time: Some(Utc::now()),
            reason: Some("Reconciled".into()),
            message: None,
        });
        changed = true;
    }

    if changed {
        nfspvc.status = Some(status);
    }
    changed
}

/// Copy the current claim and volume phases onto the NfsPvc status.
///
/// Writes only when a phase changed or a previous error must be cleared.
pub async fn project(store: &dyn ClusterStore, policy: &RetryPolicy, nfspvc: &NfsPvc) -> Result<()> {
    let name = nfspvc.name_any();
    let namespace = nfspvc.namespace_or_err()?;
    let volume_name = nfspvc.volume_name()?;

    let claim_phase = observed_phase(
        store.get_claim(&name, &namespace).await,
        |claim| claim.status.as_ref()?.phase.clone(),
        "PersistentVolumeClaim",
    );
    let volume_phase = observed_phase(
        store.get_volume(&volume_name).await,
        |volume| volume.status.as_ref()?.phase.clone(),
        "PersistentVolume",
    );

    let mut updated = false;
    update_with_retry(
        policy,
        NFSPVC_KIND,
        &name,
        || store.get_nfs_pvc(&name, &namespace),
        |current| {
            updated = apply_phases(current, &claim_phase, &volume_phase);
            updated
        },
        |current| store.replace_nfs_pvc_status(current),
    )
    .await?;

    if updated {
        debug!(
            name = %name,
            namespace = %namespace,
            pvc_phase = %claim_phase,
            pv_phase = %volume_phase,
            "Updated status"
        );
    }
    Ok(())
}

/// Record a failed pass as an active `Error` condition
pub async fn mark_error(
    store: &dyn ClusterStore,
    policy: &RetryPolicy,
    name: &str,
    namespace: &str,
    error: &Error,
) -> Result<()> {
    let message = error.to_string();

    update_with_retry(
        policy,
        NFSPVC_KIND,
        name,
        || store.get_nfs_pvc(name, namespace),
        |current| {
            let mut status = current.status_or_default();
            let unchanged = status.condition(ERROR_CONDITION).is_some_and(|c| {
                c.status == ConditionStatus::True && c.message.as_deref() == Some(message.as_str())
            });
            if unchanged {
                return false;
            }

            status.set_condition(NfsPvcCondition {
                r#type: ERROR_CONDITION.into(),
                status: ConditionStatus::True,
                last_transition_time: Some(Utc::now()),
                reason: Some("ReconcileFailed".into()),
                message: Some(message.clone()),
            });
            current.status = Some(status);
            true
        },
        |current| store.replace_nfs_pvc_status(current),
    )
    .await?;

    Ok(())
}
