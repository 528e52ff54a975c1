//! NfsPvc CRD
//!
//! Declares an NFS export that should be exposed to a namespace as a
//! PersistentVolume / PersistentVolumeClaim pair.

use chrono::{DateTime, Utc};
use kube::{CustomResource, ResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::error::{Error, Result};

// =============================================================================
// Constants
// =============================================================================

/// API group of the NfsPvc resource
pub const NFSPVC_GROUP: &str = "nfspvc.dana.io";

/// Finalizer that gates NfsPvc deletion until its storage objects are gone
pub const NFSPVC_FINALIZER: &str = "nfspvc.dana.io/nfspvc-protection";

/// Label carrying the owning NfsPvc name on the generated PV and PVC
pub const OWNER_LABEL: &str = "nfspvc.dana.io/nfspvc-owner";

/// Label carrying the owning NfsPvc namespace on the generated PV and PVC
pub const OWNER_NAMESPACE_LABEL: &str = "nfspvc.dana.io/nfspvc-owner-namespace";

/// Resource name of the storage capacity entry
pub const STORAGE_RESOURCE: &str = "storage";

/// Kind strings used in errors and logs
pub const NFSPVC_KIND: &str = "NfsPvc";
pub const VOLUME_KIND: &str = "PersistentVolume";
pub const CLAIM_KIND: &str = "PersistentVolumeClaim";

// =============================================================================
// NfsPvc CRD
// =============================================================================

/// NfsPvc requests an NFS export to be made available as a claim in the
/// resource's namespace.
#[derive(CustomResource, Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "nfspvc.dana.io",
    version = "v1alpha1",
    kind = "NfsPvc",
    plural = "nfspvcs",
    shortname = "nfspvc",
    status = "NfsPvcStatus",
    namespaced,
    printcolumn = r#"{"name": "Server", "type": "string", "jsonPath": ".spec.server"}"#,
    printcolumn = r#"{"name": "Path", "type": "string", "jsonPath": ".spec.path"}"#,
    printcolumn = r#"{"name": "PVC", "type": "string", "jsonPath": ".status.pvcPhase"}"#,
    printcolumn = r#"{"name": "PV", "type": "string", "jsonPath": ".status.pvPhase"}"#,
    printcolumn = r#"{"name": "Age", "type": "date", "jsonPath": ".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct NfsPvcSpec {
    /// Access modes of the claim (ReadWriteOnce, ReadOnlyMany, ReadWriteMany, ReadWriteOncePod)
    #[serde(default)]
    pub access_modes: Vec<String>,

    /// Capacity of the volume, e.g. `storage: 5Gi`
    #[serde(default)]
    pub capacity: BTreeMap<String, String>,

    /// Exported path on the NFS server
    pub path: String,

    /// NFS server address
    pub server: String,

    /// NFS protocol version, rendered as the `nfsvers` mount option
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nfs_version: Option<String>,
}

// =============================================================================
// Status
// =============================================================================

/// Observed state of the NfsPvc
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct NfsPvcStatus {
    /// Last observed phase of the generated PersistentVolumeClaim
    #[serde(default)]
    pub pvc_phase: String,

    /// Last observed phase of the generated PersistentVolume
    #[serde(default)]
    pub pv_phase: String,

    /// Conditions
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<NfsPvcCondition>,
}

/// Condition for NfsPvc status
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct NfsPvcCondition {
    /// Type of condition
    pub r#type: String,
    /// Status: True, False, Unknown
    pub status: ConditionStatus,
    /// Last transition time
    #[serde(default)]
    #[schemars(with = "Option<String>")]
    pub last_transition_time: Option<DateTime<Utc>>,
    /// Machine-readable reason
    #[serde(default)]
    pub reason: Option<String>,
    /// Human-readable message
    #[serde(default)]
    pub message: Option<String>,
}

/// Condition status values
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub enum ConditionStatus {
    True,
    False,
    Unknown,
}

/// Condition type raised when a reconciliation pass fails
pub const ERROR_CONDITION: &str = "Error";

impl NfsPvcStatus {
    /// Set a condition, replacing existing if same type.
    ///
    /// The transition time is only moved when the status value changes.
    pub fn set_condition(&mut self, mut condition: NfsPvcCondition) {
        if let Some(existing) = self
            .conditions
            .iter_mut()
            .find(|c| c.r#type == condition.r#type)
        {
            if existing.status == condition.status {
                condition.last_transition_time = existing.last_transition_time;
            }
            *existing = condition;
        } else {
            self.conditions.push(condition);
        }
    }

    /// Look up a condition by type
    pub fn condition(&self, condition_type: &str) -> Option<&NfsPvcCondition> {
        self.conditions.iter().find(|c| c.r#type == condition_type)
    }

    /// Whether the last pass left the resource in the Error condition
    pub fn has_error(&self) -> bool {
        self.condition(ERROR_CONDITION)
            .is_some_and(|c| c.status == ConditionStatus::True)
    }
}

// =============================================================================
// Naming
// =============================================================================

/// Name of the cluster-scoped PersistentVolume backing an NfsPvc.
///
/// Used both to create the volume and to map volume events back to the owner.
pub fn volume_name(name: &str, namespace: &str) -> String {
    format!("{}-{}-pv", name, namespace)
}

// =============================================================================
// Implementations
// =============================================================================

impl NfsPvc {
    /// Namespace of this resource; NfsPvc is namespaced so a missing value is invalid
    pub fn namespace_or_err(&self) -> Result<String> {
        self.namespace().ok_or_else(|| Error::InvalidResource {
            kind: NFSPVC_KIND.into(),
            name: self.name_any(),
            reason: "NfsPvc must be namespaced".into(),
        })
    }

    /// Name of the PersistentVolume generated for this resource
    pub fn volume_name(&self) -> Result<String> {
        Ok(volume_name(&self.name_any(), &self.namespace_or_err()?))
    }

    /// Whether deletion has been requested
    pub fn is_deleting(&self) -> bool {
        self.metadata.deletion_timestamp.is_some()
    }

    /// Whether the deletion finalizer is present
    pub fn has_finalizer(&self) -> bool {
        self.finalizers().iter().any(|f| f == NFSPVC_FINALIZER)
    }

    /// Current status, or the empty default
    pub fn status_or_default(&self) -> NfsPvcStatus {
        self.status.clone().unwrap_or_default()
    }

    /// Mount options for the generated volume
    pub fn mount_options(&self) -> Option<Vec<String>> {
        self.spec
            .nfs_version
            .as_deref()
            .filter(|v| !v.is_empty())
            .map(|v| vec![format!("nfsvers={}", v)])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kube::api::ObjectMeta;

    fn nfspvc(name: &str, namespace: Option<&str>) -> NfsPvc {
        NfsPvc {
            metadata: ObjectMeta {
                name: Some(name.into()),
                namespace: namespace.map(Into::into),
                ..Default::default()
            },
            spec: NfsPvcSpec {
                server: "nfs1".into(),
                path: "/export".into(),
                ..Default::default()
            },
            status: None,
        }
    }

    #[test]
    fn test_volume_name() {
        assert_eq!(volume_name("data", "team-a"), "data-team-a-pv");
        let obj = nfspvc("data", Some("team-a"));
        assert_eq!(obj.volume_name().unwrap(), "data-team-a-pv");
    }

    #[test]
    fn test_volume_name_requires_namespace() {
        let obj = nfspvc("data", None);
        assert!(obj.volume_name().is_err());
    }

    #[test]
    fn test_mount_options() {
        let mut obj = nfspvc("data", Some("default"));
        assert_eq!(obj.mount_options(), None);

        obj.spec.nfs_version = Some("4.1".into());
        assert_eq!(obj.mount_options(), Some(vec!["nfsvers=4.1".to_string()]));

        obj.spec.nfs_version = Some(String::new());
        assert_eq!(obj.mount_options(), None);
    }

    #[test]
    fn test_set_condition_keeps_transition_time() {
        let first = Utc::now() - chrono::Duration::minutes(5);
        let mut status = NfsPvcStatus::default();
        status.set_condition(NfsPvcCondition {
            r#type: ERROR_CONDITION.into(),
            status: ConditionStatus::True,
            last_transition_time: Some(first),
            reason: Some("ReconcileFailed".into()),
            message: Some("first".into()),
        });
        status.set_condition(NfsPvcCondition {
            r#type: ERROR_CONDITION.into(),
            status: ConditionStatus::True,
            last_transition_time: Some(Utc::now()),
            reason: Some("ReconcileFailed".into()),
            message: Some("second".into()),
        });

        assert_eq!(status.conditions.len(), 1);
        let cond = status.condition(ERROR_CONDITION).unwrap();
        assert_eq!(cond.last_transition_time, Some(first));
        assert_eq!(cond.message.as_deref(), Some("second"));
        assert!(status.has_error());
    }

    #[test]
    fn test_status_wire_format() {
        let status = NfsPvcStatus {
            pvc_phase: "Bound".into(),
            pv_phase: "Bound".into(),
            conditions: vec![],
        };
        let json = serde_json::to_value(&status).unwrap();
        assert_eq!(json, serde_json::json!({"pvcPhase": "Bound", "pvPhase": "Bound"}));
    }
}
