//! NfsPvc admission validation
//!
//! Create requests are checked for field sanity, supported access modes and
//! collisions with an existing claim of the same name. Update requests may
//! only change `nfsVersion`. Deletes are always admitted.

use crate::crd::{NfsPvc, STORAGE_RESOURCE};
use crate::domain::ClusterStoreRef;
use crate::error::{Error, Result};
use kube::core::admission::{AdmissionRequest, Operation};
use kube::ResourceExt;
use std::collections::{BTreeMap, BTreeSet};
use thiserror::Error;
use tracing::{debug, info, warn};

/// Access modes an NfsPvc may request
pub const SUPPORTED_ACCESS_MODES: [&str; 4] =
    ["ReadWriteOnce", "ReadOnlyMany", "ReadWriteMany", "ReadWriteOncePod"];

/// Reason an admission request is denied
#[derive(Error, Debug, Clone, PartialEq)]
pub enum Rejection {
    #[error("a PVC of this name already exists in the namespace. Please rename your NFSPVC")]
    ClaimExists,

    #[error("could not check for an existing PVC named {name}: {reason}")]
    ClaimLookupFailed { name: String, reason: String },

    #[error(
        "forbidden: only the following AccessModes are permitted: ReadWriteOnce, ReadOnlyMany, ReadWriteMany, ReadWriteOncePod (got {0})"
    )]
    UnsupportedAccessMode(String),

    #[error("spec.accessModes must list at least one access mode")]
    NoAccessModes,

    #[error("spec.{0} must not be empty")]
    EmptyField(&'static str),

    #[error("spec.capacity must contain a valid storage quantity: {0}")]
    InvalidCapacity(String),

    #[error("spec.{0} is immutable")]
    Immutable(&'static str),

    #[error("admission request carries no {0} object")]
    MissingObject(&'static str),
}

// =============================================================================
// Quantity Parsing
// =============================================================================

/// Parse a resource quantity such as `5Gi`, `500M`, `1.5Ti`, `5e9` or `+1Gi`
/// into its value.
///
/// Follows the Kubernetes quantity grammar: an optional sign, a decimal
/// number, then a binary SI suffix, a decimal SI suffix or a decimal exponent.
pub fn parse_quantity(s: &str) -> Result<f64> {
    let s = s.trim();
    if s.is_empty() {
        return Err(Error::QuantityParse("empty quantity".into()));
    }

    let (sign, unsigned) = match s.as_bytes()[0] {
        b'+' => (1.0, &s[1..]),
        b'-' => (-1.0, &s[1..]),
        _ => (1.0, s),
    };

    let num_end = unsigned
        .char_indices()
        .find(|(_, c)| !c.is_ascii_digit() && *c != '.')
        .map(|(i, _)| i)
        .unwrap_or(unsigned.len());

    let (num_str, suffix) = unsigned.split_at(num_end);
    if !num_str.bytes().any(|b| b.is_ascii_digit()) {
        return Err(Error::QuantityParse(format!("invalid number in {:?}", s)));
    }
    let num: f64 = num_str
        .parse()
        .map_err(|_| Error::QuantityParse(format!("invalid number in {:?}", s)))?;

    let multiplier: f64 = match suffix {
        "" => 1.0,
        "m" => 1e-3,
        "k" => 1e3,
        "M" => 1e6,
        "G" => 1e9,
        "T" => 1e12,
        "P" => 1e15,
        "E" => 1e18,
        "Ki" => 1024.0,
        "Mi" => 1024f64.powi(2),
        "Gi" => 1024f64.powi(3),
        "Ti" => 1024f64.powi(4),
        "Pi" => 1024f64.powi(5),
        "Ei" => 1024f64.powi(6),
        exp if exp.starts_with(['e', 'E']) => {
            let exponent: i32 = exp[1..]
                .parse()
                .map_err(|_| Error::QuantityParse(format!("invalid exponent in {:?}", s)))?;
            10f64.powi(exponent)
        }
        other => {
            return Err(Error::QuantityParse(format!("unknown unit {:?}", other)));
        }
    };

    Ok(sign * num * multiplier)
}

fn same_quantity(a: &str, b: &str) -> bool {
    match (parse_quantity(a), parse_quantity(b)) {
        (Ok(a), Ok(b)) => a == b,
        _ => a == b,
    }
}

fn same_capacity(old: &BTreeMap<String, String>, new: &BTreeMap<String, String>) -> bool {
    old.len() == new.len()
        && old
            .iter()
            .all(|(resource, amount)| new.get(resource).is_some_and(|n| same_quantity(amount, n)))
}

fn mode_set(modes: &[String]) -> BTreeSet<&str> {
    modes.iter().map(String::as_str).collect()
}

// =============================================================================
// Validator
// =============================================================================

/// Validates NfsPvc create and update requests
pub struct NfsPvcValidator {
    store: ClusterStoreRef,
}

impl NfsPvcValidator {
    pub fn new(store: ClusterStoreRef) -> Self {
        Self { store }
    }

    /// Validate an admission request for any operation
    pub async fn review(&self, request: &AdmissionRequest<NfsPvc>) -> std::result::Result<(), Rejection> {
        match request.operation {
            Operation::Create => {
                let mut nfspvc = request
                    .object
                    .clone()
                    .ok_or(Rejection::MissingObject("new"))?;
                if nfspvc.metadata.namespace.is_none() {
                    nfspvc.metadata.namespace = request.namespace.clone();
                }
                self.validate_create(&nfspvc).await
            }
            Operation::Update => match (&request.old_object, &request.object) {
                (Some(old), Some(new)) => self.validate_update(old, new),
                (None, _) => Err(Rejection::MissingObject("old")),
                (_, None) => Err(Rejection::MissingObject("new")),
            },
            Operation::Delete => match &request.old_object {
                Some(old) => self.validate_delete(old),
                None => Ok(()),
            },
            Operation::Connect => Ok(()),
        }
    }

    /// Validate a new NfsPvc
    pub async fn validate_create(&self, nfspvc: &NfsPvc) -> std::result::Result<(), Rejection> {
        let name = nfspvc.name_any();
        info!(name = %name, namespace = ?nfspvc.namespace(), "Validating create");

        Self::validate_fields(nfspvc)?;

        let namespace = nfspvc.namespace().unwrap_or_default();
        match self.store.get_claim(&name, &namespace).await {
            Ok(None) => {}
            Ok(Some(_)) => return Err(Rejection::ClaimExists),
            Err(err) => {
                warn!(name = %name, error = %err, "Claim lookup failed during admission");
                return Err(Rejection::ClaimLookupFailed {
                    name,
                    reason: err.to_string(),
                });
            }
        }

        if let Some(mode) = nfspvc
            .spec
            .access_modes
            .iter()
            .find(|m| !SUPPORTED_ACCESS_MODES.contains(&m.as_str()))
        {
            return Err(Rejection::UnsupportedAccessMode(mode.clone()));
        }

        Ok(())
    }

    /// Validate a change to an existing NfsPvc
    pub fn validate_update(&self, old: &NfsPvc, new: &NfsPvc) -> std::result::Result<(), Rejection> {
        info!(name = %new.name_any(), namespace = ?new.namespace(), "Validating update");

        if old.spec.server != new.spec.server {
            return Err(Rejection::Immutable("server"));
        }
        if old.spec.path != new.spec.path {
            return Err(Rejection::Immutable("path"));
        }
        if !same_capacity(&old.spec.capacity, &new.spec.capacity) {
            return Err(Rejection::Immutable("capacity"));
        }
        if mode_set(&old.spec.access_modes) != mode_set(&new.spec.access_modes) {
            return Err(Rejection::Immutable("accessModes"));
        }
        Ok(())
    }

    /// Deletes are gated by the finalizer, not by admission
    pub fn validate_delete(&self, nfspvc: &NfsPvc) -> std::result::Result<(), Rejection> {
        debug!(name = %nfspvc.name_any(), namespace = ?nfspvc.namespace(), "Admitting delete");
        Ok(())
    }

    fn validate_fields(nfspvc: &NfsPvc) -> std::result::Result<(), Rejection> {
        let spec = &nfspvc.spec;
        if spec.server.trim().is_empty() {
            return Err(Rejection::EmptyField("server"));
        }
        if spec.path.trim().is_empty() {
            return Err(Rejection::EmptyField("path"));
        }
        if spec.access_modes.is_empty() {
            return Err(Rejection::NoAccessModes);
        }

        let storage = spec
            .capacity
            .get(STORAGE_RESOURCE)
            .ok_or_else(|| Rejection::InvalidCapacity("missing".into()))?;
        parse_quantity(storage).map_err(|e| Rejection::InvalidCapacity(e.to_string()))?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::NfsPvcSpec;
    use crate::domain::ClusterStore;
    use crate::store::{Fault, InMemoryStore, StoreOp};
    use assert_matches::assert_matches;
    use k8s_openapi::api::core::v1::PersistentVolumeClaim;
    use kube::api::ObjectMeta;
    use std::sync::Arc;

    fn request(capacity: &str, modes: &[&str]) -> NfsPvc {
        let mut obj = NfsPvc::new(
            "data",
            NfsPvcSpec {
                server: "nfs1".into(),
                path: "/export".into(),
                capacity: [("storage".to_string(), capacity.to_string())].into(),
                access_modes: modes.iter().map(|m| m.to_string()).collect(),
                nfs_version: None,
            },
        );
        obj.metadata.namespace = Some("default".into());
        obj
    }

    fn validator() -> (Arc<InMemoryStore>, NfsPvcValidator) {
        let store = Arc::new(InMemoryStore::new());
        (store.clone(), NfsPvcValidator::new(store))
    }

    #[test]
    fn test_parse_quantity() {
        assert_eq!(parse_quantity("5Gi").unwrap(), 5.0 * 1024f64.powi(3));
        assert_eq!(parse_quantity("1024Mi").unwrap(), parse_quantity("1Gi").unwrap());
        assert_eq!(parse_quantity("500M").unwrap(), 5e8);
        assert_eq!(parse_quantity("1.5Ki").unwrap(), 1536.0);
        assert_eq!(parse_quantity("100").unwrap(), 100.0);
        assert_eq!(parse_quantity("5e9").unwrap(), 5e9);
        assert_eq!(parse_quantity("1E3").unwrap(), 1000.0);
        assert_eq!(parse_quantity("+1Gi").unwrap(), parse_quantity("1Gi").unwrap());
        assert_eq!(parse_quantity("-2k").unwrap(), -2000.0);
        assert!(parse_quantity("").is_err());
        assert!(parse_quantity("+").is_err());
        assert!(parse_quantity("5e").is_err());
        assert!(parse_quantity(".Gi").is_err());
        assert!(parse_quantity("Gi").is_err());
        assert!(parse_quantity("5GB").is_err());
    }

    #[tokio::test]
    async fn test_create_accepts_valid_request() {
        let (_, validator) = validator();
        let obj = request("5Gi", &["ReadWriteMany", "ReadOnlyMany"]);
        assert_eq!(validator.validate_create(&obj).await, Ok(()));

        for capacity in ["5e9", "+1Gi"] {
            let obj = request(capacity, &["ReadWriteMany"]);
            assert_eq!(validator.validate_create(&obj).await, Ok(()), "{}", capacity);
        }
    }

    #[tokio::test]
    async fn test_create_rejects_name_collision() {
        let (store, validator) = validator();
        store
            .create_claim(PersistentVolumeClaim {
                metadata: ObjectMeta {
                    name: Some("data".into()),
                    namespace: Some("default".into()),
                    ..Default::default()
                },
                ..Default::default()
            })
            .await
            .unwrap();

        let obj = request("5Gi", &["ReadWriteMany"]);
        assert_eq!(validator.validate_create(&obj).await, Err(Rejection::ClaimExists));

        let mut elsewhere = obj;
        elsewhere.metadata.namespace = Some("other".into());
        assert_eq!(validator.validate_create(&elsewhere).await, Ok(()));
    }

    #[tokio::test]
    async fn test_create_fails_closed_on_lookup_error() {
        let (store, validator) = validator();
        store.inject_fault(StoreOp::GetClaim, Fault::Unavailable, 1);

        let result = validator.validate_create(&request("5Gi", &["ReadWriteMany"])).await;
        assert_matches!(result, Err(Rejection::ClaimLookupFailed { .. }));
    }

    #[tokio::test]
    async fn test_create_rejects_unsupported_access_mode() {
        let (_, validator) = validator();
        let obj = request("5Gi", &["ReadWriteMany", "ReadWriteAll"]);
        assert_eq!(
            validator.validate_create(&obj).await,
            Err(Rejection::UnsupportedAccessMode("ReadWriteAll".into()))
        );
    }

    #[tokio::test]
    async fn test_create_rejects_incomplete_spec() {
        let (_, validator) = validator();

        let mut obj = request("5Gi", &["ReadWriteMany"]);
        obj.spec.server = String::new();
        assert_eq!(validator.validate_create(&obj).await, Err(Rejection::EmptyField("server")));

        let obj = request("5Gi", &[]);
        assert_eq!(validator.validate_create(&obj).await, Err(Rejection::NoAccessModes));

        let obj = request("lots", &["ReadWriteMany"]);
        assert_matches!(
            validator.validate_create(&obj).await,
            Err(Rejection::InvalidCapacity(_))
        );
    }

    #[test]
    fn test_update_immutable_fields() {
        let (_, validator) = validator();
        let old = request("5Gi", &["ReadWriteMany"]);

        let mut new = old.clone();
        new.spec.server = "nfs2".into();
        assert_eq!(validator.validate_update(&old, &new), Err(Rejection::Immutable("server")));

        let mut new = old.clone();
        new.spec.path = "/other".into();
        assert_eq!(validator.validate_update(&old, &new), Err(Rejection::Immutable("path")));

        let new = request("10Gi", &["ReadWriteMany"]);
        assert_eq!(validator.validate_update(&old, &new), Err(Rejection::Immutable("capacity")));

        let new = request("5Gi", &["ReadWriteOnce"]);
        assert_eq!(
            validator.validate_update(&old, &new),
            Err(Rejection::Immutable("accessModes"))
        );
    }

    #[test]
    fn test_update_allows_nfs_version_and_equivalent_values() {
        let (_, validator) = validator();
        let old = request("1Gi", &["ReadWriteMany", "ReadOnlyMany"]);

        let mut new = old.clone();
        new.spec.nfs_version = Some("4.1".into());
        assert_eq!(validator.validate_update(&old, &new), Ok(()));

        let new = request("1024Mi", &["ReadOnlyMany", "ReadWriteMany"]);
        assert_eq!(validator.validate_update(&old, &new), Ok(()));
    }

    #[test]
    fn test_delete_always_allowed() {
        let (_, validator) = validator();
        assert_eq!(validator.validate_delete(&request("5Gi", &["ReadWriteMany"])), Ok(()));
    }
}
