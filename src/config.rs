//! Operator Configuration
//!
//! Process-wide defaults applied to every generated PersistentVolume and
//! PersistentVolumeClaim. Built once at startup and shared by reference.

use crate::error::{Error, Result};
use std::fmt;
use std::str::FromStr;

// =============================================================================
// Reclaim Policy
// =============================================================================

/// Reclaim policy written on generated PersistentVolumes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReclaimPolicy {
    Retain,
    Delete,
    Recycle,
}

impl ReclaimPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReclaimPolicy::Retain => "Retain",
            ReclaimPolicy::Delete => "Delete",
            ReclaimPolicy::Recycle => "Recycle",
        }
    }
}

impl fmt::Display for ReclaimPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ReclaimPolicy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "Retain" => Ok(ReclaimPolicy::Retain),
            "Delete" => Ok(ReclaimPolicy::Delete),
            "Recycle" => Ok(ReclaimPolicy::Recycle),
            other => Err(Error::Configuration(format!(
                "invalid default Persistent Volume Reclaim Policy {:?}, expected one of Retain, Delete, Recycle",
                other
            ))),
        }
    }
}

// =============================================================================
// Operator Configuration
// =============================================================================

/// Configuration for the storage synchronizer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OperatorConfig {
    /// Storage class set on generated PVs and PVCs
    pub storage_class: String,
    /// Reclaim policy set on generated PVs
    pub reclaim_policy: ReclaimPolicy,
}

impl OperatorConfig {
    /// Build and validate the configuration from raw settings
    pub fn new(storage_class: impl Into<String>, reclaim_policy: &str) -> Result<Self> {
        let storage_class = storage_class.into();
        if storage_class.trim().is_empty() {
            return Err(Error::Configuration(
                "storage class must not be empty".into(),
            ));
        }

        Ok(Self {
            storage_class,
            reclaim_policy: reclaim_policy.parse()?,
        })
    }
}
