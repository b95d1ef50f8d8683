//! Patch operations carried inside `patch` records.
//!
//! Paths are single-level: each names exactly one section. Nested paths
//! are not part of the protocol, so routing is a table lookup rather than
//! a pointer walk.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::PatchError;
use crate::sections::SectionKey;

/// A single document mutation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "typescript", derive(ts_rs::TS), ts(export))]
#[serde(tag = "op", rename_all = "lowercase")]
pub enum PatchOp {
    Add { path: String, value: Value },
    Replace { path: String, value: Value },
    Remove { path: String },
}

impl PatchOp {
    pub fn path(&self) -> &str {
        match self {
            PatchOp::Add { path, .. }
            | PatchOp::Replace { path, .. }
            | PatchOp::Remove { path } => path,
        }
    }

    pub fn value(&self) -> Option<&Value> {
        match self {
            PatchOp::Add { value, .. } | PatchOp::Replace { value, .. } => Some(value),
            PatchOp::Remove { .. } => None,
        }
    }

    /// The section this patch addresses.
    pub fn section(&self) -> Result<SectionKey, PatchError> {
        SectionKey::from_path(self.path()).ok_or_else(|| PatchError::UnknownPath {
            path: self.path().to_string(),
        })
    }

    /// Apply this operation to a flat section map. `add` and `replace`
    /// are both upserts; `remove` of an absent key is a no-op.
    pub fn apply(&self, target: &mut Map<String, Value>) -> Result<(), PatchError> {
        let section = self.section()?;
        match self {
            PatchOp::Add { value, .. } | PatchOp::Replace { value, .. } => {
                target.insert(section.as_str().to_string(), value.clone());
            }
            PatchOp::Remove { .. } => {
                target.remove(section.as_str());
            }
        }
        Ok(())
    }
}
