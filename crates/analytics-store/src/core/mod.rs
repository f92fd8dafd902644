//! Backend-neutral record types.
//!
//! - [`dataset`]: dataset records, column descriptions and write drafts
//! - [`blob`]: blob metadata and payloads
//!
//! Identifiers are opaque strings. Each adapter assigns its own when a write
//! does not carry one, and nothing outside the adapters may interpret them.

pub mod blob;
pub mod dataset;

pub use blob::{Blob, BlobInput, BlobMetadata};
pub use dataset::{Column, ColumnType, Dataset, DatasetDraft};

use serde::{Deserialize, Serialize};
use std::fmt;

macro_rules! opaque_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn new(value: impl Into<String>) -> Self {
                Self(value.into())
            }

            /// Fresh random identifier.
            pub fn generate() -> Self {
                Self(uuid::Uuid::new_v4().simple().to_string())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }

            pub fn into_inner(self) -> String {
                self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<String> for $name {
            fn from(value: String) -> Self {
                Self(value)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self(value.to_string())
            }
        }
    };
}

opaque_id!(
    /// Identifier of a dataset record.
    DatasetId
);
opaque_id!(
    /// Identifier of a blob. Independent of any dataset identifier.
    BlobId
);
opaque_id!(
    /// Workspace reference used to scope dataset listings.
    WorkspaceId
);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generated_ids_are_unique() {
        let a = BlobId::generate();
        let b = BlobId::generate();
        assert_ne!(a, b);
        assert_eq!(a.as_str().len(), 32);
    }

    #[test]
    fn test_id_serializes_as_plain_string() {
        let id = DatasetId::new("ds-1");
        assert_eq!(serde_json::to_string(&id).unwrap(), "\"ds-1\"");
        let back: DatasetId = serde_json::from_str("\"ds-1\"").unwrap();
        assert_eq!(back, id);
    }
}
