//! Typed identifiers.
//!
//! Each entity gets its own UUID newtype so a `TenantId` can never be passed
//! where a `JobId` was expected.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

macro_rules! uuid_id {
    ($(#[$meta:meta])* $name:ident, $ctor:path) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(Uuid);

        impl $name {
            /// Create a fresh identifier.
            #[inline]
            pub fn new() -> Self {
                Self($ctor())
            }

            /// Wrap an existing UUID (e.g. loaded from storage).
            #[inline]
            pub fn from_uuid(uuid: Uuid) -> Self {
                Self(uuid)
            }

            #[inline]
            pub fn as_uuid(&self) -> &Uuid {
                &self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                fmt::Display::fmt(&self.0, f)
            }
        }

        impl FromStr for $name {
            type Err = uuid::Error;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Ok(Self(Uuid::parse_str(s)?))
            }
        }

        impl From<Uuid> for $name {
            fn from(uuid: Uuid) -> Self {
                Self(uuid)
            }
        }
    };
}

uuid_id!(
    /// Review job identifier. Time-ordered (v7) so job listings sort naturally.
    JobId,
    Uuid::now_v7
);

uuid_id!(
    /// Tenant that owns the ontology, the knowledge base and the jobs.
    TenantId,
    Uuid::new_v4
);

uuid_id!(
    /// User who submitted a job.
    RequesterId,
    Uuid::new_v4
);

uuid_id!(
    /// Citation identifier, unique within and across jobs.
    CitationId,
    Uuid::new_v4
);
