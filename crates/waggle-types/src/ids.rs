//! Typed identifiers for sessions, memories, snapshots, diffs, alerts, tickets.
//!
//! Entity ids wrap UUIDv7 (time-ordered) and display as 32-char lower hex.
//! `SessionId` is the exception: the transport contract requires a 128-bit
//! *random* hex id, so it wraps UUIDv4. The `short()` form (first 8 hex chars)
//! is for logs and human-facing output only, never a lookup key.

use std::fmt;

use serde::{Deserialize, Serialize};

/// A memory item identifier (UUIDv7).
#[derive(Clone, Copy, Hash, Eq, PartialEq, Ord, PartialOrd)]
pub struct MemoryId(uuid::Uuid);

/// A config snapshot identifier (UUIDv7).
#[derive(Clone, Copy, Hash, Eq, PartialEq, Ord, PartialOrd)]
pub struct SnapshotId(uuid::Uuid);

/// A config diff identifier (UUIDv7).
#[derive(Clone, Copy, Hash, Eq, PartialEq, Ord, PartialOrd)]
pub struct DiffId(uuid::Uuid);

/// A config alert identifier (UUIDv7).
#[derive(Clone, Copy, Hash, Eq, PartialEq, Ord, PartialOrd)]
pub struct AlertId(uuid::Uuid);

/// A ticket identifier (UUIDv7).
#[derive(Clone, Copy, Hash, Eq, PartialEq, Ord, PartialOrd)]
pub struct TicketId(uuid::Uuid);

/// A delegated-task identifier (UUIDv7).
#[derive(Clone, Copy, Hash, Eq, PartialEq, Ord, PartialOrd)]
pub struct TaskId(uuid::Uuid);

/// A session identifier (UUIDv4, 128 random bits).
#[derive(Clone, Copy, Hash, Eq, PartialEq, Ord, PartialOrd)]
pub struct SessionId(uuid::Uuid);

macro_rules! impl_hex_id {
    ($T:ident, $name:literal, $ctor:expr) => {
        impl $T {
            /// Mint a fresh id.
            pub fn new() -> Self {
                Self($ctor)
            }

            /// First 8 hex characters, for display only.
            pub fn short(&self) -> String {
                self.0.as_simple().to_string()[..8].to_string()
            }

            /// Full 32-character hex string (no hyphens).
            pub fn to_hex(&self) -> String {
                self.0.as_simple().to_string()
            }

            /// Parse from 32-char hex or hyphenated UUID text.
            pub fn parse(s: &str) -> Result<Self, uuid::Error> {
                uuid::Uuid::parse_str(s).map(Self)
            }

            /// A nil id, for sentinel values only.
            pub fn nil() -> Self {
                Self(uuid::Uuid::nil())
            }
        }

        impl Default for $T {
            fn default() -> Self {
                Self::new()
            }
        }

        impl From<uuid::Uuid> for $T {
            fn from(u: uuid::Uuid) -> Self {
                Self(u)
            }
        }

        impl fmt::Display for $T {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0.as_simple())
            }
        }

        impl fmt::Debug for $T {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!($name, "({})"), self.0.as_simple())
            }
        }

        // On the wire ids are always 32-char lower hex, matching the SSE
        // session frame format.
        impl Serialize for $T {
            fn serialize<S: serde::Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
                s.serialize_str(&self.to_hex())
            }
        }

        impl<'de> Deserialize<'de> for $T {
            fn deserialize<D: serde::Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
                let text = String::deserialize(d)?;
                Self::parse(&text).map_err(serde::de::Error::custom)
            }
        }
    };
}

impl_hex_id!(MemoryId, "MemoryId", uuid::Uuid::now_v7());
impl_hex_id!(SnapshotId, "SnapshotId", uuid::Uuid::now_v7());
impl_hex_id!(DiffId, "DiffId", uuid::Uuid::now_v7());
impl_hex_id!(AlertId, "AlertId", uuid::Uuid::now_v7());
impl_hex_id!(TicketId, "TicketId", uuid::Uuid::now_v7());
impl_hex_id!(TaskId, "TaskId", uuid::Uuid::now_v7());
impl_hex_id!(SessionId, "SessionId", uuid::Uuid::new_v4());

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hex_roundtrip() {
        let id = MemoryId::new();
        let hex = id.to_hex();
        assert_eq!(hex.len(), 32);
        assert_eq!(MemoryId::parse(&hex).unwrap(), id);
    }

    #[test]
    fn test_session_id_is_hex() {
        let id = SessionId::new();
        let hex = id.to_hex();
        assert_eq!(hex.len(), 32);
        assert!(hex.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_short_prefix() {
        let id = TicketId::new();
        assert_eq!(id.short(), id.to_hex()[..8]);
    }

    #[test]
    fn test_v7_ids_are_time_ordered() {
        let a = MemoryId::new();
        let b = MemoryId::new();
        assert!(a <= b);
    }

    #[test]
    fn test_serde_hex() {
        let id = SnapshotId::new();
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, format!("\"{}\"", id.to_hex()));
        let back: SnapshotId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, id);
    }
}
