//! Peer and node identities
//!
//! `PeerId` is the 20-byte address a participant is known by across the
//! whole fabric. `CapId` tags everything a node publishes on the bus so the
//! node can recognise and discard its own fan-out.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use uuid::Uuid;

use crate::error::DecodeError;

/// Length of a peer address in bytes
pub const PEER_ID_LEN: usize = 20;

/// Fixed-width peer address, displayed as `0x`-prefixed lowercase hex
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeerId([u8; PEER_ID_LEN]);

impl PeerId {
    pub const fn from_bytes(bytes: [u8; PEER_ID_LEN]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; PEER_ID_LEN] {
        &self.0
    }

    /// Parse from hex, with or without the `0x` prefix
    pub fn from_hex(input: &str) -> Result<Self, DecodeError> {
        let trimmed = input
            .strip_prefix("0x")
            .or_else(|| input.strip_prefix("0X"))
            .unwrap_or(input);

        let bytes = hex::decode(trimmed).map_err(|e| DecodeError::Hex {
            field: "peer id",
            reason: e.to_string(),
        })?;

        let array: [u8; PEER_ID_LEN] =
            bytes
                .as_slice()
                .try_into()
                .map_err(|_| DecodeError::Length {
                    field: "peer id",
                    expected: PEER_ID_LEN,
                    actual: bytes.len(),
                })?;

        Ok(Self(array))
    }

    pub fn to_hex(&self) -> String {
        format!("0x{}", hex::encode(self.0))
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PeerId({})", self.to_hex())
    }
}

impl FromStr for PeerId {
    type Err = DecodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_hex(s)
    }
}

impl Serialize for PeerId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for PeerId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        PeerId::from_hex(&s).map_err(serde::de::Error::custom)
    }
}

/// Per-process node tag carried by every bus envelope
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CapId(Uuid);

impl CapId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// Generate a fresh id and record it under `data_dir/cap_id`.
    ///
    /// The file is informational: a node always starts with a new id, the
    /// previous value is simply overwritten.
    pub async fn generate_and_persist(data_dir: &Path) -> std::io::Result<Self> {
        let id = Self::generate();
        tokio::fs::create_dir_all(data_dir).await?;

        let path = data_dir.join("cap_id");
        let tmp_path = path.with_extension("tmp");
        tokio::fs::write(&tmp_path, id.to_string()).await?;
        tokio::fs::rename(&tmp_path, &path).await?;

        tracing::info!(cap_id = %id, path = %path.display(), "Generated node cap id");
        Ok(id)
    }
}

impl fmt::Display for CapId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl fmt::Debug for CapId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CapId({})", self.0)
    }
}
