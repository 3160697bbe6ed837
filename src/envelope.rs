//! Wire messages
//!
//! All frames exchanged with clients, peers and the bus are JSON. Message
//! blocks travel as base64 strings, signature scalars as `0x`-hex.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::DecodeError;
use crate::identity::{CapId, PeerId, PEER_ID_LEN};

/// Recoverable ECDSA signature components
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Signature {
    pub v: u8,
    #[serde(with = "scalar_hex")]
    pub r: [u8; 32],
    #[serde(with = "scalar_hex")]
    pub s: [u8; 32],
}

/// A signed chat message as submitted by a client
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "fromID")]
    pub from_id: PeerId,
    #[serde(rename = "fromName", default)]
    pub from_name: String,
    #[serde(rename = "toID")]
    pub to_id: PeerId,
    #[serde(with = "blocks_base64")]
    pub msg: Vec<Vec<u8>>,
    #[serde(rename = "fromNonce")]
    pub from_nonce: u64,
    #[serde(default)]
    pub encrypted: bool,
    #[serde(flatten)]
    pub signature: Signature,
}

impl Envelope {
    pub fn from_json(raw: &str) -> Result<Self, DecodeError> {
        Ok(serde_json::from_str(raw)?)
    }

    pub fn to_json(&self) -> Result<String, DecodeError> {
        Ok(serde_json::to_string(self)?)
    }

    /// The portion of the envelope covered by the signature
    pub fn signed_fields(&self) -> SignedFields<'_> {
        SignedFields {
            to: self.to_id,
            msg: &self.msg,
            from_nonce: self.from_nonce,
        }
    }
}

/// An envelope published to the bus, tagged with the publishing node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BusEnvelope {
    #[serde(rename = "capID")]
    pub cap_id: CapId,
    #[serde(flatten)]
    pub envelope: Envelope,
}

impl BusEnvelope {
    pub fn new(cap_id: CapId, envelope: Envelope) -> Self {
        Self { cap_id, envelope }
    }

    pub fn from_slice(raw: &[u8]) -> Result<Self, DecodeError> {
        Ok(serde_json::from_slice(raw)?)
    }

    pub fn to_vec(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }
}

/// `(toID, msg, fromNonce)`: the material a sender signs
#[derive(Debug, Clone, Copy)]
pub struct SignedFields<'a> {
    pub to: PeerId,
    pub msg: &'a [Vec<u8>],
    pub from_nonce: u64,
}

impl SignedFields<'_> {
    /// Canonical encoding:
    /// `to || u32 block count || (u32 len || block)* || u64 nonce`, all big-endian.
    pub fn canonical_bytes(&self) -> Vec<u8> {
        let body: usize = self.msg.iter().map(|b| 4 + b.len()).sum();
        let mut out = Vec::with_capacity(PEER_ID_LEN + 4 + body + 8);

        out.extend_from_slice(self.to.as_bytes());
        out.extend_from_slice(&(self.msg.len() as u32).to_be_bytes());
        for block in self.msg {
            out.extend_from_slice(&(block.len() as u32).to_be_bytes());
            out.extend_from_slice(block);
        }
        out.extend_from_slice(&self.from_nonce.to_be_bytes());
        out
    }
}

/// Frame written to a recipient's connection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveredMessage {
    #[serde(rename = "fromID")]
    pub from_id: PeerId,
    #[serde(rename = "fromName")]
    pub from_name: String,
    #[serde(rename = "fromNonce")]
    pub from_nonce: u64,
    pub encrypted: bool,
    #[serde(with = "blocks_base64")]
    pub msg: Vec<Vec<u8>>,
}

/// First frame a client sends after the server greeting
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentityFrame {
    pub id: PeerId,
    pub name: String,
}

impl IdentityFrame {
    pub fn from_json(raw: &str) -> Result<Self, DecodeError> {
        Ok(serde_json::from_str(raw)?)
    }
}

mod blocks_base64 {
    use super::*;

    pub fn serialize<S: Serializer>(blocks: &[Vec<u8>], serializer: S) -> Result<S::Ok, S::Error> {
        let encoded: Vec<String> = blocks.iter().map(|b| BASE64.encode(b)).collect();
        encoded.serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<Vec<u8>>, D::Error> {
        let encoded = Vec::<String>::deserialize(deserializer)?;
        encoded
            .iter()
            .map(|s| BASE64.decode(s).map_err(serde::de::Error::custom))
            .collect()
    }
}

mod scalar_hex {
    use super::*;

    pub fn serialize<S: Serializer>(scalar: &[u8; 32], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&format!("0x{}", hex::encode(scalar)))
    }

    /// Accepts big-endian hex with leading zeros omitted (odd length included)
    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<[u8; 32], D::Error> {
        let s = String::deserialize(deserializer)?;
        let digits = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")).unwrap_or(&s);

        if digits.len() > 64 {
            return Err(serde::de::Error::custom(format!(
                "signature scalar longer than 32 bytes ({} hex digits)",
                digits.len()
            )));
        }

        let padded = format!("{:0>64}", digits);
        let bytes = hex::decode(&padded).map_err(serde::de::Error::custom)?;

        let mut out = [0u8; 32];
        out.copy_from_slice(&bytes);
        Ok(out)
    }
}
