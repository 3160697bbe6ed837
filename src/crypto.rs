use k256::ecdsa::{RecoveryId, Signature as EcdsaSignature, SigningKey, VerifyingKey};
use sha3::{Digest, Keccak256};

use crate::envelope::{Envelope, Signature, SignedFields};
use crate::error::VerifyError;
use crate::identity::{PeerId, PEER_ID_LEN};

/// Recovers the address that produced a signature over the signed fields.
///
/// Comparing the recovered address against the claimed sender is the
/// caller's job; a mismatch is not an error at this layer.
pub trait Verifier: Send + Sync {
    fn recover(&self, fields: &SignedFields<'_>, signature: &Signature) -> Result<PeerId, VerifyError>;
}

/// secp256k1 recoverable-ECDSA verifier with keccak-derived addresses
#[derive(Debug, Clone, Copy, Default)]
pub struct Secp256k1Verifier;

impl Verifier for Secp256k1Verifier {
    fn recover(&self, fields: &SignedFields<'_>, signature: &Signature) -> Result<PeerId, VerifyError> {
        let prehash = keccak256(&fields.canonical_bytes());
        recover_address(&prehash, signature)
    }
}

/// Keccak-256 digest
pub fn keccak256(data: &[u8]) -> [u8; 32] {
    let mut hasher = Keccak256::new();
    hasher.update(data);
    let result = hasher.finalize();
    let mut hash = [0u8; 32];
    hash.copy_from_slice(&result);
    hash
}

/// Address of a public key: last 20 bytes of keccak256(uncompressed point without tag)
pub fn address_from_key(key: &VerifyingKey) -> PeerId {
    let point = key.to_encoded_point(false);
    let hash = keccak256(&point.as_bytes()[1..]);

    let mut address = [0u8; PEER_ID_LEN];
    address.copy_from_slice(&hash[32 - PEER_ID_LEN..]);
    PeerId::from_bytes(address)
}

/// Normalise `v` to a recovery id; both `0/1` and `27/28` are accepted
fn recovery_id(v: u8) -> Result<RecoveryId, VerifyError> {
    let normalized = match v {
        0 | 1 => v,
        27 | 28 => v - 27,
        other => return Err(VerifyError::InvalidRecoveryId(other)),
    };
    RecoveryId::from_byte(normalized).ok_or(VerifyError::InvalidRecoveryId(v))
}

/// Recover the signer address from a 32-byte prehash
pub fn recover_address(prehash: &[u8; 32], signature: &Signature) -> Result<PeerId, VerifyError> {
    let recovery_id = recovery_id(signature.v)?;

    let mut sig_bytes = [0u8; 64];
    sig_bytes[..32].copy_from_slice(&signature.r);
    sig_bytes[32..].copy_from_slice(&signature.s);

    let sig = EcdsaSignature::from_slice(&sig_bytes)
        .map_err(|e| VerifyError::InvalidSignature(e.to_string()))?;

    let key = VerifyingKey::recover_from_prehash(prehash, &sig, recovery_id)
        .map_err(|_| VerifyError::RecoveryFailed)?;

    Ok(address_from_key(&key))
}

/// Sign `(to, msg, nonce)` the way a client does, producing `v` in the 27/28 form
pub fn sign_fields(key: &SigningKey, fields: &SignedFields<'_>) -> Result<Signature, VerifyError> {
    let prehash = keccak256(&fields.canonical_bytes());
    let (sig, recovery_id) = key
        .sign_prehash_recoverable(&prehash)
        .map_err(|e| VerifyError::InvalidSignature(e.to_string()))?;

    let bytes = sig.to_bytes();
    let mut r = [0u8; 32];
    let mut s = [0u8; 32];
    r.copy_from_slice(&bytes[..32]);
    s.copy_from_slice(&bytes[32..]);

    Ok(Signature {
        v: 27 + recovery_id.to_byte(),
        r,
        s,
    })
}

/// Build a fully signed envelope from `key`; `fromID` is derived from the key
pub fn sign_envelope(
    key: &SigningKey,
    from_name: impl Into<String>,
    to: PeerId,
    msg: Vec<Vec<u8>>,
    from_nonce: u64,
    encrypted: bool,
) -> Result<Envelope, VerifyError> {
    let signature = sign_fields(
        key,
        &SignedFields {
            to,
            msg: &msg,
            from_nonce,
        },
    )?;

    Ok(Envelope {
        from_id: address_from_key(key.verifying_key()),
        from_name: from_name.into(),
        to_id: to,
        msg,
        from_nonce,
        encrypted,
        signature,
    })
}
