//! Input ownership proofs.
//!
//! An Alice proves she controls each UTXO she registers by signing her
//! issued nonce with the key behind the output's witness program. A
//! P2WPKH script only commits to the key's hash, so the proof carries the
//! public key alongside the BIP-340 signature.

use bitcoin::hashes::{hash160, sha256, Hash};
use bitcoin::Script;
use secp256k1::schnorr::Signature;
use secp256k1::{All, Keypair, Message, PublicKey, Secp256k1, SecretKey};
use thiserror::Error;

/// Domain prefix of the proof message. Kept wire-compatible with existing
/// clients.
pub const INPUT_PROOF_PREFIX: &[u8] = b"LnVortex input proof";

/// Serialized length: 33-byte key + 64-byte signature.
pub const INPUT_PROOF_LEN: usize = 97;

#[derive(Error, Debug)]
pub enum ProofError {
    #[error("Proof must be {INPUT_PROOF_LEN} bytes, got {0}")]
    BadLength(usize),
    #[error("Invalid proof key: {0}")]
    InvalidKey(String),
    #[error("Invalid proof signature: {0}")]
    InvalidSignature(String),
}

/// Possession proof for one registered input.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InputProof {
    /// Compressed key controlling the UTXO's witness program.
    pub pubkey: PublicKey,
    pub signature: Signature,
}

impl InputProof {
    pub fn serialize(&self) -> [u8; INPUT_PROOF_LEN] {
        let mut out = [0u8; INPUT_PROOF_LEN];
        out[..33].copy_from_slice(&self.pubkey.serialize());
        out[33..].copy_from_slice(&self.signature.serialize());
        out
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, ProofError> {
        if bytes.len() != INPUT_PROOF_LEN {
            return Err(ProofError::BadLength(bytes.len()));
        }
        let pubkey = PublicKey::from_slice(&bytes[..33])
            .map_err(|e| ProofError::InvalidKey(e.to_string()))?;
        let signature = Signature::from_slice(&bytes[33..])
            .map_err(|e| ProofError::InvalidSignature(e.to_string()))?;
        Ok(InputProof { pubkey, signature })
    }
}

/// Digest signed by the proof: `sha256(prefix ‖ nonce_x)`.
fn proof_digest(nonce: &PublicKey) -> Message {
    let mut data = Vec::with_capacity(INPUT_PROOF_PREFIX.len() + 32);
    data.extend_from_slice(INPUT_PROOF_PREFIX);
    data.extend_from_slice(&nonce.serialize()[1..33]);
    Message::from_digest(sha256::Hash::hash(&data).to_byte_array())
}

/// Client side: sign the Alice's nonce with the UTXO's key.
pub fn create_input_proof(
    secp: &Secp256k1<All>,
    utxo_key: &SecretKey,
    nonce: &PublicKey,
) -> InputProof {
    let keypair = Keypair::from_secret_key(secp, utxo_key);
    let signature = secp.sign_schnorr(&proof_digest(nonce), &keypair);
    InputProof {
        pubkey: keypair.public_key(),
        signature,
    }
}

/// Coordinator side: the proof key must hash to the P2WPKH witness
/// program of `script_pubkey`, and the signature must verify over the
/// Alice's nonce.
pub fn verify_input_proof(
    secp: &Secp256k1<All>,
    proof: &InputProof,
    script_pubkey: &Script,
    nonce: &PublicKey,
) -> bool {
    if !script_pubkey.is_p2wpkh() {
        return false;
    }
    let program = &script_pubkey.as_bytes()[2..22];
    let key_hash = hash160::Hash::hash(&proof.pubkey.serialize());
    if key_hash.as_byte_array() != program {
        return false;
    }

    let (xonly, _parity) = proof.pubkey.x_only_public_key();
    secp.verify_schnorr(&proof.signature, &proof_digest(nonce), &xonly)
        .is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use bitcoin::{CompressedPublicKey, ScriptBuf};

    fn p2wpkh_script(secp: &Secp256k1<All>, sk: &SecretKey) -> ScriptBuf {
        let pubkey = CompressedPublicKey(PublicKey::from_secret_key(secp, sk));
        ScriptBuf::new_p2wpkh(&pubkey.wpubkey_hash())
    }

    #[test]
    fn valid_proof_verifies() {
        let secp = Secp256k1::new();
        let utxo_key = SecretKey::from_slice(&[0x21; 32]).unwrap();
        let nonce_key = SecretKey::from_slice(&[0x42; 32]).unwrap();
        let nonce = PublicKey::from_secret_key(&secp, &nonce_key);
        let spk = p2wpkh_script(&secp, &utxo_key);

        let proof = create_input_proof(&secp, &utxo_key, &nonce);
        assert!(verify_input_proof(&secp, &proof, &spk, &nonce));
    }

    #[test]
    fn proof_by_other_key_rejected() {
        let secp = Secp256k1::new();
        let utxo_key = SecretKey::from_slice(&[0x21; 32]).unwrap();
        let attacker_key = SecretKey::from_slice(&[0x99; 32]).unwrap();
        let nonce = PublicKey::from_secret_key(&secp, &SecretKey::from_slice(&[0x42; 32]).unwrap());
        let spk = p2wpkh_script(&secp, &utxo_key);

        // Forged: signed with a key that does not hash to the program.
        let proof = create_input_proof(&secp, &attacker_key, &nonce);
        assert!(!verify_input_proof(&secp, &proof, &spk, &nonce));
    }

    #[test]
    fn proof_bound_to_nonce() {
        let secp = Secp256k1::new();
        let utxo_key = SecretKey::from_slice(&[0x21; 32]).unwrap();
        let nonce = PublicKey::from_secret_key(&secp, &SecretKey::from_slice(&[0x42; 32]).unwrap());
        let other = PublicKey::from_secret_key(&secp, &SecretKey::from_slice(&[0x43; 32]).unwrap());
        let spk = p2wpkh_script(&secp, &utxo_key);

        let proof = create_input_proof(&secp, &utxo_key, &nonce);
        assert!(!verify_input_proof(&secp, &proof, &spk, &other));
    }

    #[test]
    fn non_p2wpkh_script_rejected() {
        let secp = Secp256k1::new();
        let utxo_key = SecretKey::from_slice(&[0x21; 32]).unwrap();
        let nonce = PublicKey::from_secret_key(&secp, &SecretKey::from_slice(&[0x42; 32]).unwrap());

        let proof = create_input_proof(&secp, &utxo_key, &nonce);
        let p2pkh = ScriptBuf::new_p2pkh(&bitcoin::PubkeyHash::hash(&[1u8; 4]));
        assert!(!verify_input_proof(&secp, &proof, &p2pkh, &nonce));
    }

    #[test]
    fn serialization_roundtrip() {
        let secp = Secp256k1::new();
        let utxo_key = SecretKey::from_slice(&[0x21; 32]).unwrap();
        let nonce = PublicKey::from_secret_key(&secp, &SecretKey::from_slice(&[0x42; 32]).unwrap());

        let proof = create_input_proof(&secp, &utxo_key, &nonce);
        let restored = InputProof::from_bytes(&proof.serialize()).unwrap();
        assert_eq!(proof, restored);

        assert!(matches!(
            InputProof::from_bytes(&[0u8; 96]),
            Err(ProofError::BadLength(96))
        ));
    }
}
