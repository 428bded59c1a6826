//! Chaumian blind Schnorr signatures.
//!
//! The coordinator signs a challenge it cannot read, so that the unblinded
//! signature it later verifies on a Bob submission cannot be matched to the
//! Alice it was issued to, even with full database access.
//!
//! # Protocol
//!
//! ```text
//! Client (Alice→Bob)                         Coordinator
//!   │  ◄─ nonce R = kG, round key P = xG ──    │   (AskNonce / MixDetails)
//!   │  pick α, β                                │
//!   │  R' = R + αG + βP                         │
//!   │  e  = H(R'.x ‖ P.x ‖ m)                   │
//!   │  ── e' = e + β ─────────────────────►     │   (RegisterInputs)
//!   │  ◄─ s = k + e'·x ────────────────────     │   (BlindedSig)
//!   │  s' = s + α                               │
//!   │  ── (m, R', s') over a fresh conn ──►     │   (BobMessage)
//!   │                         s'G ?= R' + eP    │
//! ```
//!
//! The unblinding works out because
//! `s' = k + (e + β)x + α` and `R' + eP = (k + α)G + βP + eP`.
//!
//! Both sides live here: the coordinator calls [`blind_sign`] and
//! [`verify`], clients (and the tests) drive a [`Blinder`].

use bitcoin::consensus;
use bitcoin::TxOut;
use secp256k1::{All, PublicKey, Scalar, Secp256k1, SecretKey};
use thiserror::Error;

use crate::keys::tagged_hash;

const CHALLENGE_TAG: &[u8] = b"gyre/blind-challenge";

/// Serialized length of an [`OutputSignature`].
pub const OUTPUT_SIG_LEN: usize = 65;

#[derive(Error, Debug)]
pub enum BlindError {
    #[error("Invalid scalar: {0}")]
    InvalidScalar(String),
    #[error("Point arithmetic failed: {0}")]
    Arithmetic(String),
    #[error("Signature must be {OUTPUT_SIG_LEN} bytes, got {0}")]
    BadLength(usize),
}

/// An unblinded signature `(R', s')` as submitted by a Bob.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OutputSignature {
    /// Blinded nonce point `R'`.
    pub nonce: PublicKey,
    /// Response scalar `s'`.
    pub s: [u8; 32],
}

impl OutputSignature {
    pub fn serialize(&self) -> [u8; OUTPUT_SIG_LEN] {
        let mut out = [0u8; OUTPUT_SIG_LEN];
        out[..33].copy_from_slice(&self.nonce.serialize());
        out[33..].copy_from_slice(&self.s);
        out
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, BlindError> {
        if bytes.len() != OUTPUT_SIG_LEN {
            return Err(BlindError::BadLength(bytes.len()));
        }
        let nonce = PublicKey::from_slice(&bytes[..33])
            .map_err(|e| BlindError::InvalidScalar(format!("nonce point: {}", e)))?;
        let mut s = [0u8; 32];
        s.copy_from_slice(&bytes[33..]);
        Ok(OutputSignature { nonce, s })
    }
}

/// The byte string a Bob's mixed output is signed over.
pub fn output_commitment(output: &TxOut) -> Vec<u8> {
    consensus::serialize(output)
}

/// `H(R'.x ‖ P.x ‖ m)` under the challenge tag.
fn challenge_hash(blinded_nonce: &PublicKey, signing_key: &PublicKey, msg: &[u8]) -> [u8; 32] {
    let mut data = Vec::with_capacity(64 + msg.len());
    data.extend_from_slice(&blinded_nonce.serialize()[1..33]);
    data.extend_from_slice(&signing_key.serialize()[1..33]);
    data.extend_from_slice(msg);
    tagged_hash(CHALLENGE_TAG, &data)
}

/// Coordinator side: answer a blinded challenge with `s = k + e'·x`.
///
/// The nonce secret `k` must never sign two challenges.
pub fn blind_sign(
    signing_key: &SecretKey,
    nonce_key: &SecretKey,
    challenge: &[u8; 32],
) -> Result<[u8; 32], BlindError> {
    let e = Scalar::from_be_bytes(*challenge)
        .map_err(|_| BlindError::InvalidScalar("challenge out of range".into()))?;
    let s = signing_key
        .mul_tweak(&e)
        .map_err(|e| BlindError::Arithmetic(e.to_string()))?
        .add_tweak(&Scalar::from(*nonce_key))
        .map_err(|e| BlindError::Arithmetic(e.to_string()))?;
    Ok(s.secret_bytes())
}

/// Client-side blinding state. Holds the unblinding scalar between the
/// `RegisterInputs` call and the `BlindedSig` response; use once and drop.
pub struct Blinder {
    alpha: SecretKey,
    blinded_nonce: PublicKey,
}

impl Blinder {
    /// Blind `msg` against the round key `signing_key` and the issued
    /// nonce `R`. Returns the state and the challenge to submit.
    pub fn blind(
        secp: &Secp256k1<All>,
        signing_key: &PublicKey,
        nonce: &PublicKey,
        msg: &[u8],
    ) -> Result<(Blinder, [u8; 32]), BlindError> {
        let alpha = SecretKey::new(&mut rand::rngs::OsRng);
        let beta = SecretKey::new(&mut rand::rngs::OsRng);

        // R' = R + αG + βP
        let blinded_nonce = nonce
            .combine(&PublicKey::from_secret_key(secp, &alpha))
            .map_err(|e| BlindError::Arithmetic(e.to_string()))?
            .combine(
                &signing_key
                    .mul_tweak(secp, &Scalar::from(beta))
                    .map_err(|e| BlindError::Arithmetic(e.to_string()))?,
            )
            .map_err(|e| BlindError::Arithmetic(e.to_string()))?;

        let e = challenge_hash(&blinded_nonce, signing_key, msg);
        // e' = e + β
        let blinded_challenge = SecretKey::from_slice(&e)
            .map_err(|_| BlindError::InvalidScalar("challenge out of range".into()))?
            .add_tweak(&Scalar::from(beta))
            .map_err(|e| BlindError::Arithmetic(e.to_string()))?
            .secret_bytes();

        Ok((
            Blinder {
                alpha,
                blinded_nonce,
            },
            blinded_challenge,
        ))
    }

    /// Unblind the coordinator's response: `s' = s + α`.
    pub fn unblind(&self, blind_sig: &[u8; 32]) -> Result<OutputSignature, BlindError> {
        let s = SecretKey::from_slice(blind_sig)
            .map_err(|_| BlindError::InvalidScalar("blind signature out of range".into()))?
            .add_tweak(&Scalar::from(self.alpha))
            .map_err(|e| BlindError::Arithmetic(e.to_string()))?;
        Ok(OutputSignature {
            nonce: self.blinded_nonce,
            s: s.secret_bytes(),
        })
    }
}

/// Verify an unblinded signature: `s'G = R' + eP`.
pub fn verify(
    secp: &Secp256k1<All>,
    signing_key: &PublicKey,
    msg: &[u8],
    sig: &OutputSignature,
) -> bool {
    let e = challenge_hash(&sig.nonce, signing_key, msg);
    let Ok(e) = Scalar::from_be_bytes(e) else {
        return false;
    };
    let Ok(s) = SecretKey::from_slice(&sig.s) else {
        return false;
    };
    let lhs = PublicKey::from_secret_key(secp, &s);
    let Ok(e_p) = signing_key.mul_tweak(secp, &e) else {
        return false;
    };
    let Ok(rhs) = sig.nonce.combine(&e_p) else {
        return false;
    };
    lhs == rhs
}
