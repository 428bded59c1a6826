//! Coordinator key tree.
//!
//! Everything hangs off one BIP-32 account at `m/69'/coin'/0'`:
//! per-round signing keys (account key tweaked by a tagged hash of the
//! round id), the deterministic nonce sequence at `account/0/index`, and
//! the coordinator fee address at `account/1/0`.

use bitcoin::bip32::{ChildNumber, DerivationPath, Xpriv};
use bitcoin::hashes::{sha256, Hash, HashEngine};
use bitcoin::{Address, CompressedPublicKey, Network};
use secp256k1::{All, PublicKey, Scalar, Secp256k1, SecretKey};
use thiserror::Error;

use crate::blind;
use crate::types::{NoncePath, RoundId};

/// Hardened purpose index of the coordinator account.
pub const KEY_PURPOSE: u32 = 69;

/// Account index under the purpose/coin pair.
pub const KEY_ACCOUNT: u32 = 0;

/// Non-hardened chain holding the signing-nonce sequence.
pub const NONCE_CHAIN: u32 = 0;

/// Non-hardened chain holding the coordinator fee address.
const FEE_CHAIN: u32 = 1;

const ROUND_KEY_TAG: &[u8] = b"gyre/round-key";

#[derive(Error, Debug)]
pub enum KeyError {
    #[error("Derivation failed: {0}")]
    DerivationFailed(String),
    #[error("Nonce index {0} out of range")]
    NonceIndexOutOfRange(u32),
}

/// Derives per-round signing keys and the nonce sequence from the
/// coordinator seed. Holds secret material; keep it inside the
/// coordinator task.
pub struct KeyManager {
    secp: Secp256k1<All>,
    account: Xpriv,
    coin: u32,
    network: Network,
}

impl KeyManager {
    /// Build the account at `m/69'/coin'/0'` (coin 0 on mainnet, 1
    /// elsewhere, as in BIP-84).
    pub fn new(seed: &[u8; 64], network: Network) -> Result<Self, KeyError> {
        let secp = Secp256k1::new();
        let master = Xpriv::new_master(network, seed)
            .map_err(|e| KeyError::DerivationFailed(e.to_string()))?;

        let coin = match network {
            Network::Bitcoin => 0,
            _ => 1,
        };
        let path = DerivationPath::from(vec![
            ChildNumber::from_hardened_idx(KEY_PURPOSE)
                .map_err(|e| KeyError::DerivationFailed(e.to_string()))?,
            ChildNumber::from_hardened_idx(coin)
                .map_err(|e| KeyError::DerivationFailed(e.to_string()))?,
            ChildNumber::from_hardened_idx(KEY_ACCOUNT)
                .map_err(|e| KeyError::DerivationFailed(e.to_string()))?,
        ]);
        let account = master
            .derive_priv(&secp, &path)
            .map_err(|e| KeyError::DerivationFailed(e.to_string()))?;

        Ok(KeyManager {
            secp,
            account,
            coin,
            network,
        })
    }

    pub fn network(&self) -> Network {
        self.network
    }

    /// Per-round signing secret: the account key tweaked by
    /// `tagged_hash("gyre/round-key", round_id)`. Recoverable from the
    /// seed and the round id alone.
    fn round_secret(&self, round_id: &RoundId) -> Result<SecretKey, KeyError> {
        let tweak = tagged_hash(ROUND_KEY_TAG, round_id.as_bytes());
        let scalar = Scalar::from_be_bytes(tweak)
            .map_err(|_| KeyError::DerivationFailed("round tweak out of range".into()))?;
        self.account
            .private_key
            .add_tweak(&scalar)
            .map_err(|e| KeyError::DerivationFailed(e.to_string()))
    }

    /// Public signing key advertised in `MixDetails` for a round.
    pub fn round_pubkey(&self, round_id: &RoundId) -> Result<PublicKey, KeyError> {
        Ok(PublicKey::from_secret_key(
            &self.secp,
            &self.round_secret(round_id)?,
        ))
    }

    /// BIP-32 position of the nonce at `index`.
    pub fn nonce_path(&self, index: u32) -> NoncePath {
        NoncePath {
            purpose: KEY_PURPOSE,
            coin: self.coin,
            account: KEY_ACCOUNT,
            chain: NONCE_CHAIN,
            index,
        }
    }

    fn nonce_secret(&self, index: u32) -> Result<SecretKey, KeyError> {
        let path = DerivationPath::from(vec![
            ChildNumber::from_normal_idx(NONCE_CHAIN)
                .map_err(|e| KeyError::DerivationFailed(e.to_string()))?,
            ChildNumber::from_normal_idx(index)
                .map_err(|_| KeyError::NonceIndexOutOfRange(index))?,
        ]);
        let derived = self
            .account
            .derive_priv(&self.secp, &path)
            .map_err(|e| KeyError::DerivationFailed(e.to_string()))?;
        Ok(derived.private_key)
    }

    /// Public nonce handed to an Alice. Each index is used exactly once
    /// across the coordinator's lifetime.
    pub fn nonce_pubkey(&self, index: u32) -> Result<PublicKey, KeyError> {
        Ok(PublicKey::from_secret_key(
            &self.secp,
            &self.nonce_secret(index)?,
        ))
    }

    /// Issue a blind signature over `challenge` with the round key and the
    /// nonce at `nonce_index`.
    pub fn blind_sign(
        &self,
        round_id: &RoundId,
        nonce_index: u32,
        challenge: &[u8; 32],
    ) -> Result<[u8; 32], KeyError> {
        let signing = self.round_secret(round_id)?;
        let nonce = self.nonce_secret(nonce_index)?;
        blind::blind_sign(&signing, &nonce, challenge)
            .map_err(|e| KeyError::DerivationFailed(e.to_string()))
    }

    /// P2WPKH address collecting the coordinator fee output.
    pub fn fee_address(&self) -> Result<Address, KeyError> {
        let path = DerivationPath::from(vec![
            ChildNumber::from_normal_idx(FEE_CHAIN)
                .map_err(|e| KeyError::DerivationFailed(e.to_string()))?,
            ChildNumber::from_normal_idx(0)
                .map_err(|e| KeyError::DerivationFailed(e.to_string()))?,
        ]);
        let derived = self
            .account
            .derive_priv(&self.secp, &path)
            .map_err(|e| KeyError::DerivationFailed(e.to_string()))?;
        let pubkey = CompressedPublicKey(derived.private_key.public_key(&self.secp));
        Ok(Address::p2wpkh(&pubkey, self.network))
    }
}

/// BIP-340 style tagged hash: `sha256(sha256(tag) || sha256(tag) || data)`.
pub(crate) fn tagged_hash(tag: &[u8], data: &[u8]) -> [u8; 32] {
    let tag_hash = sha256::Hash::hash(tag);
    let mut engine = sha256::Hash::engine();
    engine.input(tag_hash.as_byte_array());
    engine.input(tag_hash.as_byte_array());
    engine.input(data);
    sha256::Hash::from_engine(engine).to_byte_array()
}
