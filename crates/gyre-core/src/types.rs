//! Domain model for coordinator rounds.
//!
//! A round walks `Pending → RegisterAlices → RegisterOutputs → Signing →
//! Signed` (or drops to `Failed`). Peers appear twice under unlinkable
//! identities: as an [`Alice`] registering inputs, and later as an anonymous
//! "Bob" whose output is only ever stored without peer linkage.

use std::fmt;

use bitcoin::hashes::{sha256d, Hash};
use bitcoin::psbt::Psbt;
use bitcoin::{Amount, OutPoint, ScriptBuf, Transaction, TxOut};
use rand::RngCore;
use secp256k1::PublicKey;

use crate::blind::OutputSignature;
use crate::proof::InputProof;

/// Virtual size charged per registered P2WPKH input (prevout + witness).
pub const INPUT_VBYTES: u64 = 149;

/// Virtual size charged per P2WPKH output.
pub const OUTPUT_VBYTES: u64 = 43;

/// 32-byte round identifier: double-SHA256 of a fresh random secret.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct RoundId(pub [u8; 32]);

impl RoundId {
    /// Generate a fresh identifier from 32 random bytes.
    pub fn generate() -> Self {
        let mut secret = [0u8; 32];
        rand::rngs::OsRng.fill_bytes(&mut secret);
        RoundId(sha256d::Hash::hash(&secret).to_byte_array())
    }

    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        RoundId(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Display for RoundId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for b in &self.0 {
            write!(f, "{:02x}", b)?;
        }
        Ok(())
    }
}

impl fmt::Debug for RoundId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RoundId({})", self)
    }
}

/// 32-byte peer identifier assigned by the connection manager at accept
/// time. Never derived from anything the peer sent.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct PeerId(pub [u8; 32]);

impl PeerId {
    pub fn random() -> Self {
        let mut bytes = [0u8; 32];
        rand::rngs::OsRng.fill_bytes(&mut bytes);
        PeerId(bytes)
    }

    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        PeerId(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Display for PeerId {
    // Only the prefix: peer ids show up in logs a lot.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for b in &self.0[..8] {
            write!(f, "{:02x}", b)?;
        }
        Ok(())
    }
}

impl fmt::Debug for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PeerId({})", self)
    }
}

/// Round phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoundStatus {
    /// Created, waiting for `round_time`. Nonces may be handed out.
    Pending,
    /// Accepting `RegisterInputs` and issuing blind signatures.
    RegisterAlices,
    /// Accepting unblinded Bob outputs.
    RegisterOutputs,
    /// Unsigned PSBT distributed, waiting for peer signatures.
    Signing,
    /// Final transaction broadcast.
    Signed,
    /// Terminal failure; a new round is scheduled.
    Failed,
}

impl RoundStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RoundStatus::Pending => "pending",
            RoundStatus::RegisterAlices => "register_alices",
            RoundStatus::RegisterOutputs => "register_outputs",
            RoundStatus::Signing => "signing",
            RoundStatus::Signed => "signed",
            RoundStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(RoundStatus::Pending),
            "register_alices" => Some(RoundStatus::RegisterAlices),
            "register_outputs" => Some(RoundStatus::RegisterOutputs),
            "signing" => Some(RoundStatus::Signing),
            "signed" => Some(RoundStatus::Signed),
            "failed" => Some(RoundStatus::Failed),
            _ => None,
        }
    }

    /// Whether nonces may still be issued in this phase.
    pub fn accepts_nonce_requests(&self) -> bool {
        matches!(self, RoundStatus::Pending | RoundStatus::RegisterAlices)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, RoundStatus::Signed | RoundStatus::Failed)
    }
}

impl fmt::Display for RoundStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One CoinJoin execution with its own signing key, nonces and peer set.
#[derive(Debug, Clone)]
pub struct Round {
    pub id: RoundId,
    pub status: RoundStatus,
    /// Scheduled start of input registration (unix seconds).
    pub round_time: u64,
    /// Fee rate this round was priced at, sat/vB.
    pub fee_rate: u64,
    /// Uniform value of every mixed output.
    pub mix_amount: Amount,
    /// Per-input coordinator fee.
    pub mix_fee: Amount,
    /// Per-input miner-fee share charged to the registering Alice.
    pub input_fee: Amount,
    /// Per-output miner-fee share charged to the registering Alice.
    pub output_fee: Amount,
    /// Set once the round enters `Signing`.
    pub unsigned_psbt: Option<Psbt>,
    /// Set once the round is `Signed`.
    pub final_tx: Option<Transaction>,
    /// Coordinator fee actually collected by the final transaction.
    pub profit: Option<Amount>,
}

impl Round {
    /// Price a fresh round at the given fee rate.
    pub fn new(
        id: RoundId,
        round_time: u64,
        fee_rate: u64,
        mix_amount: Amount,
        mix_fee: Amount,
    ) -> Self {
        Round {
            id,
            status: RoundStatus::Pending,
            round_time,
            fee_rate,
            mix_amount,
            mix_fee,
            input_fee: Amount::from_sat(fee_rate * INPUT_VBYTES),
            output_fee: Amount::from_sat(fee_rate * OUTPUT_VBYTES),
            unsigned_psbt: None,
            final_tx: None,
            profit: None,
        }
    }

    /// The most an Alice may claim back as change:
    /// `inputs − mix_amount − mix_fee − input_fee·n − output_fee·2`.
    ///
    /// `None` means the inputs cannot cover the mix denomination plus fees.
    pub fn max_change(&self, input_total: Amount, num_inputs: u64) -> Option<Amount> {
        input_total
            .checked_sub(self.mix_amount)?
            .checked_sub(self.mix_fee)?
            .checked_sub(Amount::from_sat(self.input_fee.to_sat() * num_inputs))?
            .checked_sub(Amount::from_sat(self.output_fee.to_sat() * 2))
    }
}

/// BIP-32 position of an Alice's signing nonce, persisted so the nonce
/// sequence survives restarts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NoncePath {
    pub purpose: u32,
    pub coin: u32,
    pub account: u32,
    pub chain: u32,
    pub index: u32,
}

/// A peer's input-registration record. Created on the first `AskNonce`,
/// completed by `RegisterInputs`.
#[derive(Debug, Clone)]
pub struct Alice {
    pub peer_id: PeerId,
    pub round_id: RoundId,
    pub nonce_path: NoncePath,
    /// Public signing nonce handed to the peer; unique for all time.
    pub nonce: PublicKey,
    /// Blinded challenge submitted with `RegisterInputs`.
    pub blinded_output: Option<[u8; 32]>,
    pub change_spk: Option<ScriptBuf>,
    pub change_amount: Option<Amount>,
    /// Blind signature scalar issued over `blinded_output`.
    pub blind_sig: Option<[u8; 32]>,
    /// Whether this peer's signed PSBT was accepted.
    pub signed: bool,
}

impl Alice {
    pub fn new(peer_id: PeerId, round_id: RoundId, nonce_path: NoncePath, nonce: PublicKey) -> Self {
        Alice {
            peer_id,
            round_id,
            nonce_path,
            nonce,
            blinded_output: None,
            change_spk: None,
            change_amount: None,
            blind_sig: None,
            signed: false,
        }
    }

    /// An Alice counts toward phase advancement once her blind signature
    /// has been issued.
    pub fn is_registered(&self) -> bool {
        self.blind_sig.is_some()
    }
}

/// A UTXO admitted into the current round.
#[derive(Debug, Clone)]
pub struct RegisteredInput {
    pub round_id: RoundId,
    pub outpoint: OutPoint,
    pub peer_id: PeerId,
    /// The previous output being spent, as confirmed on chain.
    pub output: TxOut,
    pub proof: InputProof,
    /// Position in the final transaction, assigned post-shuffle.
    pub index_in_final_tx: Option<u32>,
}

/// A mixed output admitted via the Bob role. Deliberately carries no peer
/// linkage.
#[derive(Debug, Clone)]
pub struct RegisteredOutput {
    pub round_id: RoundId,
    pub output: TxOut,
    /// Unblinded coordinator signature that authorized this output.
    pub sig: OutputSignature,
}

/// Why a UTXO was banned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BanReason {
    BadInputs,
    InvalidSignature,
}

impl BanReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            BanReason::BadInputs => "bad_inputs",
            BanReason::InvalidSignature => "invalid_signature",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "bad_inputs" => Some(BanReason::BadInputs),
            "invalid_signature" => Some(BanReason::InvalidSignature),
            _ => None,
        }
    }
}

/// Ban-list entry, consulted at input admission. Outlives rounds.
#[derive(Debug, Clone)]
pub struct BannedUtxo {
    pub outpoint: OutPoint,
    /// Unix seconds after which the outpoint may register again.
    pub banned_until: u64,
    pub reason: BanReason,
}
