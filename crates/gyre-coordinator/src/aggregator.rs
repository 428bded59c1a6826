//! Signed-PSBT collection and combination.
//!
//! Each registered peer gets a one-shot slot when the round enters
//! `Signing`. A spawned task awaits the whole set, combines the PSBTs
//! with the coordinator's unsigned copy, extracts the final transaction
//! and reports back to the coordinator loop. Dropping any slot's sender
//! fails the aggregation (and with it the round).

use bitcoin::hashes::{hash160, Hash};
use bitcoin::psbt::Psbt;
use bitcoin::sighash::SighashCache;
use bitcoin::{EcdsaSighashType, Transaction, TxOut};
use secp256k1::{ecdsa, All, Message, PublicKey, Secp256k1};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

use gyre_core::types::RoundId;

use crate::coordinator::Event;

#[derive(Error, Debug)]
pub enum SignatureError {
    #[error("Input {0} is not finalized")]
    MissingWitness(usize),
    #[error("Input {0} has a malformed witness")]
    MalformedWitness(usize),
    #[error("Input {0} was finalized by a peer that does not own it")]
    ForeignInput(usize),
    #[error("Input {0}: witness key does not match the previous output")]
    WrongKey(usize),
    #[error("Input {0}: only SIGHASH_ALL is accepted")]
    SighashType(usize),
    #[error("Input {0}: signature does not verify")]
    BadSignature(usize),
    #[error("Sighash computation failed: {0}")]
    Sighash(String),
}

#[derive(Error, Debug)]
pub enum AggregationError {
    #[error("A peer's signature slot failed")]
    SlotFailed,
    #[error("PSBT combination failed: {0}")]
    Combine(String),
    #[error("Transaction extraction failed: {0}")]
    Extract(String),
}

/// Check that `signed.inputs[index]` carries a valid finalized P2WPKH
/// witness for the previous output the coordinator has on record.
pub fn verify_finalized_input(
    secp: &Secp256k1<All>,
    signed: &Psbt,
    index: usize,
    prev: &TxOut,
) -> Result<(), SignatureError> {
    let witness = signed
        .inputs
        .get(index)
        .and_then(|input| input.final_script_witness.as_ref())
        .ok_or(SignatureError::MissingWitness(index))?;
    if witness.len() != 2 {
        return Err(SignatureError::MalformedWitness(index));
    }
    let sig_bytes = witness.nth(0).ok_or(SignatureError::MalformedWitness(index))?;
    let key_bytes = witness.nth(1).ok_or(SignatureError::MalformedWitness(index))?;

    let pubkey =
        PublicKey::from_slice(key_bytes).map_err(|_| SignatureError::MalformedWitness(index))?;
    if !prev.script_pubkey.is_p2wpkh() {
        return Err(SignatureError::WrongKey(index));
    }
    let program = &prev.script_pubkey.as_bytes()[2..22];
    if hash160::Hash::hash(&pubkey.serialize()).as_byte_array() != program {
        return Err(SignatureError::WrongKey(index));
    }

    let (der, sighash_flag) = sig_bytes
        .split_last()
        .map(|(flag, der)| (der, *flag))
        .ok_or(SignatureError::MalformedWitness(index))?;
    if sighash_flag != EcdsaSighashType::All as u8 {
        return Err(SignatureError::SighashType(index));
    }
    let signature =
        ecdsa::Signature::from_der(der).map_err(|_| SignatureError::MalformedWitness(index))?;

    let sighash = SighashCache::new(&signed.unsigned_tx)
        .p2wpkh_signature_hash(index, &prev.script_pubkey, prev.value, EcdsaSighashType::All)
        .map_err(|e| SignatureError::Sighash(e.to_string()))?;

    secp.verify_ecdsa(
        &Message::from_digest(sighash.to_byte_array()),
        &signature,
        &pubkey,
    )
    .map_err(|_| SignatureError::BadSignature(index))
}

/// Combine every peer's signed PSBT with the unsigned original and
/// extract the final transaction. Order-independent: PSBT combination is
/// a field-wise merge, and every finalized witness appears exactly once.
pub fn combine_signed(
    unsigned: &Psbt,
    signed: Vec<Psbt>,
) -> Result<Transaction, AggregationError> {
    let mut combined = unsigned.clone();
    for psbt in signed {
        combined
            .combine(psbt)
            .map_err(|e| AggregationError::Combine(e.to_string()))?;
    }
    combined
        .extract_tx()
        .map_err(|e| AggregationError::Extract(e.to_string()))
}

/// Await all per-peer slots, then report the combined result to the
/// coordinator loop. A dropped sender surfaces as `SlotFailed`.
pub fn spawn_aggregator(
    round_id: RoundId,
    unsigned: Psbt,
    receivers: Vec<oneshot::Receiver<Psbt>>,
    events: mpsc::UnboundedSender<Event>,
) {
    tokio::spawn(async move {
        let results = futures::future::join_all(receivers).await;
        let mut signed = Vec::with_capacity(results.len());
        for result in results {
            match result {
                Ok(psbt) => signed.push(psbt),
                Err(_) => {
                    let _ = events.send(Event::Aggregated {
                        round_id,
                        result: Err(AggregationError::SlotFailed),
                    });
                    return;
                }
            }
        }
        let result = combine_signed(&unsigned, signed);
        let _ = events.send(Event::Aggregated { round_id, result });
    });
}
