//! Unsigned transaction assembly.
//!
//! Once output registration closes, the round's inputs, mixed outputs,
//! change outputs and the coordinator fee output are assembled into a
//! PSBT. Dust is dropped into the miner fee, then inputs and outputs are
//! shuffled with a round-scoped seed so position leaks nothing about
//! registration order.

use bitcoin::absolute::LockTime;
use bitcoin::psbt::Psbt;
use bitcoin::transaction::Version;
use bitcoin::{Amount, OutPoint, ScriptBuf, Sequence, Transaction, TxIn, TxOut, Witness};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use thiserror::Error;

use gyre_core::types::{Alice, RegisteredInput, RegisteredOutput, Round};

#[derive(Error, Debug)]
pub enum BuilderError {
    #[error("Round has no registered inputs")]
    NoInputs,
    #[error("Round has no registered outputs")]
    NoOutputs,
    #[error("All outputs were dust at the current fee schedule")]
    EverythingWasDust,
    #[error("PSBT construction failed: {0}")]
    Psbt(String),
}

/// The assembled round transaction plus the post-shuffle position of
/// every registered input.
pub struct UnsignedRound {
    pub psbt: Psbt,
    pub input_indexes: Vec<(OutPoint, u32)>,
}

/// Build the round's unsigned PSBT.
///
/// `coordinator_spk` receives `mix_fee · |inputs|`. Outputs below the
/// dust threshold for their script type (a zero or tiny change request)
/// are silently dropped; their value goes to the miner.
pub fn build_unsigned_round(
    round: &Round,
    alices: &[Alice],
    inputs: &[RegisteredInput],
    outputs: &[RegisteredOutput],
    coordinator_spk: ScriptBuf,
) -> Result<UnsignedRound, BuilderError> {
    if inputs.is_empty() {
        return Err(BuilderError::NoInputs);
    }
    if outputs.is_empty() {
        return Err(BuilderError::NoOutputs);
    }

    let mut tx_outputs: Vec<TxOut> = Vec::with_capacity(outputs.len() + alices.len() + 1);
    for registered in outputs {
        tx_outputs.push(registered.output.clone());
    }
    for alice in alices {
        if let (Some(spk), Some(amount)) = (&alice.change_spk, alice.change_amount) {
            tx_outputs.push(TxOut {
                value: amount,
                script_pubkey: spk.clone(),
            });
        }
    }
    tx_outputs.push(TxOut {
        value: Amount::from_sat(round.mix_fee.to_sat() * inputs.len() as u64),
        script_pubkey: coordinator_spk,
    });

    tx_outputs.retain(|out| out.value >= out.script_pubkey.minimal_non_dust());
    if tx_outputs.is_empty() {
        return Err(BuilderError::EverythingWasDust);
    }

    // Deterministic per round, unpredictable without the round id.
    let mut rng = StdRng::from_seed(*round.id.as_bytes());
    let mut shuffled_inputs: Vec<&RegisteredInput> = inputs.iter().collect();
    shuffled_inputs.shuffle(&mut rng);
    tx_outputs.shuffle(&mut rng);

    let tx_inputs: Vec<TxIn> = shuffled_inputs
        .iter()
        .map(|registered| TxIn {
            previous_output: registered.outpoint,
            script_sig: ScriptBuf::new(),
            sequence: Sequence::ENABLE_RBF_NO_LOCKTIME,
            witness: Witness::new(),
        })
        .collect();
    let input_indexes: Vec<(OutPoint, u32)> = shuffled_inputs
        .iter()
        .enumerate()
        .map(|(index, registered)| (registered.outpoint, index as u32))
        .collect();

    let tx = Transaction {
        version: Version::TWO,
        lock_time: LockTime::ZERO,
        input: tx_inputs,
        output: tx_outputs,
    };

    let mut psbt = Psbt::from_unsigned_tx(tx).map_err(|e| BuilderError::Psbt(e.to_string()))?;
    for (index, registered) in shuffled_inputs.iter().enumerate() {
        psbt.inputs[index].witness_utxo = Some(registered.output.clone());
    }

    Ok(UnsignedRound {
        psbt,
        input_indexes,
    })
}
