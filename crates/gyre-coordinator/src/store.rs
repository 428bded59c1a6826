//! SQLite persistence layer.
//!
//! Five tables: rounds, alices, registered inputs, registered outputs and
//! banned UTXOs. Registered outputs deliberately carry no peer column:
//! nothing in the schema can join an output back to an Alice.

use std::path::Path;

use bitcoin::consensus;
use bitcoin::psbt::Psbt;
use bitcoin::{Amount, OutPoint, ScriptBuf, Transaction, TxOut};
use rusqlite::{params, Connection, OptionalExtension};
use secp256k1::PublicKey;
use thiserror::Error;

use gyre_core::blind::OutputSignature;
use gyre_core::proof::InputProof;
use gyre_core::types::{
    Alice, BanReason, BannedUtxo, NoncePath, PeerId, RegisteredInput, RegisteredOutput, Round,
    RoundId, RoundStatus,
};

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Db(#[from] rusqlite::Error),
    #[error("Corrupt row: {0}")]
    Corrupt(String),
}

pub struct Store {
    conn: Connection,
}

impl Store {
    /// Open (or create) the database at `path` and run migrations.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| StoreError::Corrupt(format!("create data dir: {}", e)))?;
        }
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        migrate(&conn)?;
        Ok(Store { conn })
    }

    /// In-memory database for tests.
    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        migrate(&conn)?;
        Ok(Store { conn })
    }

    // ── Rounds ──────────────────────────────────────────────────────────

    pub fn insert_round(&self, round: &Round) -> Result<(), StoreError> {
        self.conn.execute(
            "INSERT INTO rounds
               (round_id, status, round_time, fee_rate, mix_amount, mix_fee, input_fee, output_fee)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                &round.id.as_bytes()[..],
                round.status.as_str(),
                round.round_time,
                round.fee_rate,
                round.mix_amount.to_sat(),
                round.mix_fee.to_sat(),
                round.input_fee.to_sat(),
                round.output_fee.to_sat(),
            ],
        )?;
        Ok(())
    }

    pub fn update_round_status(
        &self,
        round_id: &RoundId,
        status: RoundStatus,
    ) -> Result<(), StoreError> {
        self.conn.execute(
            "UPDATE rounds SET status = ?2 WHERE round_id = ?1",
            params![&round_id.as_bytes()[..], status.as_str()],
        )?;
        Ok(())
    }

    pub fn set_unsigned_psbt(&self, round_id: &RoundId, psbt: &Psbt) -> Result<(), StoreError> {
        self.conn.execute(
            "UPDATE rounds SET unsigned_psbt = ?2 WHERE round_id = ?1",
            params![&round_id.as_bytes()[..], psbt.serialize()],
        )?;
        Ok(())
    }

    pub fn set_final_tx(
        &self,
        round_id: &RoundId,
        tx: &Transaction,
        profit: Amount,
    ) -> Result<(), StoreError> {
        self.conn.execute(
            "UPDATE rounds SET final_tx = ?2, profit = ?3 WHERE round_id = ?1",
            params![
                &round_id.as_bytes()[..],
                consensus::serialize(tx),
                profit.to_sat()
            ],
        )?;
        Ok(())
    }

    pub fn get_round(&self, round_id: &RoundId) -> Result<Option<Round>, StoreError> {
        let mut stmt = self.conn.prepare_cached(
            "SELECT round_id, status, round_time, fee_rate, mix_amount, mix_fee,
                    input_fee, output_fee, unsigned_psbt, final_tx, profit
             FROM rounds WHERE round_id = ?1",
        )?;
        stmt.query_row(params![&round_id.as_bytes()[..]], row_to_round)
            .optional()
            .map_err(StoreError::from)?
            .transpose()
    }

    // ── Alices ──────────────────────────────────────────────────────────

    /// Next free nonce index. Durable through the alices table, so a
    /// restart never re-issues a nonce.
    pub fn next_nonce_index(&self) -> Result<u32, StoreError> {
        let next: i64 = self.conn.query_row(
            "SELECT COALESCE(MAX(nonce_index) + 1, 0) FROM alices",
            [],
            |row| row.get(0),
        )?;
        u32::try_from(next).map_err(|_| StoreError::Corrupt("nonce index overflow".into()))
    }

    pub fn insert_alice(&self, alice: &Alice) -> Result<(), StoreError> {
        self.conn.execute(
            "INSERT INTO alices
               (peer_id, round_id, purpose, coin, account, chain, nonce_index, nonce, signed)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, 0)",
            params![
                &alice.peer_id.as_bytes()[..],
                &alice.round_id.as_bytes()[..],
                alice.nonce_path.purpose,
                alice.nonce_path.coin,
                alice.nonce_path.account,
                alice.nonce_path.chain,
                alice.nonce_path.index,
                &alice.nonce.serialize()[..],
            ],
        )?;
        Ok(())
    }

    pub fn get_alice(&self, peer_id: &PeerId) -> Result<Option<Alice>, StoreError> {
        let mut stmt = self.conn.prepare_cached(
            "SELECT peer_id, round_id, purpose, coin, account, chain, nonce_index, nonce,
                    blinded_output, change_spk, change_amount, blind_sig, signed
             FROM alices WHERE peer_id = ?1",
        )?;
        stmt.query_row(params![&peer_id.as_bytes()[..]], row_to_alice)
            .optional()
            .map_err(StoreError::from)?
            .transpose()
    }

    /// Record a completed registration: blinded challenge, change request
    /// and the issued blind signature.
    pub fn complete_alice_registration(&self, alice: &Alice) -> Result<(), StoreError> {
        self.conn.execute(
            "UPDATE alices
             SET blinded_output = ?2, change_spk = ?3, change_amount = ?4, blind_sig = ?5
             WHERE peer_id = ?1",
            params![
                &alice.peer_id.as_bytes()[..],
                alice.blinded_output.as_ref().map(|b| &b[..]),
                alice.change_spk.as_ref().map(|s| s.as_bytes()),
                alice.change_amount.map(|a| a.to_sat()),
                alice.blind_sig.as_ref().map(|b| &b[..]),
            ],
        )?;
        Ok(())
    }

    pub fn mark_alice_signed(&self, peer_id: &PeerId) -> Result<(), StoreError> {
        self.conn.execute(
            "UPDATE alices SET signed = 1 WHERE peer_id = ?1",
            params![&peer_id.as_bytes()[..]],
        )?;
        Ok(())
    }

    /// Forget an Alice that disconnected before her blind signature was
    /// issued. Her nonce index stays burned.
    pub fn delete_unregistered_alice(&self, peer_id: &PeerId) -> Result<(), StoreError> {
        self.conn.execute(
            "DELETE FROM alices WHERE peer_id = ?1 AND blind_sig IS NULL",
            params![&peer_id.as_bytes()[..]],
        )?;
        Ok(())
    }

    pub fn registered_alice_count(&self, round_id: &RoundId) -> Result<u64, StoreError> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM alices WHERE round_id = ?1 AND blind_sig IS NOT NULL",
            params![&round_id.as_bytes()[..]],
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }

    pub fn registered_alices(&self, round_id: &RoundId) -> Result<Vec<Alice>, StoreError> {
        let mut stmt = self.conn.prepare_cached(
            "SELECT peer_id, round_id, purpose, coin, account, chain, nonce_index, nonce,
                    blinded_output, change_spk, change_amount, blind_sig, signed
             FROM alices WHERE round_id = ?1 AND blind_sig IS NOT NULL
             ORDER BY nonce_index",
        )?;
        let rows = stmt.query_map(params![&round_id.as_bytes()[..]], row_to_alice)?;
        let mut alices = Vec::new();
        for row in rows {
            alices.push(row??);
        }
        Ok(alices)
    }

    // ── Registered inputs ───────────────────────────────────────────────

    /// Persist all of one Alice's inputs atomically.
    pub fn insert_inputs(&mut self, inputs: &[RegisteredInput]) -> Result<(), StoreError> {
        let tx = self.conn.transaction()?;
        for input in inputs {
            tx.execute(
                "INSERT INTO registered_inputs
                   (round_id, outpoint, peer_id, value, script_pubkey, proof)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    &input.round_id.as_bytes()[..],
                    consensus::serialize(&input.outpoint),
                    &input.peer_id.as_bytes()[..],
                    input.output.value.to_sat(),
                    input.output.script_pubkey.as_bytes(),
                    &input.proof.serialize()[..],
                ],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    pub fn inputs_for_round(&self, round_id: &RoundId) -> Result<Vec<RegisteredInput>, StoreError> {
        let mut stmt = self.conn.prepare_cached(
            "SELECT round_id, outpoint, peer_id, value, script_pubkey, proof, index_in_final_tx
             FROM registered_inputs WHERE round_id = ?1",
        )?;
        let rows = stmt.query_map(params![&round_id.as_bytes()[..]], row_to_input)?;
        let mut inputs = Vec::new();
        for row in rows {
            inputs.push(row??);
        }
        Ok(inputs)
    }

    pub fn inputs_for_peer(
        &self,
        round_id: &RoundId,
        peer_id: &PeerId,
    ) -> Result<Vec<RegisteredInput>, StoreError> {
        let mut stmt = self.conn.prepare_cached(
            "SELECT round_id, outpoint, peer_id, value, script_pubkey, proof, index_in_final_tx
             FROM registered_inputs WHERE round_id = ?1 AND peer_id = ?2",
        )?;
        let rows = stmt.query_map(
            params![&round_id.as_bytes()[..], &peer_id.as_bytes()[..]],
            row_to_input,
        )?;
        let mut inputs = Vec::new();
        for row in rows {
            inputs.push(row??);
        }
        Ok(inputs)
    }

    /// Record post-shuffle positions, atomically for the whole round.
    pub fn set_input_indexes(
        &mut self,
        round_id: &RoundId,
        indexes: &[(OutPoint, u32)],
    ) -> Result<(), StoreError> {
        let tx = self.conn.transaction()?;
        for (outpoint, index) in indexes {
            tx.execute(
                "UPDATE registered_inputs SET index_in_final_tx = ?3
                 WHERE round_id = ?1 AND outpoint = ?2",
                params![
                    &round_id.as_bytes()[..],
                    consensus::serialize(outpoint),
                    index
                ],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    // ── Registered outputs ──────────────────────────────────────────────

    /// Idempotent: replaying the same output is a no-op.
    pub fn insert_output(&self, output: &RegisteredOutput) -> Result<(), StoreError> {
        self.conn.execute(
            "INSERT OR IGNORE INTO registered_outputs (round_id, value, script_pubkey, sig)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                &output.round_id.as_bytes()[..],
                output.output.value.to_sat(),
                output.output.script_pubkey.as_bytes(),
                &output.sig.serialize()[..],
            ],
        )?;
        Ok(())
    }

    pub fn outputs_for_round(
        &self,
        round_id: &RoundId,
    ) -> Result<Vec<RegisteredOutput>, StoreError> {
        let mut stmt = self.conn.prepare_cached(
            "SELECT round_id, value, script_pubkey, sig
             FROM registered_outputs WHERE round_id = ?1
             ORDER BY script_pubkey",
        )?;
        let rows = stmt.query_map(params![&round_id.as_bytes()[..]], row_to_output)?;
        let mut outputs = Vec::new();
        for row in rows {
            outputs.push(row??);
        }
        Ok(outputs)
    }

    pub fn output_count(&self, round_id: &RoundId) -> Result<u64, StoreError> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM registered_outputs WHERE round_id = ?1",
            params![&round_id.as_bytes()[..]],
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }

    // ── Banned UTXOs ────────────────────────────────────────────────────

    /// Ban every outpoint atomically; re-banning extends the window.
    pub fn ban_outpoints(
        &mut self,
        outpoints: &[OutPoint],
        banned_until: u64,
        reason: BanReason,
    ) -> Result<(), StoreError> {
        let tx = self.conn.transaction()?;
        for outpoint in outpoints {
            tx.execute(
                "INSERT INTO banned_utxos (outpoint, banned_until, reason)
                 VALUES (?1, ?2, ?3)
                 ON CONFLICT(outpoint) DO UPDATE SET
                   banned_until = excluded.banned_until,
                   reason = excluded.reason",
                params![consensus::serialize(outpoint), banned_until, reason.as_str()],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    pub fn is_banned(&self, outpoint: &OutPoint, now: u64) -> Result<bool, StoreError> {
        let mut stmt = self.conn.prepare_cached(
            "SELECT 1 FROM banned_utxos WHERE outpoint = ?1 AND banned_until > ?2",
        )?;
        let hit: Option<i64> = stmt
            .query_row(params![consensus::serialize(outpoint), now], |row| {
                row.get(0)
            })
            .optional()?;
        Ok(hit.is_some())
    }

    pub fn get_ban(&self, outpoint: &OutPoint) -> Result<Option<BannedUtxo>, StoreError> {
        let mut stmt = self.conn.prepare_cached(
            "SELECT outpoint, banned_until, reason FROM banned_utxos WHERE outpoint = ?1",
        )?;
        stmt.query_row(params![consensus::serialize(outpoint)], |row| {
            Ok((
                row.get::<_, Vec<u8>>(0)?,
                row.get::<_, u64>(1)?,
                row.get::<_, String>(2)?,
            ))
        })
        .optional()
        .map_err(StoreError::from)?
        .map(|(op, until, reason)| {
            Ok(BannedUtxo {
                outpoint: decode_outpoint(&op)?,
                banned_until: until,
                reason: BanReason::parse(&reason)
                    .ok_or_else(|| StoreError::Corrupt(format!("ban reason '{}'", reason)))?,
            })
        })
        .transpose()
    }
}

/// Idempotent schema setup. Additive migrations append below the base
/// batch, column-probe first, as the schema evolves.
fn migrate(conn: &Connection) -> Result<(), StoreError> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS rounds (
            round_id      BLOB PRIMARY KEY,
            status        TEXT NOT NULL,
            round_time    INTEGER NOT NULL,
            fee_rate      INTEGER NOT NULL,
            mix_amount    INTEGER NOT NULL,
            mix_fee       INTEGER NOT NULL,
            input_fee     INTEGER NOT NULL,
            output_fee    INTEGER NOT NULL,
            unsigned_psbt BLOB,
            final_tx      BLOB,
            profit        INTEGER
        );

        CREATE TABLE IF NOT EXISTS alices (
            peer_id        BLOB PRIMARY KEY,
            round_id       BLOB NOT NULL,
            purpose        INTEGER NOT NULL,
            coin           INTEGER NOT NULL,
            account        INTEGER NOT NULL,
            chain          INTEGER NOT NULL,
            nonce_index    INTEGER NOT NULL UNIQUE,
            nonce          BLOB NOT NULL UNIQUE,
            blinded_output BLOB,
            change_spk     BLOB,
            change_amount  INTEGER,
            blind_sig      BLOB,
            signed         INTEGER NOT NULL DEFAULT 0
        );

        CREATE TABLE IF NOT EXISTS registered_inputs (
            round_id          BLOB NOT NULL,
            outpoint          BLOB NOT NULL,
            peer_id           BLOB NOT NULL,
            value             INTEGER NOT NULL,
            script_pubkey     BLOB NOT NULL,
            proof             BLOB NOT NULL,
            index_in_final_tx INTEGER,
            PRIMARY KEY (round_id, outpoint)
        );

        CREATE TABLE IF NOT EXISTS registered_outputs (
            round_id      BLOB NOT NULL,
            value         INTEGER NOT NULL,
            script_pubkey BLOB NOT NULL,
            sig           BLOB NOT NULL,
            PRIMARY KEY (round_id, script_pubkey, value)
        );

        CREATE TABLE IF NOT EXISTS banned_utxos (
            outpoint     BLOB PRIMARY KEY,
            banned_until INTEGER NOT NULL,
            reason       TEXT NOT NULL
        );
        ",
    )?;
    Ok(())
}

// ── Row mapping ─────────────────────────────────────────────────────────
//
// rusqlite's closures may only fail with rusqlite::Error, so mapping
// returns nested results: the outer for the driver, the inner for decode.

fn row_to_round(row: &rusqlite::Row<'_>) -> rusqlite::Result<Result<Round, StoreError>> {
    let round_id: Vec<u8> = row.get(0)?;
    let status: String = row.get(1)?;
    let round_time: u64 = row.get(2)?;
    let fee_rate: u64 = row.get(3)?;
    let mix_amount: u64 = row.get(4)?;
    let mix_fee: u64 = row.get(5)?;
    let input_fee: u64 = row.get(6)?;
    let output_fee: u64 = row.get(7)?;
    let unsigned_psbt: Option<Vec<u8>> = row.get(8)?;
    let final_tx: Option<Vec<u8>> = row.get(9)?;
    let profit: Option<u64> = row.get(10)?;

    Ok((|| {
        Ok(Round {
            id: decode_id32(&round_id).map(RoundId::from_bytes)?,
            status: RoundStatus::parse(&status)
                .ok_or_else(|| StoreError::Corrupt(format!("round status '{}'", status)))?,
            round_time,
            fee_rate,
            mix_amount: Amount::from_sat(mix_amount),
            mix_fee: Amount::from_sat(mix_fee),
            input_fee: Amount::from_sat(input_fee),
            output_fee: Amount::from_sat(output_fee),
            unsigned_psbt: unsigned_psbt
                .map(|b| {
                    Psbt::deserialize(&b)
                        .map_err(|e| StoreError::Corrupt(format!("unsigned psbt: {}", e)))
                })
                .transpose()?,
            final_tx: final_tx
                .map(|b| {
                    consensus::deserialize(&b)
                        .map_err(|e| StoreError::Corrupt(format!("final tx: {}", e)))
                })
                .transpose()?,
            profit: profit.map(Amount::from_sat),
        })
    })())
}

fn row_to_alice(row: &rusqlite::Row<'_>) -> rusqlite::Result<Result<Alice, StoreError>> {
    let peer_id: Vec<u8> = row.get(0)?;
    let round_id: Vec<u8> = row.get(1)?;
    let purpose: u32 = row.get(2)?;
    let coin: u32 = row.get(3)?;
    let account: u32 = row.get(4)?;
    let chain: u32 = row.get(5)?;
    let nonce_index: u32 = row.get(6)?;
    let nonce: Vec<u8> = row.get(7)?;
    let blinded_output: Option<Vec<u8>> = row.get(8)?;
    let change_spk: Option<Vec<u8>> = row.get(9)?;
    let change_amount: Option<u64> = row.get(10)?;
    let blind_sig: Option<Vec<u8>> = row.get(11)?;
    let signed: bool = row.get(12)?;

    Ok((|| {
        Ok(Alice {
            peer_id: decode_id32(&peer_id).map(PeerId::from_bytes)?,
            round_id: decode_id32(&round_id).map(RoundId::from_bytes)?,
            nonce_path: NoncePath {
                purpose,
                coin,
                account,
                chain,
                index: nonce_index,
            },
            nonce: PublicKey::from_slice(&nonce)
                .map_err(|e| StoreError::Corrupt(format!("alice nonce: {}", e)))?,
            blinded_output: blinded_output.map(|b| decode_id32(&b)).transpose()?,
            change_spk: change_spk.map(ScriptBuf::from_bytes),
            change_amount: change_amount.map(Amount::from_sat),
            blind_sig: blind_sig.map(|b| decode_id32(&b)).transpose()?,
            signed,
        })
    })())
}

fn row_to_input(row: &rusqlite::Row<'_>) -> rusqlite::Result<Result<RegisteredInput, StoreError>> {
    let round_id: Vec<u8> = row.get(0)?;
    let outpoint: Vec<u8> = row.get(1)?;
    let peer_id: Vec<u8> = row.get(2)?;
    let value: u64 = row.get(3)?;
    let script_pubkey: Vec<u8> = row.get(4)?;
    let proof: Vec<u8> = row.get(5)?;
    let index_in_final_tx: Option<u32> = row.get(6)?;

    Ok((|| {
        Ok(RegisteredInput {
            round_id: decode_id32(&round_id).map(RoundId::from_bytes)?,
            outpoint: decode_outpoint(&outpoint)?,
            peer_id: decode_id32(&peer_id).map(PeerId::from_bytes)?,
            output: TxOut {
                value: Amount::from_sat(value),
                script_pubkey: ScriptBuf::from_bytes(script_pubkey),
            },
            proof: InputProof::from_bytes(&proof)
                .map_err(|e| StoreError::Corrupt(format!("input proof: {}", e)))?,
            index_in_final_tx,
        })
    })())
}

fn row_to_output(
    row: &rusqlite::Row<'_>,
) -> rusqlite::Result<Result<RegisteredOutput, StoreError>> {
    let round_id: Vec<u8> = row.get(0)?;
    let value: u64 = row.get(1)?;
    let script_pubkey: Vec<u8> = row.get(2)?;
    let sig: Vec<u8> = row.get(3)?;

    Ok((|| {
        Ok(RegisteredOutput {
            round_id: decode_id32(&round_id).map(RoundId::from_bytes)?,
            output: TxOut {
                value: Amount::from_sat(value),
                script_pubkey: ScriptBuf::from_bytes(script_pubkey),
            },
            sig: OutputSignature::from_bytes(&sig)
                .map_err(|e| StoreError::Corrupt(format!("output sig: {}", e)))?,
        })
    })())
}

fn decode_id32(bytes: &[u8]) -> Result<[u8; 32], StoreError> {
    bytes
        .try_into()
        .map_err(|_| StoreError::Corrupt(format!("expected 32-byte id, got {}", bytes.len())))
}

fn decode_outpoint(bytes: &[u8]) -> Result<OutPoint, StoreError> {
    consensus::deserialize(bytes).map_err(|e| StoreError::Corrupt(format!("outpoint: {}", e)))
}
