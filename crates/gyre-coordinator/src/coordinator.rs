//! The round coordinator.
//!
//! A single task owns the current round, the store, the key manager and
//! the signature slots. Connection tasks and timers feed it through one
//! event queue, so every mutation of round state is serialized; the only
//! concurrency inside a handler is read-only (parallel chain lookups).
//!
//! Timer events carry the round id and are re-checked against the current
//! round and phase, so a stale timer firing after an early advance is a
//! no-op.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use bitcoin::consensus;
use bitcoin::psbt::Psbt;
use bitcoin::{Amount, Network, OutPoint, Transaction};
use secp256k1::{All, Secp256k1};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

use gyre_bitcoind::{ChainSource, FeeOracle};
use gyre_core::blind::{self, BlindError};
use gyre_core::keys::{KeyError, KeyManager};
use gyre_core::proof;
use gyre_core::types::{
    Alice, BanReason, PeerId, RegisteredInput, RegisteredOutput, Round, RoundId, RoundStatus,
};
use gyre_core::wire::{
    AskMixDetails, AskNonce, BlindedSig, BobMessage, Failure, Message, MixDetails, NonceMsg,
    PsbtMessage, RegisterInputs, RestartRound, RoundFailed, PROTOCOL_VERSION,
};

use crate::aggregator::{self, AggregationError};
use crate::builder;
use crate::store::{Store, StoreError};

#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    pub network: Network,
    /// Uniform value of every mixed output.
    pub mix_amount: Amount,
    /// Per-input coordinator fee.
    pub coordinator_fee: Amount,
    pub min_remix_peers: u64,
    pub min_new_peers: u64,
    pub max_peers: u64,
    /// Time between round creation and input registration, and between
    /// a terminal round and the next one's start.
    pub round_interval: Duration,
    pub input_registration_time: Duration,
    pub output_registration_time: Duration,
    pub signing_time: Duration,
    pub bad_inputs_ban_duration: Duration,
    pub invalid_signature_ban_duration: Duration,
    /// Used when the node has no fee estimate (always used on regtest).
    pub fallback_fee_rate: u64,
}

impl CoordinatorConfig {
    pub fn min_peers(&self) -> u64 {
        self.min_remix_peers + self.min_new_peers
    }
}

/// Everything that can wake the coordinator task.
#[derive(Debug)]
pub enum Event {
    Connected {
        peer_id: PeerId,
        outbound: mpsc::UnboundedSender<Message>,
    },
    Disconnected {
        peer_id: PeerId,
    },
    Request {
        peer_id: PeerId,
        msg: Message,
    },
    /// `round_time` reached: open input registration.
    RoundStart {
        round_id: RoundId,
    },
    InputTimeout {
        round_id: RoundId,
    },
    OutputTimeout {
        round_id: RoundId,
    },
    SigningTimeout {
        round_id: RoundId,
    },
    Aggregated {
        round_id: RoundId,
        result: Result<Transaction, AggregationError>,
    },
    Stop,
}

#[derive(Error, Debug)]
pub enum CoordinatorError {
    #[error("Unknown round id")]
    WrongRound,
    #[error("Round is in phase {0}")]
    WrongPhase(RoundStatus),
    #[error("Coordinator serves a different network")]
    WrongNetwork,
    #[error("No nonce was issued to this peer")]
    UnknownAlice,
    #[error("Inputs already registered for this peer")]
    AlreadyRegistered,
    #[error("Only native segwit v0 keyhash scripts are accepted")]
    UnsupportedScriptType,
    #[error("Invalid inputs: {0}")]
    InvalidInputs(String),
    #[error("Output value must equal the mix amount")]
    WrongOutputAmount,
    #[error("Output signature does not verify")]
    InvalidOutputSignature,
    #[error("Invalid signed PSBT: {0}")]
    InvalidPsbt(String),
    #[error("Unexpected message in this direction")]
    UnexpectedMessage,
    #[error("Store error: {0}")]
    Store(#[from] StoreError),
    #[error("Key error: {0}")]
    Key(#[from] KeyError),
    #[error("Blind signing error: {0}")]
    Blind(#[from] BlindError),
}

pub struct Coordinator {
    cfg: CoordinatorConfig,
    secp: Secp256k1<All>,
    store: Store,
    keys: KeyManager,
    chain: Arc<dyn ChainSource>,
    fees: FeeOracle,
    events_tx: mpsc::UnboundedSender<Event>,
    events_rx: mpsc::UnboundedReceiver<Event>,
    peers: HashMap<PeerId, mpsc::UnboundedSender<Message>>,
    round: Round,
    /// One slot per registered Alice while the round is in `Signing`.
    slots: HashMap<PeerId, oneshot::Sender<Psbt>>,
}

impl Coordinator {
    /// Create the coordinator and its first round. Returns the event
    /// sender the connection manager (and shutdown path) feeds.
    pub async fn new(
        cfg: CoordinatorConfig,
        store: Store,
        keys: KeyManager,
        chain: Arc<dyn ChainSource>,
    ) -> Result<(Self, mpsc::UnboundedSender<Event>), CoordinatorError> {
        let fees = FeeOracle::new(Arc::clone(&chain), cfg.fallback_fee_rate, cfg.network);
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        let fee_rate = fees.fee_rate().await;
        let round = price_round(&cfg, fee_rate);
        store.insert_round(&round)?;
        log::info!(
            "Round {} created: {} sat mix at {} sat/vB, starting in {}s",
            round.id,
            round.mix_amount.to_sat(),
            fee_rate,
            cfg.round_interval.as_secs()
        );

        let coordinator = Coordinator {
            secp: Secp256k1::new(),
            store,
            keys,
            chain,
            fees,
            events_tx: events_tx.clone(),
            events_rx,
            peers: HashMap::new(),
            round,
            slots: HashMap::new(),
            cfg,
        };
        coordinator.schedule(
            Event::RoundStart {
                round_id: coordinator.round.id,
            },
            coordinator.cfg.round_interval,
        );
        Ok((coordinator, events_tx))
    }

    /// Consume the event queue until `Stop`.
    pub async fn run(mut self) {
        while let Some(event) = self.events_rx.recv().await {
            match event {
                Event::Connected { peer_id, outbound } => {
                    log::debug!("Peer {} connected", peer_id);
                    self.peers.insert(peer_id, outbound);
                }
                Event::Disconnected { peer_id } => self.on_disconnected(peer_id),
                Event::Request { peer_id, msg } => self.on_request(peer_id, msg).await,
                Event::RoundStart { round_id } => self.on_round_start(round_id),
                Event::InputTimeout { round_id } => self.on_input_timeout(round_id).await,
                Event::OutputTimeout { round_id } => self.on_output_timeout(round_id).await,
                Event::SigningTimeout { round_id } => self.on_signing_timeout(round_id).await,
                Event::Aggregated { round_id, result } => {
                    self.on_aggregated(round_id, result).await
                }
                Event::Stop => {
                    self.shutdown();
                    break;
                }
            }
        }
    }

    // ── Request handling ────────────────────────────────────────────────

    async fn on_request(&mut self, peer_id: PeerId, msg: Message) {
        let reply = match msg {
            Message::AskMixDetails(m) => self.ask_mix_details(&m),
            Message::AskNonce(m) => self.get_nonce(peer_id, &m),
            Message::RegisterInputs(m) => self.register_inputs(peer_id, m).await,
            Message::Bob(m) => self.register_output(m).await,
            Message::SignedPsbt(m) => self.register_psbt_signature(peer_id, m),
            _ => Err(CoordinatorError::UnexpectedMessage),
        };
        match reply {
            Ok(msg) => {
                self.send(peer_id, msg);
            }
            Err(e) => {
                log::warn!("Request from peer {} failed: {}", peer_id, e);
                self.send(
                    peer_id,
                    Message::Failure(Failure {
                        reason: e.to_string(),
                    }),
                );
            }
        }
    }

    fn ask_mix_details(&self, msg: &AskMixDetails) -> Result<Message, CoordinatorError> {
        if msg.network != self.cfg.network {
            return Err(CoordinatorError::WrongNetwork);
        }
        Ok(Message::MixDetails(MixDetails {
            version: PROTOCOL_VERSION,
            round_id: self.round.id,
            amount: self.round.mix_amount,
            mix_fee: self.round.mix_fee,
            input_fee: self.round.input_fee,
            output_fee: self.round.output_fee,
            public_key: self.keys.round_pubkey(&self.round.id)?,
            round_time: self.round.round_time,
        }))
    }

    /// Issue (or re-issue) this peer's signing nonce. Idempotent: the
    /// same peer always gets the same nonce back.
    fn get_nonce(&mut self, peer_id: PeerId, ask: &AskNonce) -> Result<Message, CoordinatorError> {
        if ask.round_id != self.round.id {
            return Err(CoordinatorError::WrongRound);
        }
        if !self.round.status.accepts_nonce_requests() {
            return Err(CoordinatorError::WrongPhase(self.round.status));
        }

        if let Some(alice) = self.store.get_alice(&peer_id)? {
            return Ok(Message::Nonce(NonceMsg { nonce: alice.nonce }));
        }

        let index = self.store.next_nonce_index()?;
        let nonce = self.keys.nonce_pubkey(index)?;
        let alice = Alice::new(peer_id, self.round.id, self.keys.nonce_path(index), nonce);
        self.store.insert_alice(&alice)?;
        log::debug!("Issued nonce {} to peer {}", index, peer_id);
        Ok(Message::Nonce(NonceMsg { nonce }))
    }

    /// Validate and admit an Alice's inputs, returning her blind
    /// signature. Any validation failure past the script-type policy
    /// check bans every submitted outpoint.
    async fn register_inputs(
        &mut self,
        peer_id: PeerId,
        msg: RegisterInputs,
    ) -> Result<Message, CoordinatorError> {
        if self.round.status != RoundStatus::RegisterAlices {
            return Err(CoordinatorError::WrongPhase(self.round.status));
        }
        let alice = self
            .store
            .get_alice(&peer_id)?
            .filter(|a| a.round_id == self.round.id)
            .ok_or(CoordinatorError::UnknownAlice)?;
        if alice.is_registered() {
            return Err(CoordinatorError::AlreadyRegistered);
        }
        if msg.inputs.is_empty() {
            return Err(CoordinatorError::InvalidInputs("no inputs".into()));
        }

        // Script policy is a precondition, not misbehavior: reject
        // without banning so the peer can retry with segwit inputs.
        if msg
            .inputs
            .iter()
            .any(|input| !input.output.script_pubkey.is_p2wpkh())
            || !msg.change_spk.is_p2wpkh()
        {
            return Err(CoordinatorError::UnsupportedScriptType);
        }

        if let Err(reason) = self.validate_inputs(&alice, &msg).await {
            let outpoints: Vec<OutPoint> = msg.inputs.iter().map(|i| i.outpoint).collect();
            let until = unix_now() + self.cfg.bad_inputs_ban_duration.as_secs();
            self.store
                .ban_outpoints(&outpoints, until, BanReason::BadInputs)?;
            log::warn!(
                "Peer {} failed input validation ({}), banned {} outpoints",
                peer_id,
                reason,
                outpoints.len()
            );
            return Err(CoordinatorError::InvalidInputs(reason));
        }

        // An unsignable challenge is a bad registration like any other.
        let sig = match self
            .keys
            .blind_sign(&self.round.id, alice.nonce_path.index, &msg.blinded_output)
        {
            Ok(sig) => sig,
            Err(e) => {
                let outpoints: Vec<OutPoint> = msg.inputs.iter().map(|i| i.outpoint).collect();
                let until = unix_now() + self.cfg.bad_inputs_ban_duration.as_secs();
                self.store
                    .ban_outpoints(&outpoints, until, BanReason::BadInputs)?;
                return Err(CoordinatorError::InvalidInputs(e.to_string()));
            }
        };

        let registered: Vec<RegisteredInput> = msg
            .inputs
            .iter()
            .map(|input| RegisteredInput {
                round_id: self.round.id,
                outpoint: input.outpoint,
                peer_id,
                output: input.output.clone(),
                proof: input.proof,
                index_in_final_tx: None,
            })
            .collect();
        self.store.insert_inputs(&registered)?;

        let mut updated = alice;
        updated.blinded_output = Some(msg.blinded_output);
        updated.change_spk = Some(msg.change_spk);
        updated.change_amount = Some(msg.change_amount);
        updated.blind_sig = Some(sig);
        self.store.complete_alice_registration(&updated)?;

        let registered_count = self.store.registered_alice_count(&self.round.id)?;
        log::info!(
            "Alice registered {} inputs ({}/{} peers)",
            msg.inputs.len(),
            registered_count,
            self.cfg.max_peers
        );

        // Post-commit cutoff; the status guard inside the transition
        // makes the max_peers-th registration advance exactly once.
        if registered_count >= self.cfg.max_peers {
            self.advance_to_output_registration().await;
        }

        Ok(Message::BlindedSig(BlindedSig { sig }))
    }

    /// All-or-nothing input validation; the error string names the first
    /// failing check.
    async fn validate_inputs(&self, alice: &Alice, msg: &RegisterInputs) -> Result<(), String> {
        let now = unix_now();

        let mut seen = HashSet::new();
        for input in &msg.inputs {
            if !seen.insert(input.outpoint) {
                return Err(format!("outpoint {} submitted twice", input.outpoint));
            }
            if self
                .store
                .is_banned(&input.outpoint, now)
                .map_err(|e| e.to_string())?
            {
                return Err(format!("outpoint {} is banned", input.outpoint));
            }
            if !proof::verify_input_proof(
                &self.secp,
                &input.proof,
                &input.output.script_pubkey,
                &alice.nonce,
            ) {
                return Err(format!("invalid ownership proof for {}", input.outpoint));
            }
        }

        // One outpoint registers once per round, whoever brings it.
        let taken: HashSet<OutPoint> = self
            .store
            .inputs_for_round(&self.round.id)
            .map_err(|e| e.to_string())?
            .into_iter()
            .map(|i| i.outpoint)
            .collect();
        if let Some(dup) = msg.inputs.iter().find(|i| taken.contains(&i.outpoint)) {
            return Err(format!("outpoint {} is already registered", dup.outpoint));
        }

        // Chain lookups run concurrently; every claimed prevout must
        // exist and match byte for byte.
        let lookups = msg.inputs.iter().map(|input| {
            let chain = Arc::clone(&self.chain);
            async move {
                let tx = chain
                    .get_raw_transaction(&input.outpoint.txid)
                    .await
                    .map_err(|e| format!("chain lookup failed: {}", e))?
                    .ok_or_else(|| format!("transaction {} not found", input.outpoint.txid))?;
                let prev = tx
                    .output
                    .get(input.outpoint.vout as usize)
                    .ok_or_else(|| format!("{} has no output {}", input.outpoint.txid, input.outpoint.vout))?;
                if *prev != input.output {
                    return Err(format!("{} does not match the chain", input.outpoint));
                }
                Ok(())
            }
        });
        futures::future::try_join_all(lookups).await?;

        let input_total: u64 = msg.inputs.iter().map(|i| i.output.value.to_sat()).sum();
        let max_change = self
            .round
            .max_change(Amount::from_sat(input_total), msg.inputs.len() as u64)
            .ok_or_else(|| "input value cannot cover the mix amount and fees".to_string())?;
        if msg.change_amount > max_change {
            return Err(format!(
                "change {} exceeds the {} maximum",
                msg.change_amount, max_change
            ));
        }

        Ok(())
    }

    /// Admit an unblinded output from a Bob connection. Failures are
    /// replied to but never banned: a Bob's peer id has no Alice behind
    /// it, and punishing it would punish nobody.
    async fn register_output(&mut self, msg: BobMessage) -> Result<Message, CoordinatorError> {
        if self.round.status != RoundStatus::RegisterOutputs {
            return Err(CoordinatorError::WrongPhase(self.round.status));
        }
        if msg.output.value != self.round.mix_amount {
            return Err(CoordinatorError::WrongOutputAmount);
        }
        if !msg.output.script_pubkey.is_p2wpkh() {
            return Err(CoordinatorError::UnsupportedScriptType);
        }

        let round_key = self.keys.round_pubkey(&self.round.id)?;
        let commitment = blind::output_commitment(&msg.output);
        if !blind::verify(&self.secp, &round_key, &commitment, &msg.sig) {
            return Err(CoordinatorError::InvalidOutputSignature);
        }

        self.store.insert_output(&RegisteredOutput {
            round_id: self.round.id,
            output: msg.output,
            sig: msg.sig,
        })?;

        let outputs = self.store.output_count(&self.round.id)?;
        let alices = self.store.registered_alice_count(&self.round.id)?;
        log::info!("Mixed output registered ({}/{})", outputs, alices);

        if outputs >= alices {
            self.advance_to_signing().await;
        }
        Ok(Message::Ack)
    }

    /// Accept a peer's signed PSBT into its signature slot. An invalid
    /// submission bans the peer's outpoints and fails its slot, which
    /// fails the round.
    fn register_psbt_signature(
        &mut self,
        peer_id: PeerId,
        msg: PsbtMessage,
    ) -> Result<Message, CoordinatorError> {
        if self.round.status != RoundStatus::Signing {
            return Err(CoordinatorError::WrongPhase(self.round.status));
        }
        let unsigned = self
            .round
            .unsigned_psbt
            .as_ref()
            .ok_or(CoordinatorError::WrongPhase(self.round.status))?;
        if self
            .store
            .get_alice(&peer_id)?
            .filter(|a| a.round_id == self.round.id && a.is_registered())
            .is_none()
        {
            return Err(CoordinatorError::UnknownAlice);
        }
        let inputs = self.store.inputs_for_peer(&self.round.id, &peer_id)?;

        if let Err(reason) = validate_signed_psbt(&self.secp, unsigned, &msg.psbt, &inputs) {
            let outpoints: Vec<OutPoint> = inputs.iter().map(|i| i.outpoint).collect();
            let until = unix_now() + self.cfg.invalid_signature_ban_duration.as_secs();
            self.store
                .ban_outpoints(&outpoints, until, BanReason::InvalidSignature)?;
            log::warn!(
                "Peer {} submitted an invalid signed PSBT ({}), banned {} outpoints",
                peer_id,
                reason,
                outpoints.len()
            );
            // Dropping the sender fails the aggregation and the round.
            self.slots.remove(&peer_id);
            return Err(CoordinatorError::InvalidPsbt(reason));
        }

        self.store.mark_alice_signed(&peer_id)?;
        if let Some(slot) = self.slots.remove(&peer_id) {
            let _ = slot.send(msg.psbt);
            log::info!("Signed PSBT accepted ({} slots pending)", self.slots.len());
        }
        Ok(Message::Ack)
    }

    // ── Phase transitions ───────────────────────────────────────────────

    fn on_round_start(&mut self, round_id: RoundId) {
        if self.round.id != round_id || self.round.status != RoundStatus::Pending {
            return;
        }
        if let Err(e) = self.set_status(RoundStatus::RegisterAlices) {
            log::error!("Failed to open input registration: {}", e);
            return;
        }
        log::info!("Round {}: input registration open", self.round.id);
        self.schedule(
            Event::InputTimeout { round_id },
            self.cfg.input_registration_time,
        );
    }

    async fn on_input_timeout(&mut self, round_id: RoundId) {
        if self.round.id != round_id || self.round.status != RoundStatus::RegisterAlices {
            return;
        }
        let registered = match self.store.registered_alice_count(&self.round.id) {
            Ok(count) => count,
            Err(e) => {
                log::error!("Store failure at input timeout: {}", e);
                return self.fail_round("internal error").await;
            }
        };
        if registered >= self.cfg.min_peers() {
            self.advance_to_output_registration().await;
        } else {
            self.fail_round(&format!(
                "only {} of {} required peers registered",
                registered,
                self.cfg.min_peers()
            ))
            .await;
        }
    }

    async fn advance_to_output_registration(&mut self) {
        if self.round.status != RoundStatus::RegisterAlices {
            return;
        }
        if let Err(e) = self.set_status(RoundStatus::RegisterOutputs) {
            log::error!("Failed to open output registration: {}", e);
            return self.fail_round("internal error").await;
        }
        log::info!("Round {}: output registration open", self.round.id);
        self.schedule(
            Event::OutputTimeout {
                round_id: self.round.id,
            },
            self.cfg.output_registration_time,
        );
    }

    async fn on_output_timeout(&mut self, round_id: RoundId) {
        if self.round.id != round_id || self.round.status != RoundStatus::RegisterOutputs {
            return;
        }
        let outputs = self.store.output_count(&self.round.id).unwrap_or(0);
        let alices = self
            .store
            .registered_alice_count(&self.round.id)
            .unwrap_or(u64::MAX);
        if outputs >= alices && outputs > 0 {
            self.advance_to_signing().await;
        } else {
            self.fail_round(&format!(
                "{} of {} mixed outputs registered",
                outputs, alices
            ))
            .await;
        }
    }

    async fn advance_to_signing(&mut self) {
        if self.round.status != RoundStatus::RegisterOutputs {
            return;
        }

        let built = match self.build_round_psbt() {
            Ok(built) => built,
            Err(e) => {
                log::error!("Failed to build the round transaction: {}", e);
                return self.fail_round("transaction assembly failed").await;
            }
        };

        self.round.unsigned_psbt = Some(built.psbt.clone());
        if let Err(e) = self.set_status(RoundStatus::Signing) {
            log::error!("Failed to enter signing: {}", e);
            return self.fail_round("internal error").await;
        }

        let alices = match self.store.registered_alices(&self.round.id) {
            Ok(alices) => alices,
            Err(e) => {
                log::error!("Store failure entering signing: {}", e);
                return self.fail_round("internal error").await;
            }
        };

        let mut receivers = Vec::with_capacity(alices.len());
        for alice in &alices {
            let (sender, receiver) = oneshot::channel();
            self.slots.insert(alice.peer_id, sender);
            receivers.push(receiver);
        }
        aggregator::spawn_aggregator(
            self.round.id,
            built.psbt.clone(),
            receivers,
            self.events_tx.clone(),
        );

        log::info!(
            "Round {}: signing open, awaiting {} peers",
            self.round.id,
            alices.len()
        );
        for alice in &alices {
            if !self.send(
                alice.peer_id,
                Message::UnsignedPsbt(PsbtMessage {
                    psbt: built.psbt.clone(),
                }),
            ) {
                log::warn!("Peer {} is gone; its slot will time out", alice.peer_id);
            }
        }
        self.schedule(
            Event::SigningTimeout {
                round_id: self.round.id,
            },
            self.cfg.signing_time,
        );
    }

    fn build_round_psbt(&mut self) -> Result<builder::UnsignedRound, CoordinatorError> {
        let alices = self.store.registered_alices(&self.round.id)?;
        let inputs = self.store.inputs_for_round(&self.round.id)?;
        let outputs = self.store.outputs_for_round(&self.round.id)?;
        let coordinator_spk = self.keys.fee_address()?.script_pubkey();

        let built =
            builder::build_unsigned_round(&self.round, &alices, &inputs, &outputs, coordinator_spk)
                .map_err(|e| CoordinatorError::InvalidPsbt(e.to_string()))?;
        self.store
            .set_input_indexes(&self.round.id, &built.input_indexes)?;
        self.store.set_unsigned_psbt(&self.round.id, &built.psbt)?;
        Ok(built)
    }

    async fn on_signing_timeout(&mut self, round_id: RoundId) {
        if self.round.id != round_id || self.round.status != RoundStatus::Signing {
            return;
        }
        // Empty slots mean every PSBT arrived and aggregation is about
        // to report; let it.
        if self.slots.is_empty() {
            return;
        }
        let missing = self.slots.len();
        self.fail_round(&format!("signing timed out with {} slots pending", missing))
            .await;
    }

    async fn on_aggregated(
        &mut self,
        round_id: RoundId,
        result: Result<Transaction, AggregationError>,
    ) {
        if self.round.id != round_id || self.round.status != RoundStatus::Signing {
            return;
        }
        match result {
            Ok(tx) => self.complete_round(tx).await,
            Err(e) => {
                self.fail_round(&format!("signature aggregation failed: {}", e))
                    .await
            }
        }
    }

    async fn complete_round(&mut self, tx: Transaction) {
        match self.chain.send_raw_transaction(&tx).await {
            Ok(txid) => {
                let fee_spk = match self.keys.fee_address() {
                    Ok(addr) => addr.script_pubkey(),
                    Err(e) => {
                        log::error!("Fee address derivation failed: {}", e);
                        return self.fail_round("internal error").await;
                    }
                };
                let profit = tx
                    .output
                    .iter()
                    .find(|o| o.script_pubkey == fee_spk)
                    .map(|o| o.value)
                    .unwrap_or(Amount::ZERO);
                if let Err(e) = self.store.set_final_tx(&self.round.id, &tx, profit) {
                    log::error!("Failed to persist the final transaction: {}", e);
                }
                if let Err(e) = self.set_status(RoundStatus::Signed) {
                    log::error!("Failed to mark the round signed: {}", e);
                }
                self.round.final_tx = Some(tx);
                log::info!(
                    "Round {} complete: broadcast {} (profit {} sat)",
                    self.round.id,
                    txid,
                    profit.to_sat()
                );
                self.start_next_round().await;
            }
            Err(e) => {
                // No bans: the signatures were valid, the node said no.
                log::error!("Broadcast failed: {}", e);
                self.fail_round("broadcast rejected").await;
            }
        }
    }

    async fn fail_round(&mut self, reason: &str) {
        log::warn!("Round {} failed: {}", self.round.id, reason);
        self.slots.clear();
        if let Err(e) = self.set_status(RoundStatus::Failed) {
            log::error!("Failed to persist round failure: {}", e);
        }
        self.broadcast(Message::RoundFailed(RoundFailed {
            reason: reason.to_string(),
        }));
        self.start_next_round().await;
    }

    async fn start_next_round(&mut self) {
        let fee_rate = self.fees.fee_rate().await;
        let round = price_round(&self.cfg, fee_rate);
        if let Err(e) = self.store.insert_round(&round) {
            log::error!("Failed to create the next round: {}", e);
            return;
        }
        log::info!(
            "Round {} created: {} sat mix at {} sat/vB, starting in {}s",
            round.id,
            round.mix_amount.to_sat(),
            fee_rate,
            self.cfg.round_interval.as_secs()
        );
        self.round = round;
        self.schedule(
            Event::RoundStart {
                round_id: self.round.id,
            },
            self.cfg.round_interval,
        );
        self.broadcast(Message::RestartRound(RestartRound {
            round_id: self.round.id,
        }));
    }

    // ── Plumbing ────────────────────────────────────────────────────────

    fn on_disconnected(&mut self, peer_id: PeerId) {
        log::debug!("Peer {} disconnected", peer_id);
        self.peers.remove(&peer_id);
        // An Alice that leaves before her blind signature was issued is
        // forgotten; her nonce index stays burned.
        if self.round.status.accepts_nonce_requests() {
            if let Err(e) = self.store.delete_unregistered_alice(&peer_id) {
                log::error!("Failed to forget peer {}: {}", peer_id, e);
            }
        }
    }

    fn set_status(&mut self, status: RoundStatus) -> Result<(), StoreError> {
        self.store.update_round_status(&self.round.id, status)?;
        self.round.status = status;
        Ok(())
    }

    fn schedule(&self, event: Event, delay: Duration) {
        let events = self.events_tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = events.send(event);
        });
    }

    fn send(&self, peer_id: PeerId, msg: Message) -> bool {
        match self.peers.get(&peer_id) {
            Some(outbound) => outbound.send(msg).is_ok(),
            None => false,
        }
    }

    fn broadcast(&self, msg: Message) {
        for outbound in self.peers.values() {
            let _ = outbound.send(msg.clone());
        }
    }

    fn shutdown(&mut self) {
        log::info!("Coordinator stopping");
        self.slots.clear();
        if !self.round.status.is_terminal() {
            if let Err(e) = self.set_status(RoundStatus::Failed) {
                log::error!("Failed to flush the round on shutdown: {}", e);
            }
        }
        self.broadcast(Message::RoundFailed(RoundFailed {
            reason: "coordinator shutting down".into(),
        }));
        self.peers.clear();
    }
}

fn price_round(cfg: &CoordinatorConfig, fee_rate: u64) -> Round {
    Round::new(
        RoundId::generate(),
        unix_now() + cfg.round_interval.as_secs(),
        fee_rate,
        cfg.mix_amount,
        cfg.coordinator_fee,
    )
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// A signed PSBT must embed the exact unsigned transaction, finalize all
/// of the peer's inputs and touch nobody else's.
fn validate_signed_psbt(
    secp: &Secp256k1<All>,
    unsigned: &Psbt,
    signed: &Psbt,
    peer_inputs: &[RegisteredInput],
) -> Result<(), String> {
    if consensus::serialize(&signed.unsigned_tx) != consensus::serialize(&unsigned.unsigned_tx) {
        return Err("embedded transaction differs from the round's".into());
    }

    let mut owned = HashSet::new();
    for input in peer_inputs {
        let index = input
            .index_in_final_tx
            .ok_or_else(|| format!("input {} has no assigned index", input.outpoint))?
            as usize;
        owned.insert(index);
        aggregator::verify_finalized_input(secp, signed, index, &input.output)
            .map_err(|e| e.to_string())?;
    }

    for (index, psbt_input) in signed.inputs.iter().enumerate() {
        if psbt_input.final_script_witness.is_some() && !owned.contains(&index) {
            return Err(format!("input {} belongs to another peer", index));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use bitcoin::absolute::LockTime;
    use bitcoin::hashes::Hash;
    use bitcoin::sighash::SighashCache;
    use bitcoin::transaction::Version;
    use bitcoin::{
        CompressedPublicKey, EcdsaSighashType, ScriptBuf, Sequence, TxIn, TxOut, Txid, Witness,
    };
    use gyre_bitcoind::ClientError;
    use gyre_core::blind::Blinder;
    use gyre_core::proof::create_input_proof;
    use gyre_core::seed::{derive_seed, parse_mnemonic};
    use gyre_core::wire::InputReference;
    use secp256k1::{Message as SecpMessage, PublicKey, SecretKey};
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Mutex;

    struct MockChain {
        txs: Mutex<HashMap<Txid, Transaction>>,
        broadcast: Mutex<Vec<Transaction>>,
        reject_broadcast: AtomicBool,
    }

    impl MockChain {
        fn new() -> Arc<Self> {
            Arc::new(MockChain {
                txs: Mutex::new(HashMap::new()),
                broadcast: Mutex::new(Vec::new()),
                reject_broadcast: AtomicBool::new(false),
            })
        }

        fn put_tx(&self, tx: Transaction) -> Txid {
            let txid = tx.compute_txid();
            self.txs.lock().unwrap().insert(txid, tx);
            txid
        }
    }

    #[async_trait]
    impl ChainSource for MockChain {
        async fn get_raw_transaction(
            &self,
            txid: &Txid,
        ) -> Result<Option<Transaction>, ClientError> {
            Ok(self.txs.lock().unwrap().get(txid).cloned())
        }

        async fn send_raw_transaction(&self, tx: &Transaction) -> Result<Txid, ClientError> {
            if self.reject_broadcast.load(Ordering::SeqCst) {
                return Err(ClientError::Rpc {
                    code: -26,
                    message: "mempool rejection".into(),
                });
            }
            self.broadcast.lock().unwrap().push(tx.clone());
            Ok(tx.compute_txid())
        }

        async fn estimate_smart_fee(&self, _conf_target: u16) -> Result<Option<u64>, ClientError> {
            Ok(None)
        }
    }

    fn test_config() -> CoordinatorConfig {
        CoordinatorConfig {
            network: Network::Regtest,
            mix_amount: Amount::from_sat(100_000),
            coordinator_fee: Amount::from_sat(500),
            min_remix_peers: 1,
            min_new_peers: 1,
            max_peers: 3,
            round_interval: Duration::from_secs(3_600),
            input_registration_time: Duration::from_secs(3_600),
            output_registration_time: Duration::from_secs(3_600),
            signing_time: Duration::from_secs(3_600),
            bad_inputs_ban_duration: Duration::from_secs(600),
            invalid_signature_ban_duration: Duration::from_secs(1_200),
            fallback_fee_rate: 10,
        }
    }

    async fn test_coordinator(chain: Arc<MockChain>) -> Coordinator {
        let mnemonic = parse_mnemonic(
            "leader monkey parrot ring guide accident before fence cannon height naive bean",
        )
        .unwrap();
        let seed = derive_seed(&mnemonic, "");
        let keys = KeyManager::new(&seed, Network::Regtest).unwrap();
        let store = Store::open_in_memory().unwrap();
        let (coordinator, _events) = Coordinator::new(test_config(), store, keys, chain)
            .await
            .unwrap();
        coordinator
    }

    fn p2wpkh_for(key: &SecretKey) -> ScriptBuf {
        let secp = Secp256k1::new();
        let pubkey = CompressedPublicKey(PublicKey::from_secret_key(&secp, key));
        ScriptBuf::new_p2wpkh(&pubkey.wpubkey_hash())
    }

    /// Put a funding transaction paying `value` to `key` on the mock
    /// chain; returns the spendable outpoint and its output.
    fn fund_utxo(chain: &MockChain, key: &SecretKey, value: u64, salt: u8) -> (OutPoint, TxOut) {
        let output = TxOut {
            value: Amount::from_sat(value),
            script_pubkey: p2wpkh_for(key),
        };
        let tx = Transaction {
            version: Version::TWO,
            lock_time: LockTime::ZERO,
            input: vec![TxIn {
                previous_output: OutPoint {
                    txid: Txid::from_byte_array([salt; 32]),
                    vout: 0,
                },
                script_sig: ScriptBuf::new(),
                sequence: Sequence::MAX,
                witness: Witness::new(),
            }],
            output: vec![output.clone()],
        };
        let txid = chain.put_tx(tx);
        (OutPoint { txid, vout: 0 }, output)
    }

    struct TestPeer {
        peer_id: PeerId,
        utxo_key: SecretKey,
        outpoint: OutPoint,
        prev: TxOut,
        nonce: Option<PublicKey>,
        blinder: Option<Blinder>,
        mixed_output: TxOut,
    }

    impl TestPeer {
        fn new(chain: &MockChain, byte: u8, value: u64) -> Self {
            let utxo_key = SecretKey::from_slice(&[byte; 32]).unwrap();
            let (outpoint, prev) = fund_utxo(chain, &utxo_key, value, byte);
            let fresh = SecretKey::from_slice(&[byte ^ 0xF0; 32]).unwrap();
            TestPeer {
                peer_id: PeerId::from_bytes([byte; 32]),
                utxo_key,
                outpoint,
                prev,
                nonce: None,
                blinder: None,
                mixed_output: TxOut {
                    value: Amount::from_sat(100_000),
                    script_pubkey: p2wpkh_for(&fresh),
                },
            }
        }

        fn ask_nonce(&mut self, coordinator: &mut Coordinator) {
            let reply = coordinator
                .get_nonce(
                    self.peer_id,
                    &AskNonce {
                        round_id: coordinator.round.id,
                    },
                )
                .unwrap();
            match reply {
                Message::Nonce(msg) => self.nonce = Some(msg.nonce),
                other => panic!("unexpected reply {:?}", other),
            }
        }

        fn registration(&mut self, coordinator: &Coordinator, change: u64) -> RegisterInputs {
            let secp = Secp256k1::new();
            let round_key = coordinator.keys.round_pubkey(&coordinator.round.id).unwrap();
            let commitment = blind::output_commitment(&self.mixed_output);
            let (blinder, challenge) = Blinder::blind(
                &secp,
                &round_key,
                self.nonce.as_ref().unwrap(),
                &commitment,
            )
            .unwrap();
            self.blinder = Some(blinder);
            RegisterInputs {
                inputs: vec![InputReference {
                    outpoint: self.outpoint,
                    output: self.prev.clone(),
                    proof: create_input_proof(&secp, &self.utxo_key, self.nonce.as_ref().unwrap()),
                }],
                blinded_output: challenge,
                change_spk: p2wpkh_for(&SecretKey::from_slice(&[0xCC; 32]).unwrap()),
                change_amount: Amount::from_sat(change),
            }
        }

        async fn register(
            &mut self,
            coordinator: &mut Coordinator,
            change: u64,
        ) -> Result<Message, CoordinatorError> {
            let msg = self.registration(coordinator, change);
            coordinator.register_inputs(self.peer_id, msg).await
        }

        fn bob_message(&self, coordinator: &Coordinator) -> BobMessage {
            let secp = Secp256k1::new();
            let round_key = coordinator.keys.round_pubkey(&coordinator.round.id).unwrap();
            let blind_sig = match coordinator
                .store
                .get_alice(&self.peer_id)
                .unwrap()
                .unwrap()
                .blind_sig
            {
                Some(sig) => sig,
                None => panic!("no blind signature issued"),
            };
            let sig = self.blinder.as_ref().unwrap().unblind(&blind_sig).unwrap();
            let commitment = blind::output_commitment(&self.mixed_output);
            assert!(blind::verify(&secp, &round_key, &commitment, &sig));
            BobMessage {
                output: self.mixed_output.clone(),
                sig,
            }
        }

        fn sign_unsigned_psbt(&self, coordinator: &Coordinator) -> Psbt {
            let secp = Secp256k1::new();
            let mut psbt = coordinator.round.unsigned_psbt.clone().unwrap();
            let index = coordinator
                .store
                .inputs_for_peer(&coordinator.round.id, &self.peer_id)
                .unwrap()[0]
                .index_in_final_tx
                .unwrap() as usize;
            let sighash = SighashCache::new(&psbt.unsigned_tx)
                .p2wpkh_signature_hash(
                    index,
                    &self.prev.script_pubkey,
                    self.prev.value,
                    EcdsaSighashType::All,
                )
                .unwrap();
            let sig = secp.sign_ecdsa(
                &SecpMessage::from_digest(sighash.to_byte_array()),
                &self.utxo_key,
            );
            let mut sig_bytes = sig.serialize_der().to_vec();
            sig_bytes.push(EcdsaSighashType::All as u8);
            let pubkey = PublicKey::from_secret_key(&secp, &self.utxo_key);
            psbt.inputs[index].final_script_witness = Some(Witness::from_slice(&[
                sig_bytes,
                pubkey.serialize().to_vec(),
            ]));
            psbt
        }
    }

    #[tokio::test]
    async fn nonce_issuance_is_idempotent_and_phase_gated() {
        let chain = MockChain::new();
        let mut coordinator = test_coordinator(Arc::clone(&chain)).await;

        let mut peer = TestPeer::new(&chain, 1, 200_000);
        peer.ask_nonce(&mut coordinator);
        let first = peer.nonce.unwrap();
        peer.ask_nonce(&mut coordinator);
        assert_eq!(peer.nonce.unwrap(), first);

        let mut other = TestPeer::new(&chain, 2, 200_000);
        other.ask_nonce(&mut coordinator);
        assert_ne!(other.nonce.unwrap(), first);

        // Wrong round id is refused.
        assert!(matches!(
            coordinator.get_nonce(
                peer.peer_id,
                &AskNonce {
                    round_id: RoundId::from_bytes([9; 32])
                }
            ),
            Err(CoordinatorError::WrongRound)
        ));

        // Registration before the round opens is refused.
        assert!(matches!(
            peer.register(&mut coordinator, 97_150).await,
            Err(CoordinatorError::WrongPhase(RoundStatus::Pending))
        ));
    }

    #[tokio::test]
    async fn wrong_script_type_rejects_without_ban() {
        let chain = MockChain::new();
        let mut coordinator = test_coordinator(Arc::clone(&chain)).await;
        coordinator.on_round_start(coordinator.round.id);

        let mut peer = TestPeer::new(&chain, 1, 200_000);
        peer.ask_nonce(&mut coordinator);

        // Re-fund the same key under P2PKH and claim that output.
        let secp = Secp256k1::new();
        let pubkey = bitcoin::PublicKey::new(PublicKey::from_secret_key(&secp, &peer.utxo_key));
        let p2pkh = TxOut {
            value: Amount::from_sat(200_000),
            script_pubkey: ScriptBuf::new_p2pkh(&pubkey.pubkey_hash()),
        };
        let legacy_tx = Transaction {
            version: Version::TWO,
            lock_time: LockTime::ZERO,
            input: vec![],
            output: vec![p2pkh.clone()],
        };
        let legacy_txid = chain.put_tx(legacy_tx);

        let mut msg = peer.registration(&coordinator, 97_150);
        msg.inputs[0].outpoint = OutPoint {
            txid: legacy_txid,
            vout: 0,
        };
        msg.inputs[0].output = p2pkh;
        let legacy_outpoint = msg.inputs[0].outpoint;

        assert!(matches!(
            coordinator.register_inputs(peer.peer_id, msg).await,
            Err(CoordinatorError::UnsupportedScriptType)
        ));
        // Policy rejection is not misbehavior: no ban entry was created.
        assert!(!coordinator
            .store
            .is_banned(&legacy_outpoint, unix_now())
            .unwrap());

        // The follow-up with her actual P2WPKH outpoint is admitted.
        let reply = peer.register(&mut coordinator, 97_150).await.unwrap();
        assert!(matches!(reply, Message::BlindedSig(_)));
    }

    #[tokio::test]
    async fn forged_input_proof_bans_all_outpoints() {
        let chain = MockChain::new();
        let mut coordinator = test_coordinator(Arc::clone(&chain)).await;
        coordinator.on_round_start(coordinator.round.id);

        let mut peer = TestPeer::new(&chain, 1, 200_000);
        peer.ask_nonce(&mut coordinator);

        let secp = Secp256k1::new();
        let mut msg = peer.registration(&coordinator, 97_150);
        let attacker = SecretKey::from_slice(&[0x77; 32]).unwrap();
        msg.inputs[0].proof =
            create_input_proof(&secp, &attacker, peer.nonce.as_ref().unwrap());

        assert!(matches!(
            coordinator.register_inputs(peer.peer_id, msg).await,
            Err(CoordinatorError::InvalidInputs(_))
        ));
        assert!(coordinator
            .store
            .is_banned(&peer.outpoint, unix_now())
            .unwrap());

        // While banned, even a well-formed registration is refused.
        match peer.register(&mut coordinator, 97_150).await {
            Err(CoordinatorError::InvalidInputs(reason)) => {
                assert!(reason.contains("banned"), "reason was: {}", reason)
            }
            other => panic!("expected ban rejection, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn overdrawn_change_is_rejected_and_banned() {
        let chain = MockChain::new();
        let mut coordinator = test_coordinator(Arc::clone(&chain)).await;
        coordinator.on_round_start(coordinator.round.id);

        let mut peer = TestPeer::new(&chain, 1, 200_000);
        peer.ask_nonce(&mut coordinator);

        // One sat over the fee equation's maximum.
        assert!(matches!(
            peer.register(&mut coordinator, 97_151).await,
            Err(CoordinatorError::InvalidInputs(_))
        ));
        assert!(coordinator
            .store
            .is_banned(&peer.outpoint, unix_now())
            .unwrap());
    }

    #[tokio::test]
    async fn max_peers_cutoff_advances_exactly_once() {
        let chain = MockChain::new();
        let mut coordinator = test_coordinator(Arc::clone(&chain)).await;
        coordinator.on_round_start(coordinator.round.id);

        for byte in 1..=3u8 {
            let mut peer = TestPeer::new(&chain, byte, 200_000);
            peer.ask_nonce(&mut coordinator);
            assert_eq!(coordinator.round.status, RoundStatus::RegisterAlices);
            peer.register(&mut coordinator, 97_150).await.unwrap();
        }
        // The third (max_peers) registration flipped the phase.
        assert_eq!(coordinator.round.status, RoundStatus::RegisterOutputs);

        // A late Alice gets a phase error, not a second transition. The
        // phase gate fires before the coordinator even looks her up.
        let mut late = TestPeer::new(&chain, 4, 200_000);
        let secp = Secp256k1::new();
        late.nonce = Some(PublicKey::from_secret_key(
            &secp,
            &SecretKey::from_slice(&[0x99; 32]).unwrap(),
        ));
        assert!(matches!(
            late.register(&mut coordinator, 97_150).await,
            Err(CoordinatorError::WrongPhase(RoundStatus::RegisterOutputs))
        ));
    }

    #[tokio::test]
    async fn input_timeout_with_quorum_advances_without_fails() {
        let chain = MockChain::new();
        let mut coordinator = test_coordinator(Arc::clone(&chain)).await;
        coordinator.on_round_start(coordinator.round.id);
        let round_id = coordinator.round.id;

        for byte in 1..=2u8 {
            let mut peer = TestPeer::new(&chain, byte, 200_000);
            peer.ask_nonce(&mut coordinator);
            peer.register(&mut coordinator, 97_150).await.unwrap();
        }
        coordinator.on_input_timeout(round_id).await;
        assert_eq!(coordinator.round.status, RoundStatus::RegisterOutputs);
        assert_eq!(coordinator.round.id, round_id);
    }

    #[tokio::test]
    async fn input_timeout_below_quorum_fails_and_reschedules() {
        let chain = MockChain::new();
        let mut coordinator = test_coordinator(Arc::clone(&chain)).await;
        coordinator.on_round_start(coordinator.round.id);
        let first_round = coordinator.round.id;

        let mut peer = TestPeer::new(&chain, 1, 200_000);
        peer.ask_nonce(&mut coordinator);
        peer.register(&mut coordinator, 97_150).await.unwrap();

        coordinator.on_input_timeout(first_round).await;
        assert_ne!(coordinator.round.id, first_round);
        assert_eq!(coordinator.round.status, RoundStatus::Pending);
        assert_eq!(
            coordinator.store.get_round(&first_round).unwrap().unwrap().status,
            RoundStatus::Failed
        );

        // The stale output timer for the failed round is a no-op.
        coordinator.on_output_timeout(first_round).await;
        assert_eq!(coordinator.round.status, RoundStatus::Pending);
    }

    #[tokio::test]
    async fn full_round_signs_and_broadcasts() {
        let chain = MockChain::new();
        let mut coordinator = test_coordinator(Arc::clone(&chain)).await;
        coordinator.on_round_start(coordinator.round.id);
        let round_id = coordinator.round.id;

        let mut peers: Vec<TestPeer> = (1..=2u8)
            .map(|byte| TestPeer::new(&chain, byte, 200_000))
            .collect();
        for peer in &mut peers {
            peer.ask_nonce(&mut coordinator);
            peer.register(&mut coordinator, 97_150).await.unwrap();
        }
        coordinator.on_input_timeout(round_id).await;
        assert_eq!(coordinator.round.status, RoundStatus::RegisterOutputs);

        // Bobs arrive over "separate connections"; no peer id involved.
        for peer in &peers {
            let reply = coordinator
                .register_output(peer.bob_message(&coordinator))
                .await
                .unwrap();
            assert_eq!(reply, Message::Ack);
        }
        assert_eq!(coordinator.round.status, RoundStatus::Signing);
        let unsigned = coordinator.round.unsigned_psbt.clone().unwrap();
        assert_eq!(unsigned.unsigned_tx.input.len(), 2);
        // 2 mixed + 2 change + coordinator fee.
        assert_eq!(unsigned.unsigned_tx.output.len(), 5);

        for peer in &peers {
            let signed = peer.sign_unsigned_psbt(&coordinator);
            let reply = coordinator
                .register_psbt_signature(peer.peer_id, PsbtMessage { psbt: signed })
                .unwrap();
            assert_eq!(reply, Message::Ack);
        }

        // The spawned aggregator reports back through the event queue.
        let final_tx = loop {
            match coordinator.events_rx.recv().await.unwrap() {
                Event::Aggregated { round_id: id, result } => {
                    assert_eq!(id, round_id);
                    break result.unwrap();
                }
                _ => continue,
            }
        };
        coordinator.on_aggregated(round_id, Ok(final_tx.clone())).await;

        assert_eq!(
            coordinator.store.get_round(&round_id).unwrap().unwrap().status,
            RoundStatus::Signed
        );
        let stored = coordinator.store.get_round(&round_id).unwrap().unwrap();
        assert_eq!(
            stored.final_tx.unwrap().compute_txid(),
            final_tx.compute_txid()
        );
        assert_eq!(stored.profit, Some(Amount::from_sat(1_000)));
        assert_eq!(chain.broadcast.lock().unwrap().len(), 1);

        // Miner-fee sufficiency on the fully signed transaction.
        let in_total: u64 = 400_000;
        let out_total: u64 = final_tx.output.iter().map(|o| o.value.to_sat()).sum();
        assert!(in_total - out_total >= 10 * final_tx.vsize() as u64);

        // A fresh round is already scheduled.
        assert_ne!(coordinator.round.id, round_id);
        assert_eq!(coordinator.round.status, RoundStatus::Pending);
    }

    #[tokio::test]
    async fn bob_replay_is_idempotent_and_junk_sig_rejected() {
        let chain = MockChain::new();
        let mut coordinator = test_coordinator(Arc::clone(&chain)).await;
        coordinator.on_round_start(coordinator.round.id);
        let round_id = coordinator.round.id;

        let mut peers: Vec<TestPeer> = (1..=2u8)
            .map(|byte| TestPeer::new(&chain, byte, 200_000))
            .collect();
        for peer in &mut peers {
            peer.ask_nonce(&mut coordinator);
            peer.register(&mut coordinator, 97_150).await.unwrap();
        }
        coordinator.on_input_timeout(round_id).await;

        let bob = peers[0].bob_message(&coordinator);
        coordinator.register_output(bob.clone()).await.unwrap();
        // Replay: same output and signature, still one row.
        coordinator.register_output(bob.clone()).await.unwrap();
        assert_eq!(coordinator.store.output_count(&round_id).unwrap(), 1);

        // A signature over a different output does not verify.
        let mut forged = bob;
        forged.output.script_pubkey =
            p2wpkh_for(&SecretKey::from_slice(&[0x5A; 32]).unwrap());
        assert!(matches!(
            coordinator.register_output(forged).await,
            Err(CoordinatorError::InvalidOutputSignature)
        ));
    }

    #[tokio::test]
    async fn tampered_signed_psbt_bans_and_fails_the_round() {
        let chain = MockChain::new();
        let mut coordinator = test_coordinator(Arc::clone(&chain)).await;
        coordinator.on_round_start(coordinator.round.id);
        let round_id = coordinator.round.id;

        let mut peers: Vec<TestPeer> = (1..=2u8)
            .map(|byte| TestPeer::new(&chain, byte, 200_000))
            .collect();
        for peer in &mut peers {
            peer.ask_nonce(&mut coordinator);
            peer.register(&mut coordinator, 97_150).await.unwrap();
        }
        coordinator.on_input_timeout(round_id).await;
        for peer in &peers {
            coordinator
                .register_output(peer.bob_message(&coordinator))
                .await
                .unwrap();
        }

        // Peer 0 submits a PSBT embedding a different transaction.
        let mut evil = peers[0].sign_unsigned_psbt(&coordinator);
        evil.unsigned_tx.lock_time = LockTime::from_consensus(1);
        assert!(matches!(
            coordinator.register_psbt_signature(peers[0].peer_id, PsbtMessage { psbt: evil }),
            Err(CoordinatorError::InvalidPsbt(_))
        ));
        assert!(coordinator
            .store
            .is_banned(&peers[0].outpoint, unix_now())
            .unwrap());

        // The dropped slot fails aggregation, which fails the round.
        let result = loop {
            match coordinator.events_rx.recv().await.unwrap() {
                Event::Aggregated { result, .. } => break result,
                _ => continue,
            }
        };
        coordinator.on_aggregated(round_id, result).await;
        assert_eq!(
            coordinator.store.get_round(&round_id).unwrap().unwrap().status,
            RoundStatus::Failed
        );
        assert_ne!(coordinator.round.id, round_id);
        assert!(chain.broadcast.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn broadcast_rejection_fails_the_round_without_bans() {
        let chain = MockChain::new();
        let mut coordinator = test_coordinator(Arc::clone(&chain)).await;
        coordinator.on_round_start(coordinator.round.id);
        let round_id = coordinator.round.id;

        let mut peers: Vec<TestPeer> = (1..=2u8)
            .map(|byte| TestPeer::new(&chain, byte, 200_000))
            .collect();
        for peer in &mut peers {
            peer.ask_nonce(&mut coordinator);
            peer.register(&mut coordinator, 97_150).await.unwrap();
        }
        coordinator.on_input_timeout(round_id).await;
        for peer in &peers {
            coordinator
                .register_output(peer.bob_message(&coordinator))
                .await
                .unwrap();
        }
        for peer in &peers {
            let signed = peer.sign_unsigned_psbt(&coordinator);
            coordinator
                .register_psbt_signature(peer.peer_id, PsbtMessage { psbt: signed })
                .unwrap();
        }
        let final_tx = loop {
            match coordinator.events_rx.recv().await.unwrap() {
                Event::Aggregated { result, .. } => break result.unwrap(),
                _ => continue,
            }
        };

        chain.reject_broadcast.store(true, Ordering::SeqCst);
        coordinator.on_aggregated(round_id, Ok(final_tx)).await;

        assert_eq!(
            coordinator.store.get_round(&round_id).unwrap().unwrap().status,
            RoundStatus::Failed
        );
        // Failed by the node, not by a peer: nobody is banned.
        for peer in &peers {
            assert!(!coordinator
                .store
                .is_banned(&peer.outpoint, unix_now())
                .unwrap());
        }
        assert_ne!(coordinator.round.id, round_id);
    }
}
