//! End-to-end round scenarios: real TCP connections against an
//! in-process coordinator backed by a mock chain.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bitcoin::absolute::LockTime;
use bitcoin::hashes::Hash;
use bitcoin::psbt::Psbt;
use bitcoin::sighash::SighashCache;
use bitcoin::transaction::Version;
use bitcoin::{
    Amount, CompressedPublicKey, EcdsaSighashType, Network, OutPoint, ScriptBuf, Sequence,
    Transaction, TxIn, TxOut, Txid, Witness,
};
use secp256k1::{Message as SecpMessage, PublicKey, Secp256k1, SecretKey};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use gyre_bitcoind::{ChainSource, ClientError};
use gyre_coordinator::{connection, Coordinator, CoordinatorConfig, Store};
use gyre_core::blind::{output_commitment, Blinder, OutputSignature};
use gyre_core::proof::create_input_proof;
use gyre_core::seed::{derive_seed, parse_mnemonic};
use gyre_core::types::{RoundId, RoundStatus};
use gyre_core::wire::{
    AskMixDetails, AskNonce, BobMessage, InputReference, Message, MixDetails, PsbtMessage,
    RegisterInputs,
};
use gyre_core::KeyManager;

// ── Mock chain ──────────────────────────────────────────────────────────

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
    async fn get_raw_transaction(&self, txid: &Txid) -> Result<Option<Transaction>, ClientError> {
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

// ── Harness ─────────────────────────────────────────────────────────────

struct Harness {
    chain: Arc<MockChain>,
    addr: SocketAddr,
    db_path: PathBuf,
    _dir: tempfile::TempDir,
}

impl Harness {
    async fn start(max_peers: u64, output_registration: Duration) -> Self {
        let chain = MockChain::new();
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("coordinator.db");

        let mnemonic = parse_mnemonic(
            "leader monkey parrot ring guide accident before fence cannon height naive bean",
        )
        .unwrap();
        let seed = derive_seed(&mnemonic, "");
        let keys = KeyManager::new(&seed, Network::Regtest).unwrap();
        let store = Store::open(&db_path).unwrap();

        let cfg = CoordinatorConfig {
            network: Network::Regtest,
            mix_amount: Amount::from_sat(100_000),
            coordinator_fee: Amount::from_sat(500),
            min_remix_peers: 1,
            min_new_peers: 1,
            max_peers,
            round_interval: Duration::from_millis(200),
            input_registration_time: Duration::from_secs(30),
            output_registration_time: output_registration,
            signing_time: Duration::from_secs(30),
            bad_inputs_ban_duration: Duration::from_secs(600),
            invalid_signature_ban_duration: Duration::from_secs(1_200),
            fallback_fee_rate: 10,
        };

        let chain_source: Arc<dyn ChainSource> = Arc::clone(&chain) as Arc<dyn ChainSource>;
        let (coordinator, events) = Coordinator::new(cfg, store, keys, chain_source)
            .await
            .unwrap();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(connection::serve(listener, events));
        tokio::spawn(coordinator.run());

        Harness {
            chain,
            addr,
            db_path,
            _dir: dir,
        }
    }

    /// Second read connection onto the coordinator's database.
    fn store(&self) -> Store {
        Store::open(&self.db_path).unwrap()
    }

    async fn wait_for_status(&self, round_id: &RoundId, status: RoundStatus) {
        let store = self.store();
        for _ in 0..100 {
            if let Some(round) = store.get_round(round_id).unwrap() {
                if round.status == status {
                    return;
                }
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        panic!("round never reached {:?}", status);
    }
}

// ── Wire client ─────────────────────────────────────────────────────────

struct Wire {
    stream: TcpStream,
}

impl Wire {
    async fn connect(addr: SocketAddr) -> Self {
        Wire {
            stream: TcpStream::connect(addr).await.unwrap(),
        }
    }

    async fn send(&mut self, msg: &Message) {
        self.stream
            .write_all(&msg.to_frame().unwrap())
            .await
            .unwrap();
    }

    async fn recv(&mut self) -> Message {
        tokio::time::timeout(Duration::from_secs(10), async {
            let mut len_buf = [0u8; 2];
            self.stream.read_exact(&mut len_buf).await.unwrap();
            let mut body = vec![0u8; u16::from_be_bytes(len_buf) as usize];
            self.stream.read_exact(&mut body).await.unwrap();
            Message::from_frame_body(&body).unwrap()
        })
        .await
        .expect("timed out waiting for a frame")
    }

    async fn request(&mut self, msg: &Message) -> Message {
        self.send(msg).await;
        self.recv().await
    }
}

// ── Peer driver ─────────────────────────────────────────────────────────

fn p2wpkh_for(key: &SecretKey) -> ScriptBuf {
    let secp = Secp256k1::new();
    let pubkey = CompressedPublicKey(PublicKey::from_secret_key(&secp, key));
    ScriptBuf::new_p2wpkh(&pubkey.wpubkey_hash())
}

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

/// One human participant: an Alice connection plus the material for the
/// later, unrelated Bob connection.
struct Peer {
    conn: Wire,
    details: MixDetails,
    utxo_key: SecretKey,
    outpoint: OutPoint,
    prev: TxOut,
    mixed_output: TxOut,
    output_sig: Option<OutputSignature>,
}

impl Peer {
    async fn connect(harness: &Harness, byte: u8, value: u64) -> Self {
        let utxo_key = SecretKey::from_slice(&[byte; 32]).unwrap();
        let (outpoint, prev) = fund_utxo(&harness.chain, &utxo_key, value, byte);
        let mut conn = Wire::connect(harness.addr).await;

        let details = match conn
            .request(&Message::AskMixDetails(AskMixDetails {
                network: Network::Regtest,
            }))
            .await
        {
            Message::MixDetails(details) => details,
            other => panic!("expected MixDetails, got {:?}", other),
        };

        let fresh = SecretKey::from_slice(&[byte ^ 0xF0; 32]).unwrap();
        Peer {
            conn,
            details,
            utxo_key,
            outpoint,
            prev,
            mixed_output: TxOut {
                value: Amount::from_sat(100_000),
                script_pubkey: p2wpkh_for(&fresh),
            },
            output_sig: None,
        }
    }

    /// Ask for a nonce and register inputs, retrying until the round
    /// opens. Stores the unblinded output signature for the Bob step.
    async fn register(&mut self, change: u64) {
        let secp = Secp256k1::new();
        let nonce = match self
            .conn
            .request(&Message::AskNonce(AskNonce {
                round_id: self.details.round_id,
            }))
            .await
        {
            Message::Nonce(msg) => msg.nonce,
            other => panic!("expected Nonce, got {:?}", other),
        };

        let commitment = output_commitment(&self.mixed_output);
        for _ in 0..100 {
            let (blinder, challenge) =
                Blinder::blind(&secp, &self.details.public_key, &nonce, &commitment).unwrap();
            let msg = Message::RegisterInputs(RegisterInputs {
                inputs: vec![InputReference {
                    outpoint: self.outpoint,
                    output: self.prev.clone(),
                    proof: create_input_proof(&secp, &self.utxo_key, &nonce),
                }],
                blinded_output: challenge,
                change_spk: p2wpkh_for(&self.utxo_key),
                change_amount: Amount::from_sat(change),
            });
            match self.conn.request(&msg).await {
                Message::BlindedSig(reply) => {
                    self.output_sig = Some(blinder.unblind(&reply.sig).unwrap());
                    return;
                }
                Message::Failure(f) if f.reason.contains("phase") => {
                    tokio::time::sleep(Duration::from_millis(50)).await;
                }
                other => panic!("registration failed: {:?}", other),
            }
        }
        panic!("round never opened for registration");
    }

    /// The Bob role: a fresh connection the coordinator cannot relate to
    /// the Alice one.
    async fn submit_output(&self, harness: &Harness) {
        let mut bob_conn = Wire::connect(harness.addr).await;
        let reply = bob_conn
            .request(&Message::Bob(BobMessage {
                output: self.mixed_output.clone(),
                sig: self.output_sig.unwrap(),
            }))
            .await;
        assert_eq!(reply, Message::Ack, "Bob submission refused");
    }

    /// Await the unsigned PSBT push, sign our input, submit, and expect
    /// an Ack.
    async fn sign_and_submit(&mut self) -> Psbt {
        let psbt = loop {
            match self.conn.recv().await {
                Message::UnsignedPsbt(msg) => break msg.psbt,
                Message::RestartRound(_) => continue,
                other => panic!("expected UnsignedPsbt, got {:?}", other),
            }
        };

        let secp = Secp256k1::new();
        let index = psbt
            .unsigned_tx
            .input
            .iter()
            .position(|input| input.previous_output == self.outpoint)
            .expect("our input is in the final transaction");

        let mut signed = psbt.clone();
        let sighash = SighashCache::new(&signed.unsigned_tx)
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
        signed.inputs[index].final_script_witness = Some(Witness::from_slice(&[
            sig_bytes,
            pubkey.serialize().to_vec(),
        ]));

        self.conn
            .send(&Message::SignedPsbt(PsbtMessage { psbt: signed }))
            .await;
        loop {
            match self.conn.recv().await {
                Message::Ack => break,
                Message::RestartRound(_) => continue,
                other => panic!("signature submission failed: {:?}", other),
            }
        }
        psbt
    }
}

// ── Scenarios ───────────────────────────────────────────────────────────

/// Happy path with the literal values: two peers, one 200k sat P2WPKH
/// input each, 97_150 change, a 2-in/5-out transaction, broadcast once.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn two_peer_round_completes_end_to_end() {
    let harness = Harness::start(2, Duration::from_secs(30)).await;

    let mut peers = Vec::new();
    for byte in [0x11u8, 0x12] {
        peers.push(Peer::connect(&harness, byte, 200_000).await);
    }
    let round_id = peers[0].details.round_id;
    assert_eq!(peers[0].details.amount, Amount::from_sat(100_000));
    assert_eq!(peers[0].details.input_fee, Amount::from_sat(1_490));
    assert_eq!(peers[0].details.output_fee, Amount::from_sat(430));

    for peer in &mut peers {
        peer.register(97_150).await;
    }
    for peer in &peers {
        peer.submit_output(&harness).await;
    }

    let mut unsigned = Vec::new();
    for peer in &mut peers {
        unsigned.push(peer.sign_and_submit().await);
    }
    assert_eq!(unsigned[0].serialize(), unsigned[1].serialize());
    assert_eq!(unsigned[0].unsigned_tx.input.len(), 2);
    assert_eq!(unsigned[0].unsigned_tx.output.len(), 5);

    harness.wait_for_status(&round_id, RoundStatus::Signed).await;

    let store = harness.store();
    let round = store.get_round(&round_id).unwrap().unwrap();
    let final_tx = round.final_tx.unwrap();
    assert_eq!(round.profit, Some(Amount::from_sat(1_000)));

    // Exactly one broadcast, of exactly that transaction.
    let broadcast = harness.chain.broadcast.lock().unwrap();
    assert_eq!(broadcast.len(), 1);
    assert_eq!(broadcast[0].compute_txid(), final_tx.compute_txid());

    // Every registered input's recorded index points at its outpoint.
    for input in store.inputs_for_round(&round_id).unwrap() {
        let index = input.index_in_final_tx.unwrap() as usize;
        assert_eq!(final_tx.input[index].previous_output, input.outpoint);
    }

    // Both mixed outputs made it, and the miner fee covers the rate.
    for peer in &peers {
        assert!(final_tx.output.contains(&peer.mixed_output));
    }
    let out_total: u64 = final_tx.output.iter().map(|o| o.value.to_sat()).sum();
    assert!(400_000 - out_total >= 10 * final_tx.vsize() as u64);
}

/// Output-phase race: three Alices register, only two Bobs show up. The
/// output timer fails the round and the peers are told.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn missing_bob_fails_the_round_at_the_output_timeout() {
    let harness = Harness::start(3, Duration::from_millis(700)).await;

    let mut peers = Vec::new();
    for byte in [0x21u8, 0x22, 0x23] {
        peers.push(Peer::connect(&harness, byte, 200_000).await);
    }
    let round_id = peers[0].details.round_id;
    for peer in &mut peers {
        peer.register(97_150).await;
    }

    // The third participant never comes back as a Bob.
    for peer in &peers[..2] {
        peer.submit_output(&harness).await;
    }

    harness.wait_for_status(&round_id, RoundStatus::Failed).await;

    // Alice connections hear about it.
    match peers[0].conn.recv().await {
        Message::RoundFailed(_) => {}
        other => panic!("expected RoundFailed, got {:?}", other),
    }
    assert!(harness.chain.broadcast.lock().unwrap().is_empty());
}

/// Unlinkability: permuting the order of Bob submissions leaves the
/// persisted output set identical, and the rows carry no peer linkage.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn bob_submission_order_leaves_no_trace() {
    async fn run_round(order: [usize; 3]) -> Vec<(u64, Vec<u8>)> {
        let harness = Harness::start(3, Duration::from_secs(30)).await;

        let mut peers = Vec::new();
        for byte in [0x31u8, 0x32, 0x33] {
            peers.push(Peer::connect(&harness, byte, 200_000).await);
        }
        let round_id = peers[0].details.round_id;
        for peer in &mut peers {
            peer.register(97_150).await;
        }
        for index in order {
            peers[index].submit_output(&harness).await;
        }
        for peer in &mut peers {
            peer.sign_and_submit().await;
        }
        harness.wait_for_status(&round_id, RoundStatus::Signed).await;

        harness
            .store()
            .outputs_for_round(&round_id)
            .unwrap()
            .into_iter()
            .map(|row| {
                (
                    row.output.value.to_sat(),
                    row.output.script_pubkey.to_bytes(),
                )
            })
            .collect()
    }

    // Same participants and outputs, different submission order. The
    // mixed keys are fixed per peer byte, so both runs mint the same
    // output scripts.
    let forward = run_round([0, 1, 2]).await;
    let permuted = run_round([2, 0, 1]).await;

    assert_eq!(forward.len(), 3);
    // outputs_for_round returns rows ordered by script, so equality here
    // means the stored state is independent of arrival order.
    assert_eq!(forward, permuted);
}
