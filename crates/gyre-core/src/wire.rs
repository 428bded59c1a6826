//! Length-prefixed, tagged wire codec.
//!
//! Every frame is `[len: u16 BE][tag: u16 BE][body]`, where `len` counts
//! the tag plus the body. Embedded bitcoin values (outpoints, outputs,
//! PSBTs) use consensus serialization; everything else is explicit
//! big-endian fields. Decoding is strict: short reads, unknown tags and
//! trailing bytes are all errors, so the codec is safe on untrusted input.

use bitcoin::consensus;
use bitcoin::psbt::Psbt;
use bitcoin::{Amount, Network, OutPoint, ScriptBuf, TxOut};
use secp256k1::PublicKey;
use thiserror::Error;

use crate::blind::{OutputSignature, OUTPUT_SIG_LEN};
use crate::proof::{InputProof, INPUT_PROOF_LEN};
use crate::types::RoundId;

/// Version advertised in `MixDetails`.
pub const PROTOCOL_VERSION: u16 = 1;

/// Largest frame body (tag + payload) the codec will produce or accept.
pub const MAX_FRAME_LEN: usize = u16::MAX as usize;

const TAG_ASK_MIX_DETAILS: u16 = 0x01;
const TAG_MIX_DETAILS: u16 = 0x02;
const TAG_ASK_NONCE: u16 = 0x03;
const TAG_NONCE: u16 = 0x04;
const TAG_REGISTER_INPUTS: u16 = 0x05;
const TAG_BLINDED_SIG: u16 = 0x06;
const TAG_BOB_MESSAGE: u16 = 0x07;
const TAG_ACK: u16 = 0x08;
const TAG_UNSIGNED_PSBT: u16 = 0x09;
const TAG_SIGNED_PSBT: u16 = 0x0a;
const TAG_RESTART_ROUND: u16 = 0x0b;
const TAG_ROUND_FAILED: u16 = 0x0c;
const TAG_FAILURE: u16 = 0x0d;

#[derive(Error, Debug)]
pub enum WireError {
    #[error("Frame truncated: needed {needed} more bytes, had {remaining}")]
    Truncated { needed: usize, remaining: usize },
    #[error("Unknown message tag {0:#06x}")]
    UnknownTag(u16),
    #[error("Trailing {0} bytes after message body")]
    TrailingBytes(usize),
    #[error("Frame too large: {0} bytes")]
    Oversized(usize),
    #[error("Invalid field: {0}")]
    InvalidField(String),
}

/// Request for the current round's parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AskMixDetails {
    pub network: Network,
}

/// Advertisement of the current round.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MixDetails {
    pub version: u16,
    pub round_id: RoundId,
    pub amount: Amount,
    pub mix_fee: Amount,
    pub input_fee: Amount,
    pub output_fee: Amount,
    /// Round signing key; Bobs' signatures verify under this.
    pub public_key: PublicKey,
    /// Scheduled start of input registration (unix seconds).
    pub round_time: u64,
}

/// Request for this peer's signing nonce.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AskNonce {
    pub round_id: RoundId,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NonceMsg {
    pub nonce: PublicKey,
}

/// One UTXO offered for registration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InputReference {
    pub outpoint: OutPoint,
    /// The previous output as the peer claims it exists on chain.
    pub output: TxOut,
    pub proof: InputProof,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegisterInputs {
    pub inputs: Vec<InputReference>,
    /// Blinded challenge for the mixed output.
    pub blinded_output: [u8; 32],
    pub change_spk: ScriptBuf,
    pub change_amount: Amount,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlindedSig {
    pub sig: [u8; 32],
}

/// Unblinded output submission, sent over a connection unrelated to the
/// one that registered inputs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BobMessage {
    pub output: TxOut,
    pub sig: OutputSignature,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PsbtMessage {
    pub psbt: Psbt,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RestartRound {
    pub round_id: RoundId,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoundFailed {
    pub reason: String,
}

/// Per-request error reply; does not terminate the connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Failure {
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    AskMixDetails(AskMixDetails),
    MixDetails(MixDetails),
    AskNonce(AskNonce),
    Nonce(NonceMsg),
    RegisterInputs(RegisterInputs),
    BlindedSig(BlindedSig),
    Bob(BobMessage),
    Ack,
    UnsignedPsbt(PsbtMessage),
    SignedPsbt(PsbtMessage),
    RestartRound(RestartRound),
    RoundFailed(RoundFailed),
    Failure(Failure),
}

impl Message {
    pub fn tag(&self) -> u16 {
        match self {
            Message::AskMixDetails(_) => TAG_ASK_MIX_DETAILS,
            Message::MixDetails(_) => TAG_MIX_DETAILS,
            Message::AskNonce(_) => TAG_ASK_NONCE,
            Message::Nonce(_) => TAG_NONCE,
            Message::RegisterInputs(_) => TAG_REGISTER_INPUTS,
            Message::BlindedSig(_) => TAG_BLINDED_SIG,
            Message::Bob(_) => TAG_BOB_MESSAGE,
            Message::Ack => TAG_ACK,
            Message::UnsignedPsbt(_) => TAG_UNSIGNED_PSBT,
            Message::SignedPsbt(_) => TAG_SIGNED_PSBT,
            Message::RestartRound(_) => TAG_RESTART_ROUND,
            Message::RoundFailed(_) => TAG_ROUND_FAILED,
            Message::Failure(_) => TAG_FAILURE,
        }
    }

    /// Encode as a complete frame including the length prefix.
    pub fn to_frame(&self) -> Result<Vec<u8>, WireError> {
        let mut w = Writer::new();
        w.put_u16(self.tag());
        self.encode_body(&mut w)?;
        let body = w.into_inner();
        if body.len() > MAX_FRAME_LEN {
            return Err(WireError::Oversized(body.len()));
        }
        let mut frame = Vec::with_capacity(2 + body.len());
        frame.extend_from_slice(&(body.len() as u16).to_be_bytes());
        frame.extend_from_slice(&body);
        Ok(frame)
    }

    /// Decode from a frame body (tag + payload, length prefix stripped).
    pub fn from_frame_body(bytes: &[u8]) -> Result<Message, WireError> {
        let mut r = Reader::new(bytes);
        let tag = r.u16()?;
        let msg = Message::decode_body(tag, &mut r)?;
        if r.remaining() != 0 {
            return Err(WireError::TrailingBytes(r.remaining()));
        }
        Ok(msg)
    }

    fn encode_body(&self, w: &mut Writer) -> Result<(), WireError> {
        match self {
            Message::AskMixDetails(m) => w.put_network(m.network),
            Message::MixDetails(m) => {
                w.put_u16(m.version);
                w.put_bytes(m.round_id.as_bytes());
                w.put_u64(m.amount.to_sat());
                w.put_u64(m.mix_fee.to_sat());
                w.put_u64(m.input_fee.to_sat());
                w.put_u64(m.output_fee.to_sat());
                w.put_bytes(&m.public_key.serialize());
                w.put_u64(m.round_time);
                Ok(())
            }
            Message::AskNonce(m) => {
                w.put_bytes(m.round_id.as_bytes());
                Ok(())
            }
            Message::Nonce(m) => {
                w.put_bytes(&m.nonce.serialize());
                Ok(())
            }
            Message::RegisterInputs(m) => {
                w.put_u16(
                    u16::try_from(m.inputs.len())
                        .map_err(|_| WireError::InvalidField("too many inputs".into()))?,
                );
                for input in &m.inputs {
                    w.put_bytes(&consensus::serialize(&input.outpoint));
                    w.put_var_bytes(&consensus::serialize(&input.output))?;
                    w.put_bytes(&input.proof.serialize());
                }
                w.put_bytes(&m.blinded_output);
                w.put_var_bytes(m.change_spk.as_bytes())?;
                w.put_u64(m.change_amount.to_sat());
                Ok(())
            }
            Message::BlindedSig(m) => {
                w.put_bytes(&m.sig);
                Ok(())
            }
            Message::Bob(m) => {
                w.put_var_bytes(&consensus::serialize(&m.output))?;
                w.put_bytes(&m.sig.serialize());
                Ok(())
            }
            Message::Ack => Ok(()),
            Message::UnsignedPsbt(m) | Message::SignedPsbt(m) => {
                w.put_var_bytes(&m.psbt.serialize())
            }
            Message::RestartRound(m) => {
                w.put_bytes(m.round_id.as_bytes());
                Ok(())
            }
            Message::RoundFailed(m) => w.put_var_bytes(m.reason.as_bytes()),
            Message::Failure(m) => w.put_var_bytes(m.reason.as_bytes()),
        }
    }

    fn decode_body(tag: u16, r: &mut Reader<'_>) -> Result<Message, WireError> {
        match tag {
            TAG_ASK_MIX_DETAILS => Ok(Message::AskMixDetails(AskMixDetails {
                network: r.network()?,
            })),
            TAG_MIX_DETAILS => Ok(Message::MixDetails(MixDetails {
                version: r.u16()?,
                round_id: RoundId::from_bytes(r.array32()?),
                amount: Amount::from_sat(r.u64()?),
                mix_fee: Amount::from_sat(r.u64()?),
                input_fee: Amount::from_sat(r.u64()?),
                output_fee: Amount::from_sat(r.u64()?),
                public_key: r.pubkey()?,
                round_time: r.u64()?,
            })),
            TAG_ASK_NONCE => Ok(Message::AskNonce(AskNonce {
                round_id: RoundId::from_bytes(r.array32()?),
            })),
            TAG_NONCE => Ok(Message::Nonce(NonceMsg { nonce: r.pubkey()? })),
            TAG_REGISTER_INPUTS => {
                let count = r.u16()? as usize;
                let mut inputs = Vec::with_capacity(count.min(64));
                for _ in 0..count {
                    let outpoint: OutPoint = consensus::deserialize(r.take(36)?)
                        .map_err(|e| WireError::InvalidField(format!("outpoint: {}", e)))?;
                    let output: TxOut = consensus::deserialize(r.var_bytes()?)
                        .map_err(|e| WireError::InvalidField(format!("output: {}", e)))?;
                    let proof = InputProof::from_bytes(r.take(INPUT_PROOF_LEN)?)
                        .map_err(|e| WireError::InvalidField(e.to_string()))?;
                    inputs.push(InputReference {
                        outpoint,
                        output,
                        proof,
                    });
                }
                let blinded_output = r.array32()?;
                let change_spk = ScriptBuf::from_bytes(r.var_bytes()?.to_vec());
                let change_amount = Amount::from_sat(r.u64()?);
                Ok(Message::RegisterInputs(RegisterInputs {
                    inputs,
                    blinded_output,
                    change_spk,
                    change_amount,
                }))
            }
            TAG_BLINDED_SIG => Ok(Message::BlindedSig(BlindedSig { sig: r.array32()? })),
            TAG_BOB_MESSAGE => {
                let output: TxOut = consensus::deserialize(r.var_bytes()?)
                    .map_err(|e| WireError::InvalidField(format!("output: {}", e)))?;
                let sig = OutputSignature::from_bytes(r.take(OUTPUT_SIG_LEN)?)
                    .map_err(|e| WireError::InvalidField(e.to_string()))?;
                Ok(Message::Bob(BobMessage { output, sig }))
            }
            TAG_ACK => Ok(Message::Ack),
            TAG_UNSIGNED_PSBT => Ok(Message::UnsignedPsbt(PsbtMessage {
                psbt: r.psbt()?,
            })),
            TAG_SIGNED_PSBT => Ok(Message::SignedPsbt(PsbtMessage { psbt: r.psbt()? })),
            TAG_RESTART_ROUND => Ok(Message::RestartRound(RestartRound {
                round_id: RoundId::from_bytes(r.array32()?),
            })),
            TAG_ROUND_FAILED => Ok(Message::RoundFailed(RoundFailed {
                reason: r.string()?,
            })),
            TAG_FAILURE => Ok(Message::Failure(Failure {
                reason: r.string()?,
            })),
            other => Err(WireError::UnknownTag(other)),
        }
    }
}

struct Writer(Vec<u8>);

impl Writer {
    fn new() -> Self {
        Writer(Vec::new())
    }

    fn into_inner(self) -> Vec<u8> {
        self.0
    }

    fn put_u16(&mut self, v: u16) {
        self.0.extend_from_slice(&v.to_be_bytes());
    }

    fn put_u64(&mut self, v: u64) {
        self.0.extend_from_slice(&v.to_be_bytes());
    }

    fn put_bytes(&mut self, bytes: &[u8]) {
        self.0.extend_from_slice(bytes);
    }

    fn put_var_bytes(&mut self, bytes: &[u8]) -> Result<(), WireError> {
        let len =
            u16::try_from(bytes.len()).map_err(|_| WireError::Oversized(bytes.len()))?;
        self.put_u16(len);
        self.0.extend_from_slice(bytes);
        Ok(())
    }

    fn put_network(&mut self, network: Network) -> Result<(), WireError> {
        let byte = match network {
            Network::Bitcoin => 0u8,
            Network::Testnet => 1,
            Network::Signet => 2,
            Network::Regtest => 3,
            other => {
                return Err(WireError::InvalidField(format!(
                    "unsupported network {}",
                    other
                )))
            }
        };
        self.0.push(byte);
        Ok(())
    }
}

struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Reader { buf, pos: 0 }
    }

    fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], WireError> {
        if self.remaining() < n {
            return Err(WireError::Truncated {
                needed: n,
                remaining: self.remaining(),
            });
        }
        let slice = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn u8(&mut self) -> Result<u8, WireError> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> Result<u16, WireError> {
        let bytes = self.take(2)?;
        Ok(u16::from_be_bytes([bytes[0], bytes[1]]))
    }

    fn u64(&mut self) -> Result<u64, WireError> {
        let bytes = self.take(8)?;
        let mut arr = [0u8; 8];
        arr.copy_from_slice(bytes);
        Ok(u64::from_be_bytes(arr))
    }

    fn array32(&mut self) -> Result<[u8; 32], WireError> {
        let bytes = self.take(32)?;
        let mut arr = [0u8; 32];
        arr.copy_from_slice(bytes);
        Ok(arr)
    }

    fn var_bytes(&mut self) -> Result<&'a [u8], WireError> {
        let len = self.u16()? as usize;
        self.take(len)
    }

    fn string(&mut self) -> Result<String, WireError> {
        let bytes = self.var_bytes()?;
        String::from_utf8(bytes.to_vec())
            .map_err(|_| WireError::InvalidField("string is not valid utf-8".into()))
    }

    fn pubkey(&mut self) -> Result<PublicKey, WireError> {
        PublicKey::from_slice(self.take(33)?)
            .map_err(|e| WireError::InvalidField(format!("public key: {}", e)))
    }

    fn network(&mut self) -> Result<Network, WireError> {
        match self.u8()? {
            0 => Ok(Network::Bitcoin),
            1 => Ok(Network::Testnet),
            2 => Ok(Network::Signet),
            3 => Ok(Network::Regtest),
            other => Err(WireError::InvalidField(format!(
                "unknown network byte {}",
                other
            ))),
        }
    }

    fn psbt(&mut self) -> Result<Psbt, WireError> {
        Psbt::deserialize(self.var_bytes()?)
            .map_err(|e| WireError::InvalidField(format!("psbt: {}", e)))
    }
}
