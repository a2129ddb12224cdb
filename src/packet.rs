use rand::Rng;
use std::fmt;

use crate::crypto::{self, CryptoError};

// Frame markers
pub const MAGIC: u16 = 0x0005;

// Packet types
pub const TYPE_PUSH: u16 = 0x0003;
pub const TYPE_ACK: u16 = 0x0004;

pub const DEFAULT_PRODUCT_ID: u32 = 60008;

// A bare ack frame starts magic + type before the token length
pub const ACK_FRAME_PREFIX: [u8; 4] = [0x00, 0x05, 0x00, 0x04];

const ACK_TOKEN_PREFIX: &str = "ack:";

// remaining_size counts the payload plus seq_nr(8) + product_id(4) + payload_size(4)
const REMAINING_OVERHEAD: u32 = 16;

#[derive(Debug)]
pub enum ProtocolError {
    BadMagic(u16),
    Encapsulated,
    ShortRead { offset: usize, wanted: usize, len: usize },
    CryptoFailure(CryptoError),
    TypeMismatch(&'static str),
}

impl fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProtocolError::BadMagic(v) => write!(f, "Invalid magic bytes: {v:#06x}"),
            ProtocolError::Encapsulated => write!(f, "Encapsulated payload not supported"),
            ProtocolError::ShortRead { offset, wanted, len } => {
                write!(f, "Short read: {wanted} bytes at offset {offset}, buffer is {len}")
            }
            ProtocolError::CryptoFailure(e) => write!(f, "Payload crypto failed: {e}"),
            ProtocolError::TypeMismatch(what) => write!(f, "Type mismatch: {what}"),
        }
    }
}

impl std::error::Error for ProtocolError {}

impl From<CryptoError> for ProtocolError {
    fn from(e: CryptoError) -> Self {
        ProtocolError::CryptoFailure(e)
    }
}

/// One message on the binary push channel.
///
/// Only `type == 0x0003` frames are fully parsed. Any other type stops
/// after the type field and is kept opaque so the bridge can forward it
/// unchanged.
#[derive(Debug)]
pub struct PushPacket {
    pub packet_type: u16,
    pub ack_nr: u32,
    pub remaining_size: u32,
    pub seq_nr: u64,
    pub product_id: u32,
    pub payload: Vec<u8>,
    pub payload_json: Option<serde_json::Value>,
}

/// A freshly assembled frame, together with the sequence and ack numbers
/// that were chosen for it so the bridge can track the robot's reply.
pub struct BuiltPacket {
    pub bytes: Vec<u8>,
    pub ack_nr: u32,
    pub seq_nr: u64,
}

// -- Strict advancing-offset reader --

struct Reader<'a> {
    data: &'a [u8],
    offset: usize,
}

impl<'a> Reader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Reader { data, offset: 0 }
    }

    fn take(&mut self, wanted: usize) -> Result<&'a [u8], ProtocolError> {
        if self.offset + wanted > self.data.len() {
            return Err(ProtocolError::ShortRead {
                offset: self.offset,
                wanted,
                len: self.data.len(),
            });
        }
        let slice = &self.data[self.offset..self.offset + wanted];
        self.offset += wanted;
        Ok(slice)
    }

    fn u16(&mut self) -> Result<u16, ProtocolError> {
        let b = self.take(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    fn u32(&mut self) -> Result<u32, ProtocolError> {
        let b = self.take(4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn u64(&mut self) -> Result<u64, ProtocolError> {
        let b = self.take(8)?;
        Ok(u64::from_be_bytes([
            b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7],
        ]))
    }
}

/// Parse a raw buffer into a PushPacket.
///
/// When the payload JSON carries `encrypt: 1`, its `data` field is
/// decrypted in place to its object form with `push_key`.
pub fn parse(data: &[u8], push_key: Option<&str>) -> Result<PushPacket, ProtocolError> {
    let mut r = Reader::new(data);

    let magic = r.u16()?;
    if magic != MAGIC {
        return Err(ProtocolError::BadMagic(magic));
    }

    let packet_type = r.u16()?;
    if packet_type != TYPE_PUSH {
        return Ok(PushPacket {
            packet_type,
            ack_nr: 0,
            remaining_size: 0,
            seq_nr: 0,
            product_id: 0,
            payload: Vec::new(),
            payload_json: None,
        });
    }

    let len_ack = r.u16()? as usize;
    let ack_nr = parse_ack_token(r.take(len_ack)?)?;

    let remaining_size = r.u32()?;
    let seq_nr = r.u64()?;
    let product_id = r.u32()?;
    let payload_size = r.u32()? as usize;

    let payload = r.take(payload_size)?.to_vec();
    if payload.len() >= 4 && payload[..4] == [0, 0, 0, 0] {
        return Err(ProtocolError::Encapsulated);
    }

    // Payload JSON is best-effort: a frame with an unparseable payload is
    // still routable by the bridge.
    let mut payload_json: Option<serde_json::Value> = serde_json::from_slice(&payload).ok();

    if let Some(json) = payload_json.as_mut() {
        let encrypted = json.get("encrypt").and_then(serde_json::Value::as_i64) == Some(1);
        if encrypted {
            let key = push_key.ok_or(CryptoError::KeyMissing)?;
            let data_str = json
                .get("data")
                .and_then(serde_json::Value::as_str)
                .unwrap_or("");
            let decrypted = crypto::decrypt_data(key, data_str)?;
            json["data"] = decrypted;
        }
    }

    Ok(PushPacket {
        packet_type,
        ack_nr,
        remaining_size,
        seq_nr,
        product_id,
        payload,
        payload_json,
    })
}

/// Build a complete push frame around `data`.
///
/// The on-wire payload is `{"data": …, "devType": 3, "encrypt": 0|1}`;
/// with `encrypt` set, `data` goes over the wire as base64 ciphertext.
/// The sequence number is derived from the last one observed on the
/// channel plus the freshly chosen ack number, modulo 2^64.
pub fn build(
    data: &serde_json::Value,
    push_key: Option<&str>,
    last_seq_nr: u64,
    encrypt: bool,
    product_id: u32,
) -> Result<BuiltPacket, ProtocolError> {
    let data_field = if encrypt {
        let key = push_key.ok_or(CryptoError::KeyMissing)?;
        serde_json::Value::String(crypto::encrypt_data(key, data)?)
    } else {
        data.clone()
    };

    let payload_json = serde_json::json!({
        "data": data_field,
        "devType": 3,
        "encrypt": if encrypt { 1 } else { 0 },
    });
    let payload =
        serde_json::to_vec(&payload_json).expect("JSON serialization cannot fail for a Value");

    let ack_nr: u32 = rand::thread_rng().gen_range(1000..=99999);
    let seq_nr = last_seq_nr.wrapping_add(u64::from(ack_nr));

    Ok(BuiltPacket {
        bytes: assemble(ack_nr, seq_nr, product_id, &payload),
        ack_nr,
        seq_nr,
    })
}

fn assemble(ack_nr: u32, seq_nr: u64, product_id: u32, payload: &[u8]) -> Vec<u8> {
    let ack_token = format!("{ACK_TOKEN_PREFIX}{ack_nr}");
    let len_ack = ack_token.len() as u16;
    let payload_size = payload.len() as u32;
    let remaining_size = payload_size + REMAINING_OVERHEAD;

    let mut frame = Vec::with_capacity(24 + ack_token.len() + payload.len());
    frame.extend_from_slice(&MAGIC.to_be_bytes());
    frame.extend_from_slice(&TYPE_PUSH.to_be_bytes());
    frame.extend_from_slice(&len_ack.to_be_bytes());
    frame.extend_from_slice(ack_token.as_bytes());
    frame.extend_from_slice(&remaining_size.to_be_bytes());
    frame.extend_from_slice(&seq_nr.to_be_bytes());
    frame.extend_from_slice(&product_id.to_be_bytes());
    frame.extend_from_slice(&payload_size.to_be_bytes());
    frame.extend_from_slice(payload);
    frame
}

/// Decode a bare acknowledgement frame: magic, type 0x0004, token length,
/// ascii `ack:<n>`. Returns the acknowledged number.
pub fn decode_ack_frame(data: &[u8]) -> Result<u32, ProtocolError> {
    let mut r = Reader::new(data);

    let magic = r.u16()?;
    if magic != MAGIC {
        return Err(ProtocolError::BadMagic(magic));
    }

    let packet_type = r.u16()?;
    if packet_type != TYPE_ACK {
        return Err(ProtocolError::TypeMismatch("not an ack frame"));
    }

    let len = r.u16()? as usize;
    parse_ack_token(r.take(len)?)
}

fn parse_ack_token(token: &[u8]) -> Result<u32, ProtocolError> {
    std::str::from_utf8(token)
        .ok()
        .and_then(|t| t.strip_prefix(ACK_TOKEN_PREFIX))
        .and_then(|digits| digits.parse::<u32>().ok())
        .ok_or(ProtocolError::TypeMismatch("malformed ack token"))
}
