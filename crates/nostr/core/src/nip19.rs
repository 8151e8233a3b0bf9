//! NIP-19: bech32-encoded entities.
//!
//! Only the `naddr` entity is supported. Groups are shared as `naddr` strings
//! pointing at their addressable metadata event.
//!
//! See: <https://github.com/nostr-protocol/nips/blob/master/19.md>

use bech32::{Bech32, Hrp};
use thiserror::Error;

const TLV_SPECIAL: u8 = 0;
const TLV_RELAY: u8 = 1;
const TLV_AUTHOR: u8 = 2;
const TLV_KIND: u8 = 3;

/// Errors that can occur while decoding NIP-19 entities.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum Nip19Error {
    #[error("bech32 decode error: {0}")]
    Bech32Decode(String),

    #[error("bech32 encode error: {0}")]
    Bech32Encode(String),

    #[error("unexpected prefix: expected {expected}, got {actual}")]
    WrongPrefix { expected: String, actual: String },

    #[error("malformed TLV: {0}")]
    MalformedTlv(String),

    #[error("missing field: {0}")]
    MissingField(&'static str),
}

/// Coordinates of an addressable event (`kind:pubkey:identifier`) plus relay hints.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddressPointer {
    /// The `d` tag value. For groups this is the raw group id.
    pub identifier: String,
    /// Hex-encoded author public key
    pub pubkey: String,
    pub kind: u32,
    /// Relays where the event is likely to be found
    pub relays: Vec<String>,
}

/// Decode an `naddr1...` string.
pub fn decode_naddr(naddr: &str) -> Result<AddressPointer, Nip19Error> {
    let (hrp, data) =
        bech32::decode(naddr.trim()).map_err(|e| Nip19Error::Bech32Decode(e.to_string()))?;
    if hrp.as_str() != "naddr" {
        return Err(Nip19Error::WrongPrefix {
            expected: "naddr".to_string(),
            actual: hrp.to_string(),
        });
    }

    let mut identifier = None;
    let mut pubkey = None;
    let mut kind = None;
    let mut relays = Vec::new();

    let mut rest = data.as_slice();
    while !rest.is_empty() {
        let [t, len, tail @ ..] = rest else {
            return Err(Nip19Error::MalformedTlv("truncated header".to_string()));
        };
        let len = *len as usize;
        if tail.len() < len {
            return Err(Nip19Error::MalformedTlv(format!(
                "type {} declares {} bytes, {} remain",
                t,
                len,
                tail.len()
            )));
        }
        let (value, next) = tail.split_at(len);
        match *t {
            TLV_SPECIAL => identifier = Some(String::from_utf8_lossy(value).into_owned()),
            TLV_RELAY => relays.push(String::from_utf8_lossy(value).into_owned()),
            TLV_AUTHOR => {
                if value.len() != 32 {
                    return Err(Nip19Error::MalformedTlv("author must be 32 bytes".to_string()));
                }
                pubkey = Some(hex::encode(value));
            }
            TLV_KIND => {
                let bytes: [u8; 4] = value
                    .try_into()
                    .map_err(|_| Nip19Error::MalformedTlv("kind must be 4 bytes".to_string()))?;
                kind = Some(u32::from_be_bytes(bytes));
            }
            // Unknown TLV types are ignored
            _ => {}
        }
        rest = next;
    }

    Ok(AddressPointer {
        identifier: identifier.ok_or(Nip19Error::MissingField("identifier"))?,
        pubkey: pubkey.ok_or(Nip19Error::MissingField("author"))?,
        kind: kind.ok_or(Nip19Error::MissingField("kind"))?,
        relays,
    })
}

/// Encode an address pointer as `naddr1...`.
pub fn encode_naddr(pointer: &AddressPointer) -> Result<String, Nip19Error> {
    let author =
        hex::decode(&pointer.pubkey).map_err(|e| Nip19Error::Bech32Encode(e.to_string()))?;

    let mut data = Vec::new();
    push_tlv(&mut data, TLV_SPECIAL, pointer.identifier.as_bytes())?;
    for relay in &pointer.relays {
        push_tlv(&mut data, TLV_RELAY, relay.as_bytes())?;
    }
    push_tlv(&mut data, TLV_AUTHOR, &author)?;
    push_tlv(&mut data, TLV_KIND, &pointer.kind.to_be_bytes())?;

    let hrp = Hrp::parse("naddr").map_err(|e| Nip19Error::Bech32Encode(e.to_string()))?;
    bech32::encode::<Bech32>(hrp, &data).map_err(|e| Nip19Error::Bech32Encode(e.to_string()))
}

fn push_tlv(out: &mut Vec<u8>, t: u8, value: &[u8]) -> Result<(), Nip19Error> {
    let len = u8::try_from(value.len())
        .map_err(|_| Nip19Error::Bech32Encode(format!("TLV value too long: {}", value.len())))?;
    out.push(t);
    out.push(len);
    out.extend_from_slice(value);
    Ok(())
}
