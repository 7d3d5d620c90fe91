//! IKEv2 message wire codec.
//!
//! Fixed headers are `FromBytes`/`AsBytes`/`Unaligned` structs with
//! `network_endian` integers, decoded by reinterpreting a byte slice
//! rather than hand-rolled bit shifting. Payload bodies that need
//! variable-length handling (proposals, transforms, selectors) are
//! decoded field-by-field on top of these headers.

use std::collections::HashMap;

use subtle::ConstantTimeEq;
use thiserror::Error;
use zerocopy::byteorder::network_endian::{U16, U32};
use zerocopy::{AsBytes, FromBytes, FromZeroes, Unaligned};

use crate::crypto::{AeadCipher, Prf};

pub const IKE_HEADER_LEN: usize = 28;
pub const PAYLOAD_HEADER_LEN: usize = 4;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CodecError {
    #[error("packet shorter than a fixed header requires")]
    ShortPacket,
    #[error("declared length field does not match buffer bounds")]
    BadLength,
    #[error("unknown payload type {0} marked critical")]
    UnknownCriticalPayload(u8),
    #[error("integrity check failed")]
    IntegrityCheckFailed,
    #[error("SK payload padding invalid")]
    PaddingInvalid,
    #[error("payload violates expected message syntax")]
    UnexpectedSyntax,
    #[error("failed to encode message: {0}")]
    EncodeFailed(String),
}

pub type CodecResult<T> = std::result::Result<T, CodecError>;

/// Payload type octet values (RFC 7296 section 3.2, Table 1).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum PayloadType {
    NoNextPayload = 0,
    Sa = 33,
    Ke = 34,
    IdI = 35,
    IdR = 36,
    Cert = 37,
    CertReq = 38,
    Auth = 39,
    Nonce = 40,
    Notify = 41,
    Delete = 42,
    VendorId = 43,
    TsI = 44,
    TsR = 45,
    Sk = 46,
    Cp = 47,
    Eap = 48,
}

impl PayloadType {
    pub fn from_u8(v: u8) -> Option<PayloadType> {
        use PayloadType::*;
        Some(match v {
            0 => NoNextPayload,
            33 => Sa,
            34 => Ke,
            35 => IdI,
            36 => IdR,
            37 => Cert,
            38 => CertReq,
            39 => Auth,
            40 => Nonce,
            41 => Notify,
            42 => Delete,
            43 => VendorId,
            44 => TsI,
            45 => TsR,
            46 => Sk,
            47 => Cp,
            48 => Eap,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ExchangeType {
    IkeSaInit = 34,
    IkeAuth = 35,
    CreateChildSa = 36,
    Informational = 37,
}

impl ExchangeType {
    pub fn from_u8(v: u8) -> CodecResult<ExchangeType> {
        use ExchangeType::*;
        Ok(match v {
            34 => IkeSaInit,
            35 => IkeAuth,
            36 => CreateChildSa,
            37 => Informational,
            _ => return Err(CodecError::UnexpectedSyntax),
        })
    }
}

/// Fixed 28-byte IKEv2 header (RFC 7296 section 3.1).
#[derive(Debug, Clone, Copy, FromBytes, FromZeroes, AsBytes, Unaligned)]
#[repr(C, packed)]
pub struct IkeHeaderWire {
    pub spi_initiator: U64Wire,
    pub spi_responder: U64Wire,
    pub next_payload: u8,
    pub version: u8,
    pub exchange_type: u8,
    pub flags: u8,
    pub message_id: U32,
    pub length: U32,
}

/// `zerocopy` has no built-in unaligned `u64` newtype in this version's
/// public surface; compose one from two `U32` halves in network order.
#[derive(Debug, Clone, Copy, FromBytes, FromZeroes, AsBytes, Unaligned)]
#[repr(C, packed)]
pub struct U64Wire {
    pub hi: U32,
    pub lo: U32,
}

impl U64Wire {
    pub fn get(&self) -> u64 {
        ((self.hi.get() as u64) << 32) | self.lo.get() as u64
    }
    pub fn set(value: u64) -> U64Wire {
        U64Wire {
            hi: U32::new((value >> 32) as u32),
            lo: U32::new(value as u32),
        }
    }
}

pub const FLAG_INITIATOR: u8 = 0x08;
pub const FLAG_VERSION: u8 = 0x10;
pub const FLAG_RESPONSE: u8 = 0x20;

/// Decoded IKEv2 header, independent of its wire representation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IkeHeader {
    pub spi_initiator: u64,
    pub spi_responder: u64,
    pub exchange_type: ExchangeType,
    pub is_initiator: bool,
    pub is_response: bool,
    pub message_id: u32,
    pub first_payload: Option<PayloadType>,
}

/// Generic payload header (RFC 7296 section 3.2).
#[derive(Debug, Clone, Copy, FromBytes, FromZeroes, AsBytes, Unaligned)]
#[repr(C, packed)]
pub struct PayloadHeaderWire {
    pub next_payload: u8,
    pub flags: u8,
    pub length: U16,
}

pub const FLAG_CRITICAL: u8 = 0x80;

/// A decoded payload with its type tag and raw body, kept opaque at this
/// layer. Typed accessors for specific payload bodies (SA, TSi/TSr, Nonce,
/// ...) live alongside the module that owns that semantic; this module's
/// job ends at "body bytes for payload type X".
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawPayload {
    pub payload_type: PayloadType,
    pub critical: bool,
    pub body: Vec<u8>,
}

/// A fully decoded message: header plus ordered payload list, with any
/// SK wrapper already stripped. For messages carrying an SK payload,
/// [`decode`] verifies the ICV and decrypts before payload parsing so
/// callers never see the SK wrapper itself.
#[derive(Debug, Clone)]
pub struct Message {
    pub header: IkeHeader,
    pub payloads: Vec<RawPayload>,
}

/// Key material and algorithms needed to wrap/unwrap the SK payload:
/// `sk_e`/`sk_a` from the owning IKE_SA's [`crate::ike_sa::DerivedKeys`]
/// (the initiator or responder half, whichever direction is being
/// encoded/decoded), plus the negotiated AEAD cipher and PRF.
pub struct SkKeys<'a> {
    pub aead: &'a dyn AeadCipher,
    pub prf: &'a dyn Prf,
    pub sk_e: &'a [u8],
    pub sk_a: &'a [u8],
    /// Length of the nonce `encode` expects via its `iv` argument, and
    /// that `decode` reads off the wire.
    pub nonce_len: usize,
    /// Truncated length of the ICV appended after the ciphertext.
    pub icv_len: usize,
}

/// Binds the encrypted payload chain to this exact message's identity.
/// Deliberately excludes the header's `length` field, which is not known
/// until the ciphertext size is — SPIs, exchange type, flags and
/// message-id are enough to stop a ciphertext from one message being
/// replayed under another's header.
fn sk_aad(header: &IkeHeader) -> Vec<u8> {
    let mut aad = Vec::with_capacity(8 + 8 + 1 + 1 + 4);
    aad.extend_from_slice(&header.spi_initiator.to_be_bytes());
    aad.extend_from_slice(&header.spi_responder.to_be_bytes());
    aad.push(header.exchange_type as u8);
    let mut flags = 0u8;
    if header.is_initiator {
        flags |= FLAG_INITIATOR;
    }
    if header.is_response {
        flags |= FLAG_RESPONSE;
    }
    aad.push(flags);
    aad.extend_from_slice(&header.message_id.to_be_bytes());
    aad
}

/// Pad a plaintext payload chain to a 4-byte boundary and append the pad
/// length byte (RFC 7296 section 3.14): `pad_length` counts the padding
/// bytes only, not itself.
fn pad_plaintext(mut body: Vec<u8>) -> Vec<u8> {
    let remainder = (body.len() + 1) % 4;
    let pad_len = if remainder == 0 { 0 } else { 4 - remainder };
    body.extend(std::iter::repeat(0u8).take(pad_len));
    body.push(pad_len as u8);
    body
}

fn strip_padding(mut body: Vec<u8>) -> CodecResult<Vec<u8>> {
    let pad_len = *body.last().ok_or(CodecError::PaddingInvalid)? as usize;
    if pad_len + 1 > body.len() {
        return Err(CodecError::PaddingInvalid);
    }
    let new_len = body.len() - pad_len - 1;
    body.truncate(new_len);
    Ok(body)
}

/// Parses the fixed header only, for callers (e.g. cookie validation,
/// demultiplexing to the right IKE_SA) that need SPIs/message-id before
/// committing to full decode.
pub fn peek_header(buf: &[u8]) -> CodecResult<IkeHeader> {
    if buf.len() < IKE_HEADER_LEN {
        return Err(CodecError::ShortPacket);
    }
    let wire = IkeHeaderWire::read_from_prefix(buf).ok_or(CodecError::ShortPacket)?;
    let declared_len = wire.length.get() as usize;
    if declared_len != buf.len() {
        return Err(CodecError::BadLength);
    }
    let exchange_type = ExchangeType::from_u8(wire.exchange_type)?;
    let first_payload = if wire.next_payload == 0 {
        None
    } else {
        Some(PayloadType::from_u8(wire.next_payload).ok_or(CodecError::UnknownCriticalPayload(wire.next_payload))?)
    };
    Ok(IkeHeader {
        spi_initiator: wire.spi_initiator.get(),
        spi_responder: wire.spi_responder.get(),
        exchange_type,
        is_initiator: wire.flags & FLAG_INITIATOR != 0,
        is_response: wire.flags & FLAG_RESPONSE != 0,
        message_id: wire.message_id.get(),
        first_payload,
    })
}

/// Decode a chain of unencrypted payloads starting right after the fixed
/// header. An unrecognized payload with the critical bit set aborts
/// decode per RFC 7296 section 3.2; an unrecognized non-critical payload
/// (most commonly Vendor ID or a notify-only status type) is kept as an
/// opaque `RawPayload` tagged under its raw type so callers can still see
/// it was present, by using `PayloadType::VendorId` as a catch-all is
/// incorrect, so unknown non-critical payloads are simply skipped and do
/// not appear in the returned vector.
pub fn decode_payload_chain(mut next: u8, mut buf: &[u8]) -> CodecResult<Vec<RawPayload>> {
    let mut out = Vec::new();
    while next != 0 {
        let header = PayloadHeaderWire::read_from_prefix(buf).ok_or(CodecError::ShortPacket)?;
        let total_len = header.length.get() as usize;
        if total_len < PAYLOAD_HEADER_LEN || total_len > buf.len() {
            return Err(CodecError::BadLength);
        }
        let body = buf[PAYLOAD_HEADER_LEN..total_len].to_vec();
        let critical = header.flags & FLAG_CRITICAL != 0;

        match PayloadType::from_u8(next) {
            Some(payload_type) => out.push(RawPayload {
                payload_type,
                critical,
                body,
            }),
            None if critical => return Err(CodecError::UnknownCriticalPayload(next)),
            None => {}
        }

        next = header.next_payload;
        buf = &buf[total_len..];
    }
    Ok(out)
}

/// Build the wire bytes of a payload chain (generic headers plus
/// bodies, `next_payload` links filled in), returning the first
/// payload's type tag alongside it.
fn build_payload_chain(payloads: &[RawPayload]) -> CodecResult<(u8, Vec<u8>)> {
    let mut body = Vec::new();
    for (i, payload) in payloads.iter().enumerate() {
        let next_type = payloads
            .get(i + 1)
            .map(|p| p.payload_type as u8)
            .unwrap_or(0);
        let total_len = PAYLOAD_HEADER_LEN + payload.body.len();
        if total_len > u16::MAX as usize {
            return Err(CodecError::EncodeFailed("payload too large".into()));
        }
        let flags = if payload.critical { FLAG_CRITICAL } else { 0 };
        let wire = PayloadHeaderWire {
            next_payload: next_type,
            flags,
            length: U16::new(total_len as u16),
        };
        body.extend_from_slice(wire.as_bytes());
        body.extend_from_slice(&payload.body);
    }
    let first_payload_byte = payloads.first().map(|p| p.payload_type as u8).unwrap_or(0);
    Ok((first_payload_byte, body))
}

fn assemble_header_and_body(header: &IkeHeader, first_payload_byte: u8, body: &[u8]) -> CodecResult<Vec<u8>> {
    let total_len = IKE_HEADER_LEN + body.len();
    if total_len > u32::MAX as usize {
        return Err(CodecError::EncodeFailed("message too large".into()));
    }
    let mut flags = 0u8;
    if header.is_initiator {
        flags |= FLAG_INITIATOR;
    }
    if header.is_response {
        flags |= FLAG_RESPONSE;
    }
    flags |= FLAG_VERSION;

    let wire_header = IkeHeaderWire {
        spi_initiator: U64Wire::set(header.spi_initiator),
        spi_responder: U64Wire::set(header.spi_responder),
        next_payload: first_payload_byte,
        version: 0x20,
        exchange_type: header.exchange_type as u8,
        flags,
        message_id: U32::new(header.message_id),
        length: U32::new(total_len as u32),
    };

    let mut out = Vec::with_capacity(total_len);
    out.extend_from_slice(wire_header.as_bytes());
    out.extend_from_slice(body);
    Ok(out)
}

/// Encode a header plus unencrypted payload chain. Each payload's
/// `next_payload` link and total message length are computed here;
/// callers supply only bodies. Used directly by exchanges that never
/// carry an SK payload (most of IKE_SA_INIT) and as the plaintext-chain
/// builder underneath [`encode`].
pub fn encode_message(header: &IkeHeader, payloads: &[RawPayload]) -> CodecResult<Vec<u8>> {
    let (first_payload_byte, body) = build_payload_chain(payloads)?;
    assemble_header_and_body(header, first_payload_byte, &body)
}

/// Encode a header plus payload chain, wrapping the chain in an
/// encrypted-and-authenticated SK payload when `keys` is supplied (the
/// `iv` is generated by the caller, typically via
/// `CryptoProvider::random_bytes`). Without `keys`, behaves exactly like
/// [`encode_message`].
pub fn encode(header: &IkeHeader, payloads: &[RawPayload], keys: Option<(&SkKeys, &[u8])>) -> CodecResult<Vec<u8>> {
    let Some((keys, iv)) = keys else {
        return encode_message(header, payloads);
    };

    let (first_inner_type, inner) = build_payload_chain(payloads)?;
    let padded = pad_plaintext(inner);
    let aad = sk_aad(header);

    let ciphertext = keys
        .aead
        .seal(keys.sk_e, iv, &aad, &padded)
        .map_err(|_| CodecError::EncodeFailed("AEAD seal failed".into()))?;

    let mut icv_input = Vec::with_capacity(aad.len() + iv.len() + ciphertext.len());
    icv_input.extend_from_slice(&aad);
    icv_input.extend_from_slice(iv);
    icv_input.extend_from_slice(&ciphertext);
    let full_icv = keys.prf.prf(keys.sk_a, &icv_input);
    let icv_len = keys.icv_len.min(full_icv.len());

    let mut sk_body = Vec::with_capacity(iv.len() + ciphertext.len() + icv_len);
    sk_body.extend_from_slice(iv);
    sk_body.extend_from_slice(&ciphertext);
    sk_body.extend_from_slice(&full_icv[..icv_len]);

    let sk_total_len = PAYLOAD_HEADER_LEN + sk_body.len();
    if sk_total_len > u16::MAX as usize {
        return Err(CodecError::EncodeFailed("SK payload too large".into()));
    }
    let sk_wire_header = PayloadHeaderWire {
        next_payload: first_inner_type,
        flags: 0,
        length: U16::new(sk_total_len as u16),
    };
    let mut body = Vec::with_capacity(sk_total_len);
    body.extend_from_slice(sk_wire_header.as_bytes());
    body.extend_from_slice(&sk_body);

    assemble_header_and_body(header, PayloadType::Sk as u8, &body)
}

/// Decode a full message, unwrapping and verifying an SK payload if the
/// header's first payload is `Sk`. The ICV is checked with a
/// constant-time comparison before any decryption is attempted; a
/// mismatch never reaches the AEAD decrypt call.
pub fn decode(bytes: &[u8], keys: Option<&SkKeys>) -> CodecResult<Message> {
    let header = peek_header(bytes)?;
    let rest = &bytes[IKE_HEADER_LEN..];

    if header.first_payload != Some(PayloadType::Sk) {
        let payloads = decode_payload_chain(header.first_payload.map(|p| p as u8).unwrap_or(0), rest)?;
        return Ok(Message { header, payloads });
    }

    let keys = keys.ok_or(CodecError::UnexpectedSyntax)?;

    let sk_header = PayloadHeaderWire::read_from_prefix(rest).ok_or(CodecError::ShortPacket)?;
    let sk_total_len = sk_header.length.get() as usize;
    if sk_total_len < PAYLOAD_HEADER_LEN || sk_total_len > rest.len() {
        return Err(CodecError::BadLength);
    }
    let sk_body = &rest[PAYLOAD_HEADER_LEN..sk_total_len];
    let first_inner_type = sk_header.next_payload;

    if sk_body.len() < keys.nonce_len + keys.icv_len {
        return Err(CodecError::ShortPacket);
    }
    let (iv, remainder) = sk_body.split_at(keys.nonce_len);
    let (ciphertext, icv) = remainder.split_at(remainder.len() - keys.icv_len);

    let aad = sk_aad(&header);
    let mut icv_input = Vec::with_capacity(aad.len() + iv.len() + ciphertext.len());
    icv_input.extend_from_slice(&aad);
    icv_input.extend_from_slice(iv);
    icv_input.extend_from_slice(ciphertext);
    let expected_icv = keys.prf.prf(keys.sk_a, &icv_input);
    let expected_icv = &expected_icv[..keys.icv_len.min(expected_icv.len())];

    if expected_icv.ct_eq(icv).unwrap_u8() != 1 {
        return Err(CodecError::IntegrityCheckFailed);
    }

    let padded = keys
        .aead
        .open(keys.sk_e, iv, &aad, ciphertext)
        .map_err(|_| CodecError::IntegrityCheckFailed)?;
    let plaintext = strip_padding(padded)?;

    let payloads = decode_payload_chain(first_inner_type, &plaintext)?;
    Ok(Message { header, payloads })
}

/// Key for a fragment reassembly bucket: the owning IKE_SA's SPI pair and
/// message-id (RFC 7383 fragmentation).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ReassemblyKey {
    pub spi_initiator: u64,
    pub spi_responder: u64,
    pub message_id: u32,
}

struct ReassemblyEntry {
    total: u16,
    fragments: HashMap<u16, Vec<u8>>,
}

/// Accumulates RFC 7383 fragments until a complete set is present, then
/// hands back the reassembled plaintext-of-payloads buffer. Discards a
/// bucket if: a fragment's declared total conflicts with an existing
/// entry, a duplicate fragment number arrives with different content, or
/// `evict_stale` removes it for having sat past its deadline.
#[derive(Default)]
pub struct ReassemblyTable {
    entries: HashMap<ReassemblyKey, ReassemblyEntry>,
}

impl ReassemblyTable {
    pub fn new() -> Self {
        ReassemblyTable::default()
    }

    /// Feed one fragment; returns `Some(payload_bytes)` once `frag_num ==
    /// total` for all numbers 1..=total have arrived.
    pub fn accept(
        &mut self,
        key: ReassemblyKey,
        frag_num: u16,
        total: u16,
        data: Vec<u8>,
    ) -> CodecResult<Option<Vec<u8>>> {
        if frag_num == 0 || frag_num > total {
            return Err(CodecError::UnexpectedSyntax);
        }
        let entry = self.entries.entry(key).or_insert_with(|| ReassemblyEntry {
            total,
            fragments: HashMap::new(),
        });
        if entry.total != total {
            self.entries.remove(&key);
            return Err(CodecError::UnexpectedSyntax);
        }
        if let Some(existing) = entry.fragments.get(&frag_num) {
            if existing != &data {
                self.entries.remove(&key);
                return Err(CodecError::UnexpectedSyntax);
            }
        } else {
            entry.fragments.insert(frag_num, data);
        }

        if entry.fragments.len() == total as usize {
            let entry = self.entries.remove(&key).unwrap();
            let mut joined = Vec::new();
            for i in 1..=entry.total {
                joined.extend_from_slice(&entry.fragments[&i]);
            }
            return Ok(Some(joined));
        }
        Ok(None)
    }

    pub fn evict_stale(&mut self, keys: &[ReassemblyKey]) {
        for key in keys {
            self.entries.remove(key);
        }
    }

    pub fn pending_count(&self) -> usize {
        self.entries.len()
    }
}
