//! Datagram codec: RFC 7574 §8 bit layout, big-endian throughout.
//!
//! A datagram is a 4-byte destination channel followed by messages, each a
//! 1-byte type tag and a type-specific payload. Chunk specs and hash lengths
//! depend on the negotiated options, carried in a [`WireContext`].

use std::collections::BTreeSet;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddrV4, SocketAddrV6};

use crate::bin::{range_to_bins, Bin};
use crate::protocol::{
    Addressing, ChannelId, Datagram, HashFunction, IntegrityMethod, Message, MessageType,
    Negotiated, ProtocolOptions, SignatureAlgorithm, SwarmId,
};

const END_OPTION: u8 = 255;
const CHANNEL_ID_LEN: usize = 4;
/// One bit per message type code 0..=255.
const SUPPORTED_MESSAGES_MAX_LEN: usize = 32;

/// Negotiated parameters the codec needs to size variable fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WireContext {
    pub addressing: Addressing,
    pub hash_len: usize,
    pub signature_len: usize,
}

impl Default for WireContext {
    fn default() -> Self {
        Self {
            addressing: Addressing::Bins32,
            hash_len: HashFunction::Sha256.output_len(),
            signature_len: 64,
        }
    }
}

impl WireContext {
    pub fn from_negotiated(n: &Negotiated) -> Self {
        Self {
            addressing: n.addressing,
            hash_len: n.hash_function.output_len(),
            signature_len: n.signature_algorithm.signature_len().unwrap_or(64),
        }
    }

    /// Apply the options a HANDSHAKE announces to the messages that follow it.
    fn absorb(&mut self, options: &ProtocolOptions) {
        if let Some(a) = options.addressing {
            self.addressing = a;
        }
        if let Some(h) = options.hash_function {
            self.hash_len = h.output_len();
        }
        if let Some(len) = options.signature_algorithm.and_then(|s| s.signature_len()) {
            self.signature_len = len;
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    #[error("truncated: need {need} bytes at offset {at}")]
    Truncated { at: usize, need: usize },
    #[error("unknown message type {0}")]
    UnknownMessageType(u8),
    #[error("unknown protocol option {0}")]
    UnknownOption(u8),
    #[error("duplicate protocol option {0}")]
    DuplicateOption(u8),
    #[error("invalid {0}")]
    InvalidValue(&'static str),
    #[error("chunk range {0}..={1} is not a single bin")]
    UnalignedRange(u64, u64),
    #[error("byte-range addressing is not supported")]
    ByteRanges,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EncodeError {
    #[error("DATA must be the last message of a datagram")]
    DataNotLast,
    #[error("bin {0} does not fit the negotiated addressing")]
    NotRepresentable(Bin),
    #[error("{what} is {got} bytes, expected {expected}")]
    Length {
        what: &'static str,
        expected: usize,
        got: usize,
    },
    #[error("{0} too large for its length field")]
    TooLarge(&'static str),
    #[error("byte-range addressing is not supported")]
    ByteRanges,
}

struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn is_empty(&self) -> bool {
        self.pos >= self.buf.len()
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], DecodeError> {
        if self.buf.len() - self.pos < n {
            return Err(DecodeError::Truncated {
                at: self.pos,
                need: n,
            });
        }
        let out = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    fn rest(&mut self) -> &'a [u8] {
        let out = &self.buf[self.pos..];
        self.pos = self.buf.len();
        out
    }

    fn u8(&mut self) -> Result<u8, DecodeError> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> Result<u16, DecodeError> {
        let b = self.take(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    fn u32(&mut self) -> Result<u32, DecodeError> {
        let b = self.take(4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn u64(&mut self) -> Result<u64, DecodeError> {
        let mut a = [0u8; 8];
        a.copy_from_slice(self.take(8)?);
        Ok(u64::from_be_bytes(a))
    }

    /// Value of the addressing width (4 or 8 bytes).
    fn addr_value(&mut self, a: Addressing) -> Result<u64, DecodeError> {
        match a.value_width() {
            4 => self.u32().map(u64::from),
            _ => self.u64(),
        }
    }
}

/// Decode a whole datagram.
pub fn decode_datagram(bytes: &[u8], ctx: &WireContext) -> Result<Datagram, DecodeError> {
    let mut r = Reader::new(bytes);
    let channel = ChannelId(r.u32()?);
    let mut ctx = *ctx;
    let mut messages = Vec::new();
    while !r.is_empty() {
        decode_message(&mut r, &mut ctx, &mut messages)?;
    }
    Ok(Datagram { channel, messages })
}

/// Peek the destination channel without decoding the messages.
pub fn peek_channel(bytes: &[u8]) -> Option<ChannelId> {
    let b = bytes.get(..CHANNEL_ID_LEN)?;
    Some(ChannelId(u32::from_be_bytes([b[0], b[1], b[2], b[3]])))
}

fn decode_message(
    r: &mut Reader<'_>,
    ctx: &mut WireContext,
    out: &mut Vec<Message>,
) -> Result<(), DecodeError> {
    let tag = r.u8()?;
    let ty = MessageType::from_u8(tag).ok_or(DecodeError::UnknownMessageType(tag))?;
    match ty {
        MessageType::Handshake => {
            let source_channel = ChannelId(r.u32()?);
            let options = decode_options(r)?;
            if source_channel.is_zero() {
                out.push(Message::Reset);
            } else {
                ctx.absorb(&options);
                out.push(Message::Handshake {
                    source_channel,
                    options,
                });
            }
        }
        MessageType::Data => {
            let bin = single_bin(r, ctx)?;
            let timestamp = r.u64()?;
            let payload = r.rest().to_vec();
            out.push(Message::Data {
                bin,
                timestamp,
                payload,
            });
        }
        MessageType::Ack => {
            let bins = chunk_spec(r, ctx)?;
            let delay_sample = r.u64()? as i64;
            out.extend(bins.into_iter().map(|bin| Message::Ack { bin, delay_sample }));
        }
        MessageType::Have => {
            out.extend(chunk_spec(r, ctx)?.into_iter().map(|bin| Message::Have { bin }));
        }
        MessageType::Request => {
            out.extend(
                chunk_spec(r, ctx)?
                    .into_iter()
                    .map(|bin| Message::Request { bin }),
            );
        }
        MessageType::Cancel => {
            out.extend(chunk_spec(r, ctx)?.into_iter().map(|bin| Message::Cancel { bin }));
        }
        MessageType::Integrity => {
            let bin = single_bin(r, ctx)?;
            let hash = r.take(ctx.hash_len)?.to_vec();
            out.push(Message::Integrity { bin, hash });
        }
        MessageType::SignedIntegrity => {
            let bin = single_bin(r, ctx)?;
            let timestamp = r.u64()?;
            let signature = r.take(ctx.signature_len)?.to_vec();
            out.push(Message::SignedIntegrity {
                bin,
                timestamp,
                signature,
            });
        }
        MessageType::Choke => out.push(Message::Choke),
        MessageType::Unchoke => out.push(Message::Unchoke),
        MessageType::PexReq => out.push(Message::PexReq),
        MessageType::PexResV4 => {
            let ip = r.take(4)?;
            let ip = Ipv4Addr::new(ip[0], ip[1], ip[2], ip[3]);
            let port = r.u16()?;
            out.push(Message::PexResV4(SocketAddrV4::new(ip, port)));
        }
        MessageType::PexResV6 => {
            let mut ip = [0u8; 16];
            ip.copy_from_slice(r.take(16)?);
            let port = r.u16()?;
            out.push(Message::PexResV6(SocketAddrV6::new(
                Ipv6Addr::from(ip),
                port,
                0,
                0,
            )));
        }
        MessageType::PexResCert => {
            let len = r.u16()? as usize;
            out.push(Message::PexResCert(r.take(len)?.to_vec()));
        }
    }
    Ok(())
}

/// A chunk address (bin or range), expanded into the bins that exactly cover it.
fn chunk_spec(r: &mut Reader<'_>, ctx: &WireContext) -> Result<Vec<Bin>, DecodeError> {
    match ctx.addressing {
        Addressing::Bins32 | Addressing::Bins64 => Ok(vec![Bin::new(r.addr_value(ctx.addressing)?)]),
        Addressing::ChunkRanges32 | Addressing::ChunkRanges64 => {
            let start = r.addr_value(ctx.addressing)?;
            let end = r.addr_value(ctx.addressing)?;
            if end < start {
                return Err(DecodeError::InvalidValue("chunk range"));
            }
            range_to_bins(start, end).ok_or(DecodeError::InvalidValue("chunk range"))
        }
        Addressing::ByteRanges64 => Err(DecodeError::ByteRanges),
    }
}

fn single_bin(r: &mut Reader<'_>, ctx: &WireContext) -> Result<Bin, DecodeError> {
    let start = r.pos;
    let bins = chunk_spec(r, ctx)?;
    match bins.as_slice() {
        [bin] => Ok(*bin),
        _ => {
            let mut again = Reader::new(r.buf);
            again.pos = start;
            let a = again.addr_value(ctx.addressing)?;
            let b = again.addr_value(ctx.addressing)?;
            Err(DecodeError::UnalignedRange(a, b))
        }
    }
}

fn decode_options(r: &mut Reader<'_>) -> Result<ProtocolOptions, DecodeError> {
    let mut o = ProtocolOptions::default();
    let mut seen = BTreeSet::new();
    loop {
        let code = r.u8()?;
        if code == END_OPTION {
            return Ok(o);
        }
        if !seen.insert(code) {
            return Err(DecodeError::DuplicateOption(code));
        }
        match code {
            0 => o.version = Some(r.u8()?),
            1 => o.minimum_version = Some(r.u8()?),
            2 => {
                let len = r.u16()? as usize;
                o.swarm_id = Some(SwarmId(r.take(len)?.to_vec()));
            }
            3 => {
                o.integrity = Some(
                    IntegrityMethod::from_u8(r.u8()?)
                        .ok_or(DecodeError::InvalidValue("integrity method"))?,
                )
            }
            4 => {
                o.hash_function = Some(
                    HashFunction::from_u8(r.u8()?)
                        .ok_or(DecodeError::InvalidValue("merkle hash function"))?,
                )
            }
            5 => o.signature_algorithm = Some(SignatureAlgorithm::from_u8(r.u8()?)),
            6 => {
                o.addressing = Some(
                    Addressing::from_u8(r.u8()?)
                        .ok_or(DecodeError::InvalidValue("chunk addressing method"))?,
                )
            }
            7 => {
                let a = o
                    .addressing
                    .ok_or(DecodeError::InvalidValue("live discard window before addressing"))?;
                o.live_discard_window = Some(r.addr_value(a)?);
            }
            8 => {
                let len = r.u8()? as usize;
                if len > SUPPORTED_MESSAGES_MAX_LEN {
                    return Err(DecodeError::InvalidValue("supported messages bitmap length"));
                }
                let bitmap = r.take(len)?;
                let mut set = BTreeSet::new();
                for (i, byte) in bitmap.iter().enumerate() {
                    for bit in 0..8 {
                        if byte & (0x80 >> bit) != 0 {
                            set.insert((i * 8 + bit) as u8);
                        }
                    }
                }
                o.supported_messages = Some(set);
            }
            9 => o.chunk_size = Some(r.u32()?),
            other => return Err(DecodeError::UnknownOption(other)),
        }
    }
}

/// Encode a whole datagram.
pub fn encode_datagram(d: &Datagram, ctx: &WireContext) -> Result<Vec<u8>, EncodeError> {
    let mut out = Vec::with_capacity(64);
    out.extend_from_slice(&d.channel.0.to_be_bytes());
    let mut ctx = *ctx;
    let last = d.messages.len().saturating_sub(1);
    for (i, m) in d.messages.iter().enumerate() {
        if matches!(m, Message::Data { .. }) && i != last {
            return Err(EncodeError::DataNotLast);
        }
        encode_message(m, &mut ctx, &mut out)?;
    }
    Ok(out)
}

/// Encode messages into as few datagrams of at most `max_len` bytes as possible.
/// A DATA message always closes its datagram; a single oversized message still
/// gets a datagram of its own.
pub fn encode_packed(
    channel: ChannelId,
    messages: &[Message],
    ctx: &WireContext,
    max_len: usize,
) -> Result<Vec<Vec<u8>>, EncodeError> {
    let mut ctx = *ctx;
    let mut out = Vec::new();
    let mut current = channel.0.to_be_bytes().to_vec();
    let mut scratch = Vec::new();
    for m in messages {
        scratch.clear();
        encode_message(m, &mut ctx, &mut scratch)?;
        if current.len() > CHANNEL_ID_LEN && current.len() + scratch.len() > max_len {
            out.push(std::mem::replace(&mut current, channel.0.to_be_bytes().to_vec()));
        }
        current.extend_from_slice(&scratch);
        if matches!(m, Message::Data { .. }) {
            out.push(std::mem::replace(&mut current, channel.0.to_be_bytes().to_vec()));
        }
    }
    if current.len() > CHANNEL_ID_LEN || out.is_empty() {
        out.push(current);
    }
    Ok(out)
}

/// Encode one message (tag included) onto `out`.
pub fn encode_message(
    m: &Message,
    ctx: &mut WireContext,
    out: &mut Vec<u8>,
) -> Result<(), EncodeError> {
    out.push(m.message_type() as u8);
    match m {
        Message::Handshake {
            source_channel,
            options,
        } => {
            out.extend_from_slice(&source_channel.0.to_be_bytes());
            encode_options(options, out)?;
            ctx.absorb(options);
        }
        Message::Reset => {
            out.extend_from_slice(&ChannelId::ZERO.0.to_be_bytes());
            out.push(END_OPTION);
        }
        Message::Data {
            bin,
            timestamp,
            payload,
        } => {
            encode_chunk_spec(*bin, ctx, out)?;
            out.extend_from_slice(&timestamp.to_be_bytes());
            out.extend_from_slice(payload);
        }
        Message::Ack { bin, delay_sample } => {
            encode_chunk_spec(*bin, ctx, out)?;
            out.extend_from_slice(&(*delay_sample as u64).to_be_bytes());
        }
        Message::Have { bin } | Message::Request { bin } | Message::Cancel { bin } => {
            encode_chunk_spec(*bin, ctx, out)?;
        }
        Message::Integrity { bin, hash } => {
            check_len("hash", ctx.hash_len, hash.len())?;
            encode_chunk_spec(*bin, ctx, out)?;
            out.extend_from_slice(hash);
        }
        Message::SignedIntegrity {
            bin,
            timestamp,
            signature,
        } => {
            check_len("signature", ctx.signature_len, signature.len())?;
            encode_chunk_spec(*bin, ctx, out)?;
            out.extend_from_slice(&timestamp.to_be_bytes());
            out.extend_from_slice(signature);
        }
        Message::Choke | Message::Unchoke | Message::PexReq => {}
        Message::PexResV4(addr) => {
            out.extend_from_slice(&addr.ip().octets());
            out.extend_from_slice(&addr.port().to_be_bytes());
        }
        Message::PexResV6(addr) => {
            out.extend_from_slice(&addr.ip().octets());
            out.extend_from_slice(&addr.port().to_be_bytes());
        }
        Message::PexResCert(cert) => {
            let len = u16::try_from(cert.len()).map_err(|_| EncodeError::TooLarge("certificate"))?;
            out.extend_from_slice(&len.to_be_bytes());
            out.extend_from_slice(cert);
        }
    }
    Ok(())
}

fn check_len(what: &'static str, expected: usize, got: usize) -> Result<(), EncodeError> {
    if expected != got {
        return Err(EncodeError::Length {
            what,
            expected,
            got,
        });
    }
    Ok(())
}

fn push_addr_value(v: u64, bin: Bin, a: Addressing, out: &mut Vec<u8>) -> Result<(), EncodeError> {
    match a.value_width() {
        4 => {
            let v = u32::try_from(v).map_err(|_| EncodeError::NotRepresentable(bin))?;
            out.extend_from_slice(&v.to_be_bytes());
        }
        _ => out.extend_from_slice(&v.to_be_bytes()),
    }
    Ok(())
}

fn encode_chunk_spec(bin: Bin, ctx: &WireContext, out: &mut Vec<u8>) -> Result<(), EncodeError> {
    if bin.is_none() {
        return Err(EncodeError::NotRepresentable(bin));
    }
    match ctx.addressing {
        Addressing::Bins32 | Addressing::Bins64 => {
            push_addr_value(bin.raw(), bin, ctx.addressing, out)
        }
        Addressing::ChunkRanges32 | Addressing::ChunkRanges64 => {
            let (first, last) = bin.range();
            push_addr_value(first, bin, ctx.addressing, out)?;
            push_addr_value(last, bin, ctx.addressing, out)
        }
        Addressing::ByteRanges64 => Err(EncodeError::ByteRanges),
    }
}

fn encode_options(o: &ProtocolOptions, out: &mut Vec<u8>) -> Result<(), EncodeError> {
    if let Some(v) = o.version {
        out.extend_from_slice(&[0, v]);
    }
    if let Some(v) = o.minimum_version {
        out.extend_from_slice(&[1, v]);
    }
    if let Some(id) = &o.swarm_id {
        let len = u16::try_from(id.0.len()).map_err(|_| EncodeError::TooLarge("swarm id"))?;
        out.push(2);
        out.extend_from_slice(&len.to_be_bytes());
        out.extend_from_slice(&id.0);
    }
    if let Some(v) = o.integrity {
        out.extend_from_slice(&[3, v as u8]);
    }
    if let Some(v) = o.hash_function {
        out.extend_from_slice(&[4, v as u8]);
    }
    if let Some(v) = o.signature_algorithm {
        out.extend_from_slice(&[5, v.to_u8()]);
    }
    if let Some(v) = o.addressing {
        out.extend_from_slice(&[6, v as u8]);
    }
    if let (Some(window), Some(a)) = (o.live_discard_window, o.addressing) {
        out.push(7);
        match a.value_width() {
            4 => {
                let w = u32::try_from(window).map_err(|_| EncodeError::TooLarge("live discard window"))?;
                out.extend_from_slice(&w.to_be_bytes());
            }
            _ => out.extend_from_slice(&window.to_be_bytes()),
        }
    }
    if let Some(set) = &o.supported_messages {
        let mut bitmap = [0u8; SUPPORTED_MESSAGES_MAX_LEN];
        for &code in set {
            bitmap[code as usize / 8] |= 0x80 >> (code % 8);
        }
        let len = bitmap.iter().rposition(|&b| b != 0).map_or(0, |i| i + 1);
        out.push(8);
        out.push(len as u8);
        out.extend_from_slice(&bitmap[..len]);
    }
    if let Some(v) = o.chunk_size {
        out.push(9);
        out.extend_from_slice(&v.to_be_bytes());
    }
    out.push(END_OPTION);
    Ok(())
}
