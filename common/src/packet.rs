//! Length-prefixed binary framing for the command channel.
//!
//! Wire layout (all integers little-endian):
//!
//! ```text
//! byte[4]       size        counts every byte after this field
//! byte[4]       ident       echoed by the peer (0 = success, 1 = failure in replies)
//! byte[4]       kind        2 = COMMAND, 3 = AUTH
//! byte[size-10] payload
//! byte[2]       terminator  must be 00 00
//! ```

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Smallest possible packet: size + ident + kind + empty payload + terminator.
pub const MIN_PACKET_LEN: usize = 14;

pub const IDENT_SUCCESS: i32 = 0;
pub const IDENT_FAILURE: i32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketKind {
    Command = 2,
    Auth = 3,
}

impl PacketKind {
    pub fn from_wire(raw: i32) -> Option<Self> {
        match raw {
            2 => Some(PacketKind::Command),
            3 => Some(PacketKind::Auth),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub ident: i32,
    pub kind: PacketKind,
    pub payload: Vec<u8>,
}

impl Packet {
    pub fn new(ident: i32, kind: PacketKind, payload: Vec<u8>) -> Self {
        Self { ident, kind, payload }
    }
}

#[derive(Debug, Error)]
pub enum PacketError {
    /// Not a failure: the buffer holds less than one whole packet. Callers
    /// reading from a socket should buffer up to the given length and retry.
    #[error("need at least {0} bytes to decode a packet")]
    Incomplete(usize),
    #[error("declared packet size {0} is below the protocol minimum")]
    BadSize(i32),
    #[error("packet terminator was not 00 00")]
    BadTerminator,
    #[error("unknown packet kind {0}")]
    UnknownKind(i32),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

fn read_i32(data: &[u8]) -> i32 {
    i32::from_le_bytes([data[0], data[1], data[2], data[3]])
}

/// Decodes one packet from the front of `data`. Returns the packet and any
/// bytes remaining after it. A short buffer yields `PacketError::Incomplete`
/// with the number of bytes needed before a retry can succeed.
pub fn decode(data: &[u8]) -> Result<(Packet, &[u8]), PacketError> {
    if data.len() < MIN_PACKET_LEN {
        return Err(PacketError::Incomplete(MIN_PACKET_LEN));
    }

    let size = read_i32(&data[0..4]);
    if size < 10 {
        return Err(PacketError::BadSize(size));
    }
    let total = size as usize + 4;
    if data.len() < total {
        return Err(PacketError::Incomplete(total));
    }

    let ident = read_i32(&data[4..8]);
    let raw_kind = read_i32(&data[8..12]);
    let kind = PacketKind::from_wire(raw_kind).ok_or(PacketError::UnknownKind(raw_kind))?;

    // A bad terminator means the framing is corrupt; the payload cannot be
    // trusted, so this is fatal for the connection.
    if data[total - 2..total] != [0, 0] {
        return Err(PacketError::BadTerminator);
    }

    let payload = data[12..total - 2].to_vec();
    Ok((Packet { ident, kind, payload }, &data[total..]))
}

/// Encodes a packet into its wire form. Exact inverse of [`decode`].
pub fn encode(packet: &Packet) -> Vec<u8> {
    let size = (packet.payload.len() + 10) as i32;
    let mut buf = Vec::with_capacity(packet.payload.len() + MIN_PACKET_LEN);
    buf.extend_from_slice(&size.to_le_bytes());
    buf.extend_from_slice(&packet.ident.to_le_bytes());
    buf.extend_from_slice(&(packet.kind as i32).to_le_bytes());
    buf.extend_from_slice(&packet.payload);
    buf.extend_from_slice(&[0, 0]);
    buf
}

/// Reads exactly one packet from the stream, reassembling partial TCP reads.
pub async fn read_packet<S>(stream: &mut S) -> Result<Packet, PacketError>
where
    S: AsyncRead + Unpin,
{
    let mut buf = Vec::new();
    loop {
        match decode(&buf) {
            Ok((packet, _rest)) => return Ok(packet),
            Err(PacketError::Incomplete(minimum)) => {
                let mut chunk = vec![0u8; minimum - buf.len()];
                stream.read_exact(&mut chunk).await?;
                buf.extend_from_slice(&chunk);
            }
            Err(err) => return Err(err),
        }
    }
}

/// Writes one packet to the stream.
pub async fn write_packet<S>(stream: &mut S, packet: &Packet) -> Result<(), PacketError>
where
    S: AsyncWrite + Unpin,
{
    stream.write_all(&encode(packet)).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Packet {
        Packet::new(7, PacketKind::Command, b"backup-status abc".to_vec())
    }

    #[test]
    fn encode_decode_round_trip() {
        let packet = sample();
        let wire = encode(&packet);
        let (decoded, rest) = decode(&wire).unwrap();
        assert_eq!(decoded, packet);
        assert!(rest.is_empty());
    }

    #[test]
    fn empty_payload_round_trip() {
        let packet = Packet::new(0, PacketKind::Auth, Vec::new());
        let wire = encode(&packet);
        assert_eq!(wire.len(), MIN_PACKET_LEN);
        let (decoded, _) = decode(&wire).unwrap();
        assert_eq!(decoded, packet);
    }

    #[test]
    fn decode_leaves_remainder() {
        let mut wire = encode(&sample());
        wire.extend_from_slice(b"tail");
        let (_, rest) = decode(&wire).unwrap();
        assert_eq!(rest, b"tail");
    }

    #[test]
    fn short_buffer_reports_minimum() {
        match decode(b"\x01\x02") {
            Err(PacketError::Incomplete(n)) => assert_eq!(n, MIN_PACKET_LEN),
            other => panic!("expected Incomplete, got {:?}", other),
        }
    }

    #[test]
    fn byte_at_a_time_matches_whole_buffer() {
        let packet = sample();
        let wire = encode(&packet);
        let (expected, _) = decode(&wire).unwrap();

        // Simulate arbitrarily fragmented reads: grow the buffer one byte at
        // a time and decode whenever the codec stops asking for more.
        let mut buf = Vec::new();
        let mut decoded = None;
        for byte in &wire {
            buf.push(*byte);
            match decode(&buf) {
                Ok((p, rest)) => {
                    assert!(rest.is_empty());
                    decoded = Some(p);
                    break;
                }
                Err(PacketError::Incomplete(minimum)) => assert!(minimum > buf.len()),
                Err(err) => panic!("unexpected decode failure: {}", err),
            }
        }
        assert_eq!(decoded, Some(expected));
    }

    #[test]
    fn bad_terminator_is_fatal() {
        let mut wire = encode(&sample());
        let last = wire.len() - 1;
        wire[last] = 0x01;
        assert!(matches!(decode(&wire), Err(PacketError::BadTerminator)));
    }

    #[test]
    fn unknown_kind_rejected() {
        let mut wire = encode(&sample());
        wire[8] = 9;
        assert!(matches!(decode(&wire), Err(PacketError::UnknownKind(9))));
    }

    #[test]
    fn undersized_length_field_rejected() {
        let mut wire = encode(&Packet::new(0, PacketKind::Auth, Vec::new()));
        wire[0] = 4;
        assert!(matches!(decode(&wire), Err(PacketError::BadSize(4))));
    }

    #[tokio::test]
    async fn read_packet_reassembles_split_stream() {
        let packet = sample();
        let wire = encode(&packet);
        let (mut client, mut server) = tokio::io::duplex(8);

        let writer = tokio::spawn(async move {
            // Dribble the bytes out in small chunks.
            for chunk in wire.chunks(3) {
                server.write_all(chunk).await.unwrap();
            }
        });

        let decoded = read_packet(&mut client).await.unwrap();
        writer.await.unwrap();
        assert_eq!(decoded, packet);
    }
}
