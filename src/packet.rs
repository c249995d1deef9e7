use crate::support::{ProtocolError, WasError, WasResult};
use byteorder::{ByteOrder, LittleEndian, WriteBytesExt};
use std::str;

/// Bytes of the `command | length` frame header.
pub const HEADER_SIZE: usize = 4;

/// Largest payload a single frame can carry.
pub const MAX_PAYLOAD_SIZE: usize = u16::max_value() as usize;

/// Typed command codes of the control channel. The numeric space is shared
/// with the peer and must not be reordered.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Command {
    Nop = 0,
    Request = 1,
    Method = 2,
    Uri = 3,
    ScriptName = 4,
    PathInfo = 5,
    QueryString = 6,
    Header = 7,
    Parameter = 8,
    Status = 9,
    NoData = 10,
    Data = 11,
    Length = 12,
    Stop = 13,
    Premature = 14,
    RemoteHost = 15,
    Metric = 16,
    Shutdown = 17,
}

impl Command {
    pub fn from_wire(code: u16) -> WasResult<Command> {
        Ok(match code {
            0 => Command::Nop,
            1 => Command::Request,
            2 => Command::Method,
            3 => Command::Uri,
            4 => Command::ScriptName,
            5 => Command::PathInfo,
            6 => Command::QueryString,
            7 => Command::Header,
            8 => Command::Parameter,
            9 => Command::Status,
            10 => Command::NoData,
            11 => Command::Data,
            12 => Command::Length,
            13 => Command::Stop,
            14 => Command::Premature,
            15 => Command::RemoteHost,
            16 => Command::Metric,
            17 => Command::Shutdown,
            _ => return Err(WasError::Protocol(ProtocolError::UnknownCommand)),
        })
    }
}

impl From<Command> for u16 {
    #[inline]
    fn from(command: Command) -> Self {
        command as u16
    }
}

/// HTTP request methods as transmitted in the METHOD payload. GET is the
/// default when the peer sends no METHOD packet.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Method {
    Head = 1,
    Get = 2,
    Post = 3,
    Put = 4,
    Delete = 5,
    Options = 6,
    Trace = 7,
    Propfind = 8,
    Proppatch = 9,
    Mkcol = 10,
    Copy = 11,
    Move = 12,
    Lock = 13,
    Unlock = 14,
    Patch = 15,
}

impl Method {
    pub fn from_wire(code: u32) -> WasResult<Method> {
        Ok(match code {
            1 => Method::Head,
            2 => Method::Get,
            3 => Method::Post,
            4 => Method::Put,
            5 => Method::Delete,
            6 => Method::Options,
            7 => Method::Trace,
            8 => Method::Propfind,
            9 => Method::Proppatch,
            10 => Method::Mkcol,
            11 => Method::Copy,
            12 => Method::Move,
            13 => Method::Lock,
            14 => Method::Unlock,
            15 => Method::Patch,
            _ => return Err(WasError::Protocol(ProtocolError::InvalidMethod)),
        })
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Method::Head => "HEAD",
            Method::Get => "GET",
            Method::Post => "POST",
            Method::Put => "PUT",
            Method::Delete => "DELETE",
            Method::Options => "OPTIONS",
            Method::Trace => "TRACE",
            Method::Propfind => "PROPFIND",
            Method::Proppatch => "PROPPATCH",
            Method::Mkcol => "MKCOL",
            Method::Copy => "COPY",
            Method::Move => "MOVE",
            Method::Lock => "LOCK",
            Method::Unlock => "UNLOCK",
            Method::Patch => "PATCH",
        }
    }
}

/// A single control packet with its payload copied out of the receive
/// buffer.
#[derive(Debug)]
pub struct Packet {
    pub command: Command,
    pub payload: Vec<u8>,
}

/// Serialize a frame, header plus payload, into a fresh buffer.
pub fn serialize(command: Command, payload: &[u8]) -> Vec<u8> {
    debug_assert!(payload.len() <= MAX_PAYLOAD_SIZE);

    let mut frame = Vec::with_capacity(HEADER_SIZE + payload.len());
    frame
        .write_u16::<LittleEndian>(command.into())
        .expect("vec write cannot fail");
    frame
        .write_u16::<LittleEndian>(payload.len() as u16)
        .expect("vec write cannot fail");
    frame.extend_from_slice(payload);

    frame
}

pub fn encode_u32(value: u32) -> Vec<u8> {
    let mut buf = Vec::with_capacity(4);
    buf.write_u32::<LittleEndian>(value).expect("vec write cannot fail");
    buf
}

pub fn encode_u64(value: u64) -> Vec<u8> {
    let mut buf = Vec::with_capacity(8);
    buf.write_u64::<LittleEndian>(value).expect("vec write cannot fail");
    buf
}

/// HEADER and PARAMETER payloads carry `name=value`, split at the first
/// separator; values may contain further `=` bytes.
pub fn encode_pair(name: &str, value: &str) -> Vec<u8> {
    format!("{}={}", name, value).into_bytes()
}

/// METRIC samples carry the 32-bit float value followed by the metric name.
pub fn encode_metric(name: &str, value: f32) -> Vec<u8> {
    let mut buf = Vec::with_capacity(4 + name.len());
    buf.write_f32::<LittleEndian>(value).expect("vec write cannot fail");
    buf.extend_from_slice(name.as_bytes());
    buf
}

pub fn decode_u32(payload: &[u8]) -> WasResult<u32> {
    if payload.len() != 4 {
        return Err(WasError::Protocol(ProtocolError::BadPayload));
    }
    Ok(LittleEndian::read_u32(payload))
}

pub fn decode_u64(payload: &[u8]) -> WasResult<u64> {
    if payload.len() != 8 {
        return Err(WasError::Protocol(ProtocolError::BadPayload));
    }
    Ok(LittleEndian::read_u64(payload))
}

pub fn decode_str(payload: &[u8]) -> WasResult<&str> {
    str::from_utf8(payload).map_err(|_| WasError::Protocol(ProtocolError::BadPayload))
}

pub fn decode_pair(payload: &[u8]) -> WasResult<(&str, &str)> {
    let text = decode_str(payload)?;
    match text.find('=') {
        Some(at) => Ok((&text[..at], &text[at + 1..])),
        None => Err(WasError::Protocol(ProtocolError::BadPayload)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_codes_roundtrip() {
        for code in 0u16..=17 {
            let command = Command::from_wire(code).unwrap();
            assert_eq!(u16::from(command), code);
        }

        assert_eq!(
            Command::from_wire(999).unwrap_err(),
            WasError::Protocol(ProtocolError::UnknownCommand)
        );
    }

    #[test]
    fn test_method_codes_roundtrip() {
        for code in 1u32..=15 {
            let method = Method::from_wire(code).unwrap();
            assert_eq!(method as u32, code);
        }

        assert_eq!(
            Method::from_wire(0).unwrap_err(),
            WasError::Protocol(ProtocolError::InvalidMethod)
        );
        assert_eq!(Method::Get.as_str(), "GET");
    }

    #[test]
    fn test_serialize_frames_little_endian() {
        let frame = serialize(Command::Length, &encode_u64(5));

        assert_eq!(&frame[..4], &[12, 0, 8, 0]);
        assert_eq!(&frame[4..], &[5, 0, 0, 0, 0, 0, 0, 0]);
    }

    #[test]
    fn test_serialize_empty_payload() {
        let frame = serialize(Command::NoData, &[]);
        assert_eq!(frame, vec![10, 0, 0, 0]);
    }

    #[test]
    fn test_pair_splits_at_first_separator() {
        let payload = encode_pair("Content-Type", "text/plain");
        assert_eq!(decode_pair(&payload).unwrap(), ("Content-Type", "text/plain"));

        let (name, value) = decode_pair(b"a=b=c").unwrap();
        assert_eq!(name, "a");
        assert_eq!(value, "b=c");

        assert_eq!(
            decode_pair(b"no separator").unwrap_err(),
            WasError::Protocol(ProtocolError::BadPayload)
        );
    }

    #[test]
    fn test_pair_rejects_invalid_utf8() {
        assert_eq!(
            decode_pair(&[0xff, b'=', b'x']).unwrap_err(),
            WasError::Protocol(ProtocolError::BadPayload)
        );
    }

    #[test]
    fn test_numeric_payload_length_is_checked() {
        assert_eq!(
            decode_u64(&[1, 2, 3]).unwrap_err(),
            WasError::Protocol(ProtocolError::BadPayload)
        );
        assert_eq!(decode_u64(&encode_u64(7)).unwrap(), 7);
        assert_eq!(decode_u32(&encode_u32(204)).unwrap(), 204);
    }

    #[test]
    fn test_metric_payload_layout() {
        let payload = encode_metric("latency_ms", 12.5);

        assert_eq!(LittleEndian::read_f32(&payload[..4]), 12.5);
        assert_eq!(&payload[4..], b"latency_ms");
    }
}
