use anyhow::{anyhow, bail, Result};
use bytes::{Buf, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use super::types::RespValue;

/// Deepest array nesting accepted from a node.
const MAX_DEPTH: usize = 64;
/// Largest bulk string or array length accepted from a node.
const MAX_LENGTH: isize = 512 * 1024 * 1024;

/// RESP2 frame codec used both for node connections and sentinel probes.
#[derive(Debug, Clone, Default)]
pub struct RespCodec;

impl Decoder for RespCodec {
    type Item = RespValue;
    type Error = anyhow::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>> {
        let mut pos = 0usize;
        match parse_value(&src[..], &mut pos, 0)? {
            Some(frame) => {
                src.advance(pos);
                Ok(Some(frame))
            }
            None => Ok(None),
        }
    }
}

impl Encoder<RespValue> for RespCodec {
    type Error = anyhow::Error;

    fn encode(&mut self, item: RespValue, dst: &mut BytesMut) -> Result<()> {
        write_value(&item, dst);
        Ok(())
    }
}

fn parse_value(src: &[u8], pos: &mut usize, depth: usize) -> Result<Option<RespValue>> {
    if *pos >= src.len() {
        return Ok(None);
    }
    let start = *pos;
    let prefix = src[*pos];
    *pos += 1;

    match prefix {
        b'+' | b'-' | b':' => {
            let line = match read_line(src, pos) {
                Some(line) => line,
                None => {
                    *pos = start;
                    return Ok(None);
                }
            };
            match prefix {
                b'+' => Ok(Some(RespValue::SimpleString(Bytes::copy_from_slice(line)))),
                b'-' => Ok(Some(RespValue::Error(Bytes::copy_from_slice(line)))),
                _ => {
                    let value = std::str::from_utf8(line)?
                        .parse::<i64>()
                        .map_err(|err| anyhow!("invalid integer: {err}"))?;
                    Ok(Some(RespValue::Integer(value)))
                }
            }
        }
        b'$' => parse_bulk_string(src, pos, start),
        b'*' => parse_array(src, pos, start, depth),
        _ => Err(anyhow!("unsupported RESP prefix '{}'", prefix as char)),
    }
}

fn parse_bulk_string(src: &[u8], pos: &mut usize, start: usize) -> Result<Option<RespValue>> {
    let line = match read_line(src, pos) {
        Some(line) => line,
        None => {
            *pos = start;
            return Ok(None);
        }
    };
    let len = parse_length(line, "bulk string")?;
    if len < 0 {
        return Ok(Some(RespValue::NullBulk));
    }
    let len = len as usize;
    if *pos + len + 2 > src.len() {
        *pos = start;
        return Ok(None);
    }
    let data = &src[*pos..*pos + len];
    *pos += len + 2;
    Ok(Some(RespValue::BulkString(Bytes::copy_from_slice(data))))
}

fn parse_array(
    src: &[u8],
    pos: &mut usize,
    start: usize,
    depth: usize,
) -> Result<Option<RespValue>> {
    if depth >= MAX_DEPTH {
        bail!("array nesting exceeds {MAX_DEPTH} levels");
    }
    let line = match read_line(src, pos) {
        Some(line) => line,
        None => {
            *pos = start;
            return Ok(None);
        }
    };
    let len = parse_length(line, "array")?;
    if len < 0 {
        return Ok(Some(RespValue::NullArray));
    }
    // every element takes at least three bytes on the wire
    let mut values = Vec::with_capacity((len as usize).min(src.len() / 3));
    for _ in 0..len {
        match parse_value(src, pos, depth + 1)? {
            Some(value) => values.push(value),
            None => {
                *pos = start;
                return Ok(None);
            }
        }
    }
    Ok(Some(RespValue::Array(values)))
}

fn parse_length(bytes: &[u8], kind: &str) -> Result<isize> {
    let text = std::str::from_utf8(bytes)?;
    let len = text
        .parse::<isize>()
        .map_err(|err| anyhow!("invalid {kind} length: {err}"))?;
    if len > MAX_LENGTH {
        bail!("{kind} length {len} exceeds {MAX_LENGTH}");
    }
    Ok(len)
}

fn read_line<'a>(src: &'a [u8], pos: &mut usize) -> Option<&'a [u8]> {
    let mut idx = *pos;
    while idx + 1 < src.len() {
        if src[idx] == b'\r' && src[idx + 1] == b'\n' {
            let line = &src[*pos..idx];
            *pos = idx + 2;
            return Some(line);
        }
        idx += 1;
    }
    None
}

fn write_value(value: &RespValue, dst: &mut BytesMut) {
    match value {
        RespValue::SimpleString(data) => write_line(b'+', data, dst),
        RespValue::Error(data) => write_line(b'-', data, dst),
        RespValue::Integer(value) => write_line(b':', value.to_string().as_bytes(), dst),
        RespValue::BulkString(data) => {
            write_line(b'$', data.len().to_string().as_bytes(), dst);
            dst.extend_from_slice(data);
            dst.extend_from_slice(b"\r\n");
        }
        RespValue::NullBulk => dst.extend_from_slice(b"$-1\r\n"),
        RespValue::Array(values) => {
            write_line(b'*', values.len().to_string().as_bytes(), dst);
            for value in values {
                write_value(value, dst);
            }
        }
        RespValue::NullArray => dst.extend_from_slice(b"*-1\r\n"),
    }
}

fn write_line(prefix: u8, data: &[u8], dst: &mut BytesMut) {
    dst.extend_from_slice(&[prefix]);
    dst.extend_from_slice(data);
    dst.extend_from_slice(b"\r\n");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_nested_array_across_partial_reads() {
        let mut codec = RespCodec;
        let mut buf = BytesMut::from(&b"*2\r\n$3\r\nfoo\r\n*1\r\n:4"[..]);
        assert!(codec.decode(&mut buf).unwrap().is_none());
        buf.extend_from_slice(b"2\r\n");
        let frame = codec.decode(&mut buf).unwrap().expect("complete frame");
        assert_eq!(
            frame,
            RespValue::Array(vec![
                RespValue::bulk("foo"),
                RespValue::Array(vec![RespValue::Integer(42)]),
            ])
        );
        assert!(buf.is_empty());
    }

    #[test]
    fn decodes_null_frames_and_errors() {
        let mut codec = RespCodec;
        let mut buf = BytesMut::from(&b"$-1\r\n*-1\r\n-NOSCRIPT missing\r\n"[..]);
        assert_eq!(codec.decode(&mut buf).unwrap(), Some(RespValue::NullBulk));
        assert_eq!(codec.decode(&mut buf).unwrap(), Some(RespValue::NullArray));
        assert_eq!(
            codec.decode(&mut buf).unwrap(),
            Some(RespValue::error("NOSCRIPT missing"))
        );
    }

    #[test]
    fn rejects_unknown_prefix() {
        let mut codec = RespCodec;
        let mut buf = BytesMut::from(&b"%1\r\n"[..]);
        assert!(codec.decode(&mut buf).is_err());
    }

    #[test]
    fn rejects_oversized_lengths() {
        let mut codec = RespCodec;
        let mut buf = BytesMut::from(&b"*9223372036854775807\r\n"[..]);
        assert!(codec.decode(&mut buf).is_err());
        let mut buf = BytesMut::from(&b"$9223372036854775807\r\n"[..]);
        assert!(codec.decode(&mut buf).is_err());
    }

    #[test]
    fn large_declared_array_waits_for_more_data() {
        let mut codec = RespCodec;
        let mut buf = BytesMut::from(&b"*1000000\r\n:1\r\n"[..]);
        assert!(codec.decode(&mut buf).unwrap().is_none());
        assert_eq!(buf.len(), 14);
    }

    #[test]
    fn rejects_deeply_nested_arrays() {
        let mut codec = RespCodec;
        let mut buf = BytesMut::new();
        for _ in 0..10_000 {
            buf.extend_from_slice(b"*1\r\n");
        }
        buf.extend_from_slice(b":1\r\n");
        assert!(codec.decode(&mut buf).is_err());

        let mut buf = BytesMut::new();
        for _ in 0..8 {
            buf.extend_from_slice(b"*1\r\n");
        }
        buf.extend_from_slice(b":1\r\n");
        assert!(codec.decode(&mut buf).unwrap().is_some());
    }

    #[test]
    fn encodes_command_array() {
        let mut codec = RespCodec;
        let mut buf = BytesMut::new();
        codec
            .encode(
                RespValue::Array(vec![RespValue::bulk("GET"), RespValue::bulk("k")]),
                &mut buf,
            )
            .unwrap();
        assert_eq!(buf.as_ref(), b"*2\r\n$3\r\nGET\r\n$1\r\nk\r\n");
    }
}
