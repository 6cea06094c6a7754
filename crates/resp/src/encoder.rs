//! RESP reply encoding
//!
//! Replies are serialized into a byte buffer first; the writer-facing
//! encoder is a thin wrapper so command handlers can build frames without
//! touching I/O.

use crate::RespValue;
use std::io::{self, Write};

/// Serialize one RESP value into `out`.
pub fn encode_into(value: &RespValue, out: &mut Vec<u8>) {
    match value {
        RespValue::SimpleString(s) => {
            out.push(b'+');
            out.extend_from_slice(s);
            out.extend_from_slice(b"\r\n");
        }
        RespValue::Error(e) => {
            out.push(b'-');
            out.extend_from_slice(e);
            out.extend_from_slice(b"\r\n");
        }
        RespValue::Integer(i) => {
            out.push(b':');
            out.extend_from_slice(i.to_string().as_bytes());
            out.extend_from_slice(b"\r\n");
        }
        RespValue::BulkString(Some(bytes)) => {
            out.push(b'$');
            out.extend_from_slice(bytes.len().to_string().as_bytes());
            out.extend_from_slice(b"\r\n");
            out.extend_from_slice(bytes);
            out.extend_from_slice(b"\r\n");
        }
        RespValue::BulkString(None) | RespValue::Null => {
            out.extend_from_slice(b"$-1\r\n");
        }
        RespValue::Array(items) => {
            out.push(b'*');
            out.extend_from_slice(items.len().to_string().as_bytes());
            out.extend_from_slice(b"\r\n");
            for item in items {
                encode_into(item, out);
            }
        }
    }
}

/// Serialize one RESP value into a fresh buffer.
pub fn encode_to_vec(value: &RespValue) -> Vec<u8> {
    let mut out = Vec::new();
    encode_into(value, &mut out);
    out
}

/// Streaming encoder over any `Write` sink.
pub struct RespEncoder<W: Write> {
    writer: W,
    buf: Vec<u8>,
}

impl<W: Write> RespEncoder<W> {
    pub fn new(writer: W) -> Self {
        Self {
            writer,
            buf: Vec::new(),
        }
    }

    /// Encode one value and flush it to the sink.
    pub fn encode(&mut self, value: &RespValue) -> io::Result<()> {
        self.buf.clear();
        encode_into(value, &mut self.buf);
        self.writer.write_all(&self.buf)?;
        self.writer.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    #[test]
    fn test_encode_simple_string() {
        let value = RespValue::SimpleString(Bytes::from("OK"));
        assert_eq!(String::from_utf8_lossy(&encode_to_vec(&value)), "+OK\r\n");
    }

    #[test]
    fn test_encode_bulk_string() {
        let value = RespValue::bulk(&b"hello"[..]);
        assert_eq!(
            String::from_utf8_lossy(&encode_to_vec(&value)),
            "$5\r\nhello\r\n"
        );
    }

    #[test]
    fn test_encode_nil_and_error() {
        assert_eq!(String::from_utf8_lossy(&encode_to_vec(&RespValue::nil())), "$-1\r\n");
        let err = RespValue::error("ERR boom");
        assert_eq!(String::from_utf8_lossy(&encode_to_vec(&err)), "-ERR boom\r\n");
    }

    #[test]
    fn test_encode_array() {
        let value = RespValue::Array(vec![
            RespValue::bulk(&b"GET"[..]),
            RespValue::bulk(&b"key"[..]),
            RespValue::Integer(7),
        ]);
        assert_eq!(
            String::from_utf8_lossy(&encode_to_vec(&value)),
            "*3\r\n$3\r\nGET\r\n$3\r\nkey\r\n:7\r\n"
        );
    }

    #[test]
    fn test_writer_encoder() {
        let mut sink = Vec::new();
        let mut enc = RespEncoder::new(&mut sink);
        enc.encode(&RespValue::ok()).unwrap();
        enc.encode(&RespValue::Integer(1)).unwrap();
        assert_eq!(String::from_utf8_lossy(&sink), "+OK\r\n:1\r\n");
    }
}
