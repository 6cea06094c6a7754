//! RESP (REdis Serialization Protocol) support library
//!
//! Implements the RESP value model and reply encoding. Wire parsing and the
//! command dispatch table live with the network layer, not here.

mod encoder;

pub use encoder::{encode_into, encode_to_vec, RespEncoder};

use bytes::Bytes;
use std::io;

/// RESP data type
#[derive(Debug, Clone, PartialEq)]
pub enum RespValue {
    /// Simple string: +OK\r\n
    SimpleString(Bytes),
    /// Error: -ERR message\r\n
    Error(Bytes),
    /// Integer: :123\r\n
    Integer(i64),
    /// Bulk string: $5\r\nhello\r\n
    BulkString(Option<Bytes>),
    /// Array: *2\r\n$3\r\nGET\r\n$3\r\nkey\r\n
    Array(Vec<RespValue>),
    /// Null: $-1\r\n
    Null,
}

impl RespValue {
    pub fn ok() -> Self {
        RespValue::SimpleString(Bytes::from_static(b"OK"))
    }

    pub fn nil() -> Self {
        RespValue::BulkString(None)
    }

    pub fn bulk(bytes: impl Into<Bytes>) -> Self {
        RespValue::BulkString(Some(bytes.into()))
    }

    pub fn error(msg: impl Into<Bytes>) -> Self {
        RespValue::Error(msg.into())
    }

    /// Scores and distances travel as bulk strings in RESP2. Formats the
    /// shortest representation that round-trips, matching Redis output
    /// ("1", "1.5", "inf").
    pub fn double(v: f64) -> Self {
        RespValue::bulk(format_double(v))
    }

    pub fn array(items: Vec<RespValue>) -> Self {
        RespValue::Array(items)
    }

    /// Convert a RESP array of bulk strings into an argument vector.
    pub fn to_args(&self) -> Option<Vec<Bytes>> {
        match self {
            RespValue::Array(items) => {
                let mut args = Vec::with_capacity(items.len());
                for item in items {
                    match item {
                        RespValue::BulkString(Some(bytes)) => args.push(bytes.clone()),
                        RespValue::SimpleString(s) => args.push(s.clone()),
                        _ => return None,
                    }
                }
                Some(args)
            }
            _ => None,
        }
    }
}

/// Format a double the way Redis renders scores: integers without a
/// fractional part, infinities as "inf"/"-inf", everything else via the
/// shortest round-tripping decimal.
pub fn format_double(v: f64) -> String {
    if v.is_infinite() {
        return if v > 0.0 { "inf".into() } else { "-inf".into() };
    }
    if v == v.trunc() && v.abs() < 1e17 {
        return format!("{}", v as i64);
    }
    let mut s = format!("{}", v);
    if s.contains('e') {
        s = format!("{:.17}", v);
        while s.ends_with('0') {
            s.pop();
        }
        if s.ends_with('.') {
            s.pop();
        }
    }
    s
}

/// RESP encoding error
#[derive(Debug, thiserror::Error)]
pub enum RespError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
    #[error("Invalid RESP format: {0}")]
    InvalidFormat(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_to_args() {
        let v = RespValue::Array(vec![RespValue::bulk("GET"), RespValue::bulk("k")]);
        let args = v.to_args().unwrap();
        assert_eq!(args, vec![Bytes::from("GET"), Bytes::from("k")]);
        assert!(RespValue::Integer(1).to_args().is_none());
    }

    #[test]
    fn test_format_double() {
        assert_eq!(format_double(1.0), "1");
        assert_eq!(format_double(-3.0), "-3");
        assert_eq!(format_double(1.5), "1.5");
        assert_eq!(format_double(f64::INFINITY), "inf");
        assert_eq!(format_double(f64::NEG_INFINITY), "-inf");
    }
}
