//! Operation status codes
//!
//! Shard callbacks return these through `OpResult`; the coordinator
//! aggregates them (first fatal error wins) and the command layer renders a
//! single RESP error reply.

use resp::RespValue;

pub type OpResult<T> = Result<T, OpStatus>;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum OpStatus {
    #[error("WRONGTYPE Operation against a key holding the wrong kind of value")]
    WrongType,
    #[error("ERR no such key")]
    KeyNotFound,
    #[error("ERR member not found")]
    MemberNotFound,
    #[error("ERR {0}")]
    InvalidValue(String),
    #[error("ERR resulting score is not a number (NaN)")]
    InvalidFloat,
    #[error("ERR increment or decrement would overflow")]
    OutOfRange,
    #[error("ERR syntax error")]
    SyntaxErr,
    #[error("ERR value is not an integer or out of range")]
    InvalidInt,
    #[error("OOM command not allowed when used memory > 'maxmemory'")]
    OutOfMemory,
    /// A conditional write chose not to apply; non-fatal.
    #[error("ERR skipped")]
    Skipped,
    #[error("ERR operation timed out")]
    TimedOut,
    #[error("ERR operation cancelled")]
    Cancelled,
    #[error("ERR replication stream timeout")]
    StreamTimeout,
}

impl OpStatus {
    /// Statuses that a multi-shard aggregation treats as benign.
    pub fn is_benign(&self) -> bool {
        matches!(self, OpStatus::Skipped | OpStatus::KeyNotFound)
    }

    pub fn to_resp(&self) -> RespValue {
        RespValue::error(self.to_string())
    }
}

impl From<storage::FindError> for OpStatus {
    fn from(e: storage::FindError) -> Self {
        match e {
            storage::FindError::KeyNotFound => OpStatus::KeyNotFound,
            storage::FindError::WrongType => OpStatus::WrongType,
        }
    }
}

/// Pick the reply-determining status from per-shard results: the first
/// non-benign error, otherwise the first benign one.
pub fn aggregate_status<T>(results: &[(u32, OpResult<T>)]) -> Option<OpStatus> {
    let mut benign = None;
    for (_, r) in results {
        if let Err(e) = r {
            if e.is_benign() {
                benign.get_or_insert_with(|| e.clone());
            } else {
                return Some(e.clone());
            }
        }
    }
    benign
}
