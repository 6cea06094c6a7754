//! Journal streamer
//!
//! Drains a journal subscription into a replication sink with a bounded
//! in-flight window: frames accumulate into a pending buffer that is
//! flushed once it passes a threshold or the queue momentarily drains, and
//! a flush that cannot complete within the configured window reports a
//! stream timeout. Optionally interleaves an LSN marker every few seconds
//! so the replica can acknowledge progress.

use super::{JournalEntry, JournalOp};
use crate::error::OpStatus;
use std::time::Duration;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::debug;

/// Flush once this many bytes are pending even if more entries are queued.
const FLUSH_THRESHOLD: usize = 2 * 1024;

/// Seconds between LSN markers.
const LSN_PERIOD: Duration = Duration::from_secs(3);

pub struct JournalStreamer<W> {
    rx: mpsc::UnboundedReceiver<JournalEntry>,
    dest: W,
    output_limit: usize,
    stream_timeout: Duration,
    send_lsn: bool,
    pending: Vec<u8>,
    last_lsn_time: Instant,
    total_sent: u64,
}

impl<W: AsyncWrite + Unpin> JournalStreamer<W> {
    pub fn new(
        rx: mpsc::UnboundedReceiver<JournalEntry>,
        dest: W,
        output_limit: usize,
        stream_timeout: Duration,
        send_lsn: bool,
    ) -> Self {
        Self {
            rx,
            dest,
            output_limit,
            stream_timeout,
            send_lsn,
            pending: Vec::new(),
            last_lsn_time: Instant::now(),
            total_sent: 0,
        }
    }

    /// Total bytes pushed to the sink.
    pub fn total_sent(&self) -> u64 {
        self.total_sent
    }

    fn frame(buf: &mut Vec<u8>, entry: &JournalEntry) -> Result<(), OpStatus> {
        let body = bincode::serialize(entry)
            .map_err(|e| OpStatus::InvalidValue(format!("journal encode: {e}")))?;
        buf.extend_from_slice(&(body.len() as u32).to_le_bytes());
        buf.extend_from_slice(&body);
        Ok(())
    }

    /// Run until the journal side closes. Returns `StreamTimeout` when the
    /// sink cannot absorb the pending window in time.
    pub async fn run(mut self) -> Result<u64, OpStatus> {
        while let Some(entry) = self.rx.recv().await {
            if entry.op != JournalOp::Noop {
                Self::frame(&mut self.pending, &entry)?;
            }

            if self.send_lsn && self.last_lsn_time.elapsed() >= LSN_PERIOD {
                self.last_lsn_time = Instant::now();
                let marker = JournalEntry {
                    txid: 0,
                    op: JournalOp::Lsn,
                    db: entry.db,
                    shard_cnt: entry.shard_cnt,
                    slot: None,
                    lsn: entry.lsn,
                    payload: Vec::new(),
                };
                Self::frame(&mut self.pending, &marker)?;
            }

            // throttle before the in-flight window overflows, and push
            // whatever accumulated once the queue is momentarily idle
            if self.pending.len() >= FLUSH_THRESHOLD
                || self.pending.len() >= self.output_limit
                || self.rx.is_empty()
            {
                self.flush().await?;
            }
        }
        self.flush().await?;
        debug!(total = self.total_sent, "journal streamer done");
        Ok(self.total_sent)
    }

    async fn flush(&mut self) -> Result<(), OpStatus> {
        if self.pending.is_empty() {
            return Ok(());
        }
        let buf = std::mem::take(&mut self.pending);
        let write = async {
            self.dest.write_all(&buf).await?;
            self.dest.flush().await
        };
        match tokio::time::timeout(self.stream_timeout, write).await {
            Ok(Ok(())) => {
                self.total_sent += buf.len() as u64;
                Ok(())
            }
            Ok(Err(_)) | Err(_) => Err(OpStatus::StreamTimeout),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::journal::Journal;
    use bytes::Bytes;

    fn entry_of(buf: &[u8]) -> (JournalEntry, usize) {
        let len = u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
        let e: JournalEntry = bincode::deserialize(&buf[4..4 + len]).unwrap();
        (e, 4 + len)
    }

    #[tokio::test]
    async fn test_stream_delivers_frames() {
        let mut journal = Journal::new();
        let (_, rx) = journal.subscribe();
        journal.record_command(1, 0, 1, None, "SET", &[Bytes::from("k"), Bytes::from("v")]);
        journal.record_command(2, 0, 1, None, "DEL", &[Bytes::from("k")]);
        drop(journal);

        let (mut out, sink) = tokio::io::duplex(64 * 1024);
        let streamer = JournalStreamer::new(rx, sink, 64 * 1024, Duration::from_millis(500), false);
        let task = tokio::spawn(streamer.run());

        let sent = task.await.unwrap().unwrap();
        assert!(sent > 0);
        let mut buf = vec![0u8; sent as usize];
        tokio::io::AsyncReadExt::read_exact(&mut out, &mut buf).await.unwrap();

        let (e1, used) = entry_of(&buf);
        assert_eq!(e1.payload[0], b"SET".to_vec());
        let (e2, _) = entry_of(&buf[used..]);
        assert_eq!(e2.payload[0], b"DEL".to_vec());
    }

    #[tokio::test]
    async fn test_backpressure_times_out() {
        let mut journal = Journal::new();
        let (_, rx) = journal.subscribe();
        // a sink with a tiny window that nobody drains
        let (_out, sink) = tokio::io::duplex(64);
        let big: Vec<Bytes> = (0..64).map(|i| Bytes::from(vec![i as u8; 64])).collect();
        journal.record_command(1, 0, 1, None, "MSET", &big);
        drop(journal);

        let streamer = JournalStreamer::new(rx, sink, 256, Duration::from_millis(50), false);
        let err = streamer.run().await.unwrap_err();
        assert_eq!(err, OpStatus::StreamTimeout);
    }
}
