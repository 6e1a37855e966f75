//! Dedicated writer task for outbound packets.
//!
//! Every packet the link emits (data, retransmissions, ACK/NAK signals)
//! goes through one mpsc channel into a single task that owns the write
//! half of the transport. Packets therefore hit the wire in the order they
//! were handed over, and packets that pile up while a write is in flight
//! go out together in one vectored write.
//!
//! ```text
//! Link actor ─► mpsc::Sender<OutboundPacket> ─► Writer Task ─► Transport
//! ```

use std::io::IoSlice;

use bytes::Bytes;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::trace;

use crate::delivery::{Completion, Receipt};
use crate::error::{PcomError, Result};

/// Default channel capacity.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 64;

/// Maximum packets to batch in a single write operation.
const MAX_BATCH_SIZE: usize = 64;

/// A framed packet ready to be written.
#[derive(Debug)]
pub struct OutboundPacket {
    /// Complete packet, START to STOP.
    pub bytes: Bytes,
    /// Sequence number, for the receipt.
    pub sequence: u8,
    /// Resolved once the bytes are flushed.
    pub written: Option<Completion>,
}

impl OutboundPacket {
    /// A packet nobody waits on (ACK/NAK, retransmission).
    pub fn new(bytes: Bytes, sequence: u8) -> Self {
        Self {
            bytes,
            sequence,
            written: None,
        }
    }

    /// A packet whose sender waits for the write to finish.
    pub fn with_completion(bytes: Bytes, sequence: u8, written: Completion) -> Self {
        Self {
            bytes,
            sequence,
            written: Some(written),
        }
    }

    #[inline]
    pub fn size(&self) -> usize {
        self.bytes.len()
    }
}

/// Configuration for the writer task.
#[derive(Debug, Clone)]
pub struct WriterConfig {
    /// Channel capacity for the packet queue.
    pub channel_capacity: usize,
}

impl Default for WriterConfig {
    fn default() -> Self {
        Self {
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
        }
    }
}

/// Handle for sending packets to the writer task.
#[derive(Clone, Debug)]
pub struct WriterHandle {
    tx: mpsc::Sender<OutboundPacket>,
}

impl WriterHandle {
    /// Queue a packet, waiting for channel space.
    pub async fn send(&self, packet: OutboundPacket) -> Result<()> {
        self.tx.send(packet).await.map_err(|_| PcomError::LinkClosed)
    }
}

/// Spawn the writer task and return a handle for sending packets.
///
/// The task ends with `Ok(())` once every handle is dropped, or with the
/// first I/O error.
pub fn spawn_writer_task<W>(
    writer: W,
    config: WriterConfig,
) -> (WriterHandle, JoinHandle<Result<()>>)
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (tx, rx) = mpsc::channel(config.channel_capacity.max(1));
    let task = tokio::spawn(writer_loop(rx, writer));
    (WriterHandle { tx }, task)
}

async fn writer_loop<W>(mut rx: mpsc::Receiver<OutboundPacket>, mut writer: W) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    loop {
        let Some(first) = rx.recv().await else {
            return Ok(());
        };

        let mut batch = Vec::with_capacity(MAX_BATCH_SIZE);
        batch.push(first);
        while batch.len() < MAX_BATCH_SIZE {
            match rx.try_recv() {
                Ok(packet) => batch.push(packet),
                Err(_) => break,
            }
        }

        trace!(packets = batch.len(), "Writing batch");
        match write_batch(&mut writer, &batch).await {
            Ok(()) => {
                for packet in batch {
                    if let Some(done) = packet.written {
                        let _ = done.send(Ok(Receipt {
                            sequence: packet.sequence,
                            attempts: 1,
                        }));
                    }
                }
            }
            Err(e) => {
                for packet in batch {
                    if let Some(done) = packet.written {
                        let _ = done.send(Err(PcomError::LinkClosed));
                    }
                }
                rx.close();
                while let Ok(packet) = rx.try_recv() {
                    if let Some(done) = packet.written {
                        let _ = done.send(Err(PcomError::LinkClosed));
                    }
                }
                return Err(e);
            }
        }
    }
}

/// Write a batch of packets with scatter/gather I/O.
async fn write_batch<W>(writer: &mut W, batch: &[OutboundPacket]) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    if batch.is_empty() {
        return Ok(());
    }

    let total_size: usize = batch.iter().map(OutboundPacket::size).sum();
    let mut total_written = 0;

    while total_written < total_size {
        let slices = build_remaining_slices(batch, total_written);
        if slices.is_empty() {
            break;
        }
        let written = writer.write_vectored(&slices).await?;
        if written == 0 {
            return Err(PcomError::Io(std::io::Error::new(
                std::io::ErrorKind::WriteZero,
                "write_vectored returned 0",
            )));
        }
        total_written += written;
    }

    writer.flush().await?;
    Ok(())
}

/// IoSlices for whatever is left after `skip_bytes` were written.
fn build_remaining_slices(batch: &[OutboundPacket], skip_bytes: usize) -> Vec<IoSlice<'_>> {
    let mut slices = Vec::with_capacity(batch.len());
    let mut offset = 0;

    for packet in batch {
        let end = offset + packet.size();
        if skip_bytes < end && !packet.bytes.is_empty() {
            let start = skip_bytes.saturating_sub(offset);
            slices.push(IoSlice::new(&packet.bytes[start..]));
        }
        offset = end;
    }

    slices
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{ack_or_nak, wrap};
    use std::io::Cursor;
    use tokio::io::{duplex, AsyncReadExt};
    use tokio::sync::oneshot;

    fn packet(seq: u8, payload: &[u8]) -> OutboundPacket {
        OutboundPacket::new(wrap(payload, seq, true).unwrap(), seq)
    }

    #[test]
    fn test_build_remaining_slices_no_skip() {
        let batch = vec![packet(0, b"hello"), packet(1, b"x")];
        let slices = build_remaining_slices(&batch, 0);
        assert_eq!(slices.len(), 2);
        assert_eq!(slices[0].len(), batch[0].size());
    }

    #[test]
    fn test_build_remaining_slices_partial_first() {
        let batch = vec![packet(0, b"hello"), packet(1, b"x")];
        let slices = build_remaining_slices(&batch, 3);
        assert_eq!(slices.len(), 2);
        assert_eq!(slices[0].len(), batch[0].size() - 3);
        assert_eq!(slices[1].len(), batch[1].size());
    }

    #[test]
    fn test_build_remaining_slices_skip_first() {
        let batch = vec![packet(0, b"hello"), packet(1, b"x")];
        let slices = build_remaining_slices(&batch, batch[0].size());
        assert_eq!(slices.len(), 1);
        assert_eq!(slices[0].len(), batch[1].size());
    }

    #[tokio::test]
    async fn test_write_batch_preserves_order() {
        let mut buf = Cursor::new(Vec::new());
        let batch =
            vec![packet(0, b"a"), OutboundPacket::new(ack_or_nak(5, true), 5), packet(1, b"b")];

        write_batch(&mut buf, &batch).await.unwrap();

        let expected: Vec<u8> = batch.iter().flat_map(|p| p.bytes.iter().copied()).collect();
        assert_eq!(buf.into_inner(), expected);
    }

    #[tokio::test]
    async fn test_writer_resolves_completion_after_write() {
        let (client, mut server) = duplex(4096);
        let (handle, _task) = spawn_writer_task(client, WriterConfig::default());

        let bytes = wrap(b"evt", 3, false).unwrap();
        let (tx, rx) = oneshot::channel();
        handle
            .send(OutboundPacket::with_completion(bytes.clone(), 3, tx))
            .await
            .unwrap();

        let receipt = rx.await.unwrap().unwrap();
        assert_eq!(receipt, Receipt { sequence: 3, attempts: 1 });

        let mut buf = vec![0u8; bytes.len()];
        server.read_exact(&mut buf).await.unwrap();
        assert_eq!(buf, bytes.as_ref());
    }

    #[tokio::test]
    async fn test_writer_batching() {
        let (client, mut server) = duplex(4096);
        let (handle, _task) = spawn_writer_task(client, WriterConfig::default());

        let mut expected = Vec::new();
        for seq in 0..10u8 {
            let p = packet(seq, &[seq]);
            expected.extend_from_slice(&p.bytes);
            handle.send(p).await.unwrap();
        }

        let mut buf = vec![0u8; expected.len()];
        server.read_exact(&mut buf).await.unwrap();
        assert_eq!(buf, expected);
    }

    #[tokio::test]
    async fn test_writer_error_fails_pending_completions() {
        let (client, server) = duplex(64);
        drop(server);
        let (handle, task) = spawn_writer_task(client, WriterConfig::default());

        let (tx, rx) = oneshot::channel();
        handle
            .send(OutboundPacket::with_completion(wrap(b"x", 0, false).unwrap(), 0, tx))
            .await
            .unwrap();

        assert!(matches!(rx.await.unwrap(), Err(PcomError::LinkClosed)));
        assert!(task.await.unwrap().is_err());
    }

    #[tokio::test]
    async fn test_writer_shutdown_on_channel_close() {
        let (client, _server) = duplex(4096);
        let (handle, task) = spawn_writer_task(client, WriterConfig::default());
        drop(handle);
        assert!(task.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_send_after_writer_failure() {
        let (client, server) = duplex(64);
        drop(server);
        let (handle, task) = spawn_writer_task(client, WriterConfig::default());
        handle.send(packet(0, b"x")).await.unwrap();
        let _ = task.await;

        assert!(matches!(handle.send(packet(1, b"y")).await, Err(PcomError::LinkClosed)));
    }
}
