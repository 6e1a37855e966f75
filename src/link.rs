//! Link builder and actor.
//!
//! A link owns one byte transport. [`LinkBuilder::start`] splits the work
//! over three tasks:
//!
//! ```text
//!                   ┌──────────── Link (cloneable) ────────────┐
//!                   │ send / submit / send_wire / close         │
//!                   └──────────────────┬────────────────────────┘
//!                                      │ mpsc<Command>
//!  reader ─► read task ─► mpsc<Bytes> ─► link actor ─► writer task ─► writer
//!            (FrameBuffer)               │ Translator
//!                                        │ DeliveryEngine + retry timer
//!                                        └─► Inbound (logical messages)
//! ```
//!
//! The actor is the only place that touches the sequence counter, the
//! outstanding delivery and the id table, so all of them are processed
//! strictly one event at a time.
//!
//! # Example
//!
//! ```ignore
//! use pcom_link::{LinkBuilder, LogicalMessage};
//!
//! let (link, mut inbound) = LinkBuilder::new()
//!     .registry(registry)
//!     .max_retries(5)
//!     .start(read_half, write_half);
//!
//! link.send(LogicalMessage::command(0x0100u16, "ui", "home")).await?;
//! while let Some(msg) = inbound.recv().await {
//!     println!("{msg:?}");
//! }
//! ```

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};
use tokio::sync::{mpsc, oneshot, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, error, info, warn};

use crate::delivery::{
    Completion, DeliveryConfig, DeliveryEngine, DeliveryReceiver, Outbound, Receipt,
    DEFAULT_ACK_TIMEOUT, DEFAULT_MAX_RETRIES,
};
use crate::error::{PcomError, Result};
use crate::ids::IdTable;
use crate::protocol::{
    ack_or_nak, unwrap, FrameBuffer, MessageType, Packet, WireMessage, DEFAULT_MAX_FRAME_SIZE,
};
use crate::registry::ServiceRegistry;
use crate::translate::{LogicalMessage, Translator};
use crate::writer::{spawn_writer_task, OutboundPacket, WriterConfig, WriterHandle};

/// Event code with which a peer announces it restarted.
pub const RESET_EVENT: u16 = 0xFEFE;

/// Default depth of the command queue into the actor.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 64;

/// Default depth of the inbound message queue.
pub const DEFAULT_INBOUND_CAPACITY: usize = 256;

const READ_BUFFER_SIZE: usize = 64 * 1024;

/// Link configuration.
#[derive(Debug, Clone)]
pub struct LinkConfig {
    /// Time to wait for an ACK before retransmitting.
    pub ack_timeout: Duration,
    /// Retransmissions after the first send.
    pub max_retries: u8,
    /// Depth of the command queue and of the writer queue.
    pub channel_capacity: usize,
    /// Inbound messages held until [`Inbound::recv`]; more are dropped.
    pub inbound_capacity: usize,
    /// Longest escaped frame the reader reassembles.
    pub max_frame_size: usize,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            ack_timeout: DEFAULT_ACK_TIMEOUT,
            max_retries: DEFAULT_MAX_RETRIES,
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
            inbound_capacity: DEFAULT_INBOUND_CAPACITY,
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
        }
    }
}

/// Builder for configuring and starting a [`Link`].
#[derive(Debug, Default)]
pub struct LinkBuilder {
    config: LinkConfig,
    registry: ServiceRegistry,
    ids: IdTable,
}

impl LinkBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the whole configuration.
    pub fn config(mut self, config: LinkConfig) -> Self {
        self.config = config;
        self
    }

    /// Default: 500 ms
    pub fn ack_timeout(mut self, timeout: Duration) -> Self {
        self.config.ack_timeout = timeout;
        self
    }

    /// Default: 3
    pub fn max_retries(mut self, retries: u8) -> Self {
        self.config.max_retries = retries;
        self
    }

    /// Default: 64
    pub fn channel_capacity(mut self, capacity: usize) -> Self {
        self.config.channel_capacity = capacity;
        self
    }

    /// Default: 256
    pub fn inbound_capacity(mut self, capacity: usize) -> Self {
        self.config.inbound_capacity = capacity;
        self
    }

    pub fn max_frame_size(mut self, size: usize) -> Self {
        self.config.max_frame_size = size;
        self
    }

    /// Services known up front, e.g. loaded with
    /// [`ServiceRegistry::from_json`].
    pub fn registry(mut self, registry: ServiceRegistry) -> Self {
        self.registry = registry;
        self
    }

    /// Names already bound to ids.
    pub fn ids(mut self, ids: IdTable) -> Self {
        self.ids = ids;
        self
    }

    /// Spawn the link tasks on the current tokio runtime.
    ///
    /// The link closes when [`Link::close`] is called, when the reader hits
    /// end of stream or an error, or when the writer fails.
    pub fn start<R, W>(self, reader: R, writer: W) -> (Link, Inbound)
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let config = self.config;
        let capacity = config.channel_capacity.max(1);

        let (writer, writer_task) = spawn_writer_task(
            writer,
            WriterConfig {
                channel_capacity: capacity,
            },
        );

        let (frame_tx, frame_rx) = mpsc::channel(capacity);
        let frame_buffer = FrameBuffer::with_max_frame(config.max_frame_size);
        let reader_task = tokio::spawn(async move {
            if let Err(e) = read_loop(reader, frame_buffer, frame_tx).await {
                error!("Read loop error: {}", e);
            }
        });

        let (command_tx, command_rx) = mpsc::channel(capacity);
        let (inbound_tx, inbound_rx) = mpsc::channel(config.inbound_capacity.max(1));
        let registry = Arc::new(RwLock::new(self.registry));

        let actor = LinkActor {
            translator: Translator::with_ids(self.ids),
            engine: DeliveryEngine::new(DeliveryConfig {
                ack_timeout: config.ack_timeout,
                max_retries: config.max_retries,
            }),
            registry: registry.clone(),
            writer,
            inbound: inbound_tx,
            last_received: None,
        };
        tokio::spawn(actor.run(command_rx, frame_rx, reader_task));
        tokio::spawn(async move {
            match writer_task.await {
                Ok(Err(e)) => error!("Writer error: {}", e),
                Err(e) => error!("Writer task failed: {}", e),
                Ok(Ok(())) => debug!("Writer finished"),
            }
        });

        (
            Link {
                commands: command_tx,
                registry,
            },
            Inbound { rx: inbound_rx },
        )
    }
}

/// Requests from [`Link`] handles to the actor.
enum Command {
    Send {
        message: LogicalMessage,
        result: Completion,
    },
    SendWire {
        message: WireMessage,
        result: Completion,
    },
    Close {
        done: oneshot::Sender<()>,
    },
}

/// Handle to a running link.
///
/// Cheap to clone; every clone feeds the same FIFO.
#[derive(Clone, Debug)]
pub struct Link {
    commands: mpsc::Sender<Command>,
    registry: Arc<RwLock<ServiceRegistry>>,
}

impl Link {
    pub fn builder() -> LinkBuilder {
        LinkBuilder::new()
    }

    /// Send a logical message and wait for the outcome.
    ///
    /// Messages with `response_required` resolve when the peer ACKs them;
    /// others resolve once written.
    ///
    /// # Errors
    ///
    /// Translation errors (`UnknownTarget`, `TypeMismatch`, `Encoding`,
    /// `IdSpaceExhausted`) without anything being transmitted, then
    /// `DeliveryTimeout`, `DeliveryRejected` or `LinkClosed`.
    pub async fn send(&self, message: LogicalMessage) -> Result<Receipt> {
        let rx = self.submit(message).await?;
        rx.await.unwrap_or(Err(PcomError::LinkClosed))
    }

    /// Queue a logical message and return its result channel without
    /// waiting for delivery.
    pub async fn submit(&self, message: LogicalMessage) -> Result<DeliveryReceiver> {
        let (result, rx) = oneshot::channel();
        self.commands
            .send(Command::Send { message, result })
            .await
            .map_err(|_| PcomError::LinkClosed)?;
        Ok(rx)
    }

    /// Send an already translated wire record.
    pub async fn send_wire(&self, message: WireMessage) -> Result<Receipt> {
        let (result, rx) = oneshot::channel();
        self.commands
            .send(Command::SendWire { message, result })
            .await
            .map_err(|_| PcomError::LinkClosed)?;
        rx.await.unwrap_or(Err(PcomError::LinkClosed))
    }

    /// Close the link. Pending and queued deliveries fail with
    /// `LinkClosed`, as does every later send. Idempotent.
    pub async fn close(&self) {
        let (done, rx) = oneshot::channel();
        if self.commands.send(Command::Close { done }).await.is_ok() {
            let _ = rx.await;
        }
    }

    pub fn is_closed(&self) -> bool {
        self.commands.is_closed()
    }

    /// The registry used to translate messages. Updates apply to the next
    /// message translated.
    pub fn registry(&self) -> Arc<RwLock<ServiceRegistry>> {
        self.registry.clone()
    }
}

/// Messages received from the peer.
#[derive(Debug)]
pub struct Inbound {
    rx: mpsc::Receiver<LogicalMessage>,
}

impl Inbound {
    /// Next inbound message, or `None` once the link is closed and drained.
    pub async fn recv(&mut self) -> Option<LogicalMessage> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<LogicalMessage> {
        self.rx.try_recv().ok()
    }
}

async fn read_loop<R>(mut reader: R, mut frames: FrameBuffer, tx: mpsc::Sender<Bytes>) -> Result<()>
where
    R: AsyncRead + Unpin,
{
    let mut buf = vec![0u8; READ_BUFFER_SIZE];
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            debug!("Transport reached end of stream");
            return Ok(());
        }
        for frame in frames.push(&buf[..n]) {
            if tx.send(frame).await.is_err() {
                return Ok(());
            }
        }
    }
}

/// Sleeps until the retry deadline, forever when nothing is outstanding.
async fn expiry(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

struct LinkActor {
    translator: Translator,
    engine: DeliveryEngine,
    registry: Arc<RwLock<ServiceRegistry>>,
    writer: WriterHandle,
    inbound: mpsc::Sender<LogicalMessage>,
    /// Sequence and payload of the last ack-required packet received.
    last_received: Option<(u8, Bytes)>,
}

impl LinkActor {
    async fn run(
        mut self,
        mut commands: mpsc::Receiver<Command>,
        mut frames: mpsc::Receiver<Bytes>,
        reader_task: JoinHandle<()>,
    ) {
        let mut close_done = None;

        loop {
            let step = tokio::select! {
                command = commands.recv() => match command {
                    Some(Command::Send { message, result }) => {
                        self.handle_send(message, result).await
                    }
                    Some(Command::SendWire { message, result }) => {
                        self.submit_wire(&message, result).await
                    }
                    Some(Command::Close { done }) => {
                        close_done = Some(done);
                        break;
                    }
                    None => break,
                },
                frame = frames.recv() => match frame {
                    Some(frame) => self.handle_frame(frame).await,
                    None => break,
                },
                () = expiry(self.engine.deadline()) => {
                    let out = self.engine.on_timeout(Instant::now());
                    self.write(out).await
                }
            };

            if let Err(e) = step {
                error!("Link writer failed: {}", e);
                break;
            }
        }

        info!("Link closing");
        self.engine.close();
        commands.close();
        reader_task.abort();
        drop(self);
        if let Some(done) = close_done {
            let _ = done.send(());
        }
        while let Some(command) = commands.recv().await {
            if let Command::Close { done } = command {
                let _ = done.send(());
            }
        }
    }

    async fn handle_send(&mut self, message: LogicalMessage, result: Completion) -> Result<()> {
        let wire = {
            let registry = self.registry.read().await;
            self.translator.to_wire(&message, &registry)
        };
        match wire {
            Ok(wire) => self.submit_wire(&wire, result).await,
            Err(e) => {
                debug!(error = %e, "Message not translated");
                let _ = result.send(Err(e));
                Ok(())
            }
        }
    }

    async fn submit_wire(&mut self, wire: &WireMessage, result: Completion) -> Result<()> {
        let payload = match wire.encode() {
            Ok(payload) => payload,
            Err(e) => {
                let _ = result.send(Err(e));
                return Ok(());
            }
        };
        let out = self
            .engine
            .enqueue(&payload, wire.attributes.response_required, result, Instant::now());
        self.write(out).await
    }

    async fn handle_frame(&mut self, frame: Bytes) -> Result<()> {
        let packet = match unwrap(&frame) {
            Ok(packet) => packet,
            Err(e) => {
                warn!(error = %e, len = frame.len(), "Dropping bad packet");
                return Ok(());
            }
        };

        match packet {
            Packet::Ack { sequence } => {
                let out = self.engine.on_ack(sequence, Instant::now());
                self.write(out).await
            }
            Packet::Nak { sequence, status } => {
                let out = self.engine.on_nak(sequence, status, Instant::now());
                self.write(out).await
            }
            Packet::Data {
                sequence,
                ack_required,
                payload,
            } => self.handle_data(sequence, ack_required, payload).await,
        }
    }

    async fn handle_data(
        &mut self,
        sequence: u8,
        ack_required: bool,
        payload: Bytes,
    ) -> Result<()> {
        let retransmission = ack_required
            && self
                .last_received
                .as_ref()
                .is_some_and(|(seq, last)| *seq == sequence && *last == payload);

        if retransmission {
            debug!(sequence, "Re-acknowledging retransmitted packet");
            return self.acknowledge(sequence).await;
        }

        let wire = match WireMessage::decode(&payload) {
            Ok(wire) => wire,
            Err(e) => {
                warn!(sequence, error = %e, "Dropping undecodable message");
                return Ok(());
            }
        };

        if ack_required {
            self.acknowledge(sequence).await?;
            self.last_received = Some((sequence, payload));
        }

        if wire.message_type == MessageType::Event && wire.response_code == RESET_EVENT {
            info!(from = wire.from, "Peer reset, restarting sequence numbers");
            self.engine.reset_sequence();
        }

        let message = {
            let registry = self.registry.read().await;
            self.translator.from_wire(&wire, &registry)
        };
        match self.inbound.try_send(message) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(message)) => {
                warn!(kind = ?message.kind, "Inbound queue full, dropping message");
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!("Inbound receiver dropped");
            }
        }
        Ok(())
    }

    async fn acknowledge(&self, sequence: u8) -> Result<()> {
        self.writer
            .send(OutboundPacket::new(ack_or_nak(sequence, true), sequence))
            .await
    }

    async fn write(&self, out: Vec<Outbound>) -> Result<()> {
        for outbound in out {
            let packet = match outbound.completion {
                Some(done) => {
                    OutboundPacket::with_completion(outbound.packet, outbound.sequence, done)
                }
                None => OutboundPacket::new(outbound.packet, outbound.sequence),
            };
            self.writer.send(packet).await?;
        }
        Ok(())
    }
}
