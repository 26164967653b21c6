//! Multiplexer core
//!
//! Two cooperative tasks share the tunnel transport: the reader task
//! decodes frames and routes them to channels, the writer task drains a
//! single FIFO of outgoing frames. Every mutable structure is owned by
//! exactly one task; the channel table and ping table sit behind short
//! critical sections that never span an await point.

use super::channel::{channel_pair, ChannelHandle, WriteOp};
use super::frame::{ChannelId, Frame, FrameType, EXTRA_LEN, HEADER_LEN, MAX_HOSTNAME_LEN};
use super::{
    Channel, MultiplexerError, ProtocolError, INCOMING_HIGH_WATER, MAX_FRAME, PING_TIMEOUT,
    SHUTDOWN_DRAIN,
};
use crate::crypto::{padded_len, FrameDecryptor, FrameEncryptor};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

/// Capacity of the outgoing frame FIFO
const WRITE_QUEUE_DEPTH: usize = 64;

/// Capacity of the remotely-opened channel queue
const NEW_CHANNEL_DEPTH: usize = 8;

type PingToken = [u8; EXTRA_LEN - 1];
type ChannelTable = Arc<Mutex<HashMap<ChannelId, ChannelHandle>>>;
type PingTable = Arc<Mutex<HashMap<PingToken, oneshot::Sender<()>>>>;

/// A framed, flow-controlled, encrypted stream-of-streams over one transport
pub struct Multiplexer {
    frame_tx: mpsc::Sender<WriteOp>,
    channels: ChannelTable,
    pings: PingTable,
    new_rx: tokio::sync::Mutex<mpsc::Receiver<Channel>>,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
    closing: AtomicBool,
    reader_task: JoinHandle<()>,
    writer_task: Mutex<Option<JoinHandle<()>>>,
}

impl Multiplexer {
    /// Spawn the reader and writer tasks over `stream` and return the handle
    pub fn start<S>(stream: S, key: &[u8], iv: &[u8]) -> Result<Self, MultiplexerError>
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let encryptor = FrameEncryptor::new(key, iv).map_err(ProtocolError::Crypto)?;
        let decryptor = FrameDecryptor::new(key, iv).map_err(ProtocolError::Crypto)?;

        let (read_half, write_half) = tokio::io::split(stream);
        let (frame_tx, frame_rx) = mpsc::channel(WRITE_QUEUE_DEPTH);
        let (new_tx, new_rx) = mpsc::channel(NEW_CHANNEL_DEPTH);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let channels: ChannelTable = Arc::new(Mutex::new(HashMap::new()));
        let pings: PingTable = Arc::new(Mutex::new(HashMap::new()));

        let writer_task = tokio::spawn({
            let shutdown_tx = shutdown_tx.clone();
            let shutdown_rx = shutdown_rx.clone();
            async move {
                write_loop(write_half, encryptor, frame_rx, shutdown_rx).await;
                let _ = shutdown_tx.send(true);
            }
        });

        let reader_task = tokio::spawn({
            let channels = Arc::clone(&channels);
            let pings = Arc::clone(&pings);
            let frame_tx = frame_tx.clone();
            let shutdown_tx = shutdown_tx.clone();
            async move {
                if let Err(err) =
                    read_loop(read_half, decryptor, &channels, &pings, &frame_tx, &new_tx).await
                {
                    warn!("Multiplexer terminated: {}", err);
                }
                teardown(&channels, &pings);
                let _ = shutdown_tx.send(true);
            }
        });

        Ok(Self {
            frame_tx,
            channels,
            pings,
            new_rx: tokio::sync::Mutex::new(new_rx),
            shutdown_tx,
            shutdown_rx,
            closing: AtomicBool::new(false),
            reader_task,
            writer_task: Mutex::new(Some(writer_task)),
        })
    }

    /// True until either task has torn the session down
    pub fn is_connected(&self) -> bool {
        !*self.shutdown_rx.borrow()
    }

    /// Number of live channels
    pub fn channel_count(&self) -> usize {
        self.channels.lock().unwrap().len()
    }

    /// Open a fresh channel for `hostname` and announce it to the remote
    pub async fn create_channel(&self, hostname: &str) -> Result<Channel, MultiplexerError> {
        if !self.is_connected() {
            return Err(MultiplexerError::TransportClosed);
        }
        if hostname.is_empty() || hostname.len() > MAX_HOSTNAME_LEN {
            return Err(ProtocolError::MalformedFrame(FrameType::New).into());
        }

        let (id, channel) = loop {
            let id = ChannelId::random();
            if self.channels.lock().unwrap().contains_key(&id) {
                continue;
            }
            let (handle, channel) = channel_pair(id, hostname.to_string(), self.frame_tx.clone());
            self.channels.lock().unwrap().insert(id, handle);
            break (id, channel);
        };

        debug!(channel = %id, hostname, "Opening channel");
        if self
            .frame_tx
            .send(WriteOp::plain(Frame::new_channel(id, hostname)))
            .await
            .is_err()
        {
            self.channels.lock().unwrap().remove(&id);
            return Err(MultiplexerError::TransportClosed);
        }
        Ok(channel)
    }

    /// Next remotely-opened channel, in arrival order
    pub async fn wait_for_channel(&self) -> Result<Channel, MultiplexerError> {
        let mut new_rx = self.new_rx.lock().await;
        new_rx.recv().await.ok_or(MultiplexerError::TransportClosed)
    }

    /// Probe liveness with the default deadline
    pub async fn ping(&self) -> Result<(), MultiplexerError> {
        self.ping_timeout(PING_TIMEOUT).await
    }

    /// Probe liveness; fails if no matching echo arrives within `deadline`
    pub async fn ping_timeout(&self, deadline: Duration) -> Result<(), MultiplexerError> {
        let (frame, token) = Frame::ping_request();
        let (tx, rx) = oneshot::channel();
        self.pings.lock().unwrap().insert(token, tx);

        if self.frame_tx.send(WriteOp::plain(frame)).await.is_err() {
            self.pings.lock().unwrap().remove(&token);
            return Err(MultiplexerError::TransportClosed);
        }

        match tokio::time::timeout(deadline, rx).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(MultiplexerError::TransportClosed),
            Err(_) => {
                self.pings.lock().unwrap().remove(&token);
                Err(MultiplexerError::PingTimeout)
            }
        }
    }

    /// Half-close every channel, drain pending writes within the shutdown
    /// deadline, then close the transport. Idempotent.
    pub async fn close(&self) {
        if self.closing.swap(true, Ordering::SeqCst) {
            return;
        }

        let shareds: Vec<_> = self
            .channels
            .lock()
            .unwrap()
            .values()
            .map(|handle| Arc::clone(&handle.shared))
            .collect();
        // Best effort: a stalled transport must not wedge shutdown, and the
        // writer's drain deadline bounds the rest
        for shared in shareds {
            if shared.local_open.swap(false, Ordering::SeqCst) {
                let _ = self
                    .frame_tx
                    .try_send(WriteOp::plain(Frame::close(shared.id)));
            }
        }

        teardown(&self.channels, &self.pings);
        let _ = self.shutdown_tx.send(true);
        self.reader_task.abort();

        let writer = self.writer_task.lock().unwrap().take();
        if let Some(task) = writer {
            let _ = task.await;
        }
    }

    /// Resolve once the session is torn down, whatever the cause
    pub async fn wait_closed(&self) {
        let mut rx = self.shutdown_rx.clone();
        while !*rx.borrow() {
            if rx.changed().await.is_err() {
                break;
            }
        }
    }
}

impl Drop for Multiplexer {
    fn drop(&mut self) {
        teardown(&self.channels, &self.pings);
        let _ = self.shutdown_tx.send(true);
        self.reader_task.abort();
    }
}

/// Invalidate every channel and pending ping; safe to call repeatedly
fn teardown(channels: &ChannelTable, pings: &PingTable) {
    let handles: Vec<(ChannelId, ChannelHandle)> =
        channels.lock().unwrap().drain().collect();
    for (_, handle) in &handles {
        handle.shared.remote_open.store(false, Ordering::SeqCst);
        handle.shared.local_open.store(false, Ordering::SeqCst);
        // Unblock writers parked on PAUSE or on exhausted write credit
        handle.shared.pause_tx.send_replace(false);
        handle.shared.write_credit.close();
    }
    pings.lock().unwrap().clear();
}

/// Remove a channel and tell the remote it is gone
async fn close_channel(channels: &ChannelTable, id: ChannelId, frame_tx: &mpsc::Sender<WriteOp>) {
    let handle = channels.lock().unwrap().remove(&id);
    if let Some(handle) = handle {
        handle.shared.remote_open.store(false, Ordering::SeqCst);
        if handle.shared.local_open.swap(false, Ordering::SeqCst) {
            let _ = frame_tx.send(WriteOp::plain(Frame::close(id))).await;
        }
    }
}

async fn read_loop<R: AsyncRead + Unpin>(
    mut reader: R,
    mut crypto: FrameDecryptor,
    channels: &ChannelTable,
    pings: &PingTable,
    frame_tx: &mpsc::Sender<WriteOp>,
    new_tx: &mpsc::Sender<Channel>,
) -> Result<(), MultiplexerError> {
    loop {
        let mut header = [0u8; HEADER_LEN];
        if let Err(err) = reader.read_exact(&mut header).await {
            if err.kind() == std::io::ErrorKind::UnexpectedEof {
                debug!("Transport EOF");
                return Ok(());
            }
            return Err(err.into());
        }
        let header = Frame::decode_header(&mut crypto, &mut header)?;

        let frame = if header.payload_len == 0 {
            Frame::decode_payload(&mut crypto, header, Vec::new())?
        } else {
            let mut ciphertext = vec![0u8; padded_len(header.payload_len)];
            reader.read_exact(&mut ciphertext).await?;
            Frame::decode_payload(&mut crypto, header, ciphertext)?
        };

        dispatch(frame, channels, pings, frame_tx, new_tx).await?;
    }
}

async fn dispatch(
    frame: Frame,
    channels: &ChannelTable,
    pings: &PingTable,
    frame_tx: &mpsc::Sender<WriteOp>,
    new_tx: &mpsc::Sender<Channel>,
) -> Result<(), MultiplexerError> {
    match frame.frame_type {
        FrameType::New => {
            let hostname = frame.hostname()?;
            if channels.lock().unwrap().contains_key(&frame.channel) {
                return Err(ProtocolError::DuplicateChannel(frame.channel).into());
            }
            let (handle, channel) = channel_pair(frame.channel, hostname, frame_tx.clone());
            channels.lock().unwrap().insert(frame.channel, handle);
            debug!(channel = %frame.channel, "Remote opened channel");
            if new_tx.send(channel).await.is_err() {
                // Nobody accepts channels on this side
                close_channel(channels, frame.channel, frame_tx).await;
            }
        }

        FrameType::Data => {
            let len = frame.payload.len();
            let mut pause_needed = false;
            let mut consumer_gone = false;
            {
                let table = channels.lock().unwrap();
                match table.get(&frame.channel) {
                    Some(handle) => {
                        let buffered = handle.shared.buffered.load(Ordering::SeqCst);
                        if buffered + len > INCOMING_HIGH_WATER + MAX_FRAME {
                            warn!(channel = %frame.channel, buffered, "Incoming queue overrun, dropping payload");
                        } else if handle.incoming.send(frame.payload).is_ok() {
                            let now = handle.shared.buffered.fetch_add(len, Ordering::SeqCst) + len;
                            if now >= INCOMING_HIGH_WATER
                                && !handle.shared.pause_sent.swap(true, Ordering::SeqCst)
                            {
                                pause_needed = true;
                            }
                        } else {
                            consumer_gone = true;
                        }
                    }
                    None => {
                        trace!(channel = %frame.channel, "Data for unknown channel");
                    }
                }
            }
            if pause_needed {
                debug!(channel = %frame.channel, "Incoming queue above high-water, pausing remote");
                frame_tx
                    .send(WriteOp::plain(Frame::pause(frame.channel)))
                    .await
                    .map_err(|_| MultiplexerError::TransportClosed)?;
            }
            if consumer_gone {
                debug!(channel = %frame.channel, "Local consumer gone, closing channel");
                close_channel(channels, frame.channel, frame_tx).await;
            }
        }

        FrameType::Close => {
            let handle = channels.lock().unwrap().remove(&frame.channel);
            match handle {
                Some(handle) => {
                    debug!(channel = %frame.channel, "Remote closed channel");
                    handle.shared.remote_open.store(false, Ordering::SeqCst);
                    // Dropping the handle EOFs the reader once the queue drains
                }
                None => trace!(channel = %frame.channel, "Close for unknown channel"),
            }
        }

        FrameType::Pause | FrameType::Resume => {
            let paused = frame.frame_type == FrameType::Pause;
            let table = channels.lock().unwrap();
            match table.get(&frame.channel) {
                Some(handle) => {
                    trace!(channel = %frame.channel, paused, "Remote flow control");
                    handle.shared.pause_tx.send_replace(paused);
                }
                None => trace!(channel = %frame.channel, "Flow control for unknown channel"),
            }
        }

        FrameType::Ping => {
            if frame.extra[0] == 0 {
                frame_tx
                    .send(WriteOp::plain(Frame::ping_reply(&frame.extra)))
                    .await
                    .map_err(|_| MultiplexerError::TransportClosed)?;
            } else {
                let mut token = [0u8; EXTRA_LEN - 1];
                token.copy_from_slice(&frame.extra[1..]);
                match pings.lock().unwrap().remove(&token) {
                    Some(waiter) => {
                        let _ = waiter.send(());
                    }
                    None => trace!("Unmatched ping response"),
                }
            }
        }
    }
    Ok(())
}

async fn write_loop<W: AsyncWrite + Unpin>(
    mut writer: W,
    mut crypto: FrameEncryptor,
    mut frame_rx: mpsc::Receiver<WriteOp>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            op = frame_rx.recv() => match op {
                Some(op) => {
                    if let Err(err) = write_op(&mut writer, &mut crypto, op).await {
                        debug!("Transport write failed: {}", err);
                        return;
                    }
                }
                None => break,
            },
            changed = shutdown_rx.changed() => {
                if changed.is_err() || *shutdown_rx.borrow() {
                    break;
                }
            }
        }
    }

    // Flush frames that were queued before shutdown, bounded by the drain
    // deadline, then close the transport
    let drain = async {
        while let Ok(op) = frame_rx.try_recv() {
            if write_op(&mut writer, &mut crypto, op).await.is_err() {
                break;
            }
        }
        let _ = writer.shutdown().await;
    };
    let _ = tokio::time::timeout(SHUTDOWN_DRAIN, drain).await;
}

async fn write_op<W: AsyncWrite + Unpin>(
    writer: &mut W,
    crypto: &mut FrameEncryptor,
    op: WriteOp,
) -> Result<(), MultiplexerError> {
    let wire = op.frame.encode(crypto)?;
    writer.write_all(&wire).await?;
    if let Some(credit) = op.credit {
        credit.release();
    }
    Ok(())
}
