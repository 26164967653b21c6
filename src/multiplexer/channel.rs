//! Multiplexed channel implementation
//!
//! A channel is one bidirectional logical stream inside a peer's tunnel.
//! The reader half drains the incoming byte queue filled by the
//! multiplexer's reader task; the writer half fragments outgoing data into
//! DATA frames and submits them to the shared outgoing FIFO, gated by the
//! per-channel write credit and the remote's PAUSE state.

use super::frame::{ChannelId, Frame};
use super::{MultiplexerError, INCOMING_LOW_WATER, MAX_DATA, OUTGOING_SOFT_CAP};
use bytes::Bytes;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, watch, Semaphore};

/// An entry in the multiplexer's outgoing FIFO
pub(crate) struct WriteOp {
    pub frame: Frame,
    /// Write credit to return to the owning channel once flushed
    pub credit: Option<WriteCredit>,
}

impl WriteOp {
    pub fn plain(frame: Frame) -> Self {
        Self {
            frame,
            credit: None,
        }
    }
}

pub(crate) struct WriteCredit {
    shared: Arc<ChannelShared>,
    amount: u32,
}

impl WriteCredit {
    /// Return the credit after the frame left the process
    pub fn release(self) {
        self.shared.write_credit.add_permits(self.amount as usize);
    }
}

/// State shared between the channel halves and the multiplexer tasks
pub(crate) struct ChannelShared {
    pub id: ChannelId,
    pub hostname: String,
    pub local_open: AtomicBool,
    pub remote_open: AtomicBool,
    /// Set once a PAUSE left for the remote, cleared by the matching RESUME
    pub pause_sent: AtomicBool,
    /// Bytes sitting in the incoming queue
    pub buffered: AtomicUsize,
    /// Remaining bytes this channel may keep in the outgoing FIFO
    pub write_credit: Semaphore,
    /// True while the remote asked us to stop writing
    pub pause_tx: watch::Sender<bool>,
    pub frame_tx: mpsc::Sender<WriteOp>,
}

/// The multiplexer reader task's grip on a channel
pub(crate) struct ChannelHandle {
    pub shared: Arc<ChannelShared>,
    pub incoming: mpsc::UnboundedSender<Bytes>,
}

/// Build a connected (handle, channel) pair for a fresh channel id
pub(crate) fn channel_pair(
    id: ChannelId,
    hostname: String,
    frame_tx: mpsc::Sender<WriteOp>,
) -> (ChannelHandle, Channel) {
    let (pause_tx, pause_rx) = watch::channel(false);
    let (incoming_tx, incoming_rx) = mpsc::unbounded_channel();

    let shared = Arc::new(ChannelShared {
        id,
        hostname,
        local_open: AtomicBool::new(true),
        remote_open: AtomicBool::new(true),
        pause_sent: AtomicBool::new(false),
        buffered: AtomicUsize::new(0),
        write_credit: Semaphore::new(OUTGOING_SOFT_CAP),
        pause_tx,
        frame_tx,
    });

    let handle = ChannelHandle {
        shared: Arc::clone(&shared),
        incoming: incoming_tx,
    };
    let channel = Channel {
        reader: ChannelReader {
            shared: Arc::clone(&shared),
            incoming: incoming_rx,
        },
        writer: ChannelWriter { shared, pause_rx },
    };

    (handle, channel)
}

/// A bidirectional logical stream inside a peer's multiplexer
pub struct Channel {
    reader: ChannelReader,
    writer: ChannelWriter,
}

impl Channel {
    pub fn id(&self) -> ChannelId {
        self.writer.shared.id
    }

    /// Hostname this channel was opened for
    pub fn hostname(&self) -> &str {
        &self.writer.shared.hostname
    }

    /// Next chunk of incoming bytes; `None` once the remote closed and the
    /// queue is drained
    pub async fn read(&mut self) -> Option<Bytes> {
        self.reader.read().await
    }

    /// Queue `data` for transmission, fragmented to DATA frames
    pub async fn write(&mut self, data: &[u8]) -> Result<(), MultiplexerError> {
        self.writer.write(data).await
    }

    /// Half-close this channel; idempotent, emits at most one CLOSE frame
    pub async fn close(&mut self) {
        self.writer.close().await;
    }

    /// Split into independently owned reader and writer halves
    pub fn split(self) -> (ChannelReader, ChannelWriter) {
        (self.reader, self.writer)
    }
}

/// Reading half of a channel
pub struct ChannelReader {
    shared: Arc<ChannelShared>,
    incoming: mpsc::UnboundedReceiver<Bytes>,
}

impl ChannelReader {
    pub fn id(&self) -> ChannelId {
        self.shared.id
    }

    pub async fn read(&mut self) -> Option<Bytes> {
        let data = self.incoming.recv().await?;

        let before = self.shared.buffered.fetch_sub(data.len(), Ordering::SeqCst);
        let remaining = before.saturating_sub(data.len());
        if remaining <= INCOMING_LOW_WATER && self.shared.pause_sent.swap(false, Ordering::SeqCst) {
            let _ = self
                .shared
                .frame_tx
                .send(WriteOp::plain(Frame::resume(self.shared.id)))
                .await;
        }

        Some(data)
    }
}

/// Writing half of a channel
pub struct ChannelWriter {
    shared: Arc<ChannelShared>,
    pause_rx: watch::Receiver<bool>,
}

impl ChannelWriter {
    pub fn id(&self) -> ChannelId {
        self.shared.id
    }

    /// Queue `data` for transmission. Suspends while the remote paused us or
    /// while this channel already has its full write credit in flight.
    pub async fn write(&mut self, data: &[u8]) -> Result<(), MultiplexerError> {
        for chunk in data.chunks(MAX_DATA) {
            if !self.shared.local_open.load(Ordering::SeqCst) {
                return Err(MultiplexerError::ChannelClosed);
            }

            while *self.pause_rx.borrow() {
                self.pause_rx
                    .changed()
                    .await
                    .map_err(|_| MultiplexerError::TransportClosed)?;
            }

            let permit = self
                .shared
                .write_credit
                .acquire_many(chunk.len() as u32)
                .await
                .map_err(|_| MultiplexerError::TransportClosed)?;
            permit.forget();

            let frame = Frame::data(self.shared.id, Bytes::copy_from_slice(chunk));
            let credit = WriteCredit {
                shared: Arc::clone(&self.shared),
                amount: chunk.len() as u32,
            };
            self.shared
                .frame_tx
                .send(WriteOp {
                    frame,
                    credit: Some(credit),
                })
                .await
                .map_err(|_| MultiplexerError::TransportClosed)?;
        }
        Ok(())
    }

    /// Half-close from our side; idempotent
    pub async fn close(&mut self) {
        if self.shared.local_open.swap(false, Ordering::SeqCst) {
            let _ = self
                .shared
                .frame_tx
                .send(WriteOp::plain(Frame::close(self.shared.id)))
                .await;
        }
    }
}

impl Drop for ChannelWriter {
    fn drop(&mut self) {
        // Best-effort CLOSE so the remote does not wait on a vanished writer
        if self.shared.local_open.swap(false, Ordering::SeqCst) {
            let _ = self
                .shared
                .frame_tx
                .try_send(WriteOp::plain(Frame::close(self.shared.id)));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::multiplexer::FrameType;

    fn test_pair() -> (ChannelHandle, Channel, mpsc::Receiver<WriteOp>) {
        let (frame_tx, frame_rx) = mpsc::channel(64);
        let (handle, channel) = channel_pair(ChannelId::random(), "example.com".into(), frame_tx);
        (handle, channel, frame_rx)
    }

    #[tokio::test]
    async fn test_write_fragments_in_order() {
        let (_handle, channel, mut frame_rx) = test_pair();
        let (_reader, mut writer) = channel.split();

        let data: Vec<u8> = (0..10_000).map(|i| (i % 251) as u8).collect();
        writer.write(&data).await.unwrap();

        let mut reassembled = Vec::new();
        for expected in [MAX_DATA, MAX_DATA, 10_000 - 2 * MAX_DATA] {
            let op = frame_rx.recv().await.unwrap();
            assert_eq!(op.frame.frame_type, FrameType::Data);
            assert_eq!(op.frame.payload.len(), expected);
            reassembled.extend_from_slice(&op.frame.payload);
            op.credit.unwrap().release();
        }
        assert_eq!(reassembled, data);
    }

    #[tokio::test]
    async fn test_close_emits_single_frame() {
        let (_handle, channel, mut frame_rx) = test_pair();
        let (_reader, mut writer) = channel.split();

        writer.close().await;
        writer.close().await;
        assert!(writer.write(b"late").await.is_err());
        drop(writer);

        let op = frame_rx.recv().await.unwrap();
        assert_eq!(op.frame.frame_type, FrameType::Close);
        assert!(frame_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_pause_suspends_writes() {
        let (handle, channel, mut frame_rx) = test_pair();
        let (_reader, mut writer) = channel.split();

        handle.shared.pause_tx.send_replace(true);

        let write_task = tokio::spawn(async move {
            writer.write(b"held back").await.unwrap();
            writer
        });

        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert!(frame_rx.try_recv().is_err());

        handle.shared.pause_tx.send_replace(false);
        let _writer = write_task.await.unwrap();

        let op = frame_rx.recv().await.unwrap();
        assert_eq!(&op.frame.payload[..], b"held back");
    }

    #[tokio::test]
    async fn test_read_drains_and_resumes() {
        let (handle, channel, mut frame_rx) = test_pair();
        let (mut reader, _writer) = channel.split();

        // Simulate the reader task having paused the remote
        let payload = Bytes::from(vec![1u8; 64]);
        handle
            .shared
            .buffered
            .fetch_add(payload.len(), Ordering::SeqCst);
        handle.shared.pause_sent.store(true, Ordering::SeqCst);
        handle.incoming.send(payload).unwrap();

        let chunk = reader.read().await.unwrap();
        assert_eq!(chunk.len(), 64);
        assert_eq!(handle.shared.buffered.load(Ordering::SeqCst), 0);

        let op = frame_rx.recv().await.unwrap();
        assert_eq!(op.frame.frame_type, FrameType::Resume);
        assert!(!handle.shared.pause_sent.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_read_eof_after_handle_drop() {
        let (handle, channel, _frame_rx) = test_pair();
        let (mut reader, _writer) = channel.split();

        handle.incoming.send(Bytes::from_static(b"tail")).unwrap();
        handle
            .shared
            .buffered
            .fetch_add(4, Ordering::SeqCst);
        drop(handle);

        assert_eq!(&reader.read().await.unwrap()[..], b"tail");
        assert!(reader.read().await.is_none());
    }
}
