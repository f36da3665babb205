//! Heartbeat-framed transport.
//!
//! Relay intermediaries sever HTTP bodies that stay idle; a small periodic
//! record defeats their idle timers. Framing exists so keepalive bytes are
//! distinguishable from payload.
//!
//! # Wire format
//! - DATA: `0x01` ∥ u32 big-endian length ∥ payload
//! - HEARTBEAT: `0x02` ∥ one random byte (discarded by the reader)
//!
//! One write produces exactly one DATA frame. All frames — payload and
//! keepalive — funnel through a single writer task that owns the inner write
//! half, so a heartbeat can never land inside a partially written frame. The
//! writer task exits when the frame channel closes (shutdown) or when inner
//! writes start failing.

use std::future::Future;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll, ready};
use std::time::Duration;

use bytes::{BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadBuf, ReadHalf, WriteHalf};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::PollSender;

const DATA_TAG: u8 = 0x01;
const HEARTBEAT_TAG: u8 = 0x02;

pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

pub struct HeartbeatDuplex<S> {
    reader: FrameReader<ReadHalf<S>>,
    frames: PollSender<Bytes>,
    done: Option<oneshot::Receiver<io::Result<()>>>,
}

impl<S> HeartbeatDuplex<S>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    pub fn new(inner: S) -> Self {
        Self::with_interval(inner, DEFAULT_HEARTBEAT_INTERVAL)
    }

    /// Like [`Self::new`] with a custom keepalive interval. The first
    /// heartbeat is emitted right away, subsequent ones every `interval`.
    pub fn with_interval(inner: S, interval: Duration) -> Self {
        let (rd, wr) = tokio::io::split(inner);
        let (frame_tx, frame_rx) = mpsc::channel(1);
        let (done_tx, done_rx) = oneshot::channel();
        tokio::spawn(write_loop(wr, frame_rx, interval, done_tx));
        Self {
            reader: FrameReader::new(rd),
            frames: PollSender::new(frame_tx),
            done: Some(done_rx),
        }
    }

    /// The writer task is gone; report its stored failure if it left one.
    fn writer_error(&mut self) -> io::Error {
        if let Some(done) = &mut self.done {
            if let Ok(result) = done.try_recv() {
                self.done = None;
                return match result {
                    Ok(()) => io::ErrorKind::BrokenPipe.into(),
                    Err(e) => e,
                };
            }
        }
        io::ErrorKind::BrokenPipe.into()
    }
}

impl<S> AsyncRead for HeartbeatDuplex<S>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        self.reader.poll_read(cx, buf)
    }
}

impl<S> AsyncWrite for HeartbeatDuplex<S>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        data: &[u8],
    ) -> Poll<io::Result<usize>> {
        match ready!(self.frames.poll_reserve(cx)) {
            Ok(()) => {
                let mut frame = BytesMut::with_capacity(1 + 4 + data.len());
                frame.put_u8(DATA_TAG);
                frame.put_u32(u32::try_from(data.len()).map_err(|_| {
                    io::Error::new(io::ErrorKind::InvalidInput, "frame too large")
                })?);
                frame.put_slice(data);
                if self.frames.send_item(frame.freeze()).is_err() {
                    return Poll::Ready(Err(self.writer_error()));
                }
                Poll::Ready(Ok(data.len()))
            }
            Err(_) => Poll::Ready(Err(self.writer_error())),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        // Frames are flushed by the writer task as they drain.
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.frames.close();
        match &mut self.done {
            Some(done) => {
                let result = ready!(Pin::new(done).poll(cx));
                self.done = None;
                Poll::Ready(result.unwrap_or(Ok(())))
            }
            None => Poll::Ready(Ok(())),
        }
    }
}

/// Owns the inner write half; serializes DATA frames against HEARTBEAT
/// records and shuts the half down when it exits.
async fn write_loop<W>(
    mut wr: WriteHalf<W>,
    mut frames: mpsc::Receiver<Bytes>,
    interval: Duration,
    done: oneshot::Sender<io::Result<()>>,
) where
    W: AsyncWrite,
{
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let outcome = loop {
        tokio::select! {
            frame = frames.recv() => match frame {
                Some(frame) => {
                    if let Err(e) = write_record(&mut wr, &frame).await {
                        break Err(e);
                    }
                }
                None => break Ok(()),
            },
            _ = ticker.tick() => {
                let record = [HEARTBEAT_TAG, rand::random::<u8>()];
                if let Err(e) = write_record(&mut wr, &record).await {
                    break Err(e);
                }
            }
        }
    };
    let outcome = match outcome {
        Ok(()) => wr.shutdown().await,
        Err(e) => {
            let _ = wr.shutdown().await;
            Err(e)
        }
    };
    let _ = done.send(outcome);
}

async fn write_record<W: AsyncWrite>(wr: &mut WriteHalf<W>, record: &[u8]) -> io::Result<()> {
    wr.write_all(record).await?;
    wr.flush().await
}

// ---------------------------------------------------------------------------
// Frame reader
// ---------------------------------------------------------------------------

enum ReadState {
    Tag,
    Pad,
    Len { buf: [u8; 4], filled: usize },
    Body { rest: u32 },
}

struct FrameReader<R> {
    inner: R,
    state: ReadState,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    fn new(inner: R) -> Self {
        Self {
            inner,
            state: ReadState::Tag,
        }
    }

    fn poll_read(&mut self, cx: &mut Context<'_>, out: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        loop {
            match &mut self.state {
                ReadState::Tag => {
                    let mut byte = [0u8; 1];
                    let mut buf = ReadBuf::new(&mut byte);
                    ready!(Pin::new(&mut self.inner).poll_read(cx, &mut buf))?;
                    if buf.filled().is_empty() {
                        // Clean end of stream between frames.
                        return Poll::Ready(Ok(()));
                    }
                    self.state = match byte[0] {
                        DATA_TAG => ReadState::Len {
                            buf: [0; 4],
                            filled: 0,
                        },
                        HEARTBEAT_TAG => ReadState::Pad,
                        tag => {
                            return Poll::Ready(Err(io::Error::new(
                                io::ErrorKind::InvalidData,
                                format!("unexpected frame tag: {tag:#04x}"),
                            )));
                        }
                    };
                }
                ReadState::Pad => {
                    let mut byte = [0u8; 1];
                    let mut buf = ReadBuf::new(&mut byte);
                    ready!(Pin::new(&mut self.inner).poll_read(cx, &mut buf))?;
                    if buf.filled().is_empty() {
                        return Poll::Ready(Err(io::Error::new(
                            io::ErrorKind::UnexpectedEof,
                            "stream ended inside a heartbeat record",
                        )));
                    }
                    self.state = ReadState::Tag;
                }
                ReadState::Len { buf, filled } => {
                    let mut len_buf = ReadBuf::new(&mut buf[*filled..]);
                    ready!(Pin::new(&mut self.inner).poll_read(cx, &mut len_buf))?;
                    let n = len_buf.filled().len();
                    if n == 0 {
                        return Poll::Ready(Err(io::Error::new(
                            io::ErrorKind::UnexpectedEof,
                            "stream ended inside a frame header",
                        )));
                    }
                    *filled += n;
                    if *filled == 4 {
                        let rest = u32::from_be_bytes(*buf);
                        self.state = if rest == 0 {
                            ReadState::Tag
                        } else {
                            ReadState::Body { rest }
                        };
                    }
                }
                ReadState::Body { rest } => {
                    if out.remaining() == 0 {
                        return Poll::Ready(Ok(()));
                    }
                    let want = usize::try_from(*rest)
                        .unwrap_or(usize::MAX)
                        .min(out.remaining());
                    let mut limited = out.take(want);
                    ready!(Pin::new(&mut self.inner).poll_read(cx, &mut limited))?;
                    let n = limited.filled().len();
                    // Propagate the inner EOF even mid-frame; the peer is gone.
                    unsafe { out.assume_init(n) };
                    out.advance(n);
                    *rest -= u32::try_from(n).unwrap_or(0);
                    if *rest == 0 {
                        self.state = ReadState::Tag;
                    }
                    return Poll::Ready(Ok(()));
                }
            }
        }
    }
}
