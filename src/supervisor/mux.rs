//! yamux session driver.
//!
//! The yamux crate exposes a poll-based connection that must be driven from
//! one place. This wraps it in a task: stream opens arrive over a request
//! channel, inbound streams leave over another, and the task polls the
//! connection until it dies. Streams are handed back bridged to tokio I/O.

use std::collections::VecDeque;
use std::io;
use std::task::Poll;

use pt_stream::BoxedStream;
use tokio::sync::{mpsc, oneshot};
use tokio_util::compat::{Compat, FuturesAsyncReadCompatExt, TokioAsyncReadCompatExt};
use tracing::debug;

pub type MuxStream = Compat<yamux::Stream>;

type OpenRequest = oneshot::Sender<Result<yamux::Stream, yamux::ConnectionError>>;

pub struct MuxSession {
    open_tx: mpsc::Sender<OpenRequest>,
    inbound_rx: mpsc::Receiver<yamux::Stream>,
}

impl MuxSession {
    pub fn client(io: BoxedStream) -> Self {
        Self::new(io, yamux::Mode::Client)
    }

    pub fn server(io: BoxedStream) -> Self {
        Self::new(io, yamux::Mode::Server)
    }

    fn new(io: BoxedStream, mode: yamux::Mode) -> Self {
        let connection = yamux::Connection::new(io.compat(), yamux::Config::default(), mode);
        let (open_tx, open_rx) = mpsc::channel(16);
        let (inbound_tx, inbound_rx) = mpsc::channel(16);
        tokio::spawn(drive(connection, open_rx, inbound_tx));
        Self {
            open_tx,
            inbound_rx,
        }
    }

    /// Open an outbound stream on the session.
    pub async fn open(&self) -> io::Result<MuxStream> {
        let (tx, rx) = oneshot::channel();
        self.open_tx
            .send(tx)
            .await
            .map_err(|_| io::Error::other("mux session closed"))?;
        let stream = rx
            .await
            .map_err(|_| io::Error::other("mux session closed"))?
            .map_err(io::Error::other)?;
        Ok(stream.compat())
    }

    /// Receive the next inbound stream; `None` once the session has ended.
    pub async fn accept(&mut self) -> Option<MuxStream> {
        self.inbound_rx
            .recv()
            .await
            .map(FuturesAsyncReadCompatExt::compat)
    }
}

async fn drive<C>(
    mut connection: yamux::Connection<C>,
    mut open_rx: mpsc::Receiver<OpenRequest>,
    inbound_tx: mpsc::Sender<yamux::Stream>,
) where
    C: futures_util::io::AsyncRead + futures_util::io::AsyncWrite + Unpin + Send + 'static,
{
    let mut pending_open: VecDeque<OpenRequest> = VecDeque::new();
    futures_util::future::poll_fn(move |cx| {
        loop {
            // Absorb open requests; a closed request channel means the
            // session handle is gone.
            loop {
                match open_rx.poll_recv(cx) {
                    Poll::Ready(Some(request)) => pending_open.push_back(request),
                    Poll::Ready(None) => {
                        return match connection.poll_close(cx) {
                            Poll::Ready(_) => Poll::Ready(()),
                            Poll::Pending => Poll::Pending,
                        };
                    }
                    Poll::Pending => break,
                }
            }

            // Service queued opens.
            while !pending_open.is_empty() {
                match connection.poll_new_outbound(cx) {
                    Poll::Ready(result) => {
                        if let Some(request) = pending_open.pop_front() {
                            let _ = request.send(result);
                        }
                    }
                    Poll::Pending => break,
                }
            }

            // Drive connection I/O and surface inbound streams.
            match connection.poll_next_inbound(cx) {
                Poll::Ready(Some(Ok(stream))) => {
                    if inbound_tx.try_send(stream).is_err() {
                        debug!("inbound mux stream dropped (no accepter)");
                    }
                }
                Poll::Ready(Some(Err(e))) => {
                    debug!(error = %e, "mux connection failed");
                    return Poll::Ready(());
                }
                Poll::Ready(None) => return Poll::Ready(()),
                Poll::Pending => return Poll::Pending,
            }
        }
    })
    .await;
}
