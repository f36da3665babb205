// pt-test-utils: in-process piping relay for integration tests.
//
// Implements the relay contract the tunnel is built against: for each path,
// the next POST is paired with the next GET, the POST body streams into the
// GET response, the GET response carries the POST's content type, and the
// POST completes only once its body has been fully delivered.

use std::collections::{HashMap, VecDeque};
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};

use axum::Router;
use axum::body::Body;
use axum::extract::{Path, Request, State};
use axum::http::{Method, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::any;
use bytes::Bytes;
use futures_util::{Stream, StreamExt};
use tokio::sync::{mpsc, oneshot};
use tokio_stream::wrappers::ReceiverStream;

type ChunkReceiver = mpsc::Receiver<io::Result<Bytes>>;

struct PendingUpload {
    content_type: String,
    chunks: ChunkReceiver,
    // Fired when the download side has fully consumed (or abandoned) the
    // body; completes the sender's POST.
    done: oneshot::Sender<()>,
}

#[derive(Default)]
struct PathQueue {
    uploads: VecDeque<PendingUpload>,
    getters: VecDeque<oneshot::Sender<PendingUpload>>,
}

#[derive(Clone, Default)]
struct RelayState {
    paths: Arc<Mutex<HashMap<String, PathQueue>>>,
}

/// An in-process piping relay listening on a loopback port.
pub struct MockRelay {
    addr: SocketAddr,
}

impl MockRelay {
    pub async fn start() -> io::Result<Self> {
        let app = Router::new()
            .route("/{*path}", any(handle))
            .with_state(RelayState::default());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        tokio::spawn(async move {
            axum::serve(listener, app).await.expect("mock relay server");
        });
        Ok(Self { addr })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn base_url(&self) -> String {
        format!("http://{}", self.addr)
    }

    /// Absolute URL for a relay path.
    pub fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url(), path.trim_start_matches('/'))
    }
}

async fn handle(
    State(state): State<RelayState>,
    Path(path): Path<String>,
    request: Request,
) -> Response {
    let method = request.method().clone();
    if method == Method::POST || method == Method::PUT {
        handle_upload(state, path, request).await
    } else if method == Method::GET {
        handle_download(state, path).await
    } else {
        StatusCode::METHOD_NOT_ALLOWED.into_response()
    }
}

async fn handle_upload(state: RelayState, path: String, request: Request) -> Response {
    let content_type = request
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("application/octet-stream")
        .to_owned();

    let (chunk_tx, chunk_rx) = mpsc::channel::<io::Result<Bytes>>(1);
    let (done_tx, done_rx) = oneshot::channel();
    let upload = PendingUpload {
        content_type,
        chunks: chunk_rx,
        done: done_tx,
    };
    {
        let mut paths = state.paths.lock().expect("relay state lock");
        let queue = paths.entry(path).or_default();
        if let Some(getter) = queue.getters.pop_front() {
            let _ = getter.send(upload);
        } else {
            queue.uploads.push_back(upload);
        }
    }

    let mut body = request.into_body().into_data_stream();
    while let Some(chunk) = body.next().await {
        let forward = match chunk {
            Ok(bytes) => chunk_tx.send(Ok(bytes)).await,
            Err(e) => {
                let _ = chunk_tx.send(Err(io::Error::other(e))).await;
                break;
            }
        };
        if forward.is_err() {
            // Receiver gone: the download was abandoned.
            break;
        }
    }
    drop(chunk_tx);
    // Block until the receiver drained everything, like the real relay: the
    // sender's POST finishes when the transfer does.
    let _ = done_rx.await;
    StatusCode::OK.into_response()
}

async fn handle_download(state: RelayState, path: String) -> Response {
    let pending = {
        let mut paths = state.paths.lock().expect("relay state lock");
        let queue = paths.entry(path).or_default();
        if let Some(upload) = queue.uploads.pop_front() {
            Ok(upload)
        } else {
            let (tx, rx) = oneshot::channel();
            queue.getters.push_back(tx);
            Err(rx)
        }
    };
    let upload = match pending {
        Ok(upload) => upload,
        Err(rx) => match rx.await {
            Ok(upload) => upload,
            Err(_) => return StatusCode::SERVICE_UNAVAILABLE.into_response(),
        },
    };

    let body = Body::from_stream(SignalOnEnd {
        inner: ReceiverStream::new(upload.chunks),
        done: Some(upload.done),
    });
    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, upload.content_type)
        .body(body)
        .expect("download response")
}

/// Stream adapter that fires the upload's completion signal once the body
/// has been fully streamed (or the response was dropped mid-transfer).
struct SignalOnEnd {
    inner: ReceiverStream<io::Result<Bytes>>,
    done: Option<oneshot::Sender<()>>,
}

impl Stream for SignalOnEnd {
    type Item = io::Result<Bytes>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let polled = Pin::new(&mut self.inner).poll_next(cx);
        if let Poll::Ready(None) = polled {
            if let Some(done) = self.done.take() {
                let _ = done.send(());
            }
        }
        polled
    }
}

impl Drop for SignalOnEnd {
    fn drop(&mut self) {
        if let Some(done) = self.done.take() {
            let _ = done.send(());
        }
    }
}
