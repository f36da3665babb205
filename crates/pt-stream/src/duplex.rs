//! The duplex transport: one streaming POST (uplink) and one GET (downlink)
//! paired into a single bidirectional byte stream.
//!
//! # Construction
//! 1. An in-process pipe is created. Its read half becomes the POST body;
//!    the upload task owns that end, the duplex keeps the write end.
//! 2. The POST runs on its own task. A non-success outcome is parked in a
//!    oneshot slot and surfaced on the write side, so an upload failure is
//!    seen on the next write (or on shutdown) rather than lost.
//! 3. The GET runs on another task; the response body reader arrives through
//!    a oneshot channel. The first read blocks until the relay delivers it.
//!
//! Writes may begin immediately after construction. Shutdown ends the upload
//! only — the two directions are independent half-channels, and the receiver
//! may keep draining reads after local writes end. Dropping the duplex
//! releases the downlink; a GET that never arrived is abandoned without
//! blocking, which cancels the in-flight request.

use std::future::Future;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll, ready};

use bytes::Bytes;
use futures_util::{StreamExt, TryStreamExt};
use pt_relay::{Body, HeaderKeyValue, RelayClient, RelayError, Response, Url, ensure_success};
use tokio::io::{AsyncRead, AsyncWrite, BufReader, DuplexStream, ReadBuf};
use tokio::sync::oneshot;
use tokio_util::io::{ReaderStream, StreamReader};

type ByteStream = futures_util::stream::BoxStream<'static, io::Result<Bytes>>;
type DownlinkReader = BufReader<StreamReader<ByteStream, Bytes>>;

enum Downlink {
    Waiting(oneshot::Receiver<Result<DownlinkReader, RelayError>>),
    Ready(DownlinkReader),
    Closed,
}

pub struct PipingDuplex {
    uplink: DuplexStream,
    downlink: Downlink,
    upload_err: oneshot::Receiver<RelayError>,
}

impl PipingDuplex {
    /// Connect the standard way: plain POST to `upload_url`, plain GET from
    /// `download_url`, both with `headers`.
    pub fn connect(
        client: &RelayClient,
        headers: &[HeaderKeyValue],
        upload_url: Url,
        download_url: Url,
    ) -> Self {
        let post_client = client.clone();
        let post_headers = headers.to_vec();
        let get_client = client.clone();
        let get_headers = headers.to_vec();
        Self::connect_with_handlers(
            client.write_buf_size(),
            client.read_buf_size(),
            move |body| async move { post_client.send(&post_headers, upload_url, body).await },
            move || async move { get_client.get(&get_headers, download_url).await },
        )
    }

    /// Connect with caller-supplied send and get operations, so higher layers
    /// can inject extra headers (e.g. a mux content type) and validate the
    /// GET response before its body is consumed.
    pub fn connect_with_handlers<P, G>(
        write_buf_size: usize,
        read_buf_size: usize,
        post: impl FnOnce(Body) -> P,
        get: impl FnOnce() -> G,
    ) -> Self
    where
        P: Future<Output = Result<Response, RelayError>> + Send + 'static,
        G: Future<Output = Result<Response, RelayError>> + Send + 'static,
    {
        let write_buf_size = write_buf_size.max(1);
        let (uplink, pipe_rd) = tokio::io::duplex(write_buf_size);
        let body = Body::wrap_stream(ReaderStream::with_capacity(pipe_rd, write_buf_size));

        let post_fut = post(body);
        let (err_tx, err_rx) = oneshot::channel();
        tokio::spawn(async move {
            let result = async {
                let res = ensure_success(post_fut.await?)?;
                // Drain the upload response; the relay completes it once the
                // transfer is done.
                let mut body = res.bytes_stream();
                while let Some(chunk) = body.next().await {
                    chunk.map_err(RelayError::Http)?;
                }
                Ok::<(), RelayError>(())
            }
            .await;
            if let Err(e) = result {
                let _ = err_tx.send(e);
            }
        });

        let get_fut = get();
        let (reader_tx, reader_rx) = oneshot::channel();
        tokio::spawn(async move {
            let delivered = async {
                let res = ensure_success(get_fut.await?)?;
                let stream: ByteStream = res.bytes_stream().map_err(io::Error::other).boxed();
                Ok(BufReader::with_capacity(
                    read_buf_size.max(1),
                    StreamReader::new(stream),
                ))
            }
            .await;
            let _ = reader_tx.send(delivered);
        });

        Self {
            uplink,
            downlink: Downlink::Waiting(reader_rx),
            upload_err: err_rx,
        }
    }

    /// Replace a write-side failure with the parked upload error, if any.
    fn upload_error_or(&mut self, fallback: io::Error) -> io::Error {
        match self.upload_err.try_recv() {
            Ok(e) => io::Error::other(e),
            Err(_) => fallback,
        }
    }
}

impl AsyncRead for PipingDuplex {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        loop {
            match &mut self.downlink {
                Downlink::Waiting(rx) => match ready!(Pin::new(rx).poll(cx)) {
                    Ok(Ok(reader)) => self.downlink = Downlink::Ready(reader),
                    Ok(Err(e)) => {
                        self.downlink = Downlink::Closed;
                        return Poll::Ready(Err(io::Error::other(e)));
                    }
                    Err(_) => {
                        self.downlink = Downlink::Closed;
                        return Poll::Ready(Err(io::ErrorKind::BrokenPipe.into()));
                    }
                },
                Downlink::Ready(reader) => return Pin::new(reader).poll_read(cx, buf),
                Downlink::Closed => return Poll::Ready(Ok(())),
            }
        }
    }
}

impl AsyncWrite for PipingDuplex {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        data: &[u8],
    ) -> Poll<io::Result<usize>> {
        match ready!(Pin::new(&mut self.uplink).poll_write(cx, data)) {
            Ok(n) => Poll::Ready(Ok(n)),
            Err(e) => Poll::Ready(Err(self.upload_error_or(e))),
        }
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.uplink).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        // Write-side shutdown only: the downlink is an independent
        // half-channel and may still be drained after local writes end. It
        // is released when the duplex is dropped (a not-yet-arrived reader
        // is abandoned without blocking, cancelling the request).
        let result = ready!(Pin::new(&mut self.uplink).poll_shutdown(cx));
        // A parked upload failure is not silently lost even when the local
        // shutdown itself succeeded.
        let result = match result {
            Ok(()) => match self.upload_err.try_recv() {
                Ok(e) => Err(io::Error::other(e)),
                Err(_) => Ok(()),
            },
            Err(e) => Err(self.upload_error_or(e)),
        };
        Poll::Ready(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn ok_response(body: &'static [u8]) -> Response {
        Response::from(http_response(200, body))
    }

    fn http_response(status: u16, body: &'static [u8]) -> http::Response<Body> {
        http::Response::builder()
            .status(status)
            .body(Body::from(body))
            .expect("static response")
    }

    #[tokio::test]
    async fn first_read_waits_for_get_then_streams_body() {
        let (release_tx, release_rx) = oneshot::channel::<()>();
        let mut duplex = PipingDuplex::connect_with_handlers(
            4096,
            4096,
            |_body| async { Ok(ok_response(b"")) },
            move || async move {
                release_rx.await.expect("release");
                Ok(ok_response(b"downlink data"))
            },
        );

        // The GET has not resolved yet; release it and the first read
        // unblocks with its body.
        release_tx.send(()).expect("send release");
        let mut buf = vec![0u8; 64];
        let n = duplex.read(&mut buf).await.expect("read");
        assert_eq!(&buf[..n], b"downlink data");
        let n = duplex.read(&mut buf).await.expect("read eof");
        assert_eq!(n, 0);
    }

    #[tokio::test]
    async fn get_failure_fails_first_read() {
        let mut duplex = PipingDuplex::connect_with_handlers(
            4096,
            4096,
            |_body| async { Ok(ok_response(b"")) },
            || async { Ok(Response::from(http_response(503, b""))) },
        );
        let mut buf = [0u8; 8];
        let err = duplex.read(&mut buf).await.expect_err("read should fail");
        assert!(err.to_string().contains("503"), "got: {err}");
    }

    #[tokio::test]
    async fn upload_failure_surfaces_on_write() {
        let mut duplex = PipingDuplex::connect_with_handlers(
            16,
            16,
            |_body| async { Ok(Response::from(http_response(500, b""))) },
            || async { Ok(ok_response(b"")) },
        );
        // The failed POST drops the pipe's read half; keep writing until the
        // parked status error propagates (the first failure may race the
        // error slot and report a bare broken pipe).
        let mut saw_error = None;
        for _ in 0..64 {
            match duplex.write_all(&[0u8; 16]).await {
                Err(e) if e.to_string().contains("500") => {
                    saw_error = Some(e);
                    break;
                }
                _ => tokio::time::sleep(std::time::Duration::from_millis(5)).await,
            }
        }
        let err = saw_error.expect("write should eventually surface the upload status");
        assert!(err.to_string().contains("500"), "got: {err}");
    }

    #[tokio::test]
    async fn shutdown_before_get_arrives_does_not_hang() {
        let mut duplex = PipingDuplex::connect_with_handlers(
            4096,
            4096,
            |_body| async { Ok(ok_response(b"")) },
            || async {
                // Never resolves within the test.
                tokio::time::sleep(std::time::Duration::from_secs(3600)).await;
                Ok(ok_response(b""))
            },
        );
        tokio::time::timeout(std::time::Duration::from_secs(1), duplex.shutdown())
            .await
            .expect("shutdown must not block on the pending GET")
            .expect("shutdown");
    }

}
