//! Symmetric bidirectional copy.
//!
//! Every supervisor loop reduces to the same shape: copy a→b and b→a until
//! each direction ends, then close both write ends. `splice` is that shape as
//! a single primitive, returning both directions' outcomes so neither error
//! is lost.

use std::io;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Copy both directions between `a` and `b` with `buf_size`-byte buffers.
///
/// Returns `(a_to_b, b_to_a)` byte counts or errors. Each direction shuts its
/// destination's write half down when it finishes, so a one-sided close
/// propagates as EOF to the peer.
pub async fn splice<A, B>(a: A, b: B, buf_size: usize) -> (io::Result<u64>, io::Result<u64>)
where
    A: AsyncRead + AsyncWrite + Send + 'static,
    B: AsyncRead + AsyncWrite + Send + 'static,
{
    let (a_rd, a_wr) = tokio::io::split(a);
    let (b_rd, b_wr) = tokio::io::split(b);
    let a_to_b = tokio::spawn(copy_half(a_rd, b_wr, buf_size));
    let b_to_a = tokio::spawn(copy_half(b_rd, a_wr, buf_size));
    let a_to_b = a_to_b
        .await
        .unwrap_or_else(|e| Err(io::Error::other(e)));
    let b_to_a = b_to_a
        .await
        .unwrap_or_else(|e| Err(io::Error::other(e)));
    (a_to_b, b_to_a)
}

async fn copy_half<R, W>(mut rd: R, mut wr: W, buf_size: usize) -> io::Result<u64>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; buf_size.max(1)];
    let mut total = 0u64;
    let result = loop {
        match rd.read(&mut buf).await {
            Ok(0) => break Ok(()),
            Ok(n) => {
                if let Err(e) = wr.write_all(&buf[..n]).await {
                    break Err(e);
                }
                if let Err(e) = wr.flush().await {
                    break Err(e);
                }
                total += n as u64;
            }
            Err(e) => break Err(e),
        }
    };
    // Close the destination regardless, so the peer sees EOF.
    let shutdown = wr.shutdown().await;
    result.and(shutdown)?;
    Ok(total)
}

/// Merge both directions' results, keeping both messages when both failed.
pub fn combine_results(results: (io::Result<u64>, io::Result<u64>)) -> io::Result<()> {
    match results {
        (Ok(_), Ok(_)) => Ok(()),
        (Err(e), Ok(_)) | (Ok(_), Err(e)) => Err(e),
        (Err(a), Err(b)) => Err(io::Error::new(a.kind(), format!("{a}; {b}"))),
    }
}
