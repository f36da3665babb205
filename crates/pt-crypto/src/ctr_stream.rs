//! Shared CTR transform plumbing for the AES duplex variants.
//!
//! Encrypts on write through a small carry buffer (plaintext is transformed
//! once, then drained into the inner stream across polls) and decrypts reads
//! in place. Both AES duplexes delegate their `AsyncRead`/`AsyncWrite` to
//! this type after their preamble exchange derived the two directions' keys.

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll, ready};

use aes::cipher::{KeyIvInit, StreamCipher};
use aes::{Aes128, Aes256};
use ctr::Ctr128BE;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

pub(crate) type Aes128Ctr = Ctr128BE<Aes128>;
pub(crate) type Aes256Ctr = Ctr128BE<Aes256>;

/// One direction's keystream; the key size depends on the negotiated suite.
pub(crate) enum CtrCipher {
    Aes128(Box<Aes128Ctr>),
    Aes256(Box<Aes256Ctr>),
}

impl std::fmt::Debug for CtrCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CtrCipher::Aes128(_) => f.write_str("CtrCipher::Aes128(..)"),
            CtrCipher::Aes256(_) => f.write_str("CtrCipher::Aes256(..)"),
        }
    }
}

impl CtrCipher {
    pub(crate) fn aes128(key: &[u8], iv: &[u8]) -> Self {
        let key: [u8; 16] = key.try_into().expect("aes-128 key length");
        let iv: [u8; 16] = iv.try_into().expect("ctr iv length");
        CtrCipher::Aes128(Box::new(Aes128Ctr::new(&key.into(), &iv.into())))
    }

    pub(crate) fn aes256(key: &[u8], iv: &[u8]) -> Self {
        let key: [u8; 32] = key.try_into().expect("aes-256 key length");
        let iv: [u8; 16] = iv.try_into().expect("ctr iv length");
        CtrCipher::Aes256(Box::new(Aes256Ctr::new(&key.into(), &iv.into())))
    }

    fn apply(&mut self, data: &mut [u8]) {
        match self {
            CtrCipher::Aes128(c) => c.apply_keystream(data),
            CtrCipher::Aes256(c) => c.apply_keystream(data),
        }
    }
}

#[derive(Debug)]
pub(crate) struct CtrStream<S> {
    inner: S,
    encrypt: CtrCipher,
    decrypt: CtrCipher,
    // Ciphertext accepted from the caller but not yet written through.
    pending: Vec<u8>,
    pending_pos: usize,
}

impl<S> CtrStream<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub(crate) fn new(inner: S, encrypt: CtrCipher, decrypt: CtrCipher) -> Self {
        Self {
            inner,
            encrypt,
            decrypt,
            pending: Vec::new(),
            pending_pos: 0,
        }
    }

    /// Push buffered ciphertext into the inner stream.
    fn poll_drain(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        while self.pending_pos < self.pending.len() {
            let n = ready!(
                Pin::new(&mut self.inner).poll_write(cx, &self.pending[self.pending_pos..])
            )?;
            if n == 0 {
                return Poll::Ready(Err(io::ErrorKind::WriteZero.into()));
            }
            self.pending_pos += n;
        }
        self.pending.clear();
        self.pending_pos = 0;
        Poll::Ready(Ok(()))
    }
}

impl<S> AsyncRead for CtrStream<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = &mut *self;
        let before = buf.filled().len();
        ready!(Pin::new(&mut this.inner).poll_read(cx, buf))?;
        this.decrypt.apply(&mut buf.filled_mut()[before..]);
        Poll::Ready(Ok(()))
    }
}

impl<S> AsyncWrite for CtrStream<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        data: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = &mut *self;
        // Finish the previous chunk before transforming a new one; the
        // keystream position is tied to accepted bytes.
        ready!(this.poll_drain(cx))?;
        let mut chunk = data.to_vec();
        this.encrypt.apply(&mut chunk);
        this.pending = chunk;
        this.pending_pos = 0;
        // Opportunistic push; leftovers drain on the next write or flush.
        match this.poll_drain(cx) {
            Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
            Poll::Ready(Ok(())) | Poll::Pending => {}
        }
        Poll::Ready(Ok(data.len()))
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = &mut *self;
        ready!(this.poll_drain(cx))?;
        Pin::new(&mut this.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = &mut *self;
        ready!(this.poll_drain(cx))?;
        Pin::new(&mut this.inner).poll_shutdown(cx)
    }
}
