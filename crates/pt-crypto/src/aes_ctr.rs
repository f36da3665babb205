//! Native AES-CTR duplex.
//!
//! Each side opens with `salt[64] ∥ iv[16]` in the clear, then streams
//! AES-256-CTR ciphertext. The two directions use independent salts and IVs,
//! so they have independent keystreams even though both derive from the same
//! passphrase. Key = PBKDF2-HMAC-SHA512(passphrase, salt, 4096, 32).
//!
//! Both sides write their preamble before reading the peer's, so the
//! exchange cannot deadlock over a buffered transport.

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use pbkdf2::pbkdf2_hmac;
use rand::RngCore;
use sha2::Sha512;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};

use crate::CryptoError;
use crate::ctr_stream::{CtrCipher, CtrStream};

const SALT_LEN: usize = 64;
const IV_LEN: usize = 16;
const PBKDF2_ITER: u32 = 4096;
const KEY_LEN: usize = 32;

pub struct AesCtrDuplex<S> {
    io: CtrStream<S>,
}

impl<S> AesCtrDuplex<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Exchange preambles over `inner` and return the transforming stream.
    pub async fn handshake(mut inner: S, passphrase: &[u8]) -> Result<Self, CryptoError> {
        let mut salt = [0u8; SALT_LEN];
        rand::thread_rng().fill_bytes(&mut salt);
        let mut iv = [0u8; IV_LEN];
        rand::thread_rng().fill_bytes(&mut iv);
        inner.write_all(&salt).await?;
        inner.write_all(&iv).await?;
        inner.flush().await?;
        let encrypt = direction_cipher(passphrase, &salt, &iv);

        let mut peer_salt = [0u8; SALT_LEN];
        inner.read_exact(&mut peer_salt).await?;
        let mut peer_iv = [0u8; IV_LEN];
        inner.read_exact(&mut peer_iv).await?;
        let decrypt = direction_cipher(passphrase, &peer_salt, &peer_iv);

        Ok(Self {
            io: CtrStream::new(inner, encrypt, decrypt),
        })
    }
}

fn direction_cipher(passphrase: &[u8], salt: &[u8], iv: &[u8]) -> CtrCipher {
    let mut key = [0u8; KEY_LEN];
    pbkdf2_hmac::<Sha512>(passphrase, salt, PBKDF2_ITER, &mut key);
    CtrCipher::aes256(&key, iv)
}

impl<S> AsyncRead for AesCtrDuplex<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.io).poll_read(cx, buf)
    }
}

impl<S> AsyncWrite for AesCtrDuplex<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        data: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.io).poll_write(cx, data)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.io).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.io).poll_shutdown(cx)
    }
}
