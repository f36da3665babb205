//! OpenSSL-compatible AES-CTR duplex.
//!
//! Wire layout per direction: `"Salted__" ∥ salt[8]` followed by CTR
//! ciphertext, with `key ∥ iv` derived jointly as
//! `PBKDF2(passphrase, salt, iter, key_len + 16, hash)`. This matches
//! `openssl enc -aes-{128,256}-ctr -pbkdf2 -iter N -md H -salt`, so one end
//! of the tunnel can be a shell pipeline instead of this program.
//!
//! The iteration count and hash are not negotiated; both ends must be given
//! the same `{"iter": ..., "hash": ...}` config out-of-band.

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use pbkdf2::pbkdf2_hmac;
use rand::RngCore;
use sha1::Sha1;
use sha2::{Sha256, Sha512};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};

use crate::ctr_stream::{CtrCipher, CtrStream};
use crate::{CryptoError, HashAlgo, Pbkdf2Params};

const SALT_MAGIC: &[u8; 8] = b"Salted__";
const SALT_LEN: usize = 8;
const IV_LEN: usize = 16;

/// AES key size selected by the cipher type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyBits {
    Aes128,
    Aes256,
}

impl KeyBits {
    pub fn key_len(self) -> usize {
        match self {
            KeyBits::Aes128 => 16,
            KeyBits::Aes256 => 32,
        }
    }

    /// Bit count for operator hints (`openssl aes-<bits>-ctr`).
    pub fn bits(self) -> u32 {
        match self {
            KeyBits::Aes128 => 128,
            KeyBits::Aes256 => 256,
        }
    }
}

/// Derive `key ∥ iv` the way `openssl enc -pbkdf2` does.
pub fn derive_key_and_iv(
    passphrase: &[u8],
    salt: &[u8],
    params: Pbkdf2Params,
    key_len: usize,
) -> (Vec<u8>, Vec<u8>) {
    let mut out = vec![0u8; key_len + IV_LEN];
    match params.hash {
        HashAlgo::Sha1 => pbkdf2_hmac::<Sha1>(passphrase, salt, params.iter, &mut out),
        HashAlgo::Sha256 => pbkdf2_hmac::<Sha256>(passphrase, salt, params.iter, &mut out),
        HashAlgo::Sha512 => pbkdf2_hmac::<Sha512>(passphrase, salt, params.iter, &mut out),
    }
    let iv = out.split_off(key_len);
    (out, iv)
}

#[derive(Debug)]
pub struct OpensslAesCtrDuplex<S> {
    io: CtrStream<S>,
}

impl<S> OpensslAesCtrDuplex<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Send our `Salted__` envelope, verify the peer's, and return the
    /// transforming stream.
    pub async fn handshake(
        mut inner: S,
        passphrase: &[u8],
        key_bits: KeyBits,
        params: Pbkdf2Params,
    ) -> Result<Self, CryptoError> {
        let mut salt = [0u8; SALT_LEN];
        rand::thread_rng().fill_bytes(&mut salt);
        inner.write_all(SALT_MAGIC).await?;
        inner.write_all(&salt).await?;
        inner.flush().await?;
        let encrypt = direction_cipher(passphrase, &salt, key_bits, params);

        let mut magic = [0u8; 8];
        inner.read_exact(&mut magic).await?;
        if &magic != SALT_MAGIC {
            return Err(CryptoError::MissingSaltHeader);
        }
        let mut peer_salt = [0u8; SALT_LEN];
        inner.read_exact(&mut peer_salt).await?;
        let decrypt = direction_cipher(passphrase, &peer_salt, key_bits, params);

        Ok(Self {
            io: CtrStream::new(inner, encrypt, decrypt),
        })
    }
}

fn direction_cipher(
    passphrase: &[u8],
    salt: &[u8],
    key_bits: KeyBits,
    params: Pbkdf2Params,
) -> CtrCipher {
    let (key, iv) = derive_key_and_iv(passphrase, salt, params, key_bits.key_len());
    match key_bits {
        KeyBits::Aes128 => CtrCipher::aes128(&key, &iv),
        KeyBits::Aes256 => CtrCipher::aes256(&key, &iv),
    }
}

impl<S> AsyncRead for OpensslAesCtrDuplex<S>
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

impl<S> AsyncWrite for OpensslAesCtrDuplex<S>
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
