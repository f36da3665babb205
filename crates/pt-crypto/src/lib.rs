// pt-crypto: symmetric cipher layers for the tunnel.
//
// Three interchangeable wrappers around any tunnel stream, all keyed from a
// shared passphrase: the native AES-CTR layout, an OpenSSL-compatible
// AES-CTR layout, and an OpenPGP symmetric envelope.
//
// Confidentiality only: none of these modes authenticate the ciphertext, so
// an active attacker can flip bits undetected. Operators who need integrity
// should run TLS (or similar) inside the tunnel.

pub mod aes_ctr;
mod ctr_stream;
pub mod openpgp;
pub mod openssl_aes_ctr;
mod suite;

pub use aes_ctr::AesCtrDuplex;
pub use openpgp::OpenpgpDuplex;
pub use openssl_aes_ctr::{KeyBits, OpensslAesCtrDuplex};
pub use suite::{CipherSuite, HashAlgo, Pbkdf2Params};

use pt_stream::BoxedStream;

#[derive(Debug, thiserror::Error)]
pub enum CryptoError {
    #[error("cipher handshake i/o failed: {0}")]
    Handshake(#[from] std::io::Error),
    #[error("stream does not start with the Salted__ envelope")]
    MissingSaltHeader,
    #[error("invalid cipher type '{0}'")]
    InvalidCipherType(String),
    #[error("cipher type '{0}' requires a pbkdf2 config")]
    MissingPbkdf2Config(String),
    #[error("invalid pbkdf2 config: {0}")]
    InvalidPbkdf2Config(String),
}

/// Wrap `inner` in the cipher selected by `suite`, performing the
/// per-direction preamble exchange.
pub async fn encrypt_stream(
    inner: BoxedStream,
    passphrase: &str,
    suite: &CipherSuite,
) -> Result<BoxedStream, CryptoError> {
    let passphrase = passphrase.as_bytes();
    Ok(match suite {
        CipherSuite::AesCtr => Box::new(AesCtrDuplex::handshake(inner, passphrase).await?),
        CipherSuite::OpensslAes128Ctr { pbkdf2 } => Box::new(
            OpensslAesCtrDuplex::handshake(inner, passphrase, KeyBits::Aes128, *pbkdf2).await?,
        ),
        CipherSuite::OpensslAes256Ctr { pbkdf2 } => Box::new(
            OpensslAesCtrDuplex::handshake(inner, passphrase, KeyBits::Aes256, *pbkdf2).await?,
        ),
        CipherSuite::Openpgp => Box::new(OpenpgpDuplex::new(inner, passphrase)),
    })
}
