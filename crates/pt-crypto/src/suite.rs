//! Cipher selection shared by the CLI and the mux layers.

use serde::{Deserialize, Serialize};

use crate::CryptoError;

pub const CIPHER_TYPE_AES_CTR: &str = "aes-ctr";
pub const CIPHER_TYPE_OPENSSL_AES_128_CTR: &str = "openssl-aes-128-ctr";
pub const CIPHER_TYPE_OPENSSL_AES_256_CTR: &str = "openssl-aes-256-ctr";
pub const CIPHER_TYPE_OPENPGP: &str = "openpgp";

/// Hash function for PBKDF2 in the OpenSSL-compatible modes
/// (`openssl enc -md ...`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HashAlgo {
    Sha1,
    Sha256,
    Sha512,
}

impl HashAlgo {
    /// The name `openssl enc -md` expects, for operator hints.
    pub fn openssl_name(self) -> &'static str {
        match self {
            HashAlgo::Sha1 => "sha1",
            HashAlgo::Sha256 => "sha256",
            HashAlgo::Sha512 => "sha512",
        }
    }
}

/// Key-derivation parameters transported out-of-band as
/// `{"iter": 100000, "hash": "sha256"}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pbkdf2Params {
    pub iter: u32,
    pub hash: HashAlgo,
}

impl Pbkdf2Params {
    pub fn parse(json: &str) -> Result<Self, CryptoError> {
        serde_json::from_str(json).map_err(|e| CryptoError::InvalidPbkdf2Config(e.to_string()))
    }
}

/// The cipher the tunnel endpoints agreed on out-of-band.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CipherSuite {
    AesCtr,
    OpensslAes128Ctr { pbkdf2: Pbkdf2Params },
    OpensslAes256Ctr { pbkdf2: Pbkdf2Params },
    Openpgp,
}

impl CipherSuite {
    /// Resolve `--cipher-type` plus the optional `--pbkdf2` JSON. Rejected
    /// before any network I/O happens.
    pub fn parse(cipher_type: &str, pbkdf2_json: Option<&str>) -> Result<Self, CryptoError> {
        match cipher_type {
            CIPHER_TYPE_AES_CTR => Ok(CipherSuite::AesCtr),
            CIPHER_TYPE_OPENPGP => Ok(CipherSuite::Openpgp),
            CIPHER_TYPE_OPENSSL_AES_128_CTR | CIPHER_TYPE_OPENSSL_AES_256_CTR => {
                let json = pbkdf2_json
                    .ok_or_else(|| CryptoError::MissingPbkdf2Config(cipher_type.to_owned()))?;
                let pbkdf2 = Pbkdf2Params::parse(json)?;
                if cipher_type == CIPHER_TYPE_OPENSSL_AES_128_CTR {
                    Ok(CipherSuite::OpensslAes128Ctr { pbkdf2 })
                } else {
                    Ok(CipherSuite::OpensslAes256Ctr { pbkdf2 })
                }
            }
            other => Err(CryptoError::InvalidCipherType(other.to_owned())),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            CipherSuite::AesCtr => CIPHER_TYPE_AES_CTR,
            CipherSuite::OpensslAes128Ctr { .. } => CIPHER_TYPE_OPENSSL_AES_128_CTR,
            CipherSuite::OpensslAes256Ctr { .. } => CIPHER_TYPE_OPENSSL_AES_256_CTR,
            CipherSuite::Openpgp => CIPHER_TYPE_OPENPGP,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_plain_cipher_types() {
        assert_eq!(
            CipherSuite::parse("aes-ctr", None).unwrap(),
            CipherSuite::AesCtr
        );
        assert_eq!(
            CipherSuite::parse("openpgp", None).unwrap(),
            CipherSuite::Openpgp
        );
    }

    #[test]
    fn openssl_types_require_pbkdf2_config() {
        assert!(matches!(
            CipherSuite::parse("openssl-aes-256-ctr", None),
            Err(CryptoError::MissingPbkdf2Config(_))
        ));

        let suite =
            CipherSuite::parse("openssl-aes-256-ctr", Some(r#"{"iter":100000,"hash":"sha256"}"#))
                .unwrap();
        assert_eq!(
            suite,
            CipherSuite::OpensslAes256Ctr {
                pbkdf2: Pbkdf2Params {
                    iter: 100_000,
                    hash: HashAlgo::Sha256
                }
            }
        );
    }

    #[test]
    fn unknown_cipher_type_is_rejected() {
        assert!(matches!(
            CipherSuite::parse("rot13", None),
            Err(CryptoError::InvalidCipherType(_))
        ));
    }

    #[test]
    fn bad_pbkdf2_json_is_rejected() {
        assert!(matches!(
            CipherSuite::parse("openssl-aes-128-ctr", Some(r#"{"iter":"many"}"#)),
            Err(CryptoError::InvalidPbkdf2Config(_))
        ));
    }
}
