//! OpenPGP symmetric-envelope duplex. Symmetric only: no signatures are
//! produced, and any signing metadata in the peer's message is ignored.
//!
//! sequoia's streaming serializer and decryptor work on blocking
//! `Read`/`Write`, so each direction runs on its own blocking task, joined to
//! the async stream through small channel-backed adapters. The decryptor
//! cannot be opened until the peer's envelope arrives; the first read
//! therefore blocks on a channel that delivers either plaintext or the setup
//! error.

use std::future::Future;
use std::io::{self, Read, Write};
use std::pin::Pin;
use std::task::{Context, Poll, ready};

use bytes::Bytes;
use sequoia_openpgp as openpgp;

use openpgp::crypto::{Password, SessionKey};
use openpgp::packet::{PKESK, SKESK};
use openpgp::parse::Parse;
use openpgp::parse::stream::{
    DecryptionHelper, DecryptorBuilder, MessageStructure, VerificationHelper,
};
use openpgp::policy::StandardPolicy;
use openpgp::serialize::stream::{Encryptor2, LiteralWriter, Message};
use openpgp::types::SymmetricAlgorithm;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::PollSender;

use pt_stream::TunnelStream;

pub struct OpenpgpDuplex {
    plaintext: PollSender<Bytes>,
    writer: Option<JoinHandle<io::Result<()>>>,
    decrypted: mpsc::Receiver<io::Result<Bytes>>,
    leftover: Bytes,
}

impl OpenpgpDuplex {
    pub fn new<S>(inner: S, passphrase: &[u8]) -> Self
    where
        S: TunnelStream + 'static,
    {
        let (mut rd, mut wr) = tokio::io::split(inner);
        let password: Password = passphrase.into();

        // Write path: plaintext chunks → blocking encryptor → ciphertext
        // chunks → inner write half. The returned handle resolves once the
        // envelope is finalized and the write half is shut down.
        let (plaintext_tx, mut plaintext_rx) = mpsc::channel::<Bytes>(1);
        let encrypt_password = password.clone();
        let writer = tokio::spawn(async move {
            let (cipher_tx, mut cipher_rx) = mpsc::channel::<Bytes>(1);
            let encrypt = tokio::task::spawn_blocking(move || {
                encrypt_loop(ChannelWriter { tx: cipher_tx }, encrypt_password, &mut plaintext_rx)
            });
            let mut drain_err = None;
            while let Some(chunk) = cipher_rx.recv().await {
                if let Err(e) = wr.write_all(&chunk).await {
                    drain_err = Some(e);
                    break;
                }
                if let Err(e) = wr.flush().await {
                    drain_err = Some(e);
                    break;
                }
            }
            // Dropping the receiver makes further encryptor writes fail.
            drop(cipher_rx);
            let encrypted = encrypt.await.unwrap_or_else(|e| Err(io::Error::other(e)));
            let shutdown = wr.shutdown().await;
            match drain_err {
                Some(e) => Err(e),
                None => encrypted.and(shutdown),
            }
        });

        // Read path: inner read half → raw chunks → blocking decryptor →
        // plaintext chunks.
        let (raw_tx, raw_rx) = mpsc::channel::<io::Result<Bytes>>(1);
        tokio::spawn(async move {
            let mut buf = vec![0u8; 8192];
            loop {
                match rd.read(&mut buf).await {
                    Ok(0) => break,
                    Ok(n) => {
                        if raw_tx.send(Ok(Bytes::copy_from_slice(&buf[..n]))).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        let _ = raw_tx.send(Err(e)).await;
                        break;
                    }
                }
            }
        });
        let (decrypted_tx, decrypted_rx) = mpsc::channel::<io::Result<Bytes>>(1);
        tokio::task::spawn_blocking(move || {
            decrypt_loop(
                ChannelReader {
                    rx: raw_rx,
                    leftover: Bytes::new(),
                },
                password,
                &decrypted_tx,
            );
        });

        Self {
            plaintext: PollSender::new(plaintext_tx),
            writer: Some(writer),
            decrypted: decrypted_rx,
            leftover: Bytes::new(),
        }
    }
}

fn pgp_err(e: impl std::fmt::Display) -> io::Error {
    io::Error::other(e.to_string())
}

fn encrypt_loop(
    mut sink: ChannelWriter,
    password: Password,
    plaintext: &mut mpsc::Receiver<Bytes>,
) -> io::Result<()> {
    let message = Message::new(&mut sink);
    let message = Encryptor2::with_passwords(message, Some(password))
        .build()
        .map_err(pgp_err)?;
    let mut literal = LiteralWriter::new(message).build().map_err(pgp_err)?;
    while let Some(chunk) = plaintext.blocking_recv() {
        literal.write_all(&chunk)?;
        literal.flush()?;
    }
    literal.finalize().map_err(pgp_err)?;
    Ok(())
}

fn decrypt_loop(source: ChannelReader, password: Password, out: &mpsc::Sender<io::Result<Bytes>>) {
    let policy = StandardPolicy::new();
    let helper = SymmetricHelper { password };
    let mut decryptor = match DecryptorBuilder::from_reader(source)
        .and_then(|builder| builder.with_policy(&policy, None, helper))
    {
        Ok(decryptor) => decryptor,
        Err(e) => {
            let _ = out.blocking_send(Err(pgp_err(e)));
            return;
        }
    };
    let mut buf = [0u8; 8192];
    loop {
        match decryptor.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => {
                if out.blocking_send(Ok(Bytes::copy_from_slice(&buf[..n]))).is_err() {
                    break;
                }
            }
            Err(e) => {
                let _ = out.blocking_send(Err(e));
                break;
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Blocking channel adapters
// ---------------------------------------------------------------------------

/// `io::Write` into an async channel; used from the blocking encryptor task.
struct ChannelWriter {
    tx: mpsc::Sender<Bytes>,
}

impl Write for ChannelWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.tx
            .blocking_send(Bytes::copy_from_slice(buf))
            .map_err(|_| io::Error::from(io::ErrorKind::BrokenPipe))?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// `io::Read` from an async channel; used from the blocking decryptor task.
struct ChannelReader {
    rx: mpsc::Receiver<io::Result<Bytes>>,
    leftover: Bytes,
}

impl Read for ChannelReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.leftover.is_empty() {
            match self.rx.blocking_recv() {
                Some(Ok(bytes)) => self.leftover = bytes,
                Some(Err(e)) => return Err(e),
                None => return Ok(0),
            }
        }
        let n = self.leftover.len().min(buf.len());
        buf[..n].copy_from_slice(&self.leftover.split_to(n));
        Ok(n)
    }
}

// ---------------------------------------------------------------------------
// Decryption helper (passphrase only)
// ---------------------------------------------------------------------------

struct SymmetricHelper {
    password: Password,
}

impl VerificationHelper for SymmetricHelper {
    fn get_certs(&mut self, _ids: &[openpgp::KeyHandle]) -> openpgp::Result<Vec<openpgp::Cert>> {
        Ok(Vec::new())
    }

    fn check(&mut self, _structure: MessageStructure) -> openpgp::Result<()> {
        // Symmetric only: signatures are neither expected nor verified.
        Ok(())
    }
}

impl DecryptionHelper for SymmetricHelper {
    fn decrypt<D>(
        &mut self,
        _pkesks: &[PKESK],
        skesks: &[SKESK],
        _sym_algo: Option<SymmetricAlgorithm>,
        mut decrypt: D,
    ) -> openpgp::Result<Option<openpgp::Fingerprint>>
    where
        D: FnMut(SymmetricAlgorithm, &SessionKey) -> bool,
    {
        for skesk in skesks {
            if let Ok((algo, session_key)) = skesk.decrypt(&self.password) {
                if decrypt(algo, &session_key) {
                    return Ok(None);
                }
            }
        }
        Err(openpgp::Error::MissingSessionKey("no usable symmetric session key".into()).into())
    }
}

// ---------------------------------------------------------------------------
// Async stream surface
// ---------------------------------------------------------------------------

impl AsyncRead for OpenpgpDuplex {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        if self.leftover.is_empty() {
            match ready!(self.decrypted.poll_recv(cx)) {
                Some(Ok(bytes)) => self.leftover = bytes,
                Some(Err(e)) => return Poll::Ready(Err(e)),
                None => return Poll::Ready(Ok(())),
            }
        }
        let n = self.leftover.len().min(buf.remaining());
        buf.put_slice(&self.leftover.split_to(n));
        Poll::Ready(Ok(()))
    }
}

impl AsyncWrite for OpenpgpDuplex {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        data: &[u8],
    ) -> Poll<io::Result<usize>> {
        match ready!(self.plaintext.poll_reserve(cx)) {
            Ok(()) => {
                if self
                    .plaintext
                    .send_item(Bytes::copy_from_slice(data))
                    .is_err()
                {
                    return Poll::Ready(Err(io::ErrorKind::BrokenPipe.into()));
                }
                Poll::Ready(Ok(data.len()))
            }
            Err(_) => Poll::Ready(Err(io::ErrorKind::BrokenPipe.into())),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        // Chunks are flushed by the encryptor task as they drain.
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.plaintext.close();
        match &mut self.writer {
            Some(writer) => {
                let joined = ready!(Pin::new(writer).poll(cx));
                self.writer = None;
                Poll::Ready(joined.unwrap_or_else(|e| Err(io::Error::other(e))))
            }
            None => Poll::Ready(Ok(())),
        }
    }
}
