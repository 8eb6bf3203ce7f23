//! Archive encryption at rest.
//!
//! This module provides [`CipherEngine`], which seals one archive blob with a
//! key derived from transfer context and reverses it on download.
//!
//! ## Sealed Formats
//!
//! ```text
//! whole-payload (below threshold): [format:1 = 0x01][nonce:24][XChaCha20 ciphertext]
//! streamed      (at/above):        [format:1 = 0x02][iv:16][AES-256-CTR stream]
//! ```
//!
//! The whole-payload path reads the archive into memory; the streamed path
//! processes 64KB at a time and uses an Argon2id-stretched key. Neither
//! format carries an authentication tag: decrypting with the wrong context
//! yields different bytes rather than an error.

use aes::Aes256;
use chacha20::cipher::{KeyIvInit, StreamCipher};
use chacha20::XChaCha20;
use rand_core::{OsRng, RngCore};
use std::path::Path;
use std::sync::Arc;
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufReader, BufWriter};
use tracing::{debug, info};

use crate::archive::read_full;
use crate::clock::Clock;
use crate::config::CipherConfig;
use crate::error::{DropVaultError, Result};
use crate::keys::{derive_key, stretch_key, DerivedKey, KeySource, TransferContext};

type Aes256Ctr = ctr::Ctr128BE<Aes256>;

/// Format marker for whole-payload sealing
pub const FORMAT_WHOLE: u8 = 0x01;
/// Format marker for streamed sealing
pub const FORMAT_STREAM: u8 = 0x02;

pub const NONCE_LEN: usize = 24;
pub const IV_LEN: usize = 16;

/// Chunk size for streamed encryption (64KB)
const CHUNK_SIZE: usize = 64 * 1024;

pub struct CipherEngine {
    config: CipherConfig,
    clock: Arc<dyn Clock>,
}

impl CipherEngine {
    pub fn new(config: CipherConfig, clock: Arc<dyn Clock>) -> Self {
        Self { config, clock }
    }

    pub fn config(&self) -> &CipherConfig {
        &self.config
    }

    pub fn key_source(&self) -> KeySource {
        self.config.key_source
    }

    pub fn derive_key(&self, ctx: &TransferContext) -> Result<DerivedKey> {
        derive_key(
            self.config.key_source,
            ctx,
            self.config.manual_key.as_deref(),
            self.clock.as_ref(),
        )
    }

    /// Seal `plain_path` into `cipher_path`. Returns bytes written.
    ///
    /// Fails before creating any output when the context lacks the field the
    /// key source needs.
    pub async fn encrypt(
        &self,
        plain_path: &Path,
        cipher_path: &Path,
        ctx: &TransferContext,
    ) -> Result<u64> {
        if !self.config.enabled {
            debug!(path = %plain_path.display(), "encryption disabled, copying archive");
            return passthrough(plain_path, cipher_path).await;
        }

        let size = fs::metadata(plain_path)
            .await
            .map_err(|e| DropVaultError::read(plain_path, e))?
            .len();
        let key = self.derive_key(ctx)?;

        let written = if size < self.config.large_threshold_bytes {
            encrypt_whole(&key, plain_path, cipher_path).await?
        } else {
            let block_key = stretch(key).await?;
            encrypt_stream(&block_key, plain_path, cipher_path).await?
        };

        info!(
            key_source = %self.config.key_source,
            mode = if size < self.config.large_threshold_bytes { "whole" } else { "stream" },
            plain_bytes = size,
            sealed_bytes = written,
            "archive encrypted"
        );
        Ok(written)
    }

    /// Reverse [`encrypt`](Self::encrypt). Returns plaintext bytes written.
    ///
    /// Empty input, an unknown format marker, or input shorter than the
    /// format's nonce/IV prefix is [`DropVaultError::CorruptArchiveInput`];
    /// no output file is created in that case.
    pub async fn decrypt(
        &self,
        cipher_path: &Path,
        plain_path: &Path,
        ctx: &TransferContext,
    ) -> Result<u64> {
        if !self.config.enabled {
            debug!(path = %cipher_path.display(), "encryption disabled, copying archive");
            return passthrough(cipher_path, plain_path).await;
        }

        let file = fs::File::open(cipher_path)
            .await
            .map_err(|e| DropVaultError::read(cipher_path, e))?;
        let mut reader = BufReader::new(file);

        let mut marker = [0u8; 1];
        let n = reader
            .read(&mut marker)
            .await
            .map_err(|e| DropVaultError::read(cipher_path, e))?;
        if n == 0 {
            return Err(DropVaultError::corrupt("sealed archive is empty"));
        }

        let key = self.derive_key(ctx)?;
        let written = match marker[0] {
            FORMAT_WHOLE => decrypt_whole(&key, reader, cipher_path, plain_path).await?,
            FORMAT_STREAM => {
                let mut iv = [0u8; IV_LEN];
                read_prefix(&mut reader, &mut iv, cipher_path).await?;
                let block_key = stretch(key).await?;
                decrypt_stream(&block_key, &iv, reader, cipher_path, plain_path).await?
            }
            other => {
                return Err(DropVaultError::corrupt(format!(
                    "unknown sealed format marker {other:#04x}"
                )))
            }
        };

        info!(
            key_source = %self.config.key_source,
            format = marker[0],
            bytes = written,
            "archive decrypted"
        );
        Ok(written)
    }
}

async fn stretch(key: DerivedKey) -> Result<DerivedKey> {
    tokio::task::spawn_blocking(move || stretch_key(&key)).await?
}

async fn passthrough(from: &Path, to: &Path) -> Result<u64> {
    fs::metadata(from)
        .await
        .map_err(|e| DropVaultError::read(from, e))?;
    fs::copy(from, to)
        .await
        .map_err(|e| DropVaultError::write(to, e))
}

/// Read exactly `buf.len()` prefix bytes; a short read means corrupt input.
async fn read_prefix<R: tokio::io::AsyncRead + Unpin>(
    reader: &mut R,
    buf: &mut [u8],
    path: &Path,
) -> Result<()> {
    match reader.read_exact(buf).await {
        Ok(_) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => Err(DropVaultError::corrupt(
            format!("sealed archive shorter than its {}-byte prefix", buf.len()),
        )),
        Err(e) => Err(DropVaultError::read(path, e)),
    }
}

fn cipher_init_error(e: impl std::fmt::Display) -> DropVaultError {
    DropVaultError::config(format!("cipher initialisation failed: {e}"))
}

async fn encrypt_whole(key: &DerivedKey, plain_path: &Path, cipher_path: &Path) -> Result<u64> {
    let mut data = fs::read(plain_path)
        .await
        .map_err(|e| DropVaultError::read(plain_path, e))?;

    let mut nonce = [0u8; NONCE_LEN];
    OsRng.fill_bytes(&mut nonce);
    let mut cipher = XChaCha20::new_from_slices(key.as_bytes(), &nonce).map_err(cipher_init_error)?;
    cipher.apply_keystream(&mut data);

    let mut out = Vec::with_capacity(1 + NONCE_LEN + data.len());
    out.push(FORMAT_WHOLE);
    out.extend_from_slice(&nonce);
    out.extend_from_slice(&data);

    fs::write(cipher_path, &out)
        .await
        .map_err(|e| DropVaultError::write(cipher_path, e))?;
    Ok(out.len() as u64)
}

async fn decrypt_whole(
    key: &DerivedKey,
    mut reader: BufReader<fs::File>,
    cipher_path: &Path,
    plain_path: &Path,
) -> Result<u64> {
    let mut nonce = [0u8; NONCE_LEN];
    read_prefix(&mut reader, &mut nonce, cipher_path).await?;

    let mut data = Vec::new();
    reader
        .read_to_end(&mut data)
        .await
        .map_err(|e| DropVaultError::read(cipher_path, e))?;

    let mut cipher = XChaCha20::new_from_slices(key.as_bytes(), &nonce).map_err(cipher_init_error)?;
    cipher.apply_keystream(&mut data);

    fs::write(plain_path, &data)
        .await
        .map_err(|e| DropVaultError::write(plain_path, e))?;
    Ok(data.len() as u64)
}

async fn encrypt_stream(key: &DerivedKey, plain_path: &Path, cipher_path: &Path) -> Result<u64> {
    let mut iv = [0u8; IV_LEN];
    OsRng.fill_bytes(&mut iv);
    let mut cipher = Aes256Ctr::new_from_slices(key.as_bytes(), &iv).map_err(cipher_init_error)?;

    let input = fs::File::open(plain_path)
        .await
        .map_err(|e| DropVaultError::read(plain_path, e))?;
    let mut reader = BufReader::new(input);
    let output = fs::File::create(cipher_path)
        .await
        .map_err(|e| DropVaultError::write(cipher_path, e))?;
    let mut writer = BufWriter::new(output);
    let wr = |e| DropVaultError::write(cipher_path, e);

    writer.write_u8(FORMAT_STREAM).await.map_err(wr)?;
    writer.write_all(&iv).await.map_err(wr)?;
    let mut total = (1 + IV_LEN) as u64;

    let mut buffer = vec![0u8; CHUNK_SIZE];
    loop {
        let n = read_full(&mut reader, &mut buffer)
            .await
            .map_err(|e| DropVaultError::read(plain_path, e))?;
        if n == 0 {
            break;
        }
        cipher.apply_keystream(&mut buffer[..n]);
        writer.write_all(&buffer[..n]).await.map_err(wr)?;
        total += n as u64;
    }

    writer.flush().await.map_err(wr)?;
    writer.get_mut().sync_all().await.map_err(wr)?;
    Ok(total)
}

async fn decrypt_stream(
    key: &DerivedKey,
    iv: &[u8; IV_LEN],
    mut reader: BufReader<fs::File>,
    cipher_path: &Path,
    plain_path: &Path,
) -> Result<u64> {
    let mut cipher = Aes256Ctr::new_from_slices(key.as_bytes(), iv).map_err(cipher_init_error)?;

    let output = fs::File::create(plain_path)
        .await
        .map_err(|e| DropVaultError::write(plain_path, e))?;
    let mut writer = BufWriter::new(output);
    let wr = |e| DropVaultError::write(plain_path, e);

    let mut buffer = vec![0u8; CHUNK_SIZE];
    let mut total = 0u64;
    loop {
        let n = read_full(&mut reader, &mut buffer)
            .await
            .map_err(|e| DropVaultError::read(cipher_path, e))?;
        if n == 0 {
            break;
        }
        cipher.apply_keystream(&mut buffer[..n]);
        writer.write_all(&buffer[..n]).await.map_err(wr)?;
        total += n as u64;
    }

    writer.flush().await.map_err(wr)?;
    Ok(total)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{from_millis, ManualClock};
    use tempfile::TempDir;

    const THRESHOLD: u64 = 4 * 1024;

    fn engine(key_source: KeySource) -> CipherEngine {
        let config = CipherConfig {
            enabled: true,
            key_source,
            manual_key: Some("operator-secret".into()),
            large_threshold_bytes: THRESHOLD,
        };
        let clock = Arc::new(ManualClock::new(from_millis(1_700_000_000_000).unwrap()));
        CipherEngine::new(config, clock)
    }

    fn full_context() -> TransferContext {
        TransferContext {
            name: "ProjectX".into(),
            recipient_email: Some("recipient@example.com".into()),
            password: Some("correct horse".into()),
            created_at: from_millis(1_690_000_000_000),
        }
    }

    fn payload(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i * 31 % 256) as u8).collect()
    }

    async fn round_trip(engine: &CipherEngine, data: &[u8], ctx: &TransferContext) -> (Vec<u8>, Vec<u8>) {
        let tmp = TempDir::new().unwrap();
        let plain = tmp.path().join("plain");
        let sealed = tmp.path().join("sealed");
        let opened = tmp.path().join("opened");
        fs::write(&plain, data).await.unwrap();

        engine.encrypt(&plain, &sealed, ctx).await.unwrap();
        engine.decrypt(&sealed, &opened, ctx).await.unwrap();
        (fs::read(&sealed).await.unwrap(), fs::read(&opened).await.unwrap())
    }

    #[tokio::test]
    async fn test_disabled_is_byte_identical_copy() {
        let clock = Arc::new(ManualClock::new(from_millis(0).unwrap()));
        let engine = CipherEngine::new(CipherConfig::disabled(), clock);
        let data = payload(10_000);

        let (sealed, opened) = round_trip(&engine, &data, &TransferContext::default()).await;
        assert_eq!(sealed, data);
        assert_eq!(opened, data);
    }

    #[tokio::test]
    async fn test_round_trip_every_source_both_paths() {
        let ctx = full_context();
        for source in [
            KeySource::Manual,
            KeySource::TransferName,
            KeySource::Email,
            KeySource::Password,
            KeySource::Timestamp,
        ] {
            let engine = engine(source);

            let small = payload(100);
            let (sealed, opened) = round_trip(&engine, &small, &ctx).await;
            assert_eq!(sealed[0], FORMAT_WHOLE, "{source}");
            assert_ne!(&sealed[1 + NONCE_LEN..], &small[..], "{source}");
            assert_eq!(opened, small, "{source}");

            let large = payload(THRESHOLD as usize * 40 + 3);
            let (sealed, opened) = round_trip(&engine, &large, &ctx).await;
            assert_eq!(sealed[0], FORMAT_STREAM, "{source}");
            assert_eq!(sealed.len(), 1 + IV_LEN + large.len());
            assert_eq!(opened, large, "{source}");
        }
    }

    #[tokio::test]
    async fn test_threshold_is_inclusive_for_stream_path() {
        let engine = engine(KeySource::TransferName);
        let data = payload(THRESHOLD as usize);
        let (sealed, opened) = round_trip(&engine, &data, &full_context()).await;
        assert_eq!(sealed[0], FORMAT_STREAM);
        assert_eq!(opened, data);

        let data = payload(THRESHOLD as usize - 1);
        let (sealed, _) = round_trip(&engine, &data, &full_context()).await;
        assert_eq!(sealed[0], FORMAT_WHOLE);
    }

    #[tokio::test]
    async fn test_project_name_scenario() {
        let engine = engine(KeySource::TransferName);
        let tmp = TempDir::new().unwrap();
        let plain = tmp.path().join("plain");
        let sealed = tmp.path().join("sealed");
        let data = b"0123456789".to_vec();
        fs::write(&plain, &data).await.unwrap();

        engine
            .encrypt(&plain, &sealed, &TransferContext::named("ProjectX"))
            .await
            .unwrap();

        let right = tmp.path().join("right");
        engine
            .decrypt(&sealed, &right, &TransferContext::named("ProjectX"))
            .await
            .unwrap();
        assert_eq!(fs::read(&right).await.unwrap(), data);

        let wrong = tmp.path().join("wrong");
        engine
            .decrypt(&sealed, &wrong, &TransferContext::named("ProjectY"))
            .await
            .unwrap();
        let garbage = fs::read(&wrong).await.unwrap();
        assert_eq!(garbage.len(), data.len());
        assert_ne!(garbage, data);
    }

    #[tokio::test]
    async fn test_truncated_input_is_corrupt() {
        let engine = engine(KeySource::TransferName);
        let ctx = full_context();
        let tmp = TempDir::new().unwrap();
        let out = tmp.path().join("out");

        let cases: Vec<Vec<u8>> = vec![
            vec![],
            vec![FORMAT_STREAM],
            {
                let mut v = vec![FORMAT_STREAM];
                v.extend_from_slice(&[0u8; IV_LEN - 1]);
                v
            },
            {
                let mut v = vec![FORMAT_WHOLE];
                v.extend_from_slice(&[0u8; NONCE_LEN - 1]);
                v
            },
            vec![0x7f, 1, 2, 3],
        ];

        for (i, bytes) in cases.into_iter().enumerate() {
            let sealed = tmp.path().join(format!("sealed_{i}"));
            fs::write(&sealed, &bytes).await.unwrap();
            let err = engine.decrypt(&sealed, &out, &ctx).await.unwrap_err();
            assert!(
                matches!(err, DropVaultError::CorruptArchiveInput(_)),
                "case {i}: {err:?}"
            );
            assert!(!out.exists(), "case {i} produced output");
        }
    }

    #[tokio::test]
    async fn test_missing_context_writes_nothing() {
        let engine = engine(KeySource::Email);
        let tmp = TempDir::new().unwrap();
        let plain = tmp.path().join("plain");
        let sealed = tmp.path().join("sealed");
        fs::write(&plain, b"data").await.unwrap();

        let err = engine
            .encrypt(&plain, &sealed, &TransferContext::named("no email"))
            .await
            .unwrap_err();
        assert!(matches!(err, DropVaultError::MissingKeyContext { .. }));
        assert!(!sealed.exists());
    }

    #[tokio::test]
    async fn test_fresh_nonce_per_operation() {
        let engine = engine(KeySource::TransferName);
        let data = payload(64);
        let (a, _) = round_trip(&engine, &data, &full_context()).await;
        let (b, _) = round_trip(&engine, &data, &full_context()).await;
        assert_ne!(a, b);
    }
}
