//! Multi-file archive container.
//!
//! This module provides [`Archiver`], which streams N source files into one
//! container blob in fixed-size batches, and [`ArchiveReader`] for listing
//! and extracting a finished container.
//!
//! ## Container Format
//!
//! ```text
//! [magic:4 "DVAR"][version:1][flags:1]
//! per entry:
//!   [tag:1 = 0x01][name_len:2][name][size:8]
//!   [chunk_len:4][chunk]... [chunk_len:4 = 0]
//! [tag:1 = 0x00][entry_count:4]
//! ```
//!
//! All integers are big-endian. Chunks carry at most 64KB of source data,
//! deflated individually when the compression flag is set, so neither
//! writing nor reading ever holds more than one chunk of a file in memory.

use flate2::read::DeflateDecoder;
use flate2::write::DeflateEncoder;
use flate2::Compression;
use std::io::{ErrorKind, Read, Write};
use std::path::{Component, Path, PathBuf};
use tokio::fs;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader, BufWriter};
use tracing::{debug, info, warn};

use crate::blob_store::BlobStore;
use crate::error::{DropVaultError, Result};

pub const MAGIC: &[u8; 4] = b"DVAR";
pub const FORMAT_VERSION: u8 = 1;

/// Source bytes per chunk (64KB)
const CHUNK_SIZE: usize = 64 * 1024;

/// Upper bound on an encoded chunk; deflate can expand incompressible input slightly
const MAX_FRAME: usize = CHUNK_SIZE * 2;

const TAG_ENTRY: u8 = 0x01;
const TAG_END: u8 = 0x00;

const FLAG_DEFLATE: u8 = 0x01;

/// One file to append: where to read it and what to call it inside the archive.
#[derive(Debug, Clone)]
pub struct ArchiveSource {
    pub source_path: PathBuf,
    pub destination_name: String,
    pub size: u64,
}

impl ArchiveSource {
    pub fn new(source_path: impl Into<PathBuf>, destination_name: impl Into<String>, size: u64) -> Self {
        Self {
            source_path: source_path.into(),
            destination_name: destination_name.into(),
            size,
        }
    }
}

#[derive(Debug)]
pub struct ArchiveOutcome {
    /// Plaintext container, owned by the caller until promoted or discarded
    pub temp_path: PathBuf,
    pub bytes_written: u64,
    pub entries_written: usize,
    /// Sources that had vanished by append time
    pub skipped: Vec<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveEntry {
    pub name: String,
    pub size: u64,
}

pub struct Archiver {
    blobs: BlobStore,
    compress: bool,
}

impl Archiver {
    pub fn new(blobs: BlobStore) -> Self {
        Self {
            blobs,
            compress: false,
        }
    }

    pub fn with_compression(mut self, compress: bool) -> Self {
        self.compress = compress;
        self
    }

    /// Build the container for `transfer_id` from `files`, `batch_size` files at a time.
    ///
    /// Returns only after the output stream has been flushed, synced and
    /// closed, so the result is safe to promote or encrypt. On error the
    /// partial file at the temp path is left for the caller to discard.
    pub async fn build_archive(
        &self,
        transfer_id: &str,
        files: &[ArchiveSource],
        batch_size: usize,
    ) -> Result<ArchiveOutcome> {
        if batch_size == 0 {
            return Err(DropVaultError::config("archive batch size must be at least 1"));
        }

        let temp_path = self.blobs.temp_path(transfer_id)?;
        if let Some(parent) = temp_path.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| DropVaultError::write(parent, e))?;
        }

        debug!(
            transfer_id,
            files = files.len(),
            batch_size,
            compress = self.compress,
            "building archive"
        );

        let file = fs::File::create(&temp_path)
            .await
            .map_err(|e| DropVaultError::write(&temp_path, e))?;
        let mut writer = ContainerWriter::new(BufWriter::new(file), &temp_path, self.compress);
        writer.write_header().await?;

        let mut skipped = Vec::new();
        for (batch_no, batch) in files.chunks(batch_size).enumerate() {
            for source in batch {
                match writer.append(source).await {
                    Ok(()) => {}
                    Err(DropVaultError::SourceFileMissing(path)) => {
                        warn!(transfer_id, path = %path.display(), "source file missing, skipping");
                        skipped.push(path);
                    }
                    Err(e) => return Err(e),
                }
            }

            writer.flush().await?;
            debug!(transfer_id, batch = batch_no, entries = writer.entries, "batch appended");
            // Let other tasks run and reclaim buffers between batches
            tokio::task::yield_now().await;
        }

        let entries_written = writer.entries as usize;
        let (mut out, bytes_written) = writer.finish().await?;
        out.get_mut()
            .sync_all()
            .await
            .map_err(|e| DropVaultError::write(&temp_path, e))?;
        out.shutdown()
            .await
            .map_err(|e| DropVaultError::write(&temp_path, e))?;
        drop(out);

        info!(
            transfer_id,
            entries = entries_written,
            skipped = skipped.len(),
            bytes = bytes_written,
            "archive built"
        );

        Ok(ArchiveOutcome {
            temp_path,
            bytes_written,
            entries_written,
            skipped,
        })
    }
}

struct ContainerWriter<W> {
    inner: W,
    path: PathBuf,
    compress: bool,
    written: u64,
    entries: u32,
}

impl<W: AsyncWrite + Unpin> ContainerWriter<W> {
    fn new(inner: W, path: &Path, compress: bool) -> Self {
        Self {
            inner,
            path: path.to_path_buf(),
            compress,
            written: 0,
            entries: 0,
        }
    }

    async fn put(&mut self, bytes: &[u8]) -> Result<()> {
        self.inner
            .write_all(bytes)
            .await
            .map_err(|e| DropVaultError::write(&self.path, e))?;
        self.written += bytes.len() as u64;
        Ok(())
    }

    async fn flush(&mut self) -> Result<()> {
        self.inner
            .flush()
            .await
            .map_err(|e| DropVaultError::write(&self.path, e))
    }

    async fn write_header(&mut self) -> Result<()> {
        let flags = if self.compress { FLAG_DEFLATE } else { 0 };
        let mut header = Vec::with_capacity(6);
        header.extend_from_slice(MAGIC);
        header.push(FORMAT_VERSION);
        header.push(flags);
        self.put(&header).await
    }

    async fn append(&mut self, source: &ArchiveSource) -> Result<()> {
        let path = &source.source_path;
        let file = match fs::File::open(path).await {
            Ok(f) => f,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(DropVaultError::SourceFileMissing(path.clone()))
            }
            Err(e) => return Err(DropVaultError::read(path, e)),
        };
        let actual_size = file
            .metadata()
            .await
            .map_err(|e| DropVaultError::read(path, e))?
            .len();
        if actual_size != source.size {
            debug!(
                path = %path.display(),
                expected = source.size,
                actual = actual_size,
                "source size changed since enqueue"
            );
        }

        let name = entry_name(source);
        let name_len = u16::try_from(name.len())
            .map_err(|_| DropVaultError::format(format!("entry name too long: {} bytes", name.len())))?;

        let mut entry_header = Vec::with_capacity(1 + 2 + name.len() + 8);
        entry_header.push(TAG_ENTRY);
        entry_header.extend_from_slice(&name_len.to_be_bytes());
        entry_header.extend_from_slice(name.as_bytes());
        entry_header.extend_from_slice(&actual_size.to_be_bytes());
        self.put(&entry_header).await?;

        let mut reader = BufReader::new(file);
        let mut buffer = vec![0u8; CHUNK_SIZE];
        let mut streamed = 0u64;
        loop {
            let n = read_full(&mut reader, &mut buffer)
                .await
                .map_err(|e| DropVaultError::read(path, e))?;
            if n == 0 {
                break;
            }
            streamed += n as u64;

            let frame = if self.compress {
                deflate_chunk(&buffer[..n]).map_err(|e| DropVaultError::write(&self.path, e))?
            } else {
                buffer[..n].to_vec()
            };
            self.put(&(frame.len() as u32).to_be_bytes()).await?;
            self.put(&frame).await?;
        }
        self.put(&0u32.to_be_bytes()).await?;

        if streamed != actual_size {
            warn!(path = %path.display(), declared = actual_size, streamed, "source changed while archiving");
        }

        self.entries += 1;
        Ok(())
    }

    /// Write the trailer and flush. Returns the inner writer and total bytes written.
    async fn finish(mut self) -> Result<(W, u64)> {
        let mut trailer = [0u8; 5];
        trailer[0] = TAG_END;
        trailer[1..].copy_from_slice(&self.entries.to_be_bytes());
        self.put(&trailer).await?;
        self.flush().await?;
        Ok((self.inner, self.written))
    }
}

fn entry_name(source: &ArchiveSource) -> String {
    if !source.destination_name.is_empty() {
        return source.destination_name.clone();
    }
    source
        .source_path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "unnamed".to_string())
}

/// Fill `buf` as far as possible; returns fewer bytes only at EOF.
pub(crate) async fn read_full<R: AsyncRead + Unpin>(reader: &mut R, buf: &mut [u8]) -> std::io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = reader.read(&mut buf[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}

fn deflate_chunk(data: &[u8]) -> std::io::Result<Vec<u8>> {
    let mut enc = DeflateEncoder::new(Vec::with_capacity(data.len() / 2), Compression::default());
    enc.write_all(data)?;
    enc.finish()
}

fn inflate_chunk(data: &[u8]) -> Result<Vec<u8>> {
    let mut out = Vec::with_capacity(CHUNK_SIZE);
    DeflateDecoder::new(data)
        .take(CHUNK_SIZE as u64 + 1)
        .read_to_end(&mut out)
        .map_err(|e| DropVaultError::format(format!("bad deflate chunk: {e}")))?;
    if out.len() > CHUNK_SIZE {
        return Err(DropVaultError::format("inflated chunk exceeds chunk size"));
    }
    Ok(out)
}

/// Turn an archive entry name into a relative path with no `..`, root or prefix parts.
pub fn sanitize_entry_name(name: &str) -> Option<PathBuf> {
    let normalized = name.replace('\\', "/");
    let mut out = PathBuf::new();
    for component in Path::new(&normalized).components() {
        if let Component::Normal(part) = component {
            out.push(part);
        }
    }
    if out.as_os_str().is_empty() {
        None
    } else {
        Some(out)
    }
}

/// Reads containers produced by [`Archiver`].
pub struct ArchiveReader;

impl ArchiveReader {
    /// List entries without extracting them
    pub async fn list(path: &Path) -> Result<Vec<ArchiveEntry>> {
        Self::walk(path, None).await
    }

    /// Extract every entry below `dest_dir`
    pub async fn extract(path: &Path, dest_dir: &Path) -> Result<Vec<ArchiveEntry>> {
        fs::create_dir_all(dest_dir)
            .await
            .map_err(|e| DropVaultError::write(dest_dir, e))?;
        Self::walk(path, Some(dest_dir)).await
    }

    async fn walk(path: &Path, dest_dir: Option<&Path>) -> Result<Vec<ArchiveEntry>> {
        let file = fs::File::open(path)
            .await
            .map_err(|e| DropVaultError::read(path, e))?;
        let mut reader = BufReader::new(file);
        let rd = |e: std::io::Error| read_error(path, e);

        let mut magic = [0u8; 4];
        reader.read_exact(&mut magic).await.map_err(rd)?;
        if &magic != MAGIC {
            return Err(DropVaultError::format("not a dropvault archive (bad magic)"));
        }
        let version = reader.read_u8().await.map_err(rd)?;
        if version != FORMAT_VERSION {
            return Err(DropVaultError::format(format!("unsupported archive version: {version}")));
        }
        let compressed = reader.read_u8().await.map_err(rd)? & FLAG_DEFLATE != 0;

        let mut entries = Vec::new();
        loop {
            match reader.read_u8().await.map_err(rd)? {
                TAG_END => {
                    let count = reader.read_u32().await.map_err(rd)?;
                    if count as usize != entries.len() {
                        return Err(DropVaultError::format(format!(
                            "trailer claims {count} entries, found {}",
                            entries.len()
                        )));
                    }
                    break;
                }
                TAG_ENTRY => {
                    let name_len = reader.read_u16().await.map_err(rd)? as usize;
                    let mut name_buf = vec![0u8; name_len];
                    reader.read_exact(&mut name_buf).await.map_err(rd)?;
                    let name = String::from_utf8(name_buf)
                        .map_err(|_| DropVaultError::format("entry name is not utf-8"))?;
                    let size = reader.read_u64().await.map_err(rd)?;

                    let mut out = match dest_dir {
                        Some(dir) => {
                            let rel = sanitize_entry_name(&name).ok_or_else(|| {
                                DropVaultError::format(format!("unusable entry name: {name:?}"))
                            })?;
                            let target = dir.join(rel);
                            if let Some(parent) = target.parent() {
                                fs::create_dir_all(parent)
                                    .await
                                    .map_err(|e| DropVaultError::write(parent, e))?;
                            }
                            let f = fs::File::create(&target)
                                .await
                                .map_err(|e| DropVaultError::write(&target, e))?;
                            Some((BufWriter::new(f), target))
                        }
                        None => None,
                    };

                    let mut frame = Vec::new();
                    loop {
                        let len = reader.read_u32().await.map_err(rd)? as usize;
                        if len == 0 {
                            break;
                        }
                        if len > MAX_FRAME {
                            return Err(DropVaultError::format(format!("chunk too large: {len} bytes")));
                        }
                        frame.resize(len, 0);
                        reader.read_exact(&mut frame).await.map_err(rd)?;
                        if let Some((w, target)) = out.as_mut() {
                            let data = if compressed { inflate_chunk(&frame)? } else { frame.clone() };
                            w.write_all(&data)
                                .await
                                .map_err(|e| DropVaultError::write(target.as_path(), e))?;
                        }
                    }

                    if let Some((mut w, target)) = out {
                        w.flush().await.map_err(|e| DropVaultError::write(&target, e))?;
                    }
                    entries.push(ArchiveEntry { name, size });
                }
                other => {
                    return Err(DropVaultError::format(format!("unknown record tag: {other:#04x}")));
                }
            }
        }

        Ok(entries)
    }
}

fn read_error(path: &Path, e: std::io::Error) -> DropVaultError {
    if e.kind() == ErrorKind::UnexpectedEof {
        DropVaultError::format("archive is truncated")
    } else {
        DropVaultError::read(path, e)
    }
}
