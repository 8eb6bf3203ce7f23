//! # DropVault - Archive, Seal and Expire File Transfers
//!
//! DropVault bundles the files of a transfer into a single container, seals
//! that container with a key derived from the transfer's own metadata, serves
//! short-lived decrypted copies for download, and sweeps expired transfers
//! and stale copies in the background.
//!
//! ## Features
//!
//! - **Batched archiving**: Files are appended in fixed-size batches with a
//!   yield between batches; vanished source files are skipped
//! - **Context-derived keys**: Key from transfer name, email, password,
//!   timestamp or a manual secret; nothing key-related is stored
//! - **Two cipher paths**: Whole-buffer XChaCha20 for small archives,
//!   streamed AES-256-CTR above a size threshold
//! - **Ephemeral cache**: Decrypted copies are reused for one TTL, then
//!   recomputed
//! - **Retention**: Daily expired-transfer sweep, hourly cache sweep, and a
//!   forced run
//!
//! ## Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//! use dropvault::archive::ArchiveSource;
//! use dropvault::clock::SystemClock;
//! use dropvault::config::Config;
//! use dropvault::vault::{NewTransfer, Vault};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let cfg = Config::new("./storage", "./tmp", "./dropvault.db");
//!     let vault = Vault::open(&cfg, Arc::new(SystemClock)).await?;
//!
//!     let transfer = vault
//!         .create_transfer(NewTransfer {
//!             name: "ProjectX".into(),
//!             files: vec![ArchiveSource::new("report.pdf", "report.pdf", 1024)],
//!             ..Default::default()
//!         })
//!         .await?;
//!
//!     let download = vault.open_download(&transfer.id, None).await?;
//!     println!("decrypted archive at {}", download.path.display());
//!     Ok(())
//! }
//! ```
//!
//! ## Sealed Blob Formats
//!
//! - **Whole (`0x01`)**: marker, 24-byte nonce, XChaCha20 ciphertext
//! - **Stream (`0x02`)**: marker, 16-byte IV, AES-256-CTR stream under an
//!   Argon2id-stretched key

pub mod archive;
pub mod blob_store;
pub mod cache;
pub mod cipher;
pub mod clock;
pub mod config;
pub mod error;
pub mod keys;
pub mod locks;
pub mod model;
pub mod retention;
pub mod store;
pub mod vault;

// Re-export common types for convenience
pub use error::DropVaultError;
