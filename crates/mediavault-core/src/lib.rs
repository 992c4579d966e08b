//! Core library for `MediaVault`.
//!
//! Turns photo and video files into encrypted, metadata-tagged blobs on disk,
//! materializes them back into short-lived plaintext files, and destroys
//! blobs and their plaintext copies with a multi-pass secure erase.
//!
//! The [`store::BlobStore`] façade is the entry point. It owns a
//! [`keystore::KeyStore`] (injected, never global), encrypts with
//! [`crypto`], names and checks blobs with [`hasher`], lays them out with
//! [`format`], and destroys them through [`eraser`].

pub mod config;
pub mod crypto;
pub mod eraser;
pub mod error;
pub mod format;
pub mod hasher;
pub mod keystore;
pub mod locks;
pub mod manifest;
pub mod store;

pub use config::{IntegrityPolicy, VaultConfig};
pub use error::BlobError;
pub use keystore::KeyStore;
pub use store::{BlobInfo, BlobStore, Integrity, Materialized, StoreOutcome};
