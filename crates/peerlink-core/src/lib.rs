//! # PeerLink Core Library
//!
//! `peerlink-core` provides the core functionality for PeerLink, a
//! point-to-point file exchange system for two devices that are already
//! linked over an ad-hoc network (for example a Wi-Fi Direct group).
//!
//! ## Features
//!
//! - **Connection supervision**: one explicit state machine per peer link with
//!   connect timeout, bounded retry, keep-alive and orderly teardown
//! - **Simple wire protocol**: list, download and upload over one short-lived
//!   TCP connection per operation
//! - **Folder sync**: name-based reconciliation of two shared folders
//! - **Atomic writes**: received files appear whole or not at all
//!
//! ## Modules
//!
//! - [`config`] - Configuration management
//! - [`connection`] - Link transport boundary and the connection supervisor
//! - [`mod@file`] - Storage providers and the shared-folder catalog
//! - [`history`] - Transfer log sink and in-memory history
//! - [`protocol`] - Wire protocol commands, replies and codecs
//! - [`sync`] - Folder reconciliation
//! - [`transfer`] - Transfer client and server
//!
//! ## Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use peerlink_core::file::{FileCatalog, LocalStorage};
//! use peerlink_core::transfer::{TransferClient, TransferServer};
//! use peerlink_core::sync::SyncCoordinator;
//!
//! let catalog = Arc::new(FileCatalog::new(Arc::new(LocalStorage::new("./shared")?)));
//! let server = TransferServer::new(catalog.clone(), config.transfer.clone());
//! server.start().await?;
//!
//! let client = TransferClient::from_host("192.168.49.1", config.transfer.clone())?;
//! let report = SyncCoordinator::new(catalog, client, config.sync.clone()).sync().await?;
//! println!("{} down, {} up", report.downloaded.len(), report.uploaded.len());
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::unused_async)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::doc_markdown)]
#![allow(clippy::missing_const_for_fn)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::cast_precision_loss)]

pub mod config;
pub mod connection;
pub mod error;
pub mod file;
pub mod history;
pub mod protocol;
pub mod sync;
pub mod transfer;

pub use error::{Error, Result};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default TCP port of the transfer server
pub const DEFAULT_TRANSFER_PORT: u16 = 8988;

/// Default chunk size for streaming file bytes (8 KiB)
pub const DEFAULT_CHUNK_SIZE: usize = 8 * 1024;
