//! # apikit
//!
//! Blocking client for the LLM platform's REST API.
//!
//! This crate provides:
//! - A [`Transport`] seam with a `ureq` implementation and an in-memory mock
//! - Scoped credentials: project keys and organization admin keys
//! - A categorized error taxonomy driving retry and self-healing decisions
//! - Bounded exponential backoff for transient failures
//! - A lazy cursor walker for every list endpoint
//! - The chunked upload state machine
//!
//! ## Example
//!
//! ```no_run
//! use apikit::{Client, Credentials, ListQuery, UreqTransport};
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! let transport = UreqTransport::new("https://api.openai.com/v1", Duration::from_secs(60));
//! let client = Client::new(
//!     Arc::new(transport),
//!     Credentials {
//!         admin_key: std::env::var("OPENAI_ADMIN_KEY").ok(),
//!         ..Default::default()
//!     },
//! );
//!
//! let admin = client.admin().expect("admin key required");
//! for project in admin.list::<serde_json::Value>("/organization/projects", ListQuery::new().limit(20)) {
//!     println!("{}", project.expect("list failed")["name"]);
//! }
//! ```

#![warn(clippy::all)]

pub mod client;
pub mod error;
pub mod mock;
pub mod pagination;
pub mod retry;
pub mod transport;
pub mod types;
pub mod upload;

pub use client::{Client, Credentials, Scope, Scoped, Walker};
pub use error::{Error, ErrorCategory, PermissionKind, Result};
pub use mock::{MockTransport, RecordedCall};
pub use pagination::{CursorPage, CursorWalker, Direction, ListQuery, Order};
pub use retry::{LogCallback, RetryCallback, RetryConfig, with_retry};
pub use transport::{Method, Multipart, Payload, Request, Response, Transport, UreqTransport};
pub use types::*;
pub use upload::{MAX_PART_SIZE, PartCheck, PartRecord, UploadSession, UploadState, Uploader, split_parts};
