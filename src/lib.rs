//! # streamnet
//!
//! A connection interception engine for embedding a GUI renderer over a
//! controlled network stack.
//!
//! `streamnet` presents a synchronous, single-use connection object per
//! HTTP exchange and drives a pooled asynchronous client underneath. Each
//! connection applies per-session policy before anything touches the wire:
//! header rewriting, ad-host blocking, cookie attachment, and an optional
//! custom TLS trust store. Responses flow back through download diversion
//! and an opt-in cache.
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use streamnet::{EngineConfig, InterceptEngine, SessionId, SessionSettings};
//! use streamnet::session::{NoDiscards, StaticSessionStore};
//!
//! let sessions = Arc::new(StaticSessionStore::new());
//! sessions.insert(SessionId(1), SessionSettings::plain("MyRenderer/1.0"));
//! let engine = InterceptEngine::new(
//!     EngineConfig::from_env(),
//!     sessions,
//!     Arc::new(NoDiscards),
//! )?;
//!
//! let mut conn = engine.open("https://example.com/", SessionId(1))?;
//! conn.connect();
//! println!("status: {}", conn.status());
//! let body = conn.body()?;
//! conn.close();
//! ```
//!
//! ## Modules
//!
//! - [`base`] - Errors and engine configuration
//! - [`connection`] - The synchronous per-exchange surface
//! - [`engine`] - Runtime and shared-component assembly
//! - [`session`] - Per-session policy and embedder collaborator seams
//! - [`headers`] - Request headers and the rewrite pass
//! - [`pipe`] - Blocking request-body pipe
//! - [`filter`] - Ad-host blocklist
//! - [`divert`] - Attachment detection and download write-out
//! - [`cache`] - Opt-in response cache
//! - [`trust`] - TLS trust bootstrap
//! - [`http`] / [`socket`] - The async client underneath
//!
//! ## Failure policy
//!
//! Network failures never escape a connection: a failed exchange reports
//! status 0 with an empty body. Contract violations (unsupported method,
//! 32-bit content-length overflow, `content()`) surface as errors.

pub mod base;
pub mod cache;
pub mod connection;
pub mod divert;
pub mod engine;
pub mod filter;
pub mod headers;
pub mod http;
pub mod pipe;
pub mod session;
pub mod socket;
pub mod trust;

pub use base::{EngineConfig, NetError};
pub use connection::{RequestWriter, StreamConnection};
pub use engine::InterceptEngine;
pub use session::{SessionId, SessionSettings};
