//! Common error handling utilities for the extension sandbox
//!
//! This crate provides the pieces shared between the sandbox engine and the
//! layers that surface its results to callers:
//!
//! - **Error Codes**: stable, transport-facing codes for every failure kind
//!   and every admission rejection
//! - **Context Preservation**: a small builder for the free-form context map
//!   attached to classified errors
//! - **Error Sanitization**: removal of host file paths and host-side stack
//!   frames before an error leaves the engine
//! - **Public Errors**: the reduced `{code, kind, message}` shape callers see
//!
//! # Example
//!
//! ```rust
//! use error_common::{codes, ErrorContext, MessageSanitizer, PublicError};
//!
//! let sanitizer = MessageSanitizer::default();
//! let context = ErrorContext::new()
//!     .with_extension_id("E1")
//!     .add_context("function", "render");
//!
//! let public = PublicError::new(
//!     codes::execution::RUNTIME,
//!     "runtime",
//!     sanitizer.sanitize_message("boom at /srv/host/src/engine.rs:42"),
//! );
//! assert!(!public.message.contains("/srv/host"));
//! assert_eq!(context.extension_id.as_deref(), Some("E1"));
//! ```

pub mod codes;
pub mod context;
pub mod reporting;
pub mod sanitization;
pub mod types;

pub use context::*;
pub use reporting::*;
pub use sanitization::*;
pub use types::*;
