//! Logging for the extension sandbox
//!
//! Two concerns live here:
//!
//! - [`init_tracing`] installs the process-wide `tracing` subscriber: a
//!   human-oriented layer in development and structured JSON in production,
//!   selected through `SANDBOX_ENV`.
//! - [`PiiRedactor`] scrubs personal data and credentials out of text that
//!   untrusted extensions write to their console before it reaches host logs.
//!
//! # Example
//!
//! ```rust
//! use logger_redacted::{PiiRedactor, RedactionConfig};
//!
//! let redactor = PiiRedactor::new(RedactionConfig {
//!     hash_for_correlation: false,
//!     ..Default::default()
//! });
//!
//! let line = redactor.redact("token=abc123 sent to jane@example.com");
//! assert!(!line.contains("abc123"));
//! assert!(!line.contains("jane@example.com"));
//! ```

pub mod config;
pub mod redactor;
pub mod subscriber;

pub use config::*;
pub use redactor::*;
pub use subscriber::*;
