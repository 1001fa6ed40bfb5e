//! crew client - talks to `crewd` over its Unix socket
//!
//! This library provides:
//! - [`client`]: `DaemonClient`, the connection and typed requests
//! - [`follow`]: ordered, gap-free streaming of a session
//! - [`render`]: text output for events and listings
//! - [`cli`]: the `crew` command line built on the above

pub mod cli;
pub mod client;
pub mod error;
pub mod follow;
pub mod render;

// Re-export commonly used types
pub use client::{ClientConfig, DaemonClient};
pub use error::{ClientError, Result};
pub use follow::{follow, Target};
