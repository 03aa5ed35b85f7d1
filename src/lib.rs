//! # Vessel
//!
//! Composable storage containers for byte blobs:
//! - Memory and file backed containers with atomic rename-on-close writes
//! - Lossless zero-copy conversion between streaming and random access
//! - Authenticated encryption with a seekable stream cipher
//! - Power-of-two padding that hides exact lengths
//! - Crash-safe delayed disposal driven by an external commit tracker
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                     ContainerFactory                         │
//! │          (Config + PathResolver + secret + tracker)          │
//! └─────────────────────┬───────────────────────────────────────┘
//!                       │ Box<dyn Container> / Box<dyn RandomBuffer>
//! ┌─────────────────────▼───────────────────────────────────────┐
//! │                  DelayedDisposal (optional)                  │
//! ├──────────────────────────────────────────────────────────────┤
//! │                      Padded (optional)                       │
//! ├──────────────────────────────────────────────────────────────┤
//! │                    Encrypted (optional)                      │
//! ├──────────────────────────────────────────────────────────────┤
//! │                 MemoryContainer | FileContainer              │
//! └─────────────────────┬───────────────────────────────────────┘
//!                       │ persist() / resume()
//!                       ▼
//!                ┌─────────────┐
//!                │   Frames    │
//!                │  (bincode)  │
//!                └─────────────┘
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod error;
pub mod config;

pub mod container;
pub mod crypto;
pub mod encrypted;
pub mod padded;
pub mod disposal;
pub mod persist;
pub mod path;
pub mod factory;

// =============================================================================
// Public API Re-exports
// =============================================================================

pub use error::{ErrorKind, Result, VesselError};
pub use config::Config;
pub use container::{Container, ContainerKind, InputStream, OutputStream, RandomBuffer};
pub use factory::ContainerFactory;

// =============================================================================
// Version Info
// =============================================================================

/// Current version of Vessel
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
