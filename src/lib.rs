// =============================================================================
// Matrixon Identity - Library Crate
// =============================================================================
//
// Project: Matrixon - Ultra High Performance Matrix NextServer (Synapse Alternative)
// Author: arkSong (arksong2018@gmail.com) - Founder of Matrixon Innovation Project
// Date: 2024-12-11
// Version: 0.11.0-alpha
// License: Apache 2.0 / MIT
//
// Description:
//   Client-side Matrix identity service: identity server selection,
//   ThreePid binding, lookups and share status.
//
// =============================================================================

pub mod api;
pub mod config;
pub mod database;
pub mod service;
pub mod utils;

#[cfg(test)]
mod test_utils;

pub use utils::error::{Error, Result};

// Re-export common types
pub use ruma;
pub use tokio;
pub use tracing;
