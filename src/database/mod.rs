// =============================================================================
// Matrixon Identity - Database Module
// =============================================================================
//
// Project: Matrixon - Ultra High Performance Matrix NextServer (Synapse Alternative)
// Author: arkSong (arksong2018@gmail.com) - Founder of Matrixon Innovation Project
// Date: 2024-12-11
// Version: 0.11.0-alpha
// License: Apache 2.0 / MIT
//
// Description:
//   Durable backends for the identity service `Data` trait.
//
// =============================================================================

mod json_file;

pub use json_file::JsonFileData;
