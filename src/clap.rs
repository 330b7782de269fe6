// =============================================================================
// Matrixon Identity - Command Line Interface
// =============================================================================
//
// Project: Matrixon - Ultra High Performance Matrix NextServer (Synapse Alternative)
// Author: arkSong (arksong2018@gmail.com) - Founder of Matrixon Innovation Project
// Date: 2024-12-11
// Version: 0.11.0-alpha
// License: Apache 2.0 / MIT
//
// Description:
//   Argument parsing for the `matrixon-identity` binary.
//
// =============================================================================

use std::{path::PathBuf, time::Instant};

use clap::{Parser, Subcommand};
use matrixon_identity::service::identity::ThreePid;
use tracing::debug;

/// Matrixon identity client
///
/// Manages the identity server of a Matrix account and binds email
/// addresses and phone numbers to it. ThreePids are written
/// `email:<address>` or `msisdn:<number>`.
#[derive(Parser, Debug, Clone, PartialEq, Eq)]
#[clap(about, version, name = "matrixon-identity")]
pub struct Args {
    /// Path to configuration file
    #[clap(short, long, env = "MATRIXON_IDENTITY_CONFIG", global = true)]
    pub config: Option<PathBuf>,

    /// Log filter override (e.g. `debug`, `matrixon_identity=trace`)
    #[clap(short, long, global = true)]
    pub log_level: Option<String>,

    #[clap(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Commands {
    /// Identity server selection
    Server {
        #[clap(subcommand)]
        action: ServerCommands,
    },

    /// ThreePid binding workflow
    Bind {
        #[clap(subcommand)]
        action: BindCommands,
    },

    /// Remove a ThreePid association through the homeserver
    Unbind { threepid: ThreePid },

    /// Resolve ThreePids to Matrix user ids
    Lookup {
        #[clap(required = true)]
        threepids: Vec<ThreePid>,
    },

    /// Share status of your own ThreePids
    Status {
        #[clap(required = true)]
        threepids: Vec<ThreePid>,
    },
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum ServerCommands {
    /// Print the identity server in use
    Show,

    /// Print the identity server advertised by the homeserver
    Discover,

    /// Check that a server speaks identity service API v2
    Check { url: String },

    /// Switch identity server; without a url, disconnect
    Set { url: Option<String> },
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum BindCommands {
    /// Ask the identity server to send a validation code
    Start { threepid: ThreePid },

    /// Send the validation code again
    Resend { threepid: ThreePid },

    /// Submit the code received by email or SMS
    Submit { threepid: ThreePid, code: String },

    /// Associate the validated ThreePid with the account
    Finalize { threepid: ThreePid },

    /// Abandon a binding in progress
    Cancel { threepid: ThreePid },

    /// List bindings waiting for a code or finalization
    List,
}

pub fn parse() -> Args {
    let start = Instant::now();
    let args = Args::parse();
    debug!("✅ Command line arguments parsed in {:?}", start.elapsed());
    args
}
