// =============================================================================
// Matrixon Identity - Main Entry Point
// =============================================================================
//
// Project: Matrixon - Ultra High Performance Matrix NextServer (Synapse Alternative)
// Author: arkSong (arksong2018@gmail.com) - Founder of Matrixon Innovation Project
// Date: 2024-12-11
// Version: 0.11.0-alpha
// License: Apache 2.0 / MIT
//
// Description:
//   `matrixon-identity` binary: loads configuration, installs logging and
//   runs one identity service command.
//
// =============================================================================

use std::time::Instant;

use anyhow::Context;
use matrixon_identity::{
    config::IdentityConfig,
    service::{
        identity::{Service, SharedState},
        Services,
    },
};
use tracing::{debug, info};
use tracing_subscriber::{prelude::*, EnvFilter};

mod clap;

use crate::clap::{BindCommands, Commands, ServerCommands};

fn init_logging(filter: &str) {
    let registry = tracing_subscriber::Registry::default();
    let fmt_layer = tracing_subscriber::fmt::Layer::new().with_writer(std::io::stderr);
    let filter_layer = match EnvFilter::try_new(filter) {
        Ok(s) => s,
        Err(e) => {
            eprintln!("It looks like your log filter is invalid. The following error occurred while parsing it: {e}");
            EnvFilter::new("warn")
        }
    };

    let subscriber = registry.with(filter_layer).with(fmt_layer);
    if tracing::subscriber::set_global_default(subscriber).is_err() {
        eprintln!("A global tracing subscriber was already installed");
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let start = Instant::now();
    let args = clap::parse();

    let config = IdentityConfig::load(args.config.as_deref()).context("invalid configuration")?;
    init_logging(args.log_level.as_deref().unwrap_or(&config.log));
    info!("🚀 matrixon-identity {} for {}", env!("CARGO_PKG_VERSION"), config.server_name);

    let services = Services::build(&config).context("failed to start identity service")?;
    let result = run(&services.identity, args.command).await;
    services.identity.shutdown();

    debug!("⏱️ Command finished in {:?}", start.elapsed());
    result
}

async fn run(identity: &Service, command: Commands) -> anyhow::Result<()> {
    match command {
        Commands::Server { action } => match action {
            ServerCommands::Show => {
                let config = identity.identity_server_config();
                match &config.current {
                    Some(url) => println!("{url} ({:?})", config.validation),
                    None => println!("no identity server configured"),
                }
            }
            ServerCommands::Discover => match identity.get_default_identity_server().await? {
                Some(url) => println!("{url}"),
                None => println!("the homeserver does not advertise an identity server"),
            },
            ServerCommands::Check { url } => {
                identity.is_valid_identity_server(&url).await?;
                println!("{url} supports identity service API v2");
            }
            ServerCommands::Set { url } => match identity.set_new_identity_server(url.as_deref()).await? {
                Some(url) => println!("identity server set to {url}"),
                None => println!("disconnected from identity server"),
            },
        },

        Commands::Bind { action } => match action {
            BindCommands::Start { threepid } => {
                identity.start_bind_threepid(threepid.clone()).await?;
                println!("validation code sent to {threepid}");
            }
            BindCommands::Resend { threepid } => {
                identity.send_again_validation_code(threepid.clone()).await?;
                println!("validation code sent again to {threepid}");
            }
            BindCommands::Submit { threepid, code } => {
                identity.submit_validation_token(threepid.clone(), &code).await?;
                println!("{threepid} validated, run `bind finalize` to complete");
            }
            BindCommands::Finalize { threepid } => {
                identity.finalize_bind_threepid(threepid.clone()).await?;
                println!("{threepid} is now bound");
            }
            BindCommands::Cancel { threepid } => {
                identity.cancel_bind_threepid(threepid.clone()).await?;
                println!("binding of {threepid} cancelled");
            }
            BindCommands::List => {
                let pending = identity.pending_bindings();
                if pending.is_empty() {
                    println!("no bindings in progress");
                }
                for session in pending {
                    println!(
                        "{}\t{:?}\t{}\tstarted {}",
                        session.threepid,
                        session.state,
                        session.identity_server,
                        session.created_at.to_rfc3339()
                    );
                }
            }
        },

        Commands::Unbind { threepid } => {
            identity.unbind_threepid(threepid.clone()).await?;
            println!("{threepid} unbound");
        }

        Commands::Lookup { threepids } => {
            let found = identity.look_up(threepids).await?;
            if found.is_empty() {
                println!("no matches");
            }
            for entry in found {
                println!("{}\t{}", entry.threepid, entry.user_id);
            }
        }

        Commands::Status { threepids } => {
            let status = identity.get_share_status(threepids.clone()).await?;
            for threepid in threepids {
                let state = status.get(&threepid).copied().unwrap_or(SharedState::NotShared);
                println!("{threepid}\t{state:?}");
            }
        }
    }

    Ok(())
}
