#![forbid(unsafe_code)]
#![deny(future_incompatible)]
#![warn(
    missing_debug_implementations,
    rust_2018_idioms,
    trivial_casts,
    unused_qualifications
)]

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use dotenvy::dotenv;

mod cache;
mod deploy;

#[derive(Parser, Debug)]
#[clap(name = "fileset", version)]
/// Deploy rendered static sites to a fileset server.
struct Args {
    #[clap(subcommand)]
    cmd: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Upload a rendered site directory and point a branch at it.
    #[clap(display_order = 1)]
    Deploy {
        /// Directory containing the rendered site.
        dir: PathBuf,
        /// Fileset server host, e.g. myapp.appspot.com or localhost:8088.
        #[clap(long)]
        server: String,
        /// Branch to deploy to. Defaults to the CI branch env vars,
        /// normalized; localhost deploys always go to master.
        #[clap(long)]
        branch: Option<String>,
        /// Path to the deploy config file.
        #[clap(long, default_value = ".fileset.json")]
        config: PathBuf,
        /// List what would be uploaded without contacting the server.
        #[clap(long)]
        dry_run: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenv();
    env_logger::init();

    let args = Args::parse();
    match args.cmd {
        Command::Deploy {
            dir,
            server,
            branch,
            config,
            dry_run,
        } => {
            deploy::run(deploy::DeployOptions {
                dir,
                server,
                branch,
                config_path: config,
                dry_run,
            })
            .await
        }
    }
}
