use std::io::{Error, ErrorKind};
use std::net::SocketAddr;
use std::path::Path;
use std::{env, fs, process::exit};

use tokio::task::LocalSet;
use tracing_subscriber::EnvFilter;

use burrow::args::{self, ArgumentsRequest, StartupArguments, StartupMode};
use burrow::rendezvous::{self, RendezvousConfig};
use burrow::worker::origin::{self, OriginConfig};
use burrow::worker::terminus::{self, TerminusConfig};

fn main() {
    let arguments = match args::parse_arguments(env::args()) {
        Err(err) => {
            eprintln!("{err}\n\nType 'burrow --help' for a help menu");
            exit(1);
        }
        Ok(arguments) => arguments,
    };

    let startup_args = match arguments {
        ArgumentsRequest::Version => {
            println!("{}", args::get_version_string());
            return;
        }
        ArgumentsRequest::Help => {
            println!("{}", args::get_help_string());
            return;
        }
        ArgumentsRequest::Run(startup_args) => startup_args,
    };

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let runtime_result = tokio::runtime::Builder::new_current_thread().enable_all().build();

    let result = match runtime_result {
        Ok(runtime) => LocalSet::new().block_on(&runtime, async_main(startup_args)),
        Err(err) => {
            eprintln!("Failed to start Tokio runtime: {err}");
            exit(1);
        }
    };

    if let Err(error) = result {
        eprintln!("Program finished with error: {error}");
        exit(1);
    }
}

async fn async_main(startup_args: StartupArguments) -> Result<(), Error> {
    match startup_args.mode {
        StartupMode::Origin { rendezvous, room, listen, spool_dir } => {
            let rendezvous = resolve(&rendezvous).await?;
            ensure_spool_dir(&spool_dir)?;
            origin::run(OriginConfig { rendezvous, room, listen, spool_dir }).await
        }
        StartupMode::Terminus { rendezvous, room, destination, spool_dir } => {
            let rendezvous = resolve(&rendezvous).await?;
            ensure_spool_dir(&spool_dir)?;
            terminus::run(TerminusConfig { rendezvous, room, destination, spool_dir }).await
        }
        StartupMode::Rendezvous { listen } => rendezvous::run(RendezvousConfig { listen }).await,
    }
}

async fn resolve(host: &str) -> Result<SocketAddr, Error> {
    tokio::net::lookup_host(host)
        .await?
        .next()
        .ok_or_else(|| Error::new(ErrorKind::InvalidInput, format!("\"{host}\" did not resolve to any addresses")))
}

fn ensure_spool_dir(path: &Path) -> Result<(), Error> {
    fs::create_dir_all(path)
        .map_err(|error| Error::new(error.kind(), format!("cannot create spool directory {}: {error}", path.display())))
}
