//! `cmb`, the CMB protocol server and client.

use std::net::IpAddr;
use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use tracing::error;
use tracing_subscriber::EnvFilter;

use cmb_node::{cli, client, server};
use cmb_proto::ResourceId;

#[derive(Parser)]
#[command(name = "cmb", version, about = "Concurrent multipath bulk transfer over UDP")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Serve a file on one or more UDP endpoints.
    Server {
        /// Endpoint address; repeat for multiple endpoints.
        #[arg(short = 'a', long = "addr")]
        addr: Vec<IpAddr>,
        /// Endpoint port; repeat for multiple endpoints.
        #[arg(short = 'p', long = "port")]
        port: Vec<u16>,
        /// Enable debug logging.
        #[arg(short, long)]
        verbose: bool,
        /// The file to serve.
        file: PathBuf,
    },
    /// Download a resource from one or two servers.
    Client {
        /// Server address; repeat for a second connection.
        #[arg(short = 'a', long = "addr")]
        addr: Vec<IpAddr>,
        /// Server port; repeat for a second connection.
        #[arg(short = 'p', long = "port")]
        port: Vec<u16>,
        /// Requested sending rate in bits per second, per endpoint.
        #[arg(short = 'r', long = "rate")]
        rate: Vec<u32>,
        /// Enable debug logging.
        #[arg(short, long)]
        verbose: bool,
        /// Resource id as printed by the server (32 hex chars, optionally
        /// followed by 16 hex chars of length).
        resource_id: String,
        /// Output path, `-` for stdout, or /dev/null.
        output: String,
    },
}

fn init_logging(verbose: bool) {
    let default_filter = if verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)),
        )
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() -> ExitCode {
    match Cli::parse().command {
        Command::Server { addr, port, verbose, file } => {
            init_logging(verbose);
            let endpoints = match cli::resolve_endpoints(&addr, &port) {
                Ok(endpoints) => endpoints,
                Err(err) => {
                    error!("{err}");
                    return ExitCode::from(2);
                }
            };
            match server::serve(&file, endpoints).await {
                Ok(()) => ExitCode::SUCCESS,
                Err(err) => {
                    error!("{err:#}");
                    ExitCode::from(1)
                }
            }
        }
        Command::Client { addr, port, rate, verbose, resource_id, output } => {
            init_logging(verbose);
            let endpoints = match resolve_client_endpoints(&addr, &port, &rate) {
                Ok(endpoints) => endpoints,
                Err(err) => {
                    error!("{err}");
                    return ExitCode::from(2);
                }
            };
            let resource_id: ResourceId = match resource_id.parse() {
                Ok(id) => id,
                Err(err) => {
                    error!("{err}");
                    return ExitCode::from(2);
                }
            };
            match client::download(resource_id, endpoints, &output).await {
                Ok(()) => ExitCode::SUCCESS,
                Err(err) => {
                    error!("{err:#}");
                    ExitCode::from(1)
                }
            }
        }
    }
}

fn resolve_client_endpoints(
    addrs: &[IpAddr],
    ports: &[u16],
    rates: &[u32],
) -> anyhow::Result<Vec<client::Endpoint>> {
    let addrs = cli::resolve_endpoints(addrs, ports)?;
    if addrs.len() > cmb_proto::MAX_CONNECTIONS {
        anyhow::bail!(
            "expected at most {} endpoints, {} were given",
            cmb_proto::MAX_CONNECTIONS,
            addrs.len()
        );
    }
    let rates = cli::resolve_rates(rates, addrs.len())?;
    Ok(addrs
        .into_iter()
        .zip(rates)
        .map(|(addr, rate)| client::Endpoint { addr, rate })
        .collect())
}
