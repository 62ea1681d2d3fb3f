use std::net::SocketAddr;
use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};
use rjw_types::{DocumentType, GuestId};

#[derive(Parser, Debug)]
#[command(
    name = "rjw",
    about = "Wedding document service: generate, store and serve guest documents",
    version
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// TOML configuration file. Defaults apply when omitted.
    #[arg(short, long, global = true, env = "RJW_CONFIG")]
    pub config: Option<PathBuf>,

    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[arg(long, global = true, default_value = "text")]
    pub format: OutputFormat,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, clap::ValueEnum)]
pub enum OutputFormat {
    Text,
    Json,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Start the HTTP server and background reconciler
    Serve(ServeArgs),
    /// Generate a document, reusing the current one if the guest is unchanged
    Generate(TargetArgs),
    /// Show the latest committed document
    Latest(TargetArgs),
    /// List every committed version
    Versions(TargetArgs),
    /// Write a committed document's bytes to a file
    Fetch(FetchArgs),
    /// Finish or fail records left behind by interrupted generations
    Reconcile(ReconcileArgs),
}

#[derive(Args, Debug)]
pub struct ServeArgs {
    /// Override the configured bind address
    #[arg(long)]
    pub bind: Option<SocketAddr>,
}

#[derive(Args, Debug)]
pub struct TargetArgs {
    /// Guest access code
    #[arg(value_parser = parse_guest_id)]
    pub guest: GuestId,
    /// invitation or itinerary
    #[arg(value_parser = parse_document_type)]
    pub document_type: DocumentType,
}

#[derive(Args, Debug)]
pub struct FetchArgs {
    #[command(flatten)]
    pub target: TargetArgs,
    /// Version to fetch. Latest when omitted.
    #[arg(long)]
    pub version: Option<u64>,
    /// Output file
    #[arg(short, long)]
    pub out: PathBuf,
}

#[derive(Args, Debug)]
pub struct ReconcileArgs {
    /// Include records younger than the grace period
    #[arg(long)]
    pub all: bool,
}

fn parse_guest_id(raw: &str) -> Result<GuestId, String> {
    GuestId::new(raw).map_err(|e| e.to_string())
}

fn parse_document_type(raw: &str) -> Result<DocumentType, String> {
    raw.parse().map_err(|e: rjw_types::TypeError| e.to_string())
}
