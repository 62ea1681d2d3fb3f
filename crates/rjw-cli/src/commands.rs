use std::sync::Arc;

use anyhow::Context;
use chrono::Utc;
use colored::Colorize;
use rjw_pipeline::{ReconcileReport, Renderer};
use rjw_server::{RjwServer, ServerConfig};
use rjw_types::DocumentRef;

use crate::cli::*;

pub async fn run_command(cli: Cli) -> anyhow::Result<()> {
    let config = load_config(&cli)?;
    let format = cli.format;
    match cli.command {
        Command::Serve(args) => cmd_serve(config, args).await,
        Command::Generate(args) => cmd_generate(config, args, format).await,
        Command::Latest(args) => cmd_latest(config, args, format).await,
        Command::Versions(args) => cmd_versions(config, args, format).await,
        Command::Fetch(args) => cmd_fetch(config, args).await,
        Command::Reconcile(args) => cmd_reconcile(config, args, format).await,
    }
}

fn load_config(cli: &Cli) -> anyhow::Result<ServerConfig> {
    match &cli.config {
        Some(path) => ServerConfig::load(path)
            .with_context(|| format!("loading config from {}", path.display())),
        None => {
            let mut config = ServerConfig::default();
            config.apply_env()?;
            Ok(config)
        }
    }
}

async fn open(config: ServerConfig) -> anyhow::Result<RjwServer> {
    RjwServer::open(config).await.context("opening document stores")
}

async fn cmd_serve(mut config: ServerConfig, args: ServeArgs) -> anyhow::Result<()> {
    if let Some(bind) = args.bind {
        config.bind_addr = bind;
    }
    println!("{} rjw server on {}", "▶".green().bold(), config.bind_addr.to_string().bold());
    open(config).await?.serve().await?;
    Ok(())
}

async fn cmd_generate(config: ServerConfig, args: TargetArgs, format: OutputFormat) -> anyhow::Result<()> {
    let renderer: Arc<dyn Renderer> = Arc::new(config.documents.clone());
    let server = open(config).await?;
    let document = server
        .pipeline()
        .generate(&args.guest, args.document_type, renderer)
        .await?;
    print_document(&server, &document, format)
}

async fn cmd_latest(config: ServerConfig, args: TargetArgs, format: OutputFormat) -> anyhow::Result<()> {
    let server = open(config).await?;
    match server.pipeline().latest(&args.guest, args.document_type).await? {
        Some(document) => print_document(&server, &document, format),
        None => {
            println!("No {} committed for {}.", args.document_type, args.guest.to_string().bold());
            Ok(())
        }
    }
}

async fn cmd_versions(config: ServerConfig, args: TargetArgs, format: OutputFormat) -> anyhow::Result<()> {
    let server = open(config).await?;
    let documents = server
        .pipeline()
        .versions(&args.guest, args.document_type)
        .await?;
    if format == OutputFormat::Json {
        println!("{}", serde_json::to_string_pretty(&documents)?);
        return Ok(());
    }
    if documents.is_empty() {
        println!("No {} committed for {}.", args.document_type, args.guest.to_string().bold());
    }
    for document in &documents {
        println!(
            "{}  {}  {}",
            format!("v{}", document.version).yellow().bold(),
            document.content_hash.prefix().dimmed(),
            document.committed_at.to_rfc3339()
        );
    }
    Ok(())
}

async fn cmd_fetch(config: ServerConfig, args: FetchArgs) -> anyhow::Result<()> {
    let server = open(config).await?;
    let pipeline = server.pipeline();
    let TargetArgs { guest, document_type } = &args.target;
    let document = match args.version {
        Some(version) => pipeline.version(guest, *document_type, version).await?,
        None => pipeline.latest(guest, *document_type).await?,
    }
    .with_context(|| format!("no committed {document_type} for {guest}"))?;
    let bytes = pipeline.fetch(&document).await?;
    tokio::fs::write(&args.out, &bytes)
        .await
        .with_context(|| format!("writing {}", args.out.display()))?;
    println!(
        "{} Wrote {} v{} ({} bytes) to {}",
        "✓".green().bold(),
        document.document_type,
        document.version,
        bytes.len(),
        args.out.display()
    );
    Ok(())
}

async fn cmd_reconcile(config: ServerConfig, args: ReconcileArgs, format: OutputFormat) -> anyhow::Result<()> {
    let server = open(config).await?;
    let reconciler = server.pipeline().reconciler();
    let report = if args.all {
        reconciler.reconcile_before(Utc::now()).await?
    } else {
        reconciler.reconcile_once().await?
    };
    print_report(&report, format)
}

fn print_document(server: &RjwServer, document: &DocumentRef, format: OutputFormat) -> anyhow::Result<()> {
    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(document)?),
        OutputFormat::Text => {
            println!(
                "{} {} v{} for {}",
                "✓".green().bold(),
                document.document_type,
                document.version.to_string().yellow().bold(),
                document.guest_id.to_string().bold()
            );
            println!("  Key: {}", document.storage_key.to_string().cyan());
            println!("  Hash: {}", document.content_hash.to_string().dimmed());
            println!("  Committed: {}", document.committed_at.to_rfc3339());
            println!("  Location: {}", server.pipeline().locate(document).blue());
        }
    }
    Ok(())
}

fn print_report(report: &ReconcileReport, format: OutputFormat) -> anyhow::Result<()> {
    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(report)?),
        OutputFormat::Text if report.examined() == 0 => {
            println!("{} Nothing to reconcile.", "✓".green().bold())
        }
        OutputFormat::Text => {
            println!("{} Reconciled {} records", "✓".green().bold(), report.examined());
            println!("  Committed: {}", report.committed.to_string().green());
            println!("  Recovered: {}", report.recovered.to_string().green());
            println!("  Failed: {}", report.failed.to_string().red());
            println!("  Skipped: {}", report.skipped.to_string().yellow());
        }
    }
    Ok(())
}
