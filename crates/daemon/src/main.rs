mod cli;

use std::path::Path;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::signal;
use tracing::{error, info, warn};

use convertd_core::config::load_config_from_env;
use convertd_core::storage::StageMode;
use convertd_core::{load_config, validate_config, Config, Engine, JobFilter, Requester, SubmitRequest};

use cli::{Cli, Commands, Identity};

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let default_filter = if cli.verbose {
        "convertd=debug,convertd_core=debug"
    } else {
        "info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .init();

    if let Err(e) = run(cli).await {
        error!("Fatal error: {:#}", e);
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<()> {
    let config = read_config(cli.config.as_deref())?;

    match cli.command {
        Commands::Run => serve(config).await,
        Commands::Submit {
            file,
            to,
            from,
            owner,
            copy,
        } => {
            let engine = open_engine(config)?;
            let mut request = SubmitRequest::for_file(owner, &file, to)
                .await
                .with_context(|| format!("Failed to read {:?}", file))?;
            if let Some(from) = from {
                request = request.with_input_format(from);
            }
            if copy {
                request = request.with_stage_mode(StageMode::Copy);
            }

            let submission = engine.submit(request).await?;
            print_json(&submission)
        }
        Commands::Cancel { job_id, identity } => {
            let engine = open_engine(config)?;
            let job = engine.cancel(&job_id, &requester(identity))?;
            print_json(&job)
        }
        Commands::Status { job_id, identity } => {
            let engine = open_engine(config)?;
            let job = engine.get_status(&job_id, &requester(identity))?;
            print_json(&job)
        }
        Commands::List {
            identity,
            status,
            limit,
        } => {
            let engine = open_engine(config)?;
            let mut filter = JobFilter::new().with_limit(limit);
            if let Some(status) = status {
                filter = filter.with_status(status);
            }
            let jobs = engine.list_jobs(&requester(identity), filter)?;
            for job in jobs {
                println!(
                    "{}  {:<10} {:>3}%  {}  {} -> {}",
                    job.id, job.status, job.progress, job.owner, job.input_filename, job.output_format
                );
            }
            Ok(())
        }
        Commands::Account { owner, set_quota } => {
            let engine = open_engine(config)?;
            let account = match set_quota {
                Some(quota) => Some(engine.set_quota(&owner, quota)?),
                None => engine.account(&owner)?,
            };
            match account {
                Some(account) => print_json(&account),
                None => {
                    println!("No storage account for {}", owner);
                    Ok(())
                }
            }
        }
        Commands::Sweep => {
            let engine = open_engine(config)?;
            let report = engine.sweep().await?;
            print_json(&report)
        }
        Commands::Formats { json } => {
            let engine = open_engine(config)?;
            let formats = engine.supported_formats();
            if json {
                return print_json(&formats);
            }
            for support in formats {
                println!("{} ({})", support.family, support.tool);
                println!("  in:  {}", support.inputs.join(", "));
                println!("  out: {}", support.outputs.join(", "));
            }
            Ok(())
        }
        Commands::CheckTools => check_tools(config).await,
        Commands::Validate => {
            println!("Configuration is valid");
            Ok(())
        }
    }
}

fn read_config(path: Option<&Path>) -> Result<Config> {
    let config = match path {
        Some(path) => {
            info!("Loading configuration from {:?}", path);
            load_config(path).with_context(|| format!("Failed to load config from {:?}", path))?
        }
        None => load_config_from_env().context("Failed to load config from environment")?,
    };
    validate_config(&config).context("Configuration validation failed")?;
    Ok(config)
}

fn open_engine(config: Config) -> Result<Engine> {
    let db_path = config.database.path.clone();
    if let Some(parent) = db_path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create database directory {:?}", parent))?;
    }
    Engine::open(config).with_context(|| format!("Failed to open database at {:?}", db_path))
}

fn requester(identity: Identity) -> Requester {
    if identity.admin {
        Requester::admin(identity.user)
    } else {
        Requester::user(identity.user)
    }
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

async fn serve(config: Config) -> Result<()> {
    info!(
        "Starting convertd: {} slots, {} per user, timeout {}s, {} retries",
        config.engine.max_concurrent_processes,
        config.engine.max_concurrent_per_user,
        config.engine.process_timeout,
        config.engine.max_retries
    );
    info!("Database path: {:?}", config.database.path);

    let engine = open_engine(config)?;

    for (family, result) in engine.check_tools().await {
        if let Err(e) = result {
            warn!("{} conversions unavailable: {}", family, e);
        }
    }

    engine.start().await.context("Failed to start engine")?;
    info!("Engine running, press Ctrl+C to stop");

    shutdown_signal().await;

    info!("Shutting down...");
    engine.stop().await;
    Ok(())
}

async fn check_tools(config: Config) -> Result<()> {
    let engine = open_engine(config)?;
    let mut missing = 0;
    for (family, result) in engine.check_tools().await {
        match result {
            Ok(()) => println!("✓ {}", family),
            Err(e) => {
                missing += 1;
                println!("✗ {}: {}", family, e);
            }
        }
    }
    if missing > 0 {
        anyhow::bail!("{} converter families unavailable", missing);
    }
    Ok(())
}

/// Wait for shutdown signal (Ctrl+C or SIGTERM)
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
