use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::str::FromStr;

use convertd_core::JobStatus;

#[derive(Parser)]
#[command(name = "convertd")]
#[command(author, version, about = "File conversion job engine")]
pub struct Cli {
    /// Path to config file
    #[arg(short, long, global = true, env = "CONVERTD_CONFIG")]
    pub config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

/// Identity flags shared by the job commands.
#[derive(clap::Args)]
pub struct Identity {
    /// User on whose behalf the command runs
    #[arg(short, long, default_value = "admin")]
    pub user: String,

    /// Act as an administrator
    #[arg(long)]
    pub admin: bool,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the worker pool and retention sweeper until interrupted
    Run,

    /// Submit a file for conversion
    Submit {
        /// File to convert
        #[arg(required = true)]
        file: PathBuf,

        /// Target format (e.g. mp3, pdf, zip)
        #[arg(short, long)]
        to: String,

        /// Input format, when the file name does not tell
        #[arg(long)]
        from: Option<String>,

        /// Owner of the job
        #[arg(short, long)]
        owner: String,

        /// Copy the file instead of moving it
        #[arg(long)]
        copy: bool,
    },

    /// Cancel a pending or processing job
    Cancel {
        job_id: String,

        #[command(flatten)]
        identity: Identity,
    },

    /// Show one job
    Status {
        job_id: String,

        #[command(flatten)]
        identity: Identity,
    },

    /// List jobs, newest first
    List {
        #[command(flatten)]
        identity: Identity,

        /// Only jobs in this status
        #[arg(long, value_parser = parse_status)]
        status: Option<JobStatus>,

        /// Maximum number of jobs
        #[arg(long, default_value = "50")]
        limit: i64,
    },

    /// Show or change an owner's storage account
    Account {
        owner: String,

        /// New quota in bytes
        #[arg(long)]
        set_quota: Option<u64>,
    },

    /// Remove expired jobs and their files once
    Sweep,

    /// List supported conversions
    Formats {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Check that required external tools are available
    CheckTools,

    /// Validate configuration file
    Validate,
}

fn parse_status(s: &str) -> Result<JobStatus, String> {
    JobStatus::from_str(&s.to_ascii_lowercase())
}
