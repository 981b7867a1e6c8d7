//! `veil-admin`: administration CLI over the admin store.
//!
//! User and dataset management, grants and budgets, bulk YAML loading and
//! archive inspection. Operates directly on the YAML store file; run it
//! against the same file the server is configured with, while the server
//! is stopped.

mod commands;

use anyhow::Result;
use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "veil-admin", about = "Administer the veil DP query service")]
struct Cli {
    /// Path to the YAML admin store file
    #[arg(long, default_value = "admin.yaml")]
    db_file: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create a user
    AddUser {
        #[arg(long)]
        name: String,
        /// Allow the user to submit production queries
        #[arg(long, default_value_t = true)]
        may_query: bool,
    },
    /// Delete a user
    DelUser {
        #[arg(long)]
        name: String,
    },
    /// Set whether a user may submit production queries
    SetMayQuery {
        #[arg(long)]
        name: String,
        #[arg(long)]
        allow: bool,
    },
    /// Show a user record
    ShowUser {
        #[arg(long)]
        name: String,
    },
    /// List all user names
    ListUsers,
    /// Grant a dataset to a user with an initial budget
    AddDatasetToUser {
        #[arg(long)]
        user: String,
        #[arg(long)]
        dataset: String,
        #[arg(long)]
        epsilon: f64,
        #[arg(long)]
        delta: f64,
    },
    /// Revoke a user's access to a dataset
    DelDatasetToUser {
        #[arg(long)]
        user: String,
        #[arg(long)]
        dataset: String,
    },
    /// Overwrite the initial budget of an existing grant
    SetBudget {
        #[arg(long)]
        user: String,
        #[arg(long)]
        dataset: String,
        #[arg(long)]
        epsilon: f64,
        #[arg(long)]
        delta: f64,
    },
    /// Register a dataset backed by a local CSV file
    AddDataset {
        #[arg(long)]
        name: String,
        #[arg(long)]
        path: String,
        /// YAML file holding the dataset metadata
        #[arg(long)]
        metadata: String,
    },
    /// Register a dataset backed by an S3 object
    AddS3Dataset {
        #[arg(long)]
        name: String,
        #[arg(long)]
        endpoint_url: String,
        #[arg(long)]
        bucket: String,
        #[arg(long)]
        key: String,
        #[arg(long)]
        credentials_name: String,
        /// YAML file holding the dataset metadata
        #[arg(long)]
        metadata: String,
    },
    /// Delete a dataset and its metadata
    DelDataset {
        #[arg(long)]
        name: String,
    },
    /// List all dataset names
    ListDatasets,
    /// Bulk-load users from a YAML collection file
    LoadUsers {
        #[arg(long)]
        file: String,
    },
    /// Bulk-load datasets and metadata from a YAML collection file
    LoadDatasets {
        #[arg(long)]
        file: String,
    },
    /// Show a user's query archive
    ShowArchives {
        #[arg(long)]
        user: String,
        #[arg(long)]
        dataset: Option<String>,
    },
    /// Drop every collection in the store
    DropAll {
        /// Required confirmation flag
        #[arg(long)]
        yes: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .init();

    let cli = Cli::parse();
    commands::run(&cli.db_file, cli.command).await
}

pub(crate) use Command as AdminCommand;
