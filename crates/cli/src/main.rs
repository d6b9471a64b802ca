//! TRACE operator CLI
//!
//! Inspects towers, plans and executes traffic redirects, and drives
//! remediations through a running TRACE agent.

mod client;
mod commands;
mod config;
mod output;

use anyhow::Result;
use clap::{Parser, Subcommand};
use commands::{energy, healing, network, towers};

/// TRACE tower network CLI
#[derive(Parser)]
#[command(name = "tracectl")]
#[command(author, version, about = "CLI for the TRACE tower network engine", long_about = None)]
pub struct Cli {
    /// Agent API URL (can also be set via TRACE_API_URL env var)
    #[arg(long, env = "TRACE_API_URL")]
    pub api_url: Option<String>,

    /// Output format
    #[arg(long, short, default_value = "table")]
    pub format: output::OutputFormat,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Show tower state
    #[command(subcommand)]
    Towers(TowersCommands),

    /// Analyze congestion on a tower
    Analyze {
        /// Tower ID
        tower_id: String,
    },

    /// Show the redistribution plan for a congested tower
    Plan {
        /// Tower ID
        tower_id: String,
    },

    /// Move connections from one tower to another
    Redirect {
        /// Source tower ID
        tower_id: String,

        /// Target tower ID
        #[arg(long)]
        to: String,

        /// Number of connections to move
        #[arg(long)]
        connections: u32,
    },

    /// Set a tower's load to a percentage of its capacity
    Simulate {
        /// Tower ID
        tower_id: String,

        /// Load in percent (0-150)
        #[arg(long)]
        load: f64,
    },

    /// Detect issues across the network
    Issues {
        /// Only report issues on this tower
        #[arg(long, short)]
        tower: Option<String>,
    },

    /// Run the healing playbook for an issue
    Heal {
        /// Tower ID
        tower_id: String,

        /// Issue type (HIGH_CPU, HIGH_LATENCY, CONGESTION, HIGH_POWER, TOWER_DOWN)
        issue_type: String,
    },

    /// Show a remediation and its step log
    Status {
        /// Remediation ID
        remediation_id: String,
    },

    /// List remediations
    Remediations {
        /// Filter by tower ID
        #[arg(long, short)]
        tower: Option<String>,

        /// Filter by issue type
        #[arg(long)]
        issue_type: Option<String>,

        /// Filter by status (pending_approval, in_progress, awaiting_approval, resolved, completed, rolled_back)
        #[arg(long)]
        status: Option<String>,
    },

    /// Approve a remediation waiting on a human
    Approve {
        /// Remediation ID
        remediation_id: String,

        /// Approver name (defaults to the config file, then $USER)
        #[arg(long)]
        approver: Option<String>,
    },

    /// Undo the state changes of a remediation
    Rollback {
        /// Remediation ID
        remediation_id: String,

        /// Reason recorded in the ledger
        #[arg(long, default_value = "operator request")]
        reason: String,
    },

    /// Restore every tower to its default state
    Reset,

    /// Show the network health summary
    Summary,

    /// Show agent component health
    Health,

    /// Energy savings
    #[command(subcommand)]
    Energy(EnergyCommands),

    /// Switch a tower's operating mode
    PowerMode {
        /// Tower ID
        tower_id: String,

        /// Mode (normal, eco, boost, standby)
        mode: String,
    },

    /// Set the number of active capacity units on a tower
    Units {
        /// Tower ID
        tower_id: String,

        /// Active units (1 to the tower's maximum)
        units: u32,
    },

    /// Bring a tower's warm spare online
    WarmSpare {
        /// Tower ID
        tower_id: String,
    },
}

#[derive(Subcommand)]
pub enum TowersCommands {
    /// List every tower
    List,

    /// Show one tower
    Show {
        /// Tower ID
        tower_id: String,
    },
}

#[derive(Subcommand)]
pub enum EnergyCommands {
    /// Show towers with idle capacity units
    Recommend,

    /// Match a tower's active units to its load
    Optimize {
        /// Tower ID
        tower_id: String,
    },
}

#[tokio::main]
async fn main() {
    if let Err(e) = run(Cli::parse()).await {
        output::print_error(&format!("{e:#}"));
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<()> {
    let config = config::Config::load()?;
    let client = client::ApiClient::new(&config.resolve_api_url(cli.api_url))?;
    let format = cli.format;

    match cli.command {
        Commands::Towers(cmd) => match cmd {
            TowersCommands::List => towers::list(&client, format).await?,
            TowersCommands::Show { tower_id } => towers::show(&client, &tower_id, format).await?,
        },
        Commands::Analyze { tower_id } => towers::analyze(&client, &tower_id, format).await?,
        Commands::Plan { tower_id } => towers::plan(&client, &tower_id, format).await?,
        Commands::Redirect {
            tower_id,
            to,
            connections,
        } => towers::redirect(&client, &tower_id, &to, connections, format).await?,
        Commands::Simulate { tower_id, load } => {
            towers::simulate(&client, &tower_id, load, format).await?
        }
        Commands::Issues { tower } => healing::issues(&client, tower, format).await?,
        Commands::Heal {
            tower_id,
            issue_type,
        } => healing::heal(&client, &tower_id, &issue_type, format).await?,
        Commands::Status { remediation_id } => {
            healing::status(&client, &remediation_id, format).await?
        }
        Commands::Remediations {
            tower,
            issue_type,
            status,
        } => healing::list(&client, tower, issue_type, status, format).await?,
        Commands::Approve {
            remediation_id,
            approver,
        } => {
            let approver = config.resolve_approver(approver);
            healing::approve(&client, &remediation_id, &approver, format).await?
        }
        Commands::Rollback {
            remediation_id,
            reason,
        } => healing::rollback(&client, &remediation_id, &reason, format).await?,
        Commands::Reset => network::reset(&client, format).await?,
        Commands::Summary => network::summary(&client, format).await?,
        Commands::Health => network::health(&client, format).await?,
        Commands::Energy(cmd) => match cmd {
            EnergyCommands::Recommend => energy::recommend(&client, format).await?,
            EnergyCommands::Optimize { tower_id } => {
                energy::optimize(&client, &tower_id, format).await?
            }
        },
        Commands::PowerMode { tower_id, mode } => {
            energy::power_mode(&client, &tower_id, &mode, format).await?
        }
        Commands::Units { tower_id, units } => {
            energy::units(&client, &tower_id, units, format).await?
        }
        Commands::WarmSpare { tower_id } => energy::warm_spare(&client, &tower_id, format).await?,
    }

    Ok(())
}
