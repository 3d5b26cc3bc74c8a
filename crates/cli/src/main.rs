//! Fleet controller CLI
//!
//! A command-line tool for triggering switches, inspecting the risk ledger,
//! and managing risk models.
//!
//! Exit codes: 0 success, 1 validation error, 2 conflict, 3 no candidate.

mod client;
mod commands;
mod output;

use anyhow::Result;
use clap::{Parser, Subcommand};
use client::ApiFailure;
use commands::{models, risk, switches};
use output::print_info;

/// Fleet controller CLI
#[derive(Parser)]
#[command(name = "fleet")]
#[command(author, version, about = "CLI for the fleet switch controller", long_about = None)]
pub struct Cli {
    /// API endpoint URL (can also be set via FLEET_API_URL env var)
    #[arg(long, env = "FLEET_API_URL", default_value = "http://localhost:8080")]
    pub api_url: String,

    /// Output format
    #[arg(long, short, default_value = "table")]
    pub format: output::OutputFormat,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Trigger a manual switch for a resource
    Switch {
        /// Source resource id to migrate away from
        source_resource_id: String,

        /// Drain variant (single_instance, asg_member, kubernetes_node)
        #[arg(long, default_value = "single_instance")]
        variant: String,

        /// Most members an autoscaling group may lose at once; only
        /// meaningful with --variant asg_member
        #[arg(long, default_value_t = 1)]
        capacity_ceiling: usize,

        /// Constrain candidates to an instance family
        #[arg(long)]
        instance_family: Option<String>,

        /// Constrain candidates to an architecture
        #[arg(long)]
        architecture: Option<String>,

        /// Minimum pool capacity
        #[arg(long, default_value_t = 0)]
        min_capacity: u32,

        /// Reason recorded on the switch record
        #[arg(long)]
        reason: Option<String>,
    },

    /// Cancel an in-flight switch (allowed only before the replacement is
    /// verified)
    Cancel {
        /// Source resource id of the switch to cancel
        source_resource_id: String,
    },

    /// List controller state
    #[command(subcommand)]
    Get(GetCommands),

    /// Risk ledger operations
    #[command(subcommand)]
    Risk(RiskCommands),

    /// Risk model operations
    #[command(subcommand)]
    Model(ModelCommands),
}

#[derive(Subcommand)]
pub enum GetCommands {
    /// List switch records
    Switches,
    /// List managed resources
    Resources,
}

#[derive(Subcommand)]
pub enum RiskCommands {
    /// List poisoned pools
    List,
    /// Force-expire a pool's poison flag
    Expire {
        /// Region of the pool
        region: String,
        /// Zone of the pool
        zone: String,
        /// Resource type of the pool
        resource_type: String,
    },
}

#[derive(Subcommand)]
pub enum ModelCommands {
    /// List registered models
    List {
        /// Show only the active production model
        #[arg(long)]
        active_only: bool,
    },
    /// Activate a graduated model as the single production scorer
    Activate {
        /// Model id to activate
        model_id: String,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    std::process::exit(match run(cli).await {
        Ok(()) => 0,
        Err(err) => {
            eprintln!("Error: {:#}", err);
            exit_code(&err)
        }
    });
}

/// Map the controller's error kind onto the documented exit codes
fn exit_code(err: &anyhow::Error) -> i32 {
    match err.downcast_ref::<ApiFailure>() {
        Some(failure) => match failure.kind.as_str() {
            "conflict" => 2,
            "no_candidate" => 3,
            _ => 1,
        },
        None => 1,
    }
}

async fn run(cli: Cli) -> Result<()> {
    let client = client::ApiClient::new(&cli.api_url)?;

    match cli.command {
        Commands::Switch {
            source_resource_id,
            variant,
            capacity_ceiling,
            instance_family,
            architecture,
            min_capacity,
            reason,
        } => {
            print_info(&format!("Requesting switch for {}", source_resource_id));
            switches::trigger_switch(
                &client,
                &source_resource_id,
                &variant,
                capacity_ceiling,
                instance_family,
                architecture,
                min_capacity,
                reason,
                cli.format,
            )
            .await?;
        }
        Commands::Cancel { source_resource_id } => {
            switches::cancel_switch(&client, &source_resource_id).await?;
        }
        Commands::Get(get_cmd) => match get_cmd {
            GetCommands::Switches => {
                switches::list_switches(&client, cli.format).await?;
            }
            GetCommands::Resources => {
                switches::list_resources(&client, cli.format).await?;
            }
        },
        Commands::Risk(risk_cmd) => match risk_cmd {
            RiskCommands::List => {
                risk::list_risk(&client, cli.format).await?;
            }
            RiskCommands::Expire {
                region,
                zone,
                resource_type,
            } => {
                risk::expire_pool(&client, &region, &zone, &resource_type).await?;
            }
        },
        Commands::Model(model_cmd) => match model_cmd {
            ModelCommands::List { active_only } => {
                models::list_models(&client, active_only, cli.format).await?;
            }
            ModelCommands::Activate { model_id } => {
                models::activate_model(&client, &model_id).await?;
            }
        },
    }

    Ok(())
}
