use std::path::PathBuf;

use clap::{Parser, Subcommand};

use tenantry::config::{AppConfig, ConfigLoader};
use tenantry::errors::AppError;
use tenantry::logging::{init_logging, LoggingConfig};
use tenantry::simulation::{self, SimulationOptions};
use tenantry::tenancy::TenantId;

#[derive(Parser, Debug)]
#[command(name = "tenantry", version, about = "Multi-tenant runtime isolation engine")]
struct Cli {
    /// Path to the configuration file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Serve simulated requests for several tenants and drain their background tasks
    Simulate {
        /// Tenants to route requests for
        #[arg(long, value_delimiter = ',', default_value = "alpha,beta,gamma")]
        tenants: Vec<String>,

        /// Number of request rounds
        #[arg(long, default_value_t = 5)]
        requests: usize,

        /// Background tasks enqueued per tenant and round
        #[arg(long, default_value_t = 3)]
        tasks: usize,

        /// Print the summary as JSON
        #[arg(long)]
        json: bool,
    },
    /// Print the effective configuration
    ShowConfig,
}

fn load_config(path: Option<PathBuf>) -> Result<AppConfig, AppError> {
    let loader = match path {
        Some(path) => ConfigLoader::with_path(path),
        None => ConfigLoader::new(),
    };
    Ok(loader.load_config()?)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = load_config(cli.config)?;
    init_logging(&LoggingConfig::from_settings(&config.logging)?)?;

    match cli.command {
        Command::Simulate {
            tenants,
            requests,
            tasks,
            json,
        } => {
            let tenants = tenants
                .into_iter()
                .map(TenantId::new)
                .collect::<Result<Vec<_>, _>>()?;
            let options = SimulationOptions {
                tenants,
                rounds: requests,
                tasks_per_round: tasks,
            };
            let summary = simulation::run(&config, &options).await?;

            if json {
                println!("{}", serde_json::to_string_pretty(&summary)?);
            } else {
                for (tenant, stats) in &summary.tenants {
                    println!(
                        "{tenant:<12} tenant pipeline: {:>3}  default pipeline: {:>3}  visits: {:>3}",
                        stats.tenant_pipeline, stats.default_pipeline, stats.visits
                    );
                }
                println!(
                    "tasks: {} enqueued, {} succeeded, {} failed over {} drains ({} ticks dropped)",
                    summary.tasks_enqueued,
                    summary.tasks_succeeded,
                    summary.tasks_failed,
                    summary.drains,
                    summary.dropped_ticks
                );
                println!(
                    "audit entries: {}  shared clock: {}",
                    summary.audit_entries, summary.shared_clock
                );
            }
        }
        Command::ShowConfig => {
            println!("[scheduler]");
            println!("tick_interval_ms = {}", config.scheduler.tick_interval_ms);
            println!();
            println!("[tenancy]");
            println!("default_tenant = {:?}", config.tenancy.default_tenant);
            println!("preload = {:?}", config.tenancy.preload);
            println!(
                "rebuild_queue_capacity = {}",
                config.tenancy.rebuild_queue_capacity
            );
            println!();
            println!("[logging]");
            println!("level = {:?}", config.logging.level);
            println!("format = {:?}", config.logging.format);
            println!("show_target = {}", config.logging.show_target);
            println!("show_thread_ids = {}", config.logging.show_thread_ids);
        }
    }

    Ok(())
}
