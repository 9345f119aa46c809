mod api;
mod identity;
mod listening;

use anyhow::{anyhow, Result};
use api::ApiClient;
use clap::{Parser, Subcommand};
use common::{BindingQuery, JoinRequest, PortQuery, ReleaseRequest, ReserveRequest};
use std::str::FromStr;
use std::time::Duration;
use tokio::time;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

const BASE_URL: &str = "http://localhost:3030";

#[derive(Parser)]
#[command(name = "gatekeeper", author, version, about, long_about = None)]
struct Cli {
    /// Gatekeeper daemon URL
    #[arg(long, env = "GATEKEEPER_URL", default_value = BASE_URL, global = true)]
    server: String,

    /// Instance id to act as (default: this machine's fingerprint)
    #[arg(long, env = "GATEKEEPER_INSTANCE_ID", global = true)]
    instance_id: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Register and inspect instances
    Instance {
        #[command(subcommand)]
        command: InstanceCommands,
    },
    /// Reserve, release and list ports
    Port {
        #[command(subcommand)]
        command: PortCommands,
    },
    /// Report ports listening on this host
    Agent {
        #[command(subcommand)]
        command: AgentCommands,
    },
}

#[derive(Subcommand)]
enum InstanceCommands {
    /// Register this machine
    Join {
        /// Display name (default: hostname)
        #[arg(long)]
        name: Option<String>,
    },
    /// Show one instance (default: this machine)
    Show { id: Option<String> },
    /// List all instances
    List,
}

#[derive(Subcommand)]
enum PortCommands {
    /// Reserve a port, or a contiguous range of ports
    Reserve {
        /// Number of contiguous ports
        #[arg(long)]
        range: Option<i64>,
    },
    /// Release a port (PORT) or a range (START:END)
    Release {
        target: ReleaseTarget,

        /// Do not scope the release to this instance
        #[arg(long)]
        any_owner: bool,
    },
    /// List ports known to the pool
    List {
        /// Only reserved ports
        #[arg(long, conflicts_with = "free")]
        reserved: bool,

        /// Only free ports
        #[arg(long)]
        free: bool,

        /// Only ports held by this instance
        #[arg(long)]
        mine: bool,
    },
    /// Show reservation history
    History {
        /// Include every instance
        #[arg(long)]
        all: bool,
    },
}

#[derive(Subcommand)]
enum AgentCommands {
    /// Report the given ports as observed
    Report {
        #[arg(required = true)]
        ports: Vec<u16>,
    },
    /// Periodically report this host's listening ports
    Watch {
        /// Seconds between reports
        #[arg(long, default_value_t = 30)]
        interval: u64,
    },
}

/// What `port release` targets: one port, or an exact range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReleaseTarget {
    Port(u16),
    Range(u16, u16),
}

impl FromStr for ReleaseTarget {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parse = |v: &str| v.trim().parse::<u16>().map_err(|_| format!("invalid port: {}", v));
        match s.split_once(':') {
            Some((start, end)) => {
                let (start, end) = (parse(start)?, parse(end)?);
                if start > end {
                    return Err(format!("range start {} is above end {}", start, end));
                }
                Ok(Self::Range(start, end))
            }
            None => Ok(Self::Port(parse(s)?)),
        }
    }
}

impl ReleaseTarget {
    fn into_request(self, instance_id: Option<String>) -> ReleaseRequest {
        match self {
            Self::Port(port) => ReleaseRequest {
                instance_id,
                port_number: Some(port),
                ..Default::default()
            },
            Self::Range(start, end) => ReleaseRequest {
                instance_id,
                start_port: Some(start),
                end_port: Some(end),
                ..Default::default()
            },
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let client = ApiClient::new(&cli.server);
    let instance_id = cli.instance_id.clone().unwrap_or_else(identity::fingerprint);

    match cli.command {
        Commands::Instance { command } => match command {
            InstanceCommands::Join { name } => {
                let req = JoinRequest {
                    instance_id: Some(instance_id),
                    name: Some(name.unwrap_or_else(identity::hostname)),
                    meta: identity::meta(),
                };
                let instance = client.join(&req).await?;
                println!("Joined as {} ({})", instance.name, instance.id);
            }
            InstanceCommands::Show { id } => {
                let instance = client.instance(id.as_deref().unwrap_or(&instance_id)).await?;
                println!("{}", serde_json::to_string_pretty(&instance)?);
            }
            InstanceCommands::List => {
                let instances = client.instances().await?;
                println!("Instances:");
                for instance in instances {
                    println!("{}  {}  joined {}", instance.id, instance.name, instance.created_at);
                }
            }
        },
        Commands::Port { command } => match command {
            PortCommands::Reserve { range } => {
                let req = ReserveRequest {
                    instance_id: Some(instance_id),
                    range,
                };
                let binding = client.reserve(&req).await?;
                println!("{}", binding);
            }
            PortCommands::Release { target, any_owner } => {
                let owner = (!any_owner).then_some(instance_id);
                let binding = client.release(&target.into_request(owner)).await?;
                println!("Released {}", binding);
            }
            PortCommands::List { reserved, free, mine } => {
                let query = PortQuery {
                    is_reserved: match (reserved, free) {
                        (true, _) => Some(true),
                        (_, true) => Some(false),
                        _ => None,
                    },
                    instance_id: mine.then_some(instance_id),
                };
                let ports = client.ports(&query).await?;
                for port in ports {
                    let state = if port.is_reserved { "reserved" } else { "free" };
                    println!("{}  {}", port.port_number, state);
                }
            }
            PortCommands::History { all } => {
                let query = BindingQuery {
                    instance_id: (!all).then_some(instance_id),
                    active: None,
                };
                let bindings = client.bindings(&query).await?;
                for binding in bindings {
                    let released = binding
                        .released_at
                        .map(|at| at.to_rfc3339())
                        .unwrap_or_else(|| "active".to_string());
                    println!(
                        "{:<12} {}  reserved {}  released {}",
                        binding.to_string(),
                        binding.instance_id,
                        binding.created_at.to_rfc3339(),
                        released
                    );
                }
            }
        },
        Commands::Agent { command } => match command {
            AgentCommands::Report { ports } => {
                let known = client.report_observed(ports).await?;
                println!("Recorded {} port(s) within the pool", known.len());
            }
            AgentCommands::Watch { interval } => {
                if interval == 0 {
                    return Err(anyhow!("interval must be at least one second"));
                }
                let mut ticker = time::interval(Duration::from_secs(interval));
                loop {
                    ticker.tick().await;
                    let ports = listening::listening_ports();
                    match client.report_observed(ports.clone()).await {
                        Ok(known) => info!(listening = ports.len(), in_pool = known.len(), "reported listening ports"),
                        Err(e) => warn!("Report failed: {:#}", e),
                    }
                }
            }
        },
    }

    Ok(())
}
