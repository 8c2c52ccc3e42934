//! CLI command definitions and handlers.

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand, ValueEnum};
use color_eyre::eyre::{Result, WrapErr};
use rustainer_common::{ContainerId, RustainerPaths};
use rustainer_network::{
    AttachRequest, CommandHost, NetworkConfig, NetworkLifecycleManager, PortMapping,
};

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum LogFormat {
    /// Human-readable lines.
    #[default]
    Text,
    /// One JSON object per event.
    Json,
}

/// rustainer-net - container network operations
#[derive(Parser)]
#[command(name = "rustainer-net")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Network configuration file (defaults apply if it does not exist)
    #[arg(long, global = true, env = "RUSTAINER_NETWORK_CONFIG")]
    pub config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(long, global = true)]
    pub debug: bool,

    /// Log output format
    #[arg(long, global = true, value_enum, default_value_t = LogFormat::Text)]
    pub log_format: LogFormat,

    /// The subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,
}

/// Network commands.
#[derive(Subcommand)]
pub enum Commands {
    /// Print the effective network configuration
    Config,

    /// Remove orphaned namespaces, veths, rules and an idle bridge
    Reconcile {
        /// Print the report as JSON
        #[arg(long)]
        json: bool,
    },

    /// Persisted sysctl operations
    Sysctl {
        /// The sysctl action.
        #[command(subcommand)]
        action: SysctlCommand,
    },

    /// Attach a container and hold it until interrupted
    Attach {
        /// Container ID
        container_id: ContainerId,

        /// Publish a port, HOST:CONTAINER[/tcp|udp] or IP:HOST:CONTAINER
        #[arg(short = 'p', long = "publish")]
        publish: Vec<PortMapping>,

        /// Print network details as JSON
        #[arg(long)]
        json: bool,
    },

    /// Detach a container
    Detach {
        /// Container ID
        container_id: ContainerId,
    },
}

/// Sysctl subcommands.
#[derive(Subcommand)]
pub enum SysctlCommand {
    /// Re-apply every value from the persisted file
    Apply,
}

impl Cli {
    /// Default log filter directive.
    #[must_use]
    pub const fn log_directive(&self) -> &'static str {
        if self.debug {
            "rustainer=debug"
        } else {
            "rustainer=info"
        }
    }

    /// Execute the CLI command.
    ///
    /// # Errors
    ///
    /// Returns an error if configuration is invalid or the operation fails.
    pub async fn execute(self) -> Result<()> {
        let config_path = self
            .config
            .clone()
            .unwrap_or_else(|| RustainerPaths::default().network_config());
        let config = NetworkConfig::load_or_default(&config_path)
            .wrap_err_with(|| format!("Failed to load {}", config_path.display()))?;
        tracing::debug!(path = %config_path.display(), bridge = %config.bridge, "Using network configuration");

        if matches!(self.command, Commands::Config) {
            print!("{}", config.to_toml_string()?);
            return Ok(());
        }

        let host = Arc::new(CommandHost::new(config.command_timeout()));
        let manager = NetworkLifecycleManager::new(config, host)?;

        match self.command {
            Commands::Config => {}

            Commands::Reconcile { json } => {
                let report = manager.reconcile().await?;
                if json {
                    println!("{}", serde_json::to_string_pretty(&report)?);
                } else {
                    print!("{report}");
                }
            }

            Commands::Sysctl {
                action: SysctlCommand::Apply,
            } => {
                let applied = manager.sysctl().apply_persisted().await?;
                println!(
                    "Applied {applied} sysctl(s) from {}",
                    manager.sysctl().conf_path().display()
                );
            }

            Commands::Attach {
                container_id,
                publish,
                json,
            } => {
                let mut request = AttachRequest::new(container_id.clone());
                for mapping in publish {
                    request = request.with_port(mapping);
                }

                let info = manager
                    .attach_with_cancel(request, async {
                        let _ = tokio::signal::ctrl_c().await;
                    })
                    .await
                    .wrap_err_with(|| format!("Failed to attach {container_id}"))?;

                if json {
                    println!("{}", serde_json::to_string_pretty(&info)?);
                } else {
                    println!(
                        "Container {container_id} attached: {}/{} via {} in {}",
                        info.ip,
                        info.prefix_len,
                        info.gateway,
                        info.namespace_path.display()
                    );
                }

                tokio::signal::ctrl_c().await?;
                manager.detach(&container_id).await?;
                println!("Container {container_id} detached");
            }

            Commands::Detach { container_id } => {
                manager.detach(&container_id).await?;
                println!("Container {container_id} detached");
            }
        }

        Ok(())
    }
}
