use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::info;

use crate::config::Config;
use crate::node::Node;
use crate::storage::Database;
use crate::sync::PeerRuntimeInfo;

pub mod console;

#[derive(Parser)]
#[command(name = "clipmesh")]
#[command(about = "Secure peer synchronization between devices on your network")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    #[arg(short, long)]
    pub config: Option<PathBuf>,

    #[arg(short, long)]
    pub verbose: bool,
}

#[derive(Subcommand)]
pub enum Commands {
    #[command(about = "Start ClipMesh with an interactive console")]
    Start,

    #[command(about = "Show this device's instance id")]
    Id,

    #[command(about = "List tracked and blocked devices")]
    Peers,

    #[command(about = "List background pulls")]
    Tasks,

    #[command(about = "Configuration management")]
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
pub enum ConfigAction {
    #[command(about = "Show current configuration")]
    Show,

    #[command(about = "Generate example configuration")]
    Init {
        #[arg(long)]
        force: bool,
    },

    #[command(about = "Validate configuration")]
    Validate,
}

pub struct CliHandler {
    config_path: Option<PathBuf>,
}

impl CliHandler {
    pub fn new(config_path: Option<PathBuf>) -> Self {
        Self { config_path }
    }

    fn config(&self) -> Result<Config> {
        Ok(Config::load_config(self.config_path.as_deref())?)
    }

    /// Open the database without starting the network side
    async fn database(&self, config: &Config) -> Result<Arc<Database>> {
        tokio::fs::create_dir_all(&config.data_dir).await?;
        let db = Database::open(&config.database_path())
            .await
            .with_context(|| format!("Failed to open {}", config.database_path().display()))?;
        Ok(Arc::new(db))
    }

    pub async fn handle_command(&self, command: Commands) -> Result<()> {
        match command {
            Commands::Start => self.start().await,
            Commands::Id => self.show_id().await,
            Commands::Peers => self.show_peers().await,
            Commands::Tasks => self.show_tasks().await,
            Commands::Config { action } => self.handle_config_action(action),
        }
    }

    async fn start(&self) -> Result<()> {
        let config = self.config()?;
        info!("Starting ClipMesh");

        let node = Node::start(config).await?;
        println!(
            "ClipMesh {} ({}) listening on {}",
            node.instance_id(),
            node.local_info().device_name,
            node.local_addr()
        );

        let printer = console::spawn_event_printer(node.subscribe(), node.executor().subscribe());
        let result = console::run(&node).await;

        node.shutdown().await;
        printer.abort();
        result
    }

    async fn show_id(&self) -> Result<()> {
        let config = self.config()?;
        let id = match &config.instance_id {
            Some(id) => id.clone(),
            None => self.database(&config).await?.instance_id().await?,
        };
        println!("{}", id);
        Ok(())
    }

    async fn show_peers(&self) -> Result<()> {
        let config = self.config()?;
        let db = self.database(&config).await?;
        let peers: Vec<PeerRuntimeInfo> = db.list_peers().await?;
        let blocked = db.blacklist().await?;

        if peers.is_empty() {
            println!("No tracked devices");
        } else {
            println!("Tracked devices ({}):", peers.len());
            for peer in peers {
                println!(
                    "  {} - {} ({}, v{}) last state: {}",
                    peer.instance_id, peer.device_name, peer.platform, peer.app_version, peer.state
                );
            }
        }

        if !blocked.is_empty() {
            println!("Blocked devices ({}):", blocked.len());
            for id in blocked {
                println!("  {}", id);
            }
        }
        Ok(())
    }

    async fn show_tasks(&self) -> Result<()> {
        let config = self.config()?;
        let tasks = self.database(&config).await?.list_tasks().await?;

        if tasks.is_empty() {
            println!("No background pulls");
            return Ok(());
        }
        for task in tasks {
            println!(
                "{} [{}] {} {}{}",
                task.created_at.format("%Y-%m-%d %H:%M:%S"),
                task.status,
                task.task_type,
                task.task_id,
                task.last_error()
                    .map(|e| format!(": {}", e))
                    .unwrap_or_default()
            );
        }
        Ok(())
    }

    fn handle_config_action(&self, action: ConfigAction) -> Result<()> {
        match action {
            ConfigAction::Show => {
                let config = self.config()?;
                println!("Current Configuration:");
                println!("{}", toml::to_string_pretty(&config)?);
            }
            ConfigAction::Init { force } => {
                let path = match &self.config_path {
                    Some(path) => path.clone(),
                    None => Config::default_path().context("Could not find config directory")?,
                };
                Config::generate_example_config(&path, force)?;
                println!("Example configuration written to {}", path.display());
            }
            ConfigAction::Validate => {
                self.config()?;
                println!("Configuration is valid");
            }
        }
        Ok(())
    }
}
