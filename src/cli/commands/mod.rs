pub mod ask;
pub mod chat;
pub mod config;

pub use ask::AskCommand;
pub use chat::ChatCommand;
pub use config::ConfigCommand;

use anyhow::{Context, Result};
use clap::{Args, Subcommand};
use std::fs;
use std::path::PathBuf;

use crate::config::ConfigArgs;
use crate::runtime::ArtworkMetadata;

#[derive(Subcommand)]
pub enum Commands {
    /// Ask a single question about an artwork
    Ask(AskCommand),
    /// Answer questions read from stdin, one per line
    Chat(ChatCommand),
    /// Print the effective configuration as JSON
    Config(ConfigCommand),
}

impl Commands {
    pub fn config_args(&self) -> &ConfigArgs {
        match self {
            Commands::Ask(cmd) => &cmd.config,
            Commands::Chat(cmd) => &cmd.config,
            Commands::Config(cmd) => &cmd.config,
        }
    }
}

/// Artwork the session is primed with
#[derive(Args, Debug, Clone, Default)]
pub struct ArtworkArgs {
    /// JSON file with artwork metadata; flags below override its fields
    #[arg(long)]
    pub artwork: Option<PathBuf>,

    #[arg(long)]
    pub title: Option<String>,

    #[arg(long)]
    pub author: Option<String>,

    /// Object type (painting, sculpture, ...)
    #[arg(long)]
    pub kind: Option<String>,

    /// Medium or technique
    #[arg(long)]
    pub technique: Option<String>,

    #[arg(long)]
    pub school: Option<String>,

    #[arg(long)]
    pub date: Option<String>,

    #[arg(long)]
    pub description: Option<String>,
}

impl ArtworkArgs {
    pub fn resolve(&self) -> Result<ArtworkMetadata> {
        let mut metadata = match &self.artwork {
            Some(path) => {
                let raw = fs::read_to_string(path)
                    .with_context(|| format!("Failed to read artwork file {}", path.display()))?;
                serde_json::from_str(&raw)
                    .with_context(|| format!("Failed to parse artwork file {}", path.display()))?
            }
            None => ArtworkMetadata::default(),
        };

        let overrides = [
            (&self.title, &mut metadata.title),
            (&self.author, &mut metadata.author),
            (&self.kind, &mut metadata.kind),
            (&self.technique, &mut metadata.technique),
            (&self.school, &mut metadata.school),
            (&self.date, &mut metadata.date),
            (&self.description, &mut metadata.description),
        ];
        for (flag, field) in overrides {
            if let Some(value) = flag {
                *field = value.clone();
            }
        }

        if metadata.is_empty() {
            anyhow::bail!("No artwork metadata given; pass --artwork or --title");
        }
        Ok(metadata)
    }
}
