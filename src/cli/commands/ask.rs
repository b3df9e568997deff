use clap::Args;

use super::ArtworkArgs;
use crate::config::ConfigArgs;

#[derive(Args)]
pub struct AskCommand {
    #[command(flatten)]
    pub config: ConfigArgs,

    #[command(flatten)]
    pub artwork: ArtworkArgs,

    /// Print generation statistics as JSON after the answer
    #[arg(long)]
    pub stats: bool,

    /// Question about the artwork
    pub question: String,
}
