use clap::Args;

use super::ArtworkArgs;
use crate::config::ConfigArgs;

#[derive(Args)]
pub struct ChatCommand {
    #[command(flatten)]
    pub config: ConfigArgs,

    #[command(flatten)]
    pub artwork: ArtworkArgs,
}
