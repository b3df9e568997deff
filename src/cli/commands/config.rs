use clap::Args;

use crate::config::ConfigArgs;

#[derive(Args)]
pub struct ConfigCommand {
    #[command(flatten)]
    pub config: ConfigArgs,
}
