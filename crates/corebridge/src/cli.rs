use clap::Parser;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(
    name = "corebridge",
    version,
    about = "Local control server for a desktop proxy-engine UI"
)]
pub struct Cli {
    /// Path to the configuration file
    #[arg(short, long, default_value = "config.yaml")]
    pub config: PathBuf,

    /// Listen address (overrides config file and environment)
    #[arg(long)]
    pub listen: Option<String>,

    /// Path to the credentials file (overrides config file setting)
    #[arg(long)]
    pub auth_file: Option<PathBuf>,
}
