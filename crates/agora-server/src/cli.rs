use clap::Parser;

#[derive(Parser, Debug)]
#[command(name = "agora-server", about = "Agora realtime gateway server")]
pub struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "config/agora.toml")]
    pub config: String,

    /// Bind address (overrides config)
    #[arg(long)]
    pub bind: Option<String>,
}
