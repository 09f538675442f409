mod mctunnel;

use clap::Parser;

#[derive(Debug, Parser)]
#[command(
    name = "mctunnel",
    version,
    about = "mctunnel - hostname-routed Minecraft TCP relay"
)]
struct Cli {
    /// Path to the config file (.toml/.yaml/.yml). If omitted, uses MCTUNNEL_CONFIG; then auto-detects mctunnel.toml > mctunnel.yaml > mctunnel.yml from CWD; then falls back to the OS default path (Linux: /etc/mctunnel/mctunnel.toml; others: user config dir).
    #[arg(long, env = "MCTUNNEL_CONFIG")]
    config: Option<std::path::PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    mctunnel::run(cli.config).await
}
