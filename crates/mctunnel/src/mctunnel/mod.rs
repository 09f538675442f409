pub mod app;
pub mod config;
pub mod dialer;
pub mod logging;
pub mod net;
pub mod protocol;
pub mod proxy;
pub mod relay;
pub mod resolver;
pub mod telemetry;

pub async fn run(config_path: Option<std::path::PathBuf>) -> anyhow::Result<()> {
    app::run(config_path).await
}
