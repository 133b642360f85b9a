use stoker::config::MinerConfig;
use stoker::daemon::Daemon;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    stoker::tracing::init_journald_or_stdout();
    let config = MinerConfig::from_env()?;
    Daemon::new().run(config).await
}
