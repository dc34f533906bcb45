use clap::Parser;
use tracing_subscriber::EnvFilter;
use volume_decorator::{config::Config, manager};

#[actix_web::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    manager::run(config).await?;
    Ok(())
}
