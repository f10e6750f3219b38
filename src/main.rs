//! OpsPilot - natural-language operations assistant
//!
//! `opspilot run "restart nginx"` takes one request through the ReAct
//! engine; risky steps suspend until `opspilot resume --approve`.

use clap::Parser;
use opspilot::cli::{self, Cli};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();
    let code = cli::execute(cli).await?;
    std::process::exit(code);
}
