use anyhow::Result;
use clap::Parser;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    let config = yapyap_node::config::NodeConfig::parse();

    // Use JSON logs in production (YAPYAP_LOG_JSON=1), human-readable
    // otherwise.
    let json_logs = std::env::var("YAPYAP_LOG_JSON").unwrap_or_default() == "1";
    let mut filter = EnvFilter::from_default_env().add_directive("yapyap_node=info".parse()?);
    if let Some(level) = &config.log_level {
        filter = filter.add_directive(format!("yapyap_node={level}").parse()?);
    }
    if json_logs {
        tracing_subscriber::fmt().with_env_filter(filter).json().init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }

    tracing::info!(data_dir = %config.data_dir, "starting yapyap node");
    let node = yapyap_node::Node::start(config).await?;
    tracing::info!(peer = %node.peer_id(), "node running; ctrl-c to stop");

    tokio::signal::ctrl_c().await?;
    node.shutdown().await;
    Ok(())
}
