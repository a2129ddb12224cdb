use robovac_proxy::{bridge, config};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "robovac_proxy=info".into()),
        )
        .init();

    let config = config::Config::from_env()?;
    tracing::info!(
        bind_ip = %config.bind_ip,
        robot_port = config.robot_port,
        local_control_port = config.local_control_port,
        "Config loaded"
    );

    let bridge = bridge::start(&config).await?;
    tracing::info!(
        robot = %bridge.robot_addr(),
        local_control = %bridge.local_addr(),
        "Bridge legs bound"
    );

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutting down");
    Ok(())
}
