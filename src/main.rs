use lux_dongle_bridge::prelude::*;

use std::time::Duration;

#[tokio::main]
async fn main() -> Result<()> {
    let options = Options::new();

    let config = Config::new(options.config_file.clone()).unwrap_or_else(|err| {
        eprintln!("Failed to load config: {:?}", err);
        std::process::exit(255);
    });

    lux_dongle_bridge::init_logging(&config.loglevel);
    info!("Using config file: {}", options.config_file);
    config.log_summary();

    let channels = Channels::new();

    // Handle Ctrl+C
    let c = channels.clone();
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
        }
        info!("Ctrl+C received, shutting down");
        c.shutdown();
    });

    if let Some(secs) = options.runtime {
        let c = channels.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(secs)).await;
            info!("runtime of {}s reached, shutting down", secs);
            c.shutdown();
        });
    }

    lux_dongle_bridge::app(ConfigWrapper::from_config(config), channels).await
}
