//! Polling client binary: reads an ISKRA ME162 over the optical serial
//! head and publishes the derived power estimate over MQTT.
//!
//! Runs until SIGINT/SIGTERM, a transport failure, or the dead man's
//! switch; a process supervisor is expected to restart it.

use clap::Parser;
use me162_pub::config::Config;
use me162_pub::iec62056::client::ModeCClient;
use me162_pub::processor::{dead_mans_switch, Me162Processor};
use me162_pub::publish::MqttPublisher;
use me162_pub::Result;

/// Default device path: the socket advertised by the co-located sample
/// server's serial proxy.
const DEFAULT_DEVICE: &str = "./me162-sample-server.sock";

#[derive(Parser)]
#[command(version, about = "IEC 62056-21 mode C meter reader and MQTT publisher")]
struct Args {
    /// Serial device path, e.g. /dev/ttyAMA0.
    device: Option<String>,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    init_logging();
    let args = Args::parse();
    let device = args.device.unwrap_or_else(|| DEFAULT_DEVICE.to_string());
    let config = Config::from_env();

    log::info!(
        "pid {}: reading {}, publishing to {}:{} {}",
        std::process::id(),
        device,
        config.broker_host,
        config.broker_port,
        config.topic
    );

    let (publisher, mqtt_driver) = MqttPublisher::connect(&config);
    let processor = Me162Processor::new(Some(publisher));
    let watchdog = processor.watchdog();

    let mut client = ModeCClient::open(&device, processor).await?;

    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;

    // First failure wins; the transport closes when the client drops,
    // which also tears a proxy peer down through HUP.
    let result = tokio::select! {
        result = client.run() => result,
        result = dead_mans_switch(watchdog) => result,
        _ = tokio::signal::ctrl_c() => {
            log::info!("got SIGINT, shutting down");
            Ok(())
        }
        _ = sigterm.recv() => {
            log::info!("got SIGTERM, shutting down");
            Ok(())
        }
    };

    mqtt_driver.abort();
    drop(client);

    if let Err(ref e) = result {
        log::error!("session failed: {}", e);
    }
    log::info!("end of main");
    result
}

fn init_logging() {
    let default_level = if std::env::var("ME162_DEBUG").map_or(false, |v| !v.is_empty()) {
        "debug"
    } else {
        "info"
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_level))
        .init();
}
