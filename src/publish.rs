//! MQTT publisher.
//!
//! Publishes the aggregated readings as an x-www-form-urlencoded string,
//! the format the receiving side already speaks. Publishing is fire and
//! forget from the client loop's point of view; a background task keeps
//! the connection alive and logs delivery problems.

use std::time::Duration;

use rumqttc::{AsyncClient, Event, MqttOptions, QoS};
use tokio::task::JoinHandle;

use crate::config::Config;
use crate::processor::Publisher;

const CRATE_VERSION: &str = env!("CARGO_PKG_VERSION");

pub struct MqttPublisher {
    client: AsyncClient,
    topic: String,
    guid: String,
}

impl MqttPublisher {
    /// Connect to the broker and spawn the event-loop driver task. The
    /// task reconnects on its own; dropping the handle does not stop it.
    pub fn connect(config: &Config) -> (Self, JoinHandle<()>) {
        let mut options = MqttOptions::new(
            format!("me162-pub-{}", std::process::id()),
            &config.broker_host,
            config.broker_port,
        );
        options.set_keep_alive(Duration::from_secs(30));

        let (client, mut eventloop) = AsyncClient::new(options, 10);
        let driver = tokio::spawn(async move {
            loop {
                match eventloop.poll().await {
                    Ok(Event::Incoming(packet)) => log::trace!("mqtt in: {:?}", packet),
                    Ok(Event::Outgoing(packet)) => log::trace!("mqtt out: {:?}", packet),
                    Err(e) => {
                        log::warn!("mqtt connection error: {}; retrying", e);
                        tokio::time::sleep(Duration::from_secs(1)).await;
                    }
                }
            }
        });

        (
            Self {
                client,
                topic: config.topic.clone(),
                guid: config.guid.clone(),
            },
            driver,
        )
    }

    fn payload(&self, positive_wh: i64, negative_wh: i64, instantaneous_w: i64) -> String {
        format!(
            "device_id={}&e_pos_act_energy_wh={}&e_neg_act_energy_wh={}&\
             e_inst_power_w={}&dbg_uptime={}&dbg_version=me162-pub-{}",
            self.guid,
            positive_wh,
            negative_wh,
            instantaneous_w,
            chrono::Utc::now().timestamp(),
            CRATE_VERSION,
        )
    }
}

impl Publisher for MqttPublisher {
    fn publish(&self, positive_wh: i64, negative_wh: i64, instantaneous_w: i64) {
        let payload = self.payload(positive_wh, negative_wh, instantaneous_w);
        match self
            .client
            .try_publish(&self.topic, QoS::AtLeastOnce, false, payload)
        {
            Ok(()) => log::info!(
                "Published: 1.8.0 {} Wh, 2.8.0 {} Wh, 16.7.0 {} W",
                positive_wh,
                negative_wh,
                instantaneous_w
            ),
            Err(e) => log::error!("mqtt publish failed: {}", e),
        }
    }
}
