//! Runtime configuration from the environment.
//!
//! Everything has a default that points at public test infrastructure, so
//! the binary runs out of the box against the sample server.

use std::env;

#[derive(Debug, Clone)]
pub struct Config {
    /// MQTT broker host.
    pub broker_host: String,
    /// MQTT broker port.
    pub broker_port: u16,
    /// Topic the energy readings are published on.
    pub topic: String,
    /// Device GUID included in every payload.
    pub guid: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            broker_host: "test.mosquitto.org".to_string(),
            broker_port: 1883,
            topic: "myhome/infra/power/xwwwform".to_string(),
            guid: "EUI48:11:22:33:44:55:66".to_string(),
        }
    }
}

impl Config {
    /// Read `ME162_BROKER` (host or host:port), `ME162_TOPIC` and
    /// `ME162_GUID`, falling back to the defaults.
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let (broker_host, broker_port) = match env::var("ME162_BROKER") {
            Ok(broker) => match broker.rsplit_once(':') {
                Some((host, port)) => match port.parse() {
                    Ok(port) => (host.to_string(), port),
                    Err(_) => (broker.clone(), defaults.broker_port),
                },
                None => (broker, defaults.broker_port),
            },
            Err(_) => (defaults.broker_host, defaults.broker_port),
        };

        Self {
            broker_host,
            broker_port,
            topic: env::var("ME162_TOPIC").unwrap_or(defaults.topic),
            guid: env::var("ME162_GUID").unwrap_or(defaults.guid),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.broker_host, "test.mosquitto.org");
        assert_eq!(config.broker_port, 1883);
    }

    #[test]
    fn test_broker_with_port() {
        // Exercised through the same parsing the env path uses.
        let defaults = Config::default();
        let (host, port) = match "broker.local:8883".rsplit_once(':') {
            Some((host, port)) => (host.to_string(), port.parse().unwrap()),
            None => (defaults.broker_host, defaults.broker_port),
        };
        assert_eq!(host, "broker.local");
        assert_eq!(port, 8883u16);
    }
}
