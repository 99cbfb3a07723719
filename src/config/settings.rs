use serde::Deserialize;

/// Top-level configuration settings for the application.
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct Settings {
    pub server: ServerSettings,
    pub broker: BrokerSettings,
    pub log: LogSettings,
}

/// Address the WebSocket service binds to.
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct ServerSettings {
    pub host: String,
    pub port: u16,
}

/// Broker lifecycle settings.
///
/// `shutdown_timeout_ms` bounds how long process shutdown waits for
/// subscriptions to drain. `0` waits without limit.
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct BrokerSettings {
    pub shutdown_timeout_ms: u64,
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct LogSettings {
    pub level: String,
}

impl Settings {
    /// `host:port` for the listener.
    pub fn server_addr(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }
}

impl BrokerSettings {
    pub fn shutdown_timeout(&self) -> Option<std::time::Duration> {
        match self.shutdown_timeout_ms {
            0 => None,
            ms => Some(std::time::Duration::from_millis(ms)),
        }
    }
}

/// Partial configuration loaded from files or environment.
///
/// Missing values are filled from `Settings::default()`.
#[derive(Debug, Deserialize, Default)]
pub struct PartialSettings {
    pub server: Option<PartialServerSettings>,
    pub broker: Option<PartialBrokerSettings>,
    pub log: Option<PartialLogSettings>,
}

#[derive(Debug, Deserialize, Default)]
pub struct PartialServerSettings {
    pub host: Option<String>,
    pub port: Option<u16>,
}

#[derive(Debug, Deserialize, Default)]
pub struct PartialBrokerSettings {
    pub shutdown_timeout_ms: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
pub struct PartialLogSettings {
    pub level: Option<String>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            server: ServerSettings {
                host: "127.0.0.1".to_string(),
                port: 8080,
            },
            broker: BrokerSettings {
                shutdown_timeout_ms: 5000,
            },
            log: LogSettings {
                level: "info".to_string(),
            },
        }
    }
}

impl PartialSettings {
    /// Overlay the values that are present onto `defaults`.
    pub fn merge(self, defaults: Settings) -> Settings {
        let server = self.server.unwrap_or_default();
        let broker = self.broker.unwrap_or_default();
        let log = self.log.unwrap_or_default();

        Settings {
            server: ServerSettings {
                host: server.host.unwrap_or(defaults.server.host),
                port: server.port.unwrap_or(defaults.server.port),
            },
            broker: BrokerSettings {
                shutdown_timeout_ms: broker
                    .shutdown_timeout_ms
                    .unwrap_or(defaults.broker.shutdown_timeout_ms),
            },
            log: LogSettings {
                level: log.level.unwrap_or(defaults.log.level),
            },
        }
    }
}
