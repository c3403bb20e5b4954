//! The `config` module loads `msgbus` settings.
//!
//! Sources, lowest precedence first: built-in defaults, an optional
//! `config/default.{toml,yaml,json}` file, and `MSGBUS_*` environment
//! variables using `__` between nesting levels
//! (e.g. `MSGBUS_MESSAGING__BACKEND=kafka`).

mod settings;

use config::{Config, ConfigError, Environment, File};

use settings::PartialSettings;

pub use settings::{
    LogSettings, MessagingSettings, MqttSettings, RabbitMqSettings, Settings,
};

/// Loads the configuration from the default file and environment variables
/// Merges the configuration with default values
/// Returns a `Settings` struct containing the logging and messaging configurations
pub fn load_config() -> Result<Settings, ConfigError> {
    let builder = Config::builder()
        .add_source(File::with_name("config/default").required(false))
        .add_source(
            Environment::with_prefix("MSGBUS")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

    let config = builder.build()?;

    // Try to deserialize what is available
    let partial: PartialSettings = config.try_deserialize()?;

    let settings = partial.merge(Settings::default());
    validate(&settings)?;
    Ok(settings)
}

fn validate(settings: &Settings) -> Result<(), ConfigError> {
    let messaging = &settings.messaging;
    if messaging.url.is_empty() {
        return Err(ConfigError::Message("messaging.url must not be empty".into()));
    }
    if messaging.mqtt.qos > 2 {
        return Err(ConfigError::Message(format!(
            "messaging.mqtt.qos must be 0, 1 or 2, got {}",
            messaging.mqtt.qos
        )));
    }
    if messaging.connect_timeout_secs == 0 || messaging.operation_timeout_secs == 0 {
        return Err(ConfigError::Message("timeouts must be positive".into()));
    }
    Ok(())
}

#[cfg(test)]
mod tests;
