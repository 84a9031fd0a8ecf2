//! Host configuration loading.
//!
//! Sources, applied in order (later sources override earlier ones):
//!  1. `/etc/queue-transport/host.yaml` for system-wide defaults
//!  2. `./config/host.yaml` for a deployment-local override
//!  3. An explicit file from `--config` or `QT_CONFIG_FILE`
//!  4. Environment variables prefixed `QT__` with `__` as separator,
//!     e.g. `QT__TRANSPORT__INPUT_QUEUE=orders`
//!
//! Every field has a default, so missing files produce a runnable host. A
//! malformed file or a value that cannot be coerced is a hard error.

use queue_transport::TransportSettings;
use serde::{Deserialize, Serialize};
use std::path::Path;

#[cfg(test)]
#[path = "settings_tests.rs"]
mod tests;

/// Everything the host reads from configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HostConfig {
    pub transport: TransportSettings,

    /// Upper bound on messages processed at the same time
    pub max_concurrency: u32,

    /// Deliveries before a failing message is parked in the error queue
    pub max_delivery_attempts: u32,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            transport: TransportSettings::default(),
            max_concurrency: 16,
            max_delivery_attempts: 5,
        }
    }
}

impl HostConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.max_concurrency == 0 {
            anyhow::bail!("max_concurrency must be at least 1");
        }
        if self.max_delivery_attempts == 0 {
            anyhow::bail!("max_delivery_attempts must be at least 1");
        }
        self.transport.validate()?;
        Ok(())
    }
}

/// Build the layered configuration and deserialize it
pub fn load(explicit_path: Option<&Path>) -> Result<HostConfig, config::ConfigError> {
    load_from(
        &[
            Path::new("/etc/queue-transport/host"),
            Path::new("config/host"),
        ],
        explicit_path,
    )
}

fn load_from(
    defaults: &[&Path],
    explicit_path: Option<&Path>,
) -> Result<HostConfig, config::ConfigError> {
    let mut builder = config::Config::builder();

    for path in defaults {
        builder = builder.add_source(
            config::File::from(*path)
                .required(false)
                .format(config::FileFormat::Yaml),
        );
    }

    if let Some(path) = explicit_path {
        builder = builder.add_source(
            config::File::from(path)
                .required(true)
                .format(config::FileFormat::Yaml),
        );
    }

    builder
        .add_source(config::Environment::with_prefix("QT").separator("__"))
        .build()?
        .try_deserialize()
}
