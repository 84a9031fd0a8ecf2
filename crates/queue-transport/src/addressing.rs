//! Queue addresses and account alias resolution.
//!
//! An address is either `queue` (the endpoint's own account) or
//! `queue@alias`. Aliases map to registered [`QueueService`]s. An address
//! carrying something shaped like a connection string is rejected outright:
//! addresses travel in headers such as reply-to, and credentials must never
//! be routed that way.

use crate::client::{QueueClient, QueueService};
use crate::error::ConfigurationError;
use crate::message::QueueName;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

const ALIAS_SEPARATOR: char = '@';

/// Parsed destination address
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct QueueAddress {
    queue: QueueName,
    alias: Option<String>,
}

impl QueueAddress {
    pub fn new(queue: QueueName, alias: Option<String>) -> Self {
        Self { queue, alias }
    }

    /// Parse `queue` or `queue@alias`
    pub fn parse(address: &str) -> Result<Self, ConfigurationError> {
        let (queue_part, alias_part) = match address.split_once(ALIAS_SEPARATOR) {
            Some((queue, alias)) => (queue, Some(alias)),
            None => (address, None),
        };

        if looks_like_connection_string(queue_part)
            || alias_part.is_some_and(looks_like_connection_string)
        {
            return Err(ConfigurationError::ConnectionStringInAddress {
                address: redact(queue_part),
            });
        }

        let queue = QueueName::new(queue_part.to_string()).map_err(|e| {
            ConfigurationError::Invalid {
                message: format!("address '{}': {}", address, e),
            }
        })?;

        let alias = match alias_part {
            None => None,
            Some(alias) if is_valid_alias(alias) => Some(alias.to_string()),
            Some(alias) => {
                return Err(ConfigurationError::Invalid {
                    message: format!(
                        "address '{}': alias '{}' may only contain letters, digits, '.', '_' and '-'",
                        queue_part, alias
                    ),
                })
            }
        };

        Ok(Self { queue, alias })
    }

    pub fn queue(&self) -> &QueueName {
        &self.queue
    }

    pub fn alias(&self) -> Option<&str> {
        self.alias.as_deref()
    }

    /// Same queue, alias filled in with `default_alias` if absent
    pub fn qualified(&self, default_alias: &str) -> Self {
        Self {
            queue: self.queue.clone(),
            alias: Some(
                self.alias
                    .clone()
                    .unwrap_or_else(|| default_alias.to_string()),
            ),
        }
    }
}

impl fmt::Display for QueueAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.alias {
            Some(alias) => write!(f, "{}{}{}", self.queue, ALIAS_SEPARATOR, alias),
            None => write!(f, "{}", self.queue),
        }
    }
}

/// Connection strings are `key=value` pairs separated by semicolons. Neither
/// character is legal in a queue name or alias.
fn looks_like_connection_string(value: &str) -> bool {
    value.contains('=') || value.contains(';')
}

fn is_valid_alias(alias: &str) -> bool {
    !alias.is_empty()
        && alias
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '.' || c == '_' || c == '-')
}

fn redact(queue_part: &str) -> String {
    if looks_like_connection_string(queue_part) {
        "<redacted>".to_string()
    } else {
        format!("{}{}<redacted>", queue_part, ALIAS_SEPARATOR)
    }
}

// ============================================================================
// Account routing
// ============================================================================

/// A destination resolved to the client that talks to it
#[derive(Clone)]
pub struct ResolvedQueue {
    /// Alias the destination resolved under (never absent)
    pub address: QueueAddress,
    pub client: Arc<dyn QueueClient>,
}

/// Alias to storage account mapping
#[derive(Clone)]
pub struct AccountRouter {
    default_alias: String,
    accounts: HashMap<String, Arc<dyn QueueService>>,
}

impl AccountRouter {
    /// Create router whose default alias points at the endpoint's own account
    pub fn new(default_alias: impl Into<String>, default_account: Arc<dyn QueueService>) -> Self {
        let default_alias = default_alias.into();
        let mut accounts = HashMap::new();
        accounts.insert(default_alias.clone(), default_account);
        Self {
            default_alias,
            accounts,
        }
    }

    /// Register another account under a unique alias
    pub fn add_account(
        &mut self,
        alias: impl Into<String>,
        account: Arc<dyn QueueService>,
    ) -> Result<(), ConfigurationError> {
        let alias = alias.into();
        if !is_valid_alias(&alias) {
            return Err(ConfigurationError::Invalid {
                message: format!("'{}' is not a valid account alias", alias),
            });
        }
        if self.accounts.contains_key(&alias) {
            return Err(ConfigurationError::DuplicateAlias { alias });
        }
        self.accounts.insert(alias, account);
        Ok(())
    }

    pub fn default_alias(&self) -> &str {
        &self.default_alias
    }

    /// Resolve an address to a queue client. Unmapped aliases are an error.
    pub fn resolve(&self, address: &QueueAddress) -> Result<ResolvedQueue, ConfigurationError> {
        let qualified = address.qualified(&self.default_alias);
        let alias = qualified.alias().unwrap_or(&self.default_alias);

        let account = self
            .accounts
            .get(alias)
            .ok_or_else(|| ConfigurationError::UnmappedAlias {
                alias: alias.to_string(),
            })?;

        Ok(ResolvedQueue {
            client: account.queue_client(qualified.queue()),
            address: qualified,
        })
    }

    /// Rewrite an address string to `queue@alias`, validating the alias
    pub fn to_alias_form(&self, address: &str) -> Result<String, ConfigurationError> {
        let parsed = QueueAddress::parse(address)?;
        let resolved = self.resolve(&parsed)?;
        Ok(resolved.address.to_string())
    }
}

#[cfg(test)]
#[path = "addressing_tests.rs"]
mod tests;
