// Shared identifiers and small helpers used across crates.
use std::time::{SystemTime, UNIX_EPOCH};

pub type Result<T> = std::result::Result<T, Error>;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("invalid id: {0}")]
    InvalidId(String),
    #[error("invalid channel name: {0}")]
    InvalidChannel(String),
}

pub mod ids {
    // Strongly typed IDs to avoid mixing namespaces at compile time.
    use super::{Error, Result};
    use serde::{Deserialize, Serialize};
    use std::fmt;
    use std::str::FromStr;
    use uuid::Uuid;

    macro_rules! id_type {
        ($name:ident) => {
            #[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
            pub struct $name(Uuid);

            impl $name {
                // Generate a new random ID for this namespace.
                pub fn new() -> Self {
                    Self(Uuid::new_v4())
                }

                // Expose the underlying UUID for interoperability.
                pub fn as_uuid(&self) -> Uuid {
                    self.0
                }
            }

            impl Default for $name {
                fn default() -> Self {
                    Self::new()
                }
            }

            impl fmt::Display for $name {
                fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                    write!(f, "{}", self.0)
                }
            }

            impl FromStr for $name {
                type Err = Error;

                fn from_str(input: &str) -> Result<Self> {
                    // Preserve the original input for clearer error messages.
                    let uuid =
                        Uuid::parse_str(input).map_err(|_| Error::InvalidId(input.into()))?;
                    Ok(Self(uuid))
                }
            }
        };
    }

    id_type!(SessionId);
}

pub mod channels {
    //! Well-known metric channel names published by the agent.

    pub const SYSTEM_STATS: &str = "system.stats";
    pub const DOCKER_EVENTS: &str = "docker.events";
    pub const STORAGE_STATUS: &str = "storage.status";
    pub const TEMPERATURE_ALERT: &str = "temperature.alert";
    pub const RESOURCE_ALERT: &str = "resource.alert";
    pub const INFRASTRUCTURE_STATUS: &str = "infrastructure.status";
}

const MAX_CHANNEL_LEN: usize = 128;

/// Validates a channel name: dot-separated lowercase segments, each made of
/// `a-z`, `0-9`, `_` or `-`.
///
/// ```
/// use skiff_common::validate_channel;
///
/// assert!(validate_channel("system.stats").is_ok());
/// assert!(validate_channel("Bad.Channel").is_err());
/// ```
pub fn validate_channel(name: &str) -> Result<()> {
    if name.is_empty() || name.len() > MAX_CHANNEL_LEN {
        return Err(Error::InvalidChannel(name.into()));
    }
    for segment in name.split('.') {
        if segment.is_empty() {
            return Err(Error::InvalidChannel(name.into()));
        }
        let ok = segment
            .bytes()
            .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'_' || b == b'-');
        if !ok {
            return Err(Error::InvalidChannel(name.into()));
        }
    }
    Ok(())
}

// Milliseconds since the Unix epoch, used for wire timestamps.
pub fn unix_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis() as i64)
        .unwrap_or(0)
}
