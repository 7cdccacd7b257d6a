//! Host settings and storage connection resolution.
//!
//! Settings are flat key/value pairs. Keys are case-insensitive, and `__` is equivalent to the `:`
//! section separator so that nested settings can be supplied as environment variables.

use std::{collections::HashMap, str::FromStr};

/// Prefix applied to connection names, e.g. `Storage` is read from `AzureWebJobsStorage`.
pub const CONNECTION_PREFIX: &str = "AzureWebJobs";

/// The connection used for host state unless configured otherwise.
pub const DEFAULT_STORAGE_CONNECTION: &str = "Storage";

/// Section holding connection strings, e.g. `ConnectionStrings:AzureWebJobsStorage`.
pub const CONNECTION_STRINGS_SECTION: &str = "ConnectionStrings";

/// Replaces credentials in messages.
pub const REDACTED: &str = "[Hidden Credential]";

/// Markers which begin a secret. Everything from the marker up to the next terminator is redacted.
const SECRET_MARKERS: &[&str] = &[
    "defaultendpointsprotocol=",
    "accountkey=",
    "sharedaccesssignature=",
    "sharedaccesskey=",
    "sig=",
    "password=",
    "pwd=",
    "data source=",
    "server=",
];

const SECRET_TERMINATORS: &[char] = &['<', '"', '\''];

/// Invalid or missing configuration. Values which may contain secrets are redacted.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    /// A named storage connection has no value.
    #[error(
        "Storage account connection string '{name}' does not exist. Make sure that it is a defined App Setting."
    )]
    MissingConnection {
        /// The (redacted) setting name that was looked up.
        name: String,
    },

    /// A setting couldn't be parsed or is out of range.
    #[error("invalid value for setting '{key}': {reason}")]
    InvalidValue {
        #[allow(missing_docs)]
        key: String,
        #[allow(missing_docs)]
        reason: String,
    },
}

/// Case-insensitive key/value settings.
#[derive(Debug, Clone, Default)]
pub struct Settings {
    values: HashMap<String, String>,
}

impl Settings {
    /// Settings from the process environment.
    pub fn from_env() -> Self {
        std::env::vars().collect()
    }

    /// The value for `key`, if present and non-empty.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.values
            .get(&normalize_key(key))
            .map(String::as_str)
            .filter(|v| !v.trim().is_empty())
    }

    /// Set a value, replacing any existing one.
    pub fn set(&mut self, key: impl AsRef<str>, value: impl Into<String>) {
        self.values
            .insert(normalize_key(key.as_ref()), value.into());
    }

    /// Parse the value for `key`, if present.
    pub fn parse<T>(&self, key: &str) -> Result<Option<T>, ConfigError>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        self.get(key)
            .map(|raw| {
                raw.trim().parse().map_err(|e| ConfigError::InvalidValue {
                    key: key.to_string(),
                    reason: sanitize(&format!("{e} (got '{raw}')")),
                })
            })
            .transpose()
    }

    /// The connection string for a connection name.
    ///
    /// Looks in order for `ConnectionStrings:AzureWebJobs<name>`, `AzureWebJobs<name>`,
    /// `ConnectionStrings:<name>` and `<name>`. The prefix isn't doubled if `name` already has it.
    pub fn connection_string(&self, name: &str) -> Option<&str> {
        let prefixed = prefixed_connection_name(name);

        for n in [prefixed.as_str(), name] {
            for key in [format!("{CONNECTION_STRINGS_SECTION}:{n}"), n.to_string()] {
                if let Some(value) = self.get(&key) {
                    return Some(value);
                }
            }
        }
        None
    }

    /// The storage connection string for `name`, failing if it isn't set.
    ///
    /// If `name` is itself a connection string (a common mistake), it is redacted from the error.
    pub fn require_storage_connection(&self, name: &str) -> Result<&str, ConfigError> {
        self.connection_string(name)
            .ok_or_else(|| ConfigError::MissingConnection {
                name: sanitize(&prefixed_connection_name(name)),
            })
    }

    /// The default storage connection string, or `None` if storage isn't configured.
    ///
    /// Running without storage is supported, so absence isn't an error.
    pub fn storage_connection(&self) -> Option<&str> {
        self.connection_string(DEFAULT_STORAGE_CONNECTION)
    }
}

impl<K: AsRef<str>, V: Into<String>> FromIterator<(K, V)> for Settings {
    fn from_iter<T: IntoIterator<Item = (K, V)>>(iter: T) -> Self {
        let mut settings = Settings::default();
        for (k, v) in iter {
            settings.set(k, v);
        }
        settings
    }
}

fn normalize_key(key: &str) -> String {
    key.replace("__", ":").to_ascii_lowercase()
}

fn prefixed_connection_name(name: &str) -> String {
    let has_prefix = name
        .get(..CONNECTION_PREFIX.len())
        .is_some_and(|p| p.eq_ignore_ascii_case(CONNECTION_PREFIX));

    if has_prefix {
        name.to_string()
    } else {
        format!("{CONNECTION_PREFIX}{name}")
    }
}

/// Redact anything that looks like a credential.
///
/// Each secret runs from a marker such as `AccountKey=` up to the next `<`, `"` or `'`, or the end
/// of the input.
pub fn sanitize(input: &str) -> String {
    let lower = input.to_ascii_lowercase();
    let mut out = String::with_capacity(input.len());
    let mut pos = 0;

    while let Some(start) = SECRET_MARKERS
        .iter()
        .filter_map(|marker| lower[pos..].find(marker).map(|i| pos + i))
        .min()
    {
        let end = input[start..]
            .find(SECRET_TERMINATORS)
            .map_or(input.len(), |i| start + i);

        out.push_str(&input[pos..start]);
        out.push_str(REDACTED);
        pos = end;
    }

    out.push_str(&input[pos..]);
    out
}
