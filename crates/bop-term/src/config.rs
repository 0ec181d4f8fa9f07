use serde::{Deserialize, Serialize};
use std::fmt::{self, Display};
use std::path::PathBuf;

use crate::descriptor::{TERM_MAX_LENGTH, TERM_MIN_LENGTH, check_mtu_length, check_term_length};
use crate::error::{TermError, TermResult};

/// Default term capacity (16 MiB).
///
/// Three terms are mapped per publication, so this is a third of the mapped
/// footprint of each publication.
const DEFAULT_TERM_BUFFER_LENGTH: usize = 16 * 1024 * 1024;

/// Default maximum frame length, header included.
const DEFAULT_MTU_LENGTH: usize = 4096;

/// Default pause between cleaner duty cycles that found no work (milliseconds).
const DEFAULT_CLEANER_IDLE_MS: u64 = 1;

const ENV_TERM_BUFFER_LENGTH: &str = "BOP_TERM_BUFFER_LENGTH";
const ENV_MTU_LENGTH: &str = "BOP_TERM_MTU_LENGTH";
const ENV_TERM_DIR: &str = "BOP_TERM_DIR";

/// Identity handed out by the client conductor for each publication registration.
///
/// # Example
///
/// ```rust
/// use bop_term::RegistrationId;
///
/// let id = RegistrationId::new(41);
/// assert_eq!(id.next().as_i64(), 42);
/// ```
#[derive(
    Copy, Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct RegistrationId(pub i64);

impl RegistrationId {
    #[inline]
    pub const fn new(raw: i64) -> Self {
        Self(raw)
    }

    #[inline]
    pub const fn as_i64(self) -> i64 {
        self.0
    }

    #[inline]
    pub const fn next(self) -> Self {
        Self(self.0 + 1)
    }
}

impl From<i64> for RegistrationId {
    #[inline]
    fn from(value: i64) -> Self {
        Self(value)
    }
}

impl Display for RegistrationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        Display::fmt(&self.0, f)
    }
}

/// Configuration shared by every publication a conductor creates.
///
/// Unlike sizing hints elsewhere, term lengths are never rounded: a term length
/// that is not a power of two is a setup error reported by [`validate`].
///
/// [`validate`]: PublicationConfig::validate
///
/// # Example
///
/// ```rust
/// use bop_term::PublicationConfig;
///
/// let config = PublicationConfig {
///     term_buffer_length: 64 * 1024,
///     mtu_length: 1408,
///     initial_term_id: Some(7),
///     ..PublicationConfig::default()
/// };
/// config.validate().expect("valid config");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PublicationConfig {
    /// Capacity of each of the three terms (bytes). Must be a power of two.
    pub term_buffer_length: usize,

    /// Maximum frame length including the data header.
    ///
    /// Messages longer than `mtu_length - DATA_HEADER_LENGTH` are fragmented on
    /// offer; claims longer than that are rejected.
    pub mtu_length: usize,

    /// Term id of the first term. Chosen at random when unset.
    pub initial_term_id: Option<i32>,

    /// Directory holding file-backed term buffers. Anonymous mappings when unset.
    pub root_dir: Option<PathBuf>,

    /// Remove term files when their publication is released.
    pub unlink_on_release: bool,

    /// Pause between cleaner duty cycles that found nothing to clean.
    pub cleaner_idle_ms: u64,
}

impl Default for PublicationConfig {
    fn default() -> Self {
        Self {
            term_buffer_length: DEFAULT_TERM_BUFFER_LENGTH,
            mtu_length: DEFAULT_MTU_LENGTH,
            initial_term_id: None,
            root_dir: None,
            unlink_on_release: true,
            cleaner_idle_ms: DEFAULT_CLEANER_IDLE_MS,
        }
    }
}

impl PublicationConfig {
    /// Validates term and MTU sizing.
    pub fn validate(&self) -> TermResult<()> {
        check_term_length(self.term_buffer_length)?;
        check_mtu_length(self.mtu_length, self.term_buffer_length)?;
        Ok(())
    }

    /// Applies `BOP_TERM_BUFFER_LENGTH`, `BOP_TERM_MTU_LENGTH` and `BOP_TERM_DIR`.
    ///
    /// Unparseable numeric values are reported rather than ignored.
    pub fn with_env_overrides(mut self) -> TermResult<Self> {
        if let Some(value) = env_value(ENV_TERM_BUFFER_LENGTH) {
            self.term_buffer_length = parse_length(ENV_TERM_BUFFER_LENGTH, &value)?;
        }
        if let Some(value) = env_value(ENV_MTU_LENGTH) {
            self.mtu_length = parse_length(ENV_MTU_LENGTH, &value)?;
        }
        if let Some(value) = env_value(ENV_TERM_DIR) {
            self.root_dir = Some(PathBuf::from(value));
        }
        Ok(self)
    }
}

impl Display for PublicationConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "PublicationConfig(term_buffer_length={}, mtu_length={}, initial_term_id={:?}, root_dir={:?}, unlink_on_release={}, cleaner_idle_ms={})",
            self.term_buffer_length,
            self.mtu_length,
            self.initial_term_id,
            self.root_dir,
            self.unlink_on_release,
            self.cleaner_idle_ms
        )
    }
}

fn env_value(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn parse_length(key: &str, value: &str) -> TermResult<usize> {
    value.parse::<usize>().map_err(|err| {
        TermError::invalid_config(format!(
            "{key}={value:?} is not a length in [{TERM_MIN_LENGTH}, {TERM_MAX_LENGTH}]: {err}"
        ))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let cfg = PublicationConfig::default();
        assert!(cfg.term_buffer_length.is_power_of_two());
        assert!(cfg.validate().is_ok());
        assert!(cfg.root_dir.is_none());
        assert!(cfg.unlink_on_release);
    }

    #[test]
    fn validate_rejects_non_power_of_two_terms() {
        let cfg = PublicationConfig {
            term_buffer_length: 100_000,
            ..PublicationConfig::default()
        };
        assert!(matches!(cfg.validate(), Err(TermError::InvalidConfig(_))));
    }

    #[test]
    fn validate_rejects_mtu_larger_than_max_message() {
        let cfg = PublicationConfig {
            term_buffer_length: 64 * 1024,
            mtu_length: 64 * 1024,
            ..PublicationConfig::default()
        };
        assert!(matches!(
            cfg.validate(),
            Err(TermError::InvalidConfig(msg)) if msg.contains("mtu")
        ));
    }

    #[test]
    fn serde_round_trip() {
        let cfg = PublicationConfig {
            initial_term_id: Some(-5),
            root_dir: Some(PathBuf::from("/tmp/terms")),
            ..PublicationConfig::default()
        };
        let json = serde_json::to_string(&cfg).expect("serialize");
        let decoded: PublicationConfig = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(cfg, decoded);
    }

    #[test]
    fn serde_fills_missing_fields_with_defaults() {
        let decoded: PublicationConfig =
            serde_json::from_str(r#"{"term_buffer_length":65536}"#).expect("deserialize");
        assert_eq!(decoded.term_buffer_length, 65_536);
        assert_eq!(decoded.mtu_length, DEFAULT_MTU_LENGTH);
    }

    #[test]
    fn parse_length_reports_bad_values() {
        assert_eq!(parse_length(ENV_MTU_LENGTH, "1408").expect("parse"), 1408);
        let err = parse_length(ENV_MTU_LENGTH, "lots").expect_err("not a number");
        assert!(matches!(err, TermError::InvalidConfig(msg) if msg.contains(ENV_MTU_LENGTH)));
    }

    #[test]
    fn registration_id_next() {
        let id = RegistrationId::new(41);
        assert_eq!(RegistrationId::new(42), id.next());
        assert_eq!(id.to_string(), "41");
    }
}
