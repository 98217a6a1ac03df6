//! Initialization info strings and options.

use std::sync::OnceLock;

use regex::Regex;

use crate::error::{NaError, Result};

/// Parsed form of an info string `[<class>+]<protocol>[://[<host>]]`.
///
/// Examples: `sm://`, `na+sm://test`, `ofi+tcp://eth0:9999`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NaInfo {
    /// Explicit NA class name, e.g. `na` in `na+sm://`.
    pub class_name: Option<String>,
    /// Protocol name, e.g. `sm`.
    pub protocol_name: String,
    /// Host/endpoint component following `://`, if any.
    pub host_name: Option<String>,
}

fn info_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^(?:([A-Za-z0-9_]+)\+)?([A-Za-z0-9_]+)(?:://(.*))?$")
            .expect("invalid info-string pattern")
    })
}

impl NaInfo {
    /// Parse an info string.
    ///
    /// Rejects empty protocols, a host component without `://`, and `/`
    /// inside endpoint names.
    pub fn parse(info_string: &str) -> Result<Self> {
        let caps = info_regex()
            .captures(info_string)
            .ok_or(NaError::InvalidArg)?;

        let class_name = caps.get(1).map(|m| m.as_str().to_owned());
        let protocol_name = caps.get(2).map(|m| m.as_str().to_owned()).unwrap_or_default();
        if protocol_name.is_empty() {
            return Err(NaError::InvalidArg);
        }

        let host_name = match caps.get(3).map(|m| m.as_str()) {
            Some("") | None => None,
            Some(host) => {
                if host.contains('/') {
                    return Err(NaError::InvalidArg);
                }
                Some(host.to_owned())
            }
        };

        Ok(Self {
            class_name,
            protocol_name,
            host_name,
        })
    }
}

/// Progress-mode flag: never create wakeable file descriptors.
pub const NA_NO_BLOCK: u32 = 1;

/// Address-format hint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AddrFormat {
    #[default]
    Unspec,
    Ipv4,
    Ipv6,
    Native,
}

/// Optional initialization parameters, all defaulted.
#[derive(Debug, Clone, Default)]
pub struct InitInfo {
    /// Preferred IP subnet for plugins that bind to an interface.
    pub ip_subnet: Option<String>,
    /// Plugin-specific credential; the shared-memory plugin ignores it.
    pub auth_key: Option<String>,
    /// Override the default maximum unexpected-message size.
    pub max_unexpected_size: Option<usize>,
    /// Override the default maximum expected-message size.
    pub max_expected_size: Option<usize>,
    /// Progress-mode flags, see [`NA_NO_BLOCK`].
    pub progress_mode: u32,
    /// Address-format hint.
    pub addr_format: AddrFormat,
    /// Maximum number of contexts created on the class (0 = plugin default).
    pub max_contexts: u8,
    /// Reserved.
    pub thread_mode: u32,
    /// Request GPU/device-memory registration support.
    pub request_mem_device: bool,
    /// Traffic-class (QoS) hint.
    pub traffic_class: Option<String>,
}

/// One transport enumerated by [`crate::protocol_info_get`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProtocolInfo {
    pub class_name: String,
    pub protocol_name: String,
    pub device_name: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_plain_protocol() {
        let info = NaInfo::parse("sm").unwrap();
        assert_eq!(info.class_name, None);
        assert_eq!(info.protocol_name, "sm");
        assert_eq!(info.host_name, None);

        let info = NaInfo::parse("sm://").unwrap();
        assert_eq!(info.protocol_name, "sm");
        assert_eq!(info.host_name, None);
    }

    #[test]
    fn test_parse_class_and_host() {
        let info = NaInfo::parse("na+sm://test").unwrap();
        assert_eq!(info.class_name.as_deref(), Some("na"));
        assert_eq!(info.protocol_name, "sm");
        assert_eq!(info.host_name.as_deref(), Some("test"));

        let info = NaInfo::parse("ofi+tcp://eth0:9999").unwrap();
        assert_eq!(info.class_name.as_deref(), Some("ofi"));
        assert_eq!(info.protocol_name, "tcp");
        assert_eq!(info.host_name.as_deref(), Some("eth0:9999"));
    }

    #[test]
    fn test_parse_rejects() {
        assert_eq!(NaInfo::parse(""), Err(NaError::InvalidArg));
        assert_eq!(NaInfo::parse("+sm://"), Err(NaError::InvalidArg));
        // Host component without the :// separator.
        assert_eq!(NaInfo::parse("sm:host"), Err(NaError::InvalidArg));
        // Endpoint names may not contain '/'.
        assert_eq!(NaInfo::parse("sm://a/b"), Err(NaError::InvalidArg));
    }
}
