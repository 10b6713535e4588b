//! Dispatch mode policy

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use super::connectivity::{Connectivity, Transport};

/// When the dispatcher is allowed to use the network
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DispatchMode {
    /// Dispatch on any connection (default)
    #[default]
    Always,
    /// Dispatch only on wifi
    WifiOnly,
    /// Behave as offline regardless of connectivity.
    ///
    /// Used to keep records on disk while the process may be going down
    /// (crash reporting). Never persisted; a fresh process starts from config.
    #[serde(skip)]
    TransientOffline,
}

impl DispatchMode {
    /// Whether records may be sent right now under this mode
    pub fn permits(self, connectivity: &dyn Connectivity) -> bool {
        if !connectivity.is_connected() {
            return false;
        }
        match self {
            DispatchMode::Always => true,
            DispatchMode::WifiOnly => connectivity.transport() == Transport::Wifi,
            DispatchMode::TransientOffline => false,
        }
    }

    fn as_str(self) -> &'static str {
        match self {
            DispatchMode::Always => "always",
            DispatchMode::WifiOnly => "wifi_only",
            DispatchMode::TransientOffline => "transient_offline",
        }
    }
}

impl fmt::Display for DispatchMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DispatchMode {
    type Err = String;

    /// Parses persisted mode names; the transient mode has none.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "always" => Ok(DispatchMode::Always),
            "wifi_only" => Ok(DispatchMode::WifiOnly),
            other => Err(format!("unknown dispatch mode '{}'", other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::ManualConnectivity;

    #[test]
    fn test_always_needs_only_a_connection() {
        let connectivity = ManualConnectivity::new(true, Transport::Cellular);
        assert!(DispatchMode::Always.permits(&connectivity));

        connectivity.set_connected(false);
        assert!(!DispatchMode::Always.permits(&connectivity));
    }

    #[test]
    fn test_wifi_only_rejects_cellular() {
        let connectivity = ManualConnectivity::new(true, Transport::Cellular);
        assert!(!DispatchMode::WifiOnly.permits(&connectivity));

        connectivity.set_transport(Transport::Wifi);
        assert!(DispatchMode::WifiOnly.permits(&connectivity));
    }

    #[test]
    fn test_transient_offline_overrides_connectivity() {
        let connectivity = ManualConnectivity::new(true, Transport::Wifi);
        assert!(!DispatchMode::TransientOffline.permits(&connectivity));
    }

    #[test]
    fn test_mode_names() {
        assert_eq!("wifi_only".parse::<DispatchMode>(), Ok(DispatchMode::WifiOnly));
        assert_eq!(DispatchMode::Always.to_string(), "always");
        assert!("transient_offline".parse::<DispatchMode>().is_err());
    }
}
