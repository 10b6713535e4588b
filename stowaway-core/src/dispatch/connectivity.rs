//! Network reachability

use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};

/// Transport of the active network
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transport {
    None,
    Cellular,
    Wifi,
}

impl Transport {
    fn to_u8(self) -> u8 {
        match self {
            Transport::None => 0,
            Transport::Cellular => 1,
            Transport::Wifi => 2,
        }
    }

    fn from_u8(raw: u8) -> Self {
        match raw {
            1 => Transport::Cellular,
            2 => Transport::Wifi,
            _ => Transport::None,
        }
    }
}

/// Source of reachability information for the dispatcher.
///
/// Implementations must be cheap to query; the dispatcher asks before every
/// cycle and after every delivered packet.
pub trait Connectivity: Send + Sync {
    /// Whether any network is usable
    fn is_connected(&self) -> bool;

    /// Transport of the active network
    fn transport(&self) -> Transport;
}

/// Connectivity driven by the host application.
///
/// Platforms that observe network changes push them in through the setters.
/// Defaults to connected over wifi, which is the right answer for desktop and
/// server processes.
#[derive(Debug)]
pub struct ManualConnectivity {
    connected: AtomicBool,
    transport: AtomicU8,
}

impl ManualConnectivity {
    pub fn new(connected: bool, transport: Transport) -> Self {
        Self {
            connected: AtomicBool::new(connected),
            transport: AtomicU8::new(transport.to_u8()),
        }
    }

    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }

    pub fn set_transport(&self, transport: Transport) {
        self.transport.store(transport.to_u8(), Ordering::SeqCst);
    }
}

impl Default for ManualConnectivity {
    fn default() -> Self {
        Self::new(true, Transport::Wifi)
    }
}

impl Connectivity for ManualConnectivity {
    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn transport(&self) -> Transport {
        if !self.is_connected() {
            return Transport::None;
        }
        Transport::from_u8(self.transport.load(Ordering::SeqCst))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_connected_wifi() {
        let connectivity = ManualConnectivity::default();
        assert!(connectivity.is_connected());
        assert_eq!(connectivity.transport(), Transport::Wifi);
    }

    #[test]
    fn test_disconnected_reports_no_transport() {
        let connectivity = ManualConnectivity::new(true, Transport::Cellular);
        connectivity.set_connected(false);
        assert_eq!(connectivity.transport(), Transport::None);

        connectivity.set_connected(true);
        assert_eq!(connectivity.transport(), Transport::Cellular);
    }
}
