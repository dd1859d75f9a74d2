//! Connectivity status types

use serde::Serialize;

/// Which transport classes the network manager reports as active.
///
/// Not mutually exclusive: WiFi and Ethernet are frequently both up.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ConnectivityStatus {
    pub wifi: bool,
    pub gsm: bool,
    pub ethernet: bool,
}

/// Outcome of the loopback / public / archive-server ping sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Reachability {
    pub localhost: bool,
    pub internet: bool,
    pub server: bool,
}

impl Reachability {
    /// Nothing beyond the node answered. Loopback is ignored: it answers
    /// whenever the IP stack is alive and says nothing about the uplink.
    pub fn all_down(&self) -> bool {
        !self.internet && !self.server
    }
}

/// Dominant transport for one delivery attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ConnectivityState {
    Wifi,
    Ethernet,
    Gsm,
    None,
}

impl std::fmt::Display for ConnectivityState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectivityState::Wifi => write!(f, "WIFI"),
            ConnectivityState::Ethernet => write!(f, "ETHERNET"),
            ConnectivityState::Gsm => write!(f, "GSM"),
            ConnectivityState::None => write!(f, "NONE"),
        }
    }
}

/// Delivery policy a transport implies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum DeliveryClass {
    /// WiFi or Ethernet: low-res payload plus high-res file sync
    Full,
    /// Cellular only: low-res payload, never high-res
    Reduced,
}

impl std::fmt::Display for DeliveryClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeliveryClass::Full => write!(f, "full"),
            DeliveryClass::Reduced => write!(f, "reduced"),
        }
    }
}

impl ConnectivityState {
    pub fn delivery_class(self) -> Option<DeliveryClass> {
        match self {
            ConnectivityState::Wifi | ConnectivityState::Ethernet => Some(DeliveryClass::Full),
            ConnectivityState::Gsm => Some(DeliveryClass::Reduced),
            ConnectivityState::None => None,
        }
    }
}

impl ConnectivityStatus {
    /// Pick the best usable transport, preferring WiFi over Ethernet over GSM.
    pub fn state(&self) -> ConnectivityState {
        if self.wifi {
            ConnectivityState::Wifi
        } else if self.ethernet {
            ConnectivityState::Ethernet
        } else if self.gsm {
            ConnectivityState::Gsm
        } else {
            ConnectivityState::None
        }
    }

    /// Ethernet is up but WiFi is not; the link may be local-only.
    pub fn ethernet_only(&self) -> bool {
        self.ethernet && !self.wifi
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_preference() {
        let all = ConnectivityStatus { wifi: true, gsm: true, ethernet: true };
        assert_eq!(all.state(), ConnectivityState::Wifi);

        let eth_gsm = ConnectivityStatus { wifi: false, gsm: true, ethernet: true };
        assert_eq!(eth_gsm.state(), ConnectivityState::Ethernet);
        assert!(eth_gsm.ethernet_only());

        let gsm = ConnectivityStatus { gsm: true, ..Default::default() };
        assert_eq!(gsm.state().delivery_class(), Some(DeliveryClass::Reduced));

        assert_eq!(ConnectivityStatus::default().state(), ConnectivityState::None);
        assert_eq!(ConnectivityState::None.delivery_class(), None);
    }

    #[test]
    fn test_all_down_ignores_loopback() {
        let loopback_only = Reachability { localhost: true, internet: false, server: false };
        assert!(loopback_only.all_down());

        let internet = Reachability { localhost: true, internet: true, server: false };
        assert!(!internet.all_down());
    }
}
