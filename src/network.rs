//! Network policy monitor.
//!
//! Holds the current connectivity class and the Wi-Fi-only preference in a
//! `watch` channel. The host platform feeds connectivity changes in through
//! [`NetworkMonitor::set_connectivity`]; the scheduler subscribes and pauses
//! or re-admits transfers when [`NetworkState::can_transfer`] flips.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::info;

/// Connectivity class reported by the platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Connectivity {
    Wifi,
    Cellular,
    None,
}

impl Connectivity {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Wifi => "wifi",
            Self::Cellular => "cellular",
            Self::None => "none",
        }
    }
}

impl fmt::Display for Connectivity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Connectivity {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "wifi" => Ok(Self::Wifi),
            "cellular" => Ok(Self::Cellular),
            "none" => Ok(Self::None),
            other => Err(format!("invalid connectivity: {other}")),
        }
    }
}

/// Snapshot of connectivity and policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NetworkState {
    pub connectivity: Connectivity,
    pub wifi_only: bool,
}

impl NetworkState {
    /// Wi-Fi always qualifies; cellular only without the Wi-Fi-only policy.
    #[must_use]
    pub fn can_transfer(&self) -> bool {
        match self.connectivity {
            Connectivity::Wifi => true,
            Connectivity::Cellular => !self.wifi_only,
            Connectivity::None => false,
        }
    }
}

/// Shared connectivity/policy state.
///
/// Cloning shares the same underlying channel.
#[derive(Debug, Clone)]
pub struct NetworkMonitor {
    state: std::sync::Arc<watch::Sender<NetworkState>>,
}

impl NetworkMonitor {
    #[must_use]
    pub fn new(connectivity: Connectivity, wifi_only: bool) -> Self {
        let (tx, _) = watch::channel(NetworkState {
            connectivity,
            wifi_only,
        });
        Self {
            state: std::sync::Arc::new(tx),
        }
    }

    #[must_use]
    pub fn state(&self) -> NetworkState {
        *self.state.borrow()
    }

    #[must_use]
    pub fn can_transfer_now(&self) -> bool {
        self.state().can_transfer()
    }

    /// Records a platform connectivity change.
    pub fn set_connectivity(&self, connectivity: Connectivity) {
        self.update(|state| state.connectivity = connectivity);
    }

    /// Changes the Wi-Fi-only preference.
    pub fn set_wifi_only(&self, wifi_only: bool) {
        self.update(|state| state.wifi_only = wifi_only);
    }

    /// Receiver notified on every change.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<NetworkState> {
        self.state.subscribe()
    }

    fn update(&self, apply: impl FnOnce(&mut NetworkState)) {
        self.state.send_if_modified(|state| {
            let before = *state;
            apply(state);
            if *state == before {
                return false;
            }
            info!(
                connectivity = %state.connectivity,
                wifi_only = state.wifi_only,
                can_transfer = state.can_transfer(),
                "network policy changed"
            );
            true
        });
    }
}

impl Default for NetworkMonitor {
    fn default() -> Self {
        Self::new(Connectivity::Wifi, false)
    }
}
