//! Device-network adapters and the factory that picks one per platform.
//!
//! Adapter endpoints (UDP bind address, network-server address, ...) come
//! from the `[adapters]` section of the configuration, not from the
//! platform record: the platform address is where the gateway negotiates,
//! not where device traffic flows.

pub mod lorawan;
pub mod sixlowpan;

use std::sync::Arc;

use fog_core::{InterfaceType, Platform};
use serde::{Deserialize, Serialize};

use crate::application::interfaces::{AdapterError, AdapterFactory, DeviceAdapter};
use lorawan::{LorawanAdapter, LorawanOptions};
use sixlowpan::{SixlowpanAdapter, SixlowpanOptions};

/// Typed options for every adapter kind.  Unknown keys fail at load time.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AdaptersConfig {
    #[serde(default)]
    pub lorawan: LorawanOptions,
    #[serde(default)]
    pub sixlowpan: SixlowpanOptions,
}

pub struct ConfiguredAdapterFactory {
    config: AdaptersConfig,
}

impl ConfiguredAdapterFactory {
    pub fn new(config: AdaptersConfig) -> Self {
        Self { config }
    }
}

impl AdapterFactory for ConfiguredAdapterFactory {
    fn create(&self, platform: &Platform) -> Result<Arc<dyn DeviceAdapter>, AdapterError> {
        let adapter: Arc<dyn DeviceAdapter> = match platform.interface_type {
            InterfaceType::Lorawan => Arc::new(LorawanAdapter::new(self.config.lorawan.clone())),
            InterfaceType::Sixlowpan => Arc::new(SixlowpanAdapter::new(self.config.sixlowpan.clone())),
        };
        Ok(adapter)
    }
}
