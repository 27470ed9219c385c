// Copyright 2023 The Android Open Source Project
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//      http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Controller wide defaults copied into each new connection.

use crate::packets::hci::{LlFeaturesBits, PhyMask};

/// Smallest number of connection events between the event that carries
/// an instant and the instant itself.
pub const MIN_INSTANT: u16 = 6;

/// Bluetooth Core, Vol 6, Part B, 4.5.10
pub const MIN_DATA_OCTETS: u16 = 27;
pub const MAX_DATA_OCTETS: u16 = 251;
pub const MIN_DATA_TIME: u16 = 328;
pub const MIN_DATA_TIME_CODED: u16 = 2704;
pub const MAX_DATA_TIME: u16 = 17040;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LlVersion {
    pub version: u8,
    pub company_id: u16,
    pub sub_version: u16,
}

/// Periodic advertising sync transfer defaults
/// (HCI LE Set Default PAST Parameters).
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PastParams {
    /// 0: no sync, 1: sync without reports, 2: sync with reports.
    pub mode: u8,
    pub skip: u16,
    pub sync_timeout: u16,
    pub cte_type: u8,
}

/// Selects the counter used in the CCM nonce.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NonceMode {
    PacketCounter,
    EventCounter,
}

#[derive(Clone, Debug)]
pub struct LlConfig {
    pub max_conn: usize,
    pub num_tx_bufs: u16,
    pub num_rx_bufs: u16,
    /// ACL SDUs queued per connection.
    pub max_tx_descriptors: usize,
    pub features: u64,
    pub version: LlVersion,
    pub max_tx_octets: u16,
    pub max_tx_time: u16,
    pub supported_max_tx_octets: u16,
    pub supported_max_tx_time: u16,
    pub supported_max_rx_octets: u16,
    pub supported_max_rx_time: u16,
    /// Local sleep clock accuracy field (0..=7).
    pub sca: u8,
    /// Adjustment applied to the worst case ppm of `sca`.
    pub sca_mod: i8,
    pub past: PastParams,
    pub auth_payload_timeout_ms: u32,
    pub llcp_response_timeout_ms: u32,
    pub phy_symmetric_required: bool,
    pub default_tx_phys: PhyMask,
    pub default_rx_phys: PhyMask,
    pub nonce_mode: NonceMode,
    pub auto_feature_exchange: bool,
    /// Scheduling margin subtracted from the end of each event.
    pub sched_setup_delay_us: u32,
}

impl Default for LlConfig {
    fn default() -> Self {
        let features = [
            LlFeaturesBits::LeEncryption,
            LlFeaturesBits::ConnectionParametersRequestProcedure,
            LlFeaturesBits::ExtendedRejectIndication,
            LlFeaturesBits::PeripheralInitiatedFeaturesExchange,
            LlFeaturesBits::LePing,
            LlFeaturesBits::LeDataPacketLengthExtension,
            LlFeaturesBits::Le2mPhy,
            LlFeaturesBits::LeCodedPhy,
            LlFeaturesBits::ChannelSelectionAlgorithm2,
            LlFeaturesBits::MinimumNumberOfUsedChannelsProcedure,
            LlFeaturesBits::PeriodicAdvertisingSyncTransferSender,
            LlFeaturesBits::PeriodicAdvertisingSyncTransferRecipient,
            LlFeaturesBits::SleepClockAccuracyUpdates,
        ]
        .into_iter()
        .fold(0, |features, bit| features | u64::from(bit));

        LlConfig {
            max_conn: 4,
            num_tx_bufs: 8,
            num_rx_bufs: 8,
            max_tx_descriptors: 8,
            features,
            // Bluetooth Core 5.3
            version: LlVersion { version: 0x0c, company_id: 0xffff, sub_version: 0x0000 },
            max_tx_octets: MIN_DATA_OCTETS,
            max_tx_time: MIN_DATA_TIME,
            supported_max_tx_octets: MAX_DATA_OCTETS,
            supported_max_tx_time: MAX_DATA_TIME,
            supported_max_rx_octets: MAX_DATA_OCTETS,
            supported_max_rx_time: MAX_DATA_TIME,
            sca: 7,
            sca_mod: 0,
            past: PastParams { mode: 1, ..PastParams::default() },
            auth_payload_timeout_ms: 30_000,
            llcp_response_timeout_ms: 40_000,
            phy_symmetric_required: false,
            default_tx_phys: PhyMask::ALL,
            default_rx_phys: PhyMask::ALL,
            nonce_mode: NonceMode::PacketCounter,
            auto_feature_exchange: true,
            sched_setup_delay_us: 150,
        }
    }
}

impl LlConfig {
    pub fn supports(&self, bit: LlFeaturesBits) -> bool {
        self.features & u64::from(bit) != 0
    }
}

/// Worst case ppm of a sleep clock accuracy field,
/// Bluetooth Core, Vol 6, Part B, 2.3.3.1.
pub fn sca_ppm(sca: u8) -> u32 {
    match sca {
        0 => 500,
        1 => 250,
        2 => 150,
        3 => 100,
        4 => 75,
        5 => 50,
        6 => 30,
        _ => 20,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_features_include_core_procedures() {
        let config = LlConfig::default();
        assert!(config.supports(LlFeaturesBits::LeEncryption));
        assert!(config.supports(LlFeaturesBits::ChannelSelectionAlgorithm2));
        assert_eq!(config.features & 0xff, 0x3f);
    }

    #[test]
    fn sca_field_to_ppm() {
        assert_eq!(sca_ppm(0), 500);
        assert_eq!(sca_ppm(7), 20);
    }
}
