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

use log::{debug, info};

use crate::config::{self, LlConfig, MIN_DATA_TIME, MIN_DATA_TIME_CODED, MIN_INSTANT};
use crate::llcp::arq::{Arq, TxLimits};
use crate::llcp::chan::{Algorithm, ChannelMap, ChannelSelection};
use crate::llcp::isr::RadioOp;
use crate::llcp::procedure::Llcp;
use crate::packets::hci::{self, ErrorCode, LlFeaturesBits, Phy, PhyMask, Role};
use crate::packets::llcp::{ConnectionUpdateInd, Length, LlcpPacket, PhyUpdateInd, VersionInd};

/// Generation checked connection handle.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ConnId {
    pub index: u16,
    pub generation: u16,
}

impl ConnId {
    /// Host facing connection handle.
    pub fn handle(self) -> u16 {
        self.index
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnState {
    Initialized,
    EstablishedStartup,
    EstablishedReady,
    Terminating,
}

/// Connection parameters requested by a host or a peer,
/// in the units of the HCI commands.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ConnSpec {
    /// 1.25 ms units.
    pub interval_min: u16,
    pub interval_max: u16,
    pub latency: u16,
    /// 10 ms units.
    pub timeout: u16,
    /// 0.625 ms units.
    pub min_ce_len: u16,
    pub max_ce_len: u16,
}

impl ConnSpec {
    pub fn is_valid(&self) -> bool {
        let interval = 6..=3200;
        interval.contains(&self.interval_min)
            && interval.contains(&self.interval_max)
            && self.interval_min <= self.interval_max
            && self.latency <= 499
            && (10..=3200).contains(&self.timeout)
            && supervision_timeout_is_valid(self.interval_min, self.latency, self.timeout)
    }

    /// Largest interval of the range the supervision timeout allows.
    pub fn interval(&self) -> u16 {
        (self.interval_min..=self.interval_max)
            .rev()
            .find(|&interval| supervision_timeout_is_valid(interval, self.latency, self.timeout))
            .unwrap_or(self.interval_min)
    }
}

/// Bluetooth Core, Vol 6, Part B, 4.5.2: the supervision timeout must
/// be larger than (1 + latency) * interval * 2.
pub fn supervision_timeout_is_valid(interval: u16, latency: u16, timeout: u16) -> bool {
    let timeout_us = timeout as u64 * 10_000;
    let limit_us = (1 + latency as u64) * interval as u64 * 1250 * 2;
    timeout_us > limit_us
}

/// Parameters of the CONNECT_IND that created the connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ConnectionParams {
    pub access_address: u32,
    pub crc_init: u32,
    pub win_size: u8,
    pub win_offset: u16,
    pub interval: u16,
    pub latency: u16,
    pub timeout: u16,
    pub channel_map: u64,
    pub hop_increment: u8,
    /// SCA field sent by the central.
    pub sca: u8,
    pub csa2: bool,
}

/// Connection event timing. Intervals in 1.25 ms units, timeout in
/// 10 ms units, times in microseconds of the radio clock.
#[derive(Clone, Copy, Debug, Default)]
pub struct Timing {
    pub interval: u16,
    pub latency: u16,
    pub timeout: u16,
    pub event_counter: u16,
    /// Nominal anchor point of event `event_counter`.
    pub anchor_us: u32,
    /// Peripheral: anchor point of the last synchronization.
    pub last_sync_us: u32,
    /// Peripheral: combined clock inaccuracy in ppm.
    pub sca_ppm: u32,
    pub window_widening_us: u32,
    /// Extra receive window after establishment or an update.
    pub tx_window_us: u32,
    /// Last time a packet was received.
    pub last_rx_us: u32,
    /// Events left before establishment fails.
    pub establishment_events: u16,
    /// Longest duration of the scheduled event.
    pub ce_max_us: u32,
    /// The peer acknowledged one of our packets since establishment.
    pub tx_acked: bool,
}

impl Timing {
    pub fn interval_us(&self) -> u32 {
        self.interval as u32 * 1250
    }

    pub fn timeout_us(&self) -> u32 {
        self.timeout as u32 * 10_000
    }

    pub fn supervision_deadline_us(&self) -> u32 {
        self.last_rx_us.wrapping_add(self.timeout_us())
    }
}

/// Local and effective data channel PDU limits.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DataLength {
    pub local_max_tx_octets: u16,
    pub local_max_tx_time: u16,
    pub local_max_rx_octets: u16,
    pub local_max_rx_time: u16,
    pub peer: Length,
    pub eff_max_tx_octets: u16,
    pub eff_max_tx_time: u16,
    pub eff_max_rx_octets: u16,
    pub eff_max_rx_time: u16,
}

impl DataLength {
    fn new(config: &LlConfig) -> Self {
        let default = config::MIN_DATA_OCTETS;
        DataLength {
            local_max_tx_octets: config.max_tx_octets,
            local_max_tx_time: config.max_tx_time,
            local_max_rx_octets: config.supported_max_rx_octets,
            local_max_rx_time: config.supported_max_rx_time,
            peer: Length {
                max_rx_octets: default,
                max_rx_time: MIN_DATA_TIME,
                max_tx_octets: default,
                max_tx_time: MIN_DATA_TIME,
            },
            eff_max_tx_octets: default,
            eff_max_tx_time: MIN_DATA_TIME,
            eff_max_rx_octets: default,
            eff_max_rx_time: MIN_DATA_TIME,
        }
    }

    pub fn local(&self) -> Length {
        Length {
            max_rx_octets: self.local_max_rx_octets,
            max_rx_time: self.local_max_rx_time,
            max_tx_octets: self.local_max_tx_octets,
            max_tx_time: self.local_max_tx_time,
        }
    }

    /// Recompute the effective values, Bluetooth Core, Vol 6, Part B,
    /// 4.5.10. Returns true when any of them changed.
    pub fn update(&mut self, tx_phy: Phy, rx_phy: Phy) -> bool {
        let min_time =
            |phy: Phy| if phy == Phy::LeCoded { MIN_DATA_TIME_CODED } else { MIN_DATA_TIME };
        let before = *self;
        self.eff_max_tx_octets = self.local_max_tx_octets.min(self.peer.max_rx_octets);
        self.eff_max_rx_octets = self.local_max_rx_octets.min(self.peer.max_tx_octets);
        self.eff_max_tx_time =
            self.local_max_tx_time.min(self.peer.max_rx_time).max(min_time(tx_phy));
        self.eff_max_rx_time =
            self.local_max_rx_time.min(self.peer.max_tx_time).max(min_time(rx_phy));
        before != *self
    }

    pub fn change_event(&self, connection_handle: u16) -> hci::Event {
        hci::Event::LeDataLengthChange {
            connection_handle,
            max_tx_octets: self.eff_max_tx_octets,
            max_tx_time: self.eff_max_tx_time,
            max_rx_octets: self.eff_max_rx_octets,
            max_rx_time: self.eff_max_rx_time,
        }
    }
}

/// PHY in use and preferences of the connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PhyState {
    pub tx: Phy,
    pub rx: Phy,
    /// HCI LE Set PHY `all_phys` bits.
    pub all_phys: u8,
    pub tx_pref: PhyMask,
    pub rx_pref: PhyMask,
    /// Candidate Tx PHYs of an update in progress.
    pub tx_restriction: Option<PhyMask>,
}

impl PhyState {
    /// Slowest PHY the transmitter may use until the update in progress
    /// completes.
    pub fn slowest_tx(&self) -> Phy {
        match self.tx_restriction {
            Some(mask) if mask.contains(Phy::LeCoded) => Phy::LeCoded,
            Some(mask) if mask.contains(Phy::Le1m) && self.tx == Phy::Le2m => Phy::Le1m,
            _ => self.tx,
        }
    }
}

/// Parameter changes waiting for their instant.
#[derive(Clone, Copy, Debug, Default)]
pub struct PendingInstants {
    pub conn_update: Option<ConnectionUpdateInd>,
    pub chan_map: Option<(ChannelMap, u16)>,
    pub phy: Option<PhyUpdateInd>,
}

/// Per link context.
pub struct Connection {
    pub id: ConnId,
    pub role: Role,
    pub state: ConnState,
    pub access_address: u32,
    pub crc_init: u32,
    pub chan: ChannelSelection,
    /// Data channel of the next connection event.
    pub channel: u8,
    pub timing: Timing,
    pub instants: PendingInstants,
    pub arq: Arq,
    pub llcp: Llcp,
    pub local_features: u64,
    pub used_features: u64,
    pub peer_features: Option<u64>,
    pub peer_version: Option<VersionInd>,
    pub sca: u8,
    pub peer_sca: Option<u8>,
    /// Minimum used channels requested by the peer on 1M, 2M and coded.
    pub peer_min_used_channels: [u8; 3],
    pub data_length: DataLength,
    pub phy: PhyState,
    /// 10 ms units.
    pub auth_payload_timeout: u16,
    pub past: config::PastParams,
    pub term_reason: ErrorCode,
    /// The link is closed and waits to be freed.
    pub close_requested: bool,
    /// Close the link once the next PDU has been transmitted.
    pub close_after_tx: bool,
    pub radio_op: Option<RadioOp>,
}

impl Connection {
    pub fn new(id: ConnId, role: Role, params: &ConnectionParams, config: &LlConfig) -> Self {
        let map = ChannelMap::new(params.channel_map).unwrap_or_else(ChannelMap::all);
        let algorithm = if params.csa2 { Algorithm::Csa2 } else { Algorithm::Csa1 };
        let chan =
            ChannelSelection::new(algorithm, map, params.hop_increment, params.access_address);
        let central = role == Role::Central;
        let sca_ppm = match role {
            Role::Central => 0,
            Role::Peripheral => sca_budget_ppm(config, params.sca),
        };

        Connection {
            id,
            role,
            state: ConnState::Initialized,
            access_address: params.access_address,
            crc_init: params.crc_init,
            chan,
            channel: 0,
            timing: Timing {
                interval: params.interval,
                latency: params.latency,
                timeout: params.timeout,
                sca_ppm,
                ..Timing::default()
            },
            instants: PendingInstants::default(),
            arq: Arq::new(central, config.nonce_mode, config.max_tx_descriptors),
            llcp: Llcp::new(),
            local_features: config.features,
            used_features: config.features,
            peer_features: None,
            peer_version: None,
            sca: config.sca,
            peer_sca: (!central).then_some(params.sca),
            peer_min_used_channels: [0; 3],
            data_length: DataLength::new(config),
            phy: PhyState {
                tx: Phy::Le1m,
                rx: Phy::Le1m,
                all_phys: 0,
                tx_pref: config.default_tx_phys,
                rx_pref: config.default_rx_phys,
                tx_restriction: None,
            },
            auth_payload_timeout: (config.auth_payload_timeout_ms / 10) as u16,
            past: config.past,
            term_reason: ErrorCode::Success,
            close_requested: false,
            close_after_tx: false,
            radio_op: None,
        }
    }

    pub fn handle(&self) -> u16 {
        self.id.handle()
    }

    pub fn is_central(&self) -> bool {
        self.role == Role::Central
    }

    pub fn is_terminating(&self) -> bool {
        self.state == ConnState::Terminating
    }

    /// Feature supported by both sides (as far as known).
    pub fn supports(&self, bit: LlFeaturesBits) -> bool {
        self.used_features & u64::from(bit) != 0
    }

    pub fn supports_locally(&self, bit: LlFeaturesBits) -> bool {
        self.local_features & u64::from(bit) != 0
    }

    /// Remove a feature after the peer answered LL_UNKNOWN_RSP.
    pub fn clear_used_feature(&mut self, bit: LlFeaturesBits) {
        self.used_features &= !u64::from(bit);
    }

    /// Record the features of the peer, Bluetooth Core, Vol 6, Part B,
    /// 5.1.4: bits of the first octet are only used when both sides
    /// support them.
    pub fn set_peer_features(&mut self, features: u64) {
        self.peer_features = Some(features);
        let byte0 = hci::LL_FEATURES_BYTE0_MASK;
        self.used_features = (self.local_features & features & byte0) | (features & !byte0);
    }

    pub fn is_encrypted(&self) -> bool {
        self.arq.cipher.tx_enabled && self.arq.cipher.rx_enabled
    }

    pub fn send_llcp(&mut self, packet: impl Into<LlcpPacket>) {
        let packet = packet.into();
        debug!("conn {}: -> {:?}", self.handle(), packet);
        self.arq.queue_control(&packet);
    }

    /// Instant to announce in a new procedure: far enough in the future
    /// for the peer to receive the PDU even when using latency.
    pub fn next_instant(&self) -> u16 {
        self.timing.event_counter.wrapping_add(MIN_INSTANT + 1 + self.timing.latency)
    }

    /// Bluetooth Core, Vol 6, Part B, 5.5.1: an instant is in the past
    /// when it is more than 32767 events behind the event counter.
    pub fn instant_passed(&self, instant: u16) -> bool {
        instant.wrapping_sub(self.timing.event_counter) >= 0x8000
    }

    pub fn tx_limits(&self) -> TxLimits {
        TxLimits {
            max_octets: self.data_length.eff_max_tx_octets,
            max_time_us: self.data_length.eff_max_tx_time,
            phy: self.phy.slowest_tx(),
        }
    }

    /// Recompute the effective data length and refragment pending SDUs
    /// when it changed.
    pub fn update_data_length(&mut self) -> bool {
        let changed = self.data_length.update(self.phy.tx, self.phy.rx);
        if changed {
            self.arq.force_start_frag = true;
        }
        changed
    }

    /// Close the link immediately, without the termination procedure.
    pub fn force_terminate(&mut self, reason: ErrorCode) {
        if self.close_requested {
            return;
        }
        info!("conn {}: terminating ({})", self.handle(), reason);
        self.state = ConnState::Terminating;
        self.term_reason = reason;
        self.close_requested = true;
        self.llcp.active = None;
    }

    /// Enter the terminating state. The state never reverts.
    pub fn enter_terminating(&mut self, reason: ErrorCode) {
        if self.state != ConnState::Terminating {
            debug!("conn {}: terminating ({})", self.handle(), reason);
            self.state = ConnState::Terminating;
            self.term_reason = reason;
        }
    }

    /// Index of a PHY in per PHY tables.
    pub fn phy_index(phy: Phy) -> usize {
        match phy {
            Phy::Le1m => 0,
            Phy::Le2m => 1,
            Phy::LeCoded => 2,
        }
    }
}

/// Combined clock inaccuracy of a peripheral: the central's declared
/// accuracy plus the local one.
pub fn sca_budget_ppm(config: &LlConfig, central_sca: u8) -> u32 {
    let local = (config::sca_ppm(config.sca) as i32 + config.sca_mod as i32).max(0) as u32;
    config::sca_ppm(central_sca) + local
}
