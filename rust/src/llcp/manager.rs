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

use std::collections::VecDeque;

use bytes::Bytes;
use log::{debug, error, info};
use thiserror::Error;

use crate::config::{LlConfig, MAX_DATA_OCTETS, MAX_DATA_TIME, MIN_DATA_OCTETS, MIN_DATA_TIME};
use crate::llcp::arq::{BufferCredits, TxPdu};
use crate::llcp::chan::ChannelMap;
use crate::llcp::conn::{ConnId, ConnSpec, ConnState, Connection, ConnectionParams};
use crate::llcp::isr::{self, RadioAction, Signals};
use crate::llcp::procedure::{self, encryption, ProcKind, ProcSet};
use crate::llcp::procedure::{conn_update, Origin};
use crate::llcp::sched;
use crate::llcp::Env;
use crate::ops::{ControllerOps, TimerKind};
use crate::packets::hci::{self, ErrorCode, LlFeaturesBits, Phy, PhyMask, Role};
use crate::packets::llcp::{DataHeader, Llid, MinUsedChannelsInd, PeriodicSyncInd};

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkLayerError {
    #[error("Unknown connection")]
    UnknownConnection,
    #[error("Connection limit exceeded")]
    ConnectionLimitExceeded,
    #[error("Memory capacity exceeded")]
    MemoryCapacityExceeded,
    #[error("Command disallowed")]
    CommandDisallowed,
    #[error("Invalid parameters")]
    InvalidParameters,
    #[error("Unsupported feature")]
    UnsupportedFeature,
    #[error("Unsupported remote feature")]
    UnsupportedRemoteFeature,
    #[error("Procedure already in progress")]
    Busy,
}

impl LinkLayerError {
    /// Status of the HCI command that failed.
    pub fn status(self) -> ErrorCode {
        match self {
            LinkLayerError::UnknownConnection => ErrorCode::UnknownConnection,
            LinkLayerError::ConnectionLimitExceeded => ErrorCode::ConnectionLimitExceeded,
            LinkLayerError::MemoryCapacityExceeded => ErrorCode::MemoryCapacityExceeded,
            LinkLayerError::CommandDisallowed => ErrorCode::CommandDisallowed,
            LinkLayerError::InvalidParameters => ErrorCode::InvalidHciCommandParameters,
            LinkLayerError::UnsupportedFeature => ErrorCode::UnsupportedFeatureOrParameterValue,
            LinkLayerError::UnsupportedRemoteFeature => ErrorCode::UnsupportedRemoteFeature,
            LinkLayerError::Busy => ErrorCode::ControllerBusy,
        }
    }
}

/// Work deferred from the radio completion handlers to the task
/// context, processed in post order.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Message {
    RxPending,
    TxAcked,
    Authenticated,
    Established,
    EventEnded,
    ProcInstant,
    Terminated,
    TimerExpired(TimerKind),
}

#[derive(Default)]
struct Slot {
    generation: u16,
    conn: Option<Connection>,
    /// The link is closed and waits for its isochronous streams.
    closing: bool,
}

pub struct LinkLayer<O: ControllerOps> {
    ops: O,
    config: LlConfig,
    slots: Vec<Slot>,
    credits: BufferCredits,
    messages: VecDeque<(ConnId, Message)>,
}

/// Context of a live link, checked against the generation of `id`.
fn link_mut(slots: &mut [Slot], id: ConnId) -> Option<&mut Connection> {
    let slot = slots.get_mut(id.index as usize)?;
    if slot.generation != id.generation {
        debug!("conn {}: stale reference (generation {})", id.handle(), id.generation);
        return None;
    }
    slot.conn.as_mut()
}

/// HCI Disconnect reasons, Bluetooth Core, Vol 4, Part E, 7.1.6.
fn is_valid_disconnect_reason(reason: ErrorCode) -> bool {
    matches!(
        reason,
        ErrorCode::AuthenticationFailure
            | ErrorCode::RemoteUserTerminatedConnection
            | ErrorCode::RemoteDeviceTerminatedConnectionLowResources
            | ErrorCode::RemoteDeviceTerminatedConnectionPowerOff
            | ErrorCode::UnsupportedRemoteFeature
            | ErrorCode::PairingWithUnitKeyNotSupported
            | ErrorCode::UnacceptableConnectionParameters
    )
}

impl<O: ControllerOps> LinkLayer<O> {
    pub fn new(ops: O, config: LlConfig) -> Self {
        let credits = BufferCredits::new(config.num_tx_bufs, config.num_rx_bufs);
        let slots = (0..config.max_conn).map(|_| Slot::default()).collect();
        LinkLayer { ops, config, slots, credits, messages: VecDeque::new() }
    }

    pub fn ops(&self) -> &O {
        &self.ops
    }

    pub fn config(&self) -> &LlConfig {
        &self.config
    }

    pub fn credits(&self) -> &BufferCredits {
        &self.credits
    }

    pub fn connection(&self, handle: u16) -> Option<&Connection> {
        self.slots.get(handle as usize).and_then(|slot| slot.conn.as_ref())
    }

    pub fn num_connections(&self) -> usize {
        self.slots.iter().filter(|slot| slot.conn.is_some()).count()
    }

    /// Create the context of a new link. Fails when every slot of the
    /// table is in use.
    pub fn allocate(
        &mut self,
        role: Role,
        params: &ConnectionParams,
    ) -> Result<ConnId, LinkLayerError> {
        let Some(index) = self.slots.iter().position(|slot| slot.conn.is_none()) else {
            error!("no free connection context");
            return Err(LinkLayerError::ConnectionLimitExceeded);
        };
        if ChannelMap::new(params.channel_map).is_none() {
            return Err(LinkLayerError::InvalidParameters);
        }
        let first = self.num_connections() == 0;
        let slot = &mut self.slots[index];
        let id = ConnId { index: index as u16, generation: slot.generation };
        slot.conn = Some(Connection::new(id, role, params, &self.config));
        slot.closing = false;
        info!("conn {}: allocated as {:?}", id.handle(), role);
        if first {
            self.ops.radio_enable();
        }
        Ok(id)
    }

    /// Release a link that was never established, without host
    /// notification.
    pub fn free(&mut self, handle: u16) -> Result<(), LinkLayerError> {
        let slot = self.slots.get_mut(handle as usize).ok_or(LinkLayerError::UnknownConnection)?;
        let Some(mut conn) = slot.conn.take() else {
            return Err(LinkLayerError::UnknownConnection);
        };
        slot.generation = slot.generation.wrapping_add(1);
        self.ops.sched_remove(conn.id);
        for timer in TimerKind::ALL {
            self.ops.stop_timer(conn.id, timer);
        }
        let drained = conn.arq.drain();
        self.credits.give_tx(drained.tx_acl);
        self.credits.give_rx(drained.rx_data);
        self.messages.retain(|(id, _)| *id != conn.id);
        if self.num_connections() == 0 {
            self.ops.radio_disable();
        }
        Ok(())
    }

    /// Schedule the first connection event after the connect request
    /// sent or received at `ref_us`.
    pub fn start_first_event(
        &mut self,
        handle: u16,
        ref_us: u32,
        win_size: u8,
        win_offset: u16,
    ) -> Result<(), LinkLayerError> {
        self.with_link(handle, |conn, env, _| {
            if conn.state != ConnState::Initialized {
                return Err(LinkLayerError::CommandDisallowed);
            }
            sched::start_first_event(conn, env, ref_us, win_size, win_offset);
            Ok(())
        })
    }

    fn with_link<R>(
        &mut self,
        handle: u16,
        f: impl FnOnce(&mut Connection, &Env<'_>, &BufferCredits) -> Result<R, LinkLayerError>,
    ) -> Result<R, LinkLayerError> {
        let env = Env { ops: &self.ops, config: &self.config };
        let conn = self
            .slots
            .get_mut(handle as usize)
            .filter(|slot| !slot.closing)
            .and_then(|slot| slot.conn.as_mut())
            .ok_or(LinkLayerError::UnknownConnection)?;
        let result = f(conn, &env, &self.credits);
        if conn.close_requested {
            self.messages.push_back((conn.id, Message::Terminated));
        }
        result
    }

    fn link_by_id(&mut self, id: ConnId) -> Option<(&mut Connection, Env<'_>)> {
        let env = Env { ops: &self.ops, config: &self.config };
        link_mut(&mut self.slots, id).map(|conn| (conn, env))
    }

    fn post(&mut self, id: ConnId, signals: Signals, instants: bool) {
        let messages = [
            (signals.rx_pending, Message::RxPending),
            (signals.tx_acked, Message::TxAcked),
            (signals.authenticated, Message::Authenticated),
            (signals.established, Message::Established),
            (instants, Message::ProcInstant),
            (signals.event_ended, Message::EventEnded),
            (signals.terminated, Message::Terminated),
        ];
        for (_, message) in messages.into_iter().filter(|(set, _)| *set) {
            self.messages.push_back((id, message));
        }
    }

    /// The radio starts a connection event. Returns the PDU to transmit
    /// first, on the central.
    pub fn begin_op(&mut self, id: ConnId, ce_start_us: u32) -> Option<TxPdu> {
        let (conn, env) = self.link_by_id(id)?;
        isr::begin_op(conn, &env, ce_start_us)
    }

    pub fn rx_complete(
        &mut self,
        id: ConnId,
        header: &DataHeader,
        payload: Bytes,
        crc_ok: bool,
    ) -> RadioAction {
        let env = Env { ops: &self.ops, config: &self.config };
        let Some(conn) = link_mut(&mut self.slots, id) else {
            return RadioAction::Close;
        };
        let (action, signals) =
            isr::rx_complete(conn, &env, &self.credits, header, payload, crc_ok);
        self.post(id, signals, false);
        action
    }

    pub fn tx_complete(&mut self, id: ConnId) -> RadioAction {
        let Some((conn, env)) = self.link_by_id(id) else {
            return RadioAction::Close;
        };
        let (action, signals) = isr::tx_complete(conn, &env);
        self.post(id, signals, false);
        action
    }

    pub fn end_op(&mut self, id: ConnId) {
        let Some((conn, env)) = self.link_by_id(id) else {
            return;
        };
        let signals = isr::end_op(conn, &env);
        let instants = !conn.llcp.instants_reached.is_empty();
        self.post(id, signals, instants);
    }

    pub fn abort_op(&mut self, id: ConnId) {
        let Some((conn, env)) = self.link_by_id(id) else {
            return;
        };
        let signals = isr::abort_op(conn, &env);
        let instants = !conn.llcp.instants_reached.is_empty();
        self.post(id, signals, instants);
    }

    /// Run a whole connection event against the given received packets.
    pub fn run_event(
        &mut self,
        id: ConnId,
        ce_start_us: u32,
        rx: Vec<(DataHeader, Bytes, bool)>,
    ) -> Vec<TxPdu> {
        let env = Env { ops: &self.ops, config: &self.config };
        let Some(conn) = link_mut(&mut self.slots, id) else {
            return vec![];
        };
        let (sent, signals) = isr::run_event(conn, &env, &self.credits, ce_start_us, rx);
        let instants = !conn.llcp.instants_reached.is_empty();
        self.post(id, signals, instants);
        sent
    }

    pub fn timer_expired(&mut self, id: ConnId, timer: TimerKind) {
        self.messages.push_back((id, Message::TimerExpired(timer)));
    }

    /// Process the deferred messages.
    pub fn tick(&mut self) {
        while let Some((id, message)) = self.messages.pop_front() {
            let env = Env { ops: &self.ops, config: &self.config };
            let Some(conn) = link_mut(&mut self.slots, id) else {
                debug!("conn {}: dropping {:?}", id.handle(), message);
                continue;
            };
            dispatch(conn, &env, &self.credits, message);
            if conn.close_requested {
                self.close(id);
            }
        }
    }

    fn close(&mut self, id: ConnId) {
        let env = Env { ops: &self.ops, config: &self.config };
        let Some(slot) =
            self.slots.get_mut(id.index as usize).filter(|slot| slot.generation == id.generation)
        else {
            return;
        };
        let Some(conn) = slot.conn.as_mut() else {
            return;
        };
        let reason = conn.term_reason;
        if !slot.closing {
            slot.closing = true;
            env.ops.sched_remove(id);
            for timer in TimerKind::ALL {
                env.ops.stop_timer(id, timer);
            }
            // The host gets an answer for every command it is waiting on.
            for kind in conn.llcp.notify.iter().filter(|kind| *kind != ProcKind::Termination) {
                procedure::notify_host(conn, &env, kind, reason);
            }
            conn.llcp.notify = ProcSet::EMPTY;
        }
        if env.ops.has_active_cis(conn.handle()) {
            debug!("conn {}: close deferred until the CIS are terminated", conn.handle());
            return;
        }

        let drained = conn.arq.drain();
        self.credits.give_tx(drained.tx_acl);
        self.credits.give_rx(drained.rx_data);
        env.ops.send_hci_event(hci::Event::DisconnectionComplete {
            status: ErrorCode::Success,
            connection_handle: conn.handle(),
            reason,
        });
        info!("conn {}: closed ({})", conn.handle(), reason);
        slot.conn = None;
        slot.closing = false;
        slot.generation = slot.generation.wrapping_add(1);
        if self.num_connections() == 0 {
            self.ops.radio_disable();
        }
    }

    /// The isochronous streams of a closed link are gone.
    pub fn cis_terminated(&mut self, handle: u16) {
        let id = match self.slots.get(handle as usize) {
            Some(slot) if slot.closing => {
                ConnId { index: handle, generation: slot.generation }
            }
            _ => return,
        };
        self.close(id)
    }

    /// HCI Disconnect.
    pub fn disconnect(&mut self, handle: u16, reason: ErrorCode) -> Result<(), LinkLayerError> {
        if !is_valid_disconnect_reason(reason) {
            return Err(LinkLayerError::InvalidParameters);
        }
        self.with_link(handle, |conn, env, _| {
            if conn.is_terminating() {
                return Err(LinkLayerError::CommandDisallowed);
            }
            conn.term_reason = reason;
            procedure::start(conn, env, ProcKind::Termination, Origin::Internal)
        })
    }

    /// HCI LE Connection Update.
    pub fn connection_update(&mut self, handle: u16, spec: ConnSpec) -> Result<(), LinkLayerError> {
        if !spec.is_valid() {
            return Err(LinkLayerError::InvalidParameters);
        }
        self.with_link(handle, |conn, env, _| {
            let busy = [ProcKind::ConnUpdate, ProcKind::ConnParam]
                .into_iter()
                .any(|kind| conn.llcp.is_active(kind) || conn.llcp.pend.contains(kind));
            if busy {
                return Err(LinkLayerError::Busy);
            }
            let kind = match conn.role {
                Role::Central
                    if !conn.supports(LlFeaturesBits::ConnectionParametersRequestProcedure) =>
                {
                    ProcKind::ConnUpdate
                }
                _ => ProcKind::ConnParam,
            };
            conn.llcp.conn_update.spec = spec;
            procedure::start(conn, env, kind, Origin::Host)
        })
    }

    /// HCI LE Remote Connection Parameter Request Reply.
    pub fn remote_conn_param_reply(
        &mut self,
        handle: u16,
        spec: ConnSpec,
    ) -> Result<(), LinkLayerError> {
        self.with_link(handle, |conn, env, _| conn_update::host_reply(conn, env, spec))
    }

    /// HCI LE Remote Connection Parameter Request Negative Reply.
    pub fn remote_conn_param_neg_reply(
        &mut self,
        handle: u16,
        reason: ErrorCode,
    ) -> Result<(), LinkLayerError> {
        self.with_link(handle, |conn, env, _| conn_update::host_neg_reply(conn, env, reason))
    }

    /// HCI LE Read Remote Features.
    pub fn read_remote_features(&mut self, handle: u16) -> Result<(), LinkLayerError> {
        self.with_link(handle, |conn, env, _| {
            procedure::start(conn, env, ProcKind::FeatureExchange, Origin::Host)
        })
    }

    /// HCI Read Remote Version Information.
    pub fn read_remote_version(&mut self, handle: u16) -> Result<(), LinkLayerError> {
        self.with_link(handle, |conn, env, _| {
            procedure::start(conn, env, ProcKind::VersionExchange, Origin::Host)
        })
    }

    /// HCI LE Set Data Length.
    pub fn set_data_length(
        &mut self,
        handle: u16,
        tx_octets: u16,
        tx_time: u16,
    ) -> Result<(), LinkLayerError> {
        if !(MIN_DATA_OCTETS..=MAX_DATA_OCTETS).contains(&tx_octets)
            || !(MIN_DATA_TIME..=MAX_DATA_TIME).contains(&tx_time)
        {
            return Err(LinkLayerError::InvalidParameters);
        }
        self.with_link(handle, |conn, env, _| {
            let length = &mut conn.data_length;
            length.local_max_tx_octets = tx_octets.min(env.config.supported_max_tx_octets);
            length.local_max_tx_time = tx_time.min(env.config.supported_max_tx_time);
            procedure::start(conn, env, ProcKind::DataLengthUpdate, Origin::Internal)
        })
    }

    /// HCI LE Set PHY. Bit 0 of `all_phys` leaves the transmitter
    /// preference to the controller, bit 1 the receiver one.
    pub fn set_phy(
        &mut self,
        handle: u16,
        all_phys: u8,
        tx_phys: PhyMask,
        rx_phys: PhyMask,
    ) -> Result<(), LinkLayerError> {
        let tx_any = all_phys & 0x1 != 0;
        let rx_any = all_phys & 0x2 != 0;
        if (!tx_any && tx_phys.is_empty()) || (!rx_any && rx_phys.is_empty()) {
            return Err(LinkLayerError::InvalidParameters);
        }
        self.with_link(handle, |conn, env, _| {
            let mut supported = PhyMask::LE_1M;
            if conn.supports_locally(LlFeaturesBits::Le2mPhy) {
                supported.0 |= PhyMask::LE_2M.0;
            }
            if conn.supports_locally(LlFeaturesBits::LeCodedPhy) {
                supported.0 |= PhyMask::LE_CODED.0;
            }
            let tx = if tx_any { supported } else { tx_phys };
            let rx = if rx_any { supported } else { rx_phys };
            if tx.intersect(supported) != tx || rx.intersect(supported) != rx {
                return Err(LinkLayerError::UnsupportedFeature);
            }
            let llcp = &conn.llcp;
            if llcp.is_active(ProcKind::PhyUpdate) || llcp.pend.contains(ProcKind::PhyUpdate) {
                return Err(LinkLayerError::Busy);
            }
            conn.phy.all_phys = all_phys;
            conn.phy.tx_pref = tx;
            conn.phy.rx_pref = rx;
            procedure::start(conn, env, ProcKind::PhyUpdate, Origin::Host)
        })
    }

    /// HCI LE Enable Encryption.
    pub fn enable_encryption(
        &mut self,
        handle: u16,
        rand: u64,
        ediv: u16,
        ltk: [u8; 16],
    ) -> Result<(), LinkLayerError> {
        self.with_link(handle, |conn, env, _| encryption::host_start(conn, env, rand, ediv, ltk))
    }

    /// HCI LE Long Term Key Request Reply.
    pub fn ltk_reply(&mut self, handle: u16, ltk: [u8; 16]) -> Result<(), LinkLayerError> {
        self.with_link(handle, |conn, env, _| encryption::ltk_reply(conn, env, ltk))
    }

    /// HCI LE Long Term Key Request Negative Reply.
    pub fn ltk_neg_reply(&mut self, handle: u16) -> Result<(), LinkLayerError> {
        self.with_link(handle, |conn, env, _| encryption::ltk_neg_reply(conn, env))
    }

    /// HCI LE Set Host Channel Classification: every central link moves
    /// to the new map.
    pub fn set_host_channel_classification(&mut self, map: u64) -> Result<(), LinkLayerError> {
        let map = ChannelMap::new(map).ok_or(LinkLayerError::InvalidParameters)?;
        let env = Env { ops: &self.ops, config: &self.config };
        let links = self.slots.iter_mut().filter(|slot| !slot.closing);
        for conn in links.filter_map(|slot| slot.conn.as_mut()) {
            if conn.role != Role::Central || conn.is_terminating() {
                continue;
            }
            conn.llcp.common.chan_map = Some(map);
            let started =
                procedure::start(conn, &env, ProcKind::ChannelMapUpdate, Origin::Internal);
            if let Err(err) = started {
                debug!("conn {}: channel map update not started: {}", conn.handle(), err);
            }
        }
        Ok(())
    }

    /// HCI LE Set Minimum Number Of Used Channels.
    pub fn set_min_used_channels(
        &mut self,
        handle: u16,
        phys: PhyMask,
        min_used_channels: u8,
    ) -> Result<(), LinkLayerError> {
        if phys.is_empty() || !(2..=37).contains(&min_used_channels) {
            return Err(LinkLayerError::InvalidParameters);
        }
        self.with_link(handle, |conn, env, _| {
            conn.llcp.common.min_used_channels =
                Some(MinUsedChannelsInd { phys: phys.0, min_used_channels });
            procedure::start(conn, env, ProcKind::SetMinUsedChannels, Origin::Host)
        })
    }

    /// HCI LE Periodic Advertising Sync Transfer.
    pub fn periodic_sync_transfer(
        &mut self,
        handle: u16,
        ind: PeriodicSyncInd,
    ) -> Result<(), LinkLayerError> {
        self.with_link(handle, |conn, env, _| {
            conn.llcp.common.sync_ind = Some(ind);
            procedure::start(conn, env, ProcKind::PeriodicSyncTransfer, Origin::Host)
        })
    }

    /// HCI LE Request Peer SCA.
    pub fn request_peer_sca(&mut self, handle: u16) -> Result<(), LinkLayerError> {
        self.with_link(handle, |conn, env, _| {
            procedure::start(conn, env, ProcKind::RequestPeerSca, Origin::Host)
        })
    }

    /// HCI Write Authenticated Payload Timeout, in 10 ms units.
    pub fn write_auth_payload_timeout(
        &mut self,
        handle: u16,
        timeout: u16,
    ) -> Result<(), LinkLayerError> {
        self.with_link(handle, |conn, env, _| {
            let timing = &conn.timing;
            let min_us = timing.interval_us() as u64 * (1 + timing.latency as u64);
            if timeout == 0 || (timeout as u64 * 10_000) < min_us {
                return Err(LinkLayerError::InvalidParameters);
            }
            conn.auth_payload_timeout = timeout;
            encryption::restart_auth_timers(conn, env);
            Ok(())
        })
    }

    /// HCI Read Authenticated Payload Timeout, in 10 ms units.
    pub fn read_auth_payload_timeout(&mut self, handle: u16) -> Result<u16, LinkLayerError> {
        self.with_link(handle, |conn, _, _| Ok(conn.auth_payload_timeout))
    }

    /// HCI LE Read Channel Map.
    pub fn read_channel_map(&mut self, handle: u16) -> Result<u64, LinkLayerError> {
        self.with_link(handle, |conn, _, _| Ok(conn.chan.map.mask()))
    }

    /// HCI LE Read PHY: transmitter then receiver PHY.
    pub fn read_phy(&mut self, handle: u16) -> Result<(Phy, Phy), LinkLayerError> {
        self.with_link(handle, |conn, _, _| Ok((conn.phy.tx, conn.phy.rx)))
    }

    /// Queue an ACL SDU from the host. Each queued SDU holds one host
    /// buffer until it is acknowledged.
    pub fn send_acl(&mut self, handle: u16, llid: Llid, data: Bytes) -> Result<(), LinkLayerError> {
        if llid == Llid::Control || data.is_empty() {
            return Err(LinkLayerError::InvalidParameters);
        }
        self.with_link(handle, |conn, _, credits| {
            if conn.is_terminating() {
                return Err(LinkLayerError::CommandDisallowed);
            }
            if !credits.take_tx() {
                return Err(LinkLayerError::MemoryCapacityExceeded);
            }
            if !conn.arq.queue_acl(llid, data) {
                credits.give_tx(1);
                return Err(LinkLayerError::MemoryCapacityExceeded);
            }
            Ok(())
        })
    }

    /// The host released receive buffers.
    pub fn rx_buffers_freed(&mut self, count: u16) {
        self.credits.give_rx(count)
    }
}

fn dispatch(conn: &mut Connection, env: &Env<'_>, credits: &BufferCredits, message: Message) {
    match message {
        Message::RxPending => {
            while let Some(pdu) = conn.arq.pop_rx() {
                match pdu.llid {
                    Llid::Control => procedure::on_control_pdu(conn, env, &pdu.payload),
                    llid => env.ops.deliver_acl(conn.handle(), llid, pdu.payload),
                }
                if conn.close_requested {
                    break;
                }
            }
        }
        Message::TxAcked => {
            while let Some(opcode) = conn.arq.take_acked_control() {
                procedure::on_tx_acked(conn, env, opcode);
            }
            let completed = conn.arq.take_tx_completed();
            if completed > 0 {
                credits.give_tx(completed);
                env.ops.send_hci_event(hci::Event::NumberOfCompletedPackets {
                    connection_handle: conn.handle(),
                    num_completed_packets: completed,
                });
            }
            procedure::on_arq_progress(conn, env);
        }
        Message::Authenticated => encryption::restart_auth_timers(conn, env),
        Message::Established => {
            info!("conn {}: established", conn.handle());
            if conn.is_central() && env.config.auto_feature_exchange {
                if let Err(err) =
                    procedure::start(conn, env, ProcKind::FeatureExchange, Origin::Internal)
                {
                    debug!("conn {}: no feature exchange: {}", conn.handle(), err);
                }
            }
        }
        Message::ProcInstant => {
            while let Some(kind) = conn.llcp.instants_reached.take_first() {
                procedure::on_instant(conn, env, kind);
            }
        }
        Message::EventEnded => {
            procedure::on_arq_progress(conn, env);
            procedure::start_pending(conn, env);
        }
        Message::Terminated => (),
        Message::TimerExpired(TimerKind::Supervision) => {
            let reason = match conn.state {
                ConnState::EstablishedStartup => ErrorCode::ConnectionFailedToBeEstablished,
                _ => ErrorCode::ConnectionTimeout,
            };
            conn.force_terminate(reason);
        }
        Message::TimerExpired(TimerKind::LlcpResponse) => procedure::on_response_timeout(conn),
        Message::TimerExpired(TimerKind::Ping) => encryption::on_ping_timer(conn, env),
        Message::TimerExpired(TimerKind::AuthPayload) => {
            encryption::on_auth_payload_timeout(conn, env)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llcp::test::{params, TestContext};
    use crate::packets::llcp::{FeatureRsp, LlcpPacket, Opcode, TerminateInd};

    /// Data channel state of the remote side.
    #[derive(Default)]
    struct Peer {
        expected_sn: bool,
    }

    impl Peer {
        /// Answer a PDU of the central.
        fn reply(&mut self, tx: &TxPdu, llid: Llid, payload: Bytes) -> (DataHeader, Bytes, bool) {
            if tx.header.sn == self.expected_sn {
                self.expected_sn = !self.expected_sn;
            }
            let header = DataHeader {
                llid: if payload.is_empty() { Llid::Continuation } else { llid },
                nesn: self.expected_sn,
                sn: tx.header.nesn,
                md: false,
                length: payload.len() as u8,
            };
            (header, payload, true)
        }
    }

    fn link_layer() -> LinkLayer<TestContext> {
        LinkLayer::new(TestContext::new(), LlConfig::default())
    }

    fn connect(ll: &mut LinkLayer<TestContext>, role: Role) -> ConnId {
        let id = ll.allocate(role, &params()).unwrap();
        ll.start_first_event(id.handle(), 0, 2, 0).unwrap();
        id
    }

    /// One connection event of a central: a single exchange with the
    /// peer answering `payload`.
    fn event(
        ll: &mut LinkLayer<TestContext>,
        id: ConnId,
        peer: &mut Peer,
        llid: Llid,
        payload: Bytes,
    ) -> TxPdu {
        let start = ll.connection(id.handle()).map_or(0, |conn| conn.timing.anchor_us);
        ll.ops().set_now(start);
        let tx = ll.begin_op(id, start).unwrap();
        if ll.tx_complete(id) == RadioAction::Receive {
            let (header, payload, crc_ok) = peer.reply(&tx, llid, payload);
            ll.rx_complete(id, &header, payload, crc_ok);
        }
        ll.end_op(id);
        ll.tick();
        tx
    }

    fn control(tx: &TxPdu) -> Option<Opcode> {
        (tx.header.llid == Llid::Control)
            .then(|| LlcpPacket::parse(&tx.payload).ok())
            .flatten()
            .map(|packet| packet.opcode())
    }

    #[test]
    fn table_is_bounded() {
        let mut ll = link_layer();
        let ids: Vec<_> =
            (0..4).map(|_| ll.allocate(Role::Central, &params()).unwrap()).collect();
        assert!(ll.ops().radio_enabled.get());
        assert_eq!(
            ll.allocate(Role::Central, &params()),
            Err(LinkLayerError::ConnectionLimitExceeded)
        );
        assert_eq!(
            LinkLayerError::ConnectionLimitExceeded.status(),
            ErrorCode::ConnectionLimitExceeded
        );

        for id in &ids {
            ll.free(id.handle()).unwrap();
        }
        assert!(!ll.ops().radio_enabled.get());
        // Handles of freed links are reused with a new generation.
        let id = ll.allocate(Role::Central, &params()).unwrap();
        assert_eq!(id.index, ids[0].index);
        assert_ne!(id.generation, ids[0].generation);
    }

    #[test]
    fn first_packet_establishes_and_starts_feature_exchange() {
        let mut ll = link_layer();
        let id = connect(&mut ll, Role::Central);
        let state = |ll: &LinkLayer<TestContext>| ll.connection(id.handle()).map(|conn| conn.state);
        assert_eq!(state(&ll), Some(ConnState::EstablishedStartup));
        let mut peer = Peer::default();

        event(&mut ll, id, &mut peer, Llid::Continuation, Bytes::new());
        assert_eq!(state(&ll), Some(ConnState::EstablishedReady));
        let tx = event(&mut ll, id, &mut peer, Llid::Continuation, Bytes::new());
        assert_eq!(control(&tx), Some(Opcode::FeatureReq));
    }

    #[test]
    fn host_disconnect() {
        let mut ll = link_layer();
        let id = connect(&mut ll, Role::Central);
        let mut peer = Peer::default();
        event(&mut ll, id, &mut peer, Llid::Continuation, Bytes::new());
        // Feature exchange started at establishment.
        event(&mut ll, id, &mut peer, Llid::Continuation, Bytes::new());

        assert_eq!(
            ll.disconnect(id.handle(), ErrorCode::ConnectionTimeout),
            Err(LinkLayerError::InvalidParameters)
        );
        ll.disconnect(id.handle(), ErrorCode::RemoteUserTerminatedConnection).unwrap();
        assert_eq!(
            ll.disconnect(id.handle(), ErrorCode::RemoteUserTerminatedConnection),
            Err(LinkLayerError::CommandDisallowed)
        );
        let tx = event(&mut ll, id, &mut peer, Llid::Continuation, Bytes::new());
        assert_eq!(control(&tx), Some(Opcode::TerminateInd));

        assert_eq!(
            ll.ops().take_events(),
            vec![hci::Event::DisconnectionComplete {
                status: ErrorCode::Success,
                connection_handle: id.handle(),
                reason: ErrorCode::ConnectionTerminatedByLocalHost,
            }]
        );
        assert_eq!(ll.num_connections(), 0);
        assert!(ll.ops().timers.borrow().is_empty());
        assert_eq!(ll.read_channel_map(id.handle()), Err(LinkLayerError::UnknownConnection));
        // Expiries for the freed link are dropped.
        ll.timer_expired(id, TimerKind::Supervision);
        ll.tick();
        assert!(ll.ops().take_events().is_empty());
    }

    #[test]
    fn peer_terminate_closes_after_acknowledgment() {
        let mut ll = link_layer();
        let id = connect(&mut ll, Role::Central);
        let mut peer = Peer::default();
        let terminate = LlcpPacket::from(TerminateInd { error_code: 0x13 }).to_bytes();

        event(&mut ll, id, &mut peer, Llid::Control, terminate);
        assert!(ll.ops().take_events().is_empty());
        event(&mut ll, id, &mut peer, Llid::Continuation, Bytes::new());
        assert_eq!(
            ll.ops().take_events(),
            vec![hci::Event::DisconnectionComplete {
                status: ErrorCode::Success,
                connection_handle: id.handle(),
                reason: ErrorCode::RemoteUserTerminatedConnection,
            }]
        );
    }

    #[test]
    fn supervision_timeout() {
        let mut ll = link_layer();
        let id = connect(&mut ll, Role::Peripheral);
        assert_eq!(ll.ops().timer(id, TimerKind::Supervision), Some(1000));
        ll.timer_expired(id, TimerKind::Supervision);
        ll.tick();
        assert_eq!(
            ll.ops().take_events(),
            vec![hci::Event::DisconnectionComplete {
                status: ErrorCode::Success,
                connection_handle: id.handle(),
                reason: ErrorCode::ConnectionFailedToBeEstablished,
            }]
        );
        assert_eq!(ll.ops().take_removed().last(), Some(&id));
    }

    #[test]
    fn outstanding_host_procedures_are_answered_on_close() {
        let mut ll = link_layer();
        let id = connect(&mut ll, Role::Central);
        let mut peer = Peer::default();
        event(&mut ll, id, &mut peer, Llid::Continuation, Bytes::new());
        ll.ops().take_events();

        // Behind the feature exchange started at establishment.
        ll.read_remote_version(id.handle()).unwrap();
        ll.timer_expired(id, TimerKind::LlcpResponse);
        ll.tick();
        assert_eq!(
            ll.ops().take_events(),
            vec![
                hci::Event::ReadRemoteVersionInformationComplete {
                    status: ErrorCode::LmpOrLlResponseTimeout,
                    connection_handle: id.handle(),
                    version: 0,
                    manufacturer_name: 0,
                    subversion: 0,
                },
                hci::Event::DisconnectionComplete {
                    status: ErrorCode::Success,
                    connection_handle: id.handle(),
                    reason: ErrorCode::LmpOrLlResponseTimeout,
                }
            ]
        );
    }

    #[test]
    fn close_waits_for_isochronous_streams() {
        let mut ll = link_layer();
        let id = connect(&mut ll, Role::Central);
        ll.ops().active_cis.borrow_mut().insert(id.handle());

        ll.timer_expired(id, TimerKind::Supervision);
        ll.tick();
        assert!(ll.ops().take_events().is_empty());
        assert_eq!(ll.num_connections(), 1);
        assert_eq!(ll.read_phy(id.handle()), Err(LinkLayerError::UnknownConnection));

        ll.ops().active_cis.borrow_mut().clear();
        ll.cis_terminated(id.handle());
        assert_eq!(ll.ops().take_events().len(), 1);
        assert_eq!(ll.num_connections(), 0);
    }

    #[test]
    fn acl_credits_and_completion() {
        let mut ll = link_layer();
        let id = connect(&mut ll, Role::Central);
        let mut peer = Peer::default();
        event(&mut ll, id, &mut peer, Llid::Continuation, Bytes::new());
        event(&mut ll, id, &mut peer, Llid::Continuation, Bytes::new());
        ll.ops().take_events();

        assert_eq!(
            ll.send_acl(id.handle(), Llid::Control, Bytes::from_static(b"x")),
            Err(LinkLayerError::InvalidParameters)
        );
        ll.send_acl(id.handle(), Llid::Start, Bytes::from_static(b"ping")).unwrap();
        assert_eq!(ll.credits().available_tx(), 7);

        let tx = event(&mut ll, id, &mut peer, Llid::Start, Bytes::from_static(b"pong"));
        assert_eq!(tx.payload, Bytes::from_static(b"ping"));
        assert_eq!(ll.credits().available_tx(), 8);
        assert_eq!(
            ll.ops().take_events(),
            vec![hci::Event::NumberOfCompletedPackets {
                connection_handle: id.handle(),
                num_completed_packets: 1,
            }]
        );
        assert_eq!(
            ll.ops().take_acl(),
            vec![(id.handle(), Llid::Start, Bytes::from_static(b"pong"))]
        );
        assert_eq!(ll.credits().available_rx(), 7);
        ll.rx_buffers_freed(1);
        assert_eq!(ll.credits().available_rx(), 8);
    }

    #[test]
    fn command_parameters_are_checked() {
        let mut ll = link_layer();
        let id = connect(&mut ll, Role::Central);
        let handle = id.handle();
        let spec = ConnSpec {
            interval_min: 5,
            interval_max: 24,
            latency: 0,
            timeout: 100,
            ..ConnSpec::default()
        };
        let invalid = Err(LinkLayerError::InvalidParameters);
        assert_eq!(ll.connection_update(handle, spec), invalid);
        assert_eq!(ll.set_data_length(handle, 26, 328), invalid);
        assert_eq!(ll.set_phy(handle, 0, PhyMask::NONE, PhyMask::ALL), invalid);
        assert_eq!(ll.set_host_channel_classification(0x1), invalid);
        assert_eq!(
            ll.set_min_used_channels(handle, PhyMask::LE_1M, 2),
            Err(LinkLayerError::CommandDisallowed)
        );
        // 30 ms interval.
        assert_eq!(ll.write_auth_payload_timeout(handle, 2), invalid);
        ll.write_auth_payload_timeout(handle, 300).unwrap();
        assert_eq!(ll.read_auth_payload_timeout(handle), Ok(300));
        assert_eq!(ll.read_phy(handle), Ok((Phy::Le1m, Phy::Le1m)));
        assert_eq!(ll.read_remote_features(handle + 1), Err(LinkLayerError::UnknownConnection));
    }

    #[test]
    fn host_channel_classification_updates_central_links() {
        let mut ll = link_layer();
        let id = connect(&mut ll, Role::Central);
        let mut peer = Peer::default();
        event(&mut ll, id, &mut peer, Llid::Continuation, Bytes::new());
        // Answer the feature exchange started at establishment.
        let features = LlcpPacket::from(FeatureRsp { features: ll.config().features }).to_bytes();
        event(&mut ll, id, &mut peer, Llid::Control, features);

        ll.set_host_channel_classification(0x0f).unwrap();
        let tx = event(&mut ll, id, &mut peer, Llid::Continuation, Bytes::new());
        assert_eq!(control(&tx), Some(Opcode::ChannelMapInd));

        let conn = ll.connection(id.handle()).unwrap();
        let (_, instant) = conn.instants.chan_map.unwrap();
        while ll.connection(id.handle()).unwrap().timing.event_counter != instant {
            event(&mut ll, id, &mut peer, Llid::Continuation, Bytes::new());
        }
        assert_eq!(ll.read_channel_map(id.handle()), Ok(0x0f));
        assert_eq!(ll.connection(id.handle()).and_then(|conn| conn.llcp.active), None);
    }
}
