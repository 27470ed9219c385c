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

//! Procedures without collision handling of their own, serialized
//! through one busy/idle gate.
//!
//! Bluetooth Core, Vol 6, Part B, 5.1.2 (channel map update),
//! 5.1.4 (feature exchange), 5.1.5 (version exchange),
//! 5.1.6 (termination), 5.1.9 (data length update),
//! 5.1.11 (minimum number of used channels),
//! 5.1.13 (periodic advertising sync transfer),
//! 5.1.14 (sleep clock accuracy update).

use log::{debug, info, warn};

use crate::config::{MAX_DATA_OCTETS, MAX_DATA_TIME, MIN_DATA_OCTETS, MIN_DATA_TIME};
use crate::llcp::chan::ChannelMap;
use crate::llcp::conn::{ConnState, Connection};
use crate::llcp::procedure::{self, Origin, ProcKind};
use crate::llcp::Env;
use crate::ops::TimerKind;
use crate::packets::hci::{self, ErrorCode, LlFeaturesBits, Phy};
use crate::packets::llcp::{
    ChannelMapInd, ClockAccuracyReq, ClockAccuracyRsp, FeatureReq, FeatureRsp, Length,
    LengthReq, LengthRsp, LlcpPacket, MinUsedChannelsInd, Opcode, PeriodicSyncInd,
    PeripheralFeatureReq, TerminateInd, VersionInd,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Gate {
    Idle,
    Busy,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EngineEvent {
    HostStart,
    InternalStart,
    /// Resume after an interruption.
    Resume,
    /// Peer PDU that does not expect a reply.
    RxIndication,
    /// Peer PDU that expects a reply.
    RxRequest,
    RxResponse,
    Complete,
    Reject,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EngineAction {
    /// Send the request of the procedure and make it active.
    Start,
    /// Record the procedure in the pending set.
    Pend,
    /// Move the active procedure to the pending set and start.
    Override,
    /// Answer the peer without touching the gate.
    Respond,
    /// Record a peer procedure that cannot be made active yet.
    MarkIncomplete,
    /// Make a peer procedure active.
    Receive,
    /// Complete the active procedure.
    Finish,
    Ignore,
}

/// Gate transitions. `same` is set when the event concerns the active
/// procedure, `can_override` when the event may interrupt it.
pub fn transition(
    gate: Gate,
    event: EngineEvent,
    same: bool,
    can_override: bool,
) -> (EngineAction, Gate) {
    use EngineAction::*;
    use EngineEvent::*;
    use Gate::*;

    match (gate, event) {
        (Idle, HostStart | InternalStart | Resume) => (Start, Busy),
        (Busy, HostStart | InternalStart | Resume) if same => (Ignore, Busy),
        (Busy, HostStart | InternalStart) if can_override => (Override, Busy),
        (Busy, HostStart | InternalStart | Resume) => (Pend, Busy),
        (Idle, RxIndication) => (Receive, Busy),
        (Busy, RxIndication) if same => (Receive, Busy),
        (Busy, RxIndication) => (MarkIncomplete, Busy),
        (Busy, RxRequest) if can_override && !same => (Override, Busy),
        (gate, RxRequest) => (Respond, gate),
        (Busy, RxResponse | Complete | Reject) if same => (Finish, Idle),
        (gate, RxResponse | Complete | Reject) => (Ignore, gate),
    }
}

/// State of the gated procedures.
#[derive(Debug, Default)]
pub struct CommonState {
    /// Map to announce in the next channel map update.
    pub chan_map: Option<ChannelMap>,
    /// PHYs and channel count of the next LL_MIN_USED_CHANNELS_IND.
    pub min_used_channels: Option<MinUsedChannelsInd>,
    /// Next LL_PERIODIC_SYNC_IND.
    pub sync_ind: Option<PeriodicSyncInd>,
    /// LL_VERSION_IND is sent at most once per connection.
    pub version_sent: bool,
}

/// When a gated procedure completes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Completion {
    OnResponse,
    OnAck,
    OnInstant,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum PduRole {
    Indication,
    Request,
    Response,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CommonProc {
    Termination,
    ChannelMapUpdate,
    FeatureExchange,
    VersionExchange,
    DataLengthUpdate,
    SetMinUsedChannels,
    PeriodicSyncTransfer,
    RequestPeerSca,
}

impl CommonProc {
    pub fn from_kind(kind: ProcKind) -> Option<CommonProc> {
        Some(match kind {
            ProcKind::Termination => CommonProc::Termination,
            ProcKind::ChannelMapUpdate => CommonProc::ChannelMapUpdate,
            ProcKind::FeatureExchange => CommonProc::FeatureExchange,
            ProcKind::VersionExchange => CommonProc::VersionExchange,
            ProcKind::DataLengthUpdate => CommonProc::DataLengthUpdate,
            ProcKind::SetMinUsedChannels => CommonProc::SetMinUsedChannels,
            ProcKind::PeriodicSyncTransfer => CommonProc::PeriodicSyncTransfer,
            ProcKind::RequestPeerSca => CommonProc::RequestPeerSca,
            _ => return None,
        })
    }

    pub fn kind(self) -> ProcKind {
        match self {
            CommonProc::Termination => ProcKind::Termination,
            CommonProc::ChannelMapUpdate => ProcKind::ChannelMapUpdate,
            CommonProc::FeatureExchange => ProcKind::FeatureExchange,
            CommonProc::VersionExchange => ProcKind::VersionExchange,
            CommonProc::DataLengthUpdate => ProcKind::DataLengthUpdate,
            CommonProc::SetMinUsedChannels => ProcKind::SetMinUsedChannels,
            CommonProc::PeriodicSyncTransfer => ProcKind::PeriodicSyncTransfer,
            CommonProc::RequestPeerSca => ProcKind::RequestPeerSca,
        }
    }

    pub fn completion(self) -> Completion {
        match self {
            CommonProc::ChannelMapUpdate => Completion::OnInstant,
            CommonProc::Termination
            | CommonProc::SetMinUsedChannels
            | CommonProc::PeriodicSyncTransfer => Completion::OnAck,
            CommonProc::FeatureExchange
            | CommonProc::VersionExchange
            | CommonProc::DataLengthUpdate
            | CommonProc::RequestPeerSca => Completion::OnResponse,
        }
    }

    /// Feature removed from the used set when the peer answers
    /// LL_UNKNOWN_RSP.
    fn feature(self, role: hci::Role) -> Option<LlFeaturesBits> {
        match self {
            CommonProc::FeatureExchange if role == hci::Role::Peripheral => {
                Some(LlFeaturesBits::PeripheralInitiatedFeaturesExchange)
            }
            CommonProc::DataLengthUpdate => Some(LlFeaturesBits::LeDataPacketLengthExtension),
            CommonProc::SetMinUsedChannels => {
                Some(LlFeaturesBits::MinimumNumberOfUsedChannelsProcedure)
            }
            CommonProc::PeriodicSyncTransfer => {
                Some(LlFeaturesBits::PeriodicAdvertisingSyncTransferRecipient)
            }
            CommonProc::RequestPeerSca => Some(LlFeaturesBits::SleepClockAccuracyUpdates),
            _ => None,
        }
    }

    fn send_request(self, conn: &mut Connection, env: &Env<'_>) {
        match self {
            CommonProc::Termination => {
                let reason = conn.term_reason;
                conn.enter_terminating(reason);
                conn.send_llcp(TerminateInd { error_code: reason as u8 });
                // Bluetooth Core, Vol 6, Part B, 5.1.6: the procedure
                // times out after the supervision timeout.
                conn.llcp.rsp_timer_armed = true;
                env.ops.start_timer(
                    conn.id,
                    TimerKind::LlcpResponse,
                    conn.timing.timeout_us() / 1000,
                );
            }
            CommonProc::ChannelMapUpdate => {
                let map = conn.llcp.common.chan_map.take().unwrap_or(conn.chan.map);
                let instant = conn.next_instant();
                conn.instants.chan_map = Some((map, instant));
                conn.send_llcp(ChannelMapInd { channel_map: map.mask(), instant });
            }
            CommonProc::FeatureExchange => {
                if conn.peer_features.is_some() {
                    return procedure::complete(conn, env, self.kind(), ErrorCode::Success);
                }
                let features = conn.local_features;
                if conn.is_central() {
                    conn.send_llcp(FeatureReq { features });
                } else {
                    conn.send_llcp(PeripheralFeatureReq { features });
                }
                procedure::arm_response_timer(conn, env);
            }
            CommonProc::VersionExchange => {
                if conn.peer_version.is_some() {
                    return procedure::complete(conn, env, self.kind(), ErrorCode::Success);
                }
                send_version(conn, env);
                procedure::arm_response_timer(conn, env);
            }
            CommonProc::DataLengthUpdate => {
                conn.send_llcp(LengthReq(conn.data_length.local()));
                procedure::arm_response_timer(conn, env);
            }
            CommonProc::SetMinUsedChannels => match conn.llcp.common.min_used_channels.take() {
                Some(ind) => conn.send_llcp(ind),
                None => procedure::complete(conn, env, self.kind(), ErrorCode::Success),
            },
            CommonProc::PeriodicSyncTransfer => match conn.llcp.common.sync_ind.take() {
                Some(ind) => conn.send_llcp(ind),
                None => procedure::complete(conn, env, self.kind(), ErrorCode::UnspecifiedError),
            },
            CommonProc::RequestPeerSca => {
                conn.send_llcp(ClockAccuracyReq { sca: conn.sca });
                procedure::arm_response_timer(conn, env);
            }
        }
    }

    /// Process a peer request or indication.
    fn receive_request(self, conn: &mut Connection, env: &Env<'_>, packet: &LlcpPacket) {
        match packet {
            LlcpPacket::TerminateInd(pdu) => {
                let reason = ErrorCode::from_reason(pdu.error_code);
                info!("conn {}: peer terminates ({})", conn.handle(), reason);
                conn.state = ConnState::Terminating;
                conn.term_reason = reason;
                conn.close_after_tx = true;
                // The interrupted procedure keeps its host notification,
                // answered on close.
                if conn.llcp.active.is_some_and(|active| active != ProcKind::Termination) {
                    procedure::stop_response_timer(conn, env);
                }
                conn.llcp.incomp.remove(ProcKind::Termination);
                conn.llcp.active = Some(ProcKind::Termination);
            }
            LlcpPacket::ChannelMapInd(pdu) => {
                let Some(map) = ChannelMap::new(pdu.channel_map) else {
                    warn!("conn {}: invalid channel map {:#x}", conn.handle(), pdu.channel_map);
                    return conn.force_terminate(ErrorCode::InvalidLmpOrLlParameters);
                };
                if conn.instant_passed(pdu.instant) {
                    return conn.force_terminate(ErrorCode::InstantPassed);
                }
                conn.instants.chan_map = Some((map, pdu.instant));
            }
            LlcpPacket::FeatureReq(FeatureReq { features })
            | LlcpPacket::PeripheralFeatureReq(PeripheralFeatureReq { features }) => {
                conn.set_peer_features(*features)
            }
            LlcpPacket::VersionInd(pdu) => conn.peer_version = Some(*pdu),
            LlcpPacket::LengthReq(LengthReq(length)) => {
                conn.data_length.peer = sanitize_length(*length);
            }
            LlcpPacket::MinUsedChannelsInd(pdu) => on_min_used_channels(conn, env, pdu),
            LlcpPacket::PeriodicSyncInd(pdu) => on_periodic_sync(conn, env, pdu),
            LlcpPacket::ClockAccuracyReq(pdu) => conn.peer_sca = Some(pdu.sca),
            packet => warn!("conn {}: unexpected request {:?}", conn.handle(), packet.opcode()),
        }
    }

    /// Reply to the last peer request, if the procedure has one.
    fn send_response(self, conn: &mut Connection, env: &Env<'_>) {
        match self {
            CommonProc::FeatureExchange => {
                let byte0 = hci::LL_FEATURES_BYTE0_MASK;
                let features = (conn.used_features & byte0) | (conn.local_features & !byte0);
                conn.send_llcp(FeatureRsp { features })
            }
            CommonProc::VersionExchange if !conn.llcp.common.version_sent => {
                send_version(conn, env)
            }
            CommonProc::DataLengthUpdate => {
                conn.send_llcp(LengthRsp(conn.data_length.local()));
                length_changed(conn, env);
            }
            CommonProc::RequestPeerSca => conn.send_llcp(ClockAccuracyRsp { sca: conn.sca }),
            _ => (),
        }
    }

    fn receive_response(self, conn: &mut Connection, env: &Env<'_>, packet: &LlcpPacket) {
        match packet {
            LlcpPacket::FeatureRsp(pdu) => conn.set_peer_features(pdu.features),
            LlcpPacket::VersionInd(pdu) => conn.peer_version = Some(*pdu),
            LlcpPacket::LengthRsp(LengthRsp(length)) => {
                conn.data_length.peer = sanitize_length(*length);
                length_changed(conn, env);
            }
            LlcpPacket::ClockAccuracyRsp(pdu) => conn.peer_sca = Some(pdu.sca),
            _ => return,
        }
        procedure::complete(conn, env, self.kind(), ErrorCode::Success)
    }
}

fn send_version(conn: &mut Connection, env: &Env<'_>) {
    let version = env.config.version;
    conn.llcp.common.version_sent = true;
    conn.send_llcp(VersionInd {
        version: version.version,
        company_id: version.company_id,
        subversion: version.sub_version,
    });
}

/// Bluetooth Core, Vol 6, Part B, 2.4.2.21: values outside the valid
/// ranges are replaced by the nearest valid value.
fn sanitize_length(length: Length) -> Length {
    let octets = |value: u16| value.clamp(MIN_DATA_OCTETS, MAX_DATA_OCTETS);
    let time = |value: u16| value.clamp(MIN_DATA_TIME, MAX_DATA_TIME);
    Length {
        max_rx_octets: octets(length.max_rx_octets),
        max_rx_time: time(length.max_rx_time),
        max_tx_octets: octets(length.max_tx_octets),
        max_tx_time: time(length.max_tx_time),
    }
}

fn length_changed(conn: &mut Connection, env: &Env<'_>) {
    if conn.update_data_length() {
        debug!("conn {}: data length {:?}", conn.handle(), conn.data_length);
        env.ops.send_hci_event(conn.data_length.change_event(conn.handle()));
    }
}

/// Bluetooth Core, Vol 6, Part B, 5.1.11: the central makes sure the
/// channel map uses at least the requested number of channels.
fn on_min_used_channels(conn: &mut Connection, env: &Env<'_>, pdu: &MinUsedChannelsInd) {
    for phy in [Phy::Le1m, Phy::Le2m, Phy::LeCoded] {
        if pdu.phys & phy.mask().0 != 0 {
            conn.peer_min_used_channels[Connection::phy_index(phy)] = pdu.min_used_channels;
        }
    }
    let required = conn.peer_min_used_channels[Connection::phy_index(conn.phy.tx)];
    if conn.chan.map.num_used() < required {
        debug!("conn {}: peer requires {} channels", conn.handle(), required);
        conn.llcp.common.chan_map = Some(ChannelMap::all());
        if let Err(err) = procedure::start(conn, env, ProcKind::ChannelMapUpdate, Origin::Internal)
        {
            warn!("conn {}: cannot update channel map: {}", conn.handle(), err);
        }
    }
}

fn on_periodic_sync(conn: &mut Connection, env: &Env<'_>, pdu: &PeriodicSyncInd) {
    if !conn.supports_locally(LlFeaturesBits::PeriodicAdvertisingSyncTransferRecipient)
        || conn.past.mode == 0
    {
        debug!("conn {}: periodic sync transfer ignored", conn.handle());
        return;
    }
    env.ops.send_hci_event(hci::Event::LePeriodicAdvertisingSyncTransferReceived {
        status: ErrorCode::Success,
        connection_handle: conn.handle(),
        service_data: pdu.id,
        sync_info: pdu.sync_info,
        adv_address: pdu.adv_a,
        adv_sid: pdu.sid,
        adv_phy: pdu.phy,
    });
}

/// The procedure a gated PDU belongs to and its direction.
fn classify(conn: &Connection, packet: &LlcpPacket) -> Option<(CommonProc, PduRole)> {
    use PduRole::*;
    Some(match packet {
        LlcpPacket::TerminateInd(_) => (CommonProc::Termination, Indication),
        LlcpPacket::ChannelMapInd(_) => (CommonProc::ChannelMapUpdate, Indication),
        LlcpPacket::FeatureReq(_) | LlcpPacket::PeripheralFeatureReq(_) => {
            (CommonProc::FeatureExchange, Request)
        }
        LlcpPacket::FeatureRsp(_) => (CommonProc::FeatureExchange, Response),
        LlcpPacket::VersionInd(_) if awaiting(conn, ProcKind::VersionExchange) => {
            (CommonProc::VersionExchange, Response)
        }
        LlcpPacket::VersionInd(_) => (CommonProc::VersionExchange, Request),
        LlcpPacket::LengthReq(_) => (CommonProc::DataLengthUpdate, Request),
        LlcpPacket::LengthRsp(_) => (CommonProc::DataLengthUpdate, Response),
        LlcpPacket::MinUsedChannelsInd(_) => (CommonProc::SetMinUsedChannels, Request),
        LlcpPacket::PeriodicSyncInd(_) => (CommonProc::PeriodicSyncTransfer, Request),
        LlcpPacket::ClockAccuracyReq(_) => (CommonProc::RequestPeerSca, Request),
        LlcpPacket::ClockAccuracyRsp(_) => (CommonProc::RequestPeerSca, Response),
        _ => return None,
    })
}

/// The procedure waits for a peer response, possibly while overridden.
fn awaiting(conn: &Connection, kind: ProcKind) -> bool {
    conn.llcp.is_active(kind) || conn.llcp.overridden.contains(kind)
}

/// Start a gated procedure, called once it is active.
pub fn start(conn: &mut Connection, env: &Env<'_>, kind: ProcKind) {
    match CommonProc::from_kind(kind) {
        Some(proc) => proc.send_request(conn, env),
        None => warn!("conn {}: {:?} is not a gated procedure", conn.handle(), kind),
    }
}

/// Process a PDU of a gated procedure.
pub fn on_pdu(conn: &mut Connection, env: &Env<'_>, packet: LlcpPacket) {
    let Some((proc, role)) = classify(conn, &packet) else {
        return warn!("conn {}: unexpected {:?}", conn.handle(), packet.opcode());
    };
    let kind = proc.kind();
    let event = match role {
        PduRole::Indication => EngineEvent::RxIndication,
        PduRole::Request => EngineEvent::RxRequest,
        PduRole::Response => EngineEvent::RxResponse,
    };
    let same = awaiting(conn, kind);
    let gate = match conn.llcp.gate() {
        // An overridden procedure still owns its responses.
        Gate::Idle if same => Gate::Busy,
        gate => gate,
    };

    match transition(gate, event, same, false).0 {
        EngineAction::Receive => {
            conn.llcp.active = Some(kind);
            proc.receive_request(conn, env, &packet);
        }
        EngineAction::MarkIncomplete => {
            debug!("conn {}: {:?} incomplete behind {:?}", conn.handle(), kind, conn.llcp.active);
            conn.llcp.incomp.insert(kind);
            proc.receive_request(conn, env, &packet);
        }
        EngineAction::Respond => {
            proc.receive_request(conn, env, &packet);
            if !conn.close_requested {
                proc.send_response(conn, env);
            }
        }
        EngineAction::Finish => proc.receive_response(conn, env, &packet),
        action => {
            debug!("conn {}: {:?} dropped ({:?})", conn.handle(), packet.opcode(), action)
        }
    }
}

/// A gated procedure was rejected by the peer.
pub fn on_reject(conn: &mut Connection, env: &Env<'_>, kind: ProcKind, reason: ErrorCode) {
    procedure::complete(conn, env, kind, reason)
}

/// The peer does not know the procedure.
pub fn on_unknown_rsp(conn: &mut Connection, env: &Env<'_>, kind: ProcKind) {
    if let Some(bit) = CommonProc::from_kind(kind).and_then(|proc| proc.feature(conn.role)) {
        conn.clear_used_feature(bit);
    }
    procedure::complete(conn, env, kind, ErrorCode::UnsupportedRemoteFeature)
}

/// A gated indication was acknowledged by the peer.
pub fn on_tx_acked(conn: &mut Connection, env: &Env<'_>, opcode: Opcode) {
    match opcode {
        Opcode::TerminateInd if conn.llcp.is_active(ProcKind::Termination) => {
            conn.force_terminate(ErrorCode::ConnectionTerminatedByLocalHost)
        }
        Opcode::MinUsedChannelsInd => {
            procedure::complete(conn, env, ProcKind::SetMinUsedChannels, ErrorCode::Success)
        }
        Opcode::PeriodicSyncInd => {
            procedure::complete(conn, env, ProcKind::PeriodicSyncTransfer, ErrorCode::Success)
        }
        _ => (),
    }
}

/// The new channel map was applied at its instant.
pub fn on_instant(conn: &mut Connection, env: &Env<'_>) {
    procedure::complete(conn, env, ProcKind::ChannelMapUpdate, ErrorCode::Success)
}

/// Completion event of a gated procedure.
pub fn notify_host(conn: &mut Connection, env: &Env<'_>, kind: ProcKind, status: ErrorCode) {
    let connection_handle = conn.handle();
    let event = match kind {
        ProcKind::FeatureExchange => hci::Event::LeReadRemoteFeaturesComplete {
            status,
            connection_handle,
            le_features: match status {
                ErrorCode::Success => conn.peer_features.unwrap_or(0),
                _ => 0,
            },
        },
        ProcKind::VersionExchange => {
            let version = conn.peer_version.filter(|_| status == ErrorCode::Success);
            hci::Event::ReadRemoteVersionInformationComplete {
                status,
                connection_handle,
                version: version.map_or(0, |v| v.version),
                manufacturer_name: version.map_or(0, |v| v.company_id),
                subversion: version.map_or(0, |v| v.subversion),
            }
        }
        ProcKind::SetMinUsedChannels => {
            hci::Event::LeMinUsedChannelsComplete { status, connection_handle }
        }
        ProcKind::PeriodicSyncTransfer => {
            hci::Event::LePeriodicAdvertisingSyncTransferComplete { status, connection_handle }
        }
        ProcKind::RequestPeerSca => hci::Event::LeRequestPeerScaComplete {
            status,
            connection_handle,
            peer_clock_accuracy: conn.peer_sca.unwrap_or(0),
        },
        // Reported through LE Data Length Change.
        _ => return,
    };
    env.ops.send_hci_event(event);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llcp::test::{central, peripheral, TestContext};

    const GATES: [Gate; 2] = [Gate::Idle, Gate::Busy];
    const EVENTS: [EngineEvent; 8] = [
        EngineEvent::HostStart,
        EngineEvent::InternalStart,
        EngineEvent::Resume,
        EngineEvent::RxIndication,
        EngineEvent::RxRequest,
        EngineEvent::RxResponse,
        EngineEvent::Complete,
        EngineEvent::Reject,
    ];

    #[test]
    fn transition_table() {
        for gate in GATES {
            for event in EVENTS {
                for same in [false, true] {
                    for can_override in [false, true] {
                        let (action, next) = transition(gate, event, same, can_override);
                        match action {
                            EngineAction::Start => {
                                assert_eq!(gate, Gate::Idle);
                                assert_eq!(next, Gate::Busy);
                            }
                            EngineAction::Pend | EngineAction::MarkIncomplete => {
                                assert_eq!((gate, next), (Gate::Busy, Gate::Busy));
                                assert!(!same);
                            }
                            EngineAction::Override => {
                                assert_eq!(gate, Gate::Busy);
                                assert!(can_override && !same);
                            }
                            EngineAction::Finish => {
                                assert_eq!((gate, next), (Gate::Busy, Gate::Idle));
                                assert!(same);
                            }
                            EngineAction::Respond | EngineAction::Ignore => {
                                assert_eq!(gate, next)
                            }
                            EngineAction::Receive => assert_eq!(next, Gate::Busy),
                        }
                    }
                }
            }
        }
    }

    #[test]
    fn start_from_idle_and_pend_when_busy() {
        use EngineAction::*;
        use EngineEvent::*;
        assert_eq!(transition(Gate::Idle, HostStart, false, false), (Start, Gate::Busy));
        assert_eq!(transition(Gate::Busy, HostStart, false, false).0, Pend);
        assert_eq!(transition(Gate::Busy, HostStart, true, false).0, Ignore);
        assert_eq!(transition(Gate::Busy, InternalStart, false, true).0, Override);
        assert_eq!(transition(Gate::Busy, Resume, false, true).0, Pend);
        assert_eq!(transition(Gate::Busy, Resume, true, false).0, Ignore);
        assert_eq!(transition(Gate::Busy, RxIndication, false, false).0, MarkIncomplete);
        assert_eq!(transition(Gate::Busy, RxRequest, false, true).0, Override);
        assert_eq!(transition(Gate::Idle, RxResponse, false, false).0, Ignore);
    }

    #[test]
    fn every_gated_kind_maps_back() {
        for kind in ProcKind::ALL {
            if let Some(proc) = CommonProc::from_kind(kind) {
                assert_eq!(proc.kind(), kind);
            }
        }
        assert_eq!(CommonProc::from_kind(ProcKind::PhyUpdate), None);
        assert_eq!(CommonProc::ChannelMapUpdate.completion(), Completion::OnInstant);
    }

    #[test]
    fn length_values_are_clamped() {
        let length = sanitize_length(Length {
            max_rx_octets: 10,
            max_rx_time: 20_000,
            max_tx_octets: 300,
            max_tx_time: 1000,
        });
        assert_eq!(length.max_rx_octets, MIN_DATA_OCTETS);
        assert_eq!(length.max_rx_time, MAX_DATA_TIME);
        assert_eq!(length.max_tx_octets, MAX_DATA_OCTETS);
        assert_eq!(length.max_tx_time, 1000);
    }

    #[test]
    fn peer_version_is_answered_once() {
        let ctx = TestContext::new();
        let mut conn = peripheral(&ctx);
        let env = ctx.env();
        let peer = VersionInd { version: 0x0b, company_id: 0x0002, subversion: 0x1234 };

        on_pdu(&mut conn, &env, peer.into());
        assert_eq!(conn.peer_version, Some(peer));
        assert!(matches!(ctx.take_llcp(&mut conn).as_slice(), [LlcpPacket::VersionInd(_)]));

        on_pdu(&mut conn, &env, peer.into());
        assert!(ctx.take_llcp(&mut conn).is_empty());
        assert_eq!(conn.llcp.active, None);
    }

    #[test]
    fn peer_length_request_updates_effective_values() {
        let ctx = TestContext::new();
        let mut conn = peripheral(&ctx);
        let env = ctx.env();
        conn.data_length.local_max_tx_octets = 251;
        conn.data_length.local_max_tx_time = 2120;

        let peer =
            Length { max_rx_octets: 100, max_rx_time: 900, max_tx_octets: 27, max_tx_time: 328 };
        on_pdu(&mut conn, &env, LengthReq(peer).into());
        assert!(conn.arq.force_start_frag);

        assert!(matches!(ctx.take_llcp(&mut conn).as_slice(), [LlcpPacket::LengthRsp(_)]));
        assert_eq!(conn.data_length.eff_max_tx_octets, 100);
        assert_eq!(conn.data_length.eff_max_tx_time, 900);
        assert!(matches!(
            ctx.take_events().as_slice(),
            [hci::Event::LeDataLengthChange { max_tx_octets: 100, .. }]
        ));
    }

    #[test]
    fn channel_map_indication_waits_for_instant() {
        let ctx = TestContext::new();
        let mut conn = peripheral(&ctx);
        let env = ctx.env();
        conn.timing.event_counter = 10;

        let ind = ChannelMapInd { channel_map: 0x1f_0000_0003, instant: 20 };
        on_pdu(&mut conn, &env, ind.into());
        assert_eq!(conn.llcp.active, Some(ProcKind::ChannelMapUpdate));
        assert_eq!(conn.instants.chan_map.map(|(_, instant)| instant), Some(20));

        on_instant(&mut conn, &env);
        assert_eq!(conn.llcp.active, None);
        assert!(ctx.take_events().is_empty());
    }

    #[test]
    fn channel_map_indication_behind_active_procedure_is_incomplete() {
        let ctx = TestContext::new();
        let mut conn = peripheral(&ctx);
        let env = ctx.env();
        conn.llcp.active = Some(ProcKind::DataLengthUpdate);

        let ind = ChannelMapInd { channel_map: 0x3, instant: 20 };
        on_pdu(&mut conn, &env, ind.into());
        assert!(conn.llcp.incomp.contains(ProcKind::ChannelMapUpdate));
        assert_eq!(conn.llcp.active, Some(ProcKind::DataLengthUpdate));

        on_instant(&mut conn, &env);
        assert!(conn.llcp.incomp.is_empty());
        assert_eq!(conn.llcp.active, Some(ProcKind::DataLengthUpdate));
    }

    #[test]
    fn channel_map_with_passed_instant_terminates() {
        let ctx = TestContext::new();
        let mut conn = peripheral(&ctx);
        let env = ctx.env();
        conn.timing.event_counter = 100;

        on_pdu(&mut conn, &env, ChannelMapInd { channel_map: 0x3, instant: 90 }.into());
        assert!(conn.close_requested);
        assert_eq!(conn.term_reason, ErrorCode::InstantPassed);
    }

    #[test]
    fn peer_termination_closes_after_ack() {
        let ctx = TestContext::new();
        let mut conn = peripheral(&ctx);
        let env = ctx.env();

        on_pdu(&mut conn, &env, TerminateInd { error_code: 0x13 }.into());
        assert!(conn.is_terminating());
        assert!(conn.close_after_tx);
        assert_eq!(conn.term_reason, ErrorCode::RemoteUserTerminatedConnection);
        assert_eq!(conn.llcp.active, Some(ProcKind::Termination));
    }

    #[test]
    fn peer_termination_interrupts_active_procedure() {
        let ctx = TestContext::new();
        let mut conn = central(&ctx);
        let env = ctx.env();
        procedure::start(&mut conn, &env, ProcKind::FeatureExchange, Origin::Host).unwrap();
        assert!(matches!(ctx.take_llcp(&mut conn).as_slice(), [LlcpPacket::FeatureReq(_)]));
        assert!(ctx.timer(conn.id, TimerKind::LlcpResponse).is_some());

        on_pdu(&mut conn, &env, TerminateInd { error_code: 0x13 }.into());
        assert!(conn.is_terminating());
        assert_eq!(conn.llcp.active, Some(ProcKind::Termination));
        assert!(conn.llcp.incomp.is_empty());
        assert!(!conn.llcp.rsp_timer_armed);
        assert_eq!(ctx.timer(conn.id, TimerKind::LlcpResponse), None);
        // Answered when the link closes.
        assert!(conn.llcp.notify.contains(ProcKind::FeatureExchange));
    }
}
