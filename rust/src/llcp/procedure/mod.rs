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

//! LL control procedures, Bluetooth Core, Vol 6, Part B, 5.1.
//!
//! A single procedure is active on a connection at any time. Others
//! wait in the pending set, or in the incomplete set when the peer
//! started them while the gate was busy.

use bytes::Bytes;
use log::{debug, warn};

use crate::llcp::conn::Connection;
use crate::llcp::manager::LinkLayerError;
use crate::llcp::Env;
use crate::ops::TimerKind;
use crate::packets::hci::{ErrorCode, LlFeaturesBits, Role};
use crate::packets::llcp::{
    DecodeError, LlcpPacket, Opcode, RejectExtInd, RejectInd, UnknownRsp,
};

pub mod common;
pub mod conn_update;
pub mod encryption;
pub mod phy_update;

use common::{EngineAction, EngineEvent, Gate};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ProcKind {
    Termination,
    ConnUpdate,
    ConnParam,
    ChannelMapUpdate,
    PhyUpdate,
    Encryption,
    FeatureExchange,
    VersionExchange,
    DataLengthUpdate,
    SetMinUsedChannels,
    PeriodicSyncTransfer,
    RequestPeerSca,
    LePing,
}

impl ProcKind {
    /// All procedures, by decreasing resume priority.
    pub const ALL: [ProcKind; 13] = [
        ProcKind::Termination,
        ProcKind::ConnUpdate,
        ProcKind::ConnParam,
        ProcKind::ChannelMapUpdate,
        ProcKind::PhyUpdate,
        ProcKind::Encryption,
        ProcKind::FeatureExchange,
        ProcKind::VersionExchange,
        ProcKind::DataLengthUpdate,
        ProcKind::SetMinUsedChannels,
        ProcKind::PeriodicSyncTransfer,
        ProcKind::RequestPeerSca,
        ProcKind::LePing,
    ];

    fn bit(self) -> u16 {
        1 << (self as u16)
    }

    /// Procedures that apply a change at a connection event instant.
    pub fn has_instant(self) -> bool {
        matches!(
            self,
            ProcKind::ConnUpdate
                | ProcKind::ConnParam
                | ProcKind::ChannelMapUpdate
                | ProcKind::PhyUpdate
        )
    }

    /// Procedures that an incoming instant procedure may interrupt.
    pub fn can_be_overridden(self) -> bool {
        matches!(
            self,
            ProcKind::FeatureExchange
                | ProcKind::VersionExchange
                | ProcKind::DataLengthUpdate
                | ProcKind::RequestPeerSca
        )
    }
}

/// Set of procedures.
#[derive(Clone, Copy, Default, PartialEq, Eq)]
pub struct ProcSet(u16);

impl ProcSet {
    pub const EMPTY: ProcSet = ProcSet(0);

    pub fn contains(self, kind: ProcKind) -> bool {
        self.0 & kind.bit() != 0
    }

    pub fn insert(&mut self, kind: ProcKind) {
        self.0 |= kind.bit();
    }

    /// Returns true when the procedure was in the set.
    pub fn remove(&mut self, kind: ProcKind) -> bool {
        let present = self.contains(kind);
        self.0 &= !kind.bit();
        present
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Member with the highest resume priority.
    pub fn first(self) -> Option<ProcKind> {
        self.iter().next()
    }

    pub fn take_first(&mut self) -> Option<ProcKind> {
        let first = self.first()?;
        self.remove(first);
        Some(first)
    }

    pub fn iter(self) -> impl Iterator<Item = ProcKind> {
        ProcKind::ALL.into_iter().filter(move |kind| self.contains(*kind))
    }
}

impl std::fmt::Debug for ProcSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_set().entries(self.iter()).finish()
    }
}

/// Who asked for a procedure.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Origin {
    Host,
    Internal,
    Peer,
}

/// LLCP bookkeeping of a connection.
#[derive(Debug)]
pub struct Llcp {
    pub active: Option<ProcKind>,
    pub pend: ProcSet,
    pub incomp: ProcSet,
    /// Procedures started by the host, which expects a completion event.
    pub notify: ProcSet,
    pub overridden: ProcSet,
    /// Instants reached and not yet processed by the task context.
    pub instants_reached: ProcSet,
    pub rsp_timer_armed: bool,
    pub common: common::CommonState,
    pub conn_update: conn_update::ConnUpdate,
    pub phy: phy_update::PhyUpdate,
    pub enc: encryption::Encryption,
    pub ping: encryption::Ping,
}

impl Default for Llcp {
    fn default() -> Self {
        Llcp::new()
    }
}

impl Llcp {
    pub fn new() -> Self {
        Llcp {
            active: None,
            pend: ProcSet::EMPTY,
            incomp: ProcSet::EMPTY,
            notify: ProcSet::EMPTY,
            overridden: ProcSet::EMPTY,
            instants_reached: ProcSet::EMPTY,
            rsp_timer_armed: false,
            common: common::CommonState::default(),
            conn_update: conn_update::ConnUpdate::default(),
            phy: phy_update::PhyUpdate::default(),
            enc: encryption::Encryption::default(),
            ping: encryption::Ping::default(),
        }
    }

    pub fn gate(&self) -> Gate {
        match self.active {
            Some(_) => Gate::Busy,
            None => Gate::Idle,
        }
    }

    pub fn is_active(&self, kind: ProcKind) -> bool {
        self.active == Some(kind)
    }

    pub fn mark_pending(&mut self, kind: ProcKind) {
        debug!("llcp: {:?} pending behind {:?}", kind, self.active);
        self.pend.insert(kind);
    }

    /// Next procedure to resume: termination first, then incomplete
    /// procedures, then pending ones. The flag is set for incomplete
    /// procedures.
    pub fn take_next_pending(&mut self) -> Option<(ProcKind, bool)> {
        if self.incomp.remove(ProcKind::Termination) {
            self.pend.remove(ProcKind::Termination);
            return Some((ProcKind::Termination, true));
        }
        if self.pend.remove(ProcKind::Termination) {
            return Some((ProcKind::Termination, false));
        }
        match self.incomp.take_first() {
            Some(kind) => Some((kind, true)),
            None => self.pend.take_first().map(|kind| (kind, false)),
        }
    }

    /// Any procedure is running or waiting.
    pub fn is_idle(&self) -> bool {
        self.active.is_none() && self.pend.is_empty() && self.incomp.is_empty()
    }
}

/// Reasons a procedure cannot be started on a connection.
fn check_available(conn: &Connection, kind: ProcKind) -> Result<(), LinkLayerError> {
    let local = |bit| conn.supports_locally(bit);
    let used = |bit| conn.supports(bit);
    let central = conn.role == Role::Central;

    match kind {
        ProcKind::Termination | ProcKind::VersionExchange => Ok(()),
        ProcKind::ConnUpdate if !central => Err(LinkLayerError::CommandDisallowed),
        ProcKind::ConnUpdate => Ok(()),
        ProcKind::ConnParam if !local(LlFeaturesBits::ConnectionParametersRequestProcedure) => {
            Err(LinkLayerError::UnsupportedFeature)
        }
        ProcKind::ConnParam if !used(LlFeaturesBits::ConnectionParametersRequestProcedure) => {
            Err(LinkLayerError::UnsupportedRemoteFeature)
        }
        ProcKind::ConnParam => Ok(()),
        ProcKind::ChannelMapUpdate if !central => Err(LinkLayerError::CommandDisallowed),
        ProcKind::ChannelMapUpdate => Ok(()),
        ProcKind::FeatureExchange
            if !central && !local(LlFeaturesBits::PeripheralInitiatedFeaturesExchange) =>
        {
            Err(LinkLayerError::UnsupportedFeature)
        }
        ProcKind::FeatureExchange => Ok(()),
        ProcKind::DataLengthUpdate if !local(LlFeaturesBits::LeDataPacketLengthExtension) => {
            Err(LinkLayerError::UnsupportedFeature)
        }
        ProcKind::DataLengthUpdate if !used(LlFeaturesBits::LeDataPacketLengthExtension) => {
            Err(LinkLayerError::UnsupportedRemoteFeature)
        }
        ProcKind::DataLengthUpdate => Ok(()),
        ProcKind::SetMinUsedChannels if central => Err(LinkLayerError::CommandDisallowed),
        ProcKind::SetMinUsedChannels
            if !used(LlFeaturesBits::MinimumNumberOfUsedChannelsProcedure) =>
        {
            Err(LinkLayerError::UnsupportedRemoteFeature)
        }
        ProcKind::SetMinUsedChannels => Ok(()),
        ProcKind::PeriodicSyncTransfer
            if !local(LlFeaturesBits::PeriodicAdvertisingSyncTransferSender) =>
        {
            Err(LinkLayerError::UnsupportedFeature)
        }
        ProcKind::PeriodicSyncTransfer
            if conn
                .peer_features
                .is_some_and(|features| {
                    features
                        & u64::from(LlFeaturesBits::PeriodicAdvertisingSyncTransferRecipient)
                        == 0
                }) =>
        {
            Err(LinkLayerError::UnsupportedRemoteFeature)
        }
        ProcKind::PeriodicSyncTransfer => Ok(()),
        ProcKind::RequestPeerSca if !local(LlFeaturesBits::SleepClockAccuracyUpdates) => {
            Err(LinkLayerError::UnsupportedFeature)
        }
        ProcKind::RequestPeerSca if !used(LlFeaturesBits::SleepClockAccuracyUpdates) => {
            Err(LinkLayerError::UnsupportedRemoteFeature)
        }
        ProcKind::RequestPeerSca => Ok(()),
        ProcKind::PhyUpdate
            if !local(LlFeaturesBits::Le2mPhy) && !local(LlFeaturesBits::LeCodedPhy) =>
        {
            Err(LinkLayerError::UnsupportedFeature)
        }
        ProcKind::PhyUpdate
            if !used(LlFeaturesBits::Le2mPhy) && !used(LlFeaturesBits::LeCodedPhy) =>
        {
            Err(LinkLayerError::UnsupportedRemoteFeature)
        }
        ProcKind::PhyUpdate => Ok(()),
        ProcKind::Encryption if !central => Err(LinkLayerError::CommandDisallowed),
        ProcKind::Encryption if !local(LlFeaturesBits::LeEncryption) => {
            Err(LinkLayerError::UnsupportedFeature)
        }
        ProcKind::Encryption if !used(LlFeaturesBits::LeEncryption) => {
            Err(LinkLayerError::UnsupportedRemoteFeature)
        }
        ProcKind::Encryption => Ok(()),
        ProcKind::LePing if !conn.is_encrypted() => Err(LinkLayerError::CommandDisallowed),
        ProcKind::LePing => Ok(()),
    }
}

/// Start a procedure, or record it until the active one completes.
pub fn start(
    conn: &mut Connection,
    env: &Env<'_>,
    kind: ProcKind,
    origin: Origin,
) -> Result<(), LinkLayerError> {
    if conn.is_terminating() {
        return Err(LinkLayerError::CommandDisallowed);
    }
    check_available(conn, kind)?;

    if origin == Origin::Host {
        conn.llcp.notify.insert(kind);
    }
    let event = match origin {
        Origin::Host => EngineEvent::HostStart,
        Origin::Internal | Origin::Peer => EngineEvent::InternalStart,
    };
    let same = conn.llcp.is_active(kind);
    let can_override = kind == ProcKind::Termination;
    let (action, _) = common::transition(conn.llcp.gate(), event, same, can_override);
    match action {
        EngineAction::Start => begin(conn, env, kind),
        EngineAction::Override => override_active(conn, env, kind),
        EngineAction::Pend => conn.llcp.mark_pending(kind),
        _ => debug!("conn {}: {:?} already active", conn.handle(), kind),
    }
    Ok(())
}

/// Make `kind` the active procedure and send its first PDU.
fn begin(conn: &mut Connection, env: &Env<'_>, kind: ProcKind) {
    debug!("conn {}: start {:?}", conn.handle(), kind);
    conn.llcp.active = Some(kind);
    match kind {
        ProcKind::ConnUpdate | ProcKind::ConnParam => conn_update::start(conn, env, kind),
        ProcKind::PhyUpdate => phy_update::start(conn, env),
        ProcKind::Encryption => encryption::start(conn, env),
        ProcKind::LePing => encryption::start_ping(conn, env),
        _ => common::start(conn, env, kind),
    }
}

/// Interrupt the active procedure in favor of `kind`. The interrupted
/// procedure resumes where it stopped once `kind` completes.
pub fn override_active(conn: &mut Connection, env: &Env<'_>, kind: ProcKind) {
    if let Some(active) = conn.llcp.active.take() {
        debug!("conn {}: {:?} overrides {:?}", conn.handle(), kind, active);
        stop_response_timer(conn, env);
        conn.llcp.pend.insert(active);
        conn.llcp.overridden.insert(active);
    }
    begin(conn, env, kind);
}

/// Make `kind` active for a procedure started by the peer. Returns
/// false when the gate is busy with a procedure that cannot be
/// interrupted.
pub fn accept_peer_procedure(conn: &mut Connection, env: &Env<'_>, kind: ProcKind) -> bool {
    let can_override = kind.has_instant()
        && conn.llcp.active.is_some_and(|active| active.can_be_overridden());
    let same = conn.llcp.is_active(kind);
    match common::transition(conn.llcp.gate(), EngineEvent::RxRequest, same, can_override).0 {
        EngineAction::Override => {
            if let Some(active) = conn.llcp.active.take() {
                debug!("conn {}: peer {:?} overrides {:?}", conn.handle(), kind, active);
                stop_response_timer(conn, env);
                conn.llcp.pend.insert(active);
                conn.llcp.overridden.insert(active);
            }
            conn.llcp.active = Some(kind);
            true
        }
        EngineAction::Respond if same || conn.llcp.active.is_none() => {
            conn.llcp.active = Some(kind);
            true
        }
        _ => false,
    }
}

/// Complete the active procedure, notifying the host if it started it.
pub fn complete(conn: &mut Connection, env: &Env<'_>, kind: ProcKind, status: ErrorCode) {
    let notify = conn.llcp.notify.contains(kind);
    finish(conn, env, kind, status, notify)
}

/// Complete the active procedure, always notifying the host.
pub fn complete_and_notify(
    conn: &mut Connection,
    env: &Env<'_>,
    kind: ProcKind,
    status: ErrorCode,
) {
    finish(conn, env, kind, status, true)
}

fn finish(conn: &mut Connection, env: &Env<'_>, kind: ProcKind, status: ErrorCode, notify: bool) {
    if conn.llcp.incomp.remove(kind) {
        debug!("conn {}: incomplete {:?} done", conn.handle(), kind);
    } else if conn.llcp.overridden.contains(kind) {
        debug!("conn {}: overridden {:?} done", conn.handle(), kind);
        conn.llcp.pend.remove(kind);
    } else if conn.llcp.is_active(kind) {
        debug!("conn {}: {:?} complete ({})", conn.handle(), kind, status);
        stop_response_timer(conn, env);
        conn.llcp.active = None;
    } else {
        debug!("conn {}: {:?} completed while not active", conn.handle(), kind);
    }
    conn.llcp.notify.remove(kind);
    conn.llcp.overridden.remove(kind);
    if notify {
        notify_host(conn, env, kind, status);
    }
    start_pending(conn, env);
}

/// Host completion event of a procedure.
pub fn notify_host(conn: &mut Connection, env: &Env<'_>, kind: ProcKind, status: ErrorCode) {
    match kind {
        ProcKind::ConnUpdate | ProcKind::ConnParam => conn_update::notify_host(conn, env, status),
        ProcKind::PhyUpdate => phy_update::notify_host(conn, env, status),
        ProcKind::Encryption => encryption::notify_host(conn, env, status),
        ProcKind::LePing | ProcKind::Termination => (),
        _ => common::notify_host(conn, env, kind, status),
    }
}

/// Resume the next pending or incomplete procedure, if the gate is
/// idle. Once terminating, only the termination is resumed.
pub fn start_pending(conn: &mut Connection, env: &Env<'_>) {
    if conn.llcp.active.is_some() || conn.close_requested {
        return;
    }
    if conn.is_terminating() {
        if conn.llcp.incomp.remove(ProcKind::Termination) {
            conn.llcp.active = Some(ProcKind::Termination);
        } else if conn.llcp.pend.remove(ProcKind::Termination) {
            begin(conn, env, ProcKind::Termination);
        }
        return;
    }
    let Some((kind, incomplete)) = conn.llcp.take_next_pending() else {
        return;
    };

    if incomplete {
        debug!("conn {}: {:?} back from incomplete", conn.handle(), kind);
        conn.llcp.active = Some(kind);
    } else if conn.llcp.overridden.remove(kind) {
        debug!("conn {}: resume {:?}", conn.handle(), kind);
        conn.llcp.active = Some(kind);
        arm_response_timer(conn, env);
    } else if let Err(err) = check_available(conn, kind) {
        debug!("conn {}: dropping pending {:?}: {}", conn.handle(), kind, err);
        if conn.llcp.notify.remove(kind) {
            notify_host(conn, env, kind, err.status());
        }
        start_pending(conn, env)
    } else {
        begin(conn, env, kind)
    }
}

pub fn arm_response_timer(conn: &mut Connection, env: &Env<'_>) {
    conn.llcp.rsp_timer_armed = true;
    env.ops.start_timer(conn.id, TimerKind::LlcpResponse, env.config.llcp_response_timeout_ms);
}

pub fn stop_response_timer(conn: &mut Connection, env: &Env<'_>) {
    if std::mem::take(&mut conn.llcp.rsp_timer_armed) {
        env.ops.stop_timer(conn.id, TimerKind::LlcpResponse);
    }
}

/// Bluetooth Core, Vol 6, Part B, 5.1.1: only valid PDUs for the local
/// role are processed.
fn valid_for_role(opcode: Opcode, role: Role) -> bool {
    match role {
        Role::Central => !matches!(
            opcode,
            Opcode::ConnectionUpdateInd
                | Opcode::ChannelMapInd
                | Opcode::PhyUpdateInd
                | Opcode::EncReq
                | Opcode::PauseEncReq
                | Opcode::FeatureReq
        ),
        Role::Peripheral => !matches!(
            opcode,
            Opcode::ConnectionParamRsp
                | Opcode::EncRsp
                | Opcode::PhyRsp
                | Opcode::MinUsedChannelsInd
                | Opcode::PeripheralFeatureReq
        ),
    }
}

pub fn send_reject(conn: &mut Connection, opcode: Opcode, reason: ErrorCode) {
    if conn.supports(LlFeaturesBits::ExtendedRejectIndication) {
        conn.send_llcp(RejectExtInd { reject_opcode: opcode as u8, error_code: reason as u8 });
    } else {
        conn.send_llcp(RejectInd { error_code: reason as u8 });
    }
}

/// Process a received LL Control PDU.
pub fn on_control_pdu(conn: &mut Connection, env: &Env<'_>, payload: &Bytes) {
    if conn.close_requested {
        return;
    }
    let packet = match LlcpPacket::parse(payload) {
        Ok(packet) => packet,
        Err(DecodeError::UnknownOpcode(opcode)) => {
            warn!("conn {}: unknown LLCP opcode 0x{:02x}", conn.handle(), opcode);
            return conn.send_llcp(UnknownRsp { unknown_type: opcode });
        }
        Err(DecodeError::InvalidLength { opcode, length }) => {
            warn!("conn {}: invalid length {} for {:?}", conn.handle(), length, opcode);
            return send_reject(conn, opcode, ErrorCode::InvalidLmpOrLlParameters);
        }
        Err(err) => {
            warn!("conn {}: dropping LLCP PDU: {}", conn.handle(), err);
            return;
        }
    };
    debug!("conn {}: <- {:?}", conn.handle(), packet);

    let opcode = packet.opcode();
    if conn.is_terminating() && opcode != Opcode::TerminateInd {
        debug!("conn {}: ignoring {:?} while terminating", conn.handle(), opcode);
        return;
    }
    if !valid_for_role(opcode, conn.role) {
        warn!("conn {}: {:?} not valid for {:?}", conn.handle(), opcode, conn.role);
        return conn.send_llcp(UnknownRsp { unknown_type: opcode as u8 });
    }
    if !encryption::rx_allowed(conn, opcode) {
        warn!("conn {}: {:?} out of encryption sequence", conn.handle(), opcode);
        return conn.force_terminate(ErrorCode::ConnectionTerminatedDueToMicFailure);
    }

    match packet {
        LlcpPacket::ConnectionUpdateInd(_)
        | LlcpPacket::ConnectionParamReq(_)
        | LlcpPacket::ConnectionParamRsp(_) => conn_update::on_pdu(conn, env, packet),
        LlcpPacket::PhyReq(_) | LlcpPacket::PhyRsp(_) | LlcpPacket::PhyUpdateInd(_) => {
            phy_update::on_pdu(conn, env, packet)
        }
        LlcpPacket::EncReq(_)
        | LlcpPacket::EncRsp(_)
        | LlcpPacket::StartEncReq
        | LlcpPacket::StartEncRsp
        | LlcpPacket::PauseEncReq
        | LlcpPacket::PauseEncRsp => encryption::on_pdu(conn, env, packet),
        LlcpPacket::PingReq | LlcpPacket::PingRsp => encryption::on_ping_pdu(conn, env, packet),
        LlcpPacket::RejectInd(pdu) => {
            on_reject(conn, env, None, ErrorCode::from_reason(pdu.error_code))
        }
        LlcpPacket::RejectExtInd(pdu) => on_reject(
            conn,
            env,
            num_traits::FromPrimitive::from_u8(pdu.reject_opcode),
            ErrorCode::from_reason(pdu.error_code),
        ),
        LlcpPacket::UnknownRsp(pdu) => on_unknown_rsp(conn, env, pdu.unknown_type),
        packet => common::on_pdu(conn, env, packet),
    }
}

/// Owner of a control PDU opcode.
fn proc_for_opcode(opcode: Opcode) -> Option<ProcKind> {
    Some(match opcode {
        Opcode::ConnectionUpdateInd => ProcKind::ConnUpdate,
        Opcode::ConnectionParamReq | Opcode::ConnectionParamRsp => ProcKind::ConnParam,
        Opcode::ChannelMapInd => ProcKind::ChannelMapUpdate,
        Opcode::TerminateInd => ProcKind::Termination,
        Opcode::EncReq
        | Opcode::EncRsp
        | Opcode::StartEncReq
        | Opcode::StartEncRsp
        | Opcode::PauseEncReq
        | Opcode::PauseEncRsp => ProcKind::Encryption,
        Opcode::FeatureReq | Opcode::FeatureRsp | Opcode::PeripheralFeatureReq => {
            ProcKind::FeatureExchange
        }
        Opcode::VersionInd => ProcKind::VersionExchange,
        Opcode::PingReq | Opcode::PingRsp => ProcKind::LePing,
        Opcode::LengthReq | Opcode::LengthRsp => ProcKind::DataLengthUpdate,
        Opcode::PhyReq | Opcode::PhyRsp | Opcode::PhyUpdateInd => ProcKind::PhyUpdate,
        Opcode::MinUsedChannelsInd => ProcKind::SetMinUsedChannels,
        Opcode::PeriodicSyncInd => ProcKind::PeriodicSyncTransfer,
        Opcode::ClockAccuracyReq | Opcode::ClockAccuracyRsp => ProcKind::RequestPeerSca,
        Opcode::UnknownRsp | Opcode::RejectInd | Opcode::RejectExtInd => return None,
    })
}

/// LL_REJECT_IND or LL_REJECT_EXT_IND, routed to the active procedure.
fn on_reject(conn: &mut Connection, env: &Env<'_>, opcode: Option<Opcode>, reason: ErrorCode) {
    let target = opcode.and_then(proc_for_opcode).or(conn.llcp.active);
    let target = match (target, conn.llcp.active) {
        // LL_CONNECTION_PARAM_REQ may be answered by the update itself.
        (Some(ProcKind::ConnParam), Some(ProcKind::ConnUpdate)) => ProcKind::ConnUpdate,
        (Some(target), Some(active)) if target == active => active,
        (Some(ProcKind::Encryption), _) => ProcKind::Encryption,
        _ => {
            debug!("conn {}: reject for inactive {:?}", conn.handle(), target);
            return;
        }
    };
    match target {
        ProcKind::ConnUpdate | ProcKind::ConnParam => conn_update::on_reject(conn, env, reason),
        ProcKind::PhyUpdate => phy_update::on_reject(conn, env, reason),
        ProcKind::Encryption => encryption::on_reject(conn, env, reason),
        ProcKind::LePing => complete(conn, env, ProcKind::LePing, reason),
        kind => common::on_reject(conn, env, kind, reason),
    }
}

/// LL_UNKNOWN_RSP: the peer does not support the active procedure.
fn on_unknown_rsp(conn: &mut Connection, env: &Env<'_>, unknown_type: u8) {
    let opcode: Option<Opcode> = num_traits::FromPrimitive::from_u8(unknown_type);
    let Some(kind) = opcode.and_then(proc_for_opcode) else {
        return;
    };
    if !conn.llcp.is_active(kind) {
        debug!("conn {}: unknown response for inactive {:?}", conn.handle(), kind);
        return;
    }
    match kind {
        ProcKind::ConnParam => conn_update::on_unknown_rsp(conn, env),
        ProcKind::PhyUpdate => {
            conn.clear_used_feature(LlFeaturesBits::Le2mPhy);
            conn.clear_used_feature(LlFeaturesBits::LeCodedPhy);
            phy_update::on_reject(conn, env, ErrorCode::UnsupportedRemoteFeature)
        }
        ProcKind::Encryption => {
            conn.clear_used_feature(LlFeaturesBits::LeEncryption);
            encryption::on_reject(conn, env, ErrorCode::UnsupportedRemoteFeature)
        }
        ProcKind::LePing => {
            conn.clear_used_feature(LlFeaturesBits::LePing);
            complete(conn, env, kind, ErrorCode::UnsupportedRemoteFeature)
        }
        kind => common::on_unknown_rsp(conn, env, kind),
    }
}

/// A control PDU sent by us was acknowledged.
pub fn on_tx_acked(conn: &mut Connection, env: &Env<'_>, opcode: Opcode) {
    match opcode {
        Opcode::TerminateInd
        | Opcode::MinUsedChannelsInd
        | Opcode::PeriodicSyncInd => common::on_tx_acked(conn, env, opcode),
        _ => (),
    }
}

/// Data was acknowledged: procedures waiting for an empty ARQ queue
/// may proceed.
pub fn on_arq_progress(conn: &mut Connection, env: &Env<'_>) {
    if conn.arq.is_flushed() {
        phy_update::on_arq_flushed(conn, env);
        encryption::on_arq_flushed(conn, env);
    }
}

/// The scheduler applied the change of `kind` at its instant.
pub fn on_instant(conn: &mut Connection, env: &Env<'_>, kind: ProcKind) {
    match kind {
        ProcKind::ConnUpdate | ProcKind::ConnParam => conn_update::on_instant(conn, env),
        ProcKind::PhyUpdate => phy_update::on_instant(conn, env),
        ProcKind::ChannelMapUpdate => common::on_instant(conn, env),
        _ => (),
    }
}

pub fn on_response_timeout(conn: &mut Connection) {
    conn.llcp.rsp_timer_armed = false;
    match conn.llcp.active {
        Some(ProcKind::Termination) => {
            conn.force_terminate(ErrorCode::ConnectionTerminatedByLocalHost)
        }
        Some(kind) => {
            warn!("conn {}: {:?} timed out", conn.handle(), kind);
            conn.force_terminate(ErrorCode::LmpOrLlResponseTimeout);
        }
        None => (),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llcp::test::{central, TestContext};

    #[test]
    fn proc_set_priority_order() {
        let mut set = ProcSet::EMPTY;
        set.insert(ProcKind::VersionExchange);
        set.insert(ProcKind::PhyUpdate);
        set.insert(ProcKind::Termination);
        assert_eq!(set.take_first(), Some(ProcKind::Termination));
        assert_eq!(set.take_first(), Some(ProcKind::PhyUpdate));
        assert!(set.remove(ProcKind::VersionExchange));
        assert!(!set.remove(ProcKind::VersionExchange));
        assert!(set.is_empty());
    }

    #[test]
    fn incomplete_before_pending() {
        let mut llcp = Llcp::new();
        llcp.pend.insert(ProcKind::ConnUpdate);
        llcp.incomp.insert(ProcKind::ChannelMapUpdate);
        assert_eq!(llcp.take_next_pending(), Some((ProcKind::ChannelMapUpdate, true)));
        llcp.pend.insert(ProcKind::Termination);
        assert_eq!(llcp.take_next_pending(), Some((ProcKind::Termination, false)));
        assert_eq!(llcp.take_next_pending(), Some((ProcKind::ConnUpdate, false)));
        assert_eq!(llcp.take_next_pending(), None);
    }

    #[test]
    fn only_procedures_without_instant_are_overridden() {
        for kind in ProcKind::ALL {
            assert!(!(kind.has_instant() && kind.can_be_overridden()));
        }
        assert!(ProcKind::FeatureExchange.can_be_overridden());
        assert!(!ProcKind::Encryption.can_be_overridden());
    }

    #[test]
    fn start_pending_without_waiting_procedures_changes_nothing() {
        let ctx = TestContext::new();
        let mut conn = central(&ctx);
        let env = ctx.env();

        for active in [None, Some(ProcKind::FeatureExchange)] {
            conn.llcp.active = active;
            let gate = conn.llcp.gate();
            let masks = (conn.llcp.pend, conn.llcp.incomp, conn.llcp.notify, conn.llcp.overridden);
            let timers = ctx.timers.borrow().clone();

            start_pending(&mut conn, &env);
            start_pending(&mut conn, &env);

            assert_eq!(conn.llcp.active, active);
            assert_eq!(conn.llcp.gate(), gate);
            assert_eq!(
                (conn.llcp.pend, conn.llcp.incomp, conn.llcp.notify, conn.llcp.overridden),
                masks
            );
            assert_eq!(*ctx.timers.borrow(), timers);
            assert!(!conn.arq.has_pending_tx());
            assert!(ctx.take_events().is_empty());
        }
    }

    #[test]
    fn role_filter() {
        assert!(!valid_for_role(Opcode::ConnectionUpdateInd, Role::Central));
        assert!(valid_for_role(Opcode::ConnectionUpdateInd, Role::Peripheral));
        assert!(!valid_for_role(Opcode::PhyRsp, Role::Peripheral));
        assert!(valid_for_role(Opcode::TerminateInd, Role::Peripheral));
    }
}
