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

//! Bluetooth Core, Vol 6, Part B, 5.1.10
//!
//! Transmission of data is paused while the ARQ queue is flushed
//! ahead of LL_PHY_REQ, LL_PHY_RSP and LL_PHY_UPDATE_IND, and resumes
//! once they are queued.

use log::{debug, warn};

use crate::llcp::conn::Connection;
use crate::llcp::procedure::{self, ProcKind};
use crate::llcp::Env;
use crate::packets::hci::{self, ErrorCode, Phy, PhyMask, Role};
use crate::packets::llcp::{LlcpPacket, Opcode, PhyReq, PhyRsp, PhyUpdateInd};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum State {
    #[default]
    Idle,
    FlushBeforeReq,
    WaitRsp,
    FlushBeforeRsp,
    WaitUpdateInd,
    FlushBeforeInd,
    WaitInstant,
}

impl State {
    fn is_flushing(self) -> bool {
        matches!(self, State::FlushBeforeReq | State::FlushBeforeRsp | State::FlushBeforeInd)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Event {
    Start,
    RxPhyReq,
    RxPhyRsp,
    RxPhyUpdateInd,
    ArqFlushed,
    RxReject,
    Instant,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Action {
    Flush,
    SendPhyReq,
    SendPhyRsp,
    SendUpdateInd,
    RejectCollision,
    HoldPending,
    StoreUpdate,
    Complete,
    Ignore,
}

pub fn central_transition(state: State, event: Event) -> (Action, State) {
    use Action::*;
    use Event::*;
    use State::*;

    match (state, event) {
        (Idle, Start) => (Flush, FlushBeforeReq),
        (FlushBeforeReq, ArqFlushed) => (SendPhyReq, WaitRsp),
        (WaitRsp, RxPhyRsp) | (Idle, RxPhyReq) => (Flush, FlushBeforeInd),
        (FlushBeforeInd, ArqFlushed) => (SendUpdateInd, WaitInstant),
        (FlushBeforeReq | WaitRsp | FlushBeforeInd | WaitInstant, RxPhyReq) => {
            (RejectCollision, state)
        }
        (WaitRsp, RxReject) => (Complete, Idle),
        (WaitInstant, Instant) => (Complete, Idle),
        (state, _) => (Ignore, state),
    }
}

pub fn peripheral_transition(state: State, event: Event) -> (Action, State) {
    use Action::*;
    use Event::*;
    use State::*;

    match (state, event) {
        (Idle, Start) => (Flush, FlushBeforeReq),
        (FlushBeforeReq, ArqFlushed) => (SendPhyReq, WaitUpdateInd),
        (Idle, RxPhyReq) => (Flush, FlushBeforeRsp),
        (FlushBeforeRsp, ArqFlushed) => (SendPhyRsp, WaitUpdateInd),
        (Idle | WaitUpdateInd, RxPhyUpdateInd) => (StoreUpdate, WaitInstant),
        (FlushBeforeReq | WaitUpdateInd, RxPhyReq) => (HoldPending, state),
        (WaitUpdateInd, RxReject) => (Complete, Idle),
        (WaitInstant, Instant) => (Complete, Idle),
        (state, _) => (Ignore, state),
    }
}

#[derive(Debug, Default)]
pub struct PhyUpdate {
    pub state: State,
    /// Peer preferences from LL_PHY_REQ or LL_PHY_RSP.
    pub peer: Option<PhyReq>,
    /// Peer request held while the local one completes.
    pub held: bool,
    pub update: Option<PhyUpdateInd>,
    pub reason: Option<ErrorCode>,
    /// Set at the instant when a PHY changed.
    pub changed: bool,
    /// Set at the instant when the effective data length changed.
    pub length_changed: bool,
}

/// Central: PHYs of each direction, Bluetooth Core, Vol 6, Part B,
/// 5.1.10. A direction keeps its current PHY (encoded as 0) when
/// no common PHY changes it.
pub fn select_phys(
    tx_pref: PhyMask,
    rx_pref: PhyMask,
    peer: PhyReq,
    current: (Phy, Phy),
    symmetric: bool,
) -> (u8, u8) {
    let mut c_to_p = tx_pref.intersect(PhyMask(peer.rx_phys));
    let mut p_to_c = rx_pref.intersect(PhyMask(peer.tx_phys));
    if symmetric {
        let common = c_to_p.intersect(p_to_c);
        c_to_p = common;
        p_to_c = common;
    }
    let pick = |mask: PhyMask, current: Phy| match mask.select() {
        Some(phy) if phy != current => phy.mask().0,
        _ => 0,
    };
    (pick(c_to_p, current.0), pick(p_to_c, current.1))
}

fn step(conn: &mut Connection, env: &Env<'_>, event: Event) {
    let state = conn.llcp.phy.state;
    let (action, next) = match conn.role {
        Role::Central => central_transition(state, event),
        Role::Peripheral => peripheral_transition(state, event),
    };
    debug!(
        "conn {}: phy update {:?} {:?} -> {:?} {:?}",
        conn.handle(),
        state,
        event,
        action,
        next
    );
    conn.llcp.phy.state = next;
    act(conn, env, action);
}

fn act(conn: &mut Connection, env: &Env<'_>, action: Action) {
    match action {
        Action::Flush => {
            conn.arq.pause_tx_data();
            if conn.arq.is_flushed() {
                step(conn, env, Event::ArqFlushed);
            }
        }
        Action::SendPhyReq => {
            conn.arq.resume_tx_data();
            conn.phy.tx_restriction = Some(conn.phy.tx_pref);
            conn.send_llcp(PhyReq { tx_phys: conn.phy.tx_pref.0, rx_phys: conn.phy.rx_pref.0 });
            procedure::arm_response_timer(conn, env);
        }
        Action::SendPhyRsp => {
            conn.arq.resume_tx_data();
            conn.phy.tx_restriction = Some(conn.phy.tx_pref);
            conn.send_llcp(PhyRsp { tx_phys: conn.phy.tx_pref.0, rx_phys: conn.phy.rx_pref.0 });
            procedure::arm_response_timer(conn, env);
        }
        Action::SendUpdateInd => {
            conn.arq.resume_tx_data();
            procedure::stop_response_timer(conn, env);
            let peer = conn.llcp.phy.peer.take().unwrap_or(PhyReq {
                tx_phys: PhyMask::ALL.0,
                rx_phys: PhyMask::ALL.0,
            });
            let (phy_c_to_p, phy_p_to_c) = select_phys(
                conn.phy.tx_pref,
                conn.phy.rx_pref,
                peer,
                (conn.phy.tx, conn.phy.rx),
                env.config.phy_symmetric_required,
            );
            if phy_c_to_p == 0 && phy_p_to_c == 0 {
                conn.send_llcp(PhyUpdateInd { phy_c_to_p, phy_p_to_c, instant: 0 });
                conn.llcp.phy.state = State::Idle;
                return act(conn, env, Action::Complete);
            }
            let ind = PhyUpdateInd { phy_c_to_p, phy_p_to_c, instant: conn.next_instant() };
            conn.phy.tx_restriction = phy_mask(phy_c_to_p);
            conn.instants.phy = Some(ind);
            conn.send_llcp(ind);
        }
        Action::RejectCollision => procedure::send_reject(
            conn,
            Opcode::PhyReq,
            ErrorCode::LlProcedureCollision,
        ),
        Action::HoldPending => {
            debug!("conn {}: peer phy request held", conn.handle());
            conn.llcp.phy.held = true;
        }
        Action::StoreUpdate => {
            procedure::stop_response_timer(conn, env);
            let Some(ind) = conn.llcp.phy.update.take() else {
                return;
            };
            if ind.phy_c_to_p == 0 && ind.phy_p_to_c == 0 {
                conn.llcp.phy.state = State::Idle;
                return act(conn, env, Action::Complete);
            }
            conn.phy.tx_restriction = phy_mask(ind.phy_p_to_c);
            conn.instants.phy = Some(ind);
        }
        Action::Complete => {
            conn.arq.resume_tx_data();
            conn.phy.tx_restriction = None;
            let reason = conn.llcp.phy.reason.take().unwrap_or(ErrorCode::Success);
            let changed = std::mem::take(&mut conn.llcp.phy.changed);
            let held = std::mem::take(&mut conn.llcp.phy.held);
            if changed {
                procedure::complete_and_notify(conn, env, ProcKind::PhyUpdate, reason)
            } else {
                procedure::complete(conn, env, ProcKind::PhyUpdate, reason)
            }
            if held {
                replay_held(conn, env);
            }
        }
        Action::Ignore => (),
    }
}

/// Peripheral: process the peer request held while the local
/// procedure ran.
fn replay_held(conn: &mut Connection, env: &Env<'_>) {
    if conn.is_terminating() {
        return;
    }
    debug!("conn {}: resume held phy request", conn.handle());
    if conn.llcp.is_active(ProcKind::PhyUpdate) {
        step(conn, env, Event::RxPhyReq)
    } else if procedure::accept_peer_procedure(conn, env, ProcKind::PhyUpdate) {
        conn.llcp.phy.state = State::Idle;
        step(conn, env, Event::RxPhyReq)
    } else {
        conn.llcp.phy.held = true;
        conn.llcp.mark_pending(ProcKind::PhyUpdate)
    }
}

fn phy_mask(value: u8) -> Option<PhyMask> {
    (value != 0).then_some(PhyMask(value))
}

/// Start the procedure, once active.
pub fn start(conn: &mut Connection, env: &Env<'_>) {
    if conn.llcp.phy.state != State::Idle {
        let state = conn.llcp.phy.state;
        return debug!("conn {}: phy update resumes in {:?}", conn.handle(), state);
    }
    if std::mem::take(&mut conn.llcp.phy.held) {
        return step(conn, env, Event::RxPhyReq);
    }
    step(conn, env, Event::Start)
}

pub fn on_pdu(conn: &mut Connection, env: &Env<'_>, packet: LlcpPacket) {
    match packet {
        LlcpPacket::PhyReq(req) => on_phy_req(conn, env, req),
        LlcpPacket::PhyRsp(rsp) => {
            if !conn.llcp.is_active(ProcKind::PhyUpdate) {
                return debug!("conn {}: unexpected phy response", conn.handle());
            }
            conn.llcp.phy.peer = Some(PhyReq { tx_phys: rsp.tx_phys, rx_phys: rsp.rx_phys });
            procedure::stop_response_timer(conn, env);
            step(conn, env, Event::RxPhyRsp)
        }
        LlcpPacket::PhyUpdateInd(ind) => on_update_ind(conn, env, ind),
        _ => (),
    }
}

fn on_phy_req(conn: &mut Connection, env: &Env<'_>, req: PhyReq) {
    match conn.llcp.active {
        Some(ProcKind::PhyUpdate) => {
            if conn.role == Role::Peripheral {
                conn.llcp.phy.peer = Some(req);
            }
            step(conn, env, Event::RxPhyReq)
        }
        Some(active) if active.has_instant() => procedure::send_reject(
            conn,
            Opcode::PhyReq,
            ErrorCode::DifferentTransactionCollision,
        ),
        _ => {
            conn.llcp.phy.peer = Some(req);
            if procedure::accept_peer_procedure(conn, env, ProcKind::PhyUpdate) {
                conn.llcp.phy.state = State::Idle;
                step(conn, env, Event::RxPhyReq)
            } else {
                conn.llcp.phy.held = true;
                conn.llcp.mark_pending(ProcKind::PhyUpdate)
            }
        }
    }
}

/// Peripheral: LL_PHY_UPDATE_IND from the central.
fn on_update_ind(conn: &mut Connection, env: &Env<'_>, ind: PhyUpdateInd) {
    let changes = ind.phy_c_to_p != 0 || ind.phy_p_to_c != 0;
    let valid = |value: u8| value == 0 || value.count_ones() == 1 && value & !0x7 == 0;
    if !valid(ind.phy_c_to_p) || !valid(ind.phy_p_to_c) {
        warn!("conn {}: invalid phy update {:?}", conn.handle(), ind);
        return conn.force_terminate(ErrorCode::InvalidLmpOrLlParameters);
    }
    if changes && conn.instant_passed(ind.instant) {
        return conn.force_terminate(ErrorCode::InstantPassed);
    }

    conn.llcp.phy.update = Some(ind);
    if conn.llcp.is_active(ProcKind::PhyUpdate)
        || procedure::accept_peer_procedure(conn, env, ProcKind::PhyUpdate)
    {
        step(conn, env, Event::RxPhyUpdateInd)
    } else if changes {
        debug!("conn {}: phy update behind {:?}", conn.handle(), conn.llcp.active);
        conn.llcp.phy.update = None;
        conn.instants.phy = Some(ind);
    }
}

pub fn on_reject(conn: &mut Connection, env: &Env<'_>, reason: ErrorCode) {
    conn.llcp.phy.reason = Some(reason);
    step(conn, env, Event::RxReject);
    conn.llcp.phy.reason = None;
}

pub fn on_arq_flushed(conn: &mut Connection, env: &Env<'_>) {
    if conn.llcp.phy.state.is_flushing() {
        step(conn, env, Event::ArqFlushed)
    }
}

/// The new PHYs were applied at the instant.
pub fn on_instant(conn: &mut Connection, env: &Env<'_>) {
    if std::mem::take(&mut conn.llcp.phy.length_changed) {
        env.ops.send_hci_event(conn.data_length.change_event(conn.handle()));
    }
    if conn.llcp.is_active(ProcKind::PhyUpdate) && conn.llcp.phy.state == State::WaitInstant {
        return step(conn, env, Event::Instant);
    }
    conn.phy.tx_restriction = None;
    if std::mem::take(&mut conn.llcp.phy.changed) {
        notify_host(conn, env, ErrorCode::Success);
    }
}

pub fn notify_host(conn: &mut Connection, env: &Env<'_>, status: ErrorCode) {
    env.ops.send_hci_event(hci::Event::LePhyUpdateComplete {
        status,
        connection_handle: conn.handle(),
        tx_phy: conn.phy.tx,
        rx_phy: conn.phy.rx,
    });
}
