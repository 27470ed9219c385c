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

//! Bluetooth Core, Vol 6, Part B, 5.1.1 (connection update) and
//! 5.1.7 (connection parameters request).

use log::{debug, warn};

use crate::llcp::conn::{self, ConnSpec, Connection};
use crate::llcp::manager::LinkLayerError;
use crate::llcp::procedure::{self, ProcKind};
use crate::llcp::Env;
use crate::packets::hci::{self, ErrorCode, LlFeaturesBits, Role};
use crate::packets::llcp::{
    ConnectionParam, ConnectionParamReq, ConnectionParamRsp, ConnectionUpdateInd, LlcpPacket,
    Opcode,
};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum State {
    #[default]
    Idle,
    /// A peer request was forwarded to the host.
    WaitHostReply,
    /// Central: LL_CONNECTION_PARAM_REQ sent.
    WaitConnParamRsp,
    /// Peripheral: LL_CONNECTION_PARAM_REQ or _RSP sent.
    WaitConnUpdateInd,
    WaitInstant,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Event {
    /// Start with LL_CONNECTION_PARAM_REQ.
    StartRequest,
    /// Start with LL_CONNECTION_UPDATE_IND.
    StartUpdate,
    HostReply,
    HostNegReply,
    RxConnParamReq,
    RxConnParamRsp,
    RxConnUpdateInd,
    RxReject,
    RxUnknownRsp,
    Instant,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Action {
    SendConnParamReq,
    SendConnParamRsp,
    SendConnUpdateInd,
    /// Forward the peer request to the host.
    NotifyHostRequest,
    /// Reject the peer request on behalf of the host.
    SendReject,
    /// Reject a peer request colliding with our own.
    RejectCollision,
    /// Process the peer request once the current one completes.
    HoldPending,
    StoreUpdate,
    /// The peer does not support the request, fall back to an update.
    FallBack,
    Complete,
    Ignore,
}

/// Central transitions.
pub fn central_transition(state: State, event: Event) -> (Action, State) {
    use Action::*;
    use Event::*;
    use State::*;

    match (state, event) {
        (Idle, StartUpdate) => (SendConnUpdateInd, WaitInstant),
        (Idle, StartRequest) => (SendConnParamReq, WaitConnParamRsp),
        (Idle, RxConnParamReq) => (NotifyHostRequest, WaitHostReply),
        (WaitHostReply, HostReply) => (SendConnUpdateInd, WaitInstant),
        (WaitHostReply, HostNegReply) => (SendReject, Idle),
        (WaitConnParamRsp, RxConnParamRsp) => (SendConnUpdateInd, WaitInstant),
        (WaitConnParamRsp, RxReject) => (Complete, Idle),
        (WaitConnParamRsp, RxUnknownRsp) => (FallBack, WaitInstant),
        (WaitHostReply | WaitConnParamRsp | WaitInstant, RxConnParamReq) => {
            (RejectCollision, state)
        }
        (WaitInstant, Instant) => (Complete, Idle),
        (state, _) => (Ignore, state),
    }
}

/// Peripheral transitions.
pub fn peripheral_transition(state: State, event: Event) -> (Action, State) {
    use Action::*;
    use Event::*;
    use State::*;

    match (state, event) {
        (Idle, StartRequest) => (SendConnParamReq, WaitConnUpdateInd),
        (Idle, RxConnParamReq) => (NotifyHostRequest, WaitHostReply),
        (WaitHostReply, HostReply) => (SendConnParamRsp, WaitConnUpdateInd),
        (WaitHostReply, HostNegReply) => (SendReject, Idle),
        (Idle | WaitHostReply | WaitConnUpdateInd, RxConnUpdateInd) => (StoreUpdate, WaitInstant),
        (WaitConnUpdateInd, RxReject | RxUnknownRsp) => (Complete, Idle),
        (WaitConnUpdateInd | WaitInstant, RxConnParamReq) => (HoldPending, state),
        (WaitInstant, Instant) => (Complete, Idle),
        (state, _) => (Ignore, state),
    }
}

#[derive(Debug, Default)]
pub struct ConnUpdate {
    pub state: State,
    /// Parameters requested by the host.
    pub spec: ConnSpec,
    /// Peer request waiting for the host, or held pending.
    pub peer_req: Option<ConnectionParam>,
    /// Parameters answered by the peer.
    pub peer_rsp: Option<ConnectionParam>,
    pub update: Option<ConnectionUpdateInd>,
    /// Reason of the host negative reply, or of a rejection.
    pub reason: Option<ErrorCode>,
    /// Set at the instant when a connection parameter changed.
    pub changed: bool,
}

fn is_conn_update(kind: Option<ProcKind>) -> bool {
    matches!(kind, Some(ProcKind::ConnUpdate | ProcKind::ConnParam))
}

fn spec_of(param: &ConnectionParam) -> ConnSpec {
    ConnSpec {
        interval_min: param.interval_min,
        interval_max: param.interval_max,
        latency: param.latency,
        timeout: param.timeout,
        ..ConnSpec::default()
    }
}

/// Run one transition of the machine of the local role.
fn step(conn: &mut Connection, env: &Env<'_>, event: Event) {
    let state = conn.llcp.conn_update.state;
    let (action, next) = match conn.role {
        Role::Central => central_transition(state, event),
        Role::Peripheral => peripheral_transition(state, event),
    };
    debug!(
        "conn {}: conn update {:?} {:?} -> {:?} {:?}",
        conn.handle(),
        state,
        event,
        action,
        next
    );
    conn.llcp.conn_update.state = next;
    act(conn, env, action);
}

fn act(conn: &mut Connection, env: &Env<'_>, action: Action) {
    let kind = conn.llcp.active.filter(|kind| is_conn_update(Some(*kind)));
    match action {
        Action::SendConnParamReq => {
            let spec = conn.llcp.conn_update.spec;
            conn.send_llcp(ConnectionParamReq(ConnectionParam {
                interval_min: spec.interval_min,
                interval_max: spec.interval_max,
                latency: spec.latency,
                timeout: spec.timeout,
                preferred_periodicity: 0,
                reference_conn_event_count: conn.timing.event_counter,
                offsets: [0xffff; 6],
            }));
            procedure::arm_response_timer(conn, env);
        }
        Action::SendConnParamRsp => {
            conn.llcp.conn_update.peer_req = None;
            let spec = conn.llcp.conn_update.spec;
            conn.send_llcp(ConnectionParamRsp(ConnectionParam {
                interval_min: spec.interval_min,
                interval_max: spec.interval_max,
                latency: spec.latency,
                timeout: spec.timeout,
                preferred_periodicity: 0,
                reference_conn_event_count: conn.timing.event_counter,
                offsets: [0xffff; 6],
            }));
            procedure::arm_response_timer(conn, env);
        }
        Action::SendConnUpdateInd | Action::FallBack => {
            procedure::stop_response_timer(conn, env);
            if action == Action::FallBack {
                conn.clear_used_feature(LlFeaturesBits::ConnectionParametersRequestProcedure);
                if conn.llcp.notify.remove(ProcKind::ConnParam) {
                    conn.llcp.notify.insert(ProcKind::ConnUpdate);
                }
                conn.llcp.active = Some(ProcKind::ConnUpdate);
            }
            send_update(conn);
        }
        Action::NotifyHostRequest => {
            let Some(req) = conn.llcp.conn_update.peer_req else {
                return;
            };
            env.ops.send_hci_event(hci::Event::LeRemoteConnectionParameterRequest {
                connection_handle: conn.handle(),
                interval_min: req.interval_min,
                interval_max: req.interval_max,
                max_latency: req.latency,
                timeout: req.timeout,
            });
        }
        Action::SendReject => {
            let reason = conn
                .llcp
                .conn_update
                .reason
                .take()
                .unwrap_or(ErrorCode::UnacceptableConnectionParameters);
            conn.llcp.conn_update.peer_req = None;
            procedure::send_reject(conn, Opcode::ConnectionParamReq, reason);
            if let Some(kind) = kind {
                procedure::complete(conn, env, kind, reason);
            }
        }
        Action::RejectCollision => procedure::send_reject(
            conn,
            Opcode::ConnectionParamReq,
            ErrorCode::LlProcedureCollision,
        ),
        Action::HoldPending => {
            debug!("conn {}: peer connection parameters request held", conn.handle());
        }
        Action::StoreUpdate => {
            procedure::stop_response_timer(conn, env);
            if let Some(update) = conn.llcp.conn_update.update.take() {
                conn.instants.conn_update = Some(update);
            }
        }
        Action::Complete => {
            let reason = conn.llcp.conn_update.reason.take().unwrap_or(ErrorCode::Success);
            let changed = std::mem::take(&mut conn.llcp.conn_update.changed);
            let held = conn.llcp.conn_update.peer_req.take();
            if let Some(kind) = kind {
                if changed {
                    procedure::complete_and_notify(conn, env, kind, reason)
                } else {
                    procedure::complete(conn, env, kind, reason)
                }
            }
            if let Some(req) = held {
                replay_held(conn, env, req);
            }
        }
        Action::Ignore => (),
    }
}

/// Peripheral: process the peer request held while the local
/// procedure ran.
fn replay_held(conn: &mut Connection, env: &Env<'_>, req: ConnectionParam) {
    if conn.is_terminating() {
        return;
    }
    debug!("conn {}: resume held connection parameters request", conn.handle());
    conn.llcp.conn_update.peer_req = Some(req);
    if is_conn_update(conn.llcp.active) {
        step(conn, env, Event::RxConnParamReq)
    } else if procedure::accept_peer_procedure(conn, env, ProcKind::ConnParam) {
        conn.llcp.conn_update.state = State::Idle;
        step(conn, env, Event::RxConnParamReq)
    } else {
        conn.llcp.mark_pending(ProcKind::ConnParam)
    }
}

/// Central: announce the new parameters with the next instant. The
/// parameters answered by the peer are used when they are valid.
fn send_update(conn: &mut Connection) {
    let cu = &mut conn.llcp.conn_update;
    let spec = match cu.peer_rsp.take() {
        Some(rsp) if spec_of(&rsp).is_valid() => spec_of(&rsp),
        _ => cu.spec,
    };
    cu.peer_req = None;

    let ind = ConnectionUpdateInd {
        win_size: 1,
        win_offset: 0,
        interval: spec.interval(),
        latency: spec.latency,
        timeout: spec.timeout,
        instant: conn.next_instant(),
    };
    conn.instants.conn_update = Some(ind);
    conn.send_llcp(ind);
}

/// Start the procedure, once active.
pub fn start(conn: &mut Connection, env: &Env<'_>, kind: ProcKind) {
    if conn.llcp.conn_update.state != State::Idle {
        let state = conn.llcp.conn_update.state;
        return debug!("conn {}: conn update resumes in {:?}", conn.handle(), state);
    }
    if conn.llcp.conn_update.peer_req.is_some() {
        return step(conn, env, Event::RxConnParamReq);
    }
    match kind {
        ProcKind::ConnUpdate => step(conn, env, Event::StartUpdate),
        _ => step(conn, env, Event::StartRequest),
    }
}

/// Host reply to LE Remote Connection Parameter Request.
pub fn host_reply(
    conn: &mut Connection,
    env: &Env<'_>,
    spec: ConnSpec,
) -> Result<(), LinkLayerError> {
    if conn.llcp.conn_update.state != State::WaitHostReply {
        return Err(LinkLayerError::CommandDisallowed);
    }
    if !spec.is_valid() {
        return Err(LinkLayerError::InvalidParameters);
    }
    conn.llcp.conn_update.spec = spec;
    step(conn, env, Event::HostReply);
    Ok(())
}

/// Host negative reply to LE Remote Connection Parameter Request.
pub fn host_neg_reply(
    conn: &mut Connection,
    env: &Env<'_>,
    reason: ErrorCode,
) -> Result<(), LinkLayerError> {
    if conn.llcp.conn_update.state != State::WaitHostReply {
        return Err(LinkLayerError::CommandDisallowed);
    }
    conn.llcp.conn_update.reason = Some(reason);
    step(conn, env, Event::HostNegReply);
    Ok(())
}

pub fn on_pdu(conn: &mut Connection, env: &Env<'_>, packet: LlcpPacket) {
    match packet {
        LlcpPacket::ConnectionParamReq(ConnectionParamReq(req)) => on_param_req(conn, env, req),
        LlcpPacket::ConnectionParamRsp(ConnectionParamRsp(rsp)) => {
            if !conn.llcp.is_active(ProcKind::ConnParam) {
                return debug!("conn {}: unexpected connection parameters response", conn.handle());
            }
            conn.llcp.conn_update.peer_rsp = Some(rsp);
            step(conn, env, Event::RxConnParamRsp)
        }
        LlcpPacket::ConnectionUpdateInd(ind) => on_update_ind(conn, env, ind),
        _ => (),
    }
}

fn on_param_req(conn: &mut Connection, env: &Env<'_>, req: ConnectionParam) {
    if !spec_of(&req).is_valid() {
        warn!("conn {}: invalid connection parameters {:?}", conn.handle(), req);
        return procedure::send_reject(
            conn,
            Opcode::ConnectionParamReq,
            ErrorCode::InvalidLmpOrLlParameters,
        );
    }

    match conn.llcp.active {
        active if is_conn_update(active) => {
            // Collision with the local procedure: the tables decide.
            let state = conn.llcp.conn_update.state;
            if conn.role == Role::Peripheral
                && matches!(state, State::WaitConnUpdateInd | State::WaitInstant)
            {
                conn.llcp.conn_update.peer_req = Some(req);
            }
            step(conn, env, Event::RxConnParamReq)
        }
        Some(active) if active.has_instant() => procedure::send_reject(
            conn,
            Opcode::ConnectionParamReq,
            ErrorCode::DifferentTransactionCollision,
        ),
        _ => {
            conn.llcp.conn_update.peer_req = Some(req);
            if procedure::accept_peer_procedure(conn, env, ProcKind::ConnParam) {
                conn.llcp.conn_update.state = State::Idle;
                step(conn, env, Event::RxConnParamReq)
            } else {
                conn.llcp.mark_pending(ProcKind::ConnParam)
            }
        }
    }
}

/// Peripheral: LL_CONNECTION_UPDATE_IND from the central.
fn on_update_ind(conn: &mut Connection, env: &Env<'_>, ind: ConnectionUpdateInd) {
    let valid = (6..=3200).contains(&ind.interval)
        && (1..=8u16.min(ind.interval - 1)).contains(&u16::from(ind.win_size))
        && ind.win_offset <= ind.interval
        && ind.latency <= 499
        && (10..=3200).contains(&ind.timeout)
        && conn::supervision_timeout_is_valid(ind.interval, ind.latency, ind.timeout);
    if !valid {
        warn!("conn {}: invalid connection update {:?}", conn.handle(), ind);
        return conn.force_terminate(ErrorCode::InvalidLmpOrLlParameters);
    }
    if conn.instant_passed(ind.instant) {
        return conn.force_terminate(ErrorCode::InstantPassed);
    }

    conn.llcp.conn_update.update = Some(ind);
    if conn.llcp.conn_update.state == State::WaitHostReply {
        // The central updates without waiting for our reply.
        conn.llcp.conn_update.peer_req = None;
    }
    if is_conn_update(conn.llcp.active)
        || procedure::accept_peer_procedure(conn, env, ProcKind::ConnUpdate)
    {
        step(conn, env, Event::RxConnUpdateInd)
    } else {
        // The central cannot be refused: apply the update at its
        // instant without taking the gate.
        debug!("conn {}: connection update behind {:?}", conn.handle(), conn.llcp.active);
        conn.llcp.conn_update.update = None;
        conn.instants.conn_update = Some(ind);
    }
}

pub fn on_reject(conn: &mut Connection, env: &Env<'_>, reason: ErrorCode) {
    conn.llcp.conn_update.reason = Some(reason);
    step(conn, env, Event::RxReject);
    conn.llcp.conn_update.reason = None;
}

/// LL_UNKNOWN_RSP to LL_CONNECTION_PARAM_REQ.
pub fn on_unknown_rsp(conn: &mut Connection, env: &Env<'_>) {
    if conn.role == Role::Peripheral {
        conn.clear_used_feature(LlFeaturesBits::ConnectionParametersRequestProcedure);
        conn.llcp.conn_update.reason = Some(ErrorCode::UnsupportedRemoteFeature);
    }
    step(conn, env, Event::RxUnknownRsp);
    conn.llcp.conn_update.reason = None;
}

/// The new parameters were applied at the instant.
pub fn on_instant(conn: &mut Connection, env: &Env<'_>) {
    if is_conn_update(conn.llcp.active) && conn.llcp.conn_update.state == State::WaitInstant {
        return step(conn, env, Event::Instant);
    }
    if std::mem::take(&mut conn.llcp.conn_update.changed) {
        notify_host(conn, env, ErrorCode::Success);
    }
}

pub fn notify_host(conn: &mut Connection, env: &Env<'_>, status: ErrorCode) {
    env.ops.send_hci_event(hci::Event::LeConnectionUpdateComplete {
        status,
        connection_handle: conn.handle(),
        connection_interval: conn.timing.interval,
        peripheral_latency: conn.timing.latency,
        supervision_timeout: conn.timing.timeout,
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llcp::procedure::Origin;
    use crate::llcp::test::{central, peripheral, TestContext};
    use crate::packets::llcp::{FeatureRsp, RejectExtInd};

    const CENTRAL_STATES: [State; 4] =
        [State::Idle, State::WaitHostReply, State::WaitConnParamRsp, State::WaitInstant];
    const PERIPHERAL_STATES: [State; 4] =
        [State::Idle, State::WaitHostReply, State::WaitConnUpdateInd, State::WaitInstant];
    const EVENTS: [Event; 10] = [
        Event::StartRequest,
        Event::StartUpdate,
        Event::HostReply,
        Event::HostNegReply,
        Event::RxConnParamReq,
        Event::RxConnParamRsp,
        Event::RxConnUpdateInd,
        Event::RxReject,
        Event::RxUnknownRsp,
        Event::Instant,
    ];

    #[test]
    fn central_table() {
        for state in CENTRAL_STATES {
            for event in EVENTS {
                let (action, next) = central_transition(state, event);
                // A central never waits for LL_CONNECTION_UPDATE_IND.
                assert_ne!(next, State::WaitConnUpdateInd);
                assert_ne!(action, Action::StoreUpdate);
                assert_ne!(action, Action::HoldPending);
                if action == Action::Ignore {
                    assert_eq!(next, state);
                }
                if action == Action::SendConnUpdateInd {
                    assert_eq!(next, State::WaitInstant);
                }
            }
        }
        assert_eq!(
            central_transition(State::WaitInstant, Event::RxConnParamReq),
            (Action::RejectCollision, State::WaitInstant)
        );
    }

    #[test]
    fn peripheral_table() {
        for state in PERIPHERAL_STATES {
            for event in EVENTS {
                let (action, next) = peripheral_transition(state, event);
                // A peripheral never sends LL_CONNECTION_UPDATE_IND.
                assert_ne!(action, Action::SendConnUpdateInd);
                assert_ne!(action, Action::RejectCollision);
                assert_ne!(next, State::WaitConnParamRsp);
                if action == Action::Ignore {
                    assert_eq!(next, state);
                }
            }
        }
        assert_eq!(
            peripheral_transition(State::WaitConnUpdateInd, Event::RxConnParamReq),
            (Action::HoldPending, State::WaitConnUpdateInd)
        );
    }

    fn request(interval_min: u16, interval_max: u16) -> ConnectionParam {
        ConnectionParam {
            interval_min,
            interval_max,
            latency: 0,
            timeout: 300,
            ..ConnectionParam::default()
        }
    }

    fn spec(interval: u16) -> ConnSpec {
        ConnSpec {
            interval_min: interval,
            interval_max: interval,
            latency: 0,
            timeout: 300,
            ..ConnSpec::default()
        }
    }

    #[test]
    fn central_answers_peer_request_through_host() {
        let ctx = TestContext::new();
        let mut conn = central(&ctx);
        let env = ctx.env();

        on_pdu(&mut conn, &env, ConnectionParamReq(request(40, 60)).into());
        assert_eq!(conn.llcp.active, Some(ProcKind::ConnParam));
        assert!(matches!(
            ctx.take_events().as_slice(),
            [hci::Event::LeRemoteConnectionParameterRequest { interval_min: 40, .. }]
        ));

        host_reply(&mut conn, &env, spec(48)).unwrap();
        let sent = ctx.take_llcp(&mut conn);
        let [LlcpPacket::ConnectionUpdateInd(ind)] = sent.as_slice() else {
            panic!("unexpected {:?}", sent);
        };
        assert_eq!(ind.interval, 48);
        assert_eq!(ind.instant, conn.next_instant());
        assert_eq!(conn.instants.conn_update, Some(*ind));
        assert_eq!(conn.llcp.conn_update.state, State::WaitInstant);
    }

    #[test]
    fn host_negative_reply_rejects_peer() {
        let ctx = TestContext::new();
        let mut conn = central(&ctx);
        let env = ctx.env();

        on_pdu(&mut conn, &env, ConnectionParamReq(request(40, 60)).into());
        ctx.take_events();
        host_neg_reply(&mut conn, &env, ErrorCode::UnacceptableConnectionParameters).unwrap();

        assert_eq!(
            ctx.take_llcp(&mut conn),
            vec![LlcpPacket::RejectExtInd(RejectExtInd {
                reject_opcode: Opcode::ConnectionParamReq as u8,
                error_code: ErrorCode::UnacceptableConnectionParameters as u8,
            })]
        );
        assert_eq!(conn.llcp.active, None);
        assert!(ctx.take_events().is_empty());
        assert!(host_neg_reply(&mut conn, &env, ErrorCode::UnspecifiedError).is_err());
    }

    #[test]
    fn invalid_peer_request_is_rejected() {
        let ctx = TestContext::new();
        let mut conn = central(&ctx);
        let env = ctx.env();

        on_pdu(&mut conn, &env, ConnectionParamReq(request(60, 40)).into());
        assert!(matches!(ctx.take_llcp(&mut conn).as_slice(), [LlcpPacket::RejectExtInd(_)]));
        assert_eq!(conn.llcp.active, None);
    }

    #[test]
    fn central_rejects_colliding_request() {
        let ctx = TestContext::new();
        let mut conn = central(&ctx);
        let env = ctx.env();
        conn.llcp.conn_update.spec = spec(40);
        procedure::start(&mut conn, &env, ProcKind::ConnParam, Origin::Host).unwrap();
        assert!(matches!(ctx.take_llcp(&mut conn).as_slice(), [LlcpPacket::ConnectionParamReq(_)]));

        on_pdu(&mut conn, &env, ConnectionParamReq(request(40, 60)).into());
        assert_eq!(
            ctx.take_llcp(&mut conn),
            vec![LlcpPacket::RejectExtInd(RejectExtInd {
                reject_opcode: Opcode::ConnectionParamReq as u8,
                error_code: ErrorCode::LlProcedureCollision as u8,
            })]
        );
        assert_eq!(conn.llcp.conn_update.state, State::WaitConnParamRsp);
    }

    #[test]
    fn peripheral_holds_colliding_request() {
        let ctx = TestContext::new();
        let mut conn = peripheral(&ctx);
        let env = ctx.env();
        conn.llcp.conn_update.spec = spec(40);
        procedure::start(&mut conn, &env, ProcKind::ConnParam, Origin::Host).unwrap();
        ctx.take_llcp(&mut conn);

        on_pdu(&mut conn, &env, ConnectionParamReq(request(24, 24)).into());
        assert_eq!(conn.llcp.active, Some(ProcKind::ConnParam));
        assert!(conn.llcp.pend.is_empty());
        assert!(conn.llcp.conn_update.peer_req.is_some());
        assert!(ctx.take_llcp(&mut conn).is_empty());

        // Our request is rejected, the held one then goes to the host.
        on_reject(&mut conn, &env, ErrorCode::LlProcedureCollision);
        assert_eq!(conn.llcp.active, Some(ProcKind::ConnParam));
        assert_eq!(conn.llcp.conn_update.state, State::WaitHostReply);
        assert!(conn.llcp.pend.is_empty());
        assert!(matches!(
            ctx.take_events().as_slice(),
            [
                hci::Event::LeConnectionUpdateComplete {
                    status: ErrorCode::LlProcedureCollision,
                    ..
                },
                hci::Event::LeRemoteConnectionParameterRequest { interval_min: 24, .. }
            ]
        ));
    }

    #[test]
    fn announced_interval_respects_supervision_timeout() {
        let ctx = TestContext::new();
        let mut c = central(&ctx);
        let mut p = peripheral(&ctx);
        let env = ctx.env();
        c.llcp.conn_update.spec = ConnSpec {
            interval_min: 6,
            interval_max: 3200,
            latency: 0,
            timeout: 10,
            ..ConnSpec::default()
        };
        procedure::start(&mut c, &env, ProcKind::ConnUpdate, Origin::Host).unwrap();
        let sent = ctx.take_llcp(&mut c);
        let [LlcpPacket::ConnectionUpdateInd(ind)] = sent.as_slice() else {
            panic!("unexpected {:?}", sent);
        };
        assert_eq!(ind.interval, 39);
        assert!(conn::supervision_timeout_is_valid(ind.interval, ind.latency, ind.timeout));

        on_pdu(&mut p, &env, (*ind).into());
        assert!(!p.close_requested);
        assert_eq!(p.instants.conn_update, Some(*ind));
    }

    #[test]
    fn update_with_invalid_window_terminates() {
        for (win_size, win_offset, interval) in [(0, 0, 40), (9, 0, 40), (1, 41, 40), (6, 0, 6)] {
            let ctx = TestContext::new();
            let mut conn = peripheral(&ctx);
            let env = ctx.env();
            let ind = ConnectionUpdateInd {
                win_size,
                win_offset,
                interval,
                latency: 0,
                timeout: 300,
                instant: conn.next_instant(),
            };
            on_pdu(&mut conn, &env, ind.into());
            assert!(conn.close_requested, "window {} offset {}", win_size, win_offset);
            assert_eq!(conn.term_reason, ErrorCode::InvalidLmpOrLlParameters);
        }
    }

    #[test]
    fn request_behind_phy_update_is_rejected() {
        let ctx = TestContext::new();
        let mut conn = central(&ctx);
        let env = ctx.env();
        conn.llcp.active = Some(ProcKind::PhyUpdate);

        on_pdu(&mut conn, &env, ConnectionParamReq(request(40, 60)).into());
        assert_eq!(
            ctx.take_llcp(&mut conn),
            vec![LlcpPacket::RejectExtInd(RejectExtInd {
                reject_opcode: Opcode::ConnectionParamReq as u8,
                error_code: ErrorCode::DifferentTransactionCollision as u8,
            })]
        );
    }

    #[test]
    fn unknown_response_falls_back_to_update() {
        let ctx = TestContext::new();
        let mut conn = central(&ctx);
        let env = ctx.env();
        conn.llcp.conn_update.spec = spec(40);
        procedure::start(&mut conn, &env, ProcKind::ConnParam, Origin::Host).unwrap();
        ctx.take_llcp(&mut conn);

        on_unknown_rsp(&mut conn, &env);
        assert_eq!(conn.llcp.active, Some(ProcKind::ConnUpdate));
        assert!(conn.llcp.notify.contains(ProcKind::ConnUpdate));
        assert!(!conn.supports(LlFeaturesBits::ConnectionParametersRequestProcedure));
        assert!(matches!(
            ctx.take_llcp(&mut conn).as_slice(),
            [LlcpPacket::ConnectionUpdateInd(ConnectionUpdateInd { interval: 40, .. })]
        ));
    }

    #[test]
    fn peripheral_request_then_update() {
        let ctx = TestContext::new();
        let mut conn = peripheral(&ctx);
        let env = ctx.env();
        conn.llcp.conn_update.spec = spec(40);
        procedure::start(&mut conn, &env, ProcKind::ConnParam, Origin::Host).unwrap();
        assert!(matches!(ctx.take_llcp(&mut conn).as_slice(), [LlcpPacket::ConnectionParamReq(_)]));
        assert_eq!(conn.llcp.conn_update.state, State::WaitConnUpdateInd);

        let ind = ConnectionUpdateInd {
            win_size: 1,
            win_offset: 0,
            interval: 40,
            latency: 0,
            timeout: 300,
            instant: conn.next_instant(),
        };
        on_pdu(&mut conn, &env, ind.into());
        assert_eq!(conn.instants.conn_update, Some(ind));
        assert_eq!(conn.llcp.conn_update.state, State::WaitInstant);

        conn.timing.interval = 40;
        conn.llcp.conn_update.changed = true;
        on_instant(&mut conn, &env);
        assert_eq!(conn.llcp.active, None);
        assert!(matches!(
            ctx.take_events().as_slice(),
            [hci::Event::LeConnectionUpdateComplete {
                status: ErrorCode::Success,
                connection_interval: 40,
                ..
            }]
        ));
    }

    #[test]
    fn update_with_passed_instant_terminates() {
        let ctx = TestContext::new();
        let mut conn = peripheral(&ctx);
        let env = ctx.env();
        conn.timing.event_counter = 100;

        let ind = ConnectionUpdateInd {
            win_size: 1,
            win_offset: 0,
            interval: 40,
            latency: 0,
            timeout: 300,
            instant: 99,
        };
        on_pdu(&mut conn, &env, ind.into());
        assert!(conn.close_requested);
        assert_eq!(conn.term_reason, ErrorCode::InstantPassed);
    }

    #[test]
    fn unchanged_update_from_peer_is_silent() {
        let ctx = TestContext::new();
        let mut conn = peripheral(&ctx);
        let env = ctx.env();
        let ind = ConnectionUpdateInd {
            win_size: 1,
            win_offset: 0,
            interval: conn.timing.interval,
            latency: conn.timing.latency,
            timeout: conn.timing.timeout,
            instant: conn.next_instant(),
        };
        on_pdu(&mut conn, &env, ind.into());
        on_instant(&mut conn, &env);
        assert_eq!(conn.llcp.active, None);
        assert!(ctx.take_events().is_empty());
    }

    #[test]
    fn peer_request_overrides_feature_exchange() {
        let ctx = TestContext::new();
        let mut conn = central(&ctx);
        let env = ctx.env();

        procedure::start(&mut conn, &env, ProcKind::FeatureExchange, Origin::Host).unwrap();
        assert!(matches!(ctx.take_llcp(&mut conn).as_slice(), [LlcpPacket::FeatureReq(_)]));
        assert_eq!(conn.llcp.active, Some(ProcKind::FeatureExchange));

        on_pdu(&mut conn, &env, ConnectionParamReq(request(40, 60)).into());
        assert_eq!(conn.llcp.active, Some(ProcKind::ConnParam));
        assert!(conn.llcp.pend.contains(ProcKind::FeatureExchange));
        assert!(conn.llcp.overridden.contains(ProcKind::FeatureExchange));
        assert!(conn.llcp.notify.contains(ProcKind::FeatureExchange));
        ctx.take_events();

        host_reply(&mut conn, &env, spec(48)).unwrap();
        let sent = ctx.take_llcp(&mut conn);
        assert!(matches!(sent.as_slice(), [LlcpPacket::ConnectionUpdateInd(_)]));
        on_instant(&mut conn, &env);

        // Resumed without sending LL_FEATURE_REQ again.
        assert_eq!(conn.llcp.active, Some(ProcKind::FeatureExchange));
        assert!(conn.llcp.overridden.is_empty());
        assert!(conn.llcp.notify.contains(ProcKind::FeatureExchange));
        assert!(ctx.take_llcp(&mut conn).is_empty());

        procedure::on_control_pdu(
            &mut conn,
            &env,
            &LlcpPacket::from(FeatureRsp { features: 0x3f }).to_bytes(),
        );
        assert_eq!(conn.llcp.active, None);
        assert!(matches!(
            ctx.take_events().as_slice(),
            [hci::Event::LeReadRemoteFeaturesComplete { status: ErrorCode::Success, .. }]
        ));
    }
}
