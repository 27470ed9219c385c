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

//! Bluetooth Core, Vol 6, Part B, 5.1.3 (encryption start and pause)
//! and 5.1.7 (LE ping).
//!
//! Data transmission is paused from the first encryption PDU until the
//! handshake completes. Data reception is paused once both sides know
//! the handshake started: from LL_ENC_RSP (LL_PAUSE_ENC_RSP) on the
//! central, from LL_ENC_REQ (LL_PAUSE_ENC_REQ) on the peripheral.

use log::{debug, info, warn};

use crate::llcp::conn::Connection;
use crate::llcp::manager::LinkLayerError;
use crate::llcp::procedure::{self, Origin, ProcKind};
use crate::llcp::Env;
use crate::ops::TimerKind;
use crate::packets::hci::{self, ErrorCode, Role};
use crate::packets::llcp::{EncReq, EncRsp, LlcpPacket, Opcode};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum State {
    #[default]
    Unencrypted,
    FlushBeforeStart,
    WaitEncRsp,
    WaitHostLtk,
    WaitStartEncReq,
    WaitStartEncRsp,
    Encrypted,
    FlushBeforeRestart,
    WaitPauseEncRsp,
    WaitEncReq,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Event {
    HostStart,
    ArqFlushed,
    RxEncReq,
    RxEncRsp,
    RxStartEncReq,
    RxStartEncRsp,
    RxPauseEncReq,
    RxPauseEncRsp,
    HostLtkReply,
    HostLtkNegReply,
    RxReject,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Action {
    Flush,
    SendEncReq,
    SendEncRsp,
    DeriveKey,
    SendStartEncReq,
    SendStartEncRsp,
    SendPauseEncReq,
    SendPauseEncRsp,
    /// Central: answer LL_PAUSE_ENC_RSP and restart with LL_ENC_REQ.
    Restart,
    DisableTx,
    RejectEncReq,
    Fail,
    Complete,
    Ignore,
}

pub fn central_transition(state: State, event: Event) -> (Action, State) {
    use Action::*;
    use Event::*;
    use State::*;

    match (state, event) {
        (Unencrypted, HostStart) => (Flush, FlushBeforeStart),
        (FlushBeforeStart, ArqFlushed) => (SendEncReq, WaitEncRsp),
        (WaitEncRsp, RxEncRsp) => (DeriveKey, WaitStartEncReq),
        (WaitStartEncReq, RxStartEncReq) => (SendStartEncRsp, WaitStartEncRsp),
        (WaitStartEncRsp, RxStartEncRsp) => (Complete, Encrypted),
        (Encrypted, HostStart) => (Flush, FlushBeforeRestart),
        (FlushBeforeRestart, ArqFlushed) => (SendPauseEncReq, WaitPauseEncRsp),
        (WaitPauseEncRsp, RxPauseEncRsp) => (Restart, WaitEncRsp),
        (WaitEncRsp | WaitStartEncReq | WaitStartEncRsp, RxReject) => (Fail, Unencrypted),
        (state, _) => (Ignore, state),
    }
}

pub fn peripheral_transition(state: State, event: Event) -> (Action, State) {
    use Action::*;
    use Event::*;
    use State::*;

    match (state, event) {
        (Unencrypted | WaitEncReq, RxEncReq) => (Flush, FlushBeforeStart),
        (FlushBeforeStart, ArqFlushed) => (SendEncRsp, WaitHostLtk),
        (WaitHostLtk, HostLtkReply) => (SendStartEncReq, WaitStartEncRsp),
        (WaitHostLtk, HostLtkNegReply) => (RejectEncReq, Unencrypted),
        (WaitStartEncRsp, RxStartEncRsp) => (SendStartEncRsp, Encrypted),
        (Encrypted, RxPauseEncReq) => (Flush, FlushBeforeRestart),
        (FlushBeforeRestart, ArqFlushed) => (SendPauseEncRsp, WaitPauseEncRsp),
        (WaitPauseEncRsp, RxPauseEncRsp) => (DisableTx, WaitEncReq),
        (state, _) => (Ignore, state),
    }
}

/// Encryption PDUs the peer may send in `state`.
fn expected(state: State, role: Role) -> &'static [Opcode] {
    match (state, role) {
        (State::Unencrypted, Role::Peripheral) | (State::WaitEncReq, _) => &[Opcode::EncReq],
        (State::WaitEncRsp, _) => &[Opcode::EncRsp],
        (State::WaitStartEncReq, _) => &[Opcode::StartEncReq],
        (State::WaitStartEncRsp, _) => &[Opcode::StartEncRsp],
        (State::Encrypted, Role::Peripheral) => &[Opcode::PauseEncReq],
        (State::WaitPauseEncRsp, _) => &[Opcode::PauseEncRsp],
        _ => &[],
    }
}

fn is_encryption_pdu(opcode: Opcode) -> bool {
    matches!(
        opcode,
        Opcode::EncReq
            | Opcode::EncRsp
            | Opcode::StartEncReq
            | Opcode::StartEncRsp
            | Opcode::PauseEncReq
            | Opcode::PauseEncRsp
    )
}

/// Whether a control PDU is acceptable in the current encryption
/// state. Anything else is a protocol violation.
pub fn rx_allowed(conn: &Connection, opcode: Opcode) -> bool {
    let expected = expected(conn.llcp.enc.state, conn.role);
    if opcode == Opcode::TerminateInd || expected.contains(&opcode) {
        return true;
    }
    if conn.arq.rx_data_paused {
        matches!(opcode, Opcode::RejectInd | Opcode::RejectExtInd | Opcode::UnknownRsp)
    } else {
        !is_encryption_pdu(opcode)
    }
}

#[derive(Clone, Debug, Default)]
pub struct Encryption {
    pub state: State,
    pub ltk: [u8; 16],
    pub rand: u64,
    pub ediv: u16,
    skd_c: u64,
    iv_c: u32,
    skd_p: u64,
    iv_p: u32,
    /// The link was encrypted when the procedure started.
    pub refresh: bool,
    reason: Option<ErrorCode>,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum PingState {
    #[default]
    Idle,
    WaitPingRsp,
}

#[derive(Clone, Copy, Debug, Default)]
pub struct Ping {
    pub state: PingState,
}

fn step(conn: &mut Connection, env: &Env<'_>, event: Event) {
    let state = conn.llcp.enc.state;
    let (action, next) = match conn.role {
        Role::Central => central_transition(state, event),
        Role::Peripheral => peripheral_transition(state, event),
    };
    debug!("conn {}: encryption {:?} {:?} -> {:?} {:?}", conn.handle(), state, event, action, next);
    conn.llcp.enc.state = next;
    act(conn, env, action);
}

fn act(conn: &mut Connection, env: &Env<'_>, action: Action) {
    match action {
        Action::Flush => {
            conn.arq.pause_tx_data();
            if conn.role == Role::Peripheral {
                conn.arq.rx_data_paused = true;
            }
            if conn.arq.is_flushed() {
                step(conn, env, Event::ArqFlushed);
            }
        }
        Action::SendEncReq => {
            let enc = &mut conn.llcp.enc;
            enc.skd_c = rand::random();
            enc.iv_c = rand::random();
            let req = EncReq { rand: enc.rand, ediv: enc.ediv, skd_c: enc.skd_c, iv_c: enc.iv_c };
            conn.send_llcp(req);
            procedure::arm_response_timer(conn, env);
        }
        Action::SendEncRsp => {
            let enc = &mut conn.llcp.enc;
            enc.skd_p = rand::random();
            enc.iv_p = rand::random();
            let rsp = EncRsp { skd_p: enc.skd_p, iv_p: enc.iv_p };
            let (rand, ediv) = (enc.rand, enc.ediv);
            conn.send_llcp(rsp);
            env.ops.send_hci_event(hci::Event::LeLongTermKeyRequest {
                connection_handle: conn.handle(),
                random_number: rand,
                encrypted_diversifier: ediv,
            });
        }
        Action::DeriveKey => {
            conn.arq.rx_data_paused = true;
            install_session_key(conn, env);
        }
        Action::SendStartEncReq => {
            install_session_key(conn, env);
            conn.arq.cipher.rx_enabled = true;
            conn.send_llcp(LlcpPacket::StartEncReq);
            procedure::arm_response_timer(conn, env);
        }
        Action::SendStartEncRsp => {
            conn.arq.cipher.tx_enabled = true;
            conn.arq.cipher.rx_enabled = true;
            conn.send_llcp(LlcpPacket::StartEncRsp);
            if conn.llcp.enc.state == State::Encrypted {
                act(conn, env, Action::Complete)
            } else {
                procedure::arm_response_timer(conn, env)
            }
        }
        Action::SendPauseEncReq => {
            conn.send_llcp(LlcpPacket::PauseEncReq);
            procedure::arm_response_timer(conn, env);
        }
        Action::SendPauseEncRsp => {
            conn.send_llcp(LlcpPacket::PauseEncRsp);
            conn.arq.cipher.rx_enabled = false;
            procedure::arm_response_timer(conn, env);
        }
        Action::Restart => {
            conn.arq.rx_data_paused = true;
            conn.arq.cipher.tx_enabled = false;
            conn.arq.cipher.rx_enabled = false;
            conn.send_llcp(LlcpPacket::PauseEncRsp);
            act(conn, env, Action::SendEncReq)
        }
        Action::DisableTx => {
            procedure::stop_response_timer(conn, env);
            conn.arq.cipher.tx_enabled = false;
        }
        Action::RejectEncReq => {
            procedure::send_reject(conn, Opcode::EncReq, ErrorCode::PinOrKeyMissing);
            finish(conn, env, ErrorCode::PinOrKeyMissing);
        }
        Action::Fail => {
            conn.arq.cipher.tx_enabled = false;
            conn.arq.cipher.rx_enabled = false;
            let reason = conn.llcp.enc.reason.take().unwrap_or(ErrorCode::UnspecifiedError);
            finish(conn, env, reason);
        }
        Action::Complete => {
            restart_auth_timers(conn, env);
            finish(conn, env, ErrorCode::Success);
        }
        Action::Ignore => (),
    }
}

/// SKD = SKDp || SKDc and IV = IVp || IVc, least significant octet
/// first.
fn install_session_key(conn: &mut Connection, env: &Env<'_>) {
    let enc = &conn.llcp.enc;
    let mut skd = [0; 16];
    skd[..8].copy_from_slice(&enc.skd_c.to_le_bytes());
    skd[8..].copy_from_slice(&enc.skd_p.to_le_bytes());
    let mut iv = [0; 8];
    iv[..4].copy_from_slice(&enc.iv_c.to_le_bytes());
    iv[4..].copy_from_slice(&enc.iv_p.to_le_bytes());
    let session_key = env.ops.session_key(&enc.ltk, &skd);
    conn.arq.cipher.rekey(session_key, iv);
}

fn finish(conn: &mut Connection, env: &Env<'_>, status: ErrorCode) {
    procedure::stop_response_timer(conn, env);
    conn.arq.resume_tx_data();
    conn.arq.rx_data_paused = false;
    let encrypted = conn.is_encrypted();
    info!("conn {}: encryption done ({}), encrypted: {}", conn.handle(), status, encrypted);
    match conn.role {
        Role::Central => procedure::complete(conn, env, ProcKind::Encryption, status),
        // The peripheral host learns about key refusals through its own reply.
        Role::Peripheral if status == ErrorCode::Success => {
            procedure::complete_and_notify(conn, env, ProcKind::Encryption, status)
        }
        Role::Peripheral => procedure::complete(conn, env, ProcKind::Encryption, status),
    }
    conn.llcp.enc.refresh = false;
}

/// Start the procedure, once active.
pub fn start(conn: &mut Connection, env: &Env<'_>) {
    conn.llcp.enc.refresh = conn.llcp.enc.state == State::Encrypted;
    step(conn, env, Event::HostStart)
}

/// Central: HCI LE Enable Encryption.
pub fn host_start(
    conn: &mut Connection,
    env: &Env<'_>,
    rand: u64,
    ediv: u16,
    ltk: [u8; 16],
) -> Result<(), LinkLayerError> {
    if conn.llcp.is_active(ProcKind::Encryption) || conn.llcp.pend.contains(ProcKind::Encryption) {
        return Err(LinkLayerError::CommandDisallowed);
    }
    if conn.role == Role::Central {
        let enc = &mut conn.llcp.enc;
        enc.rand = rand;
        enc.ediv = ediv;
        enc.ltk = ltk;
    }
    procedure::start(conn, env, ProcKind::Encryption, Origin::Host)
}

/// Peripheral: HCI LE Long Term Key Request Reply.
pub fn ltk_reply(
    conn: &mut Connection,
    env: &Env<'_>,
    ltk: [u8; 16],
) -> Result<(), LinkLayerError> {
    if conn.llcp.enc.state != State::WaitHostLtk {
        return Err(LinkLayerError::CommandDisallowed);
    }
    conn.llcp.enc.ltk = ltk;
    step(conn, env, Event::HostLtkReply);
    Ok(())
}

/// Peripheral: HCI LE Long Term Key Request Negative Reply.
pub fn ltk_neg_reply(conn: &mut Connection, env: &Env<'_>) -> Result<(), LinkLayerError> {
    if conn.llcp.enc.state != State::WaitHostLtk {
        return Err(LinkLayerError::CommandDisallowed);
    }
    step(conn, env, Event::HostLtkNegReply);
    Ok(())
}

pub fn on_pdu(conn: &mut Connection, env: &Env<'_>, packet: LlcpPacket) {
    let event = match packet {
        LlcpPacket::EncReq(req) => {
            let enc = &mut conn.llcp.enc;
            enc.rand = req.rand;
            enc.ediv = req.ediv;
            enc.skd_c = req.skd_c;
            enc.iv_c = req.iv_c;
            // Runs beside a busy gate: the central pauses its own
            // procedures until encryption completes.
            if !procedure::accept_peer_procedure(conn, env, ProcKind::Encryption) {
                debug!("conn {}: encryption beside {:?}", conn.handle(), conn.llcp.active);
            }
            Event::RxEncReq
        }
        LlcpPacket::EncRsp(rsp) => {
            conn.llcp.enc.skd_p = rsp.skd_p;
            conn.llcp.enc.iv_p = rsp.iv_p;
            procedure::stop_response_timer(conn, env);
            Event::RxEncRsp
        }
        LlcpPacket::StartEncReq => {
            procedure::stop_response_timer(conn, env);
            Event::RxStartEncReq
        }
        LlcpPacket::StartEncRsp => Event::RxStartEncRsp,
        LlcpPacket::PauseEncReq => {
            conn.llcp.enc.refresh = true;
            if !procedure::accept_peer_procedure(conn, env, ProcKind::Encryption) {
                debug!("conn {}: key refresh beside {:?}", conn.handle(), conn.llcp.active);
            }
            Event::RxPauseEncReq
        }
        LlcpPacket::PauseEncRsp => Event::RxPauseEncRsp,
        _ => return,
    };
    step(conn, env, event)
}

pub fn on_reject(conn: &mut Connection, env: &Env<'_>, reason: ErrorCode) {
    conn.llcp.enc.reason = Some(reason);
    step(conn, env, Event::RxReject);
    conn.llcp.enc.reason = None;
}

pub fn on_arq_flushed(conn: &mut Connection, env: &Env<'_>) {
    if matches!(conn.llcp.enc.state, State::FlushBeforeStart | State::FlushBeforeRestart) {
        step(conn, env, Event::ArqFlushed)
    }
}

pub fn notify_host(conn: &mut Connection, env: &Env<'_>, status: ErrorCode) {
    let connection_handle = conn.handle();
    let event = if conn.llcp.enc.refresh && status == ErrorCode::Success {
        hci::Event::EncryptionKeyRefreshComplete { status, connection_handle }
    } else {
        hci::Event::EncryptionChange {
            status,
            connection_handle,
            encryption_enabled: conn.is_encrypted(),
        }
    };
    env.ops.send_hci_event(event);
}

/// Period of the LE ping timer: the authenticated payload timeout less
/// two latency-extended intervals, and never below one interval.
pub fn ping_period_ms(conn: &Connection) -> u32 {
    let interval_ms = conn.timing.interval_us() / 1000;
    let margin_ms = 2 * interval_ms * (1 + conn.timing.latency as u32);
    let timeout_ms = conn.auth_payload_timeout as u32 * 10;
    timeout_ms.saturating_sub(margin_ms).max(interval_ms.max(1))
}

/// Restart the authenticated payload and ping timers, after the
/// encryption completes or a PDU with a valid MIC is received.
pub fn restart_auth_timers(conn: &Connection, env: &Env<'_>) {
    if !conn.is_encrypted() {
        return;
    }
    let timeout_ms = conn.auth_payload_timeout as u32 * 10;
    env.ops.start_timer(conn.id, TimerKind::AuthPayload, timeout_ms);
    env.ops.start_timer(conn.id, TimerKind::Ping, ping_period_ms(conn));
}

pub fn on_ping_timer(conn: &mut Connection, env: &Env<'_>) {
    if !conn.is_encrypted() {
        return;
    }
    if let Err(err) = procedure::start(conn, env, ProcKind::LePing, Origin::Internal) {
        debug!("conn {}: no ping: {}", conn.handle(), err);
    }
    env.ops.start_timer(conn.id, TimerKind::Ping, ping_period_ms(conn));
}

pub fn on_auth_payload_timeout(conn: &mut Connection, env: &Env<'_>) {
    if !conn.is_encrypted() {
        return;
    }
    warn!("conn {}: authenticated payload timeout", conn.handle());
    env.ops.send_hci_event(hci::Event::AuthenticatedPayloadTimeoutExpired {
        connection_handle: conn.handle(),
    });
    env.ops.start_timer(conn.id, TimerKind::AuthPayload, conn.auth_payload_timeout as u32 * 10);
}

pub fn start_ping(conn: &mut Connection, env: &Env<'_>) {
    conn.llcp.ping.state = PingState::WaitPingRsp;
    conn.send_llcp(LlcpPacket::PingReq);
    procedure::arm_response_timer(conn, env);
}

pub fn on_ping_pdu(conn: &mut Connection, env: &Env<'_>, packet: LlcpPacket) {
    match packet {
        LlcpPacket::PingReq => conn.send_llcp(LlcpPacket::PingRsp),
        LlcpPacket::PingRsp if conn.llcp.is_active(ProcKind::LePing) => {
            conn.llcp.ping.state = PingState::Idle;
            procedure::complete(conn, env, ProcKind::LePing, ErrorCode::Success)
        }
        _ => debug!("conn {}: unexpected {:?}", conn.handle(), packet),
    }
}
