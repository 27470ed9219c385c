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

//! Radio completion handlers of a connection event.
//!
//! They run at interrupt level and only touch the flow control state
//! and the queues of the ARQ. Everything else is reported through
//! [`Signals`] and handled later by the task context.

use bytes::Bytes;
use log::{trace, warn};

use crate::llcp::arq::{BufferCredits, RxVerdict, TxPdu};
use crate::llcp::conn::Connection;
use crate::llcp::sched::{self, T_IFS_US};
use crate::llcp::Env;
use crate::packets::hci::{ErrorCode, Role};
use crate::packets::llcp::DataHeader;

/// Consecutive CRC errors closing a connection event,
/// Bluetooth Core, Vol 6, Part B, 4.5.6.
const MAX_CRC_ERRORS: u8 = 2;

/// Radio operation in flight for a connection. The task context does
/// not touch the flow control state of a connection while it holds
/// one.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RadioOp {
    pub ce_start_us: u32,
    pub event_counter: u16,
    /// A packet was received, with or without a valid CRC.
    pub rx_any: bool,
    /// A packet with a valid CRC was received.
    pub rx_ok: bool,
    /// Consecutive CRC errors.
    pub crc_errors: u8,
    pub tx_count: u16,
    pub rx_count: u16,
}

impl RadioOp {
    pub fn new(ce_start_us: u32, event_counter: u16) -> Self {
        RadioOp {
            ce_start_us,
            event_counter,
            rx_any: false,
            rx_ok: false,
            crc_errors: 0,
            tx_count: 0,
            rx_count: 0,
        }
    }
}

/// Work left for the task context.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Signals {
    /// PDUs wait in the receive queue.
    pub rx_pending: bool,
    /// Transmitted PDUs were acknowledged.
    pub tx_acked: bool,
    /// A MIC-valid packet was received.
    pub authenticated: bool,
    /// The first packet of the connection was received.
    pub established: bool,
    /// The event ended.
    pub event_ended: bool,
    /// The link is closed.
    pub terminated: bool,
}

impl Signals {
    fn merge(&mut self, other: Signals) {
        self.rx_pending |= other.rx_pending;
        self.tx_acked |= other.tx_acked;
        self.authenticated |= other.authenticated;
        self.established |= other.established;
        self.event_ended |= other.event_ended;
        self.terminated |= other.terminated;
    }
}

/// Next step of the radio after a completion.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RadioAction {
    Transmit(TxPdu),
    Receive,
    Close,
}

fn next_tx(conn: &mut Connection, env: &Env<'_>, op: &RadioOp) -> TxPdu {
    let limits = conn.tx_limits();
    conn.arq.next_tx(op, limits, env.ops)
}

/// Duration of one more transmit and receive pair at the effective
/// data lengths.
fn exchange_time_us(conn: &Connection) -> u32 {
    let length = &conn.data_length;
    length.eff_max_tx_time as u32 + length.eff_max_rx_time as u32 + 2 * T_IFS_US
}

fn more_data(conn: &Connection) -> bool {
    conn.arq.flow.tx_md || conn.arq.flow.rx_md
}

fn can_continue(conn: &Connection, env: &Env<'_>, op: &RadioOp) -> bool {
    if conn.close_requested || conn.close_after_tx {
        return false;
    }
    let now_us = env.ops.now_us();
    if sched::exceeded_max_dur(conn, op, now_us, exchange_time_us(conn)) {
        trace!("conn {}: event {} reached its maximum duration", conn.handle(), op.event_counter);
        return false;
    }
    true
}

/// The radio starts the connection event. The central transmits first.
pub fn begin_op(conn: &mut Connection, env: &Env<'_>, ce_start_us: u32) -> Option<TxPdu> {
    let op = RadioOp::new(ce_start_us, conn.timing.event_counter);
    trace!("conn {}: begin event {} on channel {}", conn.handle(), op.event_counter, conn.channel);
    conn.radio_op = Some(op);
    match conn.role {
        Role::Central => Some(next_tx(conn, env, &op)),
        Role::Peripheral => None,
    }
}

/// A packet was received.
pub fn rx_complete(
    conn: &mut Connection,
    env: &Env<'_>,
    credits: &BufferCredits,
    header: &DataHeader,
    payload: Bytes,
    crc_ok: bool,
) -> (RadioAction, Signals) {
    let mut signals = Signals::default();
    let Some(mut op) = conn.radio_op.take() else {
        warn!("conn {}: reception outside of a connection event", conn.handle());
        return (RadioAction::Close, signals);
    };
    op.rx_any = true;
    op.rx_count += 1;

    if !crc_ok {
        op.crc_errors += 1;
        trace!("conn {}: CRC error {}", conn.handle(), op.crc_errors);
        conn.radio_op = Some(op);
        if op.crc_errors >= MAX_CRC_ERRORS {
            return (RadioAction::Close, signals);
        }
        // The peer sees the previous acknowledgment state again.
        let action = match conn.role {
            Role::Central if !can_continue(conn, env, &op) => RadioAction::Close,
            _ => RadioAction::Transmit(next_tx(conn, env, &op)),
        };
        return (action, signals);
    }
    op.crc_errors = 0;
    op.rx_ok = true;

    if conn.arq.rx_ack(&op, header) {
        conn.timing.tx_acked = true;
        signals.tx_acked = true;
    }
    match conn.arq.rx_accept(&op, header, payload, credits, env.ops) {
        RxVerdict::Accepted => {
            signals.rx_pending = true;
            signals.authenticated = conn.arq.cipher.rx_enabled;
        }
        RxVerdict::MicFailure | RxVerdict::Unexpected => {
            conn.radio_op = Some(op);
            conn.force_terminate(ErrorCode::ConnectionTerminatedDueToMicFailure);
            signals.terminated = true;
            return (RadioAction::Close, signals);
        }
        RxVerdict::Duplicate | RxVerdict::Empty | RxVerdict::FlowControlled => (),
    }
    conn.radio_op = Some(op);

    let action = match conn.role {
        Role::Central if more_data(conn) && can_continue(conn, env, &op) => {
            RadioAction::Transmit(next_tx(conn, env, &op))
        }
        Role::Central => RadioAction::Close,
        Role::Peripheral => RadioAction::Transmit(next_tx(conn, env, &op)),
    };
    (action, signals)
}

/// A packet was transmitted.
pub fn tx_complete(conn: &mut Connection, env: &Env<'_>) -> (RadioAction, Signals) {
    let mut signals = Signals::default();
    let Some(op) = conn.radio_op.as_mut() else {
        return (RadioAction::Close, signals);
    };
    op.tx_count += 1;
    let op = *op;

    if conn.close_after_tx {
        let reason = conn.term_reason;
        conn.force_terminate(reason);
        signals.terminated = true;
        return (RadioAction::Close, signals);
    }
    if conn.close_requested {
        return (RadioAction::Close, signals);
    }
    let action = match conn.role {
        Role::Central => RadioAction::Receive,
        Role::Peripheral if more_data(conn) && can_continue(conn, env, &op) => {
            RadioAction::Receive
        }
        Role::Peripheral => RadioAction::Close,
    };
    (action, signals)
}

fn finish_op(conn: &mut Connection, env: &Env<'_>, op: RadioOp) -> Signals {
    let mut signals = Signals { event_ended: true, ..Signals::default() };
    signals.established = sched::close_event(conn, env, &op);
    if !conn.close_requested && sched::schedule_next(conn, env) {
        return signals;
    }
    env.ops.sched_remove(conn.id);
    signals.terminated = true;
    signals
}

/// The connection event ended.
pub fn end_op(conn: &mut Connection, env: &Env<'_>) -> Signals {
    let op = conn
        .radio_op
        .take()
        .unwrap_or_else(|| RadioOp::new(conn.timing.anchor_us, conn.timing.event_counter));
    trace!(
        "conn {}: end event {} ({} tx, {} rx)",
        conn.handle(),
        op.event_counter,
        op.tx_count,
        op.rx_count
    );
    finish_op(conn, env, op)
}

/// The connection event was preempted by another radio operation.
pub fn abort_op(conn: &mut Connection, env: &Env<'_>) -> Signals {
    let op = conn
        .radio_op
        .take()
        .unwrap_or_else(|| RadioOp::new(conn.timing.anchor_us, conn.timing.event_counter));
    trace!("conn {}: event {} aborted", conn.handle(), op.event_counter);
    finish_op(conn, env, op)
}

/// Run the completion handlers of a whole connection event with the
/// given received packets, in order. Used by simulated radios.
pub fn run_event<I>(
    conn: &mut Connection,
    env: &Env<'_>,
    credits: &BufferCredits,
    ce_start_us: u32,
    rx: I,
) -> (Vec<TxPdu>, Signals)
where
    I: IntoIterator<Item = (DataHeader, Bytes, bool)>,
{
    let mut sent = vec![];
    let mut signals = Signals::default();
    if let Some(pdu) = begin_op(conn, env, ce_start_us) {
        sent.push(pdu);
        let (action, tx_signals) = tx_complete(conn, env);
        signals.merge(tx_signals);
        if action == RadioAction::Close {
            signals.merge(end_op(conn, env));
            return (sent, signals);
        }
    }
    for (header, payload, crc_ok) in rx {
        let (action, rx_signals) = rx_complete(conn, env, credits, &header, payload, crc_ok);
        signals.merge(rx_signals);
        let RadioAction::Transmit(pdu) = action else {
            break;
        };
        sent.push(pdu);
        let (action, tx_signals) = tx_complete(conn, env);
        signals.merge(tx_signals);
        if action == RadioAction::Close {
            break;
        }
    }
    signals.merge(end_op(conn, env));
    (sent, signals)
}
