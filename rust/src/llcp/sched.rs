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

//! Connection event scheduling, Bluetooth Core, Vol 6, Part B, 4.5.
//!
//! The central owns the anchor point. The peripheral derives it from
//! the last synchronization and opens its receive window early by the
//! window widening.

use log::{debug, trace, warn};
use num_integer::Integer;

use crate::llcp::conn::{ConnId, ConnState, Connection};
use crate::llcp::isr::RadioOp;
use crate::llcp::procedure::ProcKind;
use crate::llcp::Env;
use crate::ops::TimerKind;
use crate::packets::hci::{ErrorCode, Phy, Role};
use crate::packets::llcp::{ConnectionUpdateInd, PhyUpdateInd};

/// Inter frame space.
pub const T_IFS_US: u32 = 150;

/// Connection events without reception before establishment fails,
/// Bluetooth Core, Vol 6, Part B, 4.5.2.
pub const ESTABLISHMENT_EVENTS: u16 = 6;

/// Attributes compared when two connection events overlap.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ConnPriority {
    pub established: bool,
    pub supervision_imminent: bool,
    pub llcp_active: bool,
    pub tx_pending: bool,
    /// 1.25 ms units.
    pub interval: u16,
}

/// Bandwidth occupancy descriptor: the radio reservation of one
/// connection event.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Bod {
    pub id: ConnId,
    /// Start of the reservation. On the peripheral this is the anchor
    /// point less the window widening.
    pub due_us: u32,
    pub max_duration_us: u32,
    /// Peripheral receive window.
    pub rx_window_us: u32,
    pub channel: u8,
    pub event_counter: u16,
    pub priority: ConnPriority,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Winner {
    Incoming,
    Existing,
}

/// Arbitrates between an event being inserted and one already in the
/// schedule.
pub type ConflictResolver = fn(incoming: &Bod, existing: &Bod) -> Winner;

/// Established links beat links in setup, then an imminent supervision
/// timeout beats anything, then active procedures, then pending data.
/// Between otherwise equal events the shorter interval wins unless the
/// longer one is more than four times as long. Ties keep the existing
/// event.
pub fn resolve_conflict(incoming: &Bod, existing: &Bod) -> Winner {
    let (a, b) = (&incoming.priority, &existing.priority);
    let prefer = |a: bool, b: bool| match (a, b) {
        (true, false) => Some(Winner::Incoming),
        (false, true) => Some(Winner::Existing),
        _ => None,
    };

    prefer(a.established, b.established)
        .or_else(|| prefer(a.supervision_imminent, b.supervision_imminent))
        .or_else(|| prefer(a.llcp_active, b.llcp_active))
        .or_else(|| prefer(a.tx_pending, b.tx_pending))
        .or_else(|| {
            if a.interval == b.interval {
                return None;
            }
            let low = a.interval.min(b.interval) as u32;
            let high = a.interval.max(b.interval) as u32;
            let low_wins = high <= 4 * low;
            let incoming_is_low = a.interval < b.interval;
            Some(if low_wins == incoming_is_low { Winner::Incoming } else { Winner::Existing })
        })
        .unwrap_or(Winner::Existing)
}

/// At most two connection intervals remain before the supervision
/// timeout expires at `due_us`.
pub fn supervision_imminent(conn: &Connection, due_us: u32) -> bool {
    let remaining = conn.timing.supervision_deadline_us().wrapping_sub(due_us) as i32;
    remaining <= 2 * conn.timing.interval_us() as i32
}

/// Window widening at `anchor_us`, Bluetooth Core, Vol 6, Part B,
/// 4.2.4.
pub fn window_widening_us(conn: &Connection, anchor_us: u32) -> u32 {
    let elapsed = anchor_us.wrapping_sub(conn.timing.last_sync_us) as u64;
    let drift = elapsed * conn.timing.sca_ppm as u64;
    Integer::div_ceil(&drift, &1_000_000) as u32
}

/// Largest acceptable window widening.
pub fn max_window_widening_us(conn: &Connection, env: &Env<'_>) -> u32 {
    let margin = T_IFS_US.max(env.ops.setup_delay_us());
    (conn.timing.interval_us() / 2).saturating_sub(margin)
}

fn pending_instants(conn: &Connection) -> impl Iterator<Item = u16> + '_ {
    let instants = &conn.instants;
    let conn_update = instants.conn_update.map(|ind| ind.instant);
    let chan_map = instants.chan_map.map(|(_, instant)| instant);
    let phy = instants.phy.map(|ind| ind.instant);
    [conn_update, chan_map, phy].into_iter().flatten()
}

/// Peripheral latency only applies to an idle, synchronized link.
fn latency_allowed(conn: &Connection) -> bool {
    conn.role == Role::Peripheral
        && conn.state == ConnState::EstablishedReady
        && conn.timing.tx_acked
        && conn.llcp.is_idle()
        && !conn.arq.has_pending_tx()
        && conn.arq.rx_pending() == 0
}

/// Events the peripheral skips before the next one it listens to. The
/// event at an instant is never skipped.
pub fn skip_count(conn: &Connection) -> u16 {
    if !latency_allowed(conn) {
        return 0;
    }
    let counter = conn.timing.event_counter;
    pending_instants(conn)
        .map(|instant| instant.wrapping_sub(counter).saturating_sub(1))
        .fold(conn.timing.latency, u16::min)
}

fn apply_conn_update(conn: &mut Connection, ind: ConnectionUpdateInd) {
    let timing = &mut conn.timing;
    let changed = timing.interval != ind.interval
        || timing.latency != ind.latency
        || timing.timeout != ind.timeout;
    debug!(
        "conn {}: interval {} -> {}, latency {}, timeout {}",
        conn.id.handle(),
        timing.interval,
        ind.interval,
        ind.latency,
        ind.timeout
    );
    // The old interval separates the instant from the previous event.
    timing.anchor_us = timing.anchor_us.wrapping_add(ind.win_offset as u32 * 1250);
    timing.tx_window_us = ind.win_size as u32 * 1250;
    timing.interval = ind.interval;
    timing.latency = ind.latency;
    timing.timeout = ind.timeout;
    conn.llcp.conn_update.changed = changed;
    conn.llcp.instants_reached.insert(ProcKind::ConnUpdate);
}

fn apply_phy(conn: &mut Connection, ind: PhyUpdateInd) {
    let phy = |value: u8, current: Phy| match value {
        0x1 => Phy::Le1m,
        0x2 => Phy::Le2m,
        0x4 => Phy::LeCoded,
        _ => current,
    };
    let (tx, rx) = match conn.role {
        Role::Central => (ind.phy_c_to_p, ind.phy_p_to_c),
        Role::Peripheral => (ind.phy_p_to_c, ind.phy_c_to_p),
    };
    let before = (conn.phy.tx, conn.phy.rx);
    conn.phy.tx = phy(tx, conn.phy.tx);
    conn.phy.rx = phy(rx, conn.phy.rx);
    debug!("conn {}: phy {:?} -> {:?}", conn.id.handle(), before, (conn.phy.tx, conn.phy.rx));
    conn.llcp.phy.changed = before != (conn.phy.tx, conn.phy.rx);
    conn.llcp.phy.length_changed = conn.update_data_length();
    conn.llcp.instants_reached.insert(ProcKind::PhyUpdate);
}

/// Move to the next connection event, applying the changes whose
/// instant it is: connection update, then channel map, then PHY.
fn advance(conn: &mut Connection) {
    let timing = &mut conn.timing;
    timing.event_counter = timing.event_counter.wrapping_add(1);
    timing.anchor_us = timing.anchor_us.wrapping_add(timing.interval_us());
    let counter = timing.event_counter;

    if let Some(ind) = conn.instants.conn_update.filter(|ind| ind.instant == counter) {
        conn.instants.conn_update = None;
        apply_conn_update(conn, ind);
    }
    if let Some((map, _)) = conn.instants.chan_map.filter(|(_, instant)| *instant == counter) {
        conn.instants.chan_map = None;
        debug!("conn {}: channel map {:#x}", conn.id.handle(), map.mask());
        conn.chan.set_map(map);
        conn.llcp.instants_reached.insert(ProcKind::ChannelMapUpdate);
    }
    if let Some(ind) = conn.instants.phy.filter(|ind| ind.instant == counter) {
        conn.instants.phy = None;
        apply_phy(conn, ind);
    }
    conn.channel = conn.chan.next_channel(counter);
}

fn build_bod(conn: &Connection, env: &Env<'_>) -> Bod {
    let timing = &conn.timing;
    let (due_us, rx_window_us) = match conn.role {
        Role::Central => (timing.anchor_us, 0),
        Role::Peripheral => (
            timing.anchor_us.wrapping_sub(timing.window_widening_us),
            2 * timing.window_widening_us + timing.tx_window_us,
        ),
    };
    let mut limit_us = timing.interval_us();
    if let Some(next_us) = env.ops.next_op_start_us(due_us) {
        limit_us = limit_us.min(next_us.wrapping_sub(due_us));
    }
    Bod {
        id: conn.id,
        due_us,
        max_duration_us: limit_us.saturating_sub(env.config.sched_setup_delay_us),
        rx_window_us,
        channel: conn.channel,
        event_counter: timing.event_counter,
        priority: ConnPriority {
            established: matches!(
                conn.state,
                ConnState::EstablishedReady | ConnState::Terminating
            ),
            supervision_imminent: supervision_imminent(conn, due_us),
            llcp_active: conn.llcp.active.is_some() || pending_instants(conn).next().is_some(),
            tx_pending: conn.arq.has_pending_tx(),
            interval: timing.interval,
        },
    }
}

/// Insert the current event in the radio schedule, moving on to later
/// events while it is displaced. Returns false when the link had to be
/// closed.
fn insert(conn: &mut Connection, env: &Env<'_>) -> bool {
    let attempts = conn.timing.timeout_us() / conn.timing.interval_us().max(1) + 1;
    for _ in 0..attempts {
        if conn.close_requested {
            return false;
        }
        if conn.role == Role::Peripheral {
            let widening = window_widening_us(conn, conn.timing.anchor_us);
            if widening > max_window_widening_us(conn, env) {
                warn!("conn {}: excessive window widening {} us", conn.handle(), widening);
                conn.force_terminate(ErrorCode::ConnectionTimeout);
                return false;
            }
            conn.timing.window_widening_us = widening;
        }

        let bod = build_bod(conn, env);
        if env.ops.sched_insert(&bod, resolve_conflict) {
            trace!("conn {}: event {} at {} us", conn.handle(), bod.event_counter, bod.due_us);
            conn.timing.ce_max_us = bod.max_duration_us;
            return true;
        }
        trace!("conn {}: event {} displaced", conn.handle(), bod.event_counter);
        advance(conn);
    }
    warn!("conn {}: no room in the schedule", conn.handle());
    conn.force_terminate(ErrorCode::ConnectionTimeout);
    false
}

/// Schedule the first connection event after the connect request sent
/// or received at `ref_us`.
pub fn start_first_event(
    conn: &mut Connection,
    env: &Env<'_>,
    ref_us: u32,
    win_size: u8,
    win_offset: u16,
) -> bool {
    let timing = &mut conn.timing;
    timing.event_counter = 0;
    timing.anchor_us = ref_us.wrapping_add(1250 + win_offset as u32 * 1250);
    timing.last_rx_us = ref_us;
    timing.last_sync_us = ref_us;
    timing.tx_window_us = match conn.role {
        Role::Central => 0,
        Role::Peripheral => win_size as u32 * 1250,
    };
    timing.establishment_events = ESTABLISHMENT_EVENTS;
    timing.tx_acked = false;
    conn.state = ConnState::EstablishedStartup;
    conn.arq.reset_flow();
    conn.channel = conn.chan.next_channel(0);
    env.ops.start_timer(conn.id, TimerKind::Supervision, conn.timing.timeout_us() / 1000);
    insert(conn, env)
}

/// Bookkeeping at the end of a connection event. Returns true when
/// the link became established.
pub fn close_event(conn: &mut Connection, env: &Env<'_>, op: &RadioOp) -> bool {
    let timing = &mut conn.timing;
    if op.rx_any {
        timing.last_rx_us = op.ce_start_us;
    }
    if op.rx_ok && conn.role == Role::Peripheral {
        timing.last_sync_us = timing.anchor_us;
        timing.window_widening_us = 0;
        timing.tx_window_us = 0;
    }
    if op.rx_any {
        env.ops.start_timer(conn.id, TimerKind::Supervision, conn.timing.timeout_us() / 1000);
    }

    if conn.state != ConnState::EstablishedStartup {
        return false;
    }
    if op.rx_ok {
        conn.state = ConnState::EstablishedReady;
        return true;
    }
    conn.timing.establishment_events = conn.timing.establishment_events.saturating_sub(1);
    if conn.timing.establishment_events == 0 {
        conn.force_terminate(ErrorCode::ConnectionFailedToBeEstablished);
    }
    false
}

/// Schedule the event following the one that just ended, skipping
/// events under peripheral latency. Returns false when the link had to
/// be closed.
pub fn schedule_next(conn: &mut Connection, env: &Env<'_>) -> bool {
    if conn.close_requested {
        return false;
    }
    let skip = skip_count(conn);
    for _ in 0..=skip {
        advance(conn);
    }
    insert(conn, env)
}

/// The next packet exchange of `pair_us` would not end within the
/// event.
pub fn exceeded_max_dur(conn: &Connection, op: &RadioOp, now_us: u32, pair_us: u32) -> bool {
    let elapsed = now_us.wrapping_sub(op.ce_start_us);
    elapsed.saturating_add(pair_us) > conn.timing.ce_max_us
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llcp::chan::ChannelMap;
    use crate::llcp::test::{central, peripheral, TestContext};

    fn bod(priority: ConnPriority) -> Bod {
        Bod {
            id: ConnId { index: 0, generation: 0 },
            due_us: 0,
            max_duration_us: 0,
            rx_window_us: 0,
            channel: 0,
            event_counter: 0,
            priority,
        }
    }

    #[test]
    fn conflict_priorities() {
        let base = ConnPriority { established: true, interval: 24, ..ConnPriority::default() };
        let check = |incoming: ConnPriority, existing: ConnPriority| {
            resolve_conflict(&bod(incoming), &bod(existing))
        };

        assert_eq!(check(base, ConnPriority { established: false, ..base }), Winner::Incoming);
        assert_eq!(
            check(base, ConnPriority { supervision_imminent: true, ..base }),
            Winner::Existing
        );
        assert_eq!(
            check(
                ConnPriority { supervision_imminent: true, ..base },
                ConnPriority { llcp_active: true, tx_pending: true, ..base }
            ),
            Winner::Incoming
        );
        assert_eq!(check(ConnPriority { llcp_active: true, ..base }, base), Winner::Incoming);
        assert_eq!(check(base, ConnPriority { tx_pending: true, ..base }), Winner::Existing);
        // Shorter interval, within four times the longer one.
        assert_eq!(check(base, ConnPriority { interval: 96, ..base }), Winner::Incoming);
        // Longer one is more than four times as long.
        assert_eq!(check(base, ConnPriority { interval: 97, ..base }), Winner::Existing);
        assert_eq!(check(base, base), Winner::Existing);
    }

    #[test]
    fn widening_from_clock_accuracy() {
        let ctx = TestContext::new();
        let mut conn = peripheral(&ctx);
        conn.timing.sca_ppm = 70;
        conn.timing.last_sync_us = 1_000;
        assert_eq!(window_widening_us(&conn, 1_000), 0);
        assert_eq!(window_widening_us(&conn, 1_000 + 30_000), 3);
        assert_eq!(window_widening_us(&conn, 1_000 + 1_000_000), 70);
        // Clock wrap.
        conn.timing.last_sync_us = u32::MAX - 9_999;
        assert_eq!(window_widening_us(&conn, 20_000), 3);

        let env = ctx.env();
        assert_eq!(max_window_widening_us(&conn, &env), 15_000 - T_IFS_US);
    }

    #[test]
    fn excessive_widening_closes_the_link() {
        let ctx = TestContext::new();
        let env = ctx.env();
        let mut conn = peripheral(&ctx);
        conn.timing.sca_ppm = 500;
        conn.timing.last_sync_us = 0;
        // 31 s without synchronization.
        conn.timing.anchor_us = 31_000_000;
        conn.timing.event_counter = 1000;
        assert!(!schedule_next(&mut conn, &env));
        assert!(conn.close_requested);
        assert_eq!(conn.term_reason, ErrorCode::ConnectionTimeout);
    }

    #[test]
    fn latency_stops_before_instant() {
        let ctx = TestContext::new();
        let mut conn = peripheral(&ctx);
        conn.timing.latency = 10;
        conn.timing.tx_acked = true;
        conn.timing.event_counter = 100;
        assert_eq!(skip_count(&conn), 10);

        conn.instants.chan_map = Some((ChannelMap::all(), 104));
        assert_eq!(skip_count(&conn), 3);
        conn.instants.chan_map = Some((ChannelMap::all(), 101));
        assert_eq!(skip_count(&conn), 0);
        conn.instants.chan_map = None;

        conn.llcp.active = Some(ProcKind::FeatureExchange);
        assert_eq!(skip_count(&conn), 0);
        conn.llcp.active = None;

        let central = central(&ctx);
        assert_eq!(skip_count(&central), 0);
    }

    #[test]
    fn peripheral_skips_latency_events() {
        let ctx = TestContext::new();
        let env = ctx.env();
        let mut conn = peripheral(&ctx);
        conn.timing.latency = 3;
        conn.timing.tx_acked = true;
        conn.timing.last_sync_us = 0;
        conn.timing.anchor_us = 0;

        assert!(schedule_next(&mut conn, &env));
        assert_eq!(conn.timing.event_counter, 4);
        assert_eq!(conn.timing.anchor_us, 4 * 30_000);
        let bods = ctx.take_bods();
        assert_eq!(bods.len(), 1);
        assert_eq!(bods[0].event_counter, 4);
        assert_eq!(bods[0].due_us, 4 * 30_000 - conn.timing.window_widening_us);
    }

    #[test]
    fn update_applied_at_instant() {
        let ctx = TestContext::new();
        let env = ctx.env();
        let mut conn = central(&ctx);
        conn.timing.event_counter = 9;
        conn.timing.anchor_us = 1_000;
        conn.instants.conn_update = Some(ConnectionUpdateInd {
            win_size: 1,
            win_offset: 2,
            interval: 40,
            latency: 1,
            timeout: 200,
            instant: 10,
        });

        assert!(schedule_next(&mut conn, &env));
        assert_eq!(conn.timing.event_counter, 10);
        assert_eq!(conn.timing.anchor_us, 1_000 + 30_000 + 2_500);
        assert_eq!((conn.timing.interval, conn.timing.latency, conn.timing.timeout), (40, 1, 200));
        assert!(conn.llcp.conn_update.changed);
        assert!(conn.llcp.instants_reached.contains(ProcKind::ConnUpdate));
        assert_eq!(conn.instants.conn_update, None);

        assert!(schedule_next(&mut conn, &env));
        assert_eq!(conn.timing.anchor_us, 1_000 + 30_000 + 2_500 + 50_000);
    }

    #[test]
    fn phy_applied_at_instant() {
        let ctx = TestContext::new();
        let env = ctx.env();
        let mut conn = peripheral(&ctx);
        conn.instants.phy = Some(PhyUpdateInd { phy_c_to_p: 0x4, phy_p_to_c: 0, instant: 1 });

        assert!(schedule_next(&mut conn, &env));
        assert_eq!((conn.phy.tx, conn.phy.rx), (Phy::Le1m, Phy::LeCoded));
        assert!(conn.llcp.phy.changed);
        assert!(conn.llcp.phy.length_changed);
        assert!(conn.llcp.instants_reached.contains(ProcKind::PhyUpdate));
    }

    #[test]
    fn displaced_event_moves_to_the_next_interval() {
        let ctx = TestContext::new();
        let env = ctx.env();
        let mut conn = central(&ctx);
        conn.timing.anchor_us = 0;
        ctx.refuse_inserts(2);

        assert!(schedule_next(&mut conn, &env));
        assert_eq!(conn.timing.event_counter, 3);
        assert_eq!(ctx.take_bods().last().map(|bod| bod.event_counter), Some(3));
    }

    #[test]
    fn event_bounded_by_next_operation() {
        let ctx = TestContext::new();
        let env = ctx.env();
        let mut conn = central(&ctx);
        conn.timing.anchor_us = 0;
        ctx.set_next_op(Some(30_000 + 10_000));

        assert!(schedule_next(&mut conn, &env));
        assert_eq!(conn.timing.ce_max_us, 10_000 - env.config.sched_setup_delay_us);

        let op = RadioOp::new(30_000, 1);
        assert!(!exceeded_max_dur(&conn, &op, 30_000 + 5_000, 1_000));
        assert!(exceeded_max_dur(&conn, &op, 30_000 + 9_000, 1_000));
    }

    #[test]
    fn supervision_margin() {
        let ctx = TestContext::new();
        let mut conn = central(&ctx);
        // 1 s timeout, 30 ms interval.
        conn.timing.last_rx_us = 0;
        assert!(!supervision_imminent(&conn, 900_000));
        assert!(supervision_imminent(&conn, 940_000));
        assert!(supervision_imminent(&conn, 1_200_000));
    }

    #[test]
    fn establishment_fails_after_six_silent_events() {
        let ctx = TestContext::new();
        let env = ctx.env();
        let mut conn = peripheral(&ctx);
        assert!(start_first_event(&mut conn, &env, 0, 2, 0));
        assert_eq!(conn.state, ConnState::EstablishedStartup);

        for _ in 0..5 {
            let op = RadioOp::new(conn.timing.anchor_us, conn.timing.event_counter);
            assert!(!close_event(&mut conn, &env, &op));
            assert!(schedule_next(&mut conn, &env));
        }
        let op = RadioOp::new(conn.timing.anchor_us, conn.timing.event_counter);
        close_event(&mut conn, &env, &op);
        assert!(conn.close_requested);
        assert_eq!(conn.term_reason, ErrorCode::ConnectionFailedToBeEstablished);
    }

    #[test]
    fn first_packet_establishes() {
        let ctx = TestContext::new();
        let env = ctx.env();
        let mut conn = peripheral(&ctx);
        assert!(start_first_event(&mut conn, &env, 0, 2, 1));
        assert_eq!(conn.timing.anchor_us, 2_500);
        assert_eq!(conn.timing.tx_window_us, 2_500);

        let mut op = RadioOp::new(conn.timing.anchor_us, 0);
        op.rx_any = true;
        op.rx_ok = true;
        assert!(close_event(&mut conn, &env, &op));
        assert_eq!(conn.state, ConnState::EstablishedReady);
        assert_eq!(conn.timing.last_sync_us, 2_500);
        assert_eq!(conn.timing.tx_window_us, 0);
    }
}
