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

use std::cell::{Cell, RefCell};
use std::collections::{HashMap, HashSet, VecDeque};

use bytes::Bytes;

use crate::config::LlConfig;
use crate::llcp::conn::{ConnId, Connection};
use crate::llcp::isr::RadioOp;
use crate::llcp::sched::{Bod, ConflictResolver, Winner};
use crate::llcp::Env;
use crate::ops::{CcmNonce, ControllerOps, TimerKind};
use crate::packets::hci;
use crate::packets::llcp::{DataHeader, LlcpPacket, Llid, MIC_LEN};

/// Recording controller: every service call is kept for inspection.
#[derive(Default)]
pub struct TestContext {
    pub config: LlConfig,
    pub hci_events: RefCell<VecDeque<hci::Event>>,
    pub acl_packets: RefCell<VecDeque<(u16, Llid, Bytes)>>,
    pub timers: RefCell<HashMap<(ConnId, TimerKind), u32>>,
    pub bods: RefCell<Vec<Bod>>,
    pub removed: RefCell<Vec<ConnId>>,
    /// Event already in the schedule, arbitrated by the resolver.
    pub competitor: Cell<Option<Bod>>,
    pub active_cis: RefCell<HashSet<u16>>,
    pub radio_enabled: Cell<bool>,
    refused_inserts: Cell<u32>,
    next_op: Cell<Option<u32>>,
    now: Cell<u32>,
}

impl TestContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_config(config: LlConfig) -> Self {
        TestContext { config, ..Self::default() }
    }

    pub fn env(&self) -> Env<'_> {
        Env { ops: self, config: &self.config }
    }

    pub fn now(&self) -> u32 {
        self.now.get()
    }

    pub fn set_now(&self, now_us: u32) {
        self.now.set(now_us)
    }

    pub fn set_next_op(&self, start_us: Option<u32>) {
        self.next_op.set(start_us)
    }

    /// Refuse the next `count` schedule insertions.
    pub fn refuse_inserts(&self, count: u32) {
        self.refused_inserts.set(count)
    }

    pub fn take_events(&self) -> Vec<hci::Event> {
        self.hci_events.borrow_mut().drain(..).collect()
    }

    pub fn take_acl(&self) -> Vec<(u16, Llid, Bytes)> {
        self.acl_packets.borrow_mut().drain(..).collect()
    }

    pub fn take_bods(&self) -> Vec<Bod> {
        self.bods.borrow_mut().drain(..).collect()
    }

    pub fn take_removed(&self) -> Vec<ConnId> {
        self.removed.borrow_mut().drain(..).collect()
    }

    pub fn timer(&self, id: ConnId, timer: TimerKind) -> Option<u32> {
        self.timers.borrow().get(&(id, timer)).copied()
    }

    /// Transmit everything queued on `conn`, acknowledging each PDU as
    /// the peer would, and return the control PDUs.
    pub fn take_llcp(&self, conn: &mut Connection) -> Vec<LlcpPacket> {
        let op = RadioOp::new(self.now(), conn.timing.event_counter);
        let mut packets = vec![];
        while conn.arq.has_pending_tx() {
            let encrypted = conn.arq.cipher.tx_enabled;
            let key = conn.arq.cipher.session_key;
            let limits = conn.tx_limits();
            let pdu = conn.arq.next_tx(&op, limits, self);
            let ack = DataHeader::empty(false, !conn.arq.flow.sn, false);
            conn.arq.rx_ack(&op, &ack);
            if pdu.header.llid != Llid::Control {
                continue;
            }
            let payload = if encrypted {
                let cipher = &pdu.payload[..pdu.payload.len() - MIC_LEN];
                Bytes::from(keystream(&key, cipher))
            } else {
                pdu.payload
            };
            packets.push(LlcpPacket::parse(&payload).unwrap());
        }
        packets
    }
}

fn keystream(key: &[u8; 16], data: &[u8]) -> Vec<u8> {
    data.iter().map(|byte| byte ^ key[0]).collect()
}

fn mic(key: &[u8; 16], nonce: &CcmNonce, plain: &[u8]) -> [u8; MIC_LEN] {
    [
        key[1] ^ nonce.counter as u8,
        (nonce.counter >> 8) as u8,
        0xa0 | nonce.from_central as u8,
        plain.iter().fold(0xa5, |acc, byte| acc ^ byte),
    ]
}

impl ControllerOps for TestContext {
    fn now_us(&self) -> u32 {
        self.now.get()
    }

    fn setup_delay_us(&self) -> u32 {
        100
    }

    fn sched_insert(&self, bod: &Bod, resolver: ConflictResolver) -> bool {
        let refused = self.refused_inserts.get();
        if refused > 0 {
            self.refused_inserts.set(refused - 1);
            return false;
        }
        if let Some(existing) = self.competitor.get() {
            let overlap = bod.due_us < existing.due_us + existing.max_duration_us
                && existing.due_us < bod.due_us + bod.max_duration_us;
            if overlap && resolver(bod, &existing) == Winner::Existing {
                return false;
            }
        }
        self.bods.borrow_mut().push(*bod);
        true
    }

    fn sched_remove(&self, id: ConnId) {
        self.removed.borrow_mut().push(id);
    }

    fn sched_reload(&self, bod: &Bod) {
        self.bods.borrow_mut().push(*bod);
    }

    fn next_op_start_us(&self, _after_us: u32) -> Option<u32> {
        self.next_op.get()
    }

    fn radio_enable(&self) {
        self.radio_enabled.set(true)
    }

    fn radio_disable(&self) {
        self.radio_enabled.set(false)
    }

    fn start_timer(&self, id: ConnId, timer: TimerKind, timeout_ms: u32) {
        self.timers.borrow_mut().insert((id, timer), timeout_ms);
    }

    fn stop_timer(&self, id: ConnId, timer: TimerKind) {
        self.timers.borrow_mut().remove(&(id, timer));
    }

    fn send_hci_event(&self, event: hci::Event) {
        self.hci_events.borrow_mut().push_back(event);
    }

    fn deliver_acl(&self, connection_handle: u16, llid: Llid, data: Bytes) {
        self.acl_packets.borrow_mut().push_back((connection_handle, llid, data));
    }

    fn session_key(&self, ltk: &[u8; 16], skd: &[u8; 16]) -> [u8; 16] {
        let mut key = [0; 16];
        for (i, byte) in key.iter_mut().enumerate() {
            *byte = ltk[i] ^ skd[i];
        }
        key
    }

    fn encrypt(&self, key: &[u8; 16], nonce: &CcmNonce, _header: u8, payload: &[u8]) -> Bytes {
        let mut out = keystream(key, payload);
        out.extend_from_slice(&mic(key, nonce, payload));
        Bytes::from(out)
    }

    fn decrypt(
        &self,
        key: &[u8; 16],
        nonce: &CcmNonce,
        _header: u8,
        payload: &[u8],
    ) -> Option<Bytes> {
        let split = payload.len().checked_sub(MIC_LEN)?;
        let plain = keystream(key, &payload[..split]);
        (payload[split..] == mic(key, nonce, &plain)).then(|| Bytes::from(plain))
    }

    fn has_active_cis(&self, connection_handle: u16) -> bool {
        self.active_cis.borrow().contains(&connection_handle)
    }
}
