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

//! Acknowledged data path of a connection.
//!
//! Outgoing SDUs wait in the pause queue while data is administratively
//! paused, then in the ARQ queue until every fragment has been
//! acknowledged by the peer. Received PDUs wait in the receive queue
//! until the task context delivers them.

use std::cell::Cell;
use std::collections::VecDeque;

use bytes::Bytes;
use critical_section::Mutex;
use log::{trace, warn};

use crate::config::NonceMode;
use crate::llcp::isr::RadioOp;
use crate::ops::{CcmNonce, ControllerOps};
use crate::packets::hci::Phy;
use crate::packets::llcp::{DataHeader, LlcpPacket, Llid, Opcode, MIC_LEN};

/// Controller wide buffer credits, shared by the task context and the
/// radio interrupt.
pub struct BufferCredits {
    tx: Mutex<Cell<u16>>,
    rx: Mutex<Cell<u16>>,
}

impl BufferCredits {
    pub fn new(num_tx: u16, num_rx: u16) -> Self {
        BufferCredits { tx: Mutex::new(Cell::new(num_tx)), rx: Mutex::new(Cell::new(num_rx)) }
    }

    fn take(counter: &Mutex<Cell<u16>>) -> bool {
        critical_section::with(|cs| {
            let credits = counter.borrow(cs);
            match credits.get().checked_sub(1) {
                Some(remaining) => {
                    credits.set(remaining);
                    true
                }
                None => false,
            }
        })
    }

    fn give(counter: &Mutex<Cell<u16>>, count: u16) {
        critical_section::with(|cs| {
            let credits = counter.borrow(cs);
            credits.set(credits.get().saturating_add(count));
        })
    }

    pub fn take_tx(&self) -> bool {
        BufferCredits::take(&self.tx)
    }

    pub fn give_tx(&self, count: u16) {
        BufferCredits::give(&self.tx, count)
    }

    pub fn take_rx(&self) -> bool {
        BufferCredits::take(&self.rx)
    }

    pub fn give_rx(&self, count: u16) {
        BufferCredits::give(&self.rx, count)
    }

    pub fn available_tx(&self) -> u16 {
        critical_section::with(|cs| self.tx.borrow(cs).get())
    }

    pub fn available_rx(&self) -> u16 {
        critical_section::with(|cs| self.rx.borrow(cs).get())
    }
}

/// Air time of a data channel PDU, preamble to CRC included.
/// The coded PHY is accounted with S=8.
pub fn pdu_time_us(phy: Phy, payload_len: usize) -> u32 {
    let len = payload_len as u32;
    match phy {
        Phy::Le1m => 80 + 8 * len,
        Phy::Le2m => 44 + 4 * len,
        Phy::LeCoded => 720 + 64 * len,
    }
}

fn max_payload_for_time(phy: Phy, time_us: u16) -> usize {
    let time_us = time_us as usize;
    match phy {
        Phy::Le1m => time_us.saturating_sub(80) / 8,
        Phy::Le2m => time_us.saturating_sub(44) / 4,
        Phy::LeCoded => time_us.saturating_sub(720) / 64,
    }
}

/// Bounds applied when an SDU is cut into fragments.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TxLimits {
    pub max_octets: u16,
    pub max_time_us: u16,
    pub phy: Phy,
}

impl TxLimits {
    pub fn max_fragment(&self, encrypted: bool) -> usize {
        let mic = if encrypted { MIC_LEN } else { 0 };
        let by_time = max_payload_for_time(self.phy, self.max_time_us).saturating_sub(mic);
        by_time.min(self.max_octets as usize).max(1)
    }
}

/// Origin of a queued SDU, reported back when it is acknowledged.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TxKind {
    Acl,
    Control(Opcode),
}

struct TxSdu {
    kind: TxKind,
    llid: Llid,
    data: Bytes,
    offset: usize,
    /// Fragment length, fixed when the first fragment is cut.
    frag_len: Option<usize>,
}

impl TxSdu {
    fn remaining(&self) -> usize {
        self.data.len() - self.offset
    }
}

struct InFlight {
    llid: Llid,
    payload: Bytes,
    plain_len: usize,
    from_queue: bool,
}

/// PDU handed to the radio.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TxPdu {
    pub header: DataHeader,
    pub payload: Bytes,
}

/// PDU waiting for delivery to the task context.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RxPdu {
    pub llid: Llid,
    pub payload: Bytes,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RxVerdict {
    /// Retransmission of a PDU that was already accepted.
    Duplicate,
    /// Accepted empty PDU.
    Empty,
    Accepted,
    /// No receive buffer: the PDU is left unacknowledged.
    FlowControlled,
    MicFailure,
    /// Data PDU received while data reception is paused.
    Unexpected,
}

/// Sequence numbering of the data channel.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FlowControl {
    /// Transmit sequence number.
    pub sn: bool,
    /// Next expected sequence number.
    pub nesn: bool,
    /// More data announced by the last transmitted PDU.
    pub tx_md: bool,
    /// More data announced by the last received PDU.
    pub rx_md: bool,
}

/// Encryption state of the data path.
#[derive(Clone, Debug)]
pub struct Cipher {
    pub tx_enabled: bool,
    pub rx_enabled: bool,
    pub session_key: [u8; 16],
    pub iv: [u8; 8],
    pub tx_counter: u64,
    pub rx_counter: u64,
    pub nonce_mode: NonceMode,
    pub central: bool,
}

const COUNTER_MASK: u64 = (1 << 39) - 1;

impl Cipher {
    fn new(central: bool, nonce_mode: NonceMode) -> Self {
        Cipher {
            tx_enabled: false,
            rx_enabled: false,
            session_key: [0; 16],
            iv: [0; 8],
            tx_counter: 0,
            rx_counter: 0,
            nonce_mode,
            central,
        }
    }

    /// Install a new key and restart both packet counters.
    pub fn rekey(&mut self, session_key: [u8; 16], iv: [u8; 8]) {
        self.session_key = session_key;
        self.iv = iv;
        self.tx_counter = 0;
        self.rx_counter = 0;
    }

    fn nonce(&self, counter: u64, event_counter: u16, from_central: bool) -> CcmNonce {
        let counter = match self.nonce_mode {
            NonceMode::PacketCounter => counter,
            NonceMode::EventCounter => event_counter as u64,
        };
        CcmNonce { counter: counter & COUNTER_MASK, from_central, iv: self.iv }
    }
}

pub struct Arq {
    pub flow: FlowControl,
    pause_queue: VecDeque<TxSdu>,
    arq_queue: VecDeque<TxSdu>,
    rx_queue: VecDeque<RxPdu>,
    in_flight: Option<InFlight>,
    pub tx_data_paused: bool,
    pub rx_data_paused: bool,
    pub empty_pdu_pending: bool,
    pub first_attempt: bool,
    /// Cut the next fragment with the current limits even when the
    /// head SDU is already partially sent.
    pub force_start_frag: bool,
    /// ACL SDUs acknowledged and not yet reported to the host.
    pub tx_completed: u16,
    acked_control: VecDeque<Opcode>,
    pub cipher: Cipher,
    max_descriptors: usize,
}

/// Buffers released by `Arq::drain`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Drained {
    pub tx_acl: u16,
    pub rx_data: u16,
}

impl Arq {
    pub fn new(central: bool, nonce_mode: NonceMode, max_descriptors: usize) -> Self {
        Arq {
            flow: FlowControl::default(),
            pause_queue: VecDeque::new(),
            arq_queue: VecDeque::new(),
            rx_queue: VecDeque::new(),
            in_flight: None,
            tx_data_paused: false,
            rx_data_paused: false,
            empty_pdu_pending: false,
            first_attempt: false,
            force_start_frag: false,
            tx_completed: 0,
            acked_control: VecDeque::new(),
            cipher: Cipher::new(central, nonce_mode),
            max_descriptors,
        }
    }

    fn queued_acl(&self) -> usize {
        self.pause_queue.len()
            + self.arq_queue.iter().filter(|sdu| sdu.kind == TxKind::Acl).count()
    }

    /// Queue an ACL SDU. Returns false when every descriptor is in use.
    pub fn queue_acl(&mut self, llid: Llid, data: Bytes) -> bool {
        if self.queued_acl() >= self.max_descriptors {
            return false;
        }
        let sdu = TxSdu { kind: TxKind::Acl, llid, data, offset: 0, frag_len: None };
        if self.tx_data_paused {
            self.pause_queue.push_back(sdu);
        } else {
            self.arq_queue.push_back(sdu);
        }
        true
    }

    /// Queue a control PDU. Control PDUs are never paused.
    pub fn queue_control(&mut self, packet: &LlcpPacket) {
        self.arq_queue.push_back(TxSdu {
            kind: TxKind::Control(packet.opcode()),
            llid: Llid::Control,
            data: packet.to_bytes(),
            offset: 0,
            frag_len: None,
        });
    }

    pub fn pause_tx_data(&mut self) {
        self.tx_data_paused = true;
    }

    pub fn resume_tx_data(&mut self) {
        self.tx_data_paused = false;
        self.arq_queue.extend(self.pause_queue.drain(..));
    }

    /// No ACL data is waiting for acknowledgment.
    pub fn is_flushed(&self) -> bool {
        !self.arq_queue.iter().any(|sdu| sdu.kind == TxKind::Acl)
    }

    /// Anything is waiting for transmission or acknowledgment.
    pub fn has_pending_tx(&self) -> bool {
        !self.arq_queue.is_empty() || self.in_flight.as_ref().is_some_and(|f| f.from_queue)
    }

    pub fn take_acked_control(&mut self) -> Option<Opcode> {
        self.acked_control.pop_front()
    }

    pub fn take_tx_completed(&mut self) -> u16 {
        std::mem::take(&mut self.tx_completed)
    }

    pub fn rx_pending(&self) -> usize {
        self.rx_queue.len()
    }

    pub fn pop_rx(&mut self) -> Option<RxPdu> {
        self.rx_queue.pop_front()
    }

    /// Release every queued buffer.
    pub fn drain(&mut self) -> Drained {
        let tx_acl = self
            .pause_queue
            .drain(..)
            .chain(self.arq_queue.drain(..))
            .filter(|sdu| sdu.kind == TxKind::Acl)
            .count() as u16;
        let rx_data =
            self.rx_queue.drain(..).filter(|pdu| pdu.llid != Llid::Control).count() as u16;
        self.in_flight = None;
        self.acked_control.clear();
        Drained { tx_acl: tx_acl + std::mem::take(&mut self.tx_completed), rx_data }
    }

    fn more_data(&self) -> bool {
        match (self.arq_queue.front(), &self.in_flight) {
            (Some(head), Some(in_flight)) if in_flight.from_queue => {
                head.remaining() > in_flight.plain_len || self.arq_queue.len() > 1
            }
            (Some(_), _) => true,
            (None, _) => false,
        }
    }

    /// PDU to transmit next. Unacknowledged PDUs are retransmitted
    /// unchanged, only the header bits are refreshed.
    pub fn next_tx(&mut self, op: &RadioOp, limits: TxLimits, ops: &dyn ControllerOps) -> TxPdu {
        if self.in_flight.is_some() {
            self.first_attempt = false;
        } else {
            self.in_flight = Some(self.cut_fragment(op, limits, ops));
            self.first_attempt = true;
        }

        let md = self.more_data();
        self.flow.tx_md = md;
        match &self.in_flight {
            Some(in_flight) => {
                self.empty_pdu_pending = !in_flight.from_queue;
                TxPdu {
                    header: DataHeader {
                        llid: in_flight.llid,
                        nesn: self.flow.nesn,
                        sn: self.flow.sn,
                        md,
                        length: in_flight.payload.len() as u8,
                    },
                    payload: in_flight.payload.clone(),
                }
            }
            None => TxPdu {
                header: DataHeader::empty(self.flow.sn, self.flow.nesn, md),
                payload: Bytes::new(),
            },
        }
    }

    fn cut_fragment(
        &mut self,
        op: &RadioOp,
        limits: TxLimits,
        ops: &dyn ControllerOps,
    ) -> InFlight {
        let force = std::mem::take(&mut self.force_start_frag);
        let encrypted = self.cipher.tx_enabled;
        let Some(head) = self.arq_queue.front_mut() else {
            return InFlight {
                llid: Llid::Continuation,
                payload: Bytes::new(),
                plain_len: 0,
                from_queue: false,
            };
        };

        if force || head.frag_len.is_none() {
            // Control PDUs are never fragmented.
            head.frag_len = Some(match head.kind {
                TxKind::Control(_) => head.data.len(),
                TxKind::Acl => limits.max_fragment(encrypted),
            });
        }
        let frag_len = head.frag_len.unwrap_or(1).min(head.remaining());
        let llid = match head.kind {
            TxKind::Control(_) => Llid::Control,
            TxKind::Acl if head.offset == 0 => head.llid,
            TxKind::Acl => Llid::Continuation,
        };
        let plain = head.data.slice(head.offset..head.offset + frag_len);

        let payload = if encrypted && !plain.is_empty() {
            let nonce =
                self.cipher.nonce(self.cipher.tx_counter, op.event_counter, self.cipher.central);
            self.cipher.tx_counter = (self.cipher.tx_counter + 1) & COUNTER_MASK;
            ops.encrypt(&self.cipher.session_key, &nonce, llid as u8, &plain)
        } else {
            plain
        };
        trace!("arq: fragment {:?} {} octets at offset {}", llid, frag_len, head.offset);
        InFlight { llid, payload, plain_len: frag_len, from_queue: true }
    }

    /// Process the acknowledgment bit of a received header.
    /// Returns true when the last transmitted PDU was acknowledged.
    pub fn rx_ack(&mut self, _op: &RadioOp, header: &DataHeader) -> bool {
        if header.nesn == self.flow.sn {
            return false;
        }
        let Some(in_flight) = self.in_flight.take() else {
            return false;
        };
        self.flow.sn = !self.flow.sn;
        self.empty_pdu_pending = false;

        if in_flight.from_queue {
            if let Some(head) = self.arq_queue.front_mut() {
                head.offset += in_flight.plain_len;
                if head.remaining() == 0 {
                    match head.kind {
                        TxKind::Acl => self.tx_completed += 1,
                        TxKind::Control(opcode) => self.acked_control.push_back(opcode),
                    }
                    self.arq_queue.pop_front();
                }
            }
        }
        true
    }

    /// Accept or refuse a received PDU. Control PDUs bypass receive
    /// buffer flow control.
    pub fn rx_accept(
        &mut self,
        op: &RadioOp,
        header: &DataHeader,
        payload: Bytes,
        credits: &BufferCredits,
        ops: &dyn ControllerOps,
    ) -> RxVerdict {
        self.flow.rx_md = header.md;
        if header.sn != self.flow.nesn {
            return RxVerdict::Duplicate;
        }
        if header.length == 0 {
            self.flow.nesn = !self.flow.nesn;
            return RxVerdict::Empty;
        }

        let control = header.llid == Llid::Control;
        if !control && self.rx_data_paused {
            return RxVerdict::Unexpected;
        }
        if !control && !credits.take_rx() {
            trace!("arq: no receive buffer, flow controlling peer");
            return RxVerdict::FlowControlled;
        }

        let payload = if self.cipher.rx_enabled {
            let nonce =
                self.cipher.nonce(self.cipher.rx_counter, op.event_counter, !self.cipher.central);
            match ops.decrypt(&self.cipher.session_key, &nonce, header.llid as u8, &payload) {
                Some(plain) => {
                    self.cipher.rx_counter = (self.cipher.rx_counter + 1) & COUNTER_MASK;
                    plain
                }
                None => {
                    warn!("arq: MIC failure");
                    if !control {
                        credits.give_rx(1);
                    }
                    return RxVerdict::MicFailure;
                }
            }
        } else {
            payload
        };

        self.flow.nesn = !self.flow.nesn;
        self.rx_queue.push_back(RxPdu { llid: header.llid, payload });
        RxVerdict::Accepted
    }

    /// Reset sequence numbering, used when a connection starts.
    pub fn reset_flow(&mut self) {
        self.flow = FlowControl::default();
        self.in_flight = None;
    }
}
