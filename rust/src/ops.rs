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

//! Services consumed from the rest of the controller.

use bytes::Bytes;

use crate::llcp::conn::ConnId;
use crate::llcp::sched::{Bod, ConflictResolver};
use crate::packets::{hci, llcp};

/// Per connection timers. Each timer is bound to a connection and
/// restarted (not stacked) by `start_timer`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TimerKind {
    Supervision,
    LlcpResponse,
    Ping,
    AuthPayload,
}

impl TimerKind {
    pub const ALL: [TimerKind; 4] =
        [TimerKind::Supervision, TimerKind::LlcpResponse, TimerKind::Ping, TimerKind::AuthPayload];
}

/// AES-CCM nonce, Bluetooth Core, Vol 6, Part E, 2.1.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CcmNonce {
    /// 39 bit packet (or event) counter.
    pub counter: u64,
    /// Set for PDUs sent by the central.
    pub from_central: bool,
    pub iv: [u8; 8],
}

/// Link Layer callbacks
pub trait ControllerOps {
    /// Current time of the radio clock in microseconds.
    fn now_us(&self) -> u32;

    /// Radio setup delay in microseconds.
    fn setup_delay_us(&self) -> u32;

    /// Insert a bandwidth occupancy descriptor in the radio schedule.
    /// `resolver` arbitrates overlaps with other connection events.
    /// Returns false when the descriptor could not be placed.
    fn sched_insert(&self, bod: &Bod, resolver: ConflictResolver) -> bool;

    fn sched_remove(&self, id: ConnId);

    /// Update a descriptor that is already scheduled.
    fn sched_reload(&self, bod: &Bod);

    /// Start time of the next operation scheduled after `after_us`,
    /// if any.
    fn next_op_start_us(&self, after_us: u32) -> Option<u32>;

    fn radio_enable(&self);

    fn radio_disable(&self);

    fn start_timer(&self, id: ConnId, timer: TimerKind, timeout_ms: u32);

    fn stop_timer(&self, id: ConnId, timer: TimerKind);

    fn send_hci_event(&self, event: hci::Event);

    /// Hand a received LE-U payload to the host.
    fn deliver_acl(&self, connection_handle: u16, llid: llcp::Llid, data: Bytes);

    /// Session key from the long term key and the session key
    /// diversifier, Bluetooth Core, Vol 6, Part B, 5.1.3.1.
    fn session_key(&self, ltk: &[u8; 16], skd: &[u8; 16]) -> [u8; 16];

    /// Encrypt a payload. Returns the ciphertext followed by the MIC.
    fn encrypt(&self, key: &[u8; 16], nonce: &CcmNonce, header: u8, payload: &[u8]) -> Bytes;

    /// Decrypt a payload (ciphertext followed by the MIC).
    /// Returns None when the MIC does not match.
    fn decrypt(
        &self,
        key: &[u8; 16],
        nonce: &CcmNonce,
        header: u8,
        payload: &[u8],
    ) -> Option<Bytes>;

    /// Whether connected isochronous streams still depend on the ACL.
    fn has_active_cis(&self, _connection_handle: u16) -> bool {
        false
    }
}
