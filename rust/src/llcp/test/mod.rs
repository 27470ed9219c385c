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

mod context;

pub use context::TestContext;

use crate::llcp::chan::ALL_DATA_CHANNELS;
use crate::llcp::conn::{ConnId, ConnState, Connection, ConnectionParams};
use crate::packets::hci::Role;

pub const ACCESS_ADDRESS: u32 = 0x5065_9a3c;

pub fn params() -> ConnectionParams {
    ConnectionParams {
        access_address: ACCESS_ADDRESS,
        crc_init: 0x55_5555,
        win_size: 2,
        win_offset: 0,
        interval: 24,
        latency: 0,
        timeout: 100,
        channel_map: ALL_DATA_CHANNELS,
        hop_increment: 7,
        sca: 0,
        csa2: true,
    }
}

/// Established link with the default configuration, 30 ms interval
/// and 1 s supervision timeout. Its first event is at time zero.
pub fn established(ctx: &TestContext, index: u16, role: Role) -> Connection {
    let id = ConnId { index, generation: 0 };
    let mut conn = Connection::new(id, role, &params(), &ctx.config);
    conn.state = ConnState::EstablishedReady;
    conn.timing.ce_max_us = conn.timing.interval_us();
    conn
}

pub fn central(ctx: &TestContext) -> Connection {
    established(ctx, 0, Role::Central)
}

pub fn peripheral(ctx: &TestContext) -> Connection {
    established(ctx, 1, Role::Peripheral)
}
