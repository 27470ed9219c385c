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

//! LE connections: control procedures, connection events and the
//! data path.

use crate::config::LlConfig;
use crate::ops::ControllerOps;

pub mod arq;
pub mod chan;
pub mod conn;
pub mod isr;
pub mod manager;
pub mod procedure;
pub mod sched;

#[cfg(test)]
pub(crate) mod test;

/// Services and configuration shared by every connection.
#[derive(Clone, Copy)]
pub struct Env<'a> {
    pub ops: &'a dyn ControllerOps,
    pub config: &'a LlConfig,
}
