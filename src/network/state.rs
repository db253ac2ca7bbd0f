// Copyright 2025 jonefeewang@gmail.com
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::sync::atomic::{AtomicU8, Ordering};

use crate::{AppError, AppResult};

/// Lifecycle of a connection.
///
/// ```text
/// Init       --dial--------> Connecting
/// Connecting --dial ok-----> Connected
/// Connecting --dial failed-> ConnectFailed
/// Init       --accepted----> Connected
/// Connected  --error/close-> Disconnected
/// ```
/// `Disconnected` and `ConnectFailed` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ConnectionState {
    Init = 0,
    Connecting = 1,
    Connected = 2,
    Disconnected = 3,
    ConnectFailed = 4,
}

impl ConnectionState {
    fn from_u8(value: u8) -> ConnectionState {
        match value {
            0 => ConnectionState::Init,
            1 => ConnectionState::Connecting,
            2 => ConnectionState::Connected,
            3 => ConnectionState::Disconnected,
            _ => ConnectionState::ConnectFailed,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ConnectionState::Disconnected | ConnectionState::ConnectFailed
        )
    }

    /// States in which outgoing messages may be queued.
    pub fn accepts_send(self) -> bool {
        matches!(
            self,
            ConnectionState::Connecting | ConnectionState::Connected
        )
    }
}

/// Atomic holder of a [`ConnectionState`]; every allowed edge has its own method and
/// succeeds only through a compare-and-set from the expected source state.
#[derive(Debug)]
pub struct ConnectionStateCell {
    state: AtomicU8,
}

impl ConnectionStateCell {
    pub fn new() -> Self {
        ConnectionStateCell {
            state: AtomicU8::new(ConnectionState::Init as u8),
        }
    }

    pub fn get(&self) -> ConnectionState {
        ConnectionState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn begin_dial(&self) -> AppResult<()> {
        self.transition(ConnectionState::Init, ConnectionState::Connecting)
    }

    pub fn dial_succeeded(&self) -> AppResult<()> {
        self.transition(ConnectionState::Connecting, ConnectionState::Connected)
    }

    pub fn dial_failed(&self) -> AppResult<()> {
        self.transition(ConnectionState::Connecting, ConnectionState::ConnectFailed)
    }

    pub fn accepted(&self) -> AppResult<()> {
        self.transition(ConnectionState::Init, ConnectionState::Connected)
    }

    /// Only one caller ever wins this edge, which makes the disconnect notification
    /// single-fire even when the read and write pipelines fail together.
    pub fn disconnected(&self) -> AppResult<()> {
        self.transition(ConnectionState::Connected, ConnectionState::Disconnected)
    }

    fn transition(&self, from: ConnectionState, to: ConnectionState) -> AppResult<()> {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .map(|_| ())
            .map_err(|actual| AppError::InvalidStateTransition {
                from,
                to,
                actual: ConnectionState::from_u8(actual),
            })
    }
}

impl Default for ConnectionStateCell {
    fn default() -> Self {
        Self::new()
    }
}
