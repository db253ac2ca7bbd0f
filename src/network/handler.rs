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

use std::sync::Arc;

use super::connection::Connection;
use super::frame::WireMessage;

/// Hooks of the embedding application, invoked only from
/// [`ConnectionOwner::process_event`](super::ConnectionOwner::process_event) on the owner
/// thread.
///
/// The owner has already updated its connection registry when `on_connected` and
/// `on_disconnected` run.
pub trait ConnectionHandler: Send + 'static {
    fn on_message(&mut self, _connection: &Arc<Connection>, _message: WireMessage) {}

    fn on_connected(&mut self, _connection: &Arc<Connection>) {}

    fn on_disconnected(&mut self, _connection: &Arc<Connection>) {}
}

/// Registry bookkeeping only.
impl ConnectionHandler for () {}
