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

use std::io;

use crate::network::ConnectionState;

pub type AppResult<T> = Result<T, AppError>;

#[derive(Debug, thiserror::Error)]
pub enum AppError {
    /// general errors
    #[error("illegal state: {0}")]
    IllegalStateError(String),

    /// a compare-and-set on the connection state found an unexpected state
    #[error("illegal state transition {from:?} -> {to:?}, current state is {actual:?}")]
    InvalidStateTransition {
        from: ConnectionState,
        to: ConnectionState,
        actual: ConnectionState,
    },

    #[error("malformed protocol : {0}")]
    MalformedProtocol(String),

    #[error("frame of length {0} is too large")]
    FrameTooLarge(usize),

    #[error("send queue is full, capacity {0}")]
    SendQueueFull(usize),

    #[error("invalid value: {0}")]
    InvalidValue(String),

    #[error("I/O error: {0}")]
    DetailedIoError(String),

    #[error("io error: {0}")]
    IoError(#[from] io::Error),

    #[error("channel recv error: {0}")]
    ChannelRecvError(String),

    #[error("config file error: {0}")]
    ConfigFileError(#[from] config::ConfigError),
}

impl AppError {
    /// Remote closed the stream, either between frames or in the middle of one.
    pub fn is_end_of_stream(&self) -> bool {
        matches!(self, AppError::IoError(e) if e.kind() == io::ErrorKind::UnexpectedEof)
    }
}
