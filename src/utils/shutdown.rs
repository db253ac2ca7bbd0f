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

use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::broadcast;

/// Listens for a stop notification, once received every later `recv` returns at once.
#[derive(Debug)]
pub struct Shutdown {
    is_shutdown: bool,
    notify: broadcast::Receiver<()>,
}

impl Shutdown {
    pub fn new(notify: broadcast::Receiver<()>) -> Shutdown {
        Shutdown {
            is_shutdown: false,
            notify,
        }
    }

    pub fn is_shutdown(&self) -> bool {
        self.is_shutdown
    }

    pub async fn recv(&mut self) {
        if self.is_shutdown {
            return;
        }
        // a lagged or closed channel also means the sender side is gone or has fired
        let _ = self.notify.recv().await;
        self.is_shutdown = true;
    }
}

/// Sending half: fires at most once and hands out [`Shutdown`] listeners.
#[derive(Debug)]
pub struct ShutdownSignal {
    notify: broadcast::Sender<()>,
    fired: AtomicBool,
}

impl ShutdownSignal {
    pub fn new() -> Self {
        let (notify, _) = broadcast::channel(1);
        ShutdownSignal {
            notify,
            fired: AtomicBool::new(false),
        }
    }

    /// A listener subscribed after `trigger` still observes the stop.
    pub fn subscribe(&self) -> Shutdown {
        let mut shutdown = Shutdown::new(self.notify.subscribe());
        if self.fired.load(Ordering::Acquire) {
            shutdown.is_shutdown = true;
        }
        shutdown
    }

    /// Returns true only for the call that actually fired the signal.
    pub fn trigger(&self) -> bool {
        if self
            .fired
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }
        // no receivers is fine, late subscribers check `fired`
        let _ = self.notify.send(());
        true
    }

    pub fn is_triggered(&self) -> bool {
        self.fired.load(Ordering::Acquire)
    }
}

impl Default for ShutdownSignal {
    fn default() -> Self {
        Self::new()
    }
}
