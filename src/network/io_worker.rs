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

use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, ThreadId};

use parking_lot::Mutex;
use tokio::runtime::{self, Handle};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, error, trace};

use crate::AppResult;

/// One OS thread driving one single-threaded reactor.
///
/// Every socket operation of a connection is scheduled on the worker the connection was
/// bound to at creation, so the socket and its buffers are only ever touched from this
/// thread.
pub struct IoWorker {
    id: usize,
    name: String,
    handle: Handle,
    thread_id: ThreadId,
    socket_count: AtomicUsize,
    stop_tx: Mutex<Option<oneshot::Sender<()>>>,
    thread: Mutex<Option<thread::JoinHandle<()>>>,
}

impl IoWorker {
    pub fn start(id: usize, name: impl Into<String>) -> AppResult<Arc<IoWorker>> {
        let name = name.into();
        let runtime = runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;
        let handle = runtime.handle().clone();
        let (stop_tx, stop_rx) = oneshot::channel::<()>();

        let thread_name = name.clone();
        let thread = thread::Builder::new().name(name.clone()).spawn(move || {
            debug!("{} started", thread_name);
            // an explicit stop and a dropped sender both end the loop
            let _ = runtime.block_on(stop_rx);
            // dropping the runtime cancels whatever is still scheduled on it
            drop(runtime);
            debug!("{} exited", thread_name);
        })?;
        let thread_id = thread.thread().id();

        Ok(Arc::new(IoWorker {
            id,
            name,
            handle,
            thread_id,
            socket_count: AtomicUsize::new(0),
            stop_tx: Mutex::new(Some(stop_tx)),
            thread: Mutex::new(Some(thread)),
        }))
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn handle(&self) -> &Handle {
        &self.handle
    }

    /// Posts `future` onto this worker's event loop.
    pub fn spawn<F>(&self, future: F) -> JoinHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        self.handle.spawn(future)
    }

    pub fn is_current(&self) -> bool {
        thread::current().id() == self.thread_id
    }

    pub fn socket_count(&self) -> usize {
        self.socket_count.load(Ordering::Acquire)
    }

    pub(crate) fn increase_socket_count(&self) {
        let count = self.socket_count.fetch_add(1, Ordering::AcqRel) + 1;
        trace!("{} bound sockets {}", self.name, count);
    }

    pub(crate) fn decrease_socket_count(&self) {
        let count = self.socket_count.fetch_sub(1, Ordering::AcqRel) - 1;
        trace!("{} bound sockets {}", self.name, count);
    }

    /// Stops the event loop and joins the thread. Safe to call more than once.
    pub fn stop(&self) {
        if let Some(stop_tx) = self.stop_tx.lock().take() {
            let _ = stop_tx.send(());
        }
        if self.is_current() {
            // joining ourselves would never return, the thread exits after this task
            return;
        }
        if let Some(thread) = self.thread.lock().take() {
            if thread.join().is_err() {
                error!("{} panicked before exit", self.name);
            }
        }
    }
}

impl fmt::Debug for IoWorker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IoWorker")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("socket_count", &self.socket_count())
            .finish()
    }
}

impl Drop for IoWorker {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Linear scan for the worker with the fewest bound sockets, the first one wins ties.
/// Worker counts stay around the core count, so a scan is all this needs.
pub fn select_least_loaded(workers: &[Arc<IoWorker>]) -> Option<&Arc<IoWorker>> {
    let mut selected = workers.first()?;
    for worker in &workers[1..] {
        if worker.socket_count() < selected.socket_count() {
            selected = worker;
        }
    }
    Some(selected)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn spawned_work_runs_on_worker_thread() {
        let worker = IoWorker::start(0, "io-worker-test").unwrap();
        let (tx, rx) = std::sync::mpsc::channel();
        let probe = worker.clone();
        worker.spawn(async move {
            tx.send((thread::current().name().map(str::to_string), probe.is_current()))
                .unwrap();
        });
        let (name, on_worker) = rx.recv().unwrap();
        assert_eq!(name.as_deref(), Some("io-worker-test"));
        assert!(on_worker);
        assert!(!worker.is_current());
        worker.stop();
        worker.stop();
    }

    #[test]
    fn least_loaded_prefers_fewest_sockets() {
        let workers: Vec<_> = (0..3)
            .map(|i| IoWorker::start(i, format!("io-worker-{}", i)).unwrap())
            .collect();
        assert_eq!(select_least_loaded(&workers).unwrap().id(), 0);

        workers[0].increase_socket_count();
        assert_eq!(select_least_loaded(&workers).unwrap().id(), 1);

        workers[1].increase_socket_count();
        workers[1].increase_socket_count();
        assert_eq!(select_least_loaded(&workers).unwrap().id(), 2);

        workers[0].decrease_socket_count();
        assert_eq!(select_least_loaded(&workers).unwrap().id(), 0);
        assert!(select_least_loaded(&[]).is_none());
    }
}
