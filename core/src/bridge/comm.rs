//! Command plumbing between the host-facing bridge API and its worker.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, Sender};
use strum::Display;

use crate::proto::DiskSide;

/// Commands the worker executes in arrival order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum QueueCommand {
    Terminate,
    MotorOn,
    MotorOff,
    GotoCylinder(u8),
    SelectSide(DiskSide),
    WriteTrack,
}

/// FIFO command queue with a wait-with-timeout semaphore and O(1)
/// coalescing of back-to-back seeks.
pub struct CommandQueue {
    inner: Mutex<VecDeque<QueueCommand>>,
    permit_tx: Sender<()>,
    permit_rx: Receiver<()>,
}

impl Default for CommandQueue {
    fn default() -> Self {
        let (permit_tx, permit_rx) = bounded(64);
        Self {
            inner: Mutex::new(VecDeque::new()),
            permit_tx,
            permit_rx,
        }
    }
}

impl CommandQueue {
    pub fn push(&self, cmd: QueueCommand) {
        self.inner.lock().unwrap().push_back(cmd);
        let _ = self.permit_tx.try_send(());
    }

    /// Enqueues a seek, replacing the previous one if it is still
    /// waiting at the back of the queue. Only the most recent target
    /// matters; the drive would only chatter through the others.
    /// Returns true when an existing seek was updated in place.
    pub fn push_seek(&self, cylinder: u8) -> bool {
        let mut queue = self.inner.lock().unwrap();
        if let Some(QueueCommand::GotoCylinder(target)) = queue.back_mut() {
            *target = cylinder;
            return true;
        }
        queue.push_back(QueueCommand::GotoCylinder(cylinder));
        drop(queue);
        let _ = self.permit_tx.try_send(());
        false
    }

    /// Blocks up to `timeout` for a queued command.
    pub fn wait(&self, timeout: Duration) -> bool {
        self.permit_rx.recv_timeout(timeout).is_ok()
    }

    pub fn pop(&self) -> Option<QueueCommand> {
        self.inner.lock().unwrap().pop_front()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().unwrap().is_empty()
    }

    pub fn clear(&self) {
        self.inner.lock().unwrap().clear();
        while self.permit_rx.try_recv().is_ok() {}
    }
}
