//! # Queues between the application and the link tasks

use std::collections::{BTreeMap, VecDeque};

use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::command::{Command, Priority};
use crate::navdata::NavData;

/// Priority queue of the commands waiting to be sent
///
/// Any number of producers can push commands, the [CommandSender](crate::CommandSender)
/// is the single consumer. The command with the highest [Priority] is popped
/// first, commands of the same priority are popped in the order they were pushed.
///
/// Once closed, the queue rejects new commands and wakes up the consumer.
#[derive(Debug, Default)]
pub struct CommandQueue {
    inner: Mutex<CommandQueueInner>,
    available: Notify,
}

#[derive(Debug, Default)]
struct CommandQueueInner {
    // Max key = highest priority, VecDeque keeps FIFO order within a priority
    map: BTreeMap<Priority, VecDeque<Command>>,
    size: usize,
    closed: bool,
}

impl CommandQueue {
    /// Create an empty queue
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a command
    ///
    /// # Errors
    ///
    /// Returns an error if the queue has been closed
    pub fn push(&self, command: Command) -> anyhow::Result<()> {
        {
            let mut inner = self.inner.lock();
            if inner.closed {
                return Err(anyhow::anyhow!("Command queue is closed, cannot queue {:?}", command));
            }
            inner.map.entry(command.priority()).or_default().push_back(command);
            inner.size += 1;
        }
        self.available.notify_one();
        Ok(())
    }

    /// Remove the highest priority command without waiting
    pub fn try_pop(&self) -> Option<Command> {
        let mut inner = self.inner.lock();
        let mut entry = inner.map.last_entry()?;
        let command = entry.get_mut().pop_front();
        if entry.get().is_empty() {
            entry.remove();
        }
        if command.is_some() {
            inner.size -= 1;
        }
        command
    }

    /// Wait for a command and remove it from the queue
    ///
    /// Commands still queued are returned after the queue is closed.
    ///
    /// # Returns
    ///
    /// The highest priority command, or `None` once the queue is closed and empty
    pub async fn pop(&self) -> Option<Command> {
        loop {
            let notified = self.available.notified();
            if let Some(command) = self.try_pop() {
                return Some(command);
            }
            if self.is_closed() {
                return None;
            }
            notified.await;
        }
    }

    /// Close the queue, further pushes fail
    pub fn close(&self) {
        self.inner.lock().closed = true;
        self.available.notify_waiters();
        // Covers a consumer that checked the queue but has not started waiting yet
        self.available.notify_one();
    }

    /// True once [close](Self::close) has been called
    pub fn is_closed(&self) -> bool {
        self.inner.lock().closed
    }

    /// Number of queued commands
    pub fn len(&self) -> usize {
        self.inner.lock().size
    }

    /// True if no command is queued
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Navdata waiting to be consumed by the application
///
/// Unbounded FIFO, navdata is returned in the order it was received.
#[derive(Debug, Default)]
pub struct NavDataQueue {
    queue: Mutex<VecDeque<NavData>>,
    available: Notify,
}

impl NavDataQueue {
    /// Create an empty queue
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn push(&self, navdata: NavData) {
        self.queue.lock().push_back(navdata);
        self.available.notify_one();
    }

    /// Remove the oldest navdata without waiting
    pub fn try_pop(&self) -> Option<NavData> {
        self.queue.lock().pop_front()
    }

    /// Wait for navdata and remove it from the queue
    pub async fn pop(&self) -> NavData {
        loop {
            let notified = self.available.notified();
            if let Some(navdata) = self.try_pop() {
                return navdata;
            }
            notified.await;
        }
    }

    /// Number of navdata waiting
    pub fn len(&self) -> usize {
        self.queue.lock().len()
    }

    /// True if no navdata is waiting
    pub fn is_empty(&self) -> bool {
        self.queue.lock().is_empty()
    }

    /// Drop all waiting navdata
    pub fn clear(&self) {
        self.queue.lock().clear();
    }
}
