// Background task receiving the navdata stream

use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::anyhow;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::link::TelemetryLink;
use crate::navdata::NavData;

// Large enough for the full navdata set
const MAX_NAVDATA_SIZE: usize = 8192;

/// Receives and decodes navdata from a [TelemetryLink]
///
/// Every decoded navdata is handed to a callback, called on the reader task.
/// Datagrams that cannot be decoded are dropped.
///
/// The receive is bounded by a poll interval after which the stop flag is
/// checked, so the reader stops within one interval of a stop request even if
/// the drone has gone silent. A receive error, typically the link being
/// closed, also ends the reader.
pub struct NavDataReader<L> {
    link: Arc<L>,
    poll_interval: Duration,
    stop: Arc<AtomicBool>,
}

/// Handle on a running [NavDataReader]
#[derive(Debug)]
pub struct ReaderHandle {
    stop: Arc<AtomicBool>,
    task: JoinHandle<()>,
}

impl<L: TelemetryLink> NavDataReader<L> {
    /// Create a reader for a link
    ///
    /// # Arguments
    ///
    /// * `link` - The link to receive from
    /// * `poll_interval` - Maximum time spent in one receive before checking for a stop request
    pub fn new(link: Arc<L>, poll_interval: Duration) -> Self {
        NavDataReader { link, poll_interval, stop: Arc::new(AtomicBool::new(false)) }
    }

    /// Run the reader on a new tokio task
    pub fn spawn<F>(self, on_navdata: F) -> ReaderHandle
    where
        F: FnMut(NavData) + Send + 'static,
    {
        let stop = self.stop.clone();
        let task = tokio::spawn(self.run(on_navdata));
        ReaderHandle { stop, task }
    }

    /// Receive navdata until stopped
    pub async fn run<F>(self, mut on_navdata: F)
    where
        F: FnMut(NavData),
    {
        debug!("Navdata reader started");
        let mut buf = vec![0u8; MAX_NAVDATA_SIZE];

        while !self.stop.load(Ordering::Acquire) {
            let len = match tokio::time::timeout(self.poll_interval, self.link.recv(&mut buf)).await {
                Err(_elapsed) => continue,
                Ok(Ok(len)) => len,
                Ok(Err(e)) if self.stop.load(Ordering::Acquire) || e.kind() == io::ErrorKind::NotConnected => {
                    debug!("Navdata link closed: {}", e);
                    break;
                }
                Ok(Err(e)) => {
                    warn!("Navdata reader stopped, receive failed: {}", e);
                    break;
                }
            };

            match NavData::from_bytes(&buf[..len]) {
                Ok(navdata) => on_navdata(navdata),
                Err(e) => debug!("Dropping navdata datagram of {} bytes: {:#}", len, e),
            }
        }
        debug!("Navdata reader stopped");
    }
}

impl ReaderHandle {
    /// True once the reader task has ended
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Ask the reader to stop without waiting for it
    pub fn request_stop(&self) {
        self.stop.store(true, Ordering::Release);
    }

    /// Stop the reader and wait for it to end
    ///
    /// # Arguments
    ///
    /// * `timeout` - Maximum time to wait, the task is aborted after it
    ///
    /// # Errors
    ///
    /// Returns an error if the reader did not end in time or has panicked
    pub async fn stop(self, timeout: Duration) -> anyhow::Result<()> {
        self.request_stop();
        let abort = self.task.abort_handle();
        match tokio::time::timeout(timeout, self.task).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(anyhow!("Navdata reader failed: {}", e)),
            Err(_) => {
                abort.abort();
                Err(anyhow!("Navdata reader did not stop within {:?}", timeout))
            }
        }
    }
}
