// Background task sending the queued commands to the drone

use std::sync::Arc;

use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use crate::link::CommandLink;
use crate::queue::CommandQueue;

/// Sends the commands of a [CommandQueue] on a [CommandLink]
///
/// Commands are fire-and-forget: the drone does not acknowledge them and lost
/// datagrams are not detected. The sender stops when it pops a
/// [Quit](crate::Command::Quit) command, when the queue is closed, or at the
/// first send failure.
pub struct CommandSender<L> {
    queue: Arc<CommandQueue>,
    link: Arc<L>,
    sequence: u32,
}

impl<L: CommandLink> CommandSender<L> {
    /// Create a sender for a queue and a link
    pub fn new(queue: Arc<CommandQueue>, link: Arc<L>) -> Self {
        CommandSender { queue, link, sequence: 0 }
    }

    /// Run the sender on a new tokio task
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    /// Send commands until stopped
    pub async fn run(mut self) {
        debug!("Command sender started");
        while let Some(command) = self.queue.pop().await {
            if command.is_quit() {
                debug!("Command sender stopped");
                return;
            }

            self.sequence = self.sequence.wrapping_add(1);
            let frame = command.encode(self.sequence);
            trace!("Sending {:?} as sequence {}", command, self.sequence);

            if let Err(e) = self.link.send(&frame).await {
                // Usually the link has been closed under our feet
                warn!("Command sender stopped, failed to send {:?}: {}", command, e);
                return;
            }
        }
        debug!("Command sender stopped, queue closed");
    }
}
