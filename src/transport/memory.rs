use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use tracing::trace;

use crate::core::{Error, Result, MAX_FRAME_CAPACITY};
use crate::protocol::COMMAND_HEADER_LEN;
use super::Transport;

type Queue = Arc<Mutex<VecDeque<Bytes>>>;

/// One end of an in-process frame link
///
/// Created in pairs; frames sent on one end are received on the other in
/// order. Both ends may live on different threads.
#[derive(Debug, Clone)]
pub struct MemoryTransport {
    inbound: Queue,
    outbound: Queue,
    max_frame: usize,
}

impl MemoryTransport {
    /// Two linked endpoints accepting frames up to the protocol maximum
    pub fn pair() -> (MemoryTransport, MemoryTransport) {
        Self::pair_with_capacity(COMMAND_HEADER_LEN + MAX_FRAME_CAPACITY)
    }

    /// Two linked endpoints refusing frames longer than `max_frame`
    pub fn pair_with_capacity(max_frame: usize) -> (MemoryTransport, MemoryTransport) {
        let a: Queue = Arc::new(Mutex::new(VecDeque::new()));
        let b: Queue = Arc::new(Mutex::new(VecDeque::new()));
        (
            MemoryTransport {
                inbound: a.clone(),
                outbound: b.clone(),
                max_frame,
            },
            MemoryTransport {
                inbound: b,
                outbound: a,
                max_frame,
            },
        )
    }

    /// Frames waiting to be received on this end
    pub fn pending(&self) -> usize {
        self.inbound.lock().map(|queue| queue.len()).unwrap_or(0)
    }
}

impl Transport for MemoryTransport {
    fn receive_available(&mut self) -> Result<Option<Bytes>> {
        let mut queue = self
            .inbound
            .lock()
            .map_err(|e| Error::transport(format!("Failed to lock link queue: {}", e)))?;
        Ok(queue.pop_front())
    }

    fn send(&mut self, frame: &[u8]) -> Result<()> {
        if frame.len() > self.max_frame {
            return Err(Error::transport(format!(
                "frame of {} bytes exceeds link maximum {}",
                frame.len(),
                self.max_frame
            )));
        }
        let mut queue = self
            .outbound
            .lock()
            .map_err(|e| Error::transport(format!("Failed to lock link queue: {}", e)))?;
        trace!("queued frame of {} bytes", frame.len());
        queue.push_back(Bytes::copy_from_slice(frame));
        Ok(())
    }
}
