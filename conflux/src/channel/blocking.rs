//! Blocking (thread-parking) channel operations.
//!
//! These provide the same ordering and backpressure guarantees as the
//! suspending operations; the calling thread parks on the same one-shot
//! rendezvous slot the async path awaits.

use super::core::{Channel, ReadStep, WriteStep};
use crate::errors::{ClosedChannelError, FlowError};

impl<T> Channel<T> {
    /// Blocking variant of [`Channel::write`]. Parks the calling thread
    /// while the channel is full under the `Wait` policy.
    ///
    /// # Panics
    ///
    /// Panics if called from within an async runtime; use
    /// [`Channel::write`] there instead.
    pub fn blocking_write(&self, item: T) -> Result<(), FlowError> {
        match self.write_step(item) {
            WriteStep::Done(result) => result,
            WriteStep::Park(parked) => match parked.blocking_recv() {
                Ok(result) => result,
                Err(_) => Err(ClosedChannelError.into()),
            },
        }
    }

    /// Blocking variant of [`Channel::read`]. Parks the calling thread while
    /// the channel is empty and open.
    ///
    /// # Panics
    ///
    /// Panics if called from within an async runtime; use
    /// [`Channel::read`] there instead.
    pub fn blocking_read(&self) -> Result<T, FlowError> {
        match self.read_step() {
            ReadStep::Done(result) => result,
            ReadStep::Park(parked) => match parked.blocking_recv() {
                Ok(result) => result,
                Err(_) => Err(ClosedChannelError.into()),
            },
        }
    }
}
