//! Open handle on a channel
//!
//! A session is what a client holds between `open` and `close`. Any number of
//! sessions may be open on one channel; they share the channel's single
//! transfer slot, so a write that overlaps another session's write fails
//! with `Busy`.

use crate::channel::{Channel, ChannelHandle};
use crate::error::{DriverError, Result};
use crate::transfer::{self, InterruptToken};
use std::sync::Arc;
use tracing::debug;

pub struct Session {
    channel: ChannelHandle,
    interrupt: Arc<InterruptToken>,
}

impl Session {
    pub(crate) fn open(channel: ChannelHandle) -> Result<Self> {
        channel.attach_session()?;
        debug!(
            "Opened session on {} ({} open)",
            channel.name(),
            channel.open_sessions()
        );
        Ok(Self {
            channel,
            interrupt: Arc::new(InterruptToken::new()),
        })
    }

    pub fn channel(&self) -> &ChannelHandle {
        &self.channel
    }

    /// Token that interrupts this session's blocked write
    pub fn interrupter(&self) -> Arc<InterruptToken> {
        self.interrupt.clone()
    }

    /// Send `data` to the device and block until the transfer resolves
    ///
    /// Returns the byte count the device accepted, which may be less than
    /// `data.len()` when the payload exceeds the slot capacity.
    pub fn write(&self, data: &[u8]) -> Result<usize> {
        if data.is_empty() {
            return Ok(0);
        }
        transfer::submit_and_wait(&self.channel, data, &self.interrupt)
    }

    /// [`Session::write`] in the device-file convention: bytes written or
    /// negative errno
    pub fn write_raw(&self, data: &[u8]) -> isize {
        match self.write(data) {
            Ok(written) => written as isize,
            Err(e) => -(e.errno() as i32 as isize),
        }
    }

    /// The channel has no read path; every read is end-of-stream
    pub fn read(&self, _buf: &mut [u8]) -> Result<usize> {
        Ok(0)
    }

    /// Control hook, not implemented
    pub fn ioctl(&self, cmd: u32, _arg: usize) -> Result<i64> {
        debug!("Unsupported ioctl {:#x} on {}", cmd, self.channel.name());
        Err(DriverError::NotSupported)
    }

    /// Close explicitly; equivalent to dropping the session
    pub fn close(self) {}
}

impl Drop for Session {
    fn drop(&mut self) {
        self.channel.detach_session();
        debug!(
            "Closed session on {} ({} open)",
            self.channel.name(),
            self.channel.open_sessions()
        );
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("channel", &self.channel.name())
            .finish_non_exhaustive()
    }
}

impl AsRef<Channel> for Session {
    fn as_ref(&self) -> &Channel {
        &self.channel
    }
}
