//! rusb-backed transport
//!
//! Each claimed device gets one executor thread that performs queued bulk
//! OUT transfers with `write_bulk` and completes every descriptor exactly
//! once. libusb's synchronous API cannot abort a transfer in progress, so a
//! cancel only takes effect for transfers that have not started; a running
//! one resolves within the configured transfer timeout.

use async_channel::{Receiver, Sender, TrySendError, unbounded};
use driver::{
    Completion, TransferId, TransferOutcome, TransferRequest, TransferStatus, Transport,
    TransportError, TransportId,
};
use rusb::{Context, DeviceHandle};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, warn};

struct Job {
    request: TransferRequest,
    completion: Completion,
}

#[derive(Default)]
struct Shared {
    cancelled: Mutex<HashSet<TransferId>>,
    gone: AtomicBool,
}

impl Shared {
    /// Consume a pending cancel for `id`, dropping stale ids below it
    fn take_cancel(&self, id: TransferId) -> bool {
        let mut cancelled = self
            .cancelled
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let hit = cancelled.remove(&id);
        cancelled.retain(|c| *c > id);
        hit
    }
}

/// Transport performing bulk transfers on a claimed device handle
pub struct RusbTransport {
    id: TransportId,
    jobs: Sender<Job>,
    shared: Arc<Shared>,
}

impl RusbTransport {
    /// Start the executor thread for `handle`
    pub fn spawn(
        id: TransportId,
        handle: Arc<DeviceHandle<Context>>,
        transfer_timeout: Duration,
    ) -> std::io::Result<(Arc<Self>, JoinHandle<()>)> {
        let (jobs, queue) = unbounded();
        let shared = Arc::new(Shared::default());

        let executor = {
            let shared = shared.clone();
            std::thread::Builder::new()
                .name(format!("usb-xfer-{}", id))
                .spawn(move || run_executor(id, handle, queue, shared, transfer_timeout))?
        };

        Ok((Arc::new(Self { id, jobs, shared }), executor))
    }

    /// Refuse new submissions; queued ones complete with `NoDevice`
    pub fn close(&self) {
        self.shared.gone.store(true, Ordering::Release);
        self.jobs.close();
    }

    pub fn is_closed(&self) -> bool {
        self.shared.gone.load(Ordering::Acquire)
    }
}

impl Transport for RusbTransport {
    fn submit(
        &self,
        request: TransferRequest,
        completion: Completion,
    ) -> Result<(), TransportError> {
        if self.is_closed() {
            return Err(TransportError::NoDevice);
        }
        match self.jobs.try_send(Job {
            request,
            completion,
        }) {
            Ok(()) => Ok(()),
            Err(TrySendError::Closed(_)) => Err(TransportError::NoDevice),
            Err(TrySendError::Full(_)) => Err(TransportError::NoResources),
        }
    }

    fn cancel(&self, id: TransferId) {
        debug!("Cancel requested for transfer {:?} on {}", id, self.id);
        self.shared
            .cancelled
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id);
    }
}

fn run_executor(
    id: TransportId,
    handle: Arc<DeviceHandle<Context>>,
    queue: Receiver<Job>,
    shared: Arc<Shared>,
    transfer_timeout: Duration,
) {
    debug!("Transfer executor for {} started", id);

    while let Ok(Job {
        request,
        completion,
    }) = queue.recv_blocking()
    {
        if shared.take_cancel(request.id) {
            debug!("Transfer {:?} on {} cancelled before start", request.id, id);
            completion.complete(TransferOutcome::failed(
                TransferStatus::Cancelled,
                Some(request.buffer),
            ));
            continue;
        }

        if shared.gone.load(Ordering::Acquire) {
            completion.complete(TransferOutcome::failed(
                TransferStatus::NoDevice,
                Some(request.buffer),
            ));
            continue;
        }

        let endpoint = request.pipe.address();
        let outcome = match handle.write_bulk(endpoint, &request.buffer, transfer_timeout) {
            Ok(written) => {
                debug!(
                    "Bulk OUT {:#04x} on {}: {}/{} bytes",
                    endpoint,
                    id,
                    written,
                    request.buffer.len()
                );
                TransferOutcome::completed(request.buffer, written)
            }
            Err(e) => {
                warn!("Bulk OUT {:#04x} on {} failed: {}", endpoint, id, e);
                TransferOutcome::failed(map_rusb_error(e), Some(request.buffer))
            }
        };
        completion.complete(outcome);
    }

    debug!("Transfer executor for {} stopped", id);
}

/// Map rusb errors to transfer status codes
pub fn map_rusb_error(err: rusb::Error) -> TransferStatus {
    match err {
        rusb::Error::Timeout => TransferStatus::TimedOut,
        rusb::Error::Pipe => TransferStatus::Stall,
        rusb::Error::NoDevice => TransferStatus::NoDevice,
        rusb::Error::Overflow => TransferStatus::Overflow,
        rusb::Error::Io => TransferStatus::Io,
        rusb::Error::Interrupted => TransferStatus::Cancelled,
        _ => TransferStatus::Other(err.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_map_rusb_error() {
        assert_eq!(map_rusb_error(rusb::Error::Timeout), TransferStatus::TimedOut);
        assert_eq!(map_rusb_error(rusb::Error::Pipe), TransferStatus::Stall);
        assert_eq!(map_rusb_error(rusb::Error::NoDevice), TransferStatus::NoDevice);
        assert_eq!(map_rusb_error(rusb::Error::Io), TransferStatus::Io);
        assert!(matches!(
            map_rusb_error(rusb::Error::Access),
            TransferStatus::Other(_)
        ));
    }

    #[test]
    fn test_take_cancel_prunes_stale_ids() {
        let shared = Shared::default();
        {
            let mut cancelled = shared.cancelled.lock().unwrap();
            cancelled.extend([TransferId(1), TransferId(3), TransferId(7)]);
        }

        assert!(shared.take_cancel(TransferId(3)));
        let left: Vec<TransferId> = shared.cancelled.lock().unwrap().iter().copied().collect();
        assert_eq!(left, vec![TransferId(7)]);

        assert!(!shared.take_cancel(TransferId(5)));
        assert!(shared.take_cancel(TransferId(7)));
    }
}
