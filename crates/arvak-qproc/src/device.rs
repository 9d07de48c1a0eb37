//! Accelerator devices and the worker threads that drive them.
//!
//! Each device is served by one dedicated thread with a FIFO job queue. Jobs
//! are submitted asynchronously and observed through a [`Completion`], the
//! equivalent of recording an event on a device stream and synchronizing on
//! it later.

use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::JoinHandle;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, trace};

use crate::error::{QprocError, QprocResult};
use crate::pool::HostMemoryStore;

/// One accelerator: a device memory budget for chunks and a bounded store
/// of host staging buffers.
pub struct Device {
    id: usize,
    memory_bytes: usize,
    host_store: Mutex<HostMemoryStore>,
}

impl Device {
    /// Describe a device.
    pub fn new(id: usize, memory_bytes: usize, host_store_bytes: usize) -> Self {
        Self {
            id,
            memory_bytes,
            host_store: Mutex::new(HostMemoryStore::new(id, host_store_bytes)),
        }
    }

    /// Device id.
    pub fn id(&self) -> usize {
        self.id
    }

    /// Device memory available for chunks, in bytes.
    pub fn memory_bytes(&self) -> usize {
        self.memory_bytes
    }

    /// The device's temporary host memory store.
    pub fn host_store(&self) -> MutexGuard<'_, HostMemoryStore> {
        self.host_store
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

impl std::fmt::Debug for Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Device")
            .field("id", &self.id)
            .field("memory_bytes", &self.memory_bytes)
            .finish_non_exhaustive()
    }
}

type Job = Box<dyn FnOnce(&Device) + Send>;

/// Handle to a job queued on a device worker.
#[must_use = "a completion must be waited on to observe the job's outcome"]
pub struct Completion<T> {
    rx: oneshot::Receiver<QprocResult<T>>,
    device: usize,
}

impl<T> Completion<T> {
    /// Block until the job has run.
    ///
    /// Must not be called from within an async runtime.
    pub fn wait(self) -> QprocResult<T> {
        self.rx
            .blocking_recv()
            .map_err(|_| QprocError::WorkerTerminated(self.device))?
    }

    /// Device the job was queued on.
    pub fn device(&self) -> usize {
        self.device
    }
}

/// Thread bound to one device, running submitted jobs in order.
pub struct DeviceWorker {
    device: Arc<Device>,
    queue: Option<mpsc::UnboundedSender<Job>>,
    thread: Option<JoinHandle<()>>,
}

impl DeviceWorker {
    /// Start the worker thread for `device`.
    pub fn spawn(device: Arc<Device>) -> QprocResult<Self> {
        let (queue, mut jobs) = mpsc::unbounded_channel::<Job>();
        let thread_device = Arc::clone(&device);
        let thread = std::thread::Builder::new()
            .name(format!("arvak-qproc-device{}", device.id()))
            .spawn(move || {
                while let Some(job) = jobs.blocking_recv() {
                    job(&thread_device);
                }
                trace!(device = thread_device.id(), "device worker exiting");
            })
            .map_err(|e| QprocError::DeviceFault {
                device: device.id(),
                message: format!("failed to start worker thread: {e}"),
            })?;
        debug!(device = device.id(), "device worker started");

        Ok(Self {
            device,
            queue: Some(queue),
            thread: Some(thread),
        })
    }

    /// The device this worker drives.
    pub fn device(&self) -> &Arc<Device> {
        &self.device
    }

    /// Queue `job` on the device and return a handle to its result.
    ///
    /// A panic inside the job is reported as [`QprocError::DeviceFault`].
    pub fn submit<T, F>(&self, job: F) -> Completion<T>
    where
        T: Send + 'static,
        F: FnOnce(&Device) -> T + Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let device_id = self.device.id();
        let wrapped: Job = Box::new(move |device| {
            let result = panic::catch_unwind(AssertUnwindSafe(|| job(device))).map_err(|payload| {
                let message = panic_message(payload.as_ref());
                error!(device = device_id, %message, "device job failed");
                QprocError::DeviceFault {
                    device: device_id,
                    message,
                }
            });
            let _ = tx.send(result);
        });

        // A closed queue drops the job together with its sender, which the
        // completion reports as a terminated worker.
        if let Some(queue) = &self.queue {
            let _ = queue.send(wrapped);
        }
        Completion {
            rx,
            device: device_id,
        }
    }
}

impl Drop for DeviceWorker {
    fn drop(&mut self) {
        self.queue.take();
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                error!(device = self.device.id(), "device worker panicked");
            }
        }
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn worker() -> DeviceWorker {
        DeviceWorker::spawn(Arc::new(Device::new(3, 1 << 20, 1 << 16))).unwrap()
    }

    #[test]
    fn test_jobs_run_in_submission_order() {
        let worker = worker();
        let log = Arc::new(Mutex::new(Vec::new()));
        let completions: Vec<_> = (0..16)
            .map(|i| {
                let log = Arc::clone(&log);
                worker.submit(move |_| log.lock().unwrap().push(i))
            })
            .collect();
        for c in completions {
            c.wait().unwrap();
        }
        assert_eq!(*log.lock().unwrap(), (0..16).collect::<Vec<_>>());
    }

    #[test]
    fn test_job_sees_its_device() {
        let worker = worker();
        let id = worker.submit(|device| device.id()).wait().unwrap();
        assert_eq!(id, 3);
    }

    #[test]
    fn test_panicking_job_is_a_device_fault() {
        let worker = worker();
        let err = worker
            .submit(|_| -> u32 { panic!("launch failed") })
            .wait()
            .unwrap_err();
        match err {
            QprocError::DeviceFault { device, message } => {
                assert_eq!(device, 3);
                assert!(message.contains("launch failed"));
            }
            other => panic!("unexpected error: {other}"),
        }
        // The worker keeps serving jobs afterwards.
        assert_eq!(worker.submit(|_| 7).wait().unwrap(), 7);
    }
}
