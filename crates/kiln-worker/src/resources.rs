//! Local resource accounting.
//!
//! Every worker execution reserves CPU and memory for its duration so that
//! a large build does not oversubscribe the machine. The manager is an
//! injected collaborator rather than a process-wide singleton, so tests can
//! substitute a deterministic implementation.

use std::io;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::spawn::ResourceSet;

/// Scoped reservation of local resources. Dropping the handle releases the
/// reservation.
#[derive(Debug)]
pub struct ResourceHandle {
    _cpu: Option<OwnedSemaphorePermit>,
    _memory: Option<OwnedSemaphorePermit>,
}

impl ResourceHandle {
    /// A handle that reserves nothing.
    #[must_use]
    pub const fn unreserved() -> Self {
        Self {
            _cpu: None,
            _memory: None,
        }
    }
}

/// Grants scoped reservations of local resources.
#[async_trait]
pub trait ResourceManager: Send + Sync {
    /// Blocks until the requested resources are available and reserves
    /// them. The reservation is released when the returned handle drops.
    ///
    /// # Errors
    ///
    /// Returns an error when the manager is shutting down.
    async fn acquire(&self, owner: &str, resources: ResourceSet) -> io::Result<ResourceHandle>;
}

/// Semaphore-backed manager accounting CPU in milli-cores and memory in
/// MiB.
///
/// Requests larger than the machine are clamped to the machine's capacity,
/// so an oversized action serializes against everything else instead of
/// deadlocking.
#[derive(Debug)]
pub struct LocalResourceManager {
    cpu: Arc<Semaphore>,
    memory: Arc<Semaphore>,
    cpu_millis: u32,
    memory_mib: u32,
}

impl LocalResourceManager {
    /// Creates a manager for a machine with `total_cpus` cores and
    /// `total_memory_mib` MiB of memory.
    #[must_use]
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)] // Clamped below.
    pub fn new(total_cpus: f64, total_memory_mib: u64) -> Self {
        let cpu_millis = (total_cpus.max(0.001) * 1000.0).round() as u32;
        let memory_mib = total_memory_mib.clamp(1, u64::from(u32::MAX)) as u32;

        Self {
            cpu: Arc::new(Semaphore::new(cpu_millis as usize)),
            memory: Arc::new(Semaphore::new(memory_mib as usize)),
            cpu_millis,
            memory_mib,
        }
    }
}

#[async_trait]
impl ResourceManager for LocalResourceManager {
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)] // Clamped to capacity.
    async fn acquire(&self, owner: &str, resources: ResourceSet) -> io::Result<ResourceHandle> {
        let cpu_millis = ((resources.cpu.max(0.0) * 1000.0).round() as u32).min(self.cpu_millis);
        let memory_mib =
            (resources.memory_mib.min(u64::from(self.memory_mib))) as u32;

        tracing::debug!(owner, cpu_millis, memory_mib, "acquiring local resources");

        let cpu = if cpu_millis > 0 {
            Some(
                Arc::clone(&self.cpu)
                    .acquire_many_owned(cpu_millis)
                    .await
                    .map_err(|_| shutting_down())?,
            )
        } else {
            None
        };
        let memory = if memory_mib > 0 {
            Some(
                Arc::clone(&self.memory)
                    .acquire_many_owned(memory_mib)
                    .await
                    .map_err(|_| shutting_down())?,
            )
        } else {
            None
        };

        Ok(ResourceHandle {
            _cpu: cpu,
            _memory: memory,
        })
    }
}

fn shutting_down() -> io::Error {
    io::Error::new(io::ErrorKind::Other, "resource manager is shutting down")
}
