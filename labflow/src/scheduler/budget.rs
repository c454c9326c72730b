//! Admission control for concurrently running stages.
//!
//! The budget bounds in-flight parallelism and the sum of admitted CPU,
//! memory, and GPU requests. Stages wait (without holding any lock) until
//! their request fits. Requests are validated against the ceiling before
//! the run starts, so a waiter is always eventually admissible.

use crate::config::RunnerConfig;
use crate::errors::LabflowError;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::Notify;

/// One stage's admission request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResourceRequest {
    /// CPU cores.
    pub cpus: u32,
    /// Memory in megabytes.
    pub memory_mb: u64,
    /// GPU slots.
    pub gpus: u32,
}

#[derive(Debug, Default)]
struct InFlight {
    running: usize,
    cpus: u32,
    memory_mb: u64,
    gpus: u32,
}

/// Shared resource budget for a run.
#[derive(Debug)]
pub struct ResourceBudget {
    max_parallel: usize,
    cpu_ceiling: Option<u32>,
    memory_ceiling_mb: Option<u64>,
    gpu_ceiling: Option<u32>,
    in_flight: Mutex<InFlight>,
    released: Notify,
}

impl ResourceBudget {
    /// Builds the budget from the runner configuration.
    pub fn from_config(config: &RunnerConfig) -> Result<Arc<Self>, LabflowError> {
        Ok(Arc::new(Self {
            max_parallel: config.max_parallel,
            cpu_ceiling: config.ceiling.cpus,
            memory_ceiling_mb: config.ceiling.memory_mb()?,
            gpu_ceiling: config.ceiling.gpus,
            in_flight: Mutex::new(InFlight::default()),
            released: Notify::new(),
        }))
    }

    fn try_admit(&self, request: ResourceRequest) -> bool {
        let mut state = self.in_flight.lock();
        if state.running >= self.max_parallel {
            return false;
        }
        if let Some(ceiling) = self.cpu_ceiling {
            if state.cpus + request.cpus > ceiling {
                return false;
            }
        }
        if let Some(ceiling) = self.memory_ceiling_mb {
            if state.memory_mb + request.memory_mb > ceiling {
                return false;
            }
        }
        if let Some(ceiling) = self.gpu_ceiling {
            if state.gpus + request.gpus > ceiling {
                return false;
            }
        }
        state.running += 1;
        state.cpus += request.cpus;
        state.memory_mb += request.memory_mb;
        state.gpus += request.gpus;
        true
    }

    /// Waits until the request fits, then admits it.
    ///
    /// The returned guard releases the admission on drop.
    pub async fn acquire(self: &Arc<Self>, request: ResourceRequest) -> BudgetGuard {
        loop {
            if self.try_admit(request) {
                return BudgetGuard {
                    budget: Arc::clone(self),
                    request,
                };
            }
            let released = self.released.notified();
            if self.try_admit(request) {
                return BudgetGuard {
                    budget: Arc::clone(self),
                    request,
                };
            }
            released.await;
        }
    }

    fn release(&self, request: ResourceRequest) {
        let mut state = self.in_flight.lock();
        state.running = state.running.saturating_sub(1);
        state.cpus = state.cpus.saturating_sub(request.cpus);
        state.memory_mb = state.memory_mb.saturating_sub(request.memory_mb);
        state.gpus = state.gpus.saturating_sub(request.gpus);
        drop(state);
        self.released.notify_waiters();
    }

    /// Number of stages currently admitted (tests and diagnostics).
    #[must_use]
    pub fn running(&self) -> usize {
        self.in_flight.lock().running
    }
}

/// Releases an admission when dropped.
#[derive(Debug)]
pub struct BudgetGuard {
    budget: Arc<ResourceBudget>,
    request: ResourceRequest,
}

impl Drop for BudgetGuard {
    fn drop(&mut self) {
        self.budget.release(self.request);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ResourceCeiling;
    use std::time::Duration;

    fn budget(max_parallel: usize, cpus: Option<u32>, gpus: Option<u32>) -> Arc<ResourceBudget> {
        let config = RunnerConfig {
            max_parallel,
            ceiling: ResourceCeiling {
                cpus,
                memory: None,
                gpus,
            },
            ..RunnerConfig::default()
        };
        ResourceBudget::from_config(&config).unwrap()
    }

    fn request(cpus: u32, gpus: u32) -> ResourceRequest {
        ResourceRequest {
            cpus,
            memory_mb: 128,
            gpus,
        }
    }

    #[tokio::test]
    async fn test_admission_within_budget() {
        let budget = budget(4, Some(8), None);
        let _a = budget.acquire(request(2, 0)).await;
        let _b = budget.acquire(request(2, 0)).await;
        assert_eq!(budget.running(), 2);
    }

    #[tokio::test]
    async fn test_release_on_drop() {
        let budget = budget(4, Some(8), None);
        {
            let _guard = budget.acquire(request(8, 0)).await;
            assert_eq!(budget.running(), 1);
        }
        assert_eq!(budget.running(), 0);
    }

    #[tokio::test]
    async fn test_waiter_admitted_after_release() {
        let budget = budget(1, None, None);
        let guard = budget.acquire(request(1, 0)).await;

        let waiter = {
            let budget = budget.clone();
            tokio::spawn(async move {
                let _guard = budget.acquire(request(1, 0)).await;
            })
        };

        // The waiter cannot be admitted while the slot is held.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!waiter.is_finished());

        drop(guard);
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_gpu_slots_bound_admission() {
        let budget = budget(8, None, Some(1));
        let guard = budget.acquire(request(1, 1)).await;

        let waiter = {
            let budget = budget.clone();
            tokio::spawn(async move {
                let _guard = budget.acquire(request(1, 1)).await;
            })
        };

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!waiter.is_finished());

        // A CPU-only stage is admitted alongside the GPU holder.
        let _cpu_only = budget.acquire(request(1, 0)).await;

        drop(guard);
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
    }
}
