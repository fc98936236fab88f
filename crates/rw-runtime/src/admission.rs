use std::sync::Arc;

use tokio::sync::{Semaphore, SemaphorePermit};

use rw_config::SchedulerConfig;

// ---------------------------------------------------------------------------
// Admission — process-wide CPU/memory budget
// ---------------------------------------------------------------------------

/// Caps the declared CPU and memory of concurrently-running tasks to a
/// host budget. Tasks queue on counted semaphores; a reservation larger
/// than the whole budget is downscaled with a warning rather than
/// deadlocking.
pub struct Admission {
    cpu: Semaphore,
    memory: Semaphore,
    cpu_budget: u32,
    /// Memory accounted in MiB so the permit count stays small.
    memory_budget_mib: u32,
}

/// Holds both reservations; dropping releases them.
pub struct AdmissionPermit<'a> {
    _cpu: SemaphorePermit<'a>,
    _memory: SemaphorePermit<'a>,
    pub cpu: u32,
    pub memory_bytes: u64,
}

impl Admission {
    pub fn new(config: &SchedulerConfig) -> Arc<Self> {
        let cpu_budget = if config.cpu > 0 {
            config.cpu
        } else {
            std::thread::available_parallelism()
                .map(|n| n.get() as u32)
                .unwrap_or(1)
        };
        let memory_bytes = if config.memory.as_bytes() > 0 {
            config.memory.as_bytes()
        } else {
            host_memory_bytes().unwrap_or(4 << 30)
        };
        let memory_budget_mib = (memory_bytes >> 20).max(1).min(u32::MAX as u64) as u32;

        Arc::new(Admission {
            cpu: Semaphore::new(cpu_budget as usize),
            memory: Semaphore::new(memory_budget_mib as usize),
            cpu_budget,
            memory_budget_mib,
        })
    }

    pub fn cpu_budget(&self) -> u32 {
        self.cpu_budget
    }

    pub fn memory_budget_bytes(&self) -> u64 {
        (self.memory_budget_mib as u64) << 20
    }

    /// Reserve `cpu` cores and `memory_bytes` of memory, waiting until the
    /// budget allows. Oversized reservations are downscaled to the budget.
    pub async fn acquire(&self, cpu: u32, memory_bytes: u64) -> AdmissionPermit<'_> {
        let mut cpu = cpu.max(1);
        if cpu > self.cpu_budget {
            rw_warn!(
                flow,
                requested = cpu,
                budget = self.cpu_budget,
                "task cpu reservation exceeds the host budget; downscaling"
            );
            cpu = self.cpu_budget;
        }
        let mut memory_mib = ((memory_bytes >> 20) as u32).max(1);
        if memory_mib > self.memory_budget_mib {
            rw_warn!(
                flow,
                requested_mib = memory_mib,
                budget_mib = self.memory_budget_mib,
                "task memory reservation exceeds the host budget; downscaling"
            );
            memory_mib = self.memory_budget_mib;
        }

        let cpu_permit = self
            .cpu
            .acquire_many(cpu)
            .await
            .expect("admission semaphore closed");
        let memory_permit = self
            .memory
            .acquire_many(memory_mib)
            .await
            .expect("admission semaphore closed");

        AdmissionPermit {
            _cpu: cpu_permit,
            _memory: memory_permit,
            cpu,
            memory_bytes: (memory_mib as u64) << 20,
        }
    }

    /// Available CPU permits right now (for tests and diagnostics).
    pub fn cpu_available(&self) -> usize {
        self.cpu.available_permits()
    }
}

/// Best-effort host memory detection from /proc/meminfo.
fn host_memory_bytes() -> Option<u64> {
    let text = std::fs::read_to_string("/proc/meminfo").ok()?;
    for line in text.lines() {
        if let Some(rest) = line.strip_prefix("MemTotal:") {
            let kb: u64 = rest.trim().trim_end_matches("kB").trim().parse().ok()?;
            return Some(kb * 1024);
        }
    }
    None
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use rw_config::ByteSize;
    use std::time::Duration;

    fn config(cpu: u32, memory: u64) -> SchedulerConfig {
        SchedulerConfig {
            cpu,
            memory: ByteSize::from(memory),
            fail_slow: false,
        }
    }

    #[tokio::test]
    async fn reservations_are_counted() {
        let admission = Admission::new(&config(4, 8 << 30));
        let a = admission.acquire(2, 1 << 30).await;
        assert_eq!(admission.cpu_available(), 2);
        let b = admission.acquire(2, 1 << 30).await;
        assert_eq!(admission.cpu_available(), 0);
        drop(a);
        assert_eq!(admission.cpu_available(), 2);
        drop(b);
        assert_eq!(admission.cpu_available(), 4);
    }

    #[tokio::test]
    async fn oversized_reservation_downscales() {
        let admission = Admission::new(&config(2, 1 << 30));
        // Requesting more than the budget must not deadlock.
        let permit = admission.acquire(16, 64 << 30).await;
        assert_eq!(permit.cpu, 2);
        assert_eq!(permit.memory_bytes, 1 << 30);
    }

    #[tokio::test]
    async fn tasks_queue_when_budget_is_exhausted() {
        let admission = Admission::new(&config(1, 1 << 30));
        let held = admission.acquire(1, 512 << 20).await;

        let waiter = {
            let admission = admission.clone();
            tokio::spawn(async move {
                let _p = admission.acquire(1, 512 << 20).await;
            })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!waiter.is_finished(), "waiter should be queued");

        drop(held);
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter should run after release")
            .unwrap();
    }
}
