//! Scoped thread affinity pinning
//!
//! Pinning the calling thread is process-wide state: only one pin may be
//! held at a time, and the prior mask is restored on drop, including on
//! early returns and panics. Do not nest pins on one thread.

use crate::error::Result;
use parking_lot::{Mutex, MutexGuard};

static PIN_LOCK: Mutex<()> = parking_lot::const_mutex(());

/// Restores the previous affinity mask when dropped
pub struct AffinityGuard {
    #[cfg(target_os = "linux")]
    previous: Option<nix::sched::CpuSet>,
    _lock: MutexGuard<'static, ()>,
}

impl AffinityGuard {
    /// Pin the calling thread to logical processor `cpu`
    #[cfg(target_os = "linux")]
    pub fn pin(cpu: usize) -> Result<Self> {
        use nix::sched::{sched_getaffinity, sched_setaffinity, CpuSet};
        use nix::unistd::Pid;

        let lock = PIN_LOCK.lock();
        let current = Pid::from_raw(0);
        let previous = sched_getaffinity(current)?;
        let mut target = CpuSet::new();
        target.set(cpu)?;
        sched_setaffinity(current, &target)?;
        Ok(Self {
            previous: Some(previous),
            _lock: lock,
        })
    }

    /// Affinity is not managed on this platform
    #[cfg(not(target_os = "linux"))]
    pub fn pin(_cpu: usize) -> Result<Self> {
        Ok(Self {
            _lock: PIN_LOCK.lock(),
        })
    }
}

impl Drop for AffinityGuard {
    fn drop(&mut self) {
        #[cfg(target_os = "linux")]
        {
            if let Some(previous) = self.previous.take() {
                let current = nix::unistd::Pid::from_raw(0);
                if let Err(e) = nix::sched::sched_setaffinity(current, &previous) {
                    log::warn!("Failed to restore thread affinity: {}", e);
                }
            }
        }
    }
}

/// Number of online logical processors
pub fn logical_processor_count() -> usize {
    #[cfg(unix)]
    {
        // SAFETY: sysconf has no memory-safety preconditions
        let n = unsafe { libc::sysconf(libc::_SC_NPROCESSORS_ONLN) };
        if n > 0 {
            return n as usize;
        }
    }
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[cfg(target_os = "linux")]
    const MAX_CPUS: usize = 64;

    #[test]
    #[cfg(target_os = "linux")]
    fn test_pin_and_restore() {
        use nix::sched::sched_getaffinity;
        use nix::unistd::Pid;

        let before = sched_getaffinity(Pid::from_raw(0)).unwrap();
        let Some(cpu) = (0..MAX_CPUS).find(|&c| before.is_set(c).unwrap_or(false)) else {
            return;
        };
        {
            let _guard = AffinityGuard::pin(cpu).unwrap();
            let pinned = sched_getaffinity(Pid::from_raw(0)).unwrap();
            assert!(pinned.is_set(cpu).unwrap());
        }
        let after = sched_getaffinity(Pid::from_raw(0)).unwrap();
        for c in 0..MAX_CPUS {
            assert_eq!(before.is_set(c).ok(), after.is_set(c).ok());
        }
    }

    #[test]
    fn test_processor_count() {
        assert!(logical_processor_count() >= 1);
    }
}
