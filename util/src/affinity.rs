use crate::error::{Error, Result};

/// Sentinel meaning "leave this thread unpinned".
pub const CPU_NONE: i64 = -1;

/// Upper bound on addressable logical CPUs.
pub const MAX_CPUS: usize = 1024;

const WORD_BITS: usize = 64;

/// Bitset over logical CPUs, the unit handed to [`pin_current_to_cpus`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CpuMask {
    bits: [u64; MAX_CPUS / WORD_BITS],
}

impl Default for CpuMask {
    fn default() -> Self {
        CpuMask {
            bits: [0; MAX_CPUS / WORD_BITS],
        }
    }
}

impl CpuMask {
    pub fn new() -> Self {
        CpuMask::default()
    }

    /// Mask with a single CPU set; `CPU_NONE` yields an empty mask.
    pub fn single(cpu: i64) -> Self {
        let mut mask = CpuMask::new();
        if cpu != CPU_NONE {
            mask.set(cpu as usize);
        }
        mask
    }

    pub fn from_cores(cores: &[usize]) -> Result<Self> {
        let mut mask = CpuMask::new();
        for &core in cores {
            if core >= MAX_CPUS {
                return Err(Error::invalid_argument(format!(
                    "CPU index {core} out of range (max {MAX_CPUS})"
                )));
            }
            mask.set(core);
        }
        Ok(mask)
    }

    pub fn set(&mut self, cpu: usize) {
        if cpu < MAX_CPUS {
            self.bits[cpu / WORD_BITS] |= 1u64 << (cpu % WORD_BITS);
        }
    }

    pub fn is_set(&self, cpu: usize) -> bool {
        cpu < MAX_CPUS && self.bits[cpu / WORD_BITS] & (1u64 << (cpu % WORD_BITS)) != 0
    }

    pub fn is_empty(&self) -> bool {
        self.bits.iter().all(|&w| w == 0)
    }

    pub fn count(&self) -> usize {
        self.bits.iter().map(|w| w.count_ones() as usize).sum()
    }

    pub fn iter(&self) -> impl Iterator<Item = usize> + '_ {
        (0..MAX_CPUS).filter(move |&c| self.is_set(c))
    }
}

/// Number of logical CPUs visible to this process. Processor-group aware
/// on platforms with more than 64 CPUs (std handles the group walk).
pub fn num_logical_cpus() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

/// Pins the calling thread to the CPUs of `mask`.
///
/// An empty mask is rejected with `InvalidArgument`; bits beyond the
/// discovered CPU count are rejected the same way.
pub fn pin_current_to_cpus(mask: &CpuMask) -> Result<()> {
    if mask.is_empty() {
        return Err(Error::invalid_argument("empty CPU affinity mask"));
    }
    let online = num_logical_cpus();
    if let Some(bad) = mask.iter().find(|&c| c >= online) {
        return Err(Error::invalid_argument(format!(
            "CPU {bad} is not online (found {online} CPUs)"
        )));
    }
    pin_current_impl(mask)
}

/// Pins the calling thread to a single core; `CPU_NONE` is a no-op.
pub fn pin_current_to_core(core: i64) -> Result<()> {
    if core == CPU_NONE {
        return Ok(());
    }
    pin_current_to_cpus(&CpuMask::single(core))
}

#[cfg(target_os = "linux")]
fn pin_current_impl(mask: &CpuMask) -> Result<()> {
    use nix::sched::CpuSet;
    use nix::unistd::Pid;

    let mut set = CpuSet::new();
    for cpu in mask.iter() {
        set.set(cpu)
            .map_err(|e| Error::invalid_argument(format!("CPU {cpu} not settable: {e}")))?;
    }
    nix::sched::sched_setaffinity(Pid::from_raw(0), &set)
        .map_err(|e| Error::Io(format!("sched_setaffinity: {e}")))
}

#[cfg(not(target_os = "linux"))]
fn pin_current_impl(_mask: &CpuMask) -> Result<()> {
    Err(Error::unsupported("thread pinning on this platform"))
}

/// Best-effort promotion of the calling thread to a time-critical
/// scheduling class. Senders call this once; refusal (no privileges) is
/// logged and ignored.
pub fn set_time_critical_priority() {
    #[cfg(target_os = "linux")]
    {
        let param = libc::sched_param { sched_priority: 1 };
        let rc = unsafe { libc::pthread_setschedparam(libc::pthread_self(), libc::SCHED_FIFO, &param) };
        if rc != 0 {
            log::debug!("time-critical priority unavailable (errno {rc})");
        }
    }
}

#[cfg(test)]
mod affinity_test {
    use super::*;

    #[test]
    fn test_mask_bits() {
        let mut mask = CpuMask::new();
        assert!(mask.is_empty());
        mask.set(0);
        mask.set(63);
        mask.set(64);
        assert!(mask.is_set(0));
        assert!(mask.is_set(63));
        assert!(mask.is_set(64));
        assert!(!mask.is_set(1));
        assert_eq!(mask.count(), 3);
        assert_eq!(mask.iter().collect::<Vec<_>>(), vec![0, 63, 64]);
    }

    #[test]
    fn test_empty_mask_rejected() {
        let err = pin_current_to_cpus(&CpuMask::new()).unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));
    }

    #[test]
    fn test_out_of_range_core_rejected() {
        assert!(CpuMask::from_cores(&[MAX_CPUS]).is_err());
        let err = pin_current_to_cpus(&CpuMask::single(MAX_CPUS as i64 - 1));
        // either not online (most machines) or a successful pin on a
        // 1024-way box; never a panic
        if let Err(e) = err {
            assert!(matches!(e, Error::InvalidArgument(_) | Error::Io(_)));
        }
    }

    #[test]
    fn test_cpu_none_is_noop() {
        pin_current_to_core(CPU_NONE).unwrap();
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_pin_to_first_cpu() {
        pin_current_to_cpus(&CpuMask::single(0)).unwrap();
    }
}
