//! OS-level CPU affinity and CPU-time sampling.

use std::io;
use std::time::Duration;

/// Binds processes to sets of local CPU indices.
#[cfg_attr(test, mockall::automock)]
pub trait Affinity: Send + Sync {
    /// Restrict `pid` to exactly `cpus`. `cpus` must not be empty.
    fn bind(&self, pid: i32, cpus: &[usize]) -> io::Result<()>;

    /// Let `pid` run on every CPU available to the agent again. A process
    /// that no longer exists counts as unbound.
    fn unbind(&self, pid: i32) -> io::Result<()>;
}

/// Reports cumulative CPU time of a process.
#[cfg_attr(test, mockall::automock)]
pub trait CpuSampler: Send + Sync {
    /// User plus system time consumed so far, or `None` if the process is gone.
    fn cpu_time(&self, pid: i32) -> Option<Duration>;
}

/// `sched_setaffinity(2)` backed implementation.
pub struct SchedAffinity {
    /// The agent's own mask, restored on unbind.
    #[cfg(target_os = "linux")]
    full: libc::cpu_set_t,
}

#[cfg(target_os = "linux")]
impl SchedAffinity {
    pub fn new() -> io::Result<Self> {
        // SAFETY: cpu_set_t is plain data and sched_getaffinity fills it.
        let mut full: libc::cpu_set_t = unsafe { std::mem::zeroed() };
        let rc = unsafe {
            libc::sched_getaffinity(0, std::mem::size_of::<libc::cpu_set_t>(), &mut full)
        };
        if rc != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(Self { full })
    }

    fn apply(pid: i32, set: &libc::cpu_set_t) -> io::Result<()> {
        // SAFETY: `set` points to a valid, initialised cpu_set_t.
        let rc =
            unsafe { libc::sched_setaffinity(pid, std::mem::size_of::<libc::cpu_set_t>(), set) };
        if rc != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }
}

#[cfg(target_os = "linux")]
impl Affinity for SchedAffinity {
    fn bind(&self, pid: i32, cpus: &[usize]) -> io::Result<()> {
        if cpus.is_empty() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "empty CPU set",
            ));
        }
        let max = 8 * std::mem::size_of::<libc::cpu_set_t>();
        // SAFETY: zeroed cpu_set_t is the empty set.
        let mut set: libc::cpu_set_t = unsafe { std::mem::zeroed() };
        for &cpu in cpus {
            if cpu >= max {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    format!("CPU {cpu} out of range"),
                ));
            }
            // SAFETY: cpu < CPU_SETSIZE checked above.
            unsafe { libc::CPU_SET(cpu, &mut set) };
        }
        Self::apply(pid, &set)
    }

    fn unbind(&self, pid: i32) -> io::Result<()> {
        match Self::apply(pid, &self.full) {
            Err(e) if e.raw_os_error() == Some(libc::ESRCH) => Ok(()),
            other => other,
        }
    }
}

#[cfg(not(target_os = "linux"))]
impl SchedAffinity {
    pub fn new() -> io::Result<Self> {
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "CPU affinity requires Linux",
        ))
    }
}

#[cfg(not(target_os = "linux"))]
impl Affinity for SchedAffinity {
    fn bind(&self, _pid: i32, _cpus: &[usize]) -> io::Result<()> {
        Err(io::ErrorKind::Unsupported.into())
    }

    fn unbind(&self, _pid: i32) -> io::Result<()> {
        Err(io::ErrorKind::Unsupported.into())
    }
}

/// Reads `utime + stime` from `/proc/<pid>/stat`.
pub struct ProcfsSampler {
    ticks_per_sec: u64,
}

impl Default for ProcfsSampler {
    fn default() -> Self {
        // SAFETY: sysconf has no preconditions.
        let ticks = unsafe { libc::sysconf(libc::_SC_CLK_TCK) };
        Self {
            ticks_per_sec: if ticks > 0 { ticks as u64 } else { 100 },
        }
    }
}

impl CpuSampler for ProcfsSampler {
    fn cpu_time(&self, pid: i32) -> Option<Duration> {
        let stat = std::fs::read_to_string(format!("/proc/{pid}/stat")).ok()?;
        let ticks = parse_stat_ticks(&stat)?;
        Some(Duration::from_secs_f64(
            ticks as f64 / self.ticks_per_sec as f64,
        ))
    }
}

/// Sum of the `utime` and `stime` fields of a `/proc/<pid>/stat` line.
fn parse_stat_ticks(stat: &str) -> Option<u64> {
    // The command name may contain spaces and parentheses; fields resume
    // after the last ')'. `state` is then field 0, utime 11, stime 12.
    let rest = &stat[stat.rfind(')')? + 1..];
    let mut fields = rest.split_whitespace().skip(11);
    let utime: u64 = fields.next()?.parse().ok()?;
    let stime: u64 = fields.next()?.parse().ok()?;
    Some(utime + stime)
}
