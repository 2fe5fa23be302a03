use crate::error::{Error, Result};
use std::collections::HashSet;
use std::fs;
use std::io;
use std::mem;
use std::sync::OnceLock;

static AVAILABLE_CORES: OnceLock<usize> = OnceLock::new();
static PHYSICAL_CORES: OnceLock<usize> = OnceLock::new();

/// Number of CPUs the process is allowed to run on, discovered once and cached
/// for the lifetime of the process.
pub fn available_cores() -> Result<usize> {
    if let Some(cores) = AVAILABLE_CORES.get() {
        return Ok(*cores);
    }

    let cores = discover_available_cores()?;
    Ok(*AVAILABLE_CORES.get_or_init(|| cores))
}

/// Reads the process affinity mask and counts the permitted CPUs. Unlike
/// [`available_cores`] this always goes to the OS.
pub fn discover_available_cores() -> Result<usize> {
    allowed_cpus().map(|cpus| cpus.len())
}

/// Physical cores among the permitted CPUs: SMT siblings of one core count
/// once. Cached like [`available_cores`].
pub fn physical_cores() -> Result<usize> {
    if let Some(cores) = PHYSICAL_CORES.get() {
        return Ok(*cores);
    }

    let cores = discover_physical_cores()?;
    Ok(*PHYSICAL_CORES.get_or_init(|| cores))
}

fn discover_physical_cores() -> Result<usize> {
    let cpus = allowed_cpus()?;

    // Without a readable topology, assume the mask covers whole cores.
    Ok(count_physical_cores(&cpus, read_core_topology)
        .unwrap_or_else(|| num_cpus::get_physical().clamp(1, cpus.len())))
}

/// `(package, core)` of a CPU, from sysfs.
fn read_core_topology(cpu: usize) -> Option<(i64, i64)> {
    let read = |file: &str| -> Option<i64> {
        fs::read_to_string(format!("/sys/devices/system/cpu/cpu{cpu}/topology/{file}"))
            .ok()?
            .trim()
            .parse()
            .ok()
    };

    Some((read("physical_package_id")?, read("core_id")?))
}

/// Distinct cores behind `cpus`, or `None` if any CPU's topology is unknown.
fn count_physical_cores<F>(cpus: &[usize], topology: F) -> Option<usize>
where
    F: Fn(usize) -> Option<(i64, i64)>,
{
    cpus.iter()
        .map(|&cpu| topology(cpu))
        .collect::<Option<HashSet<_>>>()
        .map(|cores| cores.len())
}

/// CPU indices set in the affinity mask of the calling process, in ascending
/// order.
pub(crate) fn allowed_cpus() -> Result<Vec<usize>> {
    // Safety: cpu_set_t is a plain bitmask, all zeroes is the empty set.
    let mut set: libc::cpu_set_t = unsafe { mem::zeroed() };

    let ret = unsafe { libc::sched_getaffinity(0, mem::size_of::<libc::cpu_set_t>(), &mut set) };
    if ret != 0 {
        return Err(Error::Affinity(io::Error::last_os_error()));
    }

    let cpus = (0..libc::CPU_SETSIZE as usize)
        .filter(|&cpu| unsafe { libc::CPU_ISSET(cpu, &set) })
        .collect::<Vec<_>>();

    if cpus.is_empty() {
        Err(Error::NoAvailableCores)
    } else {
        Ok(cpus)
    }
}

/// CPU a worker of the given rank is pinned to: ranks wrap around the
/// permitted set.
pub(crate) fn cpu_for_rank(cpus: &[usize], rank: usize) -> Option<usize> {
    if cpus.is_empty() {
        None
    } else {
        Some(cpus[rank % cpus.len()])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;
    use rstest::rstest;

    #[test]
    fn test_available_cores_is_cached() -> Result<()> {
        let discovered = discover_available_cores()?;
        assert!(discovered > 0);

        assert_eq!(available_cores()?, discovered);
        assert_eq!(available_cores()?, discovered);
        Ok(())
    }

    #[test]
    fn test_physical_cores_within_permitted() -> Result<()> {
        let physical = physical_cores()?;
        assert!(physical > 0);
        assert!(physical <= available_cores()?);
        Ok(())
    }

    #[rstest]
    #[case::smt_pairs(&[0, 1, 2, 3], 2)]
    #[case::one_sibling_each(&[0, 2], 2)]
    #[case::siblings_only(&[4, 5], 1)]
    #[case::two_packages(&[0, 8], 2)]
    fn test_smt_siblings_count_once(#[case] cpus: &[usize], #[case] expected: usize) {
        // Eight CPUs per package, two hardware threads per core.
        let topology = |cpu: usize| Some(((cpu / 8) as i64, ((cpu % 8) / 2) as i64));
        assert_eq!(count_physical_cores(cpus, topology), Some(expected));
    }

    #[test]
    fn test_unknown_topology_is_not_guessed() {
        let topology = |cpu: usize| (cpu != 3).then_some((0, cpu as i64));
        assert_eq!(count_physical_cores(&[0, 1, 3], topology), None);
    }

    #[test]
    fn test_allowed_cpus_sorted_and_unique() -> Result<()> {
        let cpus = allowed_cpus()?;
        assert!(!cpus.is_empty());
        assert!(cpus.windows(2).all(|w| w[0] < w[1]));
        Ok(())
    }

    #[rstest]
    #[case::first(&[0, 2, 4], 0, Some(0))]
    #[case::middle(&[0, 2, 4], 1, Some(2))]
    #[case::wraps(&[0, 2, 4], 4, Some(2))]
    #[case::single(&[7], 9, Some(7))]
    #[case::empty(&[], 3, None)]
    fn test_cpu_for_rank(
        #[case] cpus: &[usize],
        #[case] rank: usize,
        #[case] expected: Option<usize>,
    ) {
        assert_eq!(cpu_for_rank(cpus, rank), expected);
    }
}
