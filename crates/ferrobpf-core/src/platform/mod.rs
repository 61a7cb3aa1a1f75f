//! # Platform-Specific Implementations
//!
//! Kernel-facing pieces of the loader.
//!
//! - **Linux**: [`linux::SyscallBackend`] creates maps with `bpf(BPF_MAP_CREATE)`
//!   - See: [bpf(2) man page](https://man7.org/linux/man-pages/man2/bpf.2.html)
//!
//! Other hosts can still prepare programs using
//! [`InMemoryBackend`](crate::maps::InMemoryBackend).

#[cfg(target_os = "linux")]
pub mod linux;

use crate::btf::TypeGraph;
use crate::error::{LoaderError, LoaderResult};

/// Sysfs file listing the CPUs that may ever come online.
pub const POSSIBLE_CPUS_PATH: &str = "/sys/devices/system/cpu/possible";

/// Type information of the running kernel.
pub const VMLINUX_BTF_PATH: &str = "/sys/kernel/btf/vmlinux";

/// Count the CPUs in a kernel CPU list such as `0-3,6,8-9`.
///
/// ## Errors
///
/// `Parse` if the list is empty or malformed.
pub fn parse_cpu_list(list: &str) -> LoaderResult<u32>
{
    let invalid = |reason: &str| LoaderError::parse("cpu list", format!("`{}`: {reason}", list.trim()));
    let mut count = 0u32;

    for range in list.trim().split(',').filter(|range| !range.is_empty()) {
        let (start, end) = match range.split_once('-') {
            Some((start, end)) => (start, end),
            None => (range, range),
        };
        let start: u32 = start.trim().parse().map_err(|_| invalid("bad cpu number"))?;
        let end: u32 = end.trim().parse().map_err(|_| invalid("bad cpu number"))?;
        if end < start {
            return Err(invalid("descending range"));
        }
        count = (end - start)
            .checked_add(1)
            .and_then(|span| count.checked_add(span))
            .ok_or_else(|| invalid("too many cpus"))?;
    }

    if count == 0 {
        return Err(invalid("no cpus"));
    }
    Ok(count)
}

/// Number of possible CPUs on this host.
///
/// ## Errors
///
/// `Io` if the sysfs file cannot be read, `Parse` if it is malformed.
pub fn possible_cpus() -> LoaderResult<u32>
{
    parse_cpu_list(&std::fs::read_to_string(POSSIBLE_CPUS_PATH)?)
}

/// Load the running kernel's type graph, the usual relocation target.
///
/// ## Errors
///
/// `Io` if the kernel does not expose BTF, `Parse` if it is malformed.
pub fn kernel_btf() -> LoaderResult<TypeGraph>
{
    let raw = std::fs::read(VMLINUX_BTF_PATH)?;
    TypeGraph::load(&raw)
}

#[cfg(test)]
mod tests
{
    use super::*;

    #[test]
    fn test_parse_cpu_list()
    {
        assert_eq!(parse_cpu_list("0\n").unwrap(), 1);
        assert_eq!(parse_cpu_list("0-7").unwrap(), 8);
        assert_eq!(parse_cpu_list("0-3,6,8-9").unwrap(), 7);
        assert!(parse_cpu_list("").is_err());
        assert!(parse_cpu_list("3-1").is_err());
        assert!(parse_cpu_list("a-b").is_err());
    }

    #[test]
    fn test_parse_cpu_list_rejects_overflowing_count()
    {
        let err = parse_cpu_list("0-4294967295").unwrap_err();
        assert!(matches!(err, LoaderError::Parse { .. }));
        assert!(err.to_string().contains("too many cpus"), "{err}");
        assert!(parse_cpu_list("0-4294967294,4294967295").is_err());
        assert_eq!(parse_cpu_list("1-4294967295").unwrap(), u32::MAX);
    }
}
