//! Linux map backend using the `bpf(2)` system call.
//!
//! Handles are the map file descriptors returned by `BPF_MAP_CREATE`.
//! Creating maps requires `CAP_BPF` (or `CAP_SYS_ADMIN` on older kernels).

use std::io;
use std::mem;

use libc::{c_long, c_void};
use tracing::debug;

use crate::error::MapError;
use crate::maps::{MapBackend, MapDefinition, MapHandle};

const BPF_MAP_CREATE: c_long = 0;

/// Kernel limit on map names, including the trailing NUL.
const BPF_OBJ_NAME_LEN: usize = 16;

/// Prefix of `union bpf_attr` used by `BPF_MAP_CREATE`.
#[repr(C)]
#[derive(Debug, Default)]
struct MapCreateAttr
{
    map_type: u32,
    key_size: u32,
    value_size: u32,
    max_entries: u32,
    map_flags: u32,
    inner_map_fd: u32,
    numa_node: u32,
    map_name: [u8; BPF_OBJ_NAME_LEN],
    map_ifindex: u32,
    btf_fd: u32,
    btf_key_type_id: u32,
    btf_value_type_id: u32,
    btf_vmlinux_value_type_id: u32,
    map_extra: u64,
}

/// Kernel map names may only contain alphanumerics, `_` and `.`.
fn kernel_map_name(name: &str) -> [u8; BPF_OBJ_NAME_LEN]
{
    let mut out = [0u8; BPF_OBJ_NAME_LEN];
    for (slot, byte) in out.iter_mut().zip(name.bytes().take(BPF_OBJ_NAME_LEN - 1)) {
        *slot = if byte.is_ascii_alphanumeric() || byte == b'_' || byte == b'.' {
            byte
        } else {
            b'_'
        };
    }
    out
}

/// Creates real kernel maps.
#[derive(Debug, Default, Clone, Copy)]
pub struct SyscallBackend;

impl SyscallBackend
{
    #[must_use]
    pub fn new() -> Self
    {
        Self
    }
}

impl MapBackend for SyscallBackend
{
    fn create(&self, definition: &MapDefinition, inner: Option<MapHandle>) -> Result<MapHandle, MapError>
    {
        let attr = MapCreateAttr {
            map_type: definition.kind.raw(),
            key_size: definition.key_size,
            value_size: definition.value_size,
            max_entries: definition.max_entries,
            map_flags: definition.flags,
            inner_map_fd: inner.map_or(0, MapHandle::raw),
            map_name: kernel_map_name(&definition.name),
            ..MapCreateAttr::default()
        };

        // SAFETY: `attr` is a fully initialised, correctly sized prefix of
        // `union bpf_attr` and outlives the call.
        let fd = unsafe {
            libc::syscall(
                libc::SYS_bpf,
                BPF_MAP_CREATE,
                std::ptr::addr_of!(attr).cast::<c_void>(),
                mem::size_of::<MapCreateAttr>(),
            )
        };

        if fd < 0 {
            let err = io::Error::last_os_error();
            return Err(match err.raw_os_error() {
                Some(libc::ENOMEM | libc::ENOSPC) => MapError::ResourceExhausted {
                    name: definition.name.clone(),
                },
                _ => MapError::CreateFailed {
                    name: definition.name.clone(),
                    reason: err.to_string(),
                },
            });
        }

        let fd = u32::try_from(fd).map_err(|_| MapError::CreateFailed {
            name: definition.name.clone(),
            reason: format!("kernel returned out-of-range fd {fd}"),
        })?;
        debug!("bpf(BPF_MAP_CREATE) for {} returned fd {fd}", definition.name);
        Ok(MapHandle::from_raw(fd))
    }

    fn destroy(&self, handle: MapHandle)
    {
        let Ok(fd) = i32::try_from(handle.raw()) else {
            return;
        };
        // SAFETY: the fd was returned by BPF_MAP_CREATE and is closed once,
        // when the manager drops its last reference.
        unsafe {
            libc::close(fd);
        }
    }
}

#[cfg(test)]
mod tests
{
    use super::*;

    #[test]
    fn test_kernel_map_name_is_sanitised_and_truncated()
    {
        let name = kernel_map_name("my-map.with_a_very_long_name");
        assert_eq!(&name[..15], b"my_map.with_a_v");
        assert_eq!(name[15], 0);
    }

    #[test]
    fn test_attr_layout_matches_kernel()
    {
        assert_eq!(mem::size_of::<MapCreateAttr>(), 72);
        assert_eq!(mem::offset_of!(MapCreateAttr, map_name), 28);
        assert_eq!(mem::offset_of!(MapCreateAttr, map_extra), 64);
    }
}
