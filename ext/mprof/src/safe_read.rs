//! Reads of arbitrary process memory that fail instead of crashing.
//!
//! Every dereference of a pointer the profiler does not own (another thread's
//! stack, loader metadata that may be unmapped concurrently) goes through
//! [`try_read`]. A fault inside the copy is recovered by the C shim in
//! `fault-guard-sys`, whose recovery context is thread-local.

use std::ffi::c_void;
use std::io;

use fault_guard_sys::{fault_guard_copy, fault_guard_install};

use crate::error::{Error, Result};

pub fn install_fault_handlers() -> Result<()> {
    match unsafe { fault_guard_install() } {
        0 => Ok(()),
        errno => Err(Error::FaultHandlers(io::Error::from_raw_os_error(errno))),
    }
}

/// Copies `dst.len()` bytes starting at `src` into `dst`.
///
/// Returns false if any byte of the source range is unreadable; the contents
/// of `dst` are unspecified in that case.
pub fn try_read(src: usize, dst: &mut [u8]) -> bool {
    if dst.is_empty() {
        return true;
    }
    if src.checked_add(dst.len()).is_none() {
        return false;
    }
    if install_fault_handlers().is_err() {
        return false;
    }
    let copied = unsafe {
        fault_guard_copy(
            dst.as_mut_ptr() as *mut c_void,
            src as *const c_void,
            dst.len(),
        )
    };
    copied == 1
}

pub trait MemoryReader {
    fn read_bytes(&self, addr: u64, dst: &mut [u8]) -> bool;

    fn read_u64(&self, addr: u64) -> Option<u64> {
        let mut buf = [0u8; 8];
        self.read_bytes(addr, &mut buf)
            .then(|| u64::from_ne_bytes(buf))
    }

    fn read_u32(&self, addr: u64) -> Option<u32> {
        let mut buf = [0u8; 4];
        self.read_bytes(addr, &mut buf)
            .then(|| u32::from_ne_bytes(buf))
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SafeMemoryReader;

impl MemoryReader for SafeMemoryReader {
    fn read_bytes(&self, addr: u64, dst: &mut [u8]) -> bool {
        match usize::try_from(addr) {
            Ok(addr) => try_read(addr, dst),
            Err(_) => false,
        }
    }
}

/// Reads a NUL-terminated string of at most `max_len` bytes.
///
/// Reads are split at page boundaries so a string ending right before an
/// unmapped page is still returned.
pub fn read_c_string<R: MemoryReader>(reader: &R, addr: u64, max_len: usize) -> Option<String> {
    const PAGE_SIZE: u64 = 4096;
    const CHUNK: u64 = 64;

    if addr == 0 {
        return None;
    }
    let mut bytes = Vec::new();
    let mut cursor = addr;
    while bytes.len() < max_len {
        let to_page_end = PAGE_SIZE - (cursor % PAGE_SIZE);
        let len = CHUNK.min(to_page_end) as usize;
        let mut chunk = [0u8; CHUNK as usize];
        if !reader.read_bytes(cursor, &mut chunk[..len]) {
            return None;
        }
        if let Some(nul) = chunk[..len].iter().position(|b| *b == 0) {
            bytes.extend_from_slice(&chunk[..nul]);
            return Some(String::from_utf8_lossy(&bytes).into_owned());
        }
        bytes.extend_from_slice(&chunk[..len]);
        cursor = cursor.checked_add(len as u64)?;
    }
    bytes.truncate(max_len);
    Some(String::from_utf8_lossy(&bytes).into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::ptr;
    use std::sync::Arc;
    use std::thread;

    // Maps one page and revokes all access to it.
    struct ProtectedPage {
        addr: *mut c_void,
        len: usize,
    }

    impl ProtectedPage {
        fn new() -> Self {
            let len = 4096;
            let addr = unsafe {
                libc::mmap(
                    ptr::null_mut(),
                    len,
                    libc::PROT_NONE,
                    libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                    -1,
                    0,
                )
            };
            assert_ne!(addr, libc::MAP_FAILED);
            Self { addr, len }
        }

        fn address(&self) -> usize {
            self.addr as usize
        }
    }

    impl Drop for ProtectedPage {
        fn drop(&mut self) {
            unsafe {
                libc::munmap(self.addr, self.len);
            }
        }
    }

    unsafe impl Send for ProtectedPage {}
    unsafe impl Sync for ProtectedPage {}

    #[test]
    fn test_valid_read_copies_exact_bytes() {
        let src: Vec<u8> = (0..=255).collect();
        let mut dst = vec![0u8; src.len()];
        assert!(try_read(src.as_ptr() as usize, &mut dst));
        assert_eq!(dst, src);
    }

    #[test]
    fn test_zero_length_read_succeeds() {
        assert!(try_read(0, &mut []));
    }

    #[test]
    fn test_invalid_read_fails_and_next_read_succeeds() {
        let page = ProtectedPage::new();
        let mut dst = [0u8; 16];
        assert!(!try_read(page.address(), &mut dst));
        assert!(!try_read(8, &mut dst));

        let value = 0x1122_3344_5566_7788u64;
        assert_eq!(
            SafeMemoryReader.read_u64(&value as *const u64 as u64),
            Some(value)
        );
    }

    #[test]
    fn test_overflowing_range_is_rejected() {
        let mut dst = [0u8; 16];
        assert!(!try_read(usize::MAX - 4, &mut dst));
    }

    #[test]
    fn test_read_c_string() {
        let s = b"libexample.so\0garbage";
        let addr = s.as_ptr() as u64;
        assert_eq!(
            read_c_string(&SafeMemoryReader, addr, 256).as_deref(),
            Some("libexample.so")
        );
        assert_eq!(
            read_c_string(&SafeMemoryReader, addr, 3).as_deref(),
            Some("lib")
        );
        assert_eq!(read_c_string(&SafeMemoryReader, 0, 256), None);
    }

    #[test]
    fn test_concurrent_valid_and_invalid_reads() {
        let page = Arc::new(ProtectedPage::new());
        let workers: Vec<_> = (0..32)
            .map(|i| {
                let page = Arc::clone(&page);
                thread::spawn(move || {
                    let valid: Vec<u64> = (0..64).map(|n| n * i).collect();
                    for _ in 0..500 {
                        let mut dst = [0u8; 64 * 8];
                        if i % 2 == 0 {
                            assert!(try_read(valid.as_ptr() as usize, &mut dst));
                            assert_eq!(
                                u64::from_ne_bytes(dst[8..16].try_into().unwrap()),
                                i
                            );
                        } else {
                            assert!(!try_read(page.address(), &mut dst));
                            let mut one = [0u8; 8];
                            assert!(try_read(valid.as_ptr() as usize + 8, &mut one));
                            assert_eq!(u64::from_ne_bytes(one), i);
                        }
                    }
                })
            })
            .collect();

        for worker in workers {
            worker.join().unwrap();
        }
    }
}
