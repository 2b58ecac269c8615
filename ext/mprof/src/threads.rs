//! Kernel thread enumeration and naming for the sampling loop.

use crate::configuration::PriorityClass;

#[cfg(any(target_os = "linux", target_os = "android"))]
mod imp {
    use std::fs;

    use super::PriorityClass;

    pub fn current_thread_id() -> u32 {
        unsafe { libc::syscall(libc::SYS_gettid) as u32 }
    }

    pub fn list_threads(out: &mut Vec<u32>) -> bool {
        out.clear();
        let entries = match fs::read_dir("/proc/self/task") {
            Ok(entries) => entries,
            Err(err) => {
                log::debug!("Failed to enumerate threads: {}", err);
                return false;
            }
        };
        for entry in entries.flatten() {
            if let Some(tid) = entry.file_name().to_str().and_then(|s| s.parse().ok()) {
                out.push(tid);
            }
        }
        true
    }

    pub fn thread_name(tid: u32) -> Option<String> {
        let comm = fs::read_to_string(format!("/proc/self/task/{}/comm", tid)).ok()?;
        let name = comm.trim_end_matches('\n');
        (!name.is_empty()).then(|| name.to_string())
    }

    pub fn set_current_thread_priority(priority: PriorityClass) {
        let tid = current_thread_id();
        let err = unsafe {
            libc::setpriority(libc::PRIO_PROCESS as _, tid as libc::id_t, priority.nice_value())
        };
        if err != 0 {
            // Raising priority needs CAP_SYS_NICE; running at the default is fine.
            log::debug!(
                "setpriority({:?}) failed: {}",
                priority,
                std::io::Error::last_os_error()
            );
        }
    }
}

#[cfg(not(any(target_os = "linux", target_os = "android")))]
mod imp {
    use super::PriorityClass;

    pub fn current_thread_id() -> u32 {
        0
    }

    pub fn list_threads(out: &mut Vec<u32>) -> bool {
        out.clear();
        false
    }

    pub fn thread_name(_tid: u32) -> Option<String> {
        None
    }

    pub fn set_current_thread_priority(_priority: PriorityClass) {}
}

pub use imp::{current_thread_id, list_threads, set_current_thread_priority, thread_name};
