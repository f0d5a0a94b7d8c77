// C2: the file-descriptor registry.
//
// Grounded field-for-field on `original_source/include/fd_manager.h`'s
// `FileDescriptor`/`FileDescriptorManagerImpl` (the `m_is_init`,
// `m_is_socket`, `m_system_non_block`, `m_user_non_block`,
// `m_is_closed`, `m_recv_timeout`, `m_send_timeout` fields and the
// `get(fd, auto_create)`/`remove(fd)` contract). The original's
// `RWLock`-guarded `std::vector<FileDescriptor::ptr>` becomes an
// `RwLock<Vec<Option<Arc<FdRecord>>>>`; `SingletonPtr<...>` becomes a
// process-wide `once_cell::sync::Lazy`.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use once_cell::sync::Lazy;

/// No timeout configured -- `original_source/src/hook.cc` treats
/// `~0ull` (here, `u64::MAX`) as "block forever".
pub const TIMEOUT_INFINITE: u64 = u64::MAX;

pub const TIMEOUT_RECV: i32 = 0;
pub const TIMEOUT_SEND: i32 = 1;

/// A single fd's bookkeeping record. `is_socket`/`is_init` are set once
/// at creation and never change afterward; the remaining flags are
/// mutated by whichever coroutine currently owns the fd (typically
/// exactly one).
pub struct FdRecord {
    fd: i32,
    is_init: AtomicBool,
    is_socket: AtomicBool,
    system_non_block: AtomicBool,
    user_non_block: AtomicBool,
    is_closed: AtomicBool,
    recv_timeout_ms: AtomicU64,
    send_timeout_ms: AtomicU64,
}

impl FdRecord {
    fn new(fd: i32) -> FdRecord {
        FdRecord {
            fd,
            is_init: AtomicBool::new(false),
            is_socket: AtomicBool::new(false),
            system_non_block: AtomicBool::new(false),
            user_non_block: AtomicBool::new(false),
            is_closed: AtomicBool::new(false),
            recv_timeout_ms: AtomicU64::new(TIMEOUT_INFINITE),
            send_timeout_ms: AtomicU64::new(TIMEOUT_INFINITE),
        }
    }

    pub fn fd(&self) -> i32 {
        self.fd
    }

    pub fn is_init(&self) -> bool {
        self.is_init.load(Ordering::Acquire)
    }

    pub fn is_socket(&self) -> bool {
        self.is_socket.load(Ordering::Acquire)
    }

    pub fn is_closed(&self) -> bool {
        self.is_closed.load(Ordering::Acquire)
    }

    pub fn set_user_non_block(&self, v: bool) {
        self.user_non_block.store(v, Ordering::Release);
    }

    pub fn user_non_block(&self) -> bool {
        self.user_non_block.load(Ordering::Acquire)
    }

    pub fn set_system_non_block(&self, v: bool) {
        self.system_non_block.store(v, Ordering::Release);
    }

    pub fn system_non_block(&self) -> bool {
        self.system_non_block.load(Ordering::Acquire)
    }

    pub fn set_timeout(&self, kind: i32, ms: u64) {
        match kind {
            TIMEOUT_RECV => self.recv_timeout_ms.store(ms, Ordering::Release),
            TIMEOUT_SEND => self.send_timeout_ms.store(ms, Ordering::Release),
            _ => unreachable!("unknown timeout kind {kind}"),
        }
    }

    pub fn timeout(&self, kind: i32) -> u64 {
        match kind {
            TIMEOUT_RECV => self.recv_timeout_ms.load(Ordering::Acquire),
            TIMEOUT_SEND => self.send_timeout_ms.load(Ordering::Acquire),
            _ => unreachable!("unknown timeout kind {kind}"),
        }
    }

    /// Determine socket-ness via `fstat`, and if it is a socket, force
    /// `O_NONBLOCK` at the kernel level -- `original_source/src/fd_manager.cc`'s
    /// `FileDescriptor::init()` (not separately retained in the pack,
    /// but its effect is fully specified by `fd_manager.h`'s doc
    /// comments and `hook.cc`'s call sites).
    fn init(&self) {
        if self.is_init.load(Ordering::Acquire) {
            return;
        }
        unsafe {
            let mut st: libc::stat = std::mem::zeroed();
            let is_socket = if libc::fstat(self.fd, &mut st) == 0 {
                (st.st_mode & libc::S_IFMT) == libc::S_IFSOCK
            } else {
                false
            };
            self.is_socket.store(is_socket, Ordering::Release);

            if is_socket {
                let flags = libc::fcntl(self.fd, libc::F_GETFL, 0);
                if flags >= 0 && flags & libc::O_NONBLOCK == 0 {
                    libc::fcntl(self.fd, libc::F_SETFL, flags | libc::O_NONBLOCK);
                }
                self.system_non_block.store(true, Ordering::Release);
            }
        }
        self.is_init.store(true, Ordering::Release);
    }
}

struct FdRegistryInner {
    records: RwLock<Vec<Option<Arc<FdRecord>>>>,
}

impl FdRegistryInner {
    fn new() -> FdRegistryInner {
        FdRegistryInner {
            records: RwLock::new(Vec::new()),
        }
    }

    fn get(&self, fd: i32, auto_create: bool) -> Option<Arc<FdRecord>> {
        if fd < 0 {
            return None;
        }
        let idx = fd as usize;
        {
            let records = self.records.read().unwrap();
            if let Some(Some(rec)) = records.get(idx) {
                return Some(rec.clone());
            }
            if !auto_create {
                return None;
            }
        }

        let mut records = self.records.write().unwrap();
        if records.len() <= idx {
            // Doubling growth policy, matching C2/C5's shared
            // "grows on demand, doubling policy".
            let mut new_len = records.len().max(1);
            while new_len <= idx {
                new_len *= 2;
            }
            records.resize_with(new_len, || None);
        }
        if records[idx].is_none() {
            let rec = Arc::new(FdRecord::new(fd));
            rec.init();
            records[idx] = Some(rec);
        }
        records[idx].clone()
    }

    fn remove(&self, fd: i32) {
        if fd < 0 {
            return;
        }
        let idx = fd as usize;
        let mut records = self.records.write().unwrap();
        if let Some(slot) = records.get_mut(idx) {
            if let Some(rec) = slot {
                rec.is_closed.store(true, Ordering::Release);
            }
            *slot = None;
        }
    }
}

static REGISTRY: Lazy<FdRegistryInner> = Lazy::new(FdRegistryInner::new);

pub fn get(fd: i32, auto_create: bool) -> Option<Arc<FdRecord>> {
    REGISTRY.get(fd, auto_create)
}

pub fn remove(fd: i32) {
    REGISTRY.remove(fd)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn get_without_auto_create_returns_none_for_unknown_fd() {
        assert!(get(999_991, false).is_none());
    }

    #[test]
    fn get_with_auto_create_grows_the_vector_and_is_idempotent() {
        let fd = 7;
        let a = get(fd, true).unwrap();
        let b = get(fd, true).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn remove_clears_the_slot_and_marks_closed() {
        let fd = 11;
        let rec = get(fd, true).unwrap();
        remove(fd);
        assert!(rec.is_closed());
        assert!(get(fd, false).is_none());
    }

    #[test]
    fn timeouts_default_to_infinite_and_are_settable() {
        let fd = 13;
        let rec = get(fd, true).unwrap();
        assert_eq!(rec.timeout(TIMEOUT_RECV), TIMEOUT_INFINITE);
        rec.set_timeout(TIMEOUT_SEND, 1500);
        assert_eq!(rec.timeout(TIMEOUT_SEND), 1500);
    }
}
