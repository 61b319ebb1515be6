//! Thin wrappers over the SysV semaphore and shared-memory families.
//!
//! Semaphores follow the exclusive-create-then-open dance: whichever
//! process wins the `IPC_EXCL` race initializes the value, everyone else
//! opens the existing set. Segments and semaphore sets survive process
//! exit; `destroy` removes them from the kernel.

use std::io;

use tracing::debug;

const IPC_MODE: libc::c_int = 0o666;

#[derive(Clone, Copy, Debug)]
pub struct Semaphore {
    id: libc::c_int,
    key: libc::key_t,
}

impl Semaphore {
    /// Opens the single-semaphore set for `key`, creating and initializing
    /// it to `initial` if this process is the first.
    pub fn create(key: i32, initial: i32) -> io::Result<Self> {
        let key = key as libc::key_t;
        let id = unsafe { libc::semget(key, 1, libc::IPC_EXCL | libc::IPC_CREAT | IPC_MODE) };
        if id != -1 {
            debug!(key, initial, "created semaphore");
            let rc = unsafe { libc::semctl(id, 0, libc::SETVAL, initial as libc::c_int) };
            if rc == -1 {
                return Err(io::Error::last_os_error());
            }
            return Ok(Self { id, key });
        }
        // Lost the exclusive race; someone else initialized it.
        let id = unsafe { libc::semget(key, 1, libc::IPC_CREAT | IPC_MODE) };
        if id == -1 {
            return Err(io::Error::last_os_error());
        }
        Ok(Self { id, key })
    }

    #[inline]
    pub fn key(&self) -> i32 {
        self.key as i32
    }

    fn op(&self, sem_op: libc::c_short, sem_flg: libc::c_short) -> io::Result<()> {
        let mut op = libc::sembuf { sem_num: 0, sem_op, sem_flg };
        loop {
            let rc = unsafe { libc::semop(self.id, &mut op, 1) };
            if rc == 0 {
                return Ok(());
            }
            let err = io::Error::last_os_error();
            if err.kind() != io::ErrorKind::Interrupted {
                return Err(err);
            }
        }
    }

    /// P: blocks until the value is positive, then decrements.
    pub fn acquire(&self) -> io::Result<()> {
        self.op(-1, 0)
    }

    /// V: increments, waking one blocked acquirer.
    pub fn release(&self) -> io::Result<()> {
        self.op(1, 0)
    }

    /// Non-blocking P. `Ok(false)` when the value is zero.
    pub fn try_acquire(&self) -> io::Result<bool> {
        match self.op(-1, libc::IPC_NOWAIT as libc::c_short) {
            Ok(()) => Ok(true),
            Err(ref e) if e.raw_os_error() == Some(libc::EAGAIN) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// +1 with `SEM_UNDO`: the kernel reverses the increment when this
    /// process exits, however it exits. This is the liveness beacon.
    pub fn raise_undo(&self) -> io::Result<()> {
        self.op(1, libc::SEM_UNDO as libc::c_short)
    }

    /// -1 with `SEM_UNDO`: graceful counterpart of [`raise_undo`], cancels
    /// the pending adjustment instead of leaving it to process teardown.
    ///
    /// [`raise_undo`]: Semaphore::raise_undo
    pub fn lower_undo(&self) -> io::Result<()> {
        self.op(-1, libc::SEM_UNDO as libc::c_short)
    }

    /// Zero-wait probe. `Ok(true)` means the value is zero, i.e. the
    /// owner's undo has fired (or it never raised the beacon) and the slot
    /// is reclaimable.
    pub fn owner_vanished(&self) -> io::Result<bool> {
        match self.op(0, libc::IPC_NOWAIT as libc::c_short) {
            Ok(()) => Ok(true),
            Err(ref e) if e.raw_os_error() == Some(libc::EAGAIN) => Ok(false),
            Err(e) => Err(e),
        }
    }

    pub fn value(&self) -> io::Result<i32> {
        let rc = unsafe { libc::semctl(self.id, 0, libc::GETVAL) };
        if rc == -1 {
            return Err(io::Error::last_os_error());
        }
        Ok(rc)
    }

    /// Removes the set from the kernel. Outstanding handles in any process
    /// go stale.
    pub fn destroy(self) -> io::Result<()> {
        debug!(key = self.key, "destroying semaphore");
        let rc = unsafe { libc::semctl(self.id, 0, libc::IPC_RMID) };
        if rc == -1 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }
}

/// A mapped SysV segment. Plain handle semantics: no drop glue, callers
/// detach or destroy explicitly (mappings are meant to outlive scopes and
/// be shared across threads).
#[derive(Clone, Copy, Debug)]
pub struct ShmSegment {
    id: libc::c_int,
    ptr: *mut u8,
    size: usize,
}

unsafe impl Send for ShmSegment {}
unsafe impl Sync for ShmSegment {}

impl ShmSegment {
    /// Gets-or-creates the segment for `key` and attaches it.
    pub fn map(key: i32, size: usize) -> io::Result<Self> {
        let key = key as libc::key_t;
        let mut id =
            unsafe { libc::shmget(key, size, libc::IPC_CREAT | libc::IPC_EXCL | IPC_MODE) };
        if id == -1 {
            id = unsafe { libc::shmget(key, size, libc::IPC_CREAT | IPC_MODE) };
            if id == -1 {
                return Err(io::Error::last_os_error());
            }
        } else {
            debug!(key, size, "created shared memory segment");
        }
        let ptr = unsafe { libc::shmat(id, std::ptr::null(), 0) };
        if ptr == usize::MAX as *mut libc::c_void {
            return Err(io::Error::last_os_error());
        }
        Ok(Self { id, ptr: ptr as *mut u8, size })
    }

    #[inline]
    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr
    }

    #[inline]
    pub fn size(&self) -> usize {
        self.size
    }

    pub fn detach(self) {
        unsafe {
            libc::shmdt(self.ptr as *const libc::c_void);
        }
    }

    /// Detaches and marks the segment for removal (gone once every
    /// attached process detaches).
    pub fn destroy(self) -> io::Result<()> {
        debug!(size = self.size, "destroying shared memory segment");
        let rc = unsafe { libc::shmctl(self.id, libc::IPC_RMID, std::ptr::null_mut()) };
        unsafe {
            libc::shmdt(self.ptr as *const libc::c_void);
        }
        if rc == -1 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    /// Removes a segment by key without needing a prior mapping.
    pub fn destroy_by_key(key: i32, size: usize) -> io::Result<()> {
        let id = unsafe { libc::shmget(key as libc::key_t, size, libc::IPC_CREAT | IPC_MODE) };
        if id == -1 {
            return Err(io::Error::last_os_error());
        }
        let rc = unsafe { libc::shmctl(id, libc::IPC_RMID, std::ptr::null_mut()) };
        if rc == -1 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Keys namespaced by pid so parallel test runs don't collide.
    fn test_key(tag: i32) -> i32 {
        0x5E00_0000 | ((std::process::id() as i32 & 0xFFF) << 8) | tag
    }

    #[test]
    fn first_creator_initializes() {
        let key = test_key(1);
        let sem = Semaphore::create(key, 3).unwrap();
        assert_eq!(sem.value().unwrap(), 3);
        // Second open must not re-initialize.
        let again = Semaphore::create(key, 7).unwrap();
        assert_eq!(again.value().unwrap(), 3);
        sem.destroy().unwrap();
    }

    #[test]
    fn acquire_release() {
        let sem = Semaphore::create(test_key(2), 1).unwrap();
        sem.acquire().unwrap();
        assert_eq!(sem.value().unwrap(), 0);
        assert!(!sem.try_acquire().unwrap());
        sem.release().unwrap();
        assert!(sem.try_acquire().unwrap());
        sem.release().unwrap();
        sem.destroy().unwrap();
    }

    #[test]
    fn vanish_probe_tracks_undo() {
        let sem = Semaphore::create(test_key(3), 0).unwrap();
        // Never raised: reads as vanished.
        assert!(sem.owner_vanished().unwrap());
        sem.raise_undo().unwrap();
        assert!(!sem.owner_vanished().unwrap());
        sem.lower_undo().unwrap();
        assert!(sem.owner_vanished().unwrap());
        sem.destroy().unwrap();
    }

    #[test]
    fn segment_roundtrip() {
        let key = test_key(4);
        let seg = ShmSegment::map(key, 4096).unwrap();
        unsafe {
            seg.as_ptr().write_bytes(0, 64);
            *seg.as_ptr() = 0xAB;
        }
        // A second mapping of the same key sees the write.
        let other = ShmSegment::map(key, 4096).unwrap();
        assert_eq!(unsafe { *other.as_ptr() }, 0xAB);
        other.detach();
        seg.destroy().unwrap();
    }
}
