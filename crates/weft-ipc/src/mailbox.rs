use crate::{
    error::BusError,
    sysv::{Semaphore, ShmSegment},
};

/// Fixed width of the null-padded process-name field.
pub const PROC_NAME_SIZE: usize = 64;

/// Mailbox header preceding the payload in every slot.
pub const HEADER_SIZE: usize = size_of::<MsgHeader>();

/// Fixed 64-byte null-padded ASCII name, the registry's primary key.
///
/// Same-host, same-ABI by construction, like the rest of the slot layout.
#[derive(Clone, Copy, PartialEq, Eq)]
#[repr(C)]
pub struct ProcName {
    raw: [u8; PROC_NAME_SIZE],
}

impl ProcName {
    pub const EMPTY: Self = Self { raw: [0; PROC_NAME_SIZE] };

    /// Validates 1..=64 bytes of NUL-free ASCII.
    pub fn new(name: &str) -> Result<Self, BusError> {
        if name.is_empty() {
            return Err(BusError::InvalidArgument("process name is empty"));
        }
        if name.len() > PROC_NAME_SIZE {
            return Err(BusError::InvalidArgument("process name exceeds 64 bytes"));
        }
        if !name.is_ascii() || name.bytes().any(|b| b == 0) {
            return Err(BusError::MalformedUtf8);
        }
        let mut raw = [0u8; PROC_NAME_SIZE];
        raw[..name.len()].copy_from_slice(name.as_bytes());
        Ok(Self { raw })
    }

    pub fn from_raw(raw: [u8; PROC_NAME_SIZE]) -> Self {
        Self { raw }
    }

    /// An all-zero name field marks an empty slot.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.raw[0] == 0
    }

    /// The name up to the padding. Garbage from a corrupt region reads as
    /// empty rather than panicking.
    pub fn as_str(&self) -> &str {
        let end = self.raw.iter().position(|&b| b == 0).unwrap_or(PROC_NAME_SIZE);
        std::str::from_utf8(&self.raw[..end]).unwrap_or("")
    }
}

impl std::fmt::Debug for ProcName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "\"{}\"", self.as_str())
    }
}

impl std::fmt::Display for ProcName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// On-slot message header: sender, type, payload length. Native byte
/// order; the bus never crosses hosts.
#[derive(Clone, Copy, Debug)]
#[repr(C)]
pub struct MsgHeader {
    pub sender: ProcName,
    pub msg_type: i32,
    pub msg_len: i32,
}

/// One registration slot in the control region.
#[derive(Clone, Copy, Debug)]
#[repr(C)]
pub struct ProcEntry {
    pub key_shm: i32,
    pub key_rlock: i32,
    pub key_wlock: i32,
    pub key_alive: i32,
    pub slot_size: i64,
    pub active: i32,
    pub _pad: i32,
    pub send_count: i64,
    pub recv_count: i64,
    pub name: ProcName,
}

impl ProcEntry {
    pub const ZERO: Self = Self {
        key_shm: 0,
        key_rlock: 0,
        key_wlock: 0,
        key_alive: 0,
        slot_size: 0,
        active: 0,
        _pad: 0,
        send_count: 0,
        recv_count: 0,
        name: ProcName::EMPTY,
    };

    /// A registered entry has all four keys and a name.
    pub fn is_valid(&self) -> bool {
        self.key_shm != 0 &&
            self.key_rlock != 0 &&
            self.key_wlock != 0 &&
            self.key_alive != 0 &&
            !self.name.is_empty()
    }
}

/// The four keys of slot `index`, derived from the control semaphore key.
#[derive(Clone, Copy, Debug)]
pub struct SlotKeys {
    pub shm: i32,
    pub rlock: i32,
    pub wlock: i32,
    pub alive: i32,
}

pub fn slot_keys(sem_ctrl_key: i32, index: usize) -> SlotKeys {
    let base = sem_ctrl_key + (index as i32) * 4;
    SlotKeys { shm: base + 1, rlock: base + 2, wlock: base + 3, alive: base + 4 }
}

/// Local handle on one mailbox slot: the mapped segment plus the three
/// semaphores guarding it. Copyable; the underlying kernel objects are
/// shared and destroyed only through reclamation.
#[derive(Clone, Copy)]
pub struct Mailbox {
    pub shm: ShmSegment,
    pub rlock: Semaphore,
    pub wlock: Semaphore,
    pub alive: Semaphore,
}

impl Mailbox {
    /// Payload capacity of this slot.
    pub fn max_payload(&self) -> usize {
        self.shm.size().saturating_sub(HEADER_SIZE)
    }

    /// Raw slot write: header then payload. Callers hold the write
    /// semaphore; `payload.len()` must fit (checked upstream before any
    /// semaphore is touched).
    pub fn write(&self, hdr: &MsgHeader, payload: &[u8]) {
        unsafe {
            std::ptr::copy_nonoverlapping(
                (hdr as *const MsgHeader).cast::<u8>(),
                self.shm.as_ptr(),
                HEADER_SIZE,
            );
            if !payload.is_empty() {
                std::ptr::copy_nonoverlapping(
                    payload.as_ptr(),
                    self.shm.as_ptr().add(HEADER_SIZE),
                    payload.len(),
                );
            }
        }
    }

    /// Copies the slot out and zeroes it. `None` when the sender field is
    /// empty (vacant slot). Callers hold the read semaphore.
    pub fn take(&self) -> Option<(MsgHeader, Vec<u8>)> {
        let hdr = unsafe { std::ptr::read(self.shm.as_ptr().cast::<MsgHeader>()) };
        if hdr.sender.is_empty() {
            return None;
        }
        let len = (hdr.msg_len.max(0) as usize).min(self.max_payload());
        let mut payload = vec![0u8; len];
        unsafe {
            if len > 0 {
                std::ptr::copy_nonoverlapping(
                    self.shm.as_ptr().add(HEADER_SIZE),
                    payload.as_mut_ptr(),
                    len,
                );
            }
            self.shm.as_ptr().write_bytes(0, HEADER_SIZE + len);
        }
        Some((hdr, payload))
    }

    /// Zeroes the slot without reading it.
    pub fn clear(&self) {
        unsafe {
            self.shm.as_ptr().write_bytes(0, self.shm.size());
        }
    }
}
