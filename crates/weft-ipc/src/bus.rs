use std::{
    panic::{AssertUnwindSafe, catch_unwind},
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    thread::JoinHandle,
    time::Duration,
};

use once_cell::sync::Lazy;
use tracing::{error, info, warn};
use weft_utils::spawn_worker;

use crate::{
    error::BusError,
    mailbox::{HEADER_SIZE, Mailbox, MsgHeader, ProcEntry, ProcName, slot_keys},
    queue::{BoundedQueue, PutOutcome, QueuePolicy},
    sysv::{Semaphore, ShmSegment},
};

pub const DEFAULT_PROC_COUNT: usize = 10;
pub const DEFAULT_SHM_KEY: i32 = 0x00F2_16C5;
pub const DEFAULT_SLOT_SIZE: usize = 10 * 1024 * 1024;
pub const DEFAULT_QUEUE_CAPACITY: usize = 1024;

const DEFAULT_FREQ_US: u64 = 16_000;

#[derive(Clone, Debug)]
pub struct BusConfig {
    /// Registry key, 1-64 bytes of ASCII.
    pub proc_name: String,
    /// Registry capacity; fixed at control-region creation.
    pub proc_count: usize,
    /// Well-known key of the control region. The control semaphore lives
    /// at `shm_key + 1` and slot keys are derived from there.
    pub shm_key: i32,
    /// Mailbox bytes per process, header included.
    pub slot_size: usize,
    /// Capacity of the receive and async-send queues.
    pub queue_capacity: usize,
}

impl BusConfig {
    pub fn new(proc_name: impl Into<String>) -> Self {
        Self {
            proc_name: proc_name.into(),
            proc_count: DEFAULT_PROC_COUNT,
            shm_key: DEFAULT_SHM_KEY,
            slot_size: DEFAULT_SLOT_SIZE,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
        }
    }

    pub fn validate(&self) -> Result<ProcName, BusError> {
        let name = ProcName::new(&self.proc_name)?;
        if self.proc_count < 2 {
            return Err(BusError::InvalidArgument("process count must be >= 2"));
        }
        if self.shm_key < 0 {
            return Err(BusError::InvalidArgument("shared memory key must be >= 0"));
        }
        if self.slot_size <= HEADER_SIZE {
            return Err(BusError::InvalidArgument("slot size must exceed the header"));
        }
        if self.queue_capacity == 0 {
            return Err(BusError::InvalidArgument("queue capacity must be > 0"));
        }
        Ok(name)
    }
}

/// Registry introspection, one row per registered process.
#[derive(Clone, Debug)]
pub struct PeerInfo {
    pub name: String,
    pub slot_size: usize,
    pub send_count: i64,
    pub recv_count: i64,
}

type OnMsg = Box<dyn FnMut(&str, i32, &[u8]) + Send>;

struct OwnedMsg {
    hdr: MsgHeader,
    payload: Vec<u8>,
}

struct OutMsg {
    to: ProcName,
    msg_type: i32,
    payload: Vec<u8>,
}

enum LocalSlot {
    Vacant,
    Occupied { name: ProcName, mbox: Mailbox },
}

/// The mapped array of registration entries. Entries are written by
/// foreign processes, so access goes through volatile copies.
struct ControlRegion {
    seg: ShmSegment,
    count: usize,
}

impl ControlRegion {
    fn entry_ptr(&self, idx: usize) -> *mut ProcEntry {
        debug_assert!(idx < self.count);
        unsafe { self.seg.as_ptr().cast::<ProcEntry>().add(idx) }
    }

    fn read(&self, idx: usize) -> ProcEntry {
        unsafe { std::ptr::read_volatile(self.entry_ptr(idx)) }
    }

    fn write(&self, idx: usize, entry: &ProcEntry) {
        unsafe { std::ptr::write_volatile(self.entry_ptr(idx), *entry) }
    }
}

// One live bus per process; re-init without teardown is an error.
static BUS_ACTIVE: Lazy<Mutex<bool>> = Lazy::new(|| Mutex::new(false));

struct BusShared {
    my_name: ProcName,
    my_index: usize,
    ctrl_sem: Semaphore,
    ctrl: ControlRegion,
    my_box: Mailbox,
    local: Mutex<Vec<LocalSlot>>,
    recv_queue: BoundedQueue<OwnedMsg>,
    send_queue: BoundedQueue<OutMsg>,
    freq_us: AtomicU64,
    stopping: AtomicBool,
}

impl BusShared {
    fn sleep_interval(&self) {
        std::thread::sleep(Duration::from_micros(self.freq_us.load(Ordering::Relaxed)));
    }

    /// Finds `name` in the registry, reconciling the local view with the
    /// control region and garbage-collecting dead peers on the way.
    fn lookup(&self, name: &ProcName) -> Result<(usize, Mailbox), BusError> {
        let mut local = self.local.lock().unwrap();
        for idx in 0..self.ctrl.count {
            let entry = self.ctrl.read(idx);
            if entry.active == 0 || !entry.is_valid() {
                local[idx] = LocalSlot::Vacant;
                continue;
            }
            if idx != self.my_index {
                let alive = Semaphore::create(entry.key_alive, 0)?;
                if alive.owner_vanished()? {
                    self.ctrl_sem.acquire()?;
                    // Re-check under the lock; another process may have
                    // reclaimed (or reused) the slot meanwhile.
                    let fresh = self.ctrl.read(idx);
                    if fresh.is_valid() {
                        match Semaphore::create(fresh.key_alive, 0) {
                            Ok(alive) if alive.owner_vanished().unwrap_or(false) => {
                                reclaim_slot(&self.ctrl, idx, &fresh, &mut local);
                            }
                            _ => {}
                        }
                    }
                    self.ctrl_sem.release()?;
                    continue;
                }
            }
            if entry.name != *name {
                continue;
            }
            let cached = match &local[idx] {
                LocalSlot::Occupied { name: cached, mbox } if *cached == entry.name => {
                    Some(*mbox)
                }
                _ => None,
            };
            let mbox = match cached {
                Some(mbox) => mbox,
                None => {
                    let mbox = open_mailbox(&entry)?;
                    local[idx] = LocalSlot::Occupied { name: entry.name, mbox };
                    mbox
                }
            };
            return Ok((idx, mbox));
        }
        Err(BusError::NoSuchProcess(name.as_str().to_owned()))
    }

    /// The synchronous delivery path: oversize check before any semaphore,
    /// then P(write), slot write, V(read).
    fn send_sync(&self, to: &ProcName, msg_type: i32, payload: &[u8]) -> Result<(), BusError> {
        let (_, mbox) = self.lookup(to)?;
        let max = mbox.max_payload();
        if payload.len() > max {
            return Err(BusError::OversizePayload { len: payload.len(), max });
        }
        mbox.wlock.acquire()?;
        let hdr =
            MsgHeader { sender: self.my_name, msg_type, msg_len: payload.len() as i32 };
        mbox.write(&hdr, payload);
        self.bump_send_count();
        mbox.rlock.release()?;
        Ok(())
    }

    fn bump_send_count(&self) {
        unsafe {
            let p = self.ctrl.entry_ptr(self.my_index);
            (*p).send_count = (*p).send_count.wrapping_add(1);
        }
    }

    fn bump_recv_count(&self) {
        unsafe {
            let p = self.ctrl.entry_ptr(self.my_index);
            (*p).recv_count = (*p).recv_count.wrapping_add(1);
        }
    }
}

fn open_mailbox(entry: &ProcEntry) -> Result<Mailbox, BusError> {
    let shm = ShmSegment::map(entry.key_shm, entry.slot_size as usize)?;
    let rlock = Semaphore::create(entry.key_rlock, 0)?;
    let wlock = Semaphore::create(entry.key_wlock, 0)?;
    let alive = Semaphore::create(entry.key_alive, 0)?;
    Ok(Mailbox { shm, rlock, wlock, alive })
}

/// Destroys a dead slot's kernel objects and zeroes its entry. Caller
/// holds the control semaphore.
fn reclaim_slot(ctrl: &ControlRegion, idx: usize, entry: &ProcEntry, local: &mut [LocalSlot]) {
    warn!(name = %entry.name, idx, "reclaiming slot of dead process");
    if entry.key_shm != 0 {
        let _ = ShmSegment::destroy_by_key(entry.key_shm, entry.slot_size.max(1) as usize);
    }
    for key in [entry.key_rlock, entry.key_wlock, entry.key_alive] {
        if key != 0 {
            if let Ok(sem) = Semaphore::create(key, 0) {
                let _ = sem.destroy();
            }
        }
    }
    ctrl.write(idx, &ProcEntry::ZERO);
    local[idx] = LocalSlot::Vacant;
}

/// One scan step during initialization (control semaphore held): map an
/// alive peer into the local view, reclaim a dead one.
fn scan_slot(ctrl: &ControlRegion, idx: usize, local: &mut [LocalSlot]) -> Result<(), BusError> {
    let entry = ctrl.read(idx);
    if entry.active == 0 || !entry.is_valid() {
        local[idx] = LocalSlot::Vacant;
        return Ok(());
    }
    let alive = Semaphore::create(entry.key_alive, 0)?;
    if alive.owner_vanished()? {
        reclaim_slot(ctrl, idx, &entry, local);
        return Ok(());
    }
    match open_mailbox(&entry) {
        Ok(mbox) => local[idx] = LocalSlot::Occupied { name: entry.name, mbox },
        Err(err) => {
            warn!(?err, idx, "couldn't map active slot, reclaiming");
            reclaim_slot(ctrl, idx, &entry, local);
        }
    }
    Ok(())
}

fn receive_loop(shared: &BusShared) {
    loop {
        shared.sleep_interval();
        if shared.stopping.load(Ordering::Acquire) {
            break;
        }
        if let Err(err) = shared.my_box.rlock.acquire() {
            error!(?err, "receive worker: read semaphore");
            break;
        }
        if shared.stopping.load(Ordering::Acquire) {
            break;
        }
        match shared.my_box.take() {
            // Vacant slot (spurious wake); hand the write token back.
            None => {
                let _ = shared.my_box.wlock.release();
            }
            Some((hdr, payload)) => {
                shared.bump_recv_count();
                let _ = shared.my_box.wlock.release();
                if let PutOutcome::Dropped(old) = shared.recv_queue.put(OwnedMsg { hdr, payload })
                {
                    warn!(
                        msg_type = old.hdr.msg_type,
                        sender = %old.hdr.sender,
                        "receive queue full, dropping oldest message"
                    );
                }
            }
        }
    }
}

fn dispatch_loop(shared: &BusShared, mut on_msg: OnMsg) {
    while let Some(msg) = shared.recv_queue.get() {
        let sender = msg.hdr.sender;
        let result = catch_unwind(AssertUnwindSafe(|| {
            on_msg(sender.as_str(), msg.hdr.msg_type, &msg.payload);
        }));
        if result.is_err() {
            error!(sender = %sender, msg_type = msg.hdr.msg_type, "message callback panicked");
        }
    }
}

fn send_loop(shared: &BusShared) {
    while let Some(msg) = shared.send_queue.get() {
        if shared.stopping.load(Ordering::Acquire) {
            break;
        }
        if let Err(err) = shared.send_sync(&msg.to, msg.msg_type, &msg.payload) {
            warn!(?err, to = %msg.to, "async send failed");
        }
    }
}

/// The process's handle on the shared-memory bus.
///
/// `init` registers this process in the control region, claims a mailbox
/// slot and starts the receive/dispatch/send workers; dropping the bus
/// deregisters gracefully. A crashed process is deregistered by whoever
/// scans the registry next, via the liveness semaphore it can no longer
/// hold.
pub struct Bus {
    shared: Arc<BusShared>,
    workers: Vec<JoinHandle<()>>,
}

impl Bus {
    /// Registers `cfg.proc_name` and starts the workers. `on_msg` runs on
    /// the dispatch worker for every inbound message; panics in it are
    /// contained and logged.
    pub fn init<F>(cfg: BusConfig, on_msg: F) -> Result<Self, BusError>
    where
        F: FnMut(&str, i32, &[u8]) + Send + 'static,
    {
        let my_name = cfg.validate()?;
        {
            let mut active = BUS_ACTIVE.lock().unwrap();
            if *active {
                return Err(BusError::AlreadyInitialized);
            }
            *active = true;
        }
        match Self::init_inner(&cfg, my_name, Box::new(on_msg)) {
            Ok(bus) => Ok(bus),
            Err(err) => {
                *BUS_ACTIVE.lock().unwrap() = false;
                Err(err)
            }
        }
    }

    fn init_inner(cfg: &BusConfig, my_name: ProcName, on_msg: OnMsg) -> Result<Self, BusError> {
        let sem_ctrl_key = cfg.shm_key + 1;
        let ctrl_sem = Semaphore::create(sem_ctrl_key, 1)?;
        ctrl_sem.acquire()?;
        let registered = register(cfg, sem_ctrl_key, my_name);
        let release = ctrl_sem.release();
        let (ctrl, my_box, local, my_index) = registered?;
        release?;

        let shared = Arc::new(BusShared {
            my_name,
            my_index,
            ctrl_sem,
            ctrl,
            my_box,
            local: Mutex::new(local),
            recv_queue: BoundedQueue::new(cfg.queue_capacity, QueuePolicy::Looping)
                .map_err(|_| BusError::InvalidArgument("queue capacity must be > 0"))?,
            send_queue: BoundedQueue::new(cfg.queue_capacity, QueuePolicy::Looping)
                .map_err(|_| BusError::InvalidArgument("queue capacity must be > 0"))?,
            freq_us: AtomicU64::new(DEFAULT_FREQ_US),
            stopping: AtomicBool::new(false),
        });

        let recv = {
            let shared = shared.clone();
            spawn_worker("bus-recv", move || receive_loop(&shared))
        };
        let dispatch = {
            let shared = shared.clone();
            spawn_worker("bus-dispatch", move || dispatch_loop(&shared, on_msg))
        };
        let send = {
            let shared = shared.clone();
            spawn_worker("bus-send", move || send_loop(&shared))
        };

        info!(name = %my_name, index = my_index, "bus registered");
        Ok(Self { shared, workers: vec![recv, dispatch, send] })
    }

    #[inline]
    pub fn name(&self) -> &str {
        self.shared.my_name.as_str()
    }

    /// Synchronous delivery: blocks while the recipient's slot is full,
    /// returns once the message is in it. Fails fast with
    /// [`BusError::NoSuchProcess`] or [`BusError::OversizePayload`]
    /// without touching the slot.
    pub fn send(&self, to: &str, msg_type: i32, payload: &[u8]) -> Result<(), BusError> {
        let to = ProcName::new(to)?;
        self.shared.send_sync(&to, msg_type, payload)
    }

    /// Queued delivery: a copy goes on the looping send queue and the send
    /// worker drains it through the synchronous path. On overflow the
    /// oldest pending message is dropped with a warning.
    pub fn send_async(&self, to: &str, msg_type: i32, payload: &[u8]) -> Result<(), BusError> {
        let to = ProcName::new(to)?;
        let out = OutMsg { to, msg_type, payload: payload.to_vec() };
        if let PutOutcome::Dropped(old) = self.shared.send_queue.put(out) {
            warn!(to = %old.to, "send queue full, dropping oldest pending message");
        }
        Ok(())
    }

    /// Receive-worker sleep interval in milliseconds; default 16, floor
    /// 0.001 (one microsecond). Bounds the worker's CPU use between slot
    /// reads.
    pub fn set_freq(&self, milliseconds: f64) -> Result<(), BusError> {
        if milliseconds < 0.001 {
            return Err(BusError::InvalidArgument("worker interval below 1 microsecond"));
        }
        self.shared.freq_us.store((milliseconds * 1000.0) as u64, Ordering::Relaxed);
        Ok(())
    }

    /// Largest payload `to` can accept.
    pub fn max_payload_to(&self, to: &str) -> Result<usize, BusError> {
        let to = ProcName::new(to)?;
        let (_, mbox) = self.shared.lookup(&to)?;
        Ok(mbox.max_payload())
    }

    /// One registered process by name.
    pub fn proc_info(&self, name: &str) -> Option<PeerInfo> {
        self.peers().into_iter().find(|p| p.name == name)
    }

    /// Registered processes, this one included.
    pub fn peers(&self) -> Vec<PeerInfo> {
        (0..self.shared.ctrl.count)
            .filter_map(|idx| {
                let entry = self.shared.ctrl.read(idx);
                (entry.active != 0 && entry.is_valid()).then(|| PeerInfo {
                    name: entry.name.as_str().to_owned(),
                    slot_size: entry.slot_size as usize,
                    send_count: entry.send_count,
                    recv_count: entry.recv_count,
                })
            })
            .collect()
    }
}

/// The registration steps done under the control semaphore: map the
/// region, scan + GC every slot, claim a free one with read=0 write=1
/// alive=0 then the UNDO raise.
#[allow(clippy::type_complexity)]
fn register(
    cfg: &BusConfig,
    sem_ctrl_key: i32,
    my_name: ProcName,
) -> Result<(ControlRegion, Mailbox, Vec<LocalSlot>, usize), BusError> {
    let seg = ShmSegment::map(cfg.shm_key, size_of::<ProcEntry>() * cfg.proc_count)
        .map_err(|_| BusError::ControlRegionInaccessible)?;
    let ctrl = ControlRegion { seg, count: cfg.proc_count };
    let mut local: Vec<LocalSlot> = (0..cfg.proc_count).map(|_| LocalSlot::Vacant).collect();
    for idx in 0..cfg.proc_count {
        scan_slot(&ctrl, idx, &mut local)?;
    }

    let free = (0..cfg.proc_count)
        .find(|&idx| matches!(local[idx], LocalSlot::Vacant))
        .ok_or(BusError::RegistryFull)?;

    let keys = slot_keys(sem_ctrl_key, free);
    let claimed = (|| -> Result<Mailbox, BusError> {
        let shm = ShmSegment::map(keys.shm, cfg.slot_size)?;
        let rlock = Semaphore::create(keys.rlock, 0)?;
        let wlock = Semaphore::create(keys.wlock, 1)?;
        let alive = Semaphore::create(keys.alive, 0)?;
        Ok(Mailbox { shm, rlock, wlock, alive })
    })();
    let my_box = match claimed {
        Ok(my_box) => my_box,
        Err(err) => {
            // Best-effort teardown of whatever the claim got to.
            let _ = ShmSegment::destroy_by_key(keys.shm, cfg.slot_size);
            for key in [keys.rlock, keys.wlock, keys.alive] {
                if let Ok(sem) = Semaphore::create(key, 0) {
                    let _ = sem.destroy();
                }
            }
            return Err(err);
        }
    };
    my_box.clear();
    my_box.alive.raise_undo()?;

    let entry = ProcEntry {
        key_shm: keys.shm,
        key_rlock: keys.rlock,
        key_wlock: keys.wlock,
        key_alive: keys.alive,
        slot_size: cfg.slot_size as i64,
        active: 1,
        _pad: 0,
        send_count: 0,
        recv_count: 0,
        name: my_name,
    };
    ctrl.write(free, &entry);
    local[free] = LocalSlot::Occupied { name: my_name, mbox: my_box };
    Ok((ctrl, my_box, local, free))
}

impl Drop for Bus {
    fn drop(&mut self) {
        let shared = &self.shared;
        shared.stopping.store(true, Ordering::Release);
        shared.recv_queue.close();
        shared.send_queue.close();
        // The receive worker may be blocked on its read semaphore; one
        // spurious release wakes it into the stopping check.
        let _ = shared.my_box.rlock.release();
        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }

        if shared.ctrl_sem.acquire().is_ok() {
            let _ = shared.my_box.alive.lower_undo();
            let _ = shared.my_box.shm.destroy();
            let _ = shared.my_box.rlock.destroy();
            let _ = shared.my_box.wlock.destroy();
            let _ = shared.my_box.alive.destroy();
            shared.ctrl.write(shared.my_index, &ProcEntry::ZERO);
            let _ = shared.ctrl_sem.release();
        }
        shared.ctrl.seg.detach();
        *BUS_ACTIVE.lock().unwrap() = false;
        info!(name = %shared.my_name, "bus deregistered");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_validation() {
        assert!(BusConfig::new("alpha").validate().is_ok());
        assert!(BusConfig::new("").validate().is_err());
        assert!(BusConfig::new("x".repeat(65)).validate().is_err());
        assert!(
            BusConfig { proc_count: 1, ..BusConfig::new("alpha") }.validate().is_err()
        );
        assert!(BusConfig { shm_key: -1, ..BusConfig::new("alpha") }.validate().is_err());
        assert!(
            BusConfig { slot_size: HEADER_SIZE, ..BusConfig::new("alpha") }
                .validate()
                .is_err()
        );
        assert!(
            BusConfig { queue_capacity: 0, ..BusConfig::new("alpha") }.validate().is_err()
        );
    }

    #[test]
    fn defaults_mirror_the_reference() {
        let cfg = BusConfig::new("p");
        assert_eq!(cfg.proc_count, 10);
        assert_eq!(cfg.shm_key, 0x00F2_16C5);
        assert_eq!(cfg.slot_size, 10 * 1024 * 1024);
        assert_eq!(cfg.queue_capacity, 1024);
    }
}
