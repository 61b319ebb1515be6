//! Bus tests share one process, and a process can hold only one live bus,
//! so every test serializes on `SERIAL` and uses its own key range.

use std::{
    sync::{Mutex, mpsc},
    time::Duration,
};

use weft_ipc::{
    Bus, BusConfig, BusError,
    mailbox::{HEADER_SIZE, ProcEntry, ProcName, slot_keys},
    sysv::{Semaphore, ShmSegment},
};

static SERIAL: Mutex<()> = Mutex::new(());

fn lock() -> std::sync::MutexGuard<'static, ()> {
    SERIAL.lock().unwrap_or_else(|e| e.into_inner())
}

// Each test gets a disjoint 64-key range, namespaced by pid so stale
// kernel objects from older runs don't interfere.
fn test_key(tag: i32) -> i32 {
    0x4E00_0000 | ((std::process::id() as i32 & 0x7FFF) << 8) | (tag * 64)
}

fn small_cfg(name: &str, key: i32) -> BusConfig {
    BusConfig {
        shm_key: key,
        proc_count: 3,
        slot_size: 4096,
        queue_capacity: 64,
        ..BusConfig::new(name)
    }
}

#[test]
fn loopback_send_dispatches() {
    let _g = lock();
    let (tx, rx) = mpsc::channel();
    let bus = Bus::init(small_cfg("alpha", test_key(0)), move |sender, msg_type, payload| {
        tx.send((sender.to_owned(), msg_type, payload.to_vec())).unwrap();
    })
    .unwrap();
    bus.set_freq(1.0).unwrap();

    bus.send("alpha", 1, b"ping").unwrap();
    let (sender, msg_type, payload) = rx.recv_timeout(Duration::from_secs(5)).unwrap();
    assert_eq!(sender, "alpha");
    assert_eq!(msg_type, 1);
    assert_eq!(payload, b"ping");
}

#[test]
fn fifo_per_sender() {
    let _g = lock();
    let (tx, rx) = mpsc::channel();
    let bus = Bus::init(small_cfg("alpha", test_key(1)), move |_, msg_type, _| {
        tx.send(msg_type).unwrap();
    })
    .unwrap();
    bus.set_freq(0.5).unwrap();

    for i in 0..10 {
        bus.send("alpha", i, b"m").unwrap();
    }
    for want in 0..10 {
        let got = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(got, want);
    }
}

#[test]
fn async_send_arrives() {
    let _g = lock();
    let (tx, rx) = mpsc::channel();
    let bus = Bus::init(small_cfg("alpha", test_key(2)), move |_, _, payload| {
        tx.send(payload.to_vec()).unwrap();
    })
    .unwrap();
    bus.set_freq(0.5).unwrap();

    bus.send_async("alpha", 7, b"queued").unwrap();
    let payload = rx.recv_timeout(Duration::from_secs(5)).unwrap();
    assert_eq!(payload, b"queued");
}

#[test]
fn unknown_recipient_fails_fast() {
    let _g = lock();
    let bus = Bus::init(small_cfg("alpha", test_key(3)), |_, _, _| {}).unwrap();
    match bus.send("nobody", 1, b"x") {
        Err(BusError::NoSuchProcess(name)) => assert_eq!(name, "nobody"),
        other => panic!("expected NoSuchProcess, got {other:?}"),
    }
}

#[test]
fn oversize_payload_refused_before_delivery() {
    let _g = lock();
    let (tx, rx) = mpsc::channel();
    let bus = Bus::init(small_cfg("alpha", test_key(4)), move |_, _, _| {
        tx.send(()).unwrap();
    })
    .unwrap();
    bus.set_freq(1.0).unwrap();

    let max = bus.max_payload_to("alpha").unwrap();
    assert_eq!(max, 4096 - HEADER_SIZE);
    let too_big = vec![0u8; max + 1];
    match bus.send("alpha", 1, &too_big) {
        Err(BusError::OversizePayload { len, max: m }) => {
            assert_eq!(len, max + 1);
            assert_eq!(m, max);
        }
        other => panic!("expected OversizePayload, got {other:?}"),
    }
    // Nothing was written to the slot.
    assert!(rx.recv_timeout(Duration::from_millis(200)).is_err());

    // Exactly max fits.
    bus.send("alpha", 1, &vec![1u8; max]).unwrap();
    rx.recv_timeout(Duration::from_secs(5)).unwrap();
}

#[test]
fn second_init_in_process_is_refused() {
    let _g = lock();
    let bus = Bus::init(small_cfg("alpha", test_key(5)), |_, _, _| {}).unwrap();
    match Bus::init(small_cfg("beta", test_key(5)), |_, _, _| {}) {
        Err(BusError::AlreadyInitialized) => {}
        other => panic!("expected AlreadyInitialized, got {:?}", other.map(|_| ())),
    }
    drop(bus);
    // After teardown the process may register again.
    let again = Bus::init(small_cfg("alpha", test_key(5)), |_, _, _| {}).unwrap();
    assert_eq!(again.name(), "alpha");
}

#[test]
fn registry_introspection() {
    let _g = lock();
    let bus = Bus::init(small_cfg("alpha", test_key(6)), |_, _, _| {}).unwrap();
    bus.set_freq(1.0).unwrap();
    bus.send("alpha", 1, b"x").unwrap();

    let peers = bus.peers();
    assert_eq!(peers.len(), 1);
    assert_eq!(peers[0].name, "alpha");
    assert_eq!(peers[0].slot_size, 4096);
    assert!(peers[0].send_count >= 1);
}

#[test]
fn crashed_peer_is_reclaimed_on_next_init() {
    let _g = lock();
    let key = test_key(7);
    let sem_ctrl_key = key + 1;
    let proc_count = 3;

    // Forge the registration a SIGKILLed "ghost" would leave behind: a
    // fully valid entry whose liveness semaphore holds no undo increment.
    let ctrl = ShmSegment::map(key, size_of::<ProcEntry>() * proc_count).unwrap();
    let keys = slot_keys(sem_ctrl_key, 0);
    let slot = ShmSegment::map(keys.shm, 4096).unwrap();
    Semaphore::create(keys.rlock, 0).unwrap();
    Semaphore::create(keys.wlock, 1).unwrap();
    Semaphore::create(keys.alive, 0).unwrap();
    let entry = ProcEntry {
        key_shm: keys.shm,
        key_rlock: keys.rlock,
        key_wlock: keys.wlock,
        key_alive: keys.alive,
        slot_size: 4096,
        active: 1,
        _pad: 0,
        send_count: 0,
        recv_count: 0,
        name: ProcName::new("ghost").unwrap(),
    };
    unsafe { std::ptr::write(ctrl.as_ptr().cast::<ProcEntry>(), entry) };
    slot.detach();
    ctrl.detach();

    // Gamma's initialization scan must observe the dead slot and clean it.
    let bus = Bus::init(small_cfg("gamma", key), |_, _, _| {}).unwrap();
    assert!(bus.peers().iter().all(|p| p.name != "ghost"));
    match bus.send("ghost", 1, b"hello?") {
        Err(BusError::NoSuchProcess(name)) => assert_eq!(name, "ghost"),
        other => panic!("expected NoSuchProcess, got {other:?}"),
    }
}

#[test]
fn set_freq_floor() {
    let _g = lock();
    let bus = Bus::init(small_cfg("alpha", test_key(8)), |_, _, _| {}).unwrap();
    assert!(bus.set_freq(16.0).is_ok());
    assert!(bus.set_freq(0.001).is_ok());
    assert!(bus.set_freq(0.0001).is_err());
}

#[test]
fn panicking_callback_does_not_kill_dispatch() {
    let _g = lock();
    let (tx, rx) = mpsc::channel();
    let bus = Bus::init(small_cfg("alpha", test_key(9)), move |_, msg_type, _| {
        if msg_type == 0 {
            panic!("callback blew up");
        }
        tx.send(msg_type).unwrap();
    })
    .unwrap();
    bus.set_freq(0.5).unwrap();

    bus.send("alpha", 0, b"boom").unwrap();
    bus.send("alpha", 1, b"fine").unwrap();
    // The worker survives the panic and delivers the next message.
    assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), 1);
}
