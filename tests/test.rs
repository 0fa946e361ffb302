use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use axerrno::{AxError, AxResult};
use evrmux::{
    AllocMode, DeviceRegistry, EventSet, EventSink, HolderId, HwSupport, ManagerConfig,
    ManagerDev, ResourceDef, SubscribeAction, QUEUE_CAPACITY,
};

const EVENT_HEARTBEAT: u16 = 0x102;

/// Per-unit pulse generator capabilities: counter widths in bits for
/// prescaler, delay, and width.
const PULSEGEN_CAPS: [(i32, i32, i32); 6] = [
    (16, 16, 16),
    (16, 16, 16),
    (32, 32, 32),
    (32, 32, 32),
    (0, 0, 0),
    (0, 0, 0),
];

/// An undersized counter is unusable; otherwise the tighter the fit the
/// higher the score (exact match scores highest).
fn property_suitability(tested: i32, wanted: i32) -> u32 {
    if tested < wanted {
        return 0;
    }
    (32 + wanted - tested + 1) as u32
}

/// Simulated event receiver: records every backend call and lets tests
/// stage interrupt conditions for `isr` to decode.
struct SimEvr {
    /// Staged (code, payload, notify_only) events the next isr reports.
    pending: Mutex<Vec<(u16, Vec<u8>, bool)>>,
    subscriptions: Mutex<EventSet>,
    init_res_log: Mutex<Vec<(usize, usize)>>,
    revoked: Mutex<Vec<HolderId>>,
    end_calls: AtomicUsize,
}

impl SimEvr {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            pending: Mutex::new(Vec::new()),
            subscriptions: Mutex::new(EventSet::new()),
            init_res_log: Mutex::new(Vec::new()),
            revoked: Mutex::new(Vec::new()),
            end_calls: AtomicUsize::new(0),
        })
    }

    fn stage_irq(&self, code: u16, payload: &[u8], notify_only: bool) {
        self.pending
            .lock()
            .unwrap()
            .push((code, payload.to_vec(), notify_only));
    }
}

struct SimBinding(Arc<SimEvr>);

impl HwSupport for SimBinding {
    fn name(&self) -> &str {
        "evr-sim"
    }

    fn init(&self) -> AxResult {
        Ok(())
    }

    fn end(&self) {
        self.0.end_calls.fetch_add(1, Ordering::SeqCst);
    }

    fn res_defs(&self) -> Vec<ResourceDef> {
        vec![
            ResourceDef {
                name: "pulsegen",
                count: PULSEGEN_CAPS.len() as u32,
                exclusive: true,
                suits: Box::new(|index, filters| {
                    let (prescaler, delay, width) = PULSEGEN_CAPS[index];
                    let wanted = |i: usize| filters.get(i).copied().unwrap_or(0);
                    let mut total = 0;
                    for (tested, wanted) in
                        [(prescaler, wanted(0)), (delay, wanted(1)), (width, wanted(2))]
                    {
                        let score = property_suitability(tested, wanted);
                        if score == 0 {
                            return 0; // every property must fit
                        }
                        total += score;
                    }
                    total
                }),
            },
            ResourceDef {
                name: "output",
                count: 4,
                exclusive: true,
                // outputs must be allocated by fixed index
                suits: Box::new(|_, _| 0),
            },
        ]
    }

    fn on_subscribe_change(&self, subscriptions: &EventSet) -> AxResult {
        *self.0.subscriptions.lock().unwrap() = subscriptions.clone();
        Ok(())
    }

    fn init_res(&self, res_type: usize, index: usize) -> AxResult {
        self.0.init_res_log.lock().unwrap().push((res_type, index));
        Ok(())
    }

    fn isr(&self, sink: &EventSink<'_>) -> bool {
        let mut pending = self.0.pending.lock().unwrap();
        if pending.is_empty() {
            return false;
        }
        for (code, payload, notify_only) in pending.drain(..) {
            if notify_only {
                sink.notify(code);
            } else {
                sink.put_event(code, &payload);
            }
        }
        true
    }

    fn revoke_holder(&self, holder: HolderId) {
        self.0.revoked.lock().unwrap().push(holder);
    }
}

fn sim_manager(name: &str) -> (ManagerDev, Arc<SimEvr>) {
    let sim = SimEvr::new();
    let mng = ManagerDev::create(
        ManagerConfig::new(name, 0x8000).unwrap(),
        Box::new(SimBinding(sim.clone())),
    )
    .unwrap();
    (mng, sim)
}

#[test]
fn test_subscribe_dispatch_read_end_to_end() {
    let (mng, sim) = sim_manager("evr-sim0");

    let id = mng.create_vdev(None, "A").unwrap();
    assert_eq!(id, 1);

    // pool allocation with no requirements takes the least capable unit,
    // keeping the wide counters for requests that need them
    let desc = mng
        .alloc_resource(id, "pulsegen", AllocMode::Pool, &[0, 0, 0])
        .unwrap();
    assert_eq!((desc.res_type, desc.index), (0, 4));

    let dev = mng.open_vdev(id).unwrap();
    dev.subscribe(5, SubscribeAction::Subscribe).unwrap();
    assert!(sim.subscriptions.lock().unwrap().test(5));

    sim.stage_irq(5, &[1, 2, 3, 4], false);
    assert!(mng.isr());

    let records = dev.read(256).unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].code(), 5);
    assert_eq!(records[0].payload(), &[1, 2, 3, 4]);
    assert_eq!(mng.event_count(5), 1);
}

#[test]
fn test_notify_only_events_drain_first() {
    let (mng, _sim) = sim_manager("evr-sim1");
    let dev = mng
        .open_vdev(mng.create_vdev(None, "A").unwrap())
        .unwrap();
    dev.subscribe(5, SubscribeAction::Subscribe).unwrap();
    dev.subscribe(EVENT_HEARTBEAT, SubscribeAction::Subscribe)
        .unwrap();

    mng.put_event(5, b"data");
    mng.notify(EVENT_HEARTBEAT);

    let records = dev.read(256).unwrap();
    assert_eq!(records.len(), 2);
    assert_eq!(records[0].code(), EVENT_HEARTBEAT);
    assert_eq!(records[0].payload(), b"");
    assert_eq!(records[1].code(), 5);
    assert_eq!(records[1].payload(), b"data");
}

#[test]
fn test_blocked_read_wakes_on_event() {
    let (mng, _sim) = sim_manager("evr-sim2");
    let dev = Arc::new(
        mng.open_vdev(mng.create_vdev(None, "A").unwrap())
            .unwrap(),
    );
    dev.subscribe(EVENT_HEARTBEAT, SubscribeAction::Subscribe)
        .unwrap();

    let reader = {
        let dev = dev.clone();
        thread::spawn(move || dev.read(64))
    };
    thread::sleep(Duration::from_millis(50));

    mng.put_event(EVENT_HEARTBEAT, b"hb");
    let records = reader.join().unwrap().unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].code(), EVENT_HEARTBEAT);
}

#[test]
fn test_events_arrive_in_order_across_threads() {
    let (mng, _sim) = sim_manager("evr-sim3");
    let dev = Arc::new(
        mng.open_vdev(mng.create_vdev(None, "A").unwrap())
            .unwrap(),
    );
    dev.subscribe(3, SubscribeAction::Subscribe).unwrap();

    const COUNT: u16 = 500;
    let producer = {
        let mng = mng.clone();
        thread::spawn(move || {
            for seq in 0..COUNT {
                mng.put_event(3, &seq.to_le_bytes());
            }
        })
    };

    let mut expected: u16 = 0;
    while expected < COUNT {
        for record in dev.read(4096).unwrap() {
            assert_eq!(record.code(), 3);
            assert_eq!(record.payload(), &expected.to_le_bytes()[..]);
            expected += 1;
        }
    }
    producer.join().unwrap();
}

#[test]
fn test_queue_overflow_surfaces_one_sentinel() {
    let (mng, _sim) = sim_manager("evr-sim4");
    let dev = mng
        .open_vdev(mng.create_vdev(None, "A").unwrap())
        .unwrap();
    dev.set_nonblocking(true);
    dev.subscribe(7, SubscribeAction::Subscribe).unwrap();

    for _ in 0..QUEUE_CAPACITY + 10 {
        mng.put_event(7, b"x");
    }

    let mut total = 0;
    let mut overflows = 0;
    let mut last_was_overflow = false;
    loop {
        match dev.read(16 * 1024) {
            Ok(records) => {
                for record in records {
                    total += 1;
                    last_was_overflow = record.is_overflow();
                    if last_was_overflow {
                        overflows += 1;
                    }
                }
            }
            Err(AxError::WouldBlock) => break,
            Err(e) => panic!("unexpected read error {e:?}"),
        }
    }

    // capacity-2 regular records, then exactly one overflow marker, in
    // FIFO position at the end
    assert_eq!(total, QUEUE_CAPACITY - 1);
    assert_eq!(overflows, 1);
    assert!(last_was_overflow);
}

#[test]
fn test_close_cancels_blocked_read() {
    let (mng, _sim) = sim_manager("evr-sim5");
    let dev = Arc::new(
        mng.open_vdev(mng.create_vdev(None, "A").unwrap())
            .unwrap(),
    );

    let reader = {
        let dev = dev.clone();
        thread::spawn(move || dev.read(64))
    };
    thread::sleep(Duration::from_millis(50));

    dev.close();
    assert_eq!(reader.join().unwrap(), Err(AxError::NotFound));
}

#[test]
fn test_hot_unplug_cancels_blocked_read_without_use_after_free() {
    let (mng, sim) = sim_manager("evr-sim6");
    let id = mng.create_vdev(None, "A").unwrap();
    let dev = Arc::new(mng.open_vdev(id).unwrap());

    let reader = {
        let dev = dev.clone();
        thread::spawn(move || dev.read(64))
    };
    thread::sleep(Duration::from_millis(50));

    mng.destroy();
    assert_eq!(reader.join().unwrap(), Err(AxError::NotFound));

    // the open handle's mappings were revoked, but it still holds a
    // reference: the binding must not be freed yet
    assert_eq!(sim.revoked.lock().unwrap().len(), 1);
    assert_eq!(sim.end_calls.load(Ordering::SeqCst), 0);

    // every operation on the dead device fails softly
    assert_eq!(dev.poll(), Err(AxError::NotFound));
    assert!(dev.status().is_err());
    assert!(dev.subscribe(5, SubscribeAction::Subscribe).is_err());
    assert!(mng.create_vdev(None, "B").is_err());

    // the last close performs the deferred teardown, exactly once
    // (the reader thread already dropped its handle clone when it was joined above)
    drop(dev);
    assert_eq!(sim.end_calls.load(Ordering::SeqCst), 1);
}

#[test]
fn test_last_close_resets_hardware_state() {
    let (mng, sim) = sim_manager("evr-sim7");
    let id = mng.create_vdev(None, "A").unwrap();
    mng.alloc_resource(id, "pulsegen", AllocMode::Pool, &[16, 16, 16])
        .unwrap();
    mng.alloc_resource(id, "output", AllocMode::Fixed(2), &[])
        .unwrap();

    {
        let first = mng.open_vdev(id).unwrap();
        let second = mng.open_vdev(id).unwrap();
        assert_eq!(first.status().unwrap().open_count, 2);
        drop(first);
        // not the last close: nothing reset yet
        assert!(sim.init_res_log.lock().unwrap().is_empty());
        drop(second);
    }

    let log = sim.init_res_log.lock().unwrap().clone();
    assert_eq!(log, vec![(0, 0), (1, 2)]);
}

#[test]
fn test_resource_arbitration_between_children() {
    let (mng, _sim) = sim_manager("evr-sim8");
    let a = mng.create_vdev(None, "A").unwrap();
    let b = mng.create_vdev(None, "B").unwrap();

    mng.alloc_resource(a, "output", AllocMode::Fixed(1), &[])
        .unwrap();
    // same owner again: already in use
    assert_eq!(
        mng.alloc_resource(a, "output", AllocMode::Fixed(1), &[]),
        Err(AxError::AddrInUse)
    );
    // outputs never pool-allocate
    assert_eq!(
        mng.alloc_resource(b, "output", AllocMode::Pool, &[]),
        Err(AxError::PermissionDenied)
    );

    // exact-match pool requests drain the 16-bit units first
    let first = mng
        .alloc_resource(a, "pulsegen", AllocMode::Pool, &[16, 16, 16])
        .unwrap();
    let second = mng
        .alloc_resource(b, "pulsegen", AllocMode::Pool, &[16, 16, 16])
        .unwrap();
    assert_eq!(first.index, 0);
    assert_eq!(second.index, 1);
    // the 0-bit units can never satisfy a 16-bit request
    let third = mng
        .alloc_resource(b, "pulsegen", AllocMode::Pool, &[16, 16, 16])
        .unwrap();
    assert_eq!(third.index, 2);

    let dev_a = mng.open_vdev(a).unwrap();
    assert_eq!(dev_a.res_status(0).unwrap(), 1); // one pulsegen
    assert_eq!(dev_a.res_status(1).unwrap(), 1); // one output
    drop(dev_a);

    // destroying a child releases everything it owned
    mng.destroy_vdev(a).unwrap();
    mng.alloc_resource(b, "output", AllocMode::Fixed(1), &[])
        .unwrap();
}

#[test]
fn test_registry_lifecycle() {
    let registry = DeviceRegistry::new();
    let (mng0, sim0) = sim_manager("evr-reg0");
    let (mng1, sim1) = sim_manager("evr-reg1");
    registry.register(0, mng0).unwrap();
    registry.register(1, mng1).unwrap();

    let found = registry.get(1).unwrap();
    found.create_vdev(None, "A").unwrap();

    registry.remove(0).unwrap();
    assert_eq!(sim0.end_calls.load(Ordering::SeqCst), 1);
    assert_eq!(sim1.end_calls.load(Ordering::SeqCst), 0);

    registry.fini();
    assert!(registry.is_empty());
    assert_eq!(sim1.end_calls.load(Ordering::SeqCst), 1);
}
