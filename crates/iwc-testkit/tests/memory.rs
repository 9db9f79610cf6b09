//! Memory registration and release against the simulated secure world.

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use iwc_core::{
    FrameTable, IwConfig, IwError, MemFlags, MemHandle, PageList, PageOrigin, ReleaseCallback,
    Subsystem, TaskContext,
};
use iwc_testkit::SimSecureWorld;
use parking_lot::Mutex;

const CPUS: u32 = 2;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn start_with(config: IwConfig) -> (Arc<SimSecureWorld>, Subsystem) {
    init_tracing();
    let frames = Arc::new(FrameTable::new());
    let sim = Arc::new(SimSecureWorld::new(frames.clone()));
    let subsystem =
        Subsystem::start(config.with_cpus(CPUS), sim.clone(), frames).expect("subsystem should start");
    (sim, subsystem)
}

fn start() -> (Arc<SimSecureWorld>, Subsystem) {
    start_with(IwConfig::default())
}

/// Records every handle whose callback ran.
#[derive(Clone, Default)]
struct Released(Arc<Mutex<Vec<u32>>>);

impl Released {
    fn callback(&self) -> Option<ReleaseCallback> {
        let log = self.0.clone();
        Some(Box::new(move |handle: MemHandle| log.lock().push(handle.0)))
    }

    fn handles(&self) -> Vec<u32> {
        let mut handles = self.0.lock().clone();
        handles.sort_unstable();
        handles
    }
}

fn pages(sim: &SimSecureWorld, count: usize, origin: PageOrigin) -> PageList {
    PageList::allocate(sim.frames(), count, origin).unwrap()
}

#[test]
fn register_then_release_at_once() {
    let (sim, subsystem) = start();
    let registrar = subsystem.registrar();
    let released = Released::default();
    let task = TaskContext::user(42, 1000, 100);

    let list = pages(&sim, 3, PageOrigin::User);
    let pfns = list.pfns().to_vec();
    let handle = registrar
        .register(&task, list, true, released.callback())
        .unwrap();

    let region = sim.region(handle.0).expect("secure side knows the region");
    assert_eq!(region.pfns, pfns);
    assert_eq!(region.flags, MemFlags::WRITABLE | MemFlags::USER);
    assert_eq!(region.owner, task.credential());
    assert_eq!(registrar.flags(handle), Some(MemFlags::WRITABLE | MemFlags::USER));

    registrar.release(&task, handle).unwrap();
    assert_eq!(released.handles(), vec![handle.0]);
    assert!(sim.region(handle.0).is_none());
    assert_eq!(registrar.live_regions(), 0);
    assert!(pfns.iter().all(|pfn| sim.frames().resolve(*pfn).is_none()));

    assert_eq!(registrar.release(&task, handle), Err(IwError::NotFound));
    assert_eq!(released.handles().len(), 1);
}

#[test]
fn kernel_pages_are_not_marked_user() {
    let (sim, subsystem) = start();
    let handle = subsystem
        .registrar()
        .register(&TaskContext::kernel(), pages(&sim, 1, PageOrigin::Kernel), false, None)
        .unwrap();
    assert_eq!(sim.region(handle.0).unwrap().flags, MemFlags::empty());
    subsystem
        .registrar()
        .release(&TaskContext::kernel(), handle)
        .unwrap();
}

#[test]
fn deferred_batch_finishes_every_releaser() {
    let (sim, subsystem) = start();
    sim.defer_releases(4);
    sim.set_fetch_batch(1);
    let subsystem = Arc::new(subsystem);
    let released = Released::default();
    let task = TaskContext::kernel();

    let handles: Vec<MemHandle> = (0..4)
        .map(|_| {
            subsystem
                .registrar()
                .register(&task, pages(&sim, 2, PageOrigin::Kernel), true, released.callback())
                .unwrap()
        })
        .collect();

    let releasers: Vec<_> = handles
        .iter()
        .map(|handle| {
            let subsystem = subsystem.clone();
            let handle = *handle;
            thread::spawn(move || subsystem.registrar().release(&TaskContext::kernel(), handle))
        })
        .collect();
    for releaser in releasers {
        assert_eq!(releaser.join().unwrap(), Ok(()));
    }

    let mut expected: Vec<u32> = handles.iter().map(|h| h.0).collect();
    expected.sort_unstable();
    assert_eq!(released.handles(), expected);
    assert_eq!(subsystem.registrar().live_regions(), 0);
    assert_eq!(sim.registered_regions(), 0);
    assert_eq!(sim.deferred_releases(), 0);
}

#[test]
fn interrupted_release_completes_with_the_next_batch() {
    let (sim, subsystem) = start();
    sim.defer_releases(2);
    let subsystem = Arc::new(subsystem);
    let released = Released::default();
    let kernel = TaskContext::kernel();

    let first = subsystem
        .registrar()
        .register(&kernel, pages(&sim, 1, PageOrigin::Kernel), false, released.callback())
        .unwrap();
    let second = subsystem
        .registrar()
        .register(&kernel, pages(&sim, 1, PageOrigin::Kernel), false, released.callback())
        .unwrap();

    let user = Arc::new(TaskContext::user(9, 9, 9));
    let releaser = {
        let subsystem = subsystem.clone();
        let user = user.clone();
        thread::spawn(move || subsystem.registrar().release(&user, first))
    };
    thread::sleep(Duration::from_millis(50));
    user.signal().raise();
    assert_eq!(releaser.join().unwrap(), Err(IwError::Interrupted));

    // Still mid-release on both sides.
    assert!(released.handles().is_empty());
    assert_eq!(subsystem.registrar().live_regions(), 2);
    assert_eq!(sim.deferred_releases(), 1);
    assert_eq!(
        subsystem.registrar().release(&kernel, first),
        Err(IwError::AlreadyInProgress)
    );

    subsystem.registrar().release(&kernel, second).unwrap();
    let mut expected = vec![first.0, second.0];
    expected.sort_unstable();
    assert_eq!(released.handles(), expected);
    assert_eq!(subsystem.registrar().live_regions(), 0);
}

#[test]
fn refused_registration_leaves_nothing_behind() {
    let (sim, subsystem) = start();
    let baseline = sim.frames().live();
    sim.refuse_registrations(true);
    let released = Released::default();

    let err = subsystem
        .registrar()
        .register(&TaskContext::kernel(), pages(&sim, 4, PageOrigin::Kernel), true, released.callback())
        .unwrap_err();
    assert!(matches!(err, IwError::ResourceExhausted(_)), "got {err:?}");
    assert_eq!(subsystem.registrar().live_regions(), 0);
    assert_eq!(sim.frames().live(), baseline);
    assert!(released.handles().is_empty());

    sim.refuse_registrations(false);
    let handle = subsystem
        .registrar()
        .register(&TaskContext::kernel(), pages(&sim, 1, PageOrigin::Kernel), true, None)
        .unwrap();
    assert!(sim.region(handle.0).is_some());
}

#[test]
fn large_region_streams_in_bursts() {
    let (sim, subsystem) = start_with(IwConfig::default().with_burst_pfns(8));
    let task = TaskContext::user(5, 6, 7);
    let list = pages(&sim, 20, PageOrigin::User);
    let pfns = list.pfns().to_vec();

    let handle = subsystem.registrar().register(&task, list, false, None).unwrap();
    let region = sim.region(handle.0).unwrap();
    assert_eq!(region.pfns, pfns);
    assert_eq!(region.flags, MemFlags::USER);
    assert_eq!(region.owner, task.credential());
}

#[test]
fn panic_reclaims_every_region() {
    let (sim, subsystem) = start();
    sim.defer_releases(16);
    let subsystem = Arc::new(subsystem);
    let released = Released::default();
    let task = TaskContext::kernel();

    let handles: Vec<MemHandle> = (0..3)
        .map(|_| {
            subsystem
                .registrar()
                .register(&task, pages(&sim, 1, PageOrigin::Kernel), false, released.callback())
                .unwrap()
        })
        .collect();

    // Parked waiting for a batch that never comes.
    let waiter = {
        let subsystem = subsystem.clone();
        let handle = handles[0];
        thread::spawn(move || subsystem.registrar().release(&TaskContext::kernel(), handle))
    };
    thread::sleep(Duration::from_millis(50));

    assert_eq!(subsystem.panic(), 3);
    let outcome = waiter.join().unwrap();
    assert!(
        matches!(outcome, Ok(()) | Err(IwError::SubsystemDown)),
        "got {outcome:?}"
    );

    let mut expected: Vec<u32> = handles.iter().map(|h| h.0).collect();
    expected.sort_unstable();
    assert_eq!(released.handles(), expected);
    assert_eq!(subsystem.registrar().live_regions(), 0);
    assert!(!subsystem.is_ready());
    assert!(matches!(
        subsystem
            .registrar()
            .register(&task, pages(&sim, 1, PageOrigin::Kernel), false, None),
        Err(IwError::SubsystemDown)
    ));
}
