//! Streams: sink functions, ordering and synchronization.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use hstreams::{
    add_log_domain, alloc1d, app_memcpy, app_memset, enqueue_compute, enqueue_data_1d, event_stream_wait, event_wait,
    fini, init_with_engine, log_stream_details, log_stream_ids, num_log_streams, set_options, sink_registry,
    stream_create, stream_destroy, stream_synchronize, thread_synchronize, CpuMask, DepPolicy, Engine, Event,
    LogDomainId, LogStreamId, LoopbackEngine, Options, PhysDomainId, ResultCode, ReturnValue, SinkRegistry, Timeout,
    WaitAddresses, XferDirection,
};
use serial_test::serial;

struct Session {
    domain: LogDomainId,
    engine: Arc<LoopbackEngine>,
}

fn start(policy: DepPolicy) -> Session {
    start_with_devices(policy, 1)
}

fn start_with_devices(policy: DepPolicy, devices: u32) -> Session {
    fini().unwrap();
    set_options(Options {
        dep_policy: policy,
        time_out_ms: Timeout::Millis(10_000),
        ..Options::default()
    })
    .unwrap();
    let registry = Arc::new(SinkRegistry::new());
    let engine = Arc::new(LoopbackEngine::new(Arc::clone(&registry), devices, 8));
    init_with_engine(Arc::clone(&engine) as Arc<dyn Engine>, registry).unwrap();
    let (domain, _) = add_log_domain(PhysDomainId::new(0), CpuMask::from_range(0..8)).unwrap();
    Session { domain, engine }
}

fn is_pending(event: Event) -> bool {
    match event_wait(&[event], true, Timeout::Millis(100)) {
        Ok(_) => false,
        Err(err) => err.code() == ResultCode::TimeOutReached,
    }
}

#[test]
#[serial]
fn sink_function_receives_translated_arguments() {
    let domain = start(DepPolicy::Conservative).domain;
    let stream = LogStreamId::new(0);
    stream_create(stream, domain, CpuMask::from_range(0..4)).unwrap();

    sink_registry().unwrap().register("sum_bytes", |args, ret| {
        let len = args.scalar(0).unwrap_or(0) as usize;
        let Some(ptr) = args.heap_ptr::<u8>(0) else {
            return;
        };
        let bytes = unsafe { std::slice::from_raw_parts(ptr, len) };
        let total: u64 = bytes.iter().map(|b| u64::from(*b)).sum();
        ret[..8].copy_from_slice(bytemuck::bytes_of(&total));
    });

    let mut data = vec![3u8; 100];
    let base = data.as_mut_ptr() as u64;
    alloc1d(base, 100).unwrap();
    enqueue_data_1d(stream, base, base, 100, XferDirection::SrcToSink).unwrap();

    let ret = ReturnValue::new(8);
    let event = enqueue_compute(stream, "sum_bytes", &[50], &[base + 50], Some(ret.clone())).unwrap();
    event_wait(&[event], true, Timeout::Millis(5_000)).unwrap();
    assert_eq!(ret.read::<u64>(), Some(150));

    assert_eq!(
        enqueue_compute(stream, "not_registered", &[], &[], None).unwrap_err().code(),
        ResultCode::BadName
    );
    fini().unwrap();
}

#[test]
#[serial]
fn memset_and_memcpy_stay_in_the_sink_domain() {
    let domain = start(DepPolicy::Buffers).domain;
    let stream = LogStreamId::new(7);
    stream_create(stream, domain, CpuMask::from_range(0..8)).unwrap();

    let mut data = vec![0u8; 64];
    let base = data.as_mut_ptr() as u64;
    alloc1d(base, 64).unwrap();
    app_memset(stream, base, 0xee, 16).unwrap();
    app_memcpy(stream, base, base + 32, 16).unwrap();
    // Nothing reaches the source copy until it is transferred back.
    stream_synchronize(stream).unwrap();
    assert!(data.iter().all(|b| *b == 0));

    enqueue_data_1d(stream, base, base, 64, XferDirection::SinkToSrc).unwrap();
    stream_synchronize(stream).unwrap();
    assert!(data[..16].iter().all(|b| *b == 0xee));
    assert!(data[16..32].iter().all(|b| *b == 0));
    assert!(data[32..48].iter().all(|b| *b == 0xee));
    fini().unwrap();
}

#[test]
#[serial]
fn later_transfer_on_a_gated_buffer_waits() {
    let session = start(DepPolicy::Buffers);
    let stream = LogStreamId::new(0);
    stream_create(stream, session.domain, CpuMask::from_range(0..8)).unwrap();

    let mut a = vec![1u8; 32];
    let mut b = vec![2u8; 32];
    let (addr_a, addr_b) = (a.as_mut_ptr() as u64, b.as_mut_ptr() as u64);
    alloc1d(addr_a, 32).unwrap();
    alloc1d(addr_b, 32).unwrap();

    let gate = session.engine.register_user_event().unwrap();
    let marker = event_stream_wait(stream, &[gate], WaitAddresses::Buffers(vec![addr_a]))
        .unwrap()
        .unwrap();
    let unrelated = enqueue_data_1d(stream, addr_b, addr_b, 32, XferDirection::SrcToSink).unwrap();
    let dependent = enqueue_data_1d(stream, addr_a, addr_a, 32, XferDirection::SrcToSink).unwrap();

    assert!(!is_pending(unrelated));
    assert!(is_pending(dependent));
    session.engine.signal_user_event(gate).unwrap();
    let outcome = event_wait(&[marker, dependent], true, Timeout::Millis(5_000)).unwrap();
    assert_eq!(outcome.num_signaled, 2);
    fini().unwrap();
}

#[test]
#[serial]
fn stream_bookkeeping() {
    let domain = start(DepPolicy::Conservative).domain;
    for id in [3, 1, 2] {
        stream_create(LogStreamId::new(id), domain, CpuMask::from_range(0..2)).unwrap();
    }
    assert_eq!(num_log_streams(domain).unwrap(), 3);
    assert_eq!(
        log_stream_ids(domain).unwrap(),
        vec![LogStreamId::new(1), LogStreamId::new(2), LogStreamId::new(3)]
    );
    let details = log_stream_details(LogStreamId::new(2)).unwrap();
    assert_eq!(details.log_domain, domain);
    assert_eq!(details.phys_domain, PhysDomainId::new(0));

    assert_eq!(
        stream_create(LogStreamId::new(9), domain, CpuMask::from_range(6..10)).unwrap_err().code(),
        ResultCode::CpuMaskOutOfRange
    );
    assert_eq!(
        stream_create(LogStreamId::new(9), LogDomainId::new(42), CpuMask::from_range(0..1))
            .unwrap_err()
            .code(),
        ResultCode::DomainOutOfRange
    );
    stream_destroy(LogStreamId::new(1)).unwrap();
    assert_eq!(stream_destroy(LogStreamId::new(1)).unwrap_err().code(), ResultCode::NotFound);
    fini().unwrap();
}

#[test]
#[serial]
fn thread_synchronize_drains_every_stream() {
    let domain = start(DepPolicy::Conservative).domain;
    let runs = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&runs);
    sink_registry().unwrap().register("tick", move |_, _| {
        std::thread::sleep(std::time::Duration::from_millis(2));
        counter.fetch_add(1, Ordering::SeqCst);
    });

    for (id, lo) in [(0u32, 0usize), (1, 2), (2, 4)] {
        let stream = LogStreamId::new(id);
        stream_create(stream, domain, CpuMask::from_range(lo..lo + 2)).unwrap();
        for _ in 0..5 {
            enqueue_compute(stream, "tick", &[], &[], None).unwrap();
        }
    }
    thread_synchronize().unwrap();
    assert_eq!(runs.load(Ordering::SeqCst), 15);
    fini().unwrap();
}

#[test]
#[serial]
fn wait_any_reports_the_signaled_event() {
    let session = start(DepPolicy::Conservative);
    let first = session.engine.register_user_event().unwrap();
    let second = session.engine.register_user_event().unwrap();
    session.engine.signal_user_event(second).unwrap();

    let outcome = event_wait(&[first, second], false, Timeout::Millis(5_000)).unwrap();
    assert_eq!(outcome.num_signaled, 1);
    assert_eq!(outcome.signaled_indices, vec![1]);
    assert_eq!(
        event_wait(&[first], true, Timeout::Millis(20)).unwrap_err().code(),
        ResultCode::TimeOutReached
    );

    session.engine.cancel_user_event(first).unwrap();
    assert_eq!(
        event_wait(&[first], true, Timeout::Millis(5_000)).unwrap_err().code(),
        ResultCode::EventCanceled
    );
    fini().unwrap();
}

#[test]
#[serial]
fn streams_in_different_domains_do_not_order_each_other() {
    let session = start_with_devices(DepPolicy::Conservative, 2);
    let (other, _) = add_log_domain(PhysDomainId::new(1), CpuMask::from_range(0..8)).unwrap();
    let (gated, free) = (LogStreamId::new(0), LogStreamId::new(1));
    stream_create(gated, session.domain, CpuMask::from_range(0..8)).unwrap();
    stream_create(free, other, CpuMask::from_range(0..8)).unwrap();

    let mut data = vec![4u8; 256];
    let base = data.as_mut_ptr() as u64;
    alloc1d(base, 256).unwrap();

    let gate = session.engine.register_user_event().unwrap();
    event_stream_wait(gated, &[gate], WaitAddresses::Control).unwrap();
    let held = enqueue_data_1d(gated, base, base, 256, XferDirection::SrcToSink).unwrap();

    let upload = enqueue_data_1d(free, base, base, 256, XferDirection::SrcToSink).unwrap();
    let fill = app_memset(free, base, 9, 128).unwrap();
    let download = enqueue_data_1d(free, base, base, 256, XferDirection::SinkToSrc).unwrap();
    event_wait(&[upload, fill, download], true, Timeout::Millis(5_000)).unwrap();
    assert!(data[..128].iter().all(|b| *b == 9));
    assert!(is_pending(held));

    session.engine.signal_user_event(gate).unwrap();
    stream_synchronize(gated).unwrap();
    fini().unwrap();
}
