//! Buffer registration, aliasing and cross-domain data movement.

use std::sync::Arc;

use hstreams::{
    add_buffer_log_domains, add_log_domain, alloc1d, alloc1d_ex, buffer_log_domains, buffer_num_log_domains,
    buffer_props, dealloc, enqueue_data_1d, enqueue_data_xdomain_1d, fini, init_with_engine, remove_buffer_log_domains,
    set_options, stream_create, stream_synchronize, AllocPolicy, BufferDomains, BufferFlags, BufferProps, CpuMask,
    Engine, LogStreamId, LoopbackEngine, MemType, Options, PhysDomainId, ResultCode, SinkRegistry, XferDirection,
};
use serial_test::serial;

fn start(devices: u32, threads: u32) -> Arc<LoopbackEngine> {
    fini().unwrap();
    set_options(Options::default()).unwrap();
    let registry = Arc::new(SinkRegistry::new());
    let engine = Arc::new(LoopbackEngine::new(Arc::clone(&registry), devices, threads));
    init_with_engine(Arc::clone(&engine) as Arc<dyn Engine>, registry).unwrap();
    engine
}

fn props(flags: BufferFlags) -> BufferProps {
    BufferProps::new(MemType::Normal, AllocPolicy::Preferred, flags)
}

#[test]
#[serial]
fn aliased_buffer_shares_one_instantiation_per_phys_domain() {
    let engine = start(1, 8);
    let phys = PhysDomainId::new(0);
    let (a, _) = add_log_domain(phys, CpuMask::from_range(0..4)).unwrap();
    let (b, _) = add_log_domain(phys, CpuMask::from_range(4..8)).unwrap();

    let mut data = vec![0u8; 256];
    let base = data.as_mut_ptr() as u64;
    alloc1d_ex(base, 256, props(BufferFlags::ALIASED), BufferDomains::Only(vec![a, b])).unwrap();
    // Source instantiation plus one shared sink instantiation.
    assert_eq!(engine.live_buffers(), 2);

    remove_buffer_log_domains(base, BufferDomains::Only(vec![a])).unwrap();
    assert_eq!(engine.live_buffers(), 2);
    assert_eq!(buffer_log_domains(base).unwrap(), vec![b]);

    remove_buffer_log_domains(base, BufferDomains::Only(vec![b])).unwrap();
    assert_eq!(engine.live_buffers(), 1);

    dealloc(base).unwrap();
    assert_eq!(engine.live_buffers(), 0);
    fini().unwrap();
}

#[test]
#[serial]
fn unaliased_buffer_gets_one_instantiation_per_log_domain() {
    let engine = start(1, 8);
    let phys = PhysDomainId::new(0);
    add_log_domain(phys, CpuMask::from_range(0..4)).unwrap();
    add_log_domain(phys, CpuMask::from_range(4..8)).unwrap();

    let mut data = vec![0u8; 128];
    let base = data.as_mut_ptr() as u64;
    alloc1d(base, 128).unwrap();
    assert_eq!(engine.live_buffers(), 3);
    assert_eq!(buffer_num_log_domains(base).unwrap(), 2);
    fini().unwrap();
    assert_eq!(engine.live_buffers(), 0);
}

#[test]
#[serial]
fn any_inner_address_names_the_buffer() {
    start(1, 4);
    let mut data = vec![0u8; 100];
    let base = data.as_mut_ptr() as u64;
    alloc1d(base, 100).unwrap();

    assert_eq!(buffer_props(base).unwrap(), BufferProps::default());
    assert_eq!(buffer_props(base + 99).unwrap(), BufferProps::default());
    assert_eq!(buffer_props(base + 100).unwrap_err().code(), ResultCode::NotFound);
    assert_eq!(alloc1d(base + 50, 10).unwrap_err().code(), ResultCode::AlreadyFound);
    assert_eq!(alloc1d(base + 90, 20).unwrap_err().code(), ResultCode::OverlappingResources);
    assert_eq!(alloc1d(0, 20).unwrap_err().code(), ResultCode::NullPtr);
    assert_eq!(
        alloc1d_ex(base + 200, 8, props(BufferFlags::AFFINITIZED), BufferDomains::All)
            .unwrap_err()
            .code(),
        ResultCode::NotImplemented
    );

    dealloc(base + 42).unwrap();
    assert_eq!(dealloc(base).unwrap_err().code(), ResultCode::NotFound);
    fini().unwrap();
}

#[test]
#[serial]
fn add_buffer_domain_rules() {
    start(1, 8);
    let phys = PhysDomainId::new(0);
    let mut data = vec![0u8; 64];
    let base = data.as_mut_ptr() as u64;
    alloc1d(base, 64).unwrap();
    let (late, _) = add_log_domain(phys, CpuMask::from_range(0..2)).unwrap();

    assert_eq!(buffer_num_log_domains(base).unwrap(), 0);
    assert_eq!(
        add_buffer_log_domains(base, &[late, late]).unwrap_err().code(),
        ResultCode::InconsistentArgs
    );
    assert_eq!(buffer_num_log_domains(base).unwrap(), 0);
    add_buffer_log_domains(base, &[late]).unwrap();
    assert_eq!(add_buffer_log_domains(base, &[late]).unwrap_err().code(), ResultCode::AlreadyFound);
    assert_eq!(add_buffer_log_domains(base, &[]).unwrap_err().code(), ResultCode::OutOfRange);
    assert_eq!(add_buffer_log_domains(base + 64, &[late]).unwrap_err().code(), ResultCode::NotFound);
    fini().unwrap();
}

#[test]
#[serial]
fn data_moves_between_two_sink_domains() {
    start(2, 4);
    let (first, _) = add_log_domain(PhysDomainId::new(0), CpuMask::from_range(0..4)).unwrap();
    let (second, _) = add_log_domain(PhysDomainId::new(1), CpuMask::from_range(0..4)).unwrap();
    let (up, across, down) = (LogStreamId::new(0), LogStreamId::new(1), LogStreamId::new(2));
    stream_create(up, first, CpuMask::from_range(0..4)).unwrap();
    stream_create(across, second, CpuMask::from_range(0..4)).unwrap();
    stream_create(down, second, CpuMask::from_range(0..2)).unwrap();

    let mut input: Vec<u8> = (0..=255).collect();
    let mut output = vec![0u8; 256];
    let (src, dst) = (input.as_mut_ptr() as u64, output.as_mut_ptr() as u64);
    alloc1d(src, 256).unwrap();
    alloc1d(dst, 256).unwrap();

    enqueue_data_1d(up, src, src, 256, XferDirection::SrcToSink).unwrap();
    stream_synchronize(up).unwrap();
    enqueue_data_xdomain_1d(across, dst, src, 256, second, first).unwrap();
    stream_synchronize(across).unwrap();
    enqueue_data_1d(down, dst, dst, 256, XferDirection::SinkToSrc).unwrap();
    stream_synchronize(down).unwrap();

    assert_eq!(output, input);
    fini().unwrap();
}
