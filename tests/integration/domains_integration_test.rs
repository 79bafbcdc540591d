//! Physical and logical domain behavior through the process-wide API.

use hstreams::{
    add_log_domain, available_stream_cpu_mask, clear_last_error, fini, init, last_error, log_domain_details,
    log_domain_ids, num_phys_domains, oversubscription_level, phys_domain_details, remove_log_domains,
    set_options, stream_create, stream_destroy, CpuMask, Isa, LogDomainId, LogStreamId, Options, Overlap,
    PhysDomainId, ResultCode,
};
use proptest::prelude::*;
use serial_test::serial;

fn start(devices: u32, threads: u32) {
    fini().unwrap();
    set_options(Options {
        loopback_devices: devices,
        loopback_threads_per_device: threads,
        ..Options::default()
    })
    .unwrap();
    init().unwrap();
    clear_last_error();
}

#[test]
#[serial]
fn partial_mask_overlap_is_rejected() {
    start(1, 12);
    let phys = PhysDomainId::new(0);
    let (first, overlap) = add_log_domain(phys, CpuMask::from_range(0..8)).unwrap();
    assert_eq!(overlap, Overlap::NoOverlap);

    let err = add_log_domain(phys, CpuMask::from_range(4..12)).unwrap_err();
    assert_eq!(err.code(), ResultCode::OverlappingResources);
    assert_eq!(last_error(), ResultCode::OverlappingResources);
    assert_eq!(log_domain_ids(phys).unwrap(), vec![first]);

    let (twin, overlap) = add_log_domain(phys, CpuMask::from_range(0..8)).unwrap();
    assert_eq!(overlap, Overlap::Exact);
    assert_eq!(log_domain_details(twin).unwrap().mask, CpuMask::from_range(0..8));
    fini().unwrap();
}

#[test]
#[serial]
fn phys_domain_queries() {
    start(2, 8);
    let counts = num_phys_domains().unwrap();
    assert_eq!((counts.total, counts.active, counts.homogeneous), (2, 2, true));

    let details = phys_domain_details(PhysDomainId::new(1)).unwrap();
    assert_eq!(details.num_threads, 8);
    assert_eq!(details.max_mask, CpuMask::from_range(0..8));
    assert_eq!(details.avoid_mask, CpuMask::from_bits([0, 5, 6, 7]));

    let host = phys_domain_details(PhysDomainId::HOST).unwrap();
    assert_eq!(host.isa, Isa::X86_64);
    assert!(host.avoid_mask.is_empty());
    assert!(!host.max_mask.is_empty());

    assert_eq!(
        phys_domain_details(PhysDomainId::new(2)).unwrap_err().code(),
        ResultCode::DomainOutOfRange
    );
    assert_eq!(log_domain_ids(PhysDomainId::HOST).unwrap(), vec![LogDomainId::SOURCE]);
    fini().unwrap();
}

#[test]
#[serial]
fn removing_a_domain_frees_its_threads() {
    start(1, 8);
    let phys = PhysDomainId::new(0);
    let (domain, _) = add_log_domain(phys, CpuMask::from_range(0..4)).unwrap();
    stream_create(LogStreamId::new(0), domain, CpuMask::from_range(0..2)).unwrap();
    assert_eq!(available_stream_cpu_mask(phys).unwrap(), CpuMask::from_range(2..8));

    remove_log_domains(&[domain]).unwrap();
    assert_eq!(available_stream_cpu_mask(phys).unwrap(), CpuMask::from_range(0..8));
    assert_eq!(
        remove_log_domains(&[domain]).unwrap_err().code(),
        ResultCode::NotFound
    );
    assert_eq!(
        remove_log_domains(&[LogDomainId::SOURCE]).unwrap_err().code(),
        ResultCode::DomainOutOfRange
    );
    fini().unwrap();
}

#[test]
#[serial]
fn calls_after_fini_are_not_initialized() {
    start(1, 4);
    fini().unwrap();
    assert_eq!(num_phys_domains().unwrap_err().code(), ResultCode::NotInitialized);
}

#[derive(Debug, Clone)]
enum Step {
    Create { lo: usize, width: usize },
    Destroy(usize),
}

fn step() -> impl Strategy<Value = Step> {
    prop_oneof![
        (0usize..8, 1usize..4).prop_map(|(lo, width)| Step::Create { lo, width }),
        (0usize..16).prop_map(Step::Destroy),
    ]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    #[test]
    #[serial]
    fn oversubscription_matches_live_streams(steps in prop::collection::vec(step(), 1..24)) {
        start(1, 10);
        let phys = PhysDomainId::new(0);
        let (domain, _) = add_log_domain(phys, CpuMask::from_range(0..10)).unwrap();

        let mut live: Vec<(LogStreamId, CpuMask)> = Vec::new();
        let mut next = 0u32;
        for step in steps {
            match step {
                Step::Create { lo, width } => {
                    let mask = CpuMask::from_range(lo..(lo + width).min(10));
                    let id = LogStreamId::new(next);
                    next += 1;
                    stream_create(id, domain, mask).unwrap();
                    live.push((id, mask));
                }
                Step::Destroy(index) if !live.is_empty() => {
                    let (id, _) = live.remove(index % live.len());
                    stream_destroy(id).unwrap();
                }
                Step::Destroy(_) => {}
            }
            let level = oversubscription_level(phys).unwrap();
            // Streams with equal masks share one physical stream.
            let mut masks: Vec<CpuMask> = live.iter().map(|(_, mask)| *mask).collect();
            masks.sort_by_key(|mask| *mask.words());
            masks.dedup();
            for (thread, count) in level.iter().enumerate() {
                let expected = masks.iter().filter(|mask| mask.is_set(thread)).count() as u32;
                prop_assert_eq!(*count, expected);
            }
        }
        fini().unwrap();
    }
}
