//! App-level partitioning of physical domains into logical domains and
//! streams.

use hstreams::{
    app_init, app_init_domains, app_log_domains, fini, is_initialized, log_domain_details, log_domain_ids,
    log_stream_details, log_stream_ids, oversubscription_level, set_options, CpuMask, LogStreamId, Options,
    PhysDomainId, ResultCode,
};
use serial_test::serial;

fn configure(devices: u32, threads: u32) {
    fini().unwrap();
    set_options(Options {
        loopback_devices: devices,
        loopback_threads_per_device: threads,
        ..Options::default()
    })
    .unwrap();
}

fn stream_mask(id: u32) -> CpuMask {
    log_stream_details(LogStreamId::new(id)).unwrap().mask
}

#[test]
#[serial]
fn ten_usable_threads_split_four_three_three() {
    // 14 threads minus the avoided bits 0, 11, 12 and 13.
    configure(1, 14);
    let plan = app_init_domains(1, &[3], 1).unwrap();
    assert_eq!(plan.num_streams(), 3);

    let domain = app_log_domains().unwrap()[0];
    assert_eq!(log_domain_details(domain).unwrap().mask, CpuMask::from_range(1..11));
    assert_eq!(stream_mask(0), CpuMask::from_range(1..5));
    assert_eq!(stream_mask(1), CpuMask::from_range(5..8));
    assert_eq!(stream_mask(2), CpuMask::from_range(8..11));
    fini().unwrap();
}

#[test]
#[serial]
fn oversubscribed_streams_repeat_the_first_pass() {
    configure(2, 8);
    let plan = app_init_domains(2, &[2, 1], 2).unwrap();
    let total = 3;
    assert_eq!(plan.num_streams(), total * 2);

    for i in 0..total as u32 {
        let base = log_stream_details(LogStreamId::new(i)).unwrap();
        let repeat = log_stream_details(LogStreamId::new(i + total as u32)).unwrap();
        assert_eq!(base.mask, repeat.mask);
        assert_eq!(base.log_domain, repeat.log_domain);
    }
    // Masks within one logical domain are disjoint across the first pass.
    assert!(!stream_mask(0).intersects(&stream_mask(1)));

    let first = oversubscription_level(PhysDomainId::new(0)).unwrap();
    assert!(first[1..5].iter().all(|level| *level == 1));
    assert_eq!(first[0], 0);
    fini().unwrap();
}

#[test]
#[serial]
fn second_call_must_keep_the_domain_count() {
    configure(2, 8);
    app_init_domains(2, &[1, 1], 1).unwrap();
    let domains = app_log_domains().unwrap();
    let before: Vec<_> = [0, 1].iter().map(|p| log_domain_ids(PhysDomainId::new(*p)).unwrap()).collect();

    let err = app_init_domains(3, &[1, 1, 1], 1).unwrap_err();
    assert_eq!(err.code(), ResultCode::InconsistentArgs);
    let after: Vec<_> = [0, 1].iter().map(|p| log_domain_ids(PhysDomainId::new(*p)).unwrap()).collect();
    assert_eq!(before, after);
    assert!(is_initialized());

    let plan = app_init_domains(2, &[1, 1], 1).unwrap();
    assert_eq!(plan.streams[0].id, LogStreamId::new(2));
    assert_eq!(app_log_domains().unwrap(), domains);
    assert_eq!(log_stream_ids(domains[0]).unwrap(), vec![LogStreamId::new(0), LogStreamId::new(2)]);
    fini().unwrap();
}

#[test]
#[serial]
fn failure_after_implicit_init_finalizes() {
    configure(1, 4);
    let err = app_init_domains(1, &[9], 1).unwrap_err();
    assert_eq!(err.code(), ResultCode::OutOfRange);
    assert!(!is_initialized());

    let err = app_init_domains(0, &[], 1).unwrap_err();
    assert_eq!(err.code(), ResultCode::OutOfRange);
    assert!(!is_initialized());
}

#[test]
#[serial]
fn app_init_uses_every_accelerator() {
    configure(3, 6);
    let plan = app_init(2, 1).unwrap();
    assert_eq!(plan.domains.len(), 3);
    let phys: Vec<i32> = plan.domains.iter().map(|d| d.phys.id()).collect();
    assert_eq!(phys, vec![0, 1, 2]);
    assert_eq!(plan.num_streams(), 6);
    fini().unwrap();
}
