//! Stream lifecycle, enqueue and synchronization calls.

use hstreams_core::{
    CpuMask, Event, LogDomainId, LogStreamDetails, LogStreamId, Result, ReturnValue, Timeout, WaitAddresses,
    WaitOutcome, XferDirection,
};

use crate::global::with_runtime;

pub fn stream_create(id: LogStreamId, log_domain: LogDomainId, mask: CpuMask) -> Result<()> {
    with_runtime(|rt| rt.stream_create(id, log_domain, mask))
}

/// Destroy a stream after its enqueued actions complete.
pub fn stream_destroy(id: LogStreamId) -> Result<()> {
    with_runtime(|rt| rt.stream_destroy(id))
}

pub fn num_log_streams(log_domain: LogDomainId) -> Result<usize> {
    with_runtime(|rt| rt.num_log_streams(log_domain))
}

pub fn log_stream_ids(log_domain: LogDomainId) -> Result<Vec<LogStreamId>> {
    with_runtime(|rt| rt.log_stream_ids(log_domain))
}

pub fn log_stream_details(id: LogStreamId) -> Result<LogStreamDetails> {
    with_runtime(|rt| rt.log_stream_details(id))
}

/// Enqueue sink function `name`. `heap_addrs` are source-side addresses
/// inside buffers instantiated in the stream's domain.
pub fn enqueue_compute(
    stream: LogStreamId,
    name: &str,
    scalars: &[u64],
    heap_addrs: &[u64],
    ret: Option<ReturnValue>,
) -> Result<Event> {
    with_runtime(|rt| rt.enqueue_compute(stream, name, scalars, heap_addrs, ret))
}

pub fn enqueue_data_1d(
    stream: LogStreamId,
    dst: u64,
    src: u64,
    len: u64,
    direction: XferDirection,
) -> Result<Event> {
    with_runtime(|rt| rt.enqueue_data_1d(stream, dst, src, len, direction))
}

pub fn enqueue_data_xdomain_1d(
    stream: LogStreamId,
    dst: u64,
    src: u64,
    len: u64,
    dst_domain: LogDomainId,
    src_domain: LogDomainId,
) -> Result<Event> {
    with_runtime(|rt| rt.enqueue_data_xdomain_1d(stream, dst, src, len, dst_domain, src_domain))
}

/// Make later actions of `stream` wait on `events`.
pub fn event_stream_wait(stream: LogStreamId, events: &[Event], addresses: WaitAddresses) -> Result<Option<Event>> {
    with_runtime(|rt| rt.event_stream_wait(stream, events, addresses))
}

pub fn event_wait(events: &[Event], wait_all: bool, timeout: Timeout) -> Result<WaitOutcome> {
    with_runtime(|rt| rt.event_wait(events, wait_all, timeout))
}

pub fn stream_synchronize(stream: LogStreamId) -> Result<()> {
    with_runtime(|rt| rt.stream_synchronize(stream))
}

pub fn thread_synchronize() -> Result<()> {
    with_runtime(|rt| rt.thread_synchronize())
}
