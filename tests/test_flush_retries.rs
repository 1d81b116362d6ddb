mod common;

use std::sync::atomic::Ordering;

use fault_injection::{FAULT_INJECT_COUNTER, set_trigger_function};

use logcache::{BlockCache, Error};

use common::small_config;

fn fail_every_io(_crate_name: &str, _file_name: &str, _line_number: u32) {
    FAULT_INJECT_COUNTER.store(1, Ordering::Release);
}

// Injected faults are process-wide, so everything that depends on them
// runs in this single test.
#[test]
fn failed_flushes_are_retried_before_turning_fatal() {
    common::setup_logger();
    let config = small_config().flush_retries(2);

    let cache = BlockCache::open(config.clone()).unwrap();
    let id = {
        let mut handle = cache.allocate().unwrap();
        handle.data_mut().extend_from_slice(b"survivor");
        handle.block_id()
    };

    // the first write of the flush fails, its retry goes through
    FAULT_INJECT_COUNTER.store(1, Ordering::Release);
    assert_eq!(cache.flush().unwrap(), 1);
    FAULT_INJECT_COUNTER.store(u64::MAX, Ordering::Release);
    assert_eq!(cache.dirty_blocks(), 0);
    assert_eq!(cache.serializer().io_backend().stats().failed, 1);

    drop(cache);
    let cache = BlockCache::open(config).unwrap();
    assert_eq!(&*cache.read(id).unwrap(), b"survivor");

    {
        let mut handle = cache.write(id).unwrap();
        handle.data_mut().extend_from_slice(b" twice");
    }

    // every attempt fails from here on
    set_trigger_function(fail_every_io);
    FAULT_INJECT_COUNTER.store(1, Ordering::Release);

    assert!(matches!(cache.flush(), Err(Error::Io(_))));
    let failed = cache.serializer().io_backend().stats().failed;
    assert_eq!(failed, 3, "one attempt plus two retries");

    // the failure is now fatal and nothing else is attempted
    assert!(matches!(cache.flush(), Err(Error::Io(_))));
    assert!(cache.read(id).is_err());
    assert_eq!(cache.serializer().io_backend().stats().failed, failed);
    assert_eq!(cache.dirty_blocks(), 1);
}
