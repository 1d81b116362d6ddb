mod common;

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use quickcheck::{Arbitrary, Gen, QuickCheck};

use logcache::{
    Access, BlockCache, BlockHandle, BlockId, CacheStats, Error, FlushPolicy,
    PendingAcquire,
};

use common::{flip_byte, small_config};

fn fill(cache: &BlockCache, data: &[u8]) -> BlockId {
    let mut handle = cache.allocate().unwrap();
    handle.data_mut().extend_from_slice(data);
    handle.block_id()
}

#[test]
fn written_blocks_survive_reopen() {
    common::setup_logger();
    let config = small_config();

    let cache = BlockCache::open(config.clone()).unwrap();
    let a = fill(&cache, b"first");
    let b = fill(&cache, b"second");
    assert_eq!(cache.dirty_blocks(), 2);
    assert_eq!(cache.flush().unwrap(), 2);
    assert_eq!(cache.dirty_blocks(), 0);

    {
        let mut handle = cache.write(b).unwrap();
        handle.data_mut().clear();
        handle.data_mut().extend_from_slice(b"rewritten");
    }
    assert_eq!(cache.dirty_blocks(), 1);

    // dropping flushes
    drop(cache);

    let cache = BlockCache::open(config).unwrap();
    assert_eq!(&*cache.read(a).unwrap(), b"first");
    assert_eq!(&*cache.read(b).unwrap(), b"rewritten");
    assert_eq!(cache.read(b + 100).unwrap_err(), Error::NotFound(b + 100));
}

#[test]
fn queued_writer_blocks_later_readers() {
    common::setup_logger();
    let cache = BlockCache::open(small_config()).unwrap();
    let id = fill(&cache, b"x");

    let first_reader = cache.read(id).unwrap();
    let writer = cache.acquire(id, Access::Write);
    let late_reader = cache.acquire(id, Access::Read);
    assert!(!writer.is_ready());
    assert!(!late_reader.is_ready());

    drop(first_reader);
    assert!(writer.is_ready());
    assert!(!late_reader.is_ready());

    let mut writer = writer.wait().unwrap();
    writer.data_mut().push(b'y');
    drop(writer);

    let late_reader = late_reader.wait().unwrap();
    assert_eq!(&*late_reader, b"xy");
}

#[test]
fn readers_share_a_block() {
    common::setup_logger();
    let cache = BlockCache::open(small_config()).unwrap();
    let id = fill(&cache, b"shared");

    let handles: Vec<BlockHandle> = (0..8).map(|_| cache.read(id).unwrap()).collect();
    assert!(handles.iter().all(|h| &**h == b"shared"));

    let writer = cache.acquire(id, Access::Write);
    assert!(!writer.is_ready());
    drop(handles);
    assert!(writer.wait().is_ok());
}

#[test]
fn abandoned_acquires_are_skipped() {
    common::setup_logger();
    let cache = BlockCache::open(small_config()).unwrap();
    let id = fill(&cache, b"x");

    let holder = cache.write(id).unwrap();
    let abandoned = cache.acquire(id, Access::Write);
    let reader = cache.acquire(id, Access::Read);
    drop(abandoned);
    drop(holder);

    assert!(reader.is_ready());
    let reader = reader.wait().unwrap();
    assert_eq!(&*reader, b"x");
    drop(reader);

    // nothing is left holding the lock
    assert!(cache.acquire(id, Access::Write).is_ready());
}

#[test]
#[should_panic(expected = "not held for writing")]
fn readers_cannot_mutate() {
    let cache = BlockCache::open(small_config()).unwrap();
    let id = fill(&cache, b"x");
    let mut reader = cache.read(id).unwrap();
    reader.data_mut().push(1);
}

#[test]
fn waiters_are_woken_across_threads() {
    common::setup_logger();
    let cache = Arc::new(BlockCache::open(small_config()).unwrap());
    let id = fill(&cache, &[0]);

    let threads: Vec<_> = (0..4)
        .map(|_| {
            let cache = cache.clone();
            thread::spawn(move || {
                for _ in 0..100 {
                    let mut handle = cache.write(id).unwrap();
                    let next = handle[0].wrapping_add(1);
                    handle.data_mut()[0] = next;
                }
            })
        })
        .collect();

    for thread in threads {
        thread.join().unwrap();
    }

    assert_eq!(cache.read(id).unwrap()[0], 400_u32 as u8);
}

#[test]
fn clean_blocks_are_evicted_least_recently_used_first() {
    common::setup_logger();
    let config = small_config().cache_capacity_bytes(4 * 256);
    let stats = Arc::new(CacheStats::default());
    let cache = BlockCache::open_with_observer(config, stats.clone()).unwrap();

    let ids: Vec<BlockId> =
        (0..10_u8).map(|i| fill(&cache, &[i; 16])).collect();
    assert_eq!(cache.resident_blocks(), 10);

    cache.flush().unwrap();
    assert_eq!(cache.resident_blocks(), 4);
    assert_eq!(stats.snapshot().evictions, 6);
    assert_eq!(stats.snapshot().flushed_blocks, 10);

    assert_eq!(&*cache.read(ids[0]).unwrap(), &[0; 16]);
    assert_eq!(stats.snapshot().misses, 1);
    assert_eq!(cache.resident_blocks(), 4);

    assert_eq!(&*cache.read(ids[9]).unwrap(), &[9; 16]);
    let snapshot = stats.snapshot();
    assert_eq!(snapshot.hits, 1);
    assert_eq!(snapshot.resident_blocks, 4);
    assert!((snapshot.hit_ratio() - 0.5).abs() < f64::EPSILON);
}

#[test]
fn read_errors_fail_every_waiter() {
    common::setup_logger();
    let config = small_config();

    let cache = BlockCache::open(config.clone()).unwrap();
    let id = fill(&cache, b"soon to be corrupt");
    cache.flush().unwrap();
    let (location, _) = cache.serializer().location_of(id).unwrap();
    drop(cache);

    let offset = location.offset(config.extent_size, config.block_size);
    flip_byte(&config.path, offset + 40);

    let cache = BlockCache::open(config).unwrap();
    let first = cache.acquire(id, Access::Read);
    let second = cache.acquire(id, Access::Write);
    assert_eq!(first.wait().unwrap_err(), Error::Corruption { at: location });
    assert_eq!(second.wait().unwrap_err(), Error::Corruption { at: location });
    assert_eq!(cache.resident_blocks(), 0);
}

#[test]
fn deleted_blocks_disappear() {
    common::setup_logger();
    let config = small_config();
    let cache = BlockCache::open(config.clone()).unwrap();

    let kept = fill(&cache, b"kept");
    let doomed = fill(&cache, b"doomed");
    cache.flush().unwrap();

    let mut handle = cache.write(doomed).unwrap();
    handle.mark_deleted();
    drop(handle);

    assert_eq!(cache.read(doomed).unwrap_err(), Error::NotFound(doomed));
    assert!(cache.serializer().contains(doomed));
    cache.flush().unwrap();
    assert!(!cache.serializer().contains(doomed));

    // never flushed, so only the id is given back
    let mut ephemeral = cache.allocate().unwrap();
    let ephemeral_id = ephemeral.block_id();
    ephemeral.mark_deleted();
    drop(ephemeral);
    assert_eq!(cache.flush().unwrap(), 0);
    assert_eq!(cache.resident_blocks(), 1);

    #[cfg(not(feature = "monotonic-behavior"))]
    assert_eq!(ephemeral_id, doomed);
    #[cfg(feature = "monotonic-behavior")]
    let _ = ephemeral_id;

    drop(cache);
    let cache = BlockCache::open(config).unwrap();
    assert_eq!(&*cache.read(kept).unwrap(), b"kept");
    assert_eq!(cache.read(doomed).unwrap_err(), Error::NotFound(doomed));
}

#[test]
fn deleted_ids_are_reused_only_once_the_block_is_gone() {
    common::setup_logger();
    let cache = BlockCache::open(small_config()).unwrap();
    let rounds = 200_u32;

    let kept: Vec<(BlockId, Vec<u8>)> = std::thread::scope(|s| {
        s.spawn(|| {
            for i in 0..rounds {
                let id = fill(&cache, &i.to_le_bytes());
                cache.flush().unwrap();

                let mut handle = cache.write(id).unwrap();
                handle.mark_deleted();
                drop(handle);
                cache.flush().unwrap();
            }
        });

        let allocator = s.spawn(|| {
            (0..rounds)
                .map(|i| {
                    let data = format!("kept {}", i).into_bytes();
                    (fill(&cache, &data), data)
                })
                .collect::<Vec<_>>()
        });
        allocator.join().unwrap()
    });

    let mut ids: Vec<BlockId> = kept.iter().map(|(id, _)| *id).collect();
    ids.sort_unstable();
    ids.dedup();
    assert_eq!(ids.len(), kept.len());

    cache.flush().unwrap();
    for (id, data) in &kept {
        assert_eq!(&*cache.read(*id).unwrap(), &data[..]);
    }
}

#[test]
fn checkpoint_flushes_first() {
    common::setup_logger();
    let cache = BlockCache::open(small_config()).unwrap();
    fill(&cache, b"a");
    let before = cache.serializer().stats().checkpoints;

    cache.checkpoint().unwrap();
    assert_eq!(cache.dirty_blocks(), 0);
    assert_eq!(cache.serializer().stats().checkpoints, before + 1);
    assert_eq!(cache.serializer().stats().blocks, 1);
}

#[test]
fn background_flusher_writes_dirty_blocks() {
    common::setup_logger();
    let config = small_config()
        .flush_every_ms(Some(10))
        .flush_policy(FlushPolicy::OldestFirst { max_batch: 2 });
    let cache = BlockCache::open(config).unwrap();

    for i in 0..5_u8 {
        fill(&cache, &[i]);
    }

    for _ in 0..500 {
        if cache.dirty_blocks() == 0 {
            break;
        }
        thread::sleep(Duration::from_millis(10));
    }
    assert_eq!(cache.dirty_blocks(), 0);
    assert_eq!(cache.serializer().stats().blocks, 5);
}

#[test]
fn pending_acquires_can_be_awaited() {
    common::setup_logger();
    let cache = BlockCache::open(small_config()).unwrap();
    let id = fill(&cache, b"async");

    let holder = cache.write(id).unwrap();
    let pending = cache.acquire(id, Access::Read);

    let waiter = thread::spawn(move || block_on(pending));
    thread::sleep(Duration::from_millis(20));
    drop(holder);

    let handle = waiter.join().unwrap().unwrap();
    assert_eq!(&*handle, b"async");
}

// a minimal executor, parking the thread until the waker fires
fn block_on<F: std::future::Future>(future: F) -> F::Output {
    use std::task::{Context, Poll, Wake};

    struct ThreadWaker(thread::Thread);

    impl Wake for ThreadWaker {
        fn wake(self: Arc<Self>) {
            self.0.unpark();
        }
    }

    let waker = Arc::new(ThreadWaker(thread::current())).into();
    let mut cx = Context::from_waker(&waker);
    let mut future = std::pin::pin!(future);
    loop {
        match future.as_mut().poll(&mut cx) {
            Poll::Ready(output) => return output,
            Poll::Pending => thread::park(),
        }
    }
}

#[derive(Debug, Clone)]
enum LockOp {
    Acquire(BlockId, Access),
    Release(usize),
}

impl Arbitrary for LockOp {
    fn arbitrary(g: &mut Gen) -> LockOp {
        if u8::arbitrary(g) % 5 < 3 {
            let access =
                if bool::arbitrary(g) { Access::Write } else { Access::Read };
            LockOp::Acquire(u64::from(u8::arbitrary(g) % 2), access)
        } else {
            LockOp::Release(usize::arbitrary(g))
        }
    }
}

struct Request {
    block_id: BlockId,
    access: Access,
    pending: Option<PendingAcquire>,
    held: Option<BlockHandle>,
    granted: bool,
}

fn locks_are_fair(requests: &[Request], block_id: BlockId) -> bool {
    let mine = || requests.iter().filter(move |r| r.block_id == block_id);

    let writers =
        mine().filter(|r| r.held.is_some() && r.access == Access::Write).count();
    let readers =
        mine().filter(|r| r.held.is_some() && r.access == Access::Read).count();
    if writers > 1 || (writers == 1 && readers > 0) {
        return false;
    }

    // grants form a prefix of the arrival order, and a queue is never
    // left waiting on a free block
    let Some(first_waiting) = mine().position(|r| r.pending.is_some()) else {
        return true;
    };
    let granted_later = mine().skip(first_waiting).any(|r| r.granted);
    !granted_later && writers + readers > 0
}

fn prop_locks_are_fair(ops: Vec<LockOp>) -> bool {
    let cache = BlockCache::open(small_config()).unwrap();
    let blocks: Vec<BlockId> = (0..2).map(|_| fill(&cache, b"b")).collect();
    assert_eq!(blocks, vec![0, 1]);

    let mut requests: Vec<Request> = vec![];

    for op in ops {
        match op {
            LockOp::Acquire(block_id, access) => requests.push(Request {
                block_id,
                access,
                pending: Some(cache.acquire(block_id, access)),
                held: None,
                granted: false,
            }),
            LockOp::Release(i) => {
                let held: Vec<usize> = (0..requests.len())
                    .filter(|idx| requests[*idx].held.is_some())
                    .collect();
                if !held.is_empty() {
                    requests[held[i % held.len()]].held = None;
                }
            }
        }

        for request in &mut requests {
            if request.pending.as_ref().map(PendingAcquire::is_ready).unwrap_or(false)
            {
                let pending = request.pending.take().unwrap();
                request.held = Some(pending.wait().unwrap());
                request.granted = true;
            }
        }

        if !locks_are_fair(&requests, 0) || !locks_are_fair(&requests, 1) {
            return false;
        }
    }

    true
}

#[test]
fn quickcheck_locks_are_fair() {
    common::setup_logger();
    QuickCheck::new()
        .r#gen(Gen::new(100))
        .tests(50)
        .max_tests(200)
        .quickcheck(prop_locks_are_fair as fn(Vec<LockOp>) -> bool);
}
