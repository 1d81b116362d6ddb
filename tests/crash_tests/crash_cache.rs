use std::sync::Arc;

use logcache::{BlockCache, Error, FlushPolicy};

use super::*;

/// Every recovered block must decode, whatever the flusher managed to
/// write before the crash. Returns how many blocks exist.
fn verify_blocks(cache: &BlockCache) -> u64 {
    let mut present = 0;
    for block_id in 0..N_BLOCKS {
        match cache.read(block_id) {
            Ok(handle) => {
                decode(&handle);
                present += 1;
            }
            Err(Error::NotFound(_)) => {}
            Err(e) => panic!("failed to read block {}: {:?}", block_id, e),
        }
    }
    present
}

pub fn run_crash_cache() {
    let crash_during_initialization = rand::rng().random_ratio(1, 10);

    if crash_during_initialization {
        spawn_killah();
    }

    let config = crash_config(CACHE_DIR)
        .cache_capacity_bytes(8 * 256)
        .flush_every_ms(Some(1))
        .flush_policy(FlushPolicy::OldestFirst { max_batch: 4 });
    let cache = Arc::new(BlockCache::open(config).expect("couldn't open cache"));

    let present = verify_blocks(&cache);
    for _ in present..N_BLOCKS {
        match cache.allocate() {
            Ok(mut handle) => {
                assert!(handle.block_id() < N_BLOCKS);
                *handle.data_mut() = encode(0);
            }
            Err(e) => fail("allocate", e),
        }
    }

    if !crash_during_initialization {
        spawn_killah();
    }

    let writers: Vec<_> = (0..2)
        .map(|_| {
            let cache = cache.clone();
            std::thread::spawn(move || {
                let mut rng = rand::rng();
                loop {
                    let block_id = rng.random_range(0..N_BLOCKS);
                    let mut handle = match cache.write(block_id) {
                        Ok(handle) => handle,
                        Err(e) => fail("acquire", e),
                    };
                    let next = decode(&handle) + 1;
                    *handle.data_mut() = encode(next);
                }
            })
        })
        .collect();

    for writer in writers {
        if let Err(e) = writer.join() {
            fail("writer thread", e);
        }
    }
}
