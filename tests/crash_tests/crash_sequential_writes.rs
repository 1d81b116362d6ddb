use std::sync::Arc;

use logcache::{BatchOp, Error, LogSerializer};

use super::*;

/// Every acknowledged write is durable and writes happen one at a
/// time, so the recovered blocks must match some prefix of the write
/// sequence. Write `i` goes to block `i % N_BLOCKS`. Returns the
/// counter to continue with.
fn verify_prefix(serializer: &LogSerializer) -> u32 {
    let values: Vec<Option<u32>> = (0..N_BLOCKS)
        .map(|block_id| match serializer.read(block_id) {
            Ok(buf) => Some(decode(&buf)),
            Err(Error::NotFound(_)) => None,
            Err(e) => panic!("failed to read block {}: {:?}", block_id, e),
        })
        .collect();

    let Some(max) = values.iter().flatten().max().copied() else {
        return 0;
    };
    let end = max + 1;
    let n = N_BLOCKS as u32;

    for (block_id, value) in values.iter().enumerate() {
        let block_id = block_id as u32;
        let expected = if block_id < end {
            Some(block_id + (end - 1 - block_id) / n * n)
        } else {
            None
        };
        assert_eq!(
            *value, expected,
            "block {} does not match the write prefix ending at {}: {:?}",
            block_id, max, values
        );
    }

    end
}

pub fn run_crash_sequential_writes() {
    let crash_during_initialization = rand::rng().random_ratio(1, 10);

    if crash_during_initialization {
        spawn_killah();
    }

    let serializer = Arc::new(
        LogSerializer::open(crash_config(SEQUENTIAL_WRITES_DIR))
            .expect("couldn't open serializer"),
    );

    let mut counter = verify_prefix(&serializer);

    if !crash_during_initialization {
        spawn_killah();
    }

    let maintenance = serializer.clone();
    std::thread::spawn(move || {
        loop {
            if let Err(e) = maintenance.collect_garbage() {
                fail("garbage collection", e);
            }
            if let Err(e) = maintenance.checkpoint() {
                fail("checkpoint", e);
            }
            std::thread::sleep(std::time::Duration::from_millis(1));
        }
    });

    loop {
        let block_id = u64::from(counter) % N_BLOCKS;
        if let Err(e) =
            serializer.write_batch(vec![BatchOp::Write(block_id, encode(counter))])
        {
            fail("write", e);
        }
        counter += 1;
    }
}
