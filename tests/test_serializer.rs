mod common;

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};

use quickcheck::{Arbitrary, Gen, QuickCheck};

use logcache::{
    Account, BatchOp, BlockId, Config, Error, LogSerializer, OneShot,
    SerializerState,
};

use common::{flip_byte, metablock_offsets, scribble, small_config};

fn value(block_id: BlockId, version: usize) -> Vec<u8> {
    format!("block {} version {}", block_id, version).into_bytes()
}

fn write_all(serializer: &LogSerializer, ids: impl Iterator<Item = BlockId>, version: usize) {
    let batch = ids.map(|id| BatchOp::Write(id, value(id, version))).collect();
    serializer.write_batch(batch).unwrap();
}

#[test]
fn writes_survive_reopen() {
    common::setup_logger();
    let config = small_config();

    let serializer = LogSerializer::open(config.clone()).unwrap();
    assert_eq!(serializer.state(), SerializerState::Ready);
    let ids: Vec<BlockId> =
        (0..10).map(|_| serializer.allocate_block_id().unwrap()).collect();
    assert_eq!(ids, (0..10).collect::<Vec<_>>());

    write_all(&serializer, ids.iter().copied(), 1);
    serializer.shutdown().unwrap();
    assert_eq!(serializer.state(), SerializerState::Closed);
    assert_eq!(
        serializer.write_batch(vec![BatchOp::Delete(0)]),
        Err(Error::ShutDown)
    );
    drop(serializer);

    let serializer = LogSerializer::open(config).unwrap();
    for id in &ids {
        assert_eq!(serializer.read(*id).unwrap(), value(*id, 1));
    }
    assert_eq!(serializer.allocate_block_id().unwrap(), 10);
}

#[test]
fn rewrites_never_reuse_the_old_slot() {
    common::setup_logger();
    let serializer = LogSerializer::open(small_config()).unwrap();

    write_all(&serializer, 0..1, 1);
    let (first, first_lsn) = serializer.location_of(0).unwrap();

    write_all(&serializer, 0..1, 2);
    let (second, second_lsn) = serializer.location_of(0).unwrap();

    assert_ne!(first, second);
    assert!(second_lsn > first_lsn);
    assert_eq!(serializer.read(0).unwrap(), value(0, 2));
}

#[test]
fn async_reads_complete_through_the_callback() {
    common::setup_logger();
    let serializer = LogSerializer::open(small_config()).unwrap();
    write_all(&serializer, 0..3, 7);

    let (filler, answer) = OneShot::pair();
    serializer.read_async(2, &Account::MAINTENANCE, move |res| filler.fill(res));
    assert_eq!(answer.wait().unwrap().unwrap(), value(2, 7));

    let (filler, answer) = OneShot::pair();
    serializer.read_async(99, &Account::DEFAULT, move |res| filler.fill(res));
    assert_eq!(answer.wait().unwrap(), Err(Error::NotFound(99)));
}

#[test]
fn deletes_remove_blocks_and_free_ids() {
    common::setup_logger();
    let config = small_config();
    let serializer = LogSerializer::open(config.clone()).unwrap();

    for _ in 0..4 {
        serializer.allocate_block_id().unwrap();
    }
    write_all(&serializer, 0..4, 1);
    serializer
        .write_batch(vec![BatchOp::Delete(1), BatchOp::Write(2, value(2, 2))])
        .unwrap();

    assert_eq!(serializer.read(1), Err(Error::NotFound(1)));
    assert!(!serializer.contains(1));
    assert_eq!(serializer.read(2).unwrap(), value(2, 2));

    #[cfg(not(feature = "monotonic-behavior"))]
    assert_eq!(serializer.allocate_block_id().unwrap(), 1);

    // not shut down, so the delete has to be found by replay
    drop(serializer);

    let serializer = LogSerializer::open(config).unwrap();
    assert_eq!(serializer.read(1), Err(Error::NotFound(1)));
    assert_eq!(serializer.read(2).unwrap(), value(2, 2));
    assert_eq!(serializer.read(3).unwrap(), value(3, 1));
}

#[test]
fn oversized_blocks_are_rejected() {
    common::setup_logger();
    let config = small_config();
    let serializer = LogSerializer::open(config.clone()).unwrap();

    let fits = vec![1_u8; config.max_payload()];
    serializer.write_batch(vec![BatchOp::Write(0, fits.clone())]).unwrap();
    assert_eq!(serializer.read(0).unwrap(), fits);

    let too_big = vec![1_u8; config.max_payload() + 1];
    let res = serializer.write_batch(vec![BatchOp::Write(0, too_big)]);
    assert!(matches!(res, Err(Error::Unsupported(_))));

    // the failed batch is not fatal
    write_all(&serializer, 1..2, 1);
}

#[test]
fn unclean_drop_recovers_every_acknowledged_write() {
    common::setup_logger();
    let config = small_config();

    let serializer = LogSerializer::open(config.clone()).unwrap();
    write_all(&serializer, 0..1, 1);
    serializer.checkpoint().unwrap();
    write_all(&serializer, 0..1, 2);
    drop(serializer);

    let serializer = LogSerializer::open(config).unwrap();
    assert_eq!(serializer.read(0).unwrap(), value(0, 2));
}

#[test]
fn torn_newest_record_leaves_the_previous_version() {
    common::setup_logger();
    let config = small_config();

    let serializer = LogSerializer::open(config.clone()).unwrap();
    write_all(&serializer, 0..1, 1);
    write_all(&serializer, 0..1, 2);
    let (newest, _) = serializer.location_of(0).unwrap();
    drop(serializer);

    let offset = newest.offset(config.extent_size, config.block_size);
    flip_byte(&config.path, offset + 40);

    let serializer = LogSerializer::open(config).unwrap();
    assert_eq!(serializer.read(0).unwrap(), value(0, 1));
}

#[test]
fn corrupt_newest_metablock_falls_back_to_its_predecessor() {
    common::setup_logger();
    let config = small_config();

    let serializer = LogSerializer::open(config.clone()).unwrap();
    write_all(&serializer, 0..20, 1);
    serializer.shutdown().unwrap();
    let generation = serializer.stats().metablock_generation;
    drop(serializer);

    let ring = metablock_offsets(&config);
    let newest = ring[(generation % ring.len() as u64) as usize];
    flip_byte(&config.path, newest + 20);

    let serializer = LogSerializer::open(config).unwrap();
    // the fallback replays everything the lost checkpoint covered, and
    // the fresh checkpoint written on open takes the next generation
    assert_eq!(serializer.stats().metablock_generation, generation);
    for id in 0..20 {
        assert_eq!(serializer.read(id).unwrap(), value(id, 1));
    }
}

#[test]
fn store_without_a_valid_metablock_is_unrecoverable() {
    common::setup_logger();
    let config = small_config();

    let serializer = LogSerializer::open(config.clone()).unwrap();
    write_all(&serializer, 0..4, 1);
    serializer.shutdown().unwrap();
    drop(serializer);

    let garbage = vec![0xAB_u8; config.device_block_size];
    for offset in metablock_offsets(&config) {
        scribble(&config.path, offset, &garbage);
    }

    match LogSerializer::open(config) {
        Err(Error::Unrecoverable(_)) => {}
        other => panic!("expected Unrecoverable, got {:?}", other.map(|_| ())),
    }
}

#[test]
fn mismatched_geometry_is_refused() {
    common::setup_logger();
    let config = small_config();
    drop(LogSerializer::open(config.clone()).unwrap());

    let bigger = config.clone().block_size(512);
    assert!(matches!(LogSerializer::open(bigger), Err(Error::Unsupported(_))));
}

#[test]
fn many_blocks_span_many_extents() {
    common::setup_logger();
    let config = small_config();

    let serializer = LogSerializer::open(config.clone()).unwrap();
    for chunk in 0..25_u64 {
        write_all(&serializer, chunk * 20..(chunk + 1) * 20, 1);
    }
    write_all(&serializer, (0..500).step_by(3), 2);

    let stats = serializer.stats();
    assert_eq!(stats.blocks, 500);
    assert!(stats.extents_opened > 30, "{:?}", stats);
    serializer.shutdown().unwrap();
    drop(serializer);

    let serializer = LogSerializer::open(config).unwrap();
    for id in 0..500 {
        let version = if id % 3 == 0 { 2 } else { 1 };
        assert_eq!(serializer.read(id).unwrap(), value(id, version));
    }
}

#[test]
fn garbage_collection_relocates_and_frees_sparse_extents() {
    common::setup_logger();
    let config = small_config().gc_threshold(0.2);
    let slots = config.slots_per_extent() as u64;
    assert_eq!(slots, 16);

    let serializer = LogSerializer::open(config.clone()).unwrap();
    for batch in 0..3 {
        write_all(&serializer, batch * slots..(batch + 1) * slots, 1);
    }
    let sparse: Vec<u64> =
        (0..3).map(|i| serializer.location_of(i * slots).unwrap().0.extent).collect();

    // leave two live blocks in each of the first three extents
    write_all(&serializer, (0..3 * slots).filter(|id| id % 8 != 0), 2);

    let relocated = serializer.collect_garbage().unwrap();
    assert_eq!(relocated, 6);
    assert_eq!(serializer.stats().pending_free_extents, 3);

    for id in 0..3 * slots {
        let (location, _) = serializer.location_of(id).unwrap();
        assert!(!sparse.contains(&location.extent), "block {} still at {}", id, location);
        let version = if id % 8 == 0 { 1 } else { 2 };
        assert_eq!(serializer.read(id).unwrap(), value(id, version));
    }

    serializer.checkpoint().unwrap();
    assert_eq!(serializer.stats().pending_free_extents, 0);
    assert_eq!(serializer.collect_garbage().unwrap(), 0);
    drop(serializer);

    let serializer = LogSerializer::open(config).unwrap();
    for id in 0..3 * slots {
        let version = if id % 8 == 0 { 1 } else { 2 };
        assert_eq!(serializer.read(id).unwrap(), value(id, version));
    }
}

#[test]
fn concurrent_batches_all_land() {
    common::setup_logger();
    let config = small_config();
    let serializer = LogSerializer::open(config.clone()).unwrap();

    std::thread::scope(|s| {
        for t in 0..4_u64 {
            let serializer = &serializer;
            s.spawn(move || {
                for version in 0..20 {
                    write_all(serializer, t * 10..t * 10 + 10, version);
                }
            });
        }
        s.spawn(|| {
            for _ in 0..5 {
                serializer.checkpoint().unwrap();
            }
        });
    });

    drop(serializer);
    let serializer = LogSerializer::open(config).unwrap();
    for id in 0..40 {
        assert_eq!(serializer.read(id).unwrap(), value(id, 19));
    }
}

#[test]
fn garbage_collection_races_writes_and_checkpoints() {
    common::setup_logger();
    let config = small_config().gc_threshold(0.9);
    let serializer = LogSerializer::open(config.clone()).unwrap();
    let writing = AtomicBool::new(true);
    let rounds = 200;

    std::thread::scope(|s| {
        s.spawn(|| {
            let mut relocated = 0;
            while writing.load(Ordering::Acquire) {
                relocated += serializer.collect_garbage().unwrap();
            }
            log::debug!("relocated {} blocks while racing writers", relocated);
        });
        s.spawn(|| {
            for version in 0..rounds {
                write_all(&serializer, 0..12, version);
                write_all(&serializer, 12..24, version);
                if version % 7 == 0 {
                    serializer.checkpoint().unwrap();
                }
            }
            writing.store(false, Ordering::Release);
        });
    });

    for id in 0..24 {
        assert_eq!(serializer.read(id).unwrap(), value(id, rounds - 1));
    }

    drop(serializer);
    let serializer = LogSerializer::open(config).unwrap();
    for id in 0..24 {
        assert_eq!(serializer.read(id).unwrap(), value(id, rounds - 1));
    }
}

#[derive(Debug, Clone)]
enum Op {
    Write(BlockId, u8),
    Delete(BlockId),
    Checkpoint,
    Gc,
    Restart,
    Crash,
}

impl Arbitrary for Op {
    fn arbitrary(g: &mut Gen) -> Op {
        let block_id = u64::from(u8::arbitrary(g) % 16);
        match u8::arbitrary(g) % 14 {
            0 => Op::Checkpoint,
            1 => Op::Restart,
            2 => Op::Crash,
            3 | 4 => Op::Delete(block_id),
            5 | 6 => Op::Gc,
            _ => Op::Write(block_id, u8::arbitrary(g)),
        }
    }
}

fn prop_matches_model(ops: Vec<Op>) -> bool {
    // collect anything that is not nearly full, so relocated copies
    // are regularly the ones that must survive a restart or crash
    let config: Config = small_config().gc_threshold(0.9);
    let mut serializer = LogSerializer::open(config.clone()).unwrap();
    let mut model: BTreeMap<BlockId, Vec<u8>> = BTreeMap::new();

    for op in ops {
        match op {
            Op::Write(block_id, byte) => {
                let data = vec![byte; usize::from(byte) % 100];
                serializer.write_batch(vec![BatchOp::Write(block_id, data.clone())]).unwrap();
                model.insert(block_id, data);
            }
            Op::Delete(block_id) => {
                serializer.write_batch(vec![BatchOp::Delete(block_id)]).unwrap();
                model.remove(&block_id);
            }
            Op::Checkpoint => serializer.checkpoint().unwrap(),
            Op::Gc => {
                serializer.collect_garbage().unwrap();
            }
            Op::Restart => {
                serializer.shutdown().unwrap();
                drop(serializer);
                serializer = LogSerializer::open(config.clone()).unwrap();
            }
            Op::Crash => {
                drop(serializer);
                serializer = LogSerializer::open(config.clone()).unwrap();
            }
        }
    }

    for block_id in 0..16 {
        let expected = model.get(&block_id).cloned().ok_or(Error::NotFound(block_id));
        if serializer.read(block_id) != expected {
            return false;
        }
    }
    true
}

#[test]
fn quickcheck_serializer_matches_model() {
    common::setup_logger();
    QuickCheck::new()
        .r#gen(Gen::new(100))
        .tests(30)
        .max_tests(100)
        .quickcheck(prop_matches_model as fn(Vec<Op>) -> bool);
}
