use std::process::exit;
use std::thread;
use std::time::Duration;

use rand::Rng;

use logcache::Config;

mod crash_cache;
mod crash_sequential_writes;

pub use crash_cache::run_crash_cache;
pub use crash_sequential_writes::run_crash_sequential_writes;

// test names, also used as dir names
pub const SEQUENTIAL_WRITES_DIR: &str = "crash_sequential_writes";
pub const CACHE_DIR: &str = "crash_cache";

const N_BLOCKS: u64 = 24;

fn spawn_killah() {
    thread::spawn(|| {
        let runtime = rand::rng().random_range(0..60_000);
        thread::sleep(Duration::from_micros(runtime));
        exit(9);
    });
}

/// Tiny slots and extents, so a short run rolls over many extents and
/// metablock slots.
fn crash_config(dir: &str) -> Config {
    Config::new()
        .path(dir)
        .device_block_size(512)
        .block_size(256)
        .extent_size(4096)
        .checkpoint_interval(32)
        .gc_threshold(0.5)
}

/// A value that can only be decoded if it was written completely: the
/// counter is followed by a length and a pattern derived from it.
fn encode(counter: u32) -> Vec<u8> {
    let pad = (counter % 97) as usize;
    let mut buf = counter.to_be_bytes().to_vec();
    buf.push(pad as u8);
    buf.extend(std::iter::repeat((counter % 251) as u8).take(pad));
    buf
}

fn decode(buf: &[u8]) -> u32 {
    assert!(buf.len() >= 5, "value of {} bytes is too short", buf.len());
    let counter = u32::from_be_bytes(buf[..4].try_into().unwrap());
    assert_eq!(buf, &encode(counter)[..], "value for counter {} is garbled", counter);
    counter
}

fn fail(what: &str, e: impl std::fmt::Debug) -> ! {
    eprintln!("{} failed: {:?}", what, e);
    exit(15);
}
