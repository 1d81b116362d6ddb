use std::fs::OpenOptions;
use std::os::unix::fs::FileExt;
use std::path::Path;

use logcache::{Config, MB_EXTENT_SEPARATION, MB_NEXTENTS};

pub fn setup_logger() {
    use std::io::Write;

    fn tn() -> String {
        std::thread::current().name().unwrap_or("unknown").to_owned()
    }

    let mut builder = env_logger::Builder::new();
    builder
        .format(|buf, record| {
            writeln!(
                buf,
                "{:05} {:20} {:10} {}",
                record.level(),
                tn(),
                record.module_path().unwrap().split("::").last().unwrap(),
                record.args()
            )
        })
        .filter(None, log::LevelFilter::Info);

    if let Ok(env) = std::env::var("RUST_LOG") {
        builder.parse_filters(&env);
    }

    let _r = builder.try_init();
}

#[allow(dead_code)]
pub fn cleanup(dir: &str) {
    let dir = std::path::Path::new(dir);
    if dir.exists() {
        std::fs::remove_dir_all(dir).unwrap();
    }
}

/// A temporary store with tiny slots and extents, so that a handful of
/// writes spans many extents.
#[allow(dead_code)]
pub fn small_config() -> Config {
    Config::new()
        .temporary(true)
        .device_block_size(512)
        .block_size(256)
        .extent_size(4096)
        .flush_every_ms(None)
        .checkpoint_interval(1_000)
}

/// The byte offsets of the metablock ring, in ring order.
#[allow(dead_code)]
pub fn metablock_offsets(config: &Config) -> Vec<u64> {
    let per_extent = config.extent_size / config.device_block_size;
    let mut offsets = vec![];
    for i in 0..MB_NEXTENTS {
        let start = i * MB_EXTENT_SEPARATION * config.extent_size as u64;
        for j in 0..per_extent {
            let offset = start + (j * config.device_block_size) as u64;
            if offset != 0 {
                offsets.push(offset);
            }
        }
    }
    offsets
}

/// Overwrites `bytes` at `offset` of the log file of a closed store.
#[allow(dead_code)]
pub fn scribble(path: &Path, offset: u64, bytes: &[u8]) {
    let file =
        OpenOptions::new().read(true).write(true).open(path.join("data")).unwrap();
    file.write_all_at(bytes, offset).unwrap();
    file.sync_all().unwrap();
}

/// Flips one byte at `offset` of the log file of a closed store.
#[allow(dead_code)]
pub fn flip_byte(path: &Path, offset: u64) {
    let file =
        OpenOptions::new().read(true).write(true).open(path.join("data")).unwrap();
    let mut buf = [0_u8; 1];
    file.read_exact_at(&mut buf, offset).unwrap();
    buf[0] ^= 0xFF;
    file.write_all_at(&buf, offset).unwrap();
    file.sync_all().unwrap();
}
