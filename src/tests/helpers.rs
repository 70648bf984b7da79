use crate::repo::Memory;
use crate::{Options, Reader, Writer};

/// A writer over a fresh in-memory repo, plus the repo for sharing with
/// readers.
pub fn mem_log(opts: Options) -> (Memory, Writer<Memory>) {
    let repo = Memory::new();
    let writer = Writer::with_repo(repo.clone(), opts).expect("open in-memory writer");
    (repo, writer)
}

pub fn fill(writer: &mut Writer<Memory>, records: usize) {
    for i in 0..records {
        writer
            .append(i.to_string().as_bytes())
            .expect("append payload");
    }
}

pub fn reader(repo: &Memory, checkpoint: &str) -> Reader<Memory> {
    Reader::with_repo(repo.clone(), checkpoint).expect("open in-memory reader")
}

pub fn enable_logging() {
    let _ = env_logger::builder()
        .filter_level(log::LevelFilter::Trace)
        .format_timestamp(None)
        .is_test(true)
        .try_init();
}
