//! In-memory implementation of [`Repo`].

use std::collections::{btree_map, BTreeMap};
use std::io;
use std::sync::{Arc, RwLock};

use super::{Catalog, Repo, SegmentRead, SegmentWrite};

type SharedLock<T> = Arc<RwLock<T>>;
type SharedRecords = SharedLock<Vec<Vec<u8>>>;

#[derive(Debug, Default)]
struct Inner {
    segments: BTreeMap<String, SharedRecords>,
    catalog: BTreeMap<u64, String>,
    checkpoints: BTreeMap<String, Vec<u8>>,
}

/// An in-memory [`Repo`].
///
/// Cloning shares the underlying store, so a writer and readers constructed
/// from clones observe each other the way processes sharing a log directory
/// do.
#[derive(Clone, Debug, Default)]
pub struct Memory(SharedLock<Inner>);

impl Memory {
    pub fn new() -> Self {
        Self::default()
    }
}

/// A segment table backed by a shared `Vec` of records.
#[derive(Clone, Debug)]
pub struct Segment {
    records: SharedRecords,
}

impl SegmentWrite for Segment {
    fn append(&mut self, payload: &[u8]) -> io::Result<u64> {
        if payload.is_empty() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "record payloads must be non-empty",
            ));
        }
        let mut records = self.records.write().unwrap();
        records.push(payload.to_vec());
        Ok(records.len() as u64)
    }

    fn len(&mut self) -> io::Result<u64> {
        Ok(self.records.read().unwrap().len() as u64)
    }

    fn fsync(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl SegmentRead for Segment {
    fn get(&mut self, entry: u64) -> io::Result<Option<Vec<u8>>> {
        let records = self.records.read().unwrap();
        Ok(entry
            .checked_sub(1)
            .and_then(|i| records.get(i as usize))
            .cloned())
    }

    fn len(&mut self) -> io::Result<u64> {
        Ok(self.records.read().unwrap().len() as u64)
    }
}

impl Repo for Memory {
    type SegmentWriter = Segment;
    type SegmentReader = Segment;

    fn create_segment(&self, id: u64, name: &str) -> io::Result<Self::SegmentWriter> {
        let mut inner = self.0.write().unwrap();
        if let Some(existing) = inner.catalog.get(&id) {
            if existing != name {
                return Err(io::Error::new(
                    io::ErrorKind::AlreadyExists,
                    format!("catalog id {id} is already bound to {existing}"),
                ));
            }
        }
        let records = match inner.segments.entry(name.to_owned()) {
            btree_map::Entry::Occupied(entry) => {
                let records = entry.get();
                if !records.read().unwrap().is_empty() {
                    return Err(io::Error::new(
                        io::ErrorKind::AlreadyExists,
                        format!("segment {name} already exists and is non-empty"),
                    ));
                }
                Arc::clone(records)
            }
            btree_map::Entry::Vacant(entry) => Arc::clone(entry.insert(Default::default())),
        };
        inner.catalog.insert(id, name.to_owned());
        Ok(Segment { records })
    }

    fn open_segment_writer(&self, name: &str) -> io::Result<Self::SegmentWriter> {
        self.open(name)
    }

    fn open_segment_reader(&self, name: &str) -> io::Result<Self::SegmentReader> {
        self.open(name)
    }

    fn remove_segment(&self, id: u64, name: &str) -> io::Result<()> {
        let mut inner = self.0.write().unwrap();
        if inner.catalog.remove(&id).is_none() {
            return Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("catalog has no segment {id}"),
            ));
        }
        inner.segments.remove(name);
        Ok(())
    }

    fn catalog(&self) -> io::Result<Catalog> {
        let inner = self.0.read().unwrap();
        Ok(Catalog::from_sorted(
            inner
                .catalog
                .iter()
                .map(|(&id, name)| (id, name.clone()))
                .collect(),
        ))
    }

    fn read_checkpoint(&self, name: &str) -> io::Result<Option<Vec<u8>>> {
        Ok(self.0.read().unwrap().checkpoints.get(name).cloned())
    }

    fn write_checkpoint(&self, name: &str, image: &[u8]) -> io::Result<()> {
        self.0
            .write()
            .unwrap()
            .checkpoints
            .insert(name.to_owned(), image.to_vec());
        Ok(())
    }

    fn checkpoints(&self) -> io::Result<Vec<(String, Vec<u8>)>> {
        Ok(self
            .0
            .read()
            .unwrap()
            .checkpoints
            .iter()
            .map(|(name, image)| (name.clone(), image.clone()))
            .collect())
    }
}

impl Memory {
    fn open(&self, name: &str) -> io::Result<Segment> {
        let inner = self.0.read().unwrap();
        let Some(records) = inner.segments.get(name) else {
            return Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("segment {name} does not exist"),
            ));
        };
        Ok(Segment {
            records: Arc::clone(records),
        })
    }
}
