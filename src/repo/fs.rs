//! Filesystem substrate: one directory holding the segment catalog, the
//! segment files, and one checkpoint file per named reader.
//!
//! Segment files are append-only. Each starts with a fixed header and holds
//! length-prefixed record frames, every frame trailed by a CRC32C; a frame
//! only becomes visible to readers once its checksum validates, so an append
//! in flight (or torn by a crash) is simply not yet part of the log.
//!
//! The catalog and the checkpoint files are replaced atomically: the new
//! contents go to a named temporary in the same directory and are renamed
//! into place, which is the commit point of every multi-step mutation.

use std::fs::{self, File};
use std::io::{self, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use log::{debug, warn};
use memmap2::Mmap;
use tempfile::NamedTempFile;

use super::{Catalog, Repo, SegmentRead, SegmentWrite};
use crate::error::Error;
use crate::parse_segment_name;

/// Name of the catalog file inside the log directory.
pub(crate) const CATALOG_FILE: &str = "logindex";
/// Prefix of per-reader checkpoint files.
pub(crate) const CHECKPOINT_PREFIX: &str = "checkpoint";

const SEGMENT_MAGIC: [u8; 6] = *b"binseg";
const CATALOG_MAGIC: [u8; 6] = *b"binidx";

const FORMAT_VERSION: u8 = 1;
const CHECKSUM_CRC32C: u8 = 0;

/// Magic, format version, checksum algorithm, two reserved bytes.
const HEADER_LEN: usize = SEGMENT_MAGIC.len() + 4;
/// Length prefix plus trailing checksum around every record frame.
const FRAME_OVERHEAD: usize = 8;

fn header(magic: &[u8; 6]) -> [u8; HEADER_LEN] {
    let mut buf = [0; HEADER_LEN];
    buf[..magic.len()].copy_from_slice(magic);
    buf[magic.len()] = FORMAT_VERSION;
    buf[magic.len() + 1] = CHECKSUM_CRC32C;
    buf
}

fn check_header(buf: &[u8], magic: &[u8; 6], what: &str) -> io::Result<()> {
    if buf.len() < HEADER_LEN || !buf.starts_with(magic) {
        return Err(invalid_data(format!("{what} does not start with magic")));
    }
    if buf[magic.len()] > FORMAT_VERSION {
        return Err(invalid_data(format!("unsupported {what} format version")));
    }
    if buf[magic.len() + 1] != CHECKSUM_CRC32C {
        return Err(invalid_data(format!("unsupported {what} checksum algorithm")));
    }
    Ok(())
}

fn invalid_data(msg: impl Into<String>) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, msg.into())
}

/// Table and checkpoint names live directly in the log directory.
fn validate_name(name: &str) -> io::Result<()> {
    if name.is_empty() || name.contains(['/', '\\', '\0']) {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("invalid table name: {name:?}"),
        ));
    }
    Ok(())
}

/// Filesystem [`Repo`] rooted at a log directory.
#[derive(Clone, Debug)]
pub struct Fs {
    root: PathBuf,
}

impl Fs {
    /// Open the log directory at `path`, creating it when `create` is true.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidArgument`] if `path` exists but is not a directory;
    /// [`Error::Missing`] if it does not exist and `create` is false.
    pub fn open(path: impl AsRef<Path>, create: bool) -> crate::Result<Self> {
        let root = path.as_ref().to_path_buf();
        match fs::metadata(&root) {
            Ok(meta) if meta.is_dir() => {}
            Ok(_) => {
                return Err(Error::InvalidArgument(format!(
                    "{} is not a directory",
                    root.display()
                )))
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                if !create {
                    return Err(Error::Missing { path: root });
                }
                fs::create_dir_all(&root)?;
            }
            Err(e) => return Err(e.into()),
        }
        Ok(Self { root })
    }

    /// The log directory.
    pub fn path(&self) -> &Path {
        &self.root
    }

    fn entry_path(&self, name: &str) -> PathBuf {
        self.root.join(name)
    }

    fn checkpoint_path(&self, name: &str) -> PathBuf {
        self.root.join(format!("{CHECKPOINT_PREFIX}.{name}"))
    }

    /// Remove segment files below the catalog minimum that the catalog no
    /// longer lists.
    ///
    /// Reclamation commits the catalog before unlinking the segment file; a
    /// crash in between leaves such an orphan behind.
    pub fn remove_unlisted_segments(&self) -> io::Result<Vec<String>> {
        let catalog = self.load_catalog()?;
        let Some(min) = catalog.min() else {
            return Ok(Vec::new());
        };
        let mut removed = Vec::new();
        for entry in fs::read_dir(&self.root)? {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            let name = entry.file_name();
            let Some(name) = name.to_str() else {
                continue;
            };
            let Some(id) = parse_segment_name(name) else {
                continue;
            };
            if id < min {
                fs::remove_file(entry.path())?;
                removed.push(name.to_owned());
            }
        }
        removed.sort();
        Ok(removed)
    }

    fn load_catalog(&self) -> io::Result<Catalog> {
        let bytes = match fs::read(self.entry_path(CATALOG_FILE)) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Catalog::default()),
            Err(e) => return Err(e),
        };
        check_header(&bytes, &CATALOG_MAGIC, "catalog")?;
        if bytes.len() < HEADER_LEN + 4 {
            return Err(invalid_data("catalog file truncated"));
        }
        let (body, crc) = bytes.split_at(bytes.len() - 4);
        let expected = u32::from_le_bytes(crc.try_into().expect("4 checksum bytes"));
        if crc32c::crc32c(body) != expected {
            return Err(invalid_data("catalog checksum mismatch"));
        }

        let mut entries = Vec::new();
        let mut rest = &body[HEADER_LEN..];
        while !rest.is_empty() {
            if rest.len() < 10 {
                return Err(invalid_data("catalog entry truncated"));
            }
            let id = u64::from_le_bytes(rest[..8].try_into().expect("8 bytes"));
            let name_len = u16::from_le_bytes(rest[8..10].try_into().expect("2 bytes")) as usize;
            rest = &rest[10..];
            if rest.len() < name_len {
                return Err(invalid_data("catalog entry truncated"));
            }
            let name = std::str::from_utf8(&rest[..name_len])
                .map_err(|_| invalid_data("catalog entry name is not utf-8"))?;
            if entries.last().is_some_and(|&(prev, _): &(u64, String)| prev >= id) {
                return Err(invalid_data("catalog entries are not ascending"));
            }
            entries.push((id, name.to_owned()));
            rest = &rest[name_len..];
        }
        Ok(Catalog::from_sorted(entries))
    }

    /// Atomically replace the catalog file. This is the commit point of
    /// segment creation and removal.
    fn store_catalog(&self, catalog: &Catalog) -> io::Result<()> {
        let mut buf = header(&CATALOG_MAGIC).to_vec();
        for (id, name) in catalog.iter() {
            let name_len =
                u16::try_from(name.len()).map_err(|_| invalid_data("segment name too long"))?;
            buf.extend_from_slice(&id.to_le_bytes());
            buf.extend_from_slice(&name_len.to_le_bytes());
            buf.extend_from_slice(name.as_bytes());
        }
        let crc = crc32c::crc32c(&buf);
        buf.extend_from_slice(&crc.to_le_bytes());
        self.persist(&buf, &self.entry_path(CATALOG_FILE))
    }

    fn persist(&self, contents: &[u8], target: &Path) -> io::Result<()> {
        let mut tmp = NamedTempFile::new_in(&self.root)?;
        tmp.write_all(contents)?;
        tmp.as_file_mut().sync_data()?;
        tmp.persist(target).map_err(|e| e.error)?;
        Ok(())
    }
}

impl Repo for Fs {
    type SegmentWriter = FsSegmentWriter;
    type SegmentReader = FsSegmentReader;

    fn create_segment(&self, id: u64, name: &str) -> io::Result<Self::SegmentWriter> {
        validate_name(name)?;
        let path = self.entry_path(name);
        if path.is_dir() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("{name} is a directory"),
            ));
        }
        let segment = match File::options()
            .read(true)
            .append(true)
            .create_new(true)
            .open(&path)
        {
            Ok(file) => FsSegmentWriter::create(file),
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                debug!("segment {name} already exists");
                // Adopt a record-less leftover of an interrupted creation;
                // anything holding records is a real conflict.
                let file = File::options().read(true).append(true).open(&path)?;
                if file.metadata()?.len() > HEADER_LEN as u64 {
                    return Err(io::Error::new(
                        io::ErrorKind::AlreadyExists,
                        format!("segment {name} already exists and is non-empty"),
                    ));
                }
                file.set_len(0)?;
                FsSegmentWriter::create(file)
            }
            Err(e) => return Err(e),
        }?;

        let mut catalog = self.load_catalog()?;
        match catalog.get(id) {
            Some(existing) if existing != name => {
                return Err(io::Error::new(
                    io::ErrorKind::AlreadyExists,
                    format!("catalog id {id} is already bound to {existing}"),
                ));
            }
            Some(_) => {}
            None => {
                catalog.insert(id, name.to_owned());
                self.store_catalog(&catalog)?;
            }
        }
        Ok(segment)
    }

    fn open_segment_writer(&self, name: &str) -> io::Result<Self::SegmentWriter> {
        validate_name(name)?;
        let path = self.entry_path(name);
        if path.is_dir() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("{name} is a directory"),
            ));
        }
        let file = File::options().read(true).append(true).open(&path)?;
        FsSegmentWriter::resume(file, &path)
    }

    fn open_segment_reader(&self, name: &str) -> io::Result<Self::SegmentReader> {
        validate_name(name)?;
        FsSegmentReader::open(&self.entry_path(name))
    }

    fn remove_segment(&self, id: u64, name: &str) -> io::Result<()> {
        let mut catalog = self.load_catalog()?;
        match catalog.remove(id) {
            None => {
                return Err(io::Error::new(
                    io::ErrorKind::NotFound,
                    format!("catalog has no segment {id}"),
                ))
            }
            Some(listed) if listed != name => {
                return Err(invalid_data(format!(
                    "catalog lists segment {id} as {listed}, not {name}"
                )))
            }
            Some(_) => {}
        }
        self.store_catalog(&catalog)?;
        if let Err(e) = fs::remove_file(self.entry_path(name)) {
            // The entry is gone either way; a missing file is a previously
            // interrupted removal.
            if e.kind() != io::ErrorKind::NotFound {
                return Err(e);
            }
            warn!("segment file {name} was already gone");
        }
        Ok(())
    }

    fn catalog(&self) -> io::Result<Catalog> {
        self.load_catalog()
    }

    fn read_checkpoint(&self, name: &str) -> io::Result<Option<Vec<u8>>> {
        validate_name(name)?;
        match fs::read(self.checkpoint_path(name)) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        }
    }

    fn write_checkpoint(&self, name: &str, image: &[u8]) -> io::Result<()> {
        validate_name(name)?;
        self.persist(image, &self.checkpoint_path(name))
    }

    fn checkpoints(&self) -> io::Result<Vec<(String, Vec<u8>)>> {
        let mut found = Vec::new();
        for entry in fs::read_dir(&self.root)? {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            let file_name = entry.file_name();
            let Some(file_name) = file_name.to_str() else {
                continue;
            };
            let Some(name) = file_name
                .strip_prefix(CHECKPOINT_PREFIX)
                .and_then(|rest| rest.strip_prefix('.'))
            else {
                continue;
            };
            found.push((name.to_owned(), fs::read(entry.path())?));
        }
        found.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(found)
    }
}

/// Append handle to one segment file.
#[derive(Debug)]
pub struct FsSegmentWriter {
    file: BufWriter<File>,
    records: u64,
}

impl FsSegmentWriter {
    fn create(mut file: File) -> io::Result<Self> {
        file.write_all(&header(&SEGMENT_MAGIC))?;
        file.sync_data()?;
        Ok(Self {
            file: BufWriter::new(file),
            records: 0,
        })
    }

    /// Recover the record count by scanning the frames, truncating a torn
    /// tail left behind by an interrupted append.
    fn resume(mut file: File, path: &Path) -> io::Result<Self> {
        let file_len = file.metadata()?.len();
        let mut hdr = [0u8; HEADER_LEN];
        file.read_exact(&mut hdr)
            .map_err(|_| invalid_data("segment shorter than its header"))?;
        check_header(&hdr, &SEGMENT_MAGIC, "segment")?;

        let mut reader = io::BufReader::new(file);
        let mut pos = HEADER_LEN as u64;
        let mut records = 0u64;
        let mut torn = false;
        loop {
            let remaining = file_len - pos;
            if remaining == 0 {
                break;
            }
            if remaining < FRAME_OVERHEAD as u64 + 1 {
                torn = true;
                break;
            }
            let mut frame = [0u8; 4];
            reader.read_exact(&mut frame)?;
            let len = u32::from_le_bytes(frame) as u64;
            if remaining < FRAME_OVERHEAD as u64 + len {
                torn = true;
                break;
            }
            let mut body = vec![0u8; len as usize];
            reader.read_exact(&mut body)?;
            let mut crc_buf = [0u8; 4];
            reader.read_exact(&mut crc_buf)?;
            let crc = crc32c::crc32c_append(crc32c::crc32c(&frame), &body);
            if crc != u32::from_le_bytes(crc_buf) {
                torn = true;
                break;
            }
            pos += FRAME_OVERHEAD as u64 + len;
            records += 1;
        }

        let file = reader.into_inner();
        if torn {
            warn!(
                "truncating torn frame at {pos} in {} ({records} records kept)",
                path.display()
            );
            file.set_len(pos)?;
            file.sync_data()?;
        }
        Ok(Self {
            file: BufWriter::new(file),
            records,
        })
    }
}

impl SegmentWrite for FsSegmentWriter {
    fn append(&mut self, payload: &[u8]) -> io::Result<u64> {
        if payload.is_empty() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "record payloads must be non-empty",
            ));
        }
        let len = u32::try_from(payload.len())
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "record payload too large"))?;
        let prefix = len.to_le_bytes();
        let crc = crc32c::crc32c_append(crc32c::crc32c(&prefix), payload);
        self.file.write_all(&prefix)?;
        self.file.write_all(payload)?;
        self.file.write_all(&crc.to_le_bytes())?;
        // Readers only trust the frame once the checksum is in place, so a
        // partially flushed frame stays invisible.
        self.file.flush()?;
        self.records += 1;
        Ok(self.records)
    }

    fn len(&mut self) -> io::Result<u64> {
        Ok(self.records)
    }

    fn fsync(&mut self) -> io::Result<()> {
        self.file.flush()?;
        self.file.get_mut().sync_data()
    }
}

/// Read handle to one segment file, memory-mapped.
///
/// Frames are scanned lazily and the mapping is refreshed when the file has
/// grown. A frame that ends past the mapping or fails its checksum at the
/// very end of the file is not an error: it is an append that has not
/// become visible yet.
#[derive(Debug)]
pub struct FsSegmentReader {
    file: File,
    map: Mmap,
    /// Payload `(offset, len)` of every frame scanned so far.
    frames: Vec<(usize, usize)>,
    /// File offset scanning resumes from.
    scanned: usize,
}

impl FsSegmentReader {
    fn open(path: &Path) -> io::Result<Self> {
        let file = File::open(path)?;
        if file.metadata()?.is_dir() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("{} is a directory", path.display()),
            ));
        }
        if file.metadata()?.len() < HEADER_LEN as u64 {
            return Err(invalid_data("segment shorter than its header"));
        }
        // SAFETY: segment files are append-only; bytes before `scanned` are
        // never rewritten, and frames are only trusted after their checksum
        // validates.
        let map = unsafe { Mmap::map(&file)? };
        check_header(&map[..HEADER_LEN], &SEGMENT_MAGIC, "segment")?;
        Ok(Self {
            file,
            map,
            frames: Vec::new(),
            scanned: HEADER_LEN,
        })
    }

    /// Scan one more frame, remapping first if the file has grown.
    fn extend(&mut self) -> io::Result<bool> {
        if self.try_parse()? {
            return Ok(true);
        }
        let len = self.file.metadata()?.len();
        if len <= self.map.len() as u64 {
            return Ok(false);
        }
        // SAFETY: see `open`.
        self.map = unsafe { Mmap::map(&self.file)? };
        self.try_parse()
    }

    fn try_parse(&mut self) -> io::Result<bool> {
        let data = &self.map[..];
        let pos = self.scanned;
        if pos + 4 > data.len() {
            return Ok(false);
        }
        let len = u32::from_le_bytes(data[pos..pos + 4].try_into().expect("4 bytes")) as usize;
        let end = pos + FRAME_OVERHEAD + len;
        if end > data.len() {
            return Ok(false);
        }
        let crc = u32::from_le_bytes(data[end - 4..end].try_into().expect("4 bytes"));
        if crc32c::crc32c(&data[pos..end - 4]) != crc {
            if end < data.len() {
                // Not the tail frame, so this cannot be an append in flight.
                return Err(invalid_data(format!(
                    "segment frame at offset {pos} fails its checksum"
                )));
            }
            return Ok(false);
        }
        self.frames.push((pos + 4, len));
        self.scanned = end;
        Ok(true)
    }
}

impl SegmentRead for FsSegmentReader {
    fn get(&mut self, entry: u64) -> io::Result<Option<Vec<u8>>> {
        if entry == 0 {
            return Ok(None);
        }
        while (self.frames.len() as u64) < entry {
            if !self.extend()? {
                return Ok(None);
            }
        }
        let (offset, len) = self.frames[entry as usize - 1];
        Ok(Some(self.map[offset..offset + len].to_vec()))
    }

    fn len(&mut self) -> io::Result<u64> {
        while self.extend()? {}
        Ok(self.frames.len() as u64)
    }
}
