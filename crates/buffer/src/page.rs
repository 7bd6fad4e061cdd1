//! A single append-only Buffer page (spec §4.1).
//!
//! A page is a file holding a contiguous run of length-prefixed `Write`
//! frames, each checksummed with CRC32, plus an in-memory set that
//! accelerates negative `(record, key, value)` lookups without touching
//! disk. Pages are named by monotonic creation index so startup reload is
//! deterministic (spec §6 on-disk layout: `page0000N`).

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use concourse_core::{Action, RecordId, Value, Write as CWrite};
use crc32fast::Hasher;
use std::collections::HashSet;
use std::fs::{File, OpenOptions};
use std::io::{self, BufReader, Read, Seek, SeekFrom, Write as IoWrite};
use std::path::{Path, PathBuf};

/// Magic bytes identifying a Concourse buffer page file.
pub const PAGE_MAGIC: [u8; 4] = *b"CCPG";
/// Current page format version.
pub const PAGE_FORMAT_VERSION: u32 = 1;
/// Size of the page header in bytes: magic(4) + version(4) + page number(8)
/// + system id(16).
pub const PAGE_HEADER_SIZE: usize = 32;

/// One accelerator entry: the field and encoded value a frame wrote.
type AccelKey = (RecordId, String, Vec<u8>);

/// A mutable (until sealed) append-only page of `Write` frames.
pub struct Page {
    file: File,
    path: PathBuf,
    page_number: u64,
    write_position: u64,
    sealed: bool,
    system_id: [u8; 16],
    accel: HashSet<AccelKey>,
    write_count: usize,
    last_version: u64,
}

impl Page {
    /// The deterministic file name for page number `n`.
    pub fn file_name(page_number: u64) -> String {
        format!("page{:020}", page_number)
    }

    fn path_for(dir: &Path, page_number: u64) -> PathBuf {
        dir.join(Self::file_name(page_number))
    }

    /// Create a brand new, empty page file.
    pub fn create(dir: &Path, page_number: u64, system_id: [u8; 16]) -> io::Result<Self> {
        let path = Self::path_for(dir, page_number);
        let mut file = OpenOptions::new()
            .create_new(true)
            .read(true)
            .write(true)
            .open(&path)?;
        let mut header = Vec::with_capacity(PAGE_HEADER_SIZE);
        header.extend_from_slice(&PAGE_MAGIC);
        header.write_u32::<BigEndian>(PAGE_FORMAT_VERSION)?;
        header.write_u64::<BigEndian>(page_number)?;
        header.extend_from_slice(&system_id);
        file.write_all(&header)?;
        Ok(Page {
            file,
            path,
            page_number,
            write_position: PAGE_HEADER_SIZE as u64,
            sealed: false,
            system_id,
            accel: HashSet::new(),
            write_count: 0,
            last_version: 0,
        })
    }

    /// Reopen an existing page file for appending, replaying its frames to
    /// rebuild the in-memory accelerator.
    pub fn open(dir: &Path, page_number: u64) -> io::Result<(Self, Vec<CWrite>)> {
        let path = Self::path_for(dir, page_number);
        let mut file = OpenOptions::new().read(true).write(true).open(&path)?;
        let mut header = [0u8; PAGE_HEADER_SIZE];
        file.read_exact(&mut header)?;
        if header[0..4] != PAGE_MAGIC {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("page {} has invalid magic bytes", path.display()),
            ));
        }
        let mut system_id = [0u8; 16];
        system_id.copy_from_slice(&header[16..32]);

        let mut page = Page {
            file,
            path,
            page_number,
            write_position: PAGE_HEADER_SIZE as u64,
            sealed: false,
            system_id,
            accel: HashSet::new(),
            write_count: 0,
            last_version: 0,
        };
        let writes = page.replay()?;
        Ok((page, writes))
    }

    /// Re-read every frame from disk, rebuilding `accel`/`write_count` and
    /// returning the decoded writes in file order. Frames that fail CRC
    /// validation are treated as a truncated tail (crash during append) and
    /// stop replay there, per the Buffer's durability contract — only
    /// fsync'd frames are guaranteed intact (spec §3 invariant 6).
    fn replay(&mut self) -> io::Result<Vec<CWrite>> {
        self.file.seek(SeekFrom::Start(PAGE_HEADER_SIZE as u64))?;
        let mut reader = BufReader::new(&self.file);
        let mut writes = Vec::new();
        let mut pos = PAGE_HEADER_SIZE as u64;
        loop {
            match read_frame(&mut reader) {
                Ok(Some(write)) => {
                    let encoded_len = frame_len(&write);
                    pos += encoded_len as u64;
                    self.note_write(&write);
                    writes.push(write);
                }
                Ok(None) => break,
                Err(_) => break,
            }
        }
        self.write_position = pos;
        self.file.seek(SeekFrom::Start(self.write_position))?;
        // Truncate any partial trailing frame so subsequent appends don't
        // leave a corrupt gap in the middle of the file.
        self.file.set_len(self.write_position)?;
        Ok(writes)
    }

    fn note_write(&mut self, write: &CWrite) {
        self.accel
            .insert((write.record, write.key.clone(), write.value.encode()));
        self.write_count += 1;
        self.last_version = self.last_version.max(write.version);
    }

    /// Append `write` as a new frame. Returns the byte size written.
    /// Durability: the frame is always written to the OS page cache; an
    /// explicit fsync only happens when `sync` is true (spec §4.1
    /// group-sync) or via a later call to [`Page::sync`].
    pub fn append(&mut self, write: &CWrite, sync: bool) -> io::Result<usize> {
        if self.sealed {
            return Err(io::Error::new(
                io::ErrorKind::Other,
                "cannot append to a sealed page",
            ));
        }
        self.file.seek(SeekFrom::Start(self.write_position))?;
        let bytes = encode_frame(write);
        self.file.write_all(&bytes)?;
        if sync {
            self.file.sync_data()?;
        }
        self.write_position += bytes.len() as u64;
        self.note_write(write);
        Ok(bytes.len())
    }

    /// Force all pending frames to stable storage.
    pub fn sync(&mut self) -> io::Result<()> {
        self.file.sync_data()
    }

    /// Current file size in bytes, including the header.
    pub fn size(&self) -> u64 {
        self.write_position
    }

    /// Whether appending one more frame of `estimated_len` bytes would
    /// overflow `capacity`.
    pub fn would_overflow(&self, estimated_len: usize, capacity: usize) -> bool {
        self.write_position as usize + estimated_len > capacity
    }

    /// Mark this page read-only. A sealed page is eligible for transport
    /// (spec §3 lifecycle).
    pub fn seal(&mut self) {
        self.sealed = true;
    }

    /// Whether this page has been sealed.
    pub fn is_sealed(&self) -> bool {
        self.sealed
    }

    /// The page's monotonic creation index.
    pub fn page_number(&self) -> u64 {
        self.page_number
    }

    /// The page file's path on disk.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The system id this page was created under.
    pub fn system_id(&self) -> [u8; 16] {
        self.system_id
    }

    /// Number of writes currently recorded in this page.
    pub fn write_count(&self) -> usize {
        self.write_count
    }

    /// Highest version seen in this page, 0 if empty.
    pub fn last_version(&self) -> u64 {
        self.last_version
    }

    /// Fast negative membership test: if this returns `false`, `value` is
    /// definitely not present for `(record, key)` in this page. A `true`
    /// result means the caller must scan to confirm (accelerator is exact
    /// here, but callers should not rely on that — see spec §4.1).
    pub fn might_contain(&self, record: RecordId, key: &str, value: &Value) -> bool {
        self.accel
            .contains(&(record, key.to_string(), value.encode()))
    }

    /// Delete the underlying page file. Used by the transporter once every
    /// write in this page has been durably indexed into the Database
    /// (spec §4.7 step 4).
    pub fn remove_file(self) -> io::Result<()> {
        std::fs::remove_file(&self.path)
    }

    /// Scan every write currently in this page, in append order.
    pub fn scan(&mut self) -> io::Result<Vec<CWrite>> {
        self.file.seek(SeekFrom::Start(PAGE_HEADER_SIZE as u64))?;
        let mut reader = BufReader::new(&self.file);
        let mut writes = Vec::with_capacity(self.write_count);
        while let Some(write) = read_frame(&mut reader)? {
            writes.push(write);
        }
        self.file.seek(SeekFrom::Start(self.write_position))?;
        Ok(writes)
    }
}

fn frame_len(write: &CWrite) -> usize {
    encode_frame(write).len()
}

/// The exact on-disk size a frame for `write` would occupy, used by the
/// Buffer to decide whether a page needs to rotate before appending.
pub fn estimated_frame_len(write: &CWrite) -> usize {
    encode_frame(write).len()
}

/// Frame layout: `len:u32 | action:u8 | record:u64 | version:u64 |
/// key_len:u16 | key bytes | value bytes | crc32:u32`. `len` covers
/// everything between itself and the CRC, exclusive of both.
fn encode_frame(write: &CWrite) -> Vec<u8> {
    let mut payload = Vec::new();
    payload
        .write_u8(match write.action {
            Action::Add => 0,
            Action::Remove => 1,
        })
        .unwrap();
    payload.write_u64::<BigEndian>(write.record).unwrap();
    payload.write_u64::<BigEndian>(write.version).unwrap();
    let key_bytes = write.key.as_bytes();
    payload
        .write_u16::<BigEndian>(key_bytes.len() as u16)
        .unwrap();
    payload.extend_from_slice(key_bytes);
    payload.extend_from_slice(&write.value.encode());

    let mut hasher = Hasher::new();
    hasher.update(&payload);
    let crc = hasher.finalize();

    let mut frame = Vec::with_capacity(4 + payload.len() + 4);
    frame
        .write_u32::<BigEndian>(payload.len() as u32)
        .unwrap();
    frame.extend_from_slice(&payload);
    frame.write_u32::<BigEndian>(crc).unwrap();
    frame
}

fn read_frame<R: Read>(reader: &mut R) -> io::Result<Option<CWrite>> {
    let len = match reader.read_u32::<BigEndian>() {
        Ok(len) => len,
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e),
    };
    let mut payload = vec![0u8; len as usize];
    if reader.read_exact(&mut payload).is_err() {
        return Ok(None);
    }
    let expected_crc = match reader.read_u32::<BigEndian>() {
        Ok(crc) => crc,
        Err(_) => return Ok(None),
    };
    let mut hasher = Hasher::new();
    hasher.update(&payload);
    if hasher.finalize() != expected_crc {
        return Ok(None);
    }

    let mut cursor = &payload[..];
    let action = match cursor.read_u8()? {
        0 => Action::Add,
        1 => Action::Remove,
        _ => return Ok(None),
    };
    let record = cursor.read_u64::<BigEndian>()?;
    let version = cursor.read_u64::<BigEndian>()?;
    let key_len = cursor.read_u16::<BigEndian>()? as usize;
    if cursor.len() < key_len {
        return Ok(None);
    }
    let key = String::from_utf8_lossy(&cursor[..key_len]).into_owned();
    cursor = &cursor[key_len..];
    let value = match Value::decode(cursor) {
        Some(v) => v,
        None => return Ok(None),
    };

    Ok(Some(CWrite {
        action,
        key,
        value,
        record,
        version,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn w(record: RecordId, key: &str, value: Value, version: u64) -> CWrite {
        CWrite::add(key, value, record, version)
    }

    #[test]
    fn create_append_and_reopen_round_trips() {
        let dir = tempdir().unwrap();
        let sid = [7u8; 16];
        let mut page = Page::create(dir.path(), 0, sid).unwrap();
        let writes = vec![
            w(1, "name", Value::String("jeff".into()), 10),
            w(1, "age", Value::Integer(30), 11),
        ];
        for write in &writes {
            page.append(write, true).unwrap();
        }
        assert_eq!(page.write_count(), 2);
        assert!(page.might_contain(1, "name", &Value::String("jeff".into())));
        assert!(!page.might_contain(1, "name", &Value::String("nope".into())));

        drop(page);
        let (reopened, replayed) = Page::open(dir.path(), 0).unwrap();
        assert_eq!(replayed, writes);
        assert_eq!(reopened.write_count(), 2);
        assert_eq!(reopened.last_version(), 11);
    }

    #[test]
    fn truncated_trailing_frame_is_dropped_on_replay() {
        let dir = tempdir().unwrap();
        let sid = [1u8; 16];
        {
            let mut page = Page::create(dir.path(), 0, sid).unwrap();
            page.append(&w(1, "a", Value::Integer(1), 1), true).unwrap();
        }
        // Corrupt: append a few garbage bytes simulating a torn write.
        {
            use std::fs::OpenOptions;
            let path = Page::path_for(dir.path(), 0);
            let mut f = OpenOptions::new().append(true).open(&path).unwrap();
            f.write_all(&[1, 2, 3]).unwrap();
        }
        let (page, writes) = Page::open(dir.path(), 0).unwrap();
        assert_eq!(writes.len(), 1);
        assert_eq!(page.write_count(), 1);
    }

    #[test]
    fn file_name_is_zero_padded_and_monotonic() {
        assert_eq!(Page::file_name(0), "page00000000000000000000");
        assert!(Page::file_name(1) > Page::file_name(0));
        assert!(Page::file_name(10) > Page::file_name(9));
    }
}
