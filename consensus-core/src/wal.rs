//! Crash-recovery write-ahead log.
//!
//! An append-only log of CRC-checksummed frames spread over numbered files
//! `<prefix>_<index>`. A background housekeeping thread rotates the tail
//! file past its size limit, deletes the oldest files past the total limit,
//! and syncs data that has been buffered for too long. A reader presents
//! head..tail as one stream; a torn final frame is repaired by truncating
//! at the last valid offset.
//!
//! Frame layout: `crc32c(payload) BE32 || len BE32 || payload`.

use {
    crossbeam_channel::{bounded, select, tick, Sender},
    log::{debug, error, warn},
    serde::{de::DeserializeOwned, Serialize},
    std::{
        fs::{self, File, OpenOptions},
        io::{self, BufReader, Read, Write},
        path::{Path, PathBuf},
        sync::{Arc, Mutex},
        thread::JoinHandle,
        time::{Duration, Instant},
    },
    thiserror::Error,
};

const HEADER_LEN: usize = 8;
const WAL_BUF_SIZE: usize = 4 * 1024;

/// Stream prefixes used by the consensus state machine.
pub const ROUND_WAL: &str = "round";
pub const LOCK_WAL: &str = "lock";
pub const COMMIT_WAL: &str = "commit";

#[derive(Debug, Clone)]
pub struct WalConfig {
    /// Rotate the tail file once it grows past this many bytes.
    pub file_limit: u64,
    /// Delete the oldest files while the stream exceeds this many bytes.
    pub total_limit: u64,
    pub housekeeping_interval: Duration,
    pub sync_interval: Duration,
}

impl Default for WalConfig {
    fn default() -> Self {
        Self {
            file_limit: 2 * 1024 * 1024,
            total_limit: 8 * 1024 * 1024,
            housekeeping_interval: Duration::from_secs(1),
            sync_interval: Duration::from_secs(1),
        }
    }
}

#[derive(Debug, Error)]
pub enum WalError {
    #[error("wal io error: {0}")]
    Io(#[from] io::Error),
    #[error("wal encode error: {0}")]
    Codec(#[from] bincode::Error),
    #[error("end of wal")]
    Eof,
    #[error("torn frame at end of wal")]
    UnexpectedEof,
    #[error("corrupted wal frame (crc mismatch)")]
    Corrupted,
}

impl WalError {
    /// True for the torn-tail conditions `close_and_repair` fixes.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, WalError::UnexpectedEof | WalError::Corrupted)
    }
}

#[derive(Debug, Clone, Default)]
struct WalInfo {
    head_idx: u64,
    tail_idx: u64,
    total_size: u64,
    tail_size: u64,
    file_sizes: Vec<u64>,
}

fn file_for(id: &Path, idx: u64) -> PathBuf {
    let mut name = id
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    name.push('_');
    name.push_str(&idx.to_string());
    id.with_file_name(name)
}

fn read_wal_info(id: &Path) -> io::Result<WalInfo> {
    let dir = id.parent().unwrap_or_else(|| Path::new("."));
    let prefix = format!(
        "{}_",
        id.file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    );

    let mut min_idx = u64::MAX;
    let mut max_idx = 0u64;
    let mut total_size = 0u64;
    let mut tail_size = 0u64;
    let mut sizes = std::collections::HashMap::new();

    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().into_owned();
        let Some(idx_str) = name.strip_prefix(&prefix) else {
            continue;
        };
        let Ok(idx) = idx_str.parse::<u64>() else {
            continue;
        };
        let size = entry.metadata()?.len();
        total_size += size;
        sizes.insert(idx, size);
        if max_idx == 0 || idx > max_idx {
            max_idx = idx;
            tail_size = size;
        }
        if idx < min_idx {
            min_idx = idx;
        }
    }

    if min_idx == u64::MAX {
        // Empty stream: the writer starts at index 0.
        return Ok(WalInfo::default());
    }
    let file_sizes = (min_idx..=max_idx)
        .map(|i| sizes.get(&i).copied().unwrap_or(0))
        .collect();
    Ok(WalInfo {
        head_idx: min_idx,
        tail_idx: max_idx,
        total_size,
        tail_size,
        file_sizes,
    })
}

#[cfg(unix)]
fn restrict_file_mode(file: &File) -> io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    file.set_permissions(fs::Permissions::from_mode(0o600))
}

#[cfg(not(unix))]
fn restrict_file_mode(_file: &File) -> io::Result<()> {
    Ok(())
}

#[cfg(unix)]
fn create_wal_dir(dir: &Path) -> io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::create_dir_all(dir)?;
    fs::set_permissions(dir, fs::Permissions::from_mode(0o700))
}

#[cfg(not(unix))]
fn create_wal_dir(dir: &Path) -> io::Result<()> {
    fs::create_dir_all(dir)
}

fn open_tail(id: &Path, idx: u64) -> io::Result<File> {
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(file_for(id, idx))?;
    restrict_file_mode(&file)?;
    Ok(file)
}

struct WriterInner {
    id: PathBuf,
    cfg: WalConfig,
    buf: Vec<u8>,
    tail: File,
    tail_idx: u64,
    tail_size: u64,
    eldest_unsynced: Option<Instant>,
}

impl WriterInner {
    fn flush_buf(&mut self) -> io::Result<()> {
        if !self.buf.is_empty() {
            self.tail.write_all(&self.buf)?;
            self.tail_size += self.buf.len() as u64;
            self.buf.clear();
        }
        Ok(())
    }

    fn sync(&mut self) -> io::Result<()> {
        self.flush_buf()?;
        self.tail.sync_all()?;
        self.eldest_unsynced = None;
        Ok(())
    }

    fn shift(&mut self) -> io::Result<()> {
        self.sync()?;
        self.tail = open_tail(&self.id, self.tail_idx + 1)?;
        self.tail_idx += 1;
        self.tail_size = 0;
        Ok(())
    }

    fn housekeep(&mut self) -> io::Result<()> {
        if self.tail_size + self.buf.len() as u64 > self.cfg.file_limit {
            self.shift()?;
        } else if let Some(eldest) = self.eldest_unsynced {
            if eldest.elapsed() > self.cfg.sync_interval {
                self.sync()?;
            }
        }
        let mut info = read_wal_info(&self.id)?;
        while info.total_size > self.cfg.total_limit && info.head_idx < self.tail_idx {
            let path = file_for(&self.id, info.head_idx);
            let size = fs::metadata(&path)?.len();
            fs::remove_file(&path)?;
            debug!("wal: removed {}", path.display());
            info.total_size -= size;
            info.head_idx += 1;
        }
        Ok(())
    }
}

/// Appends frames to a rotating file series.
pub struct WalWriter {
    inner: Arc<Mutex<WriterInner>>,
    stop_tx: Option<Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl WalWriter {
    /// Open (or create) the stream at `id` = `<dir>/<prefix>` for appending.
    pub fn open(id: &Path, cfg: &WalConfig) -> Result<Self, WalError> {
        let info = match read_wal_info(id) {
            Ok(info) => info,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                if let Some(dir) = id.parent() {
                    create_wal_dir(dir)?;
                }
                read_wal_info(id)?
            }
            Err(e) => return Err(e.into()),
        };
        let tail = open_tail(id, info.tail_idx)?;
        let inner = Arc::new(Mutex::new(WriterInner {
            id: id.to_path_buf(),
            cfg: cfg.clone(),
            buf: Vec::with_capacity(WAL_BUF_SIZE),
            tail,
            tail_idx: info.tail_idx,
            tail_size: info.tail_size,
            eldest_unsynced: None,
        }));

        let (stop_tx, stop_rx) = bounded::<()>(1);
        let ticker = tick(cfg.housekeeping_interval);
        let hk_inner = Arc::clone(&inner);
        let handle = std::thread::Builder::new()
            .name("tesseraWal".to_string())
            .spawn(move || loop {
                select! {
                    recv(stop_rx) -> _ => return,
                    recv(ticker) -> _ => {
                        let mut inner = match hk_inner.lock() {
                            Ok(inner) => inner,
                            Err(_) => return,
                        };
                        if let Err(e) = inner.housekeep() {
                            error!("wal housekeeping failed: {e}");
                        }
                    }
                }
            })?;

        Ok(Self {
            inner,
            stop_tx: Some(stop_tx),
            handle: Some(handle),
        })
    }

    /// Append one frame. Returns the frame length.
    pub fn write_bytes(&self, payload: &[u8]) -> Result<usize, WalError> {
        let mut inner = self.lock();
        let crc = crc32c::crc32c(payload);
        inner.buf.extend_from_slice(&crc.to_be_bytes());
        inner.buf.extend_from_slice(&(payload.len() as u32).to_be_bytes());
        inner.buf.extend_from_slice(payload);
        if inner.eldest_unsynced.is_none() {
            inner.eldest_unsynced = Some(Instant::now());
        }
        if inner.buf.len() >= WAL_BUF_SIZE {
            inner.flush_buf()?;
        }
        Ok(HEADER_LEN + payload.len())
    }

    /// Append one bincode-encoded record.
    pub fn write_obj<T: Serialize>(&self, value: &T) -> Result<usize, WalError> {
        let bytes = bincode::serialize(value)?;
        self.write_bytes(&bytes)
    }

    /// Flush buffers and fsync the tail file.
    pub fn sync(&self) -> Result<(), WalError> {
        Ok(self.lock().sync()?)
    }

    /// Rotate to a fresh tail file.
    pub fn shift(&self) -> Result<(), WalError> {
        Ok(self.lock().shift()?)
    }

    /// Run one housekeeping pass immediately.
    pub fn housekeep(&self) -> Result<(), WalError> {
        Ok(self.lock().housekeep()?)
    }

    /// Stop housekeeping, flush, fsync and close.
    pub fn close(mut self) -> Result<(), WalError> {
        self.stop()?;
        Ok(())
    }

    fn stop(&mut self) -> Result<(), WalError> {
        if let Some(stop_tx) = self.stop_tx.take() {
            let _ = stop_tx.send(());
        }
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
        Ok(self.lock().sync()?)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, WriterInner> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl Drop for WalWriter {
    fn drop(&mut self) {
        if self.stop_tx.is_some() {
            if let Err(e) = self.stop() {
                warn!("wal close on drop failed: {e}");
            }
        }
    }
}

/// Reads the frames of a stream, head file to tail file.
pub struct WalReader {
    id: PathBuf,
    info: WalInfo,
    files: Vec<BufReader<File>>,
    current: usize,
    position: u64,
    valid_offset: u64,
}

impl WalReader {
    pub fn open(id: &Path) -> Result<Self, WalError> {
        let info = read_wal_info(id)?;
        let mut files = Vec::with_capacity(info.file_sizes.len());
        for i in info.head_idx..=info.tail_idx {
            if info.file_sizes.is_empty() {
                break;
            }
            files.push(BufReader::with_capacity(
                WAL_BUF_SIZE,
                File::open(file_for(id, i))?,
            ));
        }
        Ok(Self {
            id: id.to_path_buf(),
            info,
            files,
            current: 0,
            position: 0,
            valid_offset: 0,
        })
    }

    /// Bytes of fully valid frames read so far.
    pub fn valid_offset(&self) -> u64 {
        self.valid_offset
    }

    /// Read the next frame's payload.
    ///
    /// `Eof` at a clean end; `UnexpectedEof` when the final frame is torn;
    /// `Corrupted` when a checksum does not match.
    pub fn read_bytes(&mut self) -> Result<Vec<u8>, WalError> {
        let mut header = [0u8; HEADER_LEN];
        match self.fill(&mut header)? {
            0 => return Err(WalError::Eof),
            n if n < HEADER_LEN => return Err(WalError::UnexpectedEof),
            _ => {}
        }
        let crc = u32::from_be_bytes([header[0], header[1], header[2], header[3]]);
        let len = u32::from_be_bytes([header[4], header[5], header[6], header[7]]) as usize;
        if self.position + len as u64 > self.info.total_size {
            // The length field points past the stream; the frame is torn.
            return Err(WalError::UnexpectedEof);
        }
        let mut payload = vec![0u8; len];
        if self.fill(&mut payload)? < len {
            return Err(WalError::UnexpectedEof);
        }
        if crc32c::crc32c(&payload) != crc {
            return Err(WalError::Corrupted);
        }
        self.valid_offset += (HEADER_LEN + len) as u64;
        Ok(payload)
    }

    /// Read and decode the next bincode record.
    pub fn read_obj<T: DeserializeOwned>(&mut self) -> Result<T, WalError> {
        let bytes = self.read_bytes()?;
        Ok(bincode::deserialize(&bytes)?)
    }

    // Read up to `buf.len()` bytes across file boundaries.
    fn fill(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut filled = 0;
        while filled < buf.len() {
            let Some(reader) = self.files.get_mut(self.current) else {
                break;
            };
            let n = reader.read(&mut buf[filled..])?;
            if n == 0 {
                self.current += 1;
                continue;
            }
            filled += n;
            self.position += n as u64;
        }
        Ok(filled)
    }

    pub fn close(self) {}

    /// Close and truncate the stream at the last valid offset, deleting any
    /// files past the truncation point.
    pub fn close_and_repair(self) -> Result<(), WalError> {
        let WalReader {
            id,
            info,
            files,
            valid_offset,
            ..
        } = self;
        drop(files);

        let mut left = valid_offset;
        let mut idx = info.head_idx;
        for &size in &info.file_sizes {
            if left <= size {
                if left < size {
                    truncate_file(&file_for(&id, idx), left)?;
                }
                for later in idx + 1..=info.tail_idx {
                    let path = file_for(&id, later);
                    if path.exists() {
                        fs::remove_file(&path)?;
                    }
                }
                return Ok(());
            }
            left -= size;
            idx += 1;
        }
        Ok(())
    }
}

fn truncate_file(path: &Path, len: u64) -> io::Result<()> {
    let file = OpenOptions::new().write(true).open(path)?;
    file.set_len(len)?;
    file.sync_all()
}

/// The three streams of the consensus state machine under one directory.
pub struct ConsensusWal {
    pub round: WalWriter,
    pub lock: WalWriter,
    pub commit: WalWriter,
}

impl ConsensusWal {
    pub fn open(dir: &Path, cfg: &WalConfig) -> Result<Self, WalError> {
        Ok(Self {
            round: WalWriter::open(&dir.join(ROUND_WAL), cfg)?,
            lock: WalWriter::open(&dir.join(LOCK_WAL), cfg)?,
            commit: WalWriter::open(&dir.join(COMMIT_WAL), cfg)?,
        })
    }

    pub fn sync(&self) -> Result<(), WalError> {
        self.round.sync()?;
        self.lock.sync()?;
        self.commit.sync()
    }

    /// Reinitialize `dir` to hold exactly one commit record.
    pub fn reset<T: Serialize>(
        dir: &Path,
        cfg: &WalConfig,
        commit_record: Option<&T>,
    ) -> Result<(), WalError> {
        if dir.exists() {
            fs::remove_dir_all(dir)?;
        }
        let Some(record) = commit_record else {
            return Ok(());
        };
        let writer = WalWriter::open(&dir.join(COMMIT_WAL), cfg)?;
        writer.write_obj(record)?;
        writer.close()
    }
}

#[cfg(test)]
mod tests {
    use {super::*, tempfile::TempDir};

    fn quiet_cfg() -> WalConfig {
        WalConfig {
            file_limit: 1024 * 1024,
            total_limit: 4 * 1024 * 1024,
            // Keep the background thread out of timing-sensitive tests.
            housekeeping_interval: Duration::from_secs(3600),
            sync_interval: Duration::from_secs(3600),
        }
    }

    fn payload(i: usize) -> Vec<u8> {
        format!("payload-{i}-{}", "x".repeat(i % 57)).into_bytes()
    }

    #[test]
    fn test_write_read_round_trip() {
        let dir = TempDir::new().unwrap();
        let id = dir.path().join("wal").join("round");
        let writer = WalWriter::open(&id, &quiet_cfg()).unwrap();
        for i in 0..100 {
            writer.write_bytes(&payload(i)).unwrap();
        }
        writer.close().unwrap();

        let mut reader = WalReader::open(&id).unwrap();
        for i in 0..100 {
            assert_eq!(reader.read_bytes().unwrap(), payload(i));
        }
        assert!(matches!(reader.read_bytes(), Err(WalError::Eof)));
    }

    #[test]
    fn test_round_trip_across_rotations() {
        let dir = TempDir::new().unwrap();
        let id = dir.path().join("w").join("round");
        let writer = WalWriter::open(&id, &quiet_cfg()).unwrap();
        for i in 0..50 {
            writer.write_bytes(&payload(i)).unwrap();
            if i % 10 == 9 {
                writer.shift().unwrap();
            }
        }
        writer.close().unwrap();

        // Five rotations: six files.
        let mut reader = WalReader::open(&id).unwrap();
        for i in 0..50 {
            assert_eq!(reader.read_bytes().unwrap(), payload(i));
        }
        assert!(matches!(reader.read_bytes(), Err(WalError::Eof)));
    }

    #[test]
    fn test_reopen_appends() {
        let dir = TempDir::new().unwrap();
        let id = dir.path().join("w").join("round");
        {
            let writer = WalWriter::open(&id, &quiet_cfg()).unwrap();
            writer.write_bytes(b"first").unwrap();
            writer.close().unwrap();
        }
        {
            let writer = WalWriter::open(&id, &quiet_cfg()).unwrap();
            writer.write_bytes(b"second").unwrap();
            writer.close().unwrap();
        }
        let mut reader = WalReader::open(&id).unwrap();
        assert_eq!(reader.read_bytes().unwrap(), b"first");
        assert_eq!(reader.read_bytes().unwrap(), b"second");
    }

    #[test]
    fn test_torn_tail_detected_and_repaired() {
        let dir = TempDir::new().unwrap();
        let id = dir.path().join("w").join("round");
        let writer = WalWriter::open(&id, &quiet_cfg()).unwrap();
        for i in 0..20 {
            writer.write_bytes(&payload(i)).unwrap();
        }
        writer.close().unwrap();

        // Tear the last frame by dropping 5 bytes from the tail file.
        let tail = file_for(&id, 0);
        let size = fs::metadata(&tail).unwrap().len();
        truncate_file(&tail, size - 5).unwrap();

        let mut reader = WalReader::open(&id).unwrap();
        for i in 0..19 {
            assert_eq!(reader.read_bytes().unwrap(), payload(i));
        }
        assert!(matches!(reader.read_bytes(), Err(WalError::UnexpectedEof)));
        reader.close_and_repair().unwrap();

        // After repair the stream ends cleanly one payload short.
        let mut reader = WalReader::open(&id).unwrap();
        for i in 0..19 {
            assert_eq!(reader.read_bytes().unwrap(), payload(i));
        }
        assert!(matches!(reader.read_bytes(), Err(WalError::Eof)));
    }

    #[test]
    fn test_corrupted_frame_detected() {
        let dir = TempDir::new().unwrap();
        let id = dir.path().join("w").join("round");
        let writer = WalWriter::open(&id, &quiet_cfg()).unwrap();
        writer.write_bytes(b"good frame").unwrap();
        writer.write_bytes(b"bad frame!").unwrap();
        writer.close().unwrap();

        // Flip one payload byte of the second frame.
        let tail = file_for(&id, 0);
        let mut bytes = fs::read(&tail).unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xff;
        fs::write(&tail, &bytes).unwrap();

        let mut reader = WalReader::open(&id).unwrap();
        assert_eq!(reader.read_bytes().unwrap(), b"good frame");
        assert!(matches!(reader.read_bytes(), Err(WalError::Corrupted)));
        reader.close_and_repair().unwrap();

        let mut reader = WalReader::open(&id).unwrap();
        assert_eq!(reader.read_bytes().unwrap(), b"good frame");
        assert!(matches!(reader.read_bytes(), Err(WalError::Eof)));
    }

    #[test]
    fn test_repair_removes_files_after_torn_one() {
        let dir = TempDir::new().unwrap();
        let id = dir.path().join("w").join("round");
        let writer = WalWriter::open(&id, &quiet_cfg()).unwrap();
        writer.write_bytes(b"frame in file zero").unwrap();
        writer.shift().unwrap();
        writer.write_bytes(b"frame in file one").unwrap();
        writer.shift().unwrap();
        writer.write_bytes(b"frame in file two").unwrap();
        writer.close().unwrap();

        // Tear file one; file two must go away on repair.
        let middle = file_for(&id, 1);
        let size = fs::metadata(&middle).unwrap().len();
        truncate_file(&middle, size - 3).unwrap();

        let mut reader = WalReader::open(&id).unwrap();
        assert_eq!(reader.read_bytes().unwrap(), b"frame in file zero");
        assert!(reader.read_bytes().is_err());
        reader.close_and_repair().unwrap();

        assert!(file_for(&id, 0).exists());
        assert!(!file_for(&id, 2).exists());
        let mut reader = WalReader::open(&id).unwrap();
        assert_eq!(reader.read_bytes().unwrap(), b"frame in file zero");
        assert!(matches!(reader.read_bytes(), Err(WalError::Eof)));
    }

    #[test]
    fn test_housekeeping_rotates_and_prunes() {
        let dir = TempDir::new().unwrap();
        let id = dir.path().join("w").join("round");
        let cfg = WalConfig {
            file_limit: 256,
            total_limit: 1024,
            ..quiet_cfg()
        };
        let writer = WalWriter::open(&id, &cfg).unwrap();
        for i in 0..200 {
            writer.write_bytes(&payload(i)).unwrap();
            writer.housekeep().unwrap();
        }
        writer.close().unwrap();

        let info = read_wal_info(&id).unwrap();
        assert!(info.head_idx > 0, "oldest files should have been pruned");
        // Every surviving byte stays within roughly the total limit.
        assert!(info.total_size <= 1024 + 256 + 64);

        // The surviving suffix must still read back cleanly.
        let mut reader = WalReader::open(&id).unwrap();
        let mut frames = 0;
        loop {
            match reader.read_bytes() {
                Ok(_) => frames += 1,
                Err(WalError::Eof) => break,
                Err(e) => panic!("unexpected wal error: {e}"),
            }
        }
        assert!(frames > 0);
    }

    #[test]
    fn test_large_history_with_torn_tail() {
        let dir = TempDir::new().unwrap();
        let id = dir.path().join("w").join("round");
        let cfg = WalConfig {
            file_limit: 64 * 1024,
            total_limit: 64 * 1024 * 1024,
            ..quiet_cfg()
        };
        let writer = WalWriter::open(&id, &cfg).unwrap();
        for i in 0..10_000 {
            writer.write_bytes(&payload(i)).unwrap();
            if i % 1000 == 999 {
                writer.shift().unwrap();
            }
        }
        writer.close().unwrap();

        let tail_idx = read_wal_info(&id).unwrap().tail_idx;
        let tail = file_for(&id, tail_idx);
        let size = fs::metadata(&tail).unwrap().len();
        truncate_file(&tail, size - 5).unwrap();

        let mut reader = WalReader::open(&id).unwrap();
        let mut frames = 0usize;
        loop {
            match reader.read_bytes() {
                Ok(bytes) => {
                    assert_eq!(bytes, payload(frames));
                    frames += 1;
                }
                Err(e) => {
                    assert!(e.is_recoverable());
                    break;
                }
            }
        }
        assert_eq!(frames, 9_999);
        reader.close_and_repair().unwrap();

        let mut reader = WalReader::open(&id).unwrap();
        let mut replayed = 0usize;
        loop {
            match reader.read_bytes() {
                Ok(bytes) => {
                    assert_eq!(bytes, payload(replayed));
                    replayed += 1;
                }
                Err(WalError::Eof) => break,
                Err(e) => panic!("unexpected wal error: {e}"),
            }
        }
        assert_eq!(replayed, 9_999);
    }

    #[test]
    fn test_obj_round_trip() {
        let dir = TempDir::new().unwrap();
        let id = dir.path().join("w").join("commit");
        let writer = WalWriter::open(&id, &quiet_cfg()).unwrap();
        writer.write_obj(&(42u64, String::from("record"))).unwrap();
        writer.close().unwrap();
        let mut reader = WalReader::open(&id).unwrap();
        let (height, tag): (u64, String) = reader.read_obj().unwrap();
        assert_eq!(height, 42);
        assert_eq!(tag, "record");
    }

    #[test]
    fn test_reset_leaves_single_commit_record() {
        let dir = TempDir::new().unwrap();
        let wal_dir = dir.path().join("wal");
        let cfg = quiet_cfg();
        {
            let wal = ConsensusWal::open(&wal_dir, &cfg).unwrap();
            wal.round.write_bytes(b"round junk").unwrap();
            wal.commit.write_bytes(b"old commit").unwrap();
            wal.sync().unwrap();
        }
        ConsensusWal::reset(&wal_dir, &cfg, Some(&(7u64, [9u8; 4]))).unwrap();

        // The round stream is gone; only the seeded commit record remains.
        let mut round = WalReader::open(&wal_dir.join(ROUND_WAL)).unwrap();
        assert!(matches!(round.read_bytes(), Err(WalError::Eof)));
        let mut reader = WalReader::open(&wal_dir.join(COMMIT_WAL)).unwrap();
        let (height, bytes): (u64, [u8; 4]) = reader.read_obj().unwrap();
        assert_eq!(height, 7);
        assert_eq!(bytes, [9u8; 4]);
        assert!(matches!(reader.read_bytes(), Err(WalError::Eof)));
    }

    #[test]
    fn test_empty_dir_reader() {
        let dir = TempDir::new().unwrap();
        let id = dir.path().join("nothing");
        let mut reader = WalReader::open(&id).unwrap();
        assert!(matches!(reader.read_bytes(), Err(WalError::Eof)));
    }
}
