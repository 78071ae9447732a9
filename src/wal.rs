use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use crate::model::Event;

const HEADER_LEN: u64 = 4;
const CRC_LEN: u64 = 4;

/// Encode a single event as `[len][bincode][crc32]`. Returns the bytes written.
fn encode_event(writer: &mut impl Write, event: &Event) -> io::Result<u64> {
    let payload =
        bincode::serialize(event).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    let len = u32::try_from(payload.len())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "event too large for WAL"))?;
    writer.write_all(&len.to_le_bytes())?;
    writer.write_all(&payload)?;
    writer.write_all(&crc32fast::hash(&payload).to_le_bytes())?;
    Ok(HEADER_LEN + payload.len() as u64 + CRC_LEN)
}

/// Read the next intact record. `Ok(None)` means clean end, torn tail or corruption.
fn decode_next(reader: &mut impl Read) -> io::Result<Option<(Event, u64)>> {
    let mut len_buf = [0u8; 4];
    if !read_full(reader, &mut len_buf)? {
        return Ok(None);
    }
    let len = u32::from_le_bytes(len_buf) as usize;

    let mut payload = vec![0u8; len];
    if !read_full(reader, &mut payload)? {
        return Ok(None);
    }
    let mut crc_buf = [0u8; 4];
    if !read_full(reader, &mut crc_buf)? {
        return Ok(None);
    }
    if u32::from_le_bytes(crc_buf) != crc32fast::hash(&payload) {
        return Ok(None);
    }
    match bincode::deserialize::<Event>(&payload) {
        Ok(event) => Ok(Some((event, HEADER_LEN + len as u64 + CRC_LEN))),
        Err(_) => Ok(None),
    }
}

/// `read_exact` that reports EOF as `false` instead of an error.
fn read_full(reader: &mut impl Read, buf: &mut [u8]) -> io::Result<bool> {
    match reader.read_exact(buf) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Ok(false),
        Err(e) => Err(e),
    }
}

/// Result of scanning a WAL file.
#[derive(Debug, Default)]
pub struct Replay {
    pub events: Vec<Event>,
    /// Byte offset just past the last intact record.
    pub valid_len: u64,
    /// Bytes after `valid_len` that could not be decoded.
    pub discarded: u64,
}

/// Append-only write-ahead log of canvas events.
///
/// Format per entry: `[u32: len][bincode: Event][u32: crc32]`, little endian.
/// A torn or corrupt tail ends replay and is cut off when the log is opened,
/// so records appended afterwards stay reachable.
pub struct Wal {
    writer: BufWriter<File>,
    path: PathBuf,
    /// File length covered by fsynced records. A failed batch is cut back to this.
    durable_len: u64,
    pending_len: u64,
    pending_count: u64,
    appends_since_compact: u64,
    /// Set when a rollback itself failed; the file tail is unknown, so appends stop.
    poisoned: bool,
    /// Fail the append after this many more succeed, leaving half a record on disk.
    #[cfg(test)]
    pub(crate) fail_after: Option<u64>,
}

impl Wal {
    /// Open (or create) the WAL at `path`, truncating any torn tail.
    pub fn open(path: &Path) -> io::Result<Self> {
        let replay = Self::replay(path)?;
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(path)?;
        if replay.discarded > 0 {
            tracing::warn!(
                "truncating {} unreadable bytes at end of {}",
                replay.discarded,
                path.display()
            );
            file.set_len(replay.valid_len)?;
            file.sync_all()?;
        }
        let file = OpenOptions::new().append(true).open(path)?;
        Ok(Self {
            writer: BufWriter::new(file),
            path: path.to_path_buf(),
            durable_len: replay.valid_len,
            pending_len: 0,
            pending_count: 0,
            appends_since_compact: 0,
            poisoned: false,
            #[cfg(test)]
            fail_after: None,
        })
    }

    /// Append and fsync one event. Tests only; the engine batches via `append_buffered`.
    #[cfg(test)]
    pub fn append(&mut self, event: &Event) -> io::Result<()> {
        self.append_buffered(event)?;
        self.flush_sync()
    }

    /// Buffer one event. Nothing is durable until `flush_sync`.
    pub fn append_buffered(&mut self, event: &Event) -> io::Result<()> {
        if self.poisoned {
            return Err(io::Error::other("WAL tail unknown after failed rollback"));
        }
        #[cfg(test)]
        if let Some(left) = self.fail_after.as_mut() {
            if *left == 0 {
                self.fail_after = None;
                return self.write_torn(event);
            }
            *left -= 1;
        }
        let written = encode_event(&mut self.writer, event)?;
        self.pending_len += written;
        self.pending_count += 1;
        self.appends_since_compact += 1;
        Ok(())
    }

    pub fn flush_sync(&mut self) -> io::Result<()> {
        self.writer.flush()?;
        self.writer.get_ref().sync_all()?;
        self.durable_len += self.pending_len;
        self.pending_len = 0;
        self.pending_count = 0;
        Ok(())
    }

    /// Append and fsync every event, or leave the file as it was before the call.
    pub fn append_batch<'a>(&mut self, events: impl IntoIterator<Item = &'a Event>) -> io::Result<()> {
        let mut result = Ok(());
        for event in events {
            result = self.append_buffered(event);
            if result.is_err() {
                break;
            }
        }
        if result.is_ok() {
            result = self.flush_sync();
        }
        if result.is_err() {
            if let Err(e) = self.rollback() {
                tracing::error!("WAL rollback of {} failed, refusing appends: {e}", self.path.display());
                self.poisoned = true;
            }
        }
        result
    }

    /// Discard everything since the last successful `flush_sync`, whether it is
    /// still buffered or already reached the file.
    fn rollback(&mut self) -> io::Result<()> {
        let fresh = OpenOptions::new().append(true).open(&self.path)?;
        let stale = std::mem::replace(&mut self.writer, BufWriter::new(fresh));
        // into_parts drops the buffer without writing it out.
        drop(stale.into_parts());
        let file = self.writer.get_ref();
        file.set_len(self.durable_len)?;
        file.sync_all()?;
        self.appends_since_compact = self.appends_since_compact.saturating_sub(self.pending_count);
        self.pending_len = 0;
        self.pending_count = 0;
        Ok(())
    }

    /// Push the buffer out, then write half of `event` straight to the file and fail.
    #[cfg(test)]
    fn write_torn(&mut self, event: &Event) -> io::Result<()> {
        self.writer.flush()?;
        let mut record = Vec::new();
        encode_event(&mut record, event)?;
        self.writer.get_mut().write_all(&record[..record.len() / 2])?;
        Err(io::Error::other("injected write failure"))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Write a compacted log to `<path>.wal.tmp` and fsync it.
    pub fn write_compact_file(path: &Path, events: &[Event]) -> io::Result<()> {
        let tmp_path = path.with_extension("wal.tmp");
        let mut writer = BufWriter::new(File::create(&tmp_path)?);
        for event in events {
            encode_event(&mut writer, event)?;
        }
        writer.flush()?;
        writer.get_ref().sync_all()
    }

    /// Rename the compacted temp file over the live log and reopen for append.
    pub fn swap_compact_file(&mut self) -> io::Result<()> {
        self.writer.flush()?;
        let tmp_path = self.path.with_extension("wal.tmp");
        fs::rename(&tmp_path, &self.path)?;
        let file = OpenOptions::new().create(true).append(true).open(&self.path)?;
        self.durable_len = file.metadata()?.len();
        self.writer = BufWriter::new(file);
        self.pending_len = 0;
        self.pending_count = 0;
        self.appends_since_compact = 0;
        Ok(())
    }

    #[cfg(test)]
    pub fn compact(&mut self, events: &[Event]) -> io::Result<()> {
        Self::write_compact_file(&self.path, events)?;
        self.swap_compact_file()
    }

    pub fn appends_since_compact(&self) -> u64 {
        self.appends_since_compact
    }

    /// Decode every intact record. A missing file replays as empty.
    pub fn replay(path: &Path) -> io::Result<Replay> {
        let file = match File::open(path) {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Replay::default()),
            Err(e) => return Err(e),
        };
        let total_len = file.metadata()?.len();
        let mut reader = BufReader::new(file);
        let mut replay = Replay::default();

        while let Some((event, record_len)) = decode_next(&mut reader)? {
            replay.events.push(event);
            replay.valid_len += record_len;
        }
        replay.discarded = total_len - replay.valid_len;
        Ok(replay)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Spot, Visual};
    use ulid::Ulid;

    fn tmp_path(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("spotledger_test_wal");
        fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        let _ = fs::remove_file(&path);
        path
    }

    fn claimed(x: i64, y: i64) -> Event {
        Event::SpotClaimed {
            spot: Spot {
                id: Ulid::new(),
                x,
                y,
                width: 2,
                height: 2,
                visual: Visual::None,
                link_url: None,
                owner_wallet: "owner".into(),
                tx_signature: None,
                created_at: 1,
                updated_at: 1,
            },
        }
    }

    #[test]
    fn append_and_replay() {
        let path = tmp_path("append_and_replay.wal");
        let events = vec![
            claimed(0, 0),
            Event::AllowanceGranted { wallet: "w".into(), allowance: 5 },
            Event::AllowanceConsumed { wallet: "w".into(), amount: 2 },
        ];
        {
            let mut wal = Wal::open(&path).unwrap();
            for e in &events {
                wal.append(e).unwrap();
            }
        }
        let replay = Wal::replay(&path).unwrap();
        assert_eq!(replay.events, events);
        assert_eq!(replay.discarded, 0);
        assert_eq!(replay.valid_len, fs::metadata(&path).unwrap().len());
    }

    #[test]
    fn replay_nonexistent_file() {
        let path = tmp_path("nonexistent.wal");
        let replay = Wal::replay(&path).unwrap();
        assert!(replay.events.is_empty());
        assert_eq!(replay.valid_len, 0);
    }

    #[test]
    fn replay_stops_at_torn_tail() {
        let path = tmp_path("torn_tail.wal");
        let event = claimed(1, 1);
        {
            let mut wal = Wal::open(&path).unwrap();
            wal.append(&event).unwrap();
        }
        {
            let mut f = OpenOptions::new().append(true).open(&path).unwrap();
            f.write_all(&[9u8; 6]).unwrap();
        }
        let replay = Wal::replay(&path).unwrap();
        assert_eq!(replay.events, vec![event]);
        assert_eq!(replay.discarded, 6);
    }

    #[test]
    fn open_truncates_torn_tail_so_new_appends_survive() {
        let path = tmp_path("truncate_on_open.wal");
        let first = claimed(0, 0);
        let second = claimed(10, 10);
        {
            let mut wal = Wal::open(&path).unwrap();
            wal.append(&first).unwrap();
        }
        {
            let mut f = OpenOptions::new().append(true).open(&path).unwrap();
            f.write_all(&[0xAB; 3]).unwrap();
        }
        {
            let mut wal = Wal::open(&path).unwrap();
            wal.append(&second).unwrap();
        }
        let replay = Wal::replay(&path).unwrap();
        assert_eq!(replay.events, vec![first, second]);
        assert_eq!(replay.discarded, 0);
    }

    #[test]
    fn replay_rejects_bad_crc() {
        let path = tmp_path("bad_crc.wal");
        let event = Event::WhitelistRevoked { wallet: "w".into() };
        {
            let payload = bincode::serialize(&event).unwrap();
            let mut f = File::create(&path).unwrap();
            f.write_all(&(payload.len() as u32).to_le_bytes()).unwrap();
            f.write_all(&payload).unwrap();
            f.write_all(&0xDEADBEEFu32.to_le_bytes()).unwrap();
        }
        let replay = Wal::replay(&path).unwrap();
        assert!(replay.events.is_empty());
        assert!(replay.discarded > 0);
    }

    #[test]
    fn compact_then_append() {
        let path = tmp_path("compact_append.wal");
        let keep = claimed(0, 0);
        let later = claimed(5, 5);
        {
            let mut wal = Wal::open(&path).unwrap();
            wal.append(&keep).unwrap();
            for _ in 0..10 {
                wal.append(&Event::AllowanceGranted { wallet: "churn".into(), allowance: 1 })
                    .unwrap();
                wal.append(&Event::WhitelistRevoked { wallet: "churn".into() }).unwrap();
            }
        }
        let before = fs::metadata(&path).unwrap().len();
        {
            let mut wal = Wal::open(&path).unwrap();
            wal.compact(std::slice::from_ref(&keep)).unwrap();
            assert_eq!(wal.appends_since_compact(), 0);
            wal.append(&later).unwrap();
        }
        let after = fs::metadata(&path).unwrap().len();
        assert!(after < before, "compacted WAL should shrink: {after} < {before}");
        assert_eq!(Wal::replay(&path).unwrap().events, vec![keep, later]);
    }

    #[test]
    fn failed_batch_is_rolled_back_from_disk() {
        let path = tmp_path("failed_batch.wal");
        let kept = claimed(0, 0);
        let mut wal = Wal::open(&path).unwrap();
        wal.append(&kept).unwrap();
        let len_before = fs::metadata(&path).unwrap().len();

        // The first event reaches the file, the second is torn halfway.
        wal.fail_after = Some(1);
        let lost = [claimed(10, 10), claimed(20, 20)];
        assert!(wal.append_batch(&lost).is_err());

        assert_eq!(fs::metadata(&path).unwrap().len(), len_before);
        assert_eq!(wal.appends_since_compact(), 1);
        let replay = Wal::replay(&path).unwrap();
        assert_eq!(replay.events, vec![kept.clone()]);
        assert_eq!(replay.discarded, 0);

        let later = claimed(30, 30);
        wal.append_batch([&later]).unwrap();
        drop(wal);
        let wal = Wal::open(&path).unwrap();
        assert_eq!(wal.appends_since_compact(), 0);
        assert_eq!(Wal::replay(&path).unwrap().events, vec![kept, later]);
    }

    #[test]
    fn buffered_appends_count_until_flushed() {
        let path = tmp_path("buffered.wal");
        let events: Vec<Event> = (0..5).map(|i| claimed(i * 3, 0)).collect();
        {
            let mut wal = Wal::open(&path).unwrap();
            for e in &events {
                wal.append_buffered(e).unwrap();
            }
            assert_eq!(wal.appends_since_compact(), 5);
            wal.flush_sync().unwrap();
        }
        assert_eq!(Wal::replay(&path).unwrap().events, events);
    }
}
