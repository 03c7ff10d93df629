//! Write-ahead log of ledger events.
//!
//! Each frame is one commit:
//! `[u32 LE: payload len][bincode Vec<Event>][u32 LE: crc32 of payload]`.
//! A frame cut short by a crash, or one whose checksum disagrees, ends the
//! log: everything from it onward is dropped on recovery, so a multi-event
//! commit is replayed whole or not at all.

use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, ErrorKind, Read, Write};
use std::path::{Path, PathBuf};

use tracing::warn;

use crate::model::Event;

const FRAME_OVERHEAD: u64 = 8;

/// Largest payload a frame may carry. A length word above this is garbage.
const MAX_FRAME_LEN: u32 = 16 * 1024 * 1024;

fn write_frame(out: &mut impl Write, events: &[Event]) -> io::Result<()> {
    let payload = bincode::serialize(events).map_err(|e| io::Error::new(ErrorKind::InvalidData, e))?;
    let len = u32::try_from(payload.len())
        .ok()
        .filter(|len| *len <= MAX_FRAME_LEN)
        .ok_or_else(|| io::Error::new(ErrorKind::InvalidData, "commit too large for WAL frame"))?;
    out.write_all(&len.to_le_bytes())?;
    out.write_all(&payload)?;
    out.write_all(&crc32fast::hash(&payload).to_le_bytes())
}

enum Frame {
    Commit { events: Vec<Event>, size: u64 },
    Eof,
    Damaged(&'static str),
}

/// `Ok(false)` when the input ends before `buf` is filled.
fn fill(input: &mut impl Read, buf: &mut [u8]) -> io::Result<bool> {
    match input.read_exact(buf) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == ErrorKind::UnexpectedEof => Ok(false),
        Err(e) => Err(e),
    }
}

fn read_frame(input: &mut impl Read) -> io::Result<Frame> {
    let mut word = [0u8; 4];
    if !fill(input, &mut word)? {
        return Ok(Frame::Eof);
    }
    let len = u32::from_le_bytes(word);
    if len > MAX_FRAME_LEN {
        return Ok(Frame::Damaged("oversized length word"));
    }

    let mut payload = vec![0u8; len as usize];
    if !fill(input, &mut payload)? {
        return Ok(Frame::Damaged("truncated payload"));
    }
    if !fill(input, &mut word)? {
        return Ok(Frame::Damaged("truncated checksum"));
    }
    if u32::from_le_bytes(word) != crc32fast::hash(&payload) {
        return Ok(Frame::Damaged("checksum mismatch"));
    }
    Ok(match bincode::deserialize(&payload) {
        Ok(events) => Frame::Commit {
            events,
            size: u64::from(len) + FRAME_OVERHEAD,
        },
        Err(_) => Frame::Damaged("undecodable payload"),
    })
}

/// Events readable from a log file, and how many leading bytes hold them.
struct Scan {
    events: Vec<Event>,
    valid_len: u64,
    damaged: bool,
}

fn scan(path: &Path) -> io::Result<Scan> {
    let file = match File::open(path) {
        Ok(f) => f,
        Err(e) if e.kind() == ErrorKind::NotFound => {
            return Ok(Scan {
                events: Vec::new(),
                valid_len: 0,
                damaged: false,
            });
        }
        Err(e) => return Err(e),
    };
    let mut input = BufReader::new(file);
    let mut events = Vec::new();
    let mut valid_len = 0;

    let damaged = loop {
        match read_frame(&mut input)? {
            Frame::Commit { events: committed, size } => {
                events.extend(committed);
                valid_len += size;
            }
            Frame::Eof => break false,
            Frame::Damaged(reason) => {
                warn!(
                    "WAL {} damaged after {} events ({valid_len} bytes): {reason}",
                    path.display(),
                    events.len()
                );
                break true;
            }
        }
    };

    Ok(Scan {
        events,
        valid_len,
        damaged,
    })
}

/// Append handle on the log file.
pub struct Wal {
    out: BufWriter<File>,
    path: PathBuf,
    appends_since_compact: u64,
}

impl Wal {
    /// Open (or create) the log for appending, without reading it.
    pub fn open(path: &Path) -> io::Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            out: BufWriter::new(file),
            path: path.to_path_buf(),
            appends_since_compact: 0,
        })
    }

    /// Read every intact event, cut off any damaged tail so new frames
    /// follow the last good one, then open for appending.
    pub fn recover(path: &Path) -> io::Result<(Self, Vec<Event>)> {
        let Scan {
            events,
            valid_len,
            damaged,
        } = scan(path)?;
        if damaged {
            OpenOptions::new().write(true).open(path)?.set_len(valid_len)?;
            warn!("truncated WAL {} to {valid_len} bytes", path.display());
        }
        Ok((Self::open(path)?, events))
    }

    /// Intact events in the log; stops at the first damaged frame.
    #[cfg(test)]
    pub(crate) fn replay(path: &Path) -> io::Result<Vec<Event>> {
        scan(path).map(|s| s.events)
    }

    #[cfg(test)]
    pub fn append(&mut self, event: &Event) -> io::Result<()> {
        self.append_buffered(std::slice::from_ref(event))?;
        self.flush_sync()
    }

    /// Queue one commit's events as a single frame; durable only after
    /// `flush_sync`. Counts events, not frames.
    pub fn append_buffered(&mut self, events: &[Event]) -> io::Result<()> {
        write_frame(&mut self.out, events)?;
        self.appends_since_compact += events.len() as u64;
        Ok(())
    }

    pub fn flush_sync(&mut self) -> io::Result<()> {
        self.out.flush()?;
        self.out.get_ref().sync_all()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn appends_since_compact(&self) -> u64 {
        self.appends_since_compact
    }

    fn staging_path(path: &Path) -> PathBuf {
        path.with_extension("wal.tmp")
    }

    /// Write `events` as a fresh log next to `path`, fsynced, without
    /// touching the live file.
    pub fn write_compact_file(path: &Path, events: &[Event]) -> io::Result<()> {
        let mut out = BufWriter::new(File::create(Self::staging_path(path))?);
        for event in events {
            write_frame(&mut out, std::slice::from_ref(event))?;
        }
        out.flush()?;
        out.get_ref().sync_all()
    }

    /// Atomically replace the live log with the staged one and append there.
    pub fn swap_compact_file(&mut self) -> io::Result<()> {
        fs::rename(Self::staging_path(&self.path), &self.path)?;
        *self = Self::open(&self.path)?;
        Ok(())
    }

    #[cfg(test)]
    pub fn compact(&mut self, events: &[Event]) -> io::Result<()> {
        Self::write_compact_file(&self.path, events)?;
        self.swap_compact_file()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{DateRange, VenueId};
    use chrono::NaiveDate;
    use ulid::Ulid;

    fn tmp_path(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("venue_ledger_test_wal");
        fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        let _ = fs::remove_file(&path);
        path
    }

    fn feb(start: u32, end: u32) -> DateRange {
        DateRange::new(
            NaiveDate::from_ymd_opt(2026, 2, start).unwrap(),
            NaiveDate::from_ymd_opt(2026, 2, end).unwrap(),
        )
        .unwrap()
    }

    fn added(venue: &str, range: DateRange) -> Event {
        Event::BlockAdded {
            id: Ulid::new(),
            venue_id: VenueId::from(venue),
            range,
            label: Some("wedding".into()),
        }
    }

    fn write_all(path: &Path, events: &[Event]) {
        let mut wal = Wal::open(path).unwrap();
        for e in events {
            wal.append(e).unwrap();
        }
    }

    fn append_raw(path: &Path, bytes: &[u8]) {
        OpenOptions::new()
            .append(true)
            .open(path)
            .unwrap()
            .write_all(bytes)
            .unwrap();
    }

    #[test]
    fn every_event_kind_replays() {
        let path = tmp_path("kinds.wal");
        let events = vec![
            added("hall", feb(10, 15)),
            Event::BlockRescheduled {
                id: Ulid::new(),
                venue_id: VenueId::from("hall"),
                range: feb(20, 21),
            },
            Event::BlockRemoved {
                id: Ulid::new(),
                venue_id: VenueId::from("barn"),
            },
        ];
        write_all(&path, &events);

        assert_eq!(Wal::replay(&path).unwrap(), events);
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn missing_file_replays_empty() {
        let path = tmp_path("missing.wal");
        assert!(Wal::replay(&path).unwrap().is_empty());
        let (_wal, events) = Wal::recover(&path).unwrap();
        assert!(events.is_empty());
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn truncated_frame_ends_replay() {
        let path = tmp_path("truncated.wal");
        let event = added("hall", feb(1, 2));
        write_all(&path, std::slice::from_ref(&event));
        // Claims 40 payload bytes, delivers two: a crash mid-write
        append_raw(&path, &[40, 0, 0, 0, 1, 2]);

        assert_eq!(Wal::replay(&path).unwrap(), vec![event]);
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn bad_checksum_ends_replay() {
        let path = tmp_path("bad_crc.wal");
        let good = added("hall", feb(3, 4));
        write_all(&path, std::slice::from_ref(&good));

        let payload = bincode::serialize(&vec![added("hall", feb(5, 6))]).unwrap();
        let mut frame = (payload.len() as u32).to_le_bytes().to_vec();
        frame.extend_from_slice(&payload);
        frame.extend_from_slice(&0xDEAD_BEEFu32.to_le_bytes());
        append_raw(&path, &frame);

        assert_eq!(Wal::replay(&path).unwrap(), vec![good]);
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn recover_drops_damaged_tail_before_appending() {
        let path = tmp_path("recover.wal");
        let first = added("hall", feb(1, 1));
        write_all(&path, std::slice::from_ref(&first));
        let intact_len = fs::metadata(&path).unwrap().len();
        append_raw(&path, &[99, 0, 0, 0, 7]);

        let second = added("hall", feb(2, 2));
        {
            let (mut wal, events) = Wal::recover(&path).unwrap();
            assert_eq!(events, vec![first.clone()]);
            assert_eq!(fs::metadata(&path).unwrap().len(), intact_len);
            wal.append(&second).unwrap();
        }

        // Without the cut, `second` would sit behind garbage and be lost
        assert_eq!(Wal::replay(&path).unwrap(), vec![first, second]);
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn compaction_replaces_churn() {
        let path = tmp_path("compact.wal");
        let venue = VenueId::from("hall");
        let keep = added("hall", feb(10, 12));
        {
            let mut wal = Wal::open(&path).unwrap();
            wal.append(&keep).unwrap();
            for _ in 0..10 {
                let id = Ulid::new();
                wal.append(&Event::BlockAdded {
                    id,
                    venue_id: venue.clone(),
                    range: feb(20, 22),
                    label: None,
                })
                .unwrap();
                wal.append(&Event::BlockRemoved {
                    id,
                    venue_id: venue.clone(),
                })
                .unwrap();
            }
            assert_eq!(wal.appends_since_compact(), 21);
        }
        let churned = fs::metadata(&path).unwrap().len();

        let later = added("hall", feb(25, 26));
        {
            let mut wal = Wal::open(&path).unwrap();
            wal.compact(std::slice::from_ref(&keep)).unwrap();
            assert_eq!(wal.appends_since_compact(), 0);
            wal.append(&later).unwrap();
        }

        assert!(fs::metadata(&path).unwrap().len() < churned);
        assert!(!Wal::staging_path(&path).exists());
        assert_eq!(Wal::replay(&path).unwrap(), vec![keep, later]);
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn oversized_length_word_is_damage() {
        let path = tmp_path("oversized.wal");
        let good = added("hall", feb(7, 8));
        write_all(&path, std::slice::from_ref(&good));
        append_raw(&path, &u32::MAX.to_le_bytes());
        append_raw(&path, &[0; 16]);

        let (_wal, events) = Wal::recover(&path).unwrap();
        assert_eq!(events, vec![good]);
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn torn_multi_event_commit_replays_nothing() {
        let path = tmp_path("torn_commit.wal");
        let first = added("hall", feb(1, 1));
        write_all(&path, std::slice::from_ref(&first));
        let intact_len = fs::metadata(&path).unwrap().len();
        {
            let mut wal = Wal::open(&path).unwrap();
            let batch: Vec<Event> = (10..=12).map(|d| added("barn", feb(d, d))).collect();
            wal.append_buffered(&batch).unwrap();
            wal.flush_sync().unwrap();
        }
        // Crash two bytes short of the commit's checksum
        let full_len = fs::metadata(&path).unwrap().len();
        OpenOptions::new()
            .write(true)
            .open(&path)
            .unwrap()
            .set_len(full_len - 2)
            .unwrap();

        assert_eq!(Wal::replay(&path).unwrap(), vec![first]);
        let (_wal, _) = Wal::recover(&path).unwrap();
        assert_eq!(fs::metadata(&path).unwrap().len(), intact_len);
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn buffered_frames_durable_after_flush() {
        let path = tmp_path("buffered.wal");
        let events: Vec<Event> = (1..=5).map(|d| added("barn", feb(d, d))).collect();
        {
            let mut wal = Wal::open(&path).unwrap();
            wal.append_buffered(&events[..2]).unwrap();
            wal.append_buffered(&events[2..]).unwrap();
            assert_eq!(wal.appends_since_compact(), 5);
            wal.flush_sync().unwrap();
        }

        assert_eq!(Wal::replay(&path).unwrap(), events);
        let _ = fs::remove_file(&path);
    }
}
