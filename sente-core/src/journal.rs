//! Append-only on-disk journal of compressed evaluation results.
//!
//! Layout: a four-byte magic, then a stream of 16-byte `0xFF` guards and
//! entry records `{hash: u64 LE, policy_pass: f32 LE, winrate: f32 LE,
//! len: u8, bytes[len]}`. Guards are resync points: a valid record can
//! contain at most fifteen consecutive `0xFF` bytes because the all-ones
//! hash is reserved, so a reader that lost framing can scan forward to the
//! next guard and continue.

use crate::codec::{CodecError, CompressedEntry};
use crate::result::Netresult;
use std::fs::{File, OpenOptions};
use std::io::{BufReader, Read, Seek, SeekFrom, Write};
use std::path::Path;
use thiserror::Error;

pub const JOURNAL_MAGIC: [u8; 4] = [0xFE, b'L', b'N', b'C'];
pub const GUARD: [u8; 16] = [0xFF; 16];

/// Hash value that must never be journaled; it would allow sixteen
/// consecutive `0xFF` bytes inside a record.
pub const RESERVED_HASH: u64 = u64::MAX;

/// Largest policy payload a record can carry.
pub const MAX_ENTRY_BYTES: usize = 255;

const RECORD_HEADER_BYTES: usize = 8 + 4 + 4 + 1;

#[derive(Debug, Error)]
pub enum JournalError {
    #[error("journal I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("not a result-journal file (bad magic)")]
    BadMagic,

    #[error("truncated record")]
    Truncated,

    #[error("record claims the reserved hash")]
    ReservedHash,

    #[error("record carries hash {found:#018x}, expected {expected:#018x}")]
    WrongHash { expected: u64, found: u64 },

    #[error(transparent)]
    Codec(#[from] CodecError),
}

/// Append handle over a journal file. All writes go through the owner's
/// exclusive lock, so the tracked offset is authoritative.
#[derive(Debug)]
pub struct JournalWriter {
    file: File,
    pos: u64,
}

impl JournalWriter {
    /// Open `path` for appending, creating it if needed. `write_magic`
    /// must be set exactly when the file is new.
    pub fn open(path: &Path, write_magic: bool) -> std::io::Result<Self> {
        let mut file = OpenOptions::new().create(true).append(true).open(path)?;
        if write_magic {
            file.write_all(&JOURNAL_MAGIC)?;
        }
        let pos = file.seek(SeekFrom::End(0))?;
        Ok(JournalWriter { file, pos })
    }

    pub fn write_guard(&mut self) -> std::io::Result<()> {
        self.file.write_all(&GUARD)?;
        self.pos += GUARD.len() as u64;
        Ok(())
    }

    /// Append one record and return the offset it starts at.
    pub fn append(&mut self, hash: u64, entry: &CompressedEntry) -> std::io::Result<u64> {
        let bytes = entry.policy_bytes();
        debug_assert!(bytes.len() <= MAX_ENTRY_BYTES);
        debug_assert_ne!(hash, RESERVED_HASH);

        let mut record = Vec::with_capacity(RECORD_HEADER_BYTES + bytes.len());
        record.extend_from_slice(&hash.to_le_bytes());
        record.extend_from_slice(&entry.policy_pass.to_le_bytes());
        record.extend_from_slice(&entry.winrate.to_le_bytes());
        record.push(bytes.len() as u8);
        record.extend_from_slice(&bytes);

        let offset = self.pos;
        self.file.write_all(&record)?;
        self.pos += record.len() as u64;
        Ok(offset)
    }
}

fn read_exact_or_truncated<R: Read>(reader: &mut R, buf: &mut [u8]) -> Result<(), JournalError> {
    reader.read_exact(buf).map_err(|e| {
        if e.kind() == std::io::ErrorKind::UnexpectedEof {
            JournalError::Truncated
        } else {
            JournalError::Io(e)
        }
    })
}

/// Read one record at the current position. Does not validate that the
/// policy stream decodes.
fn read_record<R: Read>(reader: &mut R) -> Result<(u64, CompressedEntry), JournalError> {
    let mut header = [0u8; RECORD_HEADER_BYTES];
    read_exact_or_truncated(reader, &mut header)?;

    let hash = u64::from_le_bytes(header[0..8].try_into().unwrap());
    if hash == RESERVED_HASH {
        return Err(JournalError::ReservedHash);
    }
    let policy_pass = f32::from_le_bytes(header[8..12].try_into().unwrap());
    let winrate = f32::from_le_bytes(header[12..16].try_into().unwrap());
    let len = header[16] as usize;

    let mut bytes = vec![0u8; len];
    read_exact_or_truncated(reader, &mut bytes)?;

    Ok((hash, CompressedEntry::from_parts(policy_pass, winrate, &bytes)))
}

/// Consume bytes until sixteen consecutive `0xFF` have been read.
/// Returns false when the file ends first.
fn skip_guard<R: Read>(reader: &mut R) -> std::io::Result<bool> {
    let mut run = 0;
    let mut byte = [0u8; 1];
    while run < GUARD.len() {
        if reader.read(&mut byte)? == 0 {
            return Ok(false);
        }
        run = if byte[0] == 0xFF { run + 1 } else { 0 };
    }
    Ok(true)
}

/// Scan a journal, calling `visit(hash, offset)` for every record whose
/// policy stream decodes. Parse failures rewind to the failed record and
/// resync at the next guard, which tolerates torn tail writes and partial
/// corruption. Returns the number of records visited.
pub fn scan(path: &Path, mut visit: impl FnMut(u64, u64)) -> Result<usize, JournalError> {
    let file = File::open(path)?;
    let mut reader = BufReader::new(file);

    let mut magic = [0u8; 4];
    if reader.read_exact(&mut magic).is_err() || magic != JOURNAL_MAGIC {
        return Err(JournalError::BadMagic);
    }

    let mut count = 0;
    loop {
        if !skip_guard(&mut reader)? {
            return Ok(count);
        }

        loop {
            let offset = reader.stream_position()?;
            match read_record(&mut reader) {
                Ok((hash, entry)) if entry.validate().is_ok() => {
                    visit(hash, offset);
                    count += 1;
                }
                Err(JournalError::Io(e)) => return Err(JournalError::Io(e)),
                Ok(_) | Err(_) => {
                    reader.seek(SeekFrom::Start(offset))?;
                    break;
                }
            }
        }
    }
}

/// Decode the record at `offset`, checking it carries `expected_hash`.
/// Used by the cache's cold-lookup path on a freshly opened handle.
pub fn read_entry_at(
    path: &Path,
    offset: u64,
    expected_hash: u64,
) -> Result<Netresult, JournalError> {
    let mut file = File::open(path)?;
    file.seek(SeekFrom::Start(offset))?;

    let (hash, entry) = read_record(&mut file)?;
    if hash != expected_hash {
        return Err(JournalError::WrongHash {
            expected: expected_hash,
            found: hash,
        });
    }
    Ok(entry.decode()?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::result::NUM_INTERSECTIONS;
    use std::collections::HashMap;

    fn sample_result(seed: u64) -> Netresult {
        let mut rng = fastrand::Rng::with_seed(seed);
        let mut result = Netresult::default();
        for _ in 0..30 {
            result.policy[rng.usize(..NUM_INTERSECTIONS)] = rng.f32();
        }
        result.policy_pass = rng.f32();
        result.winrate = rng.f32() * 2.0 - 1.0;
        result
    }

    fn fresh_journal(path: &Path) -> JournalWriter {
        let mut writer = JournalWriter::open(path, true).unwrap();
        writer.write_guard().unwrap();
        writer
    }

    #[test]
    fn test_write_scan_read_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("journal");

        let mut writer = fresh_journal(&path);
        let mut offsets = HashMap::new();
        for hash in 1..=50u64 {
            let entry = CompressedEntry::from_netresult(&sample_result(hash));
            offsets.insert(hash, writer.append(hash, &entry).unwrap());
        }
        drop(writer);

        let mut scanned = HashMap::new();
        let count = scan(&path, |hash, offset| {
            scanned.insert(hash, offset);
        })
        .unwrap();

        assert_eq!(count, 50);
        assert_eq!(scanned, offsets);

        for (hash, offset) in scanned {
            let decoded = read_entry_at(&path, offset, hash).unwrap();
            let expected = CompressedEntry::from_netresult(&sample_result(hash))
                .decode()
                .unwrap();
            assert_eq!(decoded, expected);
        }
    }

    #[test]
    fn test_guards_inside_the_stream_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("journal");

        let mut writer = fresh_journal(&path);
        let entry = CompressedEntry::from_netresult(&sample_result(1));
        writer.append(1, &entry).unwrap();
        writer.write_guard().unwrap();
        writer.append(2, &entry).unwrap();
        writer.append(3, &entry).unwrap();
        drop(writer);

        let mut hashes = Vec::new();
        scan(&path, |hash, _| hashes.push(hash)).unwrap();
        assert_eq!(hashes, vec![1, 2, 3]);
    }

    #[test]
    fn test_resyncs_past_garbage() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("journal");

        let mut writer = fresh_journal(&path);
        let entry = CompressedEntry::from_netresult(&sample_result(1));
        writer.append(1, &entry).unwrap();

        // Raw garbage followed by a resync point and two good records.
        writer.file.write_all(&[0xAB; 7]).unwrap();
        writer.pos += 7;
        writer.write_guard().unwrap();
        writer.append(2, &entry).unwrap();
        writer.append(3, &entry).unwrap();
        drop(writer);

        let mut hashes = Vec::new();
        scan(&path, |hash, _| hashes.push(hash)).unwrap();
        assert_eq!(hashes, vec![1, 2, 3]);
    }

    #[test]
    fn test_every_truncation_point_recovers_cleanly() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("journal");

        let mut writer = fresh_journal(&path);
        for hash in 1..=20u64 {
            let entry = CompressedEntry::from_netresult(&sample_result(hash));
            writer.append(hash, &entry).unwrap();
        }
        drop(writer);

        let full = std::fs::read(&path).unwrap();
        let truncated_path = dir.path().join("truncated");

        for cut in (4..full.len()).step_by(13) {
            std::fs::write(&truncated_path, &full[..cut]).unwrap();

            let mut recovered = Vec::new();
            scan(&truncated_path, |hash, offset| recovered.push((hash, offset))).unwrap();

            // Every surviving index entry must decode.
            for (hash, offset) in recovered {
                assert!(read_entry_at(&truncated_path, offset, hash).is_ok());
            }
        }
    }

    #[test]
    fn test_bad_magic_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("journal");
        std::fs::write(&path, b"not a journal at all").unwrap();

        assert!(matches!(
            scan(&path, |_, _| {}),
            Err(JournalError::BadMagic)
        ));
    }

    #[test]
    fn test_wrong_hash_at_offset_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("journal");

        let mut writer = fresh_journal(&path);
        let entry = CompressedEntry::from_netresult(&sample_result(1));
        let offset = writer.append(7, &entry).unwrap();
        drop(writer);

        assert!(matches!(
            read_entry_at(&path, offset, 8),
            Err(JournalError::WrongHash { expected: 8, found: 7 })
        ));
    }
}
