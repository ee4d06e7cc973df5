//! Write-ahead log of store events.
//!
//! Each record is `[u32 len][json Event][u32 crc32]`, little-endian, where
//! `len` counts the JSON payload only. A crash can leave a torn record at the
//! end; recovery cuts the file back to the last whole record before anything
//! new is appended, so later writes are never hidden behind garbage.

use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, ErrorKind, Read, Write};
use std::path::{Path, PathBuf};

use tracing::warn;

use crate::limits::MAX_WAL_RECORD;
use crate::model::Event;

fn encode(buf: &mut Vec<u8>, event: &Event) -> io::Result<()> {
    let payload = serde_json::to_vec(event).map_err(io::Error::other)?;
    if payload.len() > MAX_WAL_RECORD {
        return Err(io::Error::new(
            ErrorKind::InvalidInput,
            format!("WAL record of {} bytes exceeds {MAX_WAL_RECORD}", payload.len()),
        ));
    }
    buf.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    buf.extend_from_slice(&payload);
    buf.extend_from_slice(&crc32fast::hash(&payload).to_le_bytes());
    Ok(())
}

/// `Ok(false)` on a clean end of input, `Ok(true)` when `buf` was filled.
/// A partial fill is reported as `UnexpectedEof`.
fn fill(reader: &mut impl Read, buf: &mut [u8]) -> io::Result<bool> {
    let mut read = 0;
    while read < buf.len() {
        match reader.read(&mut buf[read..]) {
            Ok(0) if read == 0 => return Ok(false),
            Ok(0) => return Err(ErrorKind::UnexpectedEof.into()),
            Ok(n) => read += n,
            Err(e) if e.kind() == ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(true)
}

enum Next {
    Record(Event, u64),
    End,
    /// Why the tail was rejected.
    Torn(&'static str),
}

fn next_record(reader: &mut impl Read) -> io::Result<Next> {
    let mut header = [0u8; 4];
    match fill(reader, &mut header) {
        Ok(true) => {}
        Ok(false) => return Ok(Next::End),
        Err(e) if e.kind() == ErrorKind::UnexpectedEof => return Ok(Next::Torn("partial length")),
        Err(e) => return Err(e),
    }
    let len = u32::from_le_bytes(header) as usize;
    if len > MAX_WAL_RECORD {
        return Ok(Next::Torn("length prefix out of range"));
    }

    let mut body = vec![0u8; len + 4];
    match fill(reader, &mut body) {
        Ok(true) => {}
        Ok(false) => return Ok(Next::Torn("partial record")),
        Err(e) if e.kind() == ErrorKind::UnexpectedEof => return Ok(Next::Torn("partial record")),
        Err(e) => return Err(e),
    }
    let (payload, crc) = body.split_at(len);
    let crc = u32::from_le_bytes([crc[0], crc[1], crc[2], crc[3]]);
    if crc != crc32fast::hash(payload) {
        return Ok(Next::Torn("checksum mismatch"));
    }
    match serde_json::from_slice(payload) {
        Ok(event) => Ok(Next::Record(event, 8 + len as u64)),
        Err(_) => Ok(Next::Torn("undecodable payload")),
    }
}

/// What a log holds on disk.
#[derive(Debug, Default)]
pub struct Replay {
    pub events: Vec<Event>,
    /// Byte length of the whole-record prefix.
    pub valid_len: u64,
    /// Bytes after `valid_len` that recovery will discard.
    pub torn_bytes: u64,
}

/// Read every whole record. Stops at the first torn or corrupt one; nothing
/// after it can be trusted.
pub fn replay(path: &Path) -> io::Result<Replay> {
    let file = match File::open(path) {
        Ok(f) => f,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Replay::default()),
        Err(e) => return Err(e),
    };
    let file_len = file.metadata()?.len();
    let mut reader = BufReader::new(file);
    let mut out = Replay::default();
    loop {
        match next_record(&mut reader)? {
            Next::Record(event, size) => {
                out.events.push(event);
                out.valid_len += size;
            }
            Next::End => break,
            Next::Torn(reason) => {
                out.torn_bytes = file_len - out.valid_len;
                warn!(
                    path = %path.display(),
                    offset = out.valid_len,
                    bytes = out.torn_bytes,
                    reason,
                    "discarding torn WAL tail"
                );
                break;
            }
        }
    }
    Ok(out)
}

/// Append handle owned by the store's writer task.
pub struct Wal {
    file: File,
    path: PathBuf,
    /// Length of the file up to the last acknowledged batch.
    len: u64,
    appends_since_rewrite: u64,
}

impl Wal {
    /// Recover the log at `path`, cutting off any torn tail, and open it for
    /// appending. Returns the recovered events alongside the handle.
    pub fn open(path: &Path) -> io::Result<(Self, Vec<Event>)> {
        let recovered = replay(path)?;
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        if recovered.torn_bytes > 0 {
            file.set_len(recovered.valid_len)?;
            file.sync_all()?;
        }
        let wal = Self {
            file,
            path: path.to_path_buf(),
            len: recovered.valid_len,
            appends_since_rewrite: 0,
        };
        Ok((wal, recovered.events))
    }

    /// Write a batch and fsync once. On failure the file is cut back to its
    /// previous length so a half-written batch cannot shadow later ones.
    pub fn append(&mut self, events: &[Event]) -> io::Result<()> {
        let mut buf = Vec::new();
        for event in events {
            encode(&mut buf, event)?;
        }
        let written = self
            .file
            .write_all(&buf)
            .and_then(|()| self.file.sync_data());
        if let Err(e) = written {
            if let Err(undo) = self.file.set_len(self.len) {
                warn!(
                    path = %self.path.display(),
                    error = %undo,
                    "could not roll back failed WAL append"
                );
            }
            return Err(e);
        }
        self.len += buf.len() as u64;
        self.appends_since_rewrite += events.len() as u64;
        Ok(())
    }

    /// Replace the log with `events` via a synced temp file and a rename.
    pub fn rewrite(&mut self, events: &[Event]) -> io::Result<()> {
        let tmp = self.path.with_extension("wal.tmp");
        let mut buf = Vec::new();
        for event in events {
            encode(&mut buf, event)?;
        }
        {
            let mut file = File::create(&tmp)?;
            file.write_all(&buf)?;
            file.sync_all()?;
        }
        fs::rename(&tmp, &self.path)?;
        self.file = OpenOptions::new().append(true).open(&self.path)?;
        self.len = buf.len() as u64;
        self.appends_since_rewrite = 0;
        Ok(())
    }

    pub fn appends_since_rewrite(&self) -> u64 {
        self.appends_since_rewrite
    }
}
