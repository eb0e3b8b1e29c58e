use log::{error, warn};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fs::{File, OpenOptions};
#[cfg(not(unix))]
use std::io::Write;
use std::io::{self, Read, Seek, SeekFrom};
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Append-only JSON-lines log. Every append is followed by `fdatasync`
/// before it returns.
#[derive(Debug)]
pub struct JsonLinesLog<T> {
    path: PathBuf,
    file: File,
    next_offset: u64,
    _entry: PhantomData<fn() -> T>,
}

impl<T> JsonLinesLog<T>
where
    T: Serialize + DeserializeOwned,
{
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, DurabilityLogError> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let mut file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(&path)?;
        let mut contents = Vec::new();
        file.read_to_end(&mut contents)?;
        let next_offset = complete_prefix_len(&contents);
        if next_offset < contents.len() as u64 {
            warn!(
                "event=json_log_torn_tail_truncated path={} offset={} dropped_bytes={}",
                path.display(),
                next_offset,
                contents.len() as u64 - next_offset
            );
            file.set_len(next_offset)?;
            file.sync_data()?;
        }
        Ok(Self {
            path,
            file,
            next_offset,
            _entry: PhantomData,
        })
    }

    pub fn append(&mut self, entry: &T) -> Result<(), DurabilityLogError> {
        let mut payload = serde_json::to_vec(entry)?;
        payload.push(b'\n');
        self.write_payload(&payload)?;
        self.next_offset = self.next_offset.saturating_add(payload.len() as u64);
        self.file.sync_data().map_err(|err| {
            error!(
                "event=json_log_fdatasync_failed path={} error={}",
                self.path.display(),
                err
            );
            err
        })?;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn read_all(&mut self) -> Result<Vec<T>, DurabilityLogError> {
        self.file.seek(SeekFrom::Start(0))?;
        let mut contents = Vec::new();
        self.file.read_to_end(&mut contents)?;
        parse_entries(&contents)
    }

    /// Reads an existing log without opening it for writes. A missing file
    /// yields no entries.
    pub fn load(path: impl AsRef<Path>) -> Result<Vec<T>, DurabilityLogError> {
        match std::fs::read(path) {
            Ok(contents) => parse_entries(&contents),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(err) => Err(err.into()),
        }
    }

    fn write_payload(&mut self, payload: &[u8]) -> Result<(), DurabilityLogError> {
        #[cfg(unix)]
        {
            use std::os::unix::fs::FileExt;
            self.file.write_all_at(payload, self.next_offset)?;
        }
        #[cfg(not(unix))]
        {
            self.file.seek(SeekFrom::Start(self.next_offset))?;
            self.file.write_all(payload)?;
        }
        Ok(())
    }
}

#[derive(Debug, Error)]
pub enum DurabilityLogError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Length of the newline-terminated prefix; anything after it is a torn
/// append.
fn complete_prefix_len(contents: &[u8]) -> u64 {
    contents
        .iter()
        .rposition(|byte| *byte == b'\n')
        .map_or(0, |position| position as u64 + 1)
}

/// An unterminated final line (crash mid-append) is dropped; a bad
/// terminated line is corruption.
fn parse_entries<T>(contents: &[u8]) -> Result<Vec<T>, DurabilityLogError>
where
    T: DeserializeOwned,
{
    let complete = complete_prefix_len(contents) as usize;
    if complete < contents.len() {
        error!(
            "event=json_log_torn_tail_dropped offset={} bytes={}",
            complete,
            contents.len() - complete
        );
    }
    let mut entries = Vec::new();
    for line in contents[..complete].split(|byte| *byte == b'\n') {
        if line.iter().all(u8::is_ascii_whitespace) {
            continue;
        }
        entries.push(serde_json::from_slice(line)?);
    }
    Ok(entries)
}
