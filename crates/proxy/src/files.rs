//! File capture: open/chunk quest streams and one-shot dumps, written under
//! the configured save directory with timestamped names.

use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::error::Result;
use crate::wire::FILE_CHUNK_MAX;

pub fn unix_ns() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or(0)
}

/// Maps control characters, non-ASCII bytes, path separators, and a leading
/// dot to underscores. Server-declared filenames are untrusted.
pub fn sanitize_filename(name: &str) -> String {
    let mut out: String = name
        .bytes()
        .map(|b| {
            if !(0x20..=0x7E).contains(&b) || b == b'/' || b == b'\\' {
                '_'
            } else {
                b as char
            }
        })
        .collect();
    if out.starts_with('.') {
        out.replace_range(0..1, "_");
    }
    out
}

/// One-shot dump; returns the path written.
pub fn save_dump(dir: &Path, filename: &str, data: &[u8]) -> Result<PathBuf> {
    let path = dir.join(filename);
    let mut f = File::create(&path)?;
    f.write_all(data)?;
    Ok(path)
}

/// An open stream fed by chunk commands; closed when the remaining-bytes
/// counter reaches zero.
pub struct SavingFile {
    pub basename: String,
    pub output_filename: PathBuf,
    pub remaining_bytes: u32,
    file: File,
}

impl SavingFile {
    pub fn create(
        dir: &Path,
        basename: impl Into<String>,
        output_filename: &str,
        remaining_bytes: u32,
    ) -> Result<Self> {
        let output_filename = dir.join(output_filename);
        let file = File::create(&output_filename)?;
        Ok(Self {
            basename: basename.into(),
            output_filename,
            remaining_bytes,
            file,
        })
    }

    /// Appends one chunk, capped at the protocol maximum. Returns true when
    /// the stream is complete. A chunk that claims more than the remaining
    /// counter zeroes it out.
    pub fn write_chunk(&mut self, data: &[u8]) -> Result<bool> {
        let n = data.len().min(FILE_CHUNK_MAX);
        self.file.write_all(&data[..n])?;
        if n as u32 > self.remaining_bytes {
            log::warn!(
                "files.chunk_overrun file={} remaining={} got={}",
                self.output_filename.display(),
                self.remaining_bytes,
                n
            );
            self.remaining_bytes = 0;
        } else {
            self.remaining_bytes -= n as u32;
        }
        Ok(self.remaining_bytes == 0)
    }
}
