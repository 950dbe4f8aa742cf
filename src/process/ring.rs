//! # OutputRing: bounded rotating capture of one launch's output.
//!
//! Combined stdout/stderr of a process is appended to a sequence of files
//! `<base>.out.<seq>`, each capped at a fixed size. When the active file
//! exceeds the cap a new one is opened; when the file count exceeds the cap
//! the oldest is unlinked. Sequence numbers only grow, so `(index, position)`
//! pairs handed to callers stay valid cursors across rotation (a rotated-away
//! index is clamped forward).
//!
//! ## Rules
//! - Appends take the ring's own mutex; never the registry's
//! - `exit_code` is reported only when the process has terminated AND the
//!   caller has drained up to the final file
//! - A fresh ring wipes the previous launch's files

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::PathBuf;
use std::sync::Mutex;

use crate::error::AppError;

/// One `fetch` result: bytes plus the cursor to echo back next call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FetchChunk {
    pub bytes: Vec<u8>,
    /// File index to pass to the next `fetch`.
    pub index: u64,
    /// Byte offset within `index` to pass to the next `fetch`.
    pub position: u64,
    /// Set once the process terminated and this chunk reaches the end of the
    /// final file.
    pub exit_code: Option<i32>,
}

struct RingState {
    /// Oldest sequence still on disk.
    first: u64,
    /// Active (append) sequence.
    last: u64,
    /// Size of the active file.
    active_size: u64,
    /// Append handle for the active file.
    active: Option<File>,
    /// Recorded once the process is reaped.
    exit_code: Option<i32>,
    terminated: bool,
}

/// Rotating bounded output log for one process launch.
pub struct OutputRing {
    dir: PathBuf,
    base: String,
    max_files: usize,
    max_size: u64,
    state: Mutex<RingState>,
}

impl OutputRing {
    /// Creates a fresh ring, removing files left by a previous launch.
    pub fn create(
        dir: PathBuf,
        base: impl Into<String>,
        max_files: usize,
        max_size: u64,
    ) -> Result<Self, AppError> {
        let base = base.into();
        std::fs::create_dir_all(&dir)?;
        // Previous launch's files are stale the moment a new ring exists.
        if let Ok(entries) = std::fs::read_dir(&dir) {
            let prefix = format!("{base}.out.");
            for entry in entries.flatten() {
                if entry
                    .file_name()
                    .to_string_lossy()
                    .starts_with(prefix.as_str())
                {
                    let _ = std::fs::remove_file(entry.path());
                }
            }
        }
        Ok(Self {
            dir,
            base,
            max_files: max_files.max(1),
            max_size: max_size.max(1),
            state: Mutex::new(RingState {
                first: 0,
                last: 0,
                active_size: 0,
                active: None,
                exit_code: None,
                terminated: false,
            }),
        })
    }

    /// Reopens a ring left by a previous daemon instance, keeping its files.
    ///
    /// Used on crash-recovery re-attach, where the launch (and its output)
    /// predates this process.
    pub fn reopen(
        dir: PathBuf,
        base: impl Into<String>,
        max_files: usize,
        max_size: u64,
    ) -> Result<Self, AppError> {
        let base = base.into();
        std::fs::create_dir_all(&dir)?;
        let prefix = format!("{base}.out.");
        let mut seqs: Vec<u64> = Vec::new();
        if let Ok(entries) = std::fs::read_dir(&dir) {
            for entry in entries.flatten() {
                let name = entry.file_name();
                if let Some(seq) = name
                    .to_string_lossy()
                    .strip_prefix(prefix.as_str())
                    .and_then(|s| s.parse().ok())
                {
                    seqs.push(seq);
                }
            }
        }
        let first = seqs.iter().copied().min().unwrap_or(0);
        let last = seqs.iter().copied().max().unwrap_or(0);
        let active_size = std::fs::metadata(dir.join(format!("{base}.out.{last}")))
            .map(|m| m.len())
            .unwrap_or(0);
        Ok(Self {
            dir,
            base,
            max_files: max_files.max(1),
            max_size: max_size.max(1),
            state: Mutex::new(RingState {
                first,
                last,
                active_size,
                active: None,
                exit_code: None,
                terminated: false,
            }),
        })
    }

    fn file_path(&self, seq: u64) -> PathBuf {
        self.dir.join(format!("{}.out.{seq}", self.base))
    }

    /// Appends bytes, rotating when the active file exceeds the size cap.
    pub fn append(&self, bytes: &[u8]) -> Result<(), AppError> {
        if bytes.is_empty() {
            return Ok(());
        }
        let mut st = self.state.lock().expect("ring mutex poisoned");
        if st.active.is_none() {
            st.active = Some(
                OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(self.file_path(st.last))?,
            );
        }
        st.active.as_mut().expect("just opened").write_all(bytes)?;
        st.active_size += bytes.len() as u64;

        if st.active_size >= self.max_size {
            st.active = None;
            st.active_size = 0;
            st.last += 1;
            while st.last - st.first + 1 > self.max_files as u64 {
                let _ = std::fs::remove_file(self.file_path(st.first));
                st.first += 1;
            }
        }
        Ok(())
    }

    /// Records the exit code; `fetch` reports it once the caller reaches the
    /// end of the final file.
    pub fn mark_terminated(&self, exit_code: Option<i32>) {
        let mut st = self.state.lock().expect("ring mutex poisoned");
        st.terminated = true;
        st.exit_code = exit_code;
    }

    /// Oldest index still readable.
    pub fn first_index(&self) -> u64 {
        self.state.lock().expect("ring mutex poisoned").first
    }

    /// Active (final, once terminated) index.
    pub fn last_index(&self) -> u64 {
        self.state.lock().expect("ring mutex poisoned").last
    }

    /// Reads from `(index, position)` to the end of that file.
    ///
    /// A rotated-away index is clamped forward to the oldest available file
    /// at position 0. When the returned chunk is empty and a newer file
    /// exists, the cursor advances so the caller converges on the tail.
    pub fn fetch(&self, index: u64, position: u64) -> Result<FetchChunk, AppError> {
        let (first, last, terminated, exit_code) = {
            let st = self.state.lock().expect("ring mutex poisoned");
            (st.first, st.last, st.terminated, st.exit_code)
        };

        let (mut index, mut position) = if index < first {
            (first, 0)
        } else {
            (index.min(last), position)
        };

        let mut bytes = Vec::new();
        match File::open(self.file_path(index)) {
            Ok(mut f) => {
                let len = f.metadata()?.len();
                if position < len {
                    f.seek(SeekFrom::Start(position))?;
                    f.read_to_end(&mut bytes)?;
                    position += bytes.len() as u64;
                }
            }
            // Nothing ever written to this sequence yet.
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }

        // Drained a rotated file: move the cursor to the next one.
        if bytes.is_empty() && index < last {
            index += 1;
            position = 0;
        }

        let at_tail = index == last;
        Ok(FetchChunk {
            bytes,
            index,
            position,
            exit_code: (terminated && at_tail).then_some(exit_code.unwrap_or(0)),
        })
    }

    /// Concatenates everything still on disk (oldest first).
    ///
    /// Convenience for synchronous one-shot runs.
    pub fn read_all(&self) -> Result<Vec<u8>, AppError> {
        let (first, last) = {
            let st = self.state.lock().expect("ring mutex poisoned");
            (st.first, st.last)
        };
        let mut out = Vec::new();
        for seq in first..=last {
            match File::open(self.file_path(seq)) {
                Ok(mut f) => {
                    f.read_to_end(&mut out)?;
                }
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn ring(dir: &TempDir, max_files: usize, max_size: u64) -> OutputRing {
        OutputRing::create(dir.path().to_path_buf(), "demo", max_files, max_size).unwrap()
    }

    #[test]
    fn append_then_fetch() {
        let dir = TempDir::new().unwrap();
        let r = ring(&dir, 3, 1024);
        r.append(b"hello ").unwrap();
        r.append(b"world").unwrap();

        let chunk = r.fetch(0, 0).unwrap();
        assert_eq!(chunk.bytes, b"hello world");
        assert_eq!(chunk.position, 11);
        assert_eq!(chunk.exit_code, None, "not terminated yet");

        // Cursor echo: nothing new.
        let chunk = r.fetch(chunk.index, chunk.position).unwrap();
        assert!(chunk.bytes.is_empty());
    }

    #[test]
    fn exit_code_only_at_final_file_tail() {
        let dir = TempDir::new().unwrap();
        let r = ring(&dir, 3, 1024);
        r.append(b"hi\n").unwrap();
        r.mark_terminated(Some(7));

        let chunk = r.fetch(0, 0).unwrap();
        assert_eq!(chunk.bytes, b"hi\n");
        assert_eq!(chunk.exit_code, Some(7));
    }

    #[test]
    fn rotation_caps_file_count() {
        let dir = TempDir::new().unwrap();
        let r = ring(&dir, 2, 8);
        // Each append crosses the 8-byte cap → one file per append.
        for i in 0..5u8 {
            r.append(format!("chunk-{i}--").as_bytes()).unwrap();
        }
        assert!(r.first_index() >= 3, "old files unlinked");
        assert_eq!(r.last_index(), 5);
        let on_disk = std::fs::read_dir(dir.path()).unwrap().count();
        assert!(on_disk <= 2, "at most max_files files on disk, got {on_disk}");
    }

    #[test]
    fn stale_cursor_clamps_forward() {
        let dir = TempDir::new().unwrap();
        let r = ring(&dir, 2, 8);
        for i in 0..4u8 {
            r.append(format!("block-{i}--").as_bytes()).unwrap();
        }
        // Index 0 rotated away long ago.
        let chunk = r.fetch(0, 3).unwrap();
        assert!(chunk.index >= r.first_index());
        assert_eq!(chunk.position, chunk.bytes.len() as u64);
    }

    #[test]
    fn empty_drained_file_advances_cursor() {
        let dir = TempDir::new().unwrap();
        let r = ring(&dir, 3, 4);
        r.append(b"12345").unwrap(); // rotates: file 0 closed, active = 1
        r.append(b"abc").unwrap();

        let c0 = r.fetch(0, 0).unwrap();
        assert_eq!(c0.bytes, b"12345");
        let c1 = r.fetch(c0.index, c0.position).unwrap();
        assert_eq!(c1.index, 1, "cursor advanced past drained file");
        let c2 = r.fetch(c1.index, c1.position).unwrap();
        assert_eq!(c2.bytes, b"abc");
    }

    #[test]
    fn fresh_ring_wipes_previous_launch() {
        let dir = TempDir::new().unwrap();
        let r = ring(&dir, 3, 1024);
        r.append(b"old").unwrap();
        drop(r);
        let r = ring(&dir, 3, 1024);
        let chunk = r.fetch(0, 0).unwrap();
        assert!(chunk.bytes.is_empty(), "previous launch files removed");
    }
}
