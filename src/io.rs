use std::{
    fs::{File, OpenOptions},
    io,
    path::Path,
};

use memmap2::{MmapOptions, MmapRaw};
use snafu::{ResultExt, Snafu};

#[cfg(unix)]
const FILE_MODE_OWNER_RW_GROUP_RO: u32 = 0o640;

/// Error opening a file-backed region.
#[derive(Debug, Snafu)]
pub(crate) enum OpenFileError {
    /// A general I/O error, including the file being absent when creation
    /// was not requested.
    #[snafu(display("backing file I/O error: {}", source))]
    Io { source: io::Error },

    /// The file exists but its length does not match the configured
    /// geometry, and the caller did not permit reconciling it. The file is
    /// left untouched.
    #[snafu(display("backing file is {} bytes, configuration expects {}", actual, expected))]
    Mismatch { actual: u64, expected: u64 },
}

/// A memory-mapped backing region for one of the cache's two files.
///
/// File-backed regions persist across process restarts; anonymous regions are
/// plain private memory discarded at close. Both are exposed as a raw mapping
/// so the engine can hand out shared read views of pinned payload ranges while
/// concurrently writing other, disjoint ranges in place.
pub(crate) struct Backing {
    map: MmapRaw,
    file: Option<File>,
}

/// Result of opening a file-backed region.
pub(crate) struct OpenOutcome {
    pub backing: Backing,
    /// The file was created, or its length was reconciled to the configured
    /// geometry. Either way, its previous contents (if any) are not to be
    /// trusted.
    pub fresh: bool,
}

impl Backing {
    /// Opens (or, when `create` is set, creates) the file at `path` and maps
    /// it at exactly `len` bytes.
    ///
    /// A pre-existing file of a different length is resized only when
    /// `reconcile` permits it, and is then reported as fresh so the caller
    /// rebuilds the contents. Without `reconcile`, a length mismatch is
    /// reported as an error and the file is not modified.
    pub fn open_file(
        path: &Path,
        len: u64,
        create: bool,
        reconcile: bool,
    ) -> Result<OpenOutcome, OpenFileError> {
        let file = writable_file_options(create).open(path).context(IoSnafu)?;

        let actual_len = file.metadata().context(IoSnafu)?.len();
        let fresh = actual_len != len;
        if fresh {
            if !reconcile {
                return MismatchSnafu {
                    actual: actual_len,
                    expected: len,
                }
                .fail();
            }
            debug!(
                path = %path.display(),
                actual_len,
                expected_len = len,
                "Backing file length mismatch. Resizing.",
            );
            file.set_len(len).context(IoSnafu)?;
        }

        let map = MmapOptions::new()
            .len(len as usize)
            .map_raw(&file)
            .context(IoSnafu)?;
        Ok(OpenOutcome {
            backing: Backing {
                map,
                file: Some(file),
            },
            fresh,
        })
    }

    /// Creates an anonymous mapping of `len` bytes, zero-filled.
    pub fn open_anonymous(len: u64) -> io::Result<Backing> {
        let map = MmapOptions::new().len(len as usize).map_anon()?;
        Ok(Backing {
            map: MmapRaw::from(map),
            file: None,
        })
    }

    pub fn is_file_backed(&self) -> bool {
        self.file.is_some()
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    /// Raw base pointer of the mapping.
    ///
    /// All reads and writes through this pointer must stay within `len()` and
    /// must not overlap live shared views handed out by the engine; the pin
    /// bookkeeping in the engine core upholds the latter.
    pub fn ptr(&self) -> *mut u8 {
        self.map.as_mut_ptr()
    }

    /// Flushes the whole mapping to disk. No-op for anonymous regions.
    pub fn flush(&self) -> io::Result<()> {
        if self.file.is_some() {
            self.map.flush()
        } else {
            Ok(())
        }
    }

    /// Flushes `[offset, offset + len)` to disk. No-op for anonymous regions.
    pub fn flush_range(&self, offset: usize, len: usize) -> io::Result<()> {
        if self.file.is_some() && len > 0 {
            self.map.flush_range(offset, len)
        } else {
            Ok(())
        }
    }
}

/// Builds a set of `OpenOptions` for opening a backing file as
/// readable/writable, optionally creating it if it does not already exist.
///
/// On Unix platforms, file permissions will be set so that only the owning
/// user of the file can write to it, the owning group can read it, and the
/// file is inaccessible otherwise.
fn writable_file_options(create: bool) -> OpenOptions {
    let mut open_options = OpenOptions::new();
    open_options.read(true).write(true).create(create);

    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        open_options.mode(FILE_MODE_OWNER_RW_GROUP_RO);
    }

    open_options
}
