use std::borrow::Cow;
use std::fmt;
use std::fs;
use std::io::{self, Write};
use std::marker::PhantomData;
use std::path::{Path, PathBuf};

use serde::Serialize;
use serde::de::DeserializeOwned;
use sha2::{Digest, Sha256};
use tempfile::NamedTempFile;

use super::CacheBackend;
use crate::config::Config;
use crate::error::PersistError;

/// The directory inside the cache directory that holds all multiplexer files.
const MUX_DIR: &str = "Mux";

/// The directory inside the root that holds files which are still being written.
const TMP_DIR: &str = "tmp";

/// A backend that stores every value as a JSON file.
///
/// The layout inside the root directory is:
///
/// - `<domain>.Map/<key>.json` for the values of each domain,
/// - `tmp/` for files that are still being written.
///
/// Domains and keys that are not plain file names, for instance because they contain `:` or
/// `/`, are stored under a readable prefix followed by `.` and their hex-formatted SHA-256 hash.
/// Plain names never contain a `.`, so every domain and key maps to its own file. New files are written to a temporary file
/// first and then atomically moved into place, so a concurrent [`load`](CacheBackend::load)
/// never observes a partially written value.
pub struct JsonDiskCache<T> {
    root: PathBuf,
    _value: PhantomData<fn() -> T>,
}

impl<T> JsonDiskCache<T> {
    /// Creates a backend storing its files under `root`.
    ///
    /// Directories are created lazily on the first save.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            _value: PhantomData,
        }
    }

    /// Creates a backend in the configured cache directory, or in the platform cache directory
    /// if none is configured.
    pub fn from_config(config: &Config) -> io::Result<Self> {
        let root = config
            .cache_dir(MUX_DIR)
            .or_else(|| dirs::cache_dir().map(|dir| dir.join(MUX_DIR)))
            .ok_or_else(|| {
                io::Error::new(io::ErrorKind::NotFound, "no cache directory available")
            })?;

        Ok(Self::new(root))
    }

    /// The directory under which all files are stored.
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn domain_dir(&self, domain: &str) -> PathBuf {
        self.root.join(format!("{}.Map", path_segment(domain)))
    }

    fn entry_path(&self, key: &str, domain: &str) -> PathBuf {
        self.domain_dir(domain).join(format!("{}.json", path_segment(key)))
    }

    fn tempfile(&self) -> io::Result<NamedTempFile> {
        let tmp_dir = self.root.join(TMP_DIR);
        fs::create_dir_all(&tmp_dir)?;
        tempfile::Builder::new().prefix("tmp").tempfile_in(tmp_dir)
    }
}

impl<T> Clone for JsonDiskCache<T> {
    fn clone(&self) -> Self {
        Self::new(self.root.clone())
    }
}

impl<T> fmt::Debug for JsonDiskCache<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JsonDiskCache")
            .field("root", &self.root)
            .finish()
    }
}

impl<T> CacheBackend<T> for JsonDiskCache<T>
where
    T: Serialize + DeserializeOwned,
{
    fn load(&self, key: &str, domain: &str) -> Option<T> {
        let path = self.entry_path(key, domain);
        tracing::trace!("Trying cache file at path {}", path.display());

        let file = match catch_not_found(|| fs::File::open(&path)) {
            Ok(Some(file)) => file,
            Ok(None) => return None,
            Err(e) => {
                tracing::warn!(
                    error = &e as &dyn std::error::Error,
                    path = %path.display(),
                    "Failed to open cache file",
                );
                return None;
            }
        };

        match serde_json::from_reader(io::BufReader::new(file)) {
            Ok(value) => Some(value),
            Err(e) => {
                tracing::warn!(
                    error = &e as &dyn std::error::Error,
                    path = %path.display(),
                    "Failed to decode cache file",
                );
                None
            }
        }
    }

    fn save(&self, value: &T, key: &str, domain: &str) -> Result<(), PersistError> {
        let path = self.entry_path(key, domain);
        let bytes = serde_json::to_vec(value)?;

        let mut temp_file = self.tempfile()?;
        temp_file.write_all(&bytes)?;

        tracing::trace!("Writing cache file at path {}", path.display());
        persist_tempfile(temp_file, &path)?;
        Ok(())
    }

    fn clear(&self, key: &str, domain: &str) -> Result<(), PersistError> {
        let path = self.entry_path(key, domain);
        catch_not_found(|| fs::remove_file(&path))?;
        Ok(())
    }

    fn clear_domain(&self, domain: &str) -> Result<(), PersistError> {
        let dir = self.domain_dir(domain);
        catch_not_found(|| fs::remove_dir_all(&dir))?;
        Ok(())
    }

    fn name(&self) -> &'static str {
        "json"
    }
}

/// Moves a fully written temp file to `path`, creating the parent directory as needed.
fn persist_tempfile(mut temp_file: NamedTempFile, path: &Path) -> io::Result<fs::File> {
    let parent = path
        .parent()
        .ok_or_else(|| io::Error::other("no parent directory to persist item"))?;

    // A concurrent `clear_domain` may remove the directory right after it was created.
    const MAX_RETRIES: usize = 2;
    let mut retries = 0;
    loop {
        retries += 1;

        if let Err(e) = fs::create_dir_all(parent) {
            tracing::error!("Failed to create cache directory: {:?}", e);
            if retries > MAX_RETRIES {
                return Err(e);
            }
            continue;
        }

        match temp_file.persist(path) {
            Ok(file) => return Ok(file),
            Err(e) => {
                temp_file = e.file;
                let err = e.error;
                tracing::error!("Failed to create cache file: {:?}", err);
                if retries > MAX_RETRIES {
                    return Err(err);
                }
            }
        }
    }
}

fn catch_not_found<F, R>(f: F) -> io::Result<Option<R>>
where
    F: FnOnce() -> io::Result<R>,
{
    match f() {
        Ok(x) => Ok(Some(x)),
        Err(e) => match e.kind() {
            io::ErrorKind::NotFound => Ok(None),
            _ => Err(e),
        },
    }
}

/// Maximum length of a name that is used verbatim as a path segment.
const MAX_PLAIN_LEN: usize = 128;

/// Length of the readable prefix kept in front of the hash of a non-plain name.
const HASHED_PREFIX_LEN: usize = 32;

fn is_plain_byte(b: u8) -> bool {
    b.is_ascii_alphanumeric() || matches!(b, b'-' | b'_' | b'@' | b'+' | b'=')
}

/// Turns a domain or key into a file name that is unique for every input.
///
/// Plain names are used as they are. Everything else becomes `<prefix>.<sha256>`, where the
/// prefix replaces all other characters with `_`. This protects against:
/// * ".." and absolute paths
/// * ":" (not a threat on POSIX filesystems, but confuses OS X Finder)
/// * characters Windows does not allow in file names
/// * names exceeding file name length limits
fn path_segment(name: &str) -> Cow<'_, str> {
    let is_plain =
        !name.is_empty() && name.len() <= MAX_PLAIN_LEN && name.bytes().all(is_plain_byte);

    if is_plain {
        return Cow::Borrowed(name);
    }

    let prefix: String = name
        .chars()
        .take(HASHED_PREFIX_LEN)
        .map(|c| if c.is_ascii() && is_plain_byte(c as u8) { c } else { '_' })
        .collect();
    let hash = Sha256::digest(name.as_bytes());
    let hex: String = hash.iter().map(|b| format!("{b:02x}")).collect();
    Cow::Owned(format!("{prefix}.{hex}"))
}
