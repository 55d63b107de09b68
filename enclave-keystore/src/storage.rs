//! Storage backends: where the keystore document lives.

use crate::error::KeystoreError;

use rand_core::{OsRng, RngCore};
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::RwLock;

#[cfg(unix)]
const KEYSTORE_FILE_MODE: u32 = 0o600;
#[cfg(unix)]
const KEYSTORE_DIR_MODE: u32 = 0o700;

// ---------------------------------------------------------------------------
// Storage trait
// ---------------------------------------------------------------------------

/// Backend for persisting the single keystore document.
///
/// Backends deal in raw text; schema checks belong to
/// [`Keystore`](crate::keystore::Keystore). `write` must replace the document
/// atomically: a reader sees either the old contents or the new ones.
pub trait KeystoreBackend: Send + Sync {
    fn read(&self) -> Result<Option<String>, KeystoreError>;
    fn write(&self, contents: &str) -> Result<(), KeystoreError>;
    /// Write the document only if none exists, atomically with the check.
    /// Fails with [`KeystoreError::AlreadyExists`] otherwise.
    fn create_new(&self, contents: &str) -> Result<(), KeystoreError>;
    /// Remove the document. Removing a missing document is not an error.
    fn remove(&self) -> Result<(), KeystoreError>;
    fn exists(&self) -> Result<bool, KeystoreError>;

    /// Filesystem location, when there is one.
    fn path(&self) -> Option<&Path> {
        None
    }
}

// ---------------------------------------------------------------------------
// In-memory backend
// ---------------------------------------------------------------------------

/// In-memory storage (for testing and ephemeral use).
pub struct InMemoryBackend {
    doc: RwLock<Option<String>>,
    fail_writes: AtomicBool,
}

impl InMemoryBackend {
    pub fn new() -> Self {
        Self {
            doc: RwLock::new(None),
            fail_writes: AtomicBool::new(false),
        }
    }

    /// Make every subsequent write fail with an I/O error.
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }
}

impl Default for InMemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl KeystoreBackend for InMemoryBackend {
    fn read(&self) -> Result<Option<String>, KeystoreError> {
        let doc = self.doc.read().unwrap_or_else(|e| e.into_inner());
        Ok(doc.clone())
    }

    fn write(&self, contents: &str) -> Result<(), KeystoreError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(KeystoreError::io("write", "simulated failure"));
        }
        let mut doc = self.doc.write().unwrap_or_else(|e| e.into_inner());
        *doc = Some(contents.to_string());
        Ok(())
    }

    fn create_new(&self, contents: &str) -> Result<(), KeystoreError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(KeystoreError::io("write", "simulated failure"));
        }
        let mut doc = self.doc.write().unwrap_or_else(|e| e.into_inner());
        if doc.is_some() {
            return Err(KeystoreError::AlreadyExists);
        }
        *doc = Some(contents.to_string());
        Ok(())
    }

    fn remove(&self) -> Result<(), KeystoreError> {
        let mut doc = self.doc.write().unwrap_or_else(|e| e.into_inner());
        *doc = None;
        Ok(())
    }

    fn exists(&self) -> Result<bool, KeystoreError> {
        Ok(self.doc.read().unwrap_or_else(|e| e.into_inner()).is_some())
    }
}

// ---------------------------------------------------------------------------
// File backend
// ---------------------------------------------------------------------------

/// Single JSON file, owner read/write only.
///
/// Writes go to a uniquely named temp file in the same directory, which is
/// fsynced and then renamed over the target. `create_new` hard-links the temp
/// file into place instead, so it cannot replace a document that appeared
/// after the caller checked:
/// ```text
/// data_dir/
///   .keystore.json.<random>.tmp   (transient)
///   keystore.json
/// ```
pub struct FileBackend {
    path: PathBuf,
}

impl FileBackend {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    fn dir(&self) -> PathBuf {
        match self.path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
            _ => PathBuf::from("."),
        }
    }

    fn temp_path(&self, dir: &Path) -> PathBuf {
        let mut suffix = [0u8; 8];
        OsRng.fill_bytes(&mut suffix);
        let name = self
            .path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "keystore".into());
        dir.join(format!(".{}.{}.tmp", name, hex::encode(suffix)))
    }

    fn ensure_dir(dir: &Path) -> Result<(), KeystoreError> {
        if dir.exists() {
            return Ok(());
        }
        fs::create_dir_all(dir).map_err(|e| KeystoreError::io("create dir", e))?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(dir, fs::Permissions::from_mode(KEYSTORE_DIR_MODE))
                .map_err(|e| KeystoreError::io("chmod dir", e))?;
        }
        Ok(())
    }

    fn write_temp(tmp: &Path, contents: &str) -> io::Result<()> {
        let mut opts = fs::OpenOptions::new();
        opts.write(true).create_new(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            opts.mode(KEYSTORE_FILE_MODE);
        }
        let mut file = opts.open(tmp)?;
        // The umask can only narrow the mode, but re-assert it anyway.
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            file.set_permissions(fs::Permissions::from_mode(KEYSTORE_FILE_MODE))?;
        }
        file.write_all(contents.as_bytes())?;
        file.sync_all()
    }

    fn sync_dir(dir: &Path) {
        // Not every platform can open a directory.
        #[cfg(unix)]
        if let Ok(d) = fs::File::open(dir) {
            let _ = d.sync_all();
        }
        #[cfg(not(unix))]
        let _ = dir;
    }
}

impl KeystoreBackend for FileBackend {
    fn read(&self) -> Result<Option<String>, KeystoreError> {
        match fs::read_to_string(&self.path) {
            Ok(data) => Ok(Some(data)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(KeystoreError::io("read", e)),
        }
    }

    fn write(&self, contents: &str) -> Result<(), KeystoreError> {
        let dir = self.dir();
        Self::ensure_dir(&dir)?;

        let tmp = self.temp_path(&dir);
        if let Err(e) = Self::write_temp(&tmp, contents) {
            let _ = fs::remove_file(&tmp);
            return Err(KeystoreError::io("write", e));
        }
        if let Err(e) = fs::rename(&tmp, &self.path) {
            let _ = fs::remove_file(&tmp);
            return Err(KeystoreError::io("rename", e));
        }
        Self::sync_dir(&dir);
        Ok(())
    }

    fn create_new(&self, contents: &str) -> Result<(), KeystoreError> {
        let dir = self.dir();
        Self::ensure_dir(&dir)?;

        let tmp = self.temp_path(&dir);
        if let Err(e) = Self::write_temp(&tmp, contents) {
            let _ = fs::remove_file(&tmp);
            return Err(KeystoreError::io("write", e));
        }
        // link(2) refuses an existing target, unlike rename(2).
        let linked = fs::hard_link(&tmp, &self.path);
        let _ = fs::remove_file(&tmp);
        match linked {
            Ok(()) => {
                Self::sync_dir(&dir);
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => Err(KeystoreError::AlreadyExists),
            Err(e) => Err(KeystoreError::io("link", e)),
        }
    }

    fn remove(&self) -> Result<(), KeystoreError> {
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(KeystoreError::io("delete", e)),
        }
    }

    fn exists(&self) -> Result<bool, KeystoreError> {
        match fs::metadata(&self.path) {
            Ok(_) => Ok(true),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(KeystoreError::io("stat", e)),
        }
    }

    fn path(&self) -> Option<&Path> {
        Some(&self.path)
    }
}
