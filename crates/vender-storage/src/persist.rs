//! Checksummed state files.
//!
//! ```text
//!   PATH         data | crc64(data) BE
//!   PATH.backup  same bytes, written after PATH
//! ```
//!
//! Each copy is written to a temporary file, synced and renamed into
//! place. Reads prefer the main copy and fall back to the backup.

use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crc::{CRC_64_XZ, Crc};
use tracing::{debug, warn};

use crate::error::{Result, StorageError};

const CRC64: Crc<u64> = Crc::<u64>::new(&CRC_64_XZ);
const CHECK_SIZE: usize = 8;

pub fn checksum(data: &[u8]) -> u64 {
    CRC64.checksum(data)
}

pub fn backup_path(path: &Path) -> PathBuf {
    let mut s = path.as_os_str().to_owned();
    s.push(".backup");
    PathBuf::from(s)
}

fn seal(data: &[u8]) -> Vec<u8> {
    let mut b = Vec::with_capacity(data.len() + CHECK_SIZE);
    b.extend_from_slice(data);
    b.extend_from_slice(&checksum(data).to_be_bytes());
    b
}

/// Strip and verify the trailer.
fn unseal(raw: &[u8]) -> std::result::Result<&[u8], String> {
    if raw.len() < CHECK_SIZE {
        return Err(format!("length={} shorter than checksum", raw.len()));
    }
    let (data, sum) = raw.split_at(raw.len() - CHECK_SIZE);
    let mut expect = [0u8; CHECK_SIZE];
    expect.copy_from_slice(sum);
    let expect = u64::from_be_bytes(expect);
    let actual = checksum(data);
    if expect != actual {
        return Err(format!("checksum stored={expect:016x} actual={actual:016x}"));
    }
    Ok(data)
}

fn write_synced(path: &Path, bytes: &[u8]) -> io::Result<()> {
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);
    {
        let mut f = File::create(&tmp)?;
        f.write_all(bytes)?;
        f.sync_all()?;
    }
    fs::rename(&tmp, path)
}

/// Write `data` to `path` and then to its backup.
///
/// # Errors
///
/// [`StorageError::PersistCritical`] when the main copy cannot be written.
/// A failed backup after a good main copy is only logged.
pub fn write(path: &Path, data: &[u8]) -> Result<()> {
    let sealed = seal(data);
    write_synced(path, &sealed).map_err(|e| StorageError::critical(path.display().to_string(), e))?;
    let backup = backup_path(path);
    if let Err(e) = write_synced(&backup, &sealed) {
        warn!(path = %backup.display(), error = %e, "persist backup write failed");
    }
    debug!(path = %path.display(), len = data.len(), "persist write");
    Ok(())
}

enum Slot {
    Good(Vec<u8>),
    Missing,
    Corrupt(String),
    Unreadable(io::Error),
}

fn read_copy(path: &Path) -> Slot {
    match fs::read(path) {
        Ok(raw) => match unseal(&raw) {
            Ok(data) => Slot::Good(data.to_vec()),
            Err(message) => Slot::Corrupt(message),
        },
        Err(e) if e.kind() == io::ErrorKind::NotFound => Slot::Missing,
        Err(e) => Slot::Unreadable(e),
    }
}

/// Read the newest good copy. `Ok(None)` when neither copy exists.
///
/// # Errors
///
/// [`StorageError::PersistCritical`] when a copy cannot be read and no good
/// copy exists; [`StorageError::PersistCorrupt`] when all existing copies
/// fail the checksum.
pub fn read(path: &Path) -> Result<Option<Vec<u8>>> {
    let main = read_copy(path);
    if let Slot::Good(data) = main {
        return Ok(Some(data));
    }
    let backup_file = backup_path(path);
    let backup = read_copy(&backup_file);
    let name = path.display().to_string();
    match (main, backup) {
        (main, Slot::Good(data)) => {
            let reason = match main {
                Slot::Missing => "missing".to_string(),
                Slot::Corrupt(m) => m,
                Slot::Unreadable(e) => e.to_string(),
                Slot::Good(_) => String::new(),
            };
            warn!(path = %name, reason = %reason, "persist main copy bad, using backup");
            Ok(Some(data))
        }
        (Slot::Missing, Slot::Missing) => Ok(None),
        (Slot::Unreadable(e), _) | (_, Slot::Unreadable(e)) => Err(StorageError::critical(name, e)),
        (Slot::Corrupt(m), _) | (_, Slot::Corrupt(m)) => Err(StorageError::corrupt(name, m)),
        (Slot::Good(_), _) | (_, Slot::Missing) => Ok(None),
    }
}

/// Named state file under a root directory, serialised by a mutex.
#[derive(Debug)]
pub struct Persist {
    tag: String,
    path: Option<PathBuf>,
    lock: Mutex<()>,
}

impl Persist {
    /// A disabled persist reads nothing and writes nowhere.
    ///
    /// # Errors
    ///
    /// [`StorageError::PersistCritical`] when enabled with an empty root or
    /// the directory cannot be created.
    pub fn new(root: &str, tag: &str, enabled: bool) -> Result<Self> {
        if !enabled {
            debug!(tag, "persist disabled");
            return Ok(Self {
                tag: tag.to_string(),
                path: None,
                lock: Mutex::new(()),
            });
        }
        if root.is_empty() {
            return Err(StorageError::critical(
                tag,
                io::Error::new(io::ErrorKind::InvalidInput, "persist enabled but root is empty"),
            ));
        }
        let dir = Path::new(root).join(tag);
        fs::create_dir_all(&dir).map_err(|e| StorageError::critical(dir.display().to_string(), e))?;
        Ok(Self {
            tag: tag.to_string(),
            path: Some(dir.join("state")),
            lock: Mutex::new(()),
        })
    }

    pub fn tag(&self) -> &str {
        &self.tag
    }

    pub fn is_enabled(&self) -> bool {
        self.path.is_some()
    }

    pub fn load(&self) -> Result<Option<Vec<u8>>> {
        let Some(path) = &self.path else {
            return Ok(None);
        };
        let _guard = self.lock.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        read(path)
    }

    pub fn store(&self, data: &[u8]) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let _guard = self.lock.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        write(path, data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use tempfile::TempDir;

    fn file(dir: &TempDir) -> PathBuf {
        dir.path().join("inventory")
    }

    #[test]
    fn test_write_read() {
        let dir = TempDir::new().unwrap();
        let path = file(&dir);
        assert_eq!(read(&path).unwrap(), None);
        write(&path, b"state").unwrap();
        assert_eq!(read(&path).unwrap(), Some(b"state".to_vec()));
        assert!(backup_path(&path).exists());
    }

    #[derive(Debug, Clone, Copy)]
    enum Damage {
        FlipFirst,
        FlipLast,
        Truncate,
        Remove,
    }

    fn damage(path: &Path, how: Damage) {
        let mut raw = fs::read(path).unwrap();
        match how {
            Damage::FlipFirst => raw[0] ^= 0xff,
            Damage::FlipLast => *raw.last_mut().unwrap() ^= 0x01,
            Damage::Truncate => raw.truncate(CHECK_SIZE - 1),
            Damage::Remove => return fs::remove_file(path).unwrap(),
        }
        fs::write(path, raw).unwrap();
    }

    #[rstest]
    #[case::flip_data(Damage::FlipFirst)]
    #[case::flip_checksum(Damage::FlipLast)]
    #[case::truncated(Damage::Truncate)]
    #[case::missing(Damage::Remove)]
    fn test_damaged_main_uses_backup(#[case] how: Damage) {
        let dir = TempDir::new().unwrap();
        let path = file(&dir);
        write(&path, b"good").unwrap();
        damage(&path, how);
        assert_eq!(read(&path).unwrap(), Some(b"good".to_vec()));
    }

    #[rstest]
    #[case::garbage(&b"garbage-garbage"[..], &b"x"[..])]
    #[case::both_short(&b"abc"[..], &b""[..])]
    #[case::bad_trailers(&b"state\0\0\0\0\0\0\0\0"[..], &b"state\xff\xff\xff\xff\xff\xff\xff\xff"[..])]
    fn test_both_copies_corrupt(#[case] main: &[u8], #[case] backup: &[u8]) {
        let dir = TempDir::new().unwrap();
        let path = file(&dir);
        fs::write(&path, main).unwrap();
        fs::write(backup_path(&path), backup).unwrap();
        assert!(read(&path).unwrap_err().is_corrupt());
    }

    #[test]
    fn test_checksum_vector() {
        assert_eq!(checksum(b"123456789"), 0x995d_c9bb_df19_39fa);
    }

    #[test]
    fn test_persist_disabled_and_enabled() {
        let off = Persist::new("", "inventory", false).unwrap();
        off.store(b"ignored").unwrap();
        assert_eq!(off.load().unwrap(), None);
        assert!(Persist::new("", "inventory", true).unwrap_err().is_critical());

        let dir = TempDir::new().unwrap();
        let root = dir.path().to_str().unwrap();
        let p = Persist::new(root, "inventory", true).unwrap();
        p.store(&[1, 2, 3]).unwrap();
        let again = Persist::new(root, "inventory", true).unwrap();
        assert_eq!(again.load().unwrap(), Some(vec![1, 2, 3]));
    }
}
