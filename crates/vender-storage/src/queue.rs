//! Durable FIFO journal.
//!
//! Every mutation is appended as one record:
//!
//! ```text
//! len u32 BE | crc32 u32 BE | op u8 | payload
//!              \---- covers op + payload ----/
//!
//! op 1 push    payload = id u64 BE | data
//! op 2 delete  payload = id u64 BE
//! ```
//!
//! Open replays the journal. A broken tail is moved aside to
//! `PATH.corrupt` and cut off. When deletes outnumber live entries the
//! journal is rewritten with only the live pushes; ids survive.

use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

use crc::{CRC_32_ISCSI, Crc};
use tokio::sync::Notify;
use tracing::{debug, info, warn};

use crate::error::{Result, StorageError};

const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISCSI);
const HEADER_SIZE: usize = 8;
const OP_PUSH: u8 = 1;
const OP_DELETE: u8 = 2;
const COMPACT_MIN_DELETED: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    pub id: u64,
    pub data: Vec<u8>,
}

#[derive(Debug)]
pub struct Queue {
    path: PathBuf,
    inner: Mutex<Inner>,
    notify: Notify,
}

#[derive(Debug)]
struct Inner {
    file: File,
    live: BTreeMap<u64, Vec<u8>>,
    next_id: u64,
    deleted: usize,
    closed: bool,
}

fn record(op: u8, id: u64, data: &[u8]) -> Vec<u8> {
    let body_len = 1 + 8 + data.len();
    let mut b = Vec::with_capacity(HEADER_SIZE + body_len);
    b.extend_from_slice(&(body_len as u32).to_be_bytes());
    b.extend_from_slice(&[0; 4]);
    b.push(op);
    b.extend_from_slice(&id.to_be_bytes());
    b.extend_from_slice(data);
    let sum = CRC32.checksum(&b[HEADER_SIZE..]);
    b[4..HEADER_SIZE].copy_from_slice(&sum.to_be_bytes());
    b
}

enum Op<'a> {
    Push(u64, &'a [u8]),
    Delete(u64),
}

/// Decode one record at the start of `buf`, returning it and its size.
fn decode(buf: &[u8]) -> std::result::Result<(Op<'_>, usize), String> {
    if buf.len() < HEADER_SIZE {
        return Err(format!("short header remaining={}", buf.len()));
    }
    let len = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
    let sum = u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]);
    if len < 9 {
        return Err(format!("record length={len}"));
    }
    let Some(body) = buf.get(HEADER_SIZE..HEADER_SIZE + len) else {
        return Err(format!("record length={len} remaining={}", buf.len() - HEADER_SIZE));
    };
    let actual = CRC32.checksum(body);
    if actual != sum {
        return Err(format!("crc stored={sum:08x} actual={actual:08x}"));
    }
    let mut id = [0u8; 8];
    id.copy_from_slice(&body[1..9]);
    let id = u64::from_be_bytes(id);
    let op = match body[0] {
        OP_PUSH => Op::Push(id, &body[9..]),
        OP_DELETE if len == 9 => Op::Delete(id),
        other => return Err(format!("unknown op={other} length={len}")),
    };
    Ok((op, HEADER_SIZE + len))
}

fn sidecar(path: &Path, suffix: &str) -> PathBuf {
    let mut s = path.as_os_str().to_owned();
    s.push(suffix);
    PathBuf::from(s)
}

impl Queue {
    /// Open or create the journal at `path` and replay it.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let mut raw = Vec::new();
        match File::open(&path) {
            Ok(mut f) => {
                f.read_to_end(&mut raw)?;
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }

        let mut live = BTreeMap::new();
        let mut next_id = 1;
        let mut deleted = 0;
        let mut offset = 0;
        while offset < raw.len() {
            match decode(&raw[offset..]) {
                Ok((Op::Push(id, data), n)) => {
                    live.insert(id, data.to_vec());
                    next_id = next_id.max(id + 1);
                    offset += n;
                }
                Ok((Op::Delete(id), n)) => {
                    if live.remove(&id).is_some() {
                        deleted += 1;
                    }
                    offset += n;
                }
                Err(reason) => {
                    let aside = sidecar(&path, ".corrupt");
                    warn!(
                        path = %path.display(),
                        offset,
                        tail = raw.len() - offset,
                        reason = %reason,
                        "queue journal tail corrupt, moved aside"
                    );
                    fs::write(&aside, &raw[offset..])?;
                    break;
                }
            }
        }

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)?;
        if (offset as u64) < file.metadata()?.len() {
            file.set_len(offset as u64)?;
        }
        info!(path = %path.display(), live = live.len(), "queue opened");
        Ok(Self {
            path,
            inner: Mutex::new(Inner {
                file,
                live,
                next_id,
                deleted,
                closed: false,
            }),
            notify: Notify::new(),
        })
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn append(inner: &mut Inner, bytes: &[u8]) -> Result<()> {
        inner.file.write_all(bytes)?;
        inner.file.sync_data()?;
        Ok(())
    }

    /// Append `data`, returning its id.
    pub fn push(&self, data: &[u8]) -> Result<u64> {
        let mut inner = self.lock();
        if inner.closed {
            return Err(StorageError::Closed);
        }
        let id = inner.next_id;
        Self::append(&mut inner, &record(OP_PUSH, id, data))?;
        inner.next_id += 1;
        inner.live.insert(id, data.to_vec());
        drop(inner);
        self.notify.notify_waiters();
        Ok(id)
    }

    /// Oldest entry without removing it, if any.
    pub fn try_peek(&self) -> Result<Option<Entry>> {
        let inner = self.lock();
        if inner.closed {
            return Err(StorageError::Closed);
        }
        Ok(inner.live.first_key_value().map(|(id, data)| Entry {
            id: *id,
            data: data.clone(),
        }))
    }

    /// Wait for the oldest entry. Returns [`StorageError::Closed`] once the
    /// queue is closed.
    pub async fn peek(&self) -> Result<Entry> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if let Some(entry) = self.try_peek()? {
                return Ok(entry);
            }
            notified.await;
        }
    }

    pub fn delete(&self, id: u64) -> Result<()> {
        let mut inner = self.lock();
        if inner.closed {
            return Err(StorageError::Closed);
        }
        if !inner.live.contains_key(&id) {
            return Err(StorageError::NotFound { id });
        }
        Self::append(&mut inner, &record(OP_DELETE, id, &[]))?;
        inner.live.remove(&id);
        inner.deleted += 1;
        self.maybe_compact(&mut inner)
    }

    /// Delete `id` and push `data` in one journal write.
    pub fn delete_push(&self, id: u64, data: &[u8]) -> Result<u64> {
        let mut inner = self.lock();
        if inner.closed {
            return Err(StorageError::Closed);
        }
        if !inner.live.contains_key(&id) {
            return Err(StorageError::NotFound { id });
        }
        let new_id = inner.next_id;
        let mut bytes = record(OP_DELETE, id, &[]);
        bytes.extend(record(OP_PUSH, new_id, data));
        Self::append(&mut inner, &bytes)?;
        inner.live.remove(&id);
        inner.deleted += 1;
        inner.next_id += 1;
        inner.live.insert(new_id, data.to_vec());
        self.maybe_compact(&mut inner)?;
        drop(inner);
        self.notify.notify_waiters();
        Ok(new_id)
    }

    fn maybe_compact(&self, inner: &mut Inner) -> Result<()> {
        if inner.deleted <= inner.live.len() || inner.deleted <= COMPACT_MIN_DELETED {
            return Ok(());
        }
        let tmp = sidecar(&self.path, ".tmp");
        {
            let mut f = File::create(&tmp)?;
            for (id, data) in &inner.live {
                f.write_all(&record(OP_PUSH, *id, data))?;
            }
            f.sync_all()?;
        }
        fs::rename(&tmp, &self.path)?;
        inner.file = OpenOptions::new().append(true).open(&self.path)?;
        debug!(
            path = %self.path.display(),
            dropped = inner.deleted,
            live = inner.live.len(),
            "queue compacted"
        );
        inner.deleted = 0;
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.lock().live.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Stop accepting work and wake pending [`Queue::peek`] calls.
    pub fn close(&self) {
        self.lock().closed = true;
        self.notify.notify_waiters();
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;
    use tempfile::TempDir;

    fn journal(dir: &TempDir) -> PathBuf {
        dir.path().join("tele.queue")
    }

    #[test]
    fn test_fifo_and_delete() {
        let dir = TempDir::new().unwrap();
        let q = Queue::open(journal(&dir)).unwrap();
        assert_eq!(q.try_peek().unwrap(), None);
        let a = q.push(b"a").unwrap();
        let b = q.push(b"b").unwrap();
        assert!(a < b);
        assert_eq!(q.try_peek().unwrap().unwrap().data, b"a");
        q.delete(a).unwrap();
        assert_eq!(q.try_peek().unwrap().unwrap().id, b);
        assert!(matches!(q.delete(a), Err(StorageError::NotFound { .. })));
        assert_eq!(q.len(), 1);
    }

    #[test]
    fn test_replay_keeps_ids() {
        let dir = TempDir::new().unwrap();
        let (a, b) = {
            let q = Queue::open(journal(&dir)).unwrap();
            let a = q.push(b"a").unwrap();
            let b = q.push(b"b").unwrap();
            q.delete(a).unwrap();
            (a, b)
        };
        let q = Queue::open(journal(&dir)).unwrap();
        assert_eq!(q.len(), 1);
        assert_eq!(q.try_peek().unwrap().unwrap(), Entry { id: b, data: b"b".to_vec() });
        assert!(q.push(b"c").unwrap() > b.max(a));
    }

    #[test]
    fn test_corrupt_tail_moved_aside() {
        let dir = TempDir::new().unwrap();
        let path = journal(&dir);
        {
            let q = Queue::open(&path).unwrap();
            q.push(b"kept").unwrap();
        }
        let good_len = fs::metadata(&path).unwrap().len();
        let mut f = OpenOptions::new().append(true).open(&path).unwrap();
        f.write_all(&[0, 0, 0, 40, 1, 2, 3]).unwrap();
        drop(f);

        let q = Queue::open(&path).unwrap();
        assert_eq!(q.len(), 1);
        assert_eq!(fs::metadata(&path).unwrap().len(), good_len);
        assert_eq!(fs::read(sidecar(&path, ".corrupt")).unwrap().len(), 7);
        q.push(b"after").unwrap();
        drop(q);
        assert_eq!(Queue::open(&path).unwrap().len(), 2);
    }

    #[test]
    fn test_compaction_preserves_ids() {
        let dir = TempDir::new().unwrap();
        let path = journal(&dir);
        let q = Queue::open(&path).unwrap();
        let keep = q.push(b"keep").unwrap();
        for _ in 0..100 {
            let id = q.push(b"tmp").unwrap();
            q.delete(id).unwrap();
        }
        let size = fs::metadata(&path).unwrap().len();
        assert!(size < 100 * 2 * 17, "journal not compacted, size={size}");
        drop(q);
        let q = Queue::open(&path).unwrap();
        assert_eq!(q.try_peek().unwrap().unwrap().id, keep);
    }

    #[test]
    fn test_delete_push() {
        let dir = TempDir::new().unwrap();
        let q = Queue::open(journal(&dir)).unwrap();
        let a = q.push(b"old").unwrap();
        let b = q.delete_push(a, b"new").unwrap();
        assert_ne!(a, b);
        assert_eq!(q.try_peek().unwrap().unwrap().data, b"new");
    }

    #[tokio::test]
    async fn test_peek_waits_for_push() {
        let dir = TempDir::new().unwrap();
        let q = Arc::new(Queue::open(journal(&dir)).unwrap());
        let waiter = tokio::spawn({
            let q = q.clone();
            async move { q.peek().await }
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        q.push(b"x").unwrap();
        let entry = waiter.await.unwrap().unwrap();
        assert_eq!(entry.data, b"x");
    }

    #[tokio::test]
    async fn test_close_wakes_peek() {
        let dir = TempDir::new().unwrap();
        let q = Arc::new(Queue::open(journal(&dir)).unwrap());
        let waiter = tokio::spawn({
            let q = q.clone();
            async move { q.peek().await }
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        q.close();
        assert!(matches!(waiter.await.unwrap(), Err(StorageError::Closed)));
        assert!(matches!(q.push(b"late"), Err(StorageError::Closed)));
    }
}
