//! File system attribute cache storage.
//!
//! Implements [`CacheStore`] over one JSON file per peer. All I/O is
//! synchronous, so completions are posted into the sink before each call
//! returns; the engine tolerates that ordering because store completions
//! re-enter it as messages.

use std::collections::HashMap;
use std::io::{Cursor, Write};
use std::path::{Path, PathBuf};
use std::{fs, io};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, warn};

use gattc::att::Status;
use gattc::cache::CacheRecord;
use gattc::le::Addr;
use gattc::store::{CacheStore, StoreMsg, StoreSink, BATCH_RECORDS, FORMAT_VERSION};
use gattc::transport::ConnId;

/// Attribute cache database stored in a file system directory.
#[derive(Debug)]
pub struct FileStore<S> {
    dir: Dir,
    sink: S,
    open: Mutex<HashMap<ConnId, Session>>,
}

/// One open load or save sequence.
#[derive(Debug)]
struct Session {
    peer: Addr,
    write: bool,
    recs: Vec<CacheRecord>,
}

impl<S: StoreSink> FileStore<S> {
    const NAME: &'static str = "cache";

    /// Creates or opens a cache database in the specified root directory.
    #[inline(always)]
    #[must_use]
    pub fn open(root: impl AsRef<Path>, sink: S) -> Self {
        Self::with_dir(Dir::open(root, Self::NAME), sink)
    }

    /// Creates or opens a cache database in the current user's local data
    /// directory.
    ///
    /// # Panics
    ///
    /// Panics if it cannot determine the user directory.
    #[inline(always)]
    #[must_use]
    pub fn per_user(app: impl AsRef<Path>, sink: S) -> Self {
        Self::with_dir(Dir::per_user(app, Self::NAME), sink)
    }

    fn with_dir(dir: Dir, sink: S) -> Self {
        Self {
            dir,
            sink,
            open: Mutex::new(HashMap::new()),
        }
    }
}

impl<S: StoreSink> CacheStore for FileStore<S> {
    fn open(&self, conn: ConnId, peer: Addr, write: bool) {
        let status = if write {
            self.open.lock().insert(conn, Session {
                peer,
                write: true,
                recs: Vec::new(),
            });
            Status::Ok
        } else {
            match self.dir.load(peer) {
                Some(recs) => {
                    self.open.lock().insert(conn, Session {
                        peer,
                        write: false,
                        recs,
                    });
                    Status::Ok
                }
                None => Status::Error,
            }
        };
        self.sink.complete(StoreMsg::Opened { conn, status });
    }

    fn load(&self, conn: ConnId, peer: Addr, index: u16) {
        let open = self.open.lock();
        let msg = match open.get(&conn) {
            Some(s) if !s.write && s.peer == peer => {
                let i = usize::from(index).min(s.recs.len());
                let n = BATCH_RECORDS.min(s.recs.len() - i);
                StoreMsg::Loaded {
                    conn,
                    status: if i + n < s.recs.len() {
                        Status::More
                    } else {
                        Status::Ok
                    },
                    recs: s.recs[i..i + n].to_vec(),
                }
            }
            _ => StoreMsg::Loaded {
                conn,
                status: Status::Error,
                recs: Vec::new(),
            },
        };
        drop(open);
        self.sink.complete(msg);
    }

    fn save(&self, conn: ConnId, peer: Addr, index: u16, recs: Vec<CacheRecord>, last: bool) {
        let mut open = self.open.lock();
        let status = match open.get_mut(&conn) {
            // Batches must arrive in order without gaps.
            Some(s) if s.write && s.peer == peer && usize::from(index) == s.recs.len() => {
                s.recs.extend(recs);
                if !last || self.dir.save(peer, &s.recs) {
                    Status::Ok
                } else {
                    Status::Error
                }
            }
            _ => Status::Error,
        };
        drop(open);
        self.sink.complete(StoreMsg::Saved { conn, status });
    }

    fn close(&self, conn: ConnId, _peer: Addr) {
        self.open.lock().remove(&conn);
    }

    fn reset(&self, peer: Addr) {
        self.dir.remove(peer);
    }
}

/// On-disk representation of one peer's cache.
#[derive(Debug, Deserialize, Serialize)]
struct CacheFile {
    version: u8,
    recs: Vec<CacheRecord>,
}

/// Database in a file system directory.
#[derive(Clone, Debug)]
#[repr(transparent)]
struct Dir(PathBuf);

impl Dir {
    const FILE_NAME_FMT: &'static str = "P-001122334455";

    /// Creates or opens a database store in the specified root directory.
    #[inline(always)]
    #[must_use]
    fn open(root: impl AsRef<Path>, name: impl AsRef<Path>) -> Self {
        Self(root.as_ref().join(name))
    }

    /// Creates or opens a database store in the current user's local data
    /// directory.
    ///
    /// # Panics
    ///
    /// Panics if it cannot determine the user directory.
    #[must_use]
    fn per_user(app: impl AsRef<Path>, name: impl AsRef<Path>) -> Self {
        let dir = dirs::data_local_dir()
            .expect("user directory not available")
            .join(app.as_ref())
            .join(name);
        Self(dir)
    }

    /// Saves peer records to the file system.
    fn save(&self, peer: Addr, recs: &[CacheRecord]) -> bool {
        let v = CacheFile {
            version: FORMAT_VERSION,
            recs: recs.to_vec(),
        };
        let s = serde_json::to_string_pretty(&v).expect("failed to serialize cache");
        if let Err(e) = fs::create_dir_all(&self.0) {
            warn!(
                "Failed to create database directory: {} ({e})",
                self.0.display()
            );
        }
        let path = self.path(peer);
        // TODO: Make atomic?
        match fs::File::create(&path)
            .and_then(|mut f| f.write_all(s.as_bytes()).and_then(|_| f.sync_data()))
        {
            Ok(_) => {
                debug!("Wrote: {}", path.display());
                true
            }
            Err(e) => {
                error!("Failed to write: {} ({e})", path.display());
                false
            }
        }
    }

    /// Loads peer records from the file system. Returns `None` for a
    /// missing, unreadable, malformed, or version-mismatched file.
    fn load(&self, peer: Addr) -> Option<Vec<CacheRecord>> {
        let path = self.path(peer);
        let s = match fs::read_to_string(&path) {
            Ok(s) => s,
            Err(e) if matches!(e.kind(), io::ErrorKind::NotFound) => return None,
            Err(e) => {
                error!("Failed to read: {} ({e})", path.display());
                return None;
            }
        };
        let v: CacheFile = match serde_json::from_str(&s) {
            Ok(v) => v,
            Err(e) => {
                error!("Invalid file contents: {} ({e})", path.display());
                return None;
            }
        };
        if v.version != FORMAT_VERSION {
            warn!(
                "Unsupported cache version {} in {}",
                v.version,
                path.display()
            );
            return None;
        }
        Some(v.recs)
    }

    /// Removes peer records from the file system.
    fn remove(&self, peer: Addr) {
        let path = self.path(peer);
        match fs::remove_file(&path) {
            Ok(_) => {}
            Err(e) if matches!(e.kind(), io::ErrorKind::NotFound) => {}
            Err(e) => error!("Failed to remove: {} ({e})", path.display()),
        }
    }

    /// Returns the cache file path for the specified peer address.
    fn path(&self, peer: Addr) -> PathBuf {
        let (raw, typ) = match peer {
            Addr::Public(ref raw) => (raw.as_le_bytes(), 'P'),
            Addr::Random(ref raw) => (raw.as_le_bytes(), 'R'),
        };
        let mut buf = Cursor::new([0_u8; Self::FILE_NAME_FMT.len()]);
        write!(
            buf,
            "{typ}-{:02X}{:02X}{:02X}{:02X}{:02X}{:02X}",
            raw[5], raw[4], raw[3], raw[2], raw[1], raw[0]
        )
        .expect("cache file name overflow");
        // SAFETY: `buf` contains a valid UTF-8 string
        (self.0).join(unsafe { std::str::from_utf8_unchecked(buf.get_ref()) })
    }
}
