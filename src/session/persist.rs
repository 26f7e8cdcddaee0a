//! Persistence of the last known identity.
//!
//! The record is read at startup so the UI can render optimistically while
//! the session is verified in the background.

use crate::error::{Result, SyncError};
use crate::types::Identity;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

/// Magic bytes for the session file.
const SESSION_MAGIC: &[u8; 4] = b"SES\0";

/// Current session file format version.
const SESSION_VERSION: u8 = 1;

/// Upper bound on the encoded identity record.
const MAX_RECORD_LEN: usize = 64 * 1024;

/// Storage for the single persisted identity record.
pub trait SessionStore: Send + Sync {
    fn load(&self) -> Result<Option<Identity>>;
    fn save(&self, identity: &Identity) -> Result<()>;
    fn clear(&self) -> Result<()>;
}

#[derive(Serialize, Deserialize)]
struct PersistedSession {
    identity: Identity,
    /// Seconds since Unix epoch.
    saved_at: u64,
}

/// File-backed session record.
///
/// Layout: magic, version, payload length (u32 LE), MessagePack payload,
/// CRC32 of the payload (u32 LE). Writes go to a temporary file that is
/// renamed over the record.
pub struct FileSessionStore {
    path: PathBuf,
}

impl FileSessionStore {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self.path.file_name().unwrap_or_default().to_os_string();
        name.push(".tmp");
        self.path.with_file_name(name)
    }
}

impl SessionStore for FileSessionStore {
    fn load(&self) -> Result<Option<Identity>> {
        if !self.path.exists() {
            return Ok(None);
        }

        let mut file = File::open(&self.path)?;

        let mut magic = [0u8; 4];
        file.read_exact(&mut magic)?;
        if &magic != SESSION_MAGIC {
            return Err(SyncError::InvalidFormat("Invalid session magic".into()));
        }

        let mut version = [0u8; 1];
        file.read_exact(&mut version)?;
        if version[0] != SESSION_VERSION {
            return Err(SyncError::InvalidFormat(format!(
                "Unsupported session version: {}",
                version[0]
            )));
        }

        let mut len_bytes = [0u8; 4];
        file.read_exact(&mut len_bytes)?;
        let len = u32::from_le_bytes(len_bytes) as usize;
        if len > MAX_RECORD_LEN {
            return Err(SyncError::InvalidFormat(format!(
                "Session record too large: {} bytes",
                len
            )));
        }

        let mut payload = vec![0u8; len];
        file.read_exact(&mut payload)?;

        let mut checksum_bytes = [0u8; 4];
        file.read_exact(&mut checksum_bytes)?;
        let expected = u32::from_le_bytes(checksum_bytes);
        let got = crc32fast::hash(&payload);
        if expected != got {
            return Err(SyncError::ChecksumMismatch { expected, got });
        }

        let session: PersistedSession = rmp_serde::from_slice(&payload)?;
        Ok(Some(session.identity))
    }

    fn save(&self, identity: &Identity) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        let session = PersistedSession {
            identity: identity.clone(),
            saved_at: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .unwrap_or_default()
                .as_secs(),
        };
        let payload = rmp_serde::to_vec_named(&session)?;

        let temp = self.temp_path();
        {
            let mut file = OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .open(&temp)?;
            file.write_all(SESSION_MAGIC)?;
            file.write_all(&[SESSION_VERSION])?;
            file.write_all(&(payload.len() as u32).to_le_bytes())?;
            file.write_all(&payload)?;
            file.write_all(&crc32fast::hash(&payload).to_le_bytes())?;
            file.sync_all()?;
        }
        fs::rename(&temp, &self.path)?;
        Ok(())
    }

    fn clear(&self) -> Result<()> {
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// In-memory session record (tests, ephemeral sessions).
#[derive(Default)]
pub struct MemorySessionStore {
    identity: Mutex<Option<Identity>>,
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_identity(identity: Identity) -> Self {
        Self {
            identity: Mutex::new(Some(identity)),
        }
    }
}

impl SessionStore for MemorySessionStore {
    fn load(&self) -> Result<Option<Identity>> {
        Ok(self.identity.lock().clone())
    }

    fn save(&self, identity: &Identity) -> Result<()> {
        *self.identity.lock() = Some(identity.clone());
        Ok(())
    }

    fn clear(&self) -> Result<()> {
        *self.identity.lock() = None;
        Ok(())
    }
}
