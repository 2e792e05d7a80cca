use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use tracing::info;

use crate::error::NodeError;
use crate::MemberId;

/// The name of the file holding the member id within the data directory.
pub const IDENTITY_FILE: &str = "member-id";

#[derive(Debug, Clone)]
/// Persists the member id of a process across restarts.
///
/// The file holds the id followed by the CRC32 checksum of its textual
/// form, e.g. `42:<crc32 as hex>`. A file which fails the checksum is rejected
/// rather than silently replaced with a new identity.
pub struct IdentityStore {
    path: PathBuf,
}

impl IdentityStore {
    /// Creates a new store keeping the identity in the given data directory.
    pub fn new(data_dir: impl AsRef<Path>) -> Self {
        Self {
            path: data_dir.as_ref().join(IDENTITY_FILE),
        }
    }

    #[inline]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Loads the persisted member id if one exists.
    pub fn load(&self) -> Result<Option<MemberId>, NodeError> {
        let content = match std::fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        decode(&content)
            .map(Some)
            .map_err(|reason| NodeError::CorruptIdentity {
                path: self.path.clone(),
                reason,
            })
    }

    /// Persists the given member id, replacing any existing one.
    pub fn store(&self, member: MemberId) -> Result<(), NodeError> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let tmp = self.path.with_extension("tmp");
        std::fs::write(&tmp, encode(member))?;
        std::fs::rename(&tmp, &self.path)?;

        Ok(())
    }

    /// Loads the persisted member id or creates and persists a new random one.
    pub fn load_or_create(&self) -> Result<MemberId, NodeError> {
        if let Some(member) = self.load()? {
            return Ok(member);
        }

        let member = MemberId::new(rand::random());
        self.store(member)?;

        info!(
            member_id = %member,
            path = %self.path.display(),
            "Created new member identity."
        );

        Ok(member)
    }
}

fn encode(member: MemberId) -> String {
    let id = member.to_string();
    format!("{}:{:08x}\n", id, crc32fast::hash(id.as_bytes()))
}

fn decode(content: &str) -> Result<MemberId, String> {
    let (id, checksum) = content
        .trim()
        .split_once(':')
        .ok_or_else(|| "missing checksum".to_string())?;

    let expected = u32::from_str_radix(checksum, 16)
        .map_err(|e| format!("invalid checksum {checksum:?}: {e}"))?;
    let actual = crc32fast::hash(id.as_bytes());
    if expected != actual {
        return Err(format!(
            "checksum mismatch, expected {expected:08x} got {actual:08x}"
        ));
    }

    id.parse::<MemberId>()
        .map_err(|e| format!("invalid member id {id:?}: {e}"))
}
