//! Identifiers and the per-file metadata record.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};

/// Opaque 128-bit identifier of a stored file.
///
/// Drawn from the thread-local CSPRNG and rendered as 32 lowercase hex
/// characters, which is also the file name on disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FileId([u8; 16]);

impl FileId {
    /// Creates FileId from raw bytes.
    pub fn new(bytes: [u8; 16]) -> Self {
        Self(bytes)
    }

    /// Generates a fresh random identifier.
    pub fn generate() -> Self {
        let mut bytes = [0u8; 16];
        rand::rng().fill(&mut bytes);
        Self(bytes)
    }

    /// Returns reference to underlying 16 bytes.
    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }
}

impl fmt::Display for FileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.0 {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

/// Error returned when a string is not a valid file identifier.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Invalid file id: {input}")]
pub struct ParseFileIdError {
    input: String,
}

impl FromStr for FileId {
    type Err = ParseFileIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || ParseFileIdError {
            input: s.to_string(),
        };
        // Uppercase would map two names onto one id.
        if s.len() != 32 || s.bytes().any(|b| b.is_ascii_uppercase()) {
            return Err(invalid());
        }
        let mut bytes = [0u8; 16];
        hex::decode_to_slice(s, &mut bytes).map_err(|_| invalid())?;
        Ok(Self(bytes))
    }
}

impl Serialize for FileId {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for FileId {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Identifier of a member of the volume set: its configured root path.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VolumeId(String);

impl VolumeId {
    /// Creates VolumeId from its textual form.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the identifier as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for VolumeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Metadata record for one stored file.
///
/// All fields are fixed at creation. `expires_at` is never refreshed by
/// reads.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileEntry {
    pub id: FileId,
    pub volume: VolumeId,
    pub original_name: String,
    pub content_type: String,
    pub size_bytes: u64,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl FileEntry {
    /// Checks whether the entry is logically gone at `now`.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }

    /// Time left before expiry, zero once expired.
    pub fn remaining(&self, now: DateTime<Utc>) -> std::time::Duration {
        (self.expires_at - now).to_std().unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeDelta;

    use super::*;

    fn create_test_entry(created_at: DateTime<Utc>) -> FileEntry {
        FileEntry {
            id: FileId::new([0xab; 16]),
            volume: VolumeId::new("/srv/a"),
            original_name: "report.pdf".to_string(),
            content_type: "application/pdf".to_string(),
            size_bytes: 42,
            created_at,
            expires_at: created_at + TimeDelta::hours(24),
        }
    }

    #[test]
    fn test_file_id_display_and_parse() {
        let id = FileId::new([
            0x01, 0x23, 0x45, 0x67, 0x89, 0xab, 0xcd, 0xef, 0x01, 0x23, 0x45, 0x67, 0x89, 0xab,
            0xcd, 0xef,
        ]);
        let text = id.to_string();

        assert_eq!(text, "0123456789abcdef0123456789abcdef");
        assert_eq!(text.parse::<FileId>().unwrap(), id);
    }

    #[test]
    fn test_file_id_rejects_malformed_input() {
        assert!("".parse::<FileId>().is_err());
        assert!("0123".parse::<FileId>().is_err());
        assert!("zz23456789abcdef0123456789abcdef".parse::<FileId>().is_err());
        assert!("0123456789ABCDEF0123456789ABCDEF".parse::<FileId>().is_err());
        assert!("../../etc/passwd".parse::<FileId>().is_err());
    }

    #[test]
    fn test_generated_ids_are_distinct() {
        let ids: std::collections::HashSet<FileId> = (0..1000).map(|_| FileId::generate()).collect();
        assert_eq!(ids.len(), 1000);
    }

    #[test]
    fn test_entry_expiry_boundary() {
        let created_at = Utc::now();
        let entry = create_test_entry(created_at);

        assert!(!entry.is_expired(created_at));
        assert!(!entry.is_expired(entry.expires_at - TimeDelta::seconds(1)));
        assert!(entry.is_expired(entry.expires_at));
        assert_eq!(entry.remaining(entry.expires_at + TimeDelta::seconds(5)), std::time::Duration::ZERO);
    }

    #[test]
    fn test_entry_json_uses_hex_id() {
        let entry = create_test_entry(Utc::now());
        let json = serde_json::to_value(&entry).unwrap();

        assert_eq!(json["id"], "abababababababababababababababab");
        assert_eq!(json["volume"], "/srv/a");

        let decoded: FileEntry = serde_json::from_value(json).unwrap();
        assert_eq!(decoded, entry);
    }
}
