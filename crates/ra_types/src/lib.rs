//! Leaf-level newtypes for the report uploader.
//!
//! These types sit at the bottom of the dependency graph. Every crate can
//! depend on `ra_types` without pulling in the store or the runtime.
//!
//! `ObjectId` serializes as a transparent 24-character hex string so stored
//! documents stay wire-compatible with the report viewer.

use rand::Rng;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::OnceLock;
use std::time::{SystemTime, UNIX_EPOCH};

// ── ObjectId ────────────────────────────────────────────────────────────

const OBJECT_ID_LEN: usize = 12;

static PROCESS_UNIQUE: OnceLock<[u8; 5]> = OnceLock::new();
static COUNTER: OnceLock<AtomicU32> = OnceLock::new();

/// Document / blob identifier: 12 bytes, rendered as 24 lowercase hex chars.
///
/// Layout: 4-byte big-endian unix seconds, 5 bytes of per-process randomness,
/// 3-byte big-endian counter. Ids generated by one process are therefore
/// unique and roughly ordered by creation time.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectId([u8; OBJECT_ID_LEN]);

impl ObjectId {
    /// Generate a fresh id.
    pub fn new() -> Self {
        let secs = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs() as u32)
            .unwrap_or(0);
        let process = PROCESS_UNIQUE.get_or_init(|| rand::thread_rng().gen());
        let counter = COUNTER
            .get_or_init(|| AtomicU32::new(rand::thread_rng().gen_range(0..0x00ff_ffff)))
            .fetch_add(1, Ordering::Relaxed)
            & 0x00ff_ffff;

        let mut bytes = [0u8; OBJECT_ID_LEN];
        bytes[0..4].copy_from_slice(&secs.to_be_bytes());
        bytes[4..9].copy_from_slice(process);
        bytes[9..12].copy_from_slice(&counter.to_be_bytes()[1..4]);
        Self(bytes)
    }

    /// Validated constructor from the hex form.
    pub fn parse(s: &str) -> Result<Self, TypeParseError> {
        if s.len() != OBJECT_ID_LEN * 2 {
            return Err(TypeParseError::InvalidLength {
                kind: "ObjectId",
                expected: OBJECT_ID_LEN * 2,
                got: s.len(),
            });
        }
        let raw = hex::decode(s).map_err(|_| TypeParseError::InvalidChars {
            kind: "ObjectId",
            got: s.to_string(),
        })?;
        let mut bytes = [0u8; OBJECT_ID_LEN];
        bytes.copy_from_slice(&raw);
        Ok(Self(bytes))
    }

    pub fn bytes(&self) -> [u8; OBJECT_ID_LEN] {
        self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl Default for ObjectId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ObjectId({})", self.to_hex())
    }
}

impl FromStr for ObjectId {
    type Err = TypeParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl Serialize for ObjectId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for ObjectId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Self::parse(&s).map_err(serde::de::Error::custom)
    }
}

// ── Errors ──────────────────────────────────────────────────────────────

/// Error returned when constructing a newtype from an invalid string.
#[derive(Debug, Clone)]
pub enum TypeParseError {
    InvalidChars { kind: &'static str, got: String },
    InvalidLength {
        kind: &'static str,
        expected: usize,
        got: usize,
    },
}

impl fmt::Display for TypeParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidChars { kind, got } => {
                write!(f, "invalid characters in {}: '{}'", kind, got)
            }
            Self::InvalidLength {
                kind,
                expected,
                got,
            } => {
                write!(
                    f,
                    "invalid {} length: expected {}, got {}",
                    kind, expected, got
                )
            }
        }
    }
}

impl std::error::Error for TypeParseError {}

// ── Tests ───────────────────────────────────────────────────────────────
