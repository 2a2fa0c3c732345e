//! Random identities: connection fingerprints, runtime instances, transaction ids

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{ContextKind, FINGERPRINT_PREFIX, UID_LENGTH};

const BASE62: &[u8; 62] = b"0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz";

/// Random base62 string of `len` characters
pub fn base62(len: usize) -> String {
    let mut n = Uuid::new_v4().as_u128();
    let mut out = String::with_capacity(len);
    for _ in 0..len {
        out.push(BASE62[(n % 62) as usize] as char);
        n /= 62;
    }
    out
}

/// Fresh transaction id
pub fn transaction_id() -> String {
    Uuid::new_v4().simple().to_string()
}

/// Per-connection identity of a leaf, `uid::` + 7 base62 characters
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Fingerprint(String);

impl TryFrom<String> for Fingerprint {
    type Error = String;

    fn try_from(raw: String) -> std::result::Result<Self, String> {
        Fingerprint::from_raw(raw).ok_or_else(|| "fingerprint must start with uid::".to_string())
    }
}

impl From<Fingerprint> for String {
    fn from(fp: Fingerprint) -> String {
        fp.0
    }
}

impl Fingerprint {
    pub fn generate() -> Self {
        Self(format!("{}{}", FINGERPRINT_PREFIX, base62(UID_LENGTH)))
    }

    /// Wrap an existing fingerprint string, `None` if it lacks the `uid::` prefix
    pub fn from_raw(raw: impl Into<String>) -> Option<Self> {
        let raw = raw.into();
        raw.starts_with(FINGERPRINT_PREFIX).then_some(Self(raw))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identity of one activation of a context.
///
/// Successive reconnects or reloads of the same logical context get
/// different instance ids. The hop stamp is `kind::id`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RuntimeInstance {
    kind: ContextKind,
    id: String,
}

impl RuntimeInstance {
    pub fn new(kind: ContextKind) -> Self {
        Self {
            kind,
            id: base62(UID_LENGTH),
        }
    }

    pub fn kind(&self) -> ContextKind {
        self.kind
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Hop stamp appended when a packet passes through this instance
    pub fn stamp(&self) -> String {
        format!("{}::{}", self.kind, self.id)
    }
}

/// True if the hop stamp was made by a hub instance
pub fn is_hub_stamp(hop: &str) -> bool {
    hop.strip_prefix(ContextKind::Coordinator.as_str())
        .is_some_and(|rest| rest.starts_with("::"))
}
