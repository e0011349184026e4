//! Item timestamps and their two XML encodings.
//!
//! KDBX 3.x writes ISO-8601 UTC strings, KDBX 4.x writes base64 of an
//! i64 LE count of seconds since 0001-01-01T00:00:00Z. Readers accept both.
//! All times are kept at second precision.

use chrono::{DateTime, NaiveDateTime, SecondsFormat, SubsecRound, Utc};
use data_encoding::BASE64;
use serde::{Deserialize, Serialize};

/// UTC timestamp at second precision.
pub type Timestamp = DateTime<Utc>;

/// Seconds between 0001-01-01T00:00:00Z and the Unix epoch.
const EPOCH_OFFSET_SECS: i64 = 62_135_596_800;

/// Current time, truncated to whole seconds.
#[must_use]
pub fn now() -> Timestamp {
    Utc::now().trunc_subsecs(0)
}

/// Timestamp set carried by every group and entry.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Times {
    /// Creation time.
    pub creation: Timestamp,
    /// Last content modification. Drives the merge.
    pub last_modification: Timestamp,
    /// Last access.
    pub last_access: Timestamp,
    /// Expiry time, honoured only when `expires` is set.
    pub expiry: Timestamp,
    /// Whether the item expires.
    pub expires: bool,
    /// Usage counter.
    pub usage_count: u64,
    /// Last re-parenting. Drives location conflicts in the merge.
    pub location_changed: Timestamp,
}

impl Times {
    /// All timestamps set to `at`, no expiry.
    #[must_use]
    pub fn at(at: Timestamp) -> Self {
        Self {
            creation: at,
            last_modification: at,
            last_access: at,
            expiry: at,
            expires: false,
            usage_count: 0,
            location_changed: at,
        }
    }

    /// All timestamps set to [`now`].
    #[must_use]
    pub fn now() -> Self {
        Self::at(now())
    }
}

impl Default for Times {
    fn default() -> Self {
        Self::now()
    }
}

/// Base64 KDBX 4 form.
pub(crate) fn encode_binary(ts: &Timestamp) -> String {
    let secs = ts.timestamp().saturating_add(EPOCH_OFFSET_SECS);
    BASE64.encode(&secs.to_le_bytes())
}

/// ISO-8601 KDBX 3 form.
pub(crate) fn encode_iso(ts: &Timestamp) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Secs, true)
}

/// Parse either encoding. `None` for malformed or out-of-range values.
pub(crate) fn decode(text: &str) -> Option<Timestamp> {
    let text = text.trim();
    if let Ok(bytes) = BASE64.decode(text.as_bytes()) {
        let raw: [u8; 8] = bytes.as_slice().try_into().ok()?;
        let secs = i64::from_le_bytes(raw).checked_sub(EPOCH_OFFSET_SECS)?;
        return DateTime::from_timestamp(secs, 0);
    }
    if let Ok(parsed) = DateTime::parse_from_rfc3339(text) {
        return Some(parsed.with_timezone(&Utc).trunc_subsecs(0));
    }
    NaiveDateTime::parse_from_str(text, "%Y-%m-%dT%H:%M:%S")
        .ok()
        .map(|naive| naive.and_utc())
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------
