//! Length-prefixed BLAKE3 feed for content hashes of groups and entries.

use uuid::Uuid;

use crate::meta::CustomData;
use crate::times::Timestamp;

/// BLAKE3 content hash.
pub type ContentHash = [u8; 32];

pub(crate) struct ContentDigest(blake3::Hasher);

impl ContentDigest {
    pub(crate) fn new(domain: &str) -> Self {
        let mut digest = Self(blake3::Hasher::new());
        digest.str(domain);
        digest
    }

    pub(crate) fn bytes(&mut self, data: &[u8]) -> &mut Self {
        let len = u64::try_from(data.len()).unwrap_or(u64::MAX);
        self.0.update(&len.to_le_bytes());
        self.0.update(data);
        self
    }

    pub(crate) fn str(&mut self, text: &str) -> &mut Self {
        self.bytes(text.as_bytes())
    }

    pub(crate) fn u64(&mut self, value: u64) -> &mut Self {
        self.0.update(&value.to_le_bytes());
        self
    }

    pub(crate) fn bool(&mut self, value: bool) -> &mut Self {
        self.0.update(&[u8::from(value)]);
        self
    }

    pub(crate) fn tri(&mut self, value: Option<bool>) -> &mut Self {
        let tag = match value {
            None => 0u8,
            Some(false) => 1,
            Some(true) => 2,
        };
        self.0.update(&[tag]);
        self
    }

    pub(crate) fn uuid(&mut self, id: Option<&Uuid>) -> &mut Self {
        self.0.update(id.unwrap_or(&Uuid::nil()).as_bytes());
        self
    }

    pub(crate) fn time(&mut self, ts: &Timestamp) -> &mut Self {
        self.0.update(&ts.timestamp().to_le_bytes());
        self
    }

    pub(crate) fn strings(&mut self, items: &[String]) -> &mut Self {
        self.u64(u64::try_from(items.len()).unwrap_or(u64::MAX));
        for item in items {
            self.str(item);
        }
        self
    }

    pub(crate) fn custom_data(&mut self, data: &CustomData) -> &mut Self {
        self.u64(u64::try_from(data.len()).unwrap_or(u64::MAX));
        for (key, item) in data {
            self.str(key).str(&item.value);
        }
        self
    }

    pub(crate) fn finish(&self) -> ContentHash {
        *self.0.finalize().as_bytes()
    }
}
