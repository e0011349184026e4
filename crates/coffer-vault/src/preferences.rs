//! Format preferences: how [`crate::encode`] writes a container.
//!
//! Stored as plain camelCase JSON next to the application's other settings.
//! Every field is defaulted, so a partial or missing file still loads.

use std::fs;
use std::io;
use std::path::Path;

use coffer_crypto_core::{
    read_header, Argon2Variant, Compression, KdfParams, OuterCipher, SealSettings, VariantDictionary,
};
use serde::{Deserialize, Serialize};

use crate::error::{DecodeError, EncodeError};
use crate::meta::DEFAULT_GENERATOR;

// ── Top-level preferences ──────────────────────────────────────────

/// Container settings used when writing a database.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct FormatPreferences {
    /// Outer cipher.
    #[serde(default)]
    pub cipher: OuterCipher,

    /// Key derivation function and cost.
    #[serde(default)]
    pub kdf: KdfSetting,

    /// Payload compression.
    #[serde(default)]
    pub compression: Compression,

    /// Value written to `Meta/Generator`.
    #[serde(default = "default_generator")]
    pub generator: String,
}

impl Default for FormatPreferences {
    fn default() -> Self {
        Self {
            cipher: OuterCipher::default(),
            kdf: KdfSetting::default(),
            compression: Compression::default(),
            generator: default_generator(),
        }
    }
}

fn default_generator() -> String {
    DEFAULT_GENERATOR.into()
}

// ── KDF ────────────────────────────────────────────────────────────

/// KDF choice with its cost parameters.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum KdfSetting {
    /// AES-KDF.
    AesKdf {
        /// Transform rounds.
        rounds: u64,
    },
    /// Argon2d.
    #[serde(rename_all = "camelCase")]
    Argon2d {
        /// Memory cost in KiB.
        memory_kib: u32,
        /// Passes.
        iterations: u32,
        /// Lanes.
        parallelism: u32,
    },
    /// Argon2id.
    #[serde(rename_all = "camelCase")]
    Argon2id {
        /// Memory cost in KiB.
        memory_kib: u32,
        /// Passes.
        iterations: u32,
        /// Lanes.
        parallelism: u32,
    },
}

impl Default for KdfSetting {
    fn default() -> Self {
        Self::Argon2d {
            memory_kib: 65_536,
            iterations: 10,
            parallelism: 2,
        }
    }
}

impl KdfSetting {
    /// Fresh header parameters (new random salt or seed).
    ///
    /// # Errors
    ///
    /// Returns [`EncodeError::Crypto`] if the CSPRNG fails.
    pub fn to_params(self) -> Result<KdfParams, EncodeError> {
        let params = match self {
            Self::AesKdf { rounds } => KdfParams::new_aes(rounds)?,
            Self::Argon2d {
                memory_kib,
                iterations,
                parallelism,
            } => KdfParams::new_argon2(Argon2Variant::Argon2d, memory_kib, iterations, parallelism)?,
            Self::Argon2id {
                memory_kib,
                iterations,
                parallelism,
            } => KdfParams::new_argon2(Argon2Variant::Argon2id, memory_kib, iterations, parallelism)?,
        };
        Ok(params)
    }

    fn from_params(params: &KdfParams) -> Self {
        match params {
            KdfParams::Aes { rounds, .. } => Self::AesKdf { rounds: *rounds },
            KdfParams::Argon2(p) => {
                let memory_kib = u32::try_from(p.memory.checked_div(1024).unwrap_or_default()).unwrap_or(u32::MAX);
                let iterations = u32::try_from(p.iterations).unwrap_or(u32::MAX);
                match p.variant {
                    Argon2Variant::Argon2d => Self::Argon2d {
                        memory_kib,
                        iterations,
                        parallelism: p.parallelism,
                    },
                    Argon2Variant::Argon2id => Self::Argon2id {
                        memory_kib,
                        iterations,
                        parallelism: p.parallelism,
                    },
                }
            }
        }
    }
}

// ── Conversions ────────────────────────────────────────────────────

impl FormatPreferences {
    /// Settings of an existing container, read from its unencrypted header.
    ///
    /// The generator is not part of the header and is left at its default.
    ///
    /// # Errors
    ///
    /// Returns [`DecodeError::CorruptHeader`] if the header is unreadable.
    pub fn from_container(data: &[u8]) -> Result<Self, DecodeError> {
        let header = read_header(data)?;
        Ok(Self {
            cipher: header.cipher,
            kdf: KdfSetting::from_params(&header.kdf),
            compression: header.compression,
            generator: default_generator(),
        })
    }

    /// Sealing settings with fresh KDF randomness.
    ///
    /// # Errors
    ///
    /// Returns [`EncodeError::Crypto`] if the CSPRNG fails.
    pub fn to_seal_settings(
        &self,
        public_custom_data: Option<VariantDictionary>,
    ) -> Result<SealSettings, EncodeError> {
        Ok(SealSettings {
            cipher: self.cipher,
            kdf: self.kdf.to_params()?,
            compression: self.compression,
            public_custom_data,
        })
    }
}

// ── File I/O ───────────────────────────────────────────────────────

impl FormatPreferences {
    /// Load preferences from `path`.
    ///
    /// Returns [`Default::default()`] when the file is missing or
    /// contains invalid JSON.
    #[must_use]
    pub fn load(path: &Path) -> Self {
        fs::read_to_string(path).map_or_else(
            |_| Self::default(),
            |contents| serde_json::from_str(&contents).unwrap_or_default(),
        )
    }

    /// Persist preferences to `path`.
    ///
    /// Writes a hidden sibling `.tmp` file first and renames it over
    /// `path`; on Unix the file is owner-only.
    ///
    /// # Errors
    ///
    /// Returns an `io::Error` if `path` has no file name or the file
    /// system rejects the write or rename.
    pub fn save(&self, path: &Path) -> io::Result<()> {
        let name = path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "preferences path has no file name"))?;
        let tmp = path.with_file_name(format!(".{name}.tmp"));

        let json = serde_json::to_string_pretty(self).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        fs::write(&tmp, &json)?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&tmp, fs::Permissions::from_mode(0o600))?;
        }

        fs::rename(&tmp, path)
    }
}

// ── Tests ──────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use coffer_crypto_core::{FormatVersion, KeyMaterial, Sealer};
    use tempfile::TempDir;

    const FILE: &str = "format.json";

    #[test]
    fn default_values_are_correct() {
        let prefs = FormatPreferences::default();
        assert_eq!(prefs.cipher, OuterCipher::Aes256);
        assert_eq!(prefs.compression, Compression::Gzip);
        assert_eq!(prefs.generator, DEFAULT_GENERATOR);
        assert!(matches!(prefs.kdf, KdfSetting::Argon2d { memory_kib: 65_536, .. }));
    }

    #[test]
    fn load_returns_default_on_missing_file() {
        let dir = TempDir::new().unwrap();
        assert_eq!(FormatPreferences::load(&dir.path().join(FILE)), FormatPreferences::default());
    }

    #[test]
    fn save_and_load_roundtrip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(FILE);
        let prefs = FormatPreferences {
            cipher: OuterCipher::ChaCha20,
            kdf: KdfSetting::AesKdf { rounds: 60_000 },
            compression: Compression::None,
            generator: "Sync".into(),
        };
        prefs.save(&path).unwrap();
        assert_eq!(FormatPreferences::load(&path), prefs);
        assert!(!dir.path().join(".format.json.tmp").exists());
    }

    #[test]
    fn load_recovers_from_corrupt_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(FILE);
        fs::write(&path, "{ not json").unwrap();
        assert_eq!(FormatPreferences::load(&path), FormatPreferences::default());
    }

    #[test]
    fn load_handles_partial_json_with_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(FILE);
        fs::write(&path, r#"{"cipher":"chaCha20","kdf":{"type":"argon2id","memoryKib":1024,"iterations":3,"parallelism":1}}"#)
            .unwrap();
        let prefs = FormatPreferences::load(&path);
        assert_eq!(prefs.cipher, OuterCipher::ChaCha20);
        assert_eq!(
            prefs.kdf,
            KdfSetting::Argon2id {
                memory_kib: 1024,
                iterations: 3,
                parallelism: 1
            }
        );
        assert_eq!(prefs.compression, Compression::Gzip);
        assert_eq!(prefs.generator, DEFAULT_GENERATOR);
    }

    #[cfg(unix)]
    #[test]
    fn save_sets_owner_only_permissions() {
        use std::os::unix::fs::PermissionsExt;

        let dir = TempDir::new().unwrap();
        let path = dir.path().join(FILE);
        FormatPreferences::default().save(&path).unwrap();
        let mode = fs::metadata(&path).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, 0o600);
    }

    #[test]
    fn serde_uses_camel_case() {
        let json = serde_json::to_string(&FormatPreferences::default()).unwrap();
        assert!(json.contains("\"type\":\"argon2d\""));
        assert!(json.contains("memoryKib"));
        assert!(json.contains("\"cipher\":\"aes256\""));
        assert!(!json.contains("memory_kib"));
    }

    #[test]
    fn from_container_reads_header_settings() {
        let prefs = FormatPreferences {
            cipher: OuterCipher::ChaCha20,
            kdf: KdfSetting::Argon2id {
                memory_kib: 32,
                iterations: 1,
                parallelism: 1,
            },
            compression: Compression::None,
            generator: DEFAULT_GENERATOR.into(),
        };
        let sealer = Sealer::new(FormatVersion::V4_0, prefs.to_seal_settings(None).unwrap()).unwrap();
        let bytes = sealer.seal(&KeyMaterial::from_password("pw"), b"<x/>", &[]).unwrap();
        assert_eq!(FormatPreferences::from_container(&bytes).unwrap(), prefs);
    }
}
