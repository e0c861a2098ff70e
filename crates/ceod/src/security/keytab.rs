//! Pre-shared key tables.
//!
//! # File Format
//!
//! ```text
//! # comment
//! alice@CSCLUB   q83vEjRWeJCrze8SNFZ4kKvN7xI0VniQq83vEjRWeJA=
//! ```
//!
//! One entry per line: a principal and a base64-encoded 32-byte key,
//! separated by whitespace. Blank lines and `#` comments are ignored.

use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use thiserror::Error;
use zeroize::Zeroizing;

/// Length of a key in bytes.
pub const KEY_LEN: usize = 32;

/// A secret key, zeroized on drop.
pub type Key = Zeroizing<[u8; KEY_LEN]>;

/// Key table loading errors.
#[derive(Debug, Error)]
pub enum KeytabError {
    /// The file could not be read.
    #[error("failed to read key table {path}: {source}")]
    Io {
        /// Path of the key table.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },

    /// A line could not be parsed.
    #[error("key table line {line}: {reason}")]
    Malformed {
        /// 1-based line number.
        line: usize,
        /// What is wrong with it.
        reason: String,
    },

    /// The requested principal has no entry.
    #[error("no key for principal {principal}")]
    UnknownPrincipal {
        /// Principal looked up.
        principal: String,
    },

    /// No principal was named and the table does not hold exactly one.
    #[error("key table holds {count} entries; a principal must be named")]
    Ambiguous {
        /// Number of entries.
        count: usize,
    },
}

/// A table of principals and their shared keys.
#[derive(Clone, Default)]
pub struct Keytab {
    entries: BTreeMap<String, Key>,
}

impl Keytab {
    /// Load a key table from a file.
    ///
    /// # Errors
    ///
    /// Returns [`KeytabError::Io`] if the file cannot be read, or
    /// [`KeytabError::Malformed`] for a bad line.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, KeytabError> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|source| KeytabError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(&content)
    }

    /// Parse key table text.
    ///
    /// # Errors
    ///
    /// Returns [`KeytabError::Malformed`] for a bad line or a repeated
    /// principal.
    pub fn parse(content: &str) -> Result<Self, KeytabError> {
        let mut entries = BTreeMap::new();
        for (idx, raw) in content.lines().enumerate() {
            let line = raw.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let malformed = |reason: &str| KeytabError::Malformed {
                line: idx + 1,
                reason: reason.to_string(),
            };

            let mut fields = line.split_whitespace();
            let (Some(principal), Some(encoded), None) =
                (fields.next(), fields.next(), fields.next())
            else {
                return Err(malformed("expected <principal> <base64 key>"));
            };

            let decoded = Zeroizing::new(
                STANDARD
                    .decode(encoded)
                    .map_err(|_| malformed("key is not valid base64"))?,
            );
            let mut key: Key = Zeroizing::new([0u8; KEY_LEN]);
            if decoded.len() != KEY_LEN {
                return Err(malformed("key must be 32 bytes"));
            }
            key.copy_from_slice(&decoded);

            if entries.insert(principal.to_string(), key).is_some() {
                return Err(malformed("duplicate principal"));
            }
        }
        Ok(Self { entries })
    }

    /// Add or replace an entry.
    pub fn insert(&mut self, principal: impl Into<String>, key: [u8; KEY_LEN]) {
        self.entries.insert(principal.into(), Zeroizing::new(key));
    }

    /// Look up a principal's key.
    #[must_use]
    pub fn get(&self, principal: &str) -> Option<&Key> {
        self.entries.get(principal)
    }

    /// Resolve the principal to act as: the named one, or the sole entry.
    ///
    /// # Errors
    ///
    /// Returns [`KeytabError::UnknownPrincipal`] if the named principal is
    /// absent, or [`KeytabError::Ambiguous`] if none is named and the table
    /// does not hold exactly one entry.
    pub fn credential(&self, principal: Option<&str>) -> Result<(&str, &Key), KeytabError> {
        if let Some(name) = principal {
            return self
                .entries
                .get_key_value(name)
                .map(|(p, k)| (p.as_str(), k))
                .ok_or_else(|| KeytabError::UnknownPrincipal {
                    principal: name.to_string(),
                });
        }
        let mut iter = self.entries.iter();
        match (iter.next(), iter.next()) {
            (Some((p, k)), None) => Ok((p.as_str(), k)),
            _ => Err(KeytabError::Ambiguous {
                count: self.entries.len(),
            }),
        }
    }

    /// Number of entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns `true` if the table has no entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

// Never print key material.
impl fmt::Debug for Keytab {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Keytab")
            .field("principals", &self.entries.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// Encode a key the way key table files store it.
#[must_use]
pub fn encode_key(key: &[u8; KEY_LEN]) -> String {
    STANDARD.encode(key)
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    fn line(principal: &str, byte: u8) -> String {
        format!("{principal} {}\n", encode_key(&[byte; KEY_LEN]))
    }

    #[test]
    fn test_parse_entries_and_comments() {
        let text = format!(
            "# clients\n\n{}   {}",
            line("alice@REALM", 1),
            line("bob@REALM", 2)
        );
        let keytab = Keytab::parse(&text).unwrap();
        assert_eq!(keytab.len(), 2);
        assert_eq!(**keytab.get("alice@REALM").unwrap(), [1u8; KEY_LEN]);
        assert!(keytab.get("carol@REALM").is_none());
    }

    #[test]
    fn test_wrong_key_length() {
        let text = format!("alice {}\n", STANDARD.encode([0u8; 16]));
        let err = Keytab::parse(&text).unwrap_err();
        assert!(matches!(err, KeytabError::Malformed { line: 1, .. }));
    }

    #[test]
    fn test_bad_base64_and_field_count() {
        assert!(Keytab::parse("alice !!!notbase64!!!\n").is_err());
        assert!(Keytab::parse("alice\n").is_err());
        let three = format!("alice {} extra\n", encode_key(&[0; KEY_LEN]));
        assert!(Keytab::parse(&three).is_err());
    }

    #[test]
    fn test_duplicate_principal_rejected() {
        let text = format!("{}{}", line("alice", 1), line("alice", 2));
        assert!(matches!(
            Keytab::parse(&text),
            Err(KeytabError::Malformed { line: 2, .. })
        ));
    }

    #[test]
    fn test_credential_selection() {
        let single = Keytab::parse(&line("alice@REALM", 1)).unwrap();
        assert_eq!(single.credential(None).unwrap().0, "alice@REALM");

        let double = Keytab::parse(&format!("{}{}", line("a", 1), line("b", 2))).unwrap();
        assert!(matches!(
            double.credential(None),
            Err(KeytabError::Ambiguous { count: 2 })
        ));
        assert_eq!(double.credential(Some("b")).unwrap().0, "b");
        assert!(matches!(
            double.credential(Some("c")),
            Err(KeytabError::UnknownPrincipal { .. })
        ));
    }

    #[test]
    fn test_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(line("svc", 7).as_bytes()).unwrap();
        let keytab = Keytab::from_file(file.path()).unwrap();
        assert_eq!(keytab.len(), 1);

        let missing = Keytab::from_file("/nonexistent/keytab").unwrap_err();
        assert!(matches!(missing, KeytabError::Io { .. }));
    }

    #[test]
    fn test_debug_hides_keys() {
        let keytab = Keytab::parse(&line("alice", 0xAB)).unwrap();
        let rendered = format!("{keytab:?}");
        assert!(rendered.contains("alice"));
        assert!(!rendered.contains(&encode_key(&[0xAB; KEY_LEN])));
    }
}
