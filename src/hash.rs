//! Validated newtypes for the two opaque identifiers this server passes
//! around: the 32-character base32 hash part of a store path, and the
//! `sha256:<52-char-base32>` NAR hash.

use std::fmt::Display;
use std::ops::Deref;

/// Length in characters of a [`HashPart`].
const HASH_PART_LEN: usize = 32;

/// The base32 alphabet nix uses (omits `e`, `o`, `u`, `t` to avoid
/// confusable/obscene substrings).
fn is_nix_base32_char(c: char) -> bool {
    c.is_ascii_digit() || (c.is_ascii_lowercase() && c != 'e' && c != 'o' && c != 'u' && c != 't')
}

/// The 32-character lowercase base32 hash part of a store path, e.g.
/// `p4pclmv1gyja5kzc26npqpia1qqxrf0l`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HashPart(String);

impl HashPart {
    /// Validates and wraps a hash part.
    ///
    /// Fails unless `s` is exactly [`HASH_PART_LEN`] characters, all in
    /// `[0-9a-z]`.
    pub fn new(s: &str) -> anyhow::Result<Self> {
        anyhow::ensure!(
            s.len() == HASH_PART_LEN,
            "hash part {:?} has length {}, expected {}",
            s,
            s.len(),
            HASH_PART_LEN
        );
        if let Some(bad_char) = s.chars().find(|&c| !c.is_ascii_digit() && !c.is_ascii_lowercase())
        {
            anyhow::bail!("bad character {:?} in hash part {:?}", bad_char, s);
        }
        Ok(HashPart(s.to_string()))
    }
}

impl Deref for HashPart {
    type Target = str;
    fn deref(&self) -> &str {
        &self.0
    }
}

impl Display for HashPart {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

/// The SHA-256 hash of a NAR archive, as it appears in narinfo's `NarHash`
/// field: `sha256:<52-char-base32>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NarHash {
    base32: String,
}

const NAR_HASH_BASE32_LEN: usize = 52;

impl NarHash {
    /// Parses `sha256:<52-char-base32>`.
    pub fn parse(s: &str) -> anyhow::Result<Self> {
        let base32 = s
            .strip_prefix("sha256:")
            .ok_or_else(|| anyhow::anyhow!("NarHash {:?} is missing the sha256: prefix", s))?;
        anyhow::ensure!(
            base32.len() == NAR_HASH_BASE32_LEN,
            "NarHash base32 part {:?} has length {}, expected {}",
            base32,
            base32.len(),
            NAR_HASH_BASE32_LEN
        );
        if let Some(bad_char) = base32.chars().find(|&c| !is_nix_base32_char(c)) {
            anyhow::bail!("bad character {:?} in NarHash {:?}", bad_char, s);
        }
        Ok(NarHash {
            base32: base32.to_string(),
        })
    }

    /// Builds a NarHash from an already-computed base32 digest string (no
    /// `sha256:` prefix), as returned by `nix-store --query --hash`.
    pub fn from_base32(base32: &str) -> anyhow::Result<Self> {
        Self::parse(&format!("sha256:{base32}"))
    }

    /// Returns the 52-character base32 tail, without the `sha256:` prefix.
    pub fn base32(&self) -> &str {
        &self.base32
    }
}

impl Display for NarHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "sha256:{}", self.base32)
    }
}

#[test]
fn test_hash_part_ok() {
    let s = "p4pclmv1gyja5kzc26npqpia1qqxrf0l";
    assert_eq!(HashPart::new(s).unwrap().deref(), s);
}

#[test]
fn test_hash_part_bad_length() {
    HashPart::new("tooshort").unwrap_err();
}

#[test]
fn test_hash_part_bad_char() {
    HashPart::new("P4pclmv1gyja5kzc26npqpia1qqxrf0l").unwrap_err();
}

#[test]
fn test_nar_hash_ok() {
    let s = "sha256:1impfw8zdgisxkghq9a3q7cn7jb9zyzgxdydiamp8z2nlyyl0h5h";
    assert_eq!(NarHash::parse(s).unwrap().to_string(), s);
}

#[test]
fn test_nar_hash_missing_prefix() {
    NarHash::parse("1impfw8zdgisxkghq9a3q7cn7jb9zyzgxdydiamp8z2nlyyl0h5h").unwrap_err();
}

#[test]
fn test_nar_hash_bad_length() {
    NarHash::parse("sha256:tooshort").unwrap_err();
}

#[test]
fn test_nar_hash_from_base32() {
    let base32 = "1impfw8zdgisxkghq9a3q7cn7jb9zyzgxdydiamp8z2nlyyl0h5h";
    assert_eq!(
        NarHash::from_base32(base32).unwrap().to_string(),
        format!("sha256:{base32}")
    );
}
