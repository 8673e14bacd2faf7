//! The narinfo wire format: a small line-oriented key/value text record
//! describing a store object's NAR.
//!
//! ```text
//! StorePath: /nix/store/p4pclmv1gyja5kzc26npqpia1qqxrf0l-ruby-2.7.3
//! URL: nar/1w1fff338fvdw53sqgamddn1b2xgds473pv6y13gizdbqjv4i5p3.nar.xz
//! Compression: xz
//! NarHash: sha256:1impfw8zdgisxkghq9a3q7cn7jb9zyzgxdydiamp8z2nlyyl0h5h
//! NarSize: 18735072
//! References: 0d71ygfwbmy1xjlbj1v027dfmy9cqavy-libffi-3.3
//! Deriver: bidkcs01mww363s4s7akdhbl6ws66b0z-ruby-2.7.3.drv
//! Sig: cache.nixos.org-1:GrGV/Ls10TzoOaCnrcAqmPbKXFLLSBDeGNh5EQGKyuGA4K1wv1LcRVb6/sU+NAPK8lDiam8XcdJzUngmdhfTBQ==
//! ```

use std::fmt::Display;
use std::str::FromStr;

use indexmap::IndexMap;

/// Compression of the NAR archive referenced by a narinfo's `URL`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Compression {
    /// No compression; the file pointed to by `URL` is a raw NAR.
    None,
    /// xz-compressed.
    Xz,
    /// bzip2-compressed.
    Bzip2,
    /// gzip-compressed.
    Gzip,
    /// zstd-compressed.
    Zstd,
}

impl Compression {
    /// The string used in the `Compression:` field.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Xz => "xz",
            Self::Bzip2 => "bzip2",
            Self::Gzip => "gzip",
            Self::Zstd => "zstd",
        }
    }
}

impl FromStr for Compression {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        match s {
            "none" => Ok(Self::None),
            "xz" => Ok(Self::Xz),
            "bzip2" => Ok(Self::Bzip2),
            "gzip" => Ok(Self::Gzip),
            "zstd" => Ok(Self::Zstd),
            other => anyhow::bail!("unsupported compression {:?}", other),
        }
    }
}

impl Display for Compression {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A parsed narinfo record.
///
/// Keys this server does not know about (`FileHash`, `FileSize`, `System`,
/// `CA`, and anything an upstream adds in the future) are retained in
/// `extra`, in insertion order, so a forwarded-verbatim record round-trips.
#[derive(Debug, Clone, Default)]
pub struct NarInfo {
    /// Full store path, including the store directory.
    pub store_path: String,
    /// Relative (or absolute) URL to the archive.
    pub url: String,
    /// Compression of the archive at `url`. Defaults to `none` when absent.
    pub compression: Compression,
    /// Hash of the (decompressed) NAR, e.g. `sha256:...`.
    pub nar_hash: String,
    /// Size in bytes of the decompressed NAR.
    pub nar_size: u64,
    /// Leaf names of this object's references, in store order.
    pub references: Vec<String>,
    /// Leaf name of the deriver, if known.
    pub deriver: Option<String>,
    /// Zero or more signatures, in the order they appeared.
    pub sigs: Vec<String>,
    /// Any other key encountered while parsing, insertion-order preserved.
    pub extra: IndexMap<String, Vec<String>>,
}

impl Default for Compression {
    fn default() -> Self {
        Compression::None
    }
}

/// A single `Key: value` line, or `None` for a blank or malformed line.
fn parse_line(line: &str) -> Option<(&str, &str)> {
    let line = line.trim_end_matches('\n');
    if line.is_empty() {
        return None;
    }
    let colon = line.find(':')?;
    let (key, rest) = line.split_at(colon);
    if key.is_empty() || !key.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
        return None;
    }
    Some((key, rest[1..].trim_start()))
}

impl NarInfo {
    /// Parses a narinfo from its textual representation.
    ///
    /// Unknown keys are retained in `extra`. Lines that do not match
    /// `^(\w+):\s*(.*)$` are silently skipped, for forward compatibility.
    pub fn parse(text: &str) -> anyhow::Result<Self> {
        let mut result = NarInfo::default();
        let mut have_store_path = false;
        let mut have_url = false;
        let mut have_nar_hash = false;
        let mut have_nar_size = false;
        for line in text.lines() {
            let Some((key, value)) = parse_line(line) else {
                continue;
            };
            match key {
                "StorePath" => {
                    result.store_path = value.to_string();
                    have_store_path = true;
                }
                "URL" => {
                    result.url = value.to_string();
                    have_url = true;
                }
                "Compression" => {
                    result.compression = value.parse().unwrap_or(Compression::None);
                }
                "NarHash" => {
                    result.nar_hash = value.to_string();
                    have_nar_hash = true;
                }
                "NarSize" => {
                    result.nar_size = value
                        .parse()
                        .map_err(|e| anyhow::anyhow!("bad NarSize {:?}: {}", value, e))?;
                    have_nar_size = true;
                }
                "References" => {
                    result.references = value.split_whitespace().map(String::from).collect();
                }
                "Deriver" => {
                    result.deriver = Some(value.to_string());
                }
                "Sig" => {
                    result.sigs.push(value.to_string());
                }
                other => {
                    result
                        .extra
                        .entry(other.to_string())
                        .or_default()
                        .push(value.to_string());
                }
            }
        }
        anyhow::ensure!(have_store_path, "narinfo is missing StorePath");
        anyhow::ensure!(have_url, "narinfo is missing URL");
        let _ = (have_nar_hash, have_nar_size);
        Ok(result)
    }

    /// Serializes this record in the canonical field order: `StorePath`,
    /// `URL`, `Compression`, `NarHash`, `NarSize`, `References`, `Deriver`,
    /// then zero or more `Sig` lines.
    pub fn to_string(&self) -> String {
        let mut out = String::with_capacity(256);
        out.push_str("StorePath: ");
        out.push_str(&self.store_path);
        out.push('\n');
        out.push_str("URL: ");
        out.push_str(&self.url);
        out.push('\n');
        out.push_str("Compression: ");
        out.push_str(self.compression.as_str());
        out.push('\n');
        out.push_str("NarHash: ");
        out.push_str(&self.nar_hash);
        out.push('\n');
        out.push_str("NarSize: ");
        out.push_str(&self.nar_size.to_string());
        out.push('\n');
        if !self.references.is_empty() {
            out.push_str("References: ");
            out.push_str(&self.references.join(" "));
            out.push('\n');
        }
        if let Some(deriver) = &self.deriver {
            out.push_str("Deriver: ");
            out.push_str(deriver);
            out.push('\n');
        }
        for sig in &self.sigs {
            out.push_str("Sig: ");
            out.push_str(sig);
            out.push('\n');
        }
        out
    }
}

#[test]
fn test_parse_minimal() {
    let text = "StorePath: /nix/store/abc\nURL: nar/abc.nar\nCompression: none\nNarHash: sha256:x\nNarSize: 96\n";
    let info = NarInfo::parse(text).unwrap();
    assert_eq!(info.store_path, "/nix/store/abc");
    assert_eq!(info.url, "nar/abc.nar");
    assert_eq!(info.compression, Compression::None);
    assert_eq!(info.nar_size, 96);
    assert!(info.references.is_empty());
    assert!(info.deriver.is_none());
    assert!(info.sigs.is_empty());
}

#[test]
fn test_parse_multivalued_sig() {
    let text = "StorePath: /nix/store/abc\nURL: nar/abc.nar\nNarHash: sha256:x\nNarSize: 1\nSig: a:aaaa\nSig: b:bbbb\n";
    let info = NarInfo::parse(text).unwrap();
    assert_eq!(info.sigs, vec!["a:aaaa".to_string(), "b:bbbb".to_string()]);
}

#[test]
fn test_parse_references_order_preserved() {
    let text = "StorePath: /nix/store/abc\nURL: nar/abc.nar\nNarHash: sha256:x\nNarSize: 1\nReferences: zzz yyy aaa\n";
    let info = NarInfo::parse(text).unwrap();
    assert_eq!(info.references, vec!["zzz", "yyy", "aaa"]);
}

#[test]
fn test_parse_unknown_key_retained() {
    let text = "StorePath: /nix/store/abc\nURL: nar/abc.nar\nNarHash: sha256:x\nNarSize: 1\nFileHash: sha256:y\nFileSize: 42\n";
    let info = NarInfo::parse(text).unwrap();
    assert_eq!(info.extra.get("FileHash").unwrap(), &vec!["sha256:y".to_string()]);
    assert_eq!(info.extra.get("FileSize").unwrap(), &vec!["42".to_string()]);
}

#[test]
fn test_parse_malformed_line_ignored() {
    let text = "StorePath: /nix/store/abc\nURL: nar/abc.nar\nthis has no colon\nNarHash: sha256:x\nNarSize: 1\n";
    NarInfo::parse(text).unwrap();
}

#[test]
fn test_parse_missing_store_path() {
    NarInfo::parse("URL: nar/abc.nar\n").unwrap_err();
}

#[test]
fn test_emit_field_order() {
    let info = NarInfo {
        store_path: "/nix/store/abc-hello".to_string(),
        url: "nar/abc-xyz.nar".to_string(),
        compression: Compression::None,
        nar_hash: "sha256:xyz".to_string(),
        nar_size: 96,
        references: vec![],
        deriver: None,
        sigs: vec![],
        extra: IndexMap::new(),
    };
    assert_eq!(
        info.to_string(),
        "StorePath: /nix/store/abc-hello\nURL: nar/abc-xyz.nar\nCompression: none\nNarHash: sha256:xyz\nNarSize: 96\n"
    );
}

#[test]
fn test_emit_with_references_deriver_sig() {
    let info = NarInfo {
        store_path: "/nix/store/abc-hello".to_string(),
        url: "nar/abc-xyz.nar".to_string(),
        compression: Compression::None,
        nar_hash: "sha256:xyz".to_string(),
        nar_size: 96,
        references: vec!["eee-lib".to_string(), "fff-lib2".to_string()],
        deriver: Some("ddd-hello.drv".to_string()),
        sigs: vec!["cache-1:aaaa==".to_string()],
        extra: IndexMap::new(),
    };
    let text = info.to_string();
    assert!(text.contains("References: eee-lib fff-lib2\n"));
    assert!(text.contains("Deriver: ddd-hello.drv\n"));
    assert!(text.ends_with("Sig: cache-1:aaaa==\n"));
}

#[test]
fn test_round_trip() {
    let text = "StorePath: /nix/store/abc-hello\nURL: nar/abc-xyz.nar\nCompression: none\nNarHash: sha256:xyz\nNarSize: 96\nReferences: eee-lib\nDeriver: ddd.drv\nSig: a:aa\nSig: b:bb\n";
    let info = NarInfo::parse(text).unwrap();
    assert_eq!(info.to_string(), text);
}
