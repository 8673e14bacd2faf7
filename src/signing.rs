//! Ed25519 signing of narinfo fingerprints, in the canonical string format
//! produced and consumed by standard cache clients.
//!
//! All signing-related strings follow the canonical form:
//!
//! ```text
//! {keyName}:{base64Payload}
//! ```
//!
//! The fingerprint signed over a narinfo is:
//!
//! ```text
//! 1;{storePath};{narHash};{narSize};{commaDelimitedFullReferencePaths}
//! ```

use std::path::Path;

use base64::Engine;
use ed25519_compact::KeyPair;

use crate::narinfo::NarInfo;

const BASE64: base64::engine::general_purpose::GeneralPurpose = base64::engine::general_purpose::STANDARD;

/// An Ed25519 keypair used to sign outgoing narinfos.
pub struct SecretKey {
    name: String,
    keypair: KeyPair,
}

impl SecretKey {
    /// Parses a keypair from its canonical `{name}:{base64}` representation,
    /// as found in the file named by `NIX_SECRET_KEY_FILE`.
    pub fn from_str(s: &str) -> anyhow::Result<Self> {
        let (name, payload) = s
            .split_once(':')
            .ok_or_else(|| anyhow::anyhow!("secret key is missing a ':' separator"))?;
        anyhow::ensure!(!name.is_empty(), "secret key name is blank");
        let bytes = BASE64
            .decode(payload)
            .map_err(|e| anyhow::anyhow!("secret key payload is not valid base64: {e}"))?;
        let keypair = KeyPair::from_slice(&bytes)
            .map_err(|e| anyhow::anyhow!("secret key payload has the wrong length: {e}"))?;
        Ok(SecretKey {
            name: name.to_string(),
            keypair,
        })
    }

    /// Loads and parses the secret key file named by `path`, trimming
    /// surrounding whitespace from its contents first.
    pub async fn load(path: &Path) -> anyhow::Result<Self> {
        let contents = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| anyhow::anyhow!("reading secret key file {}: {e}", path.display()))?;
        Self::from_str(contents.trim())
    }

    /// Computes the canonical fingerprint bytes of a narinfo: the full
    /// store path, the NAR hash, the NAR size, and the comma-delimited
    /// full store paths of its references.
    pub fn fingerprint(store_dir: &Path, info: &NarInfo) -> Vec<u8> {
        let mut out = b"1;".to_vec();
        out.extend(info.store_path.as_bytes());
        out.push(b';');
        out.extend(info.nar_hash.as_bytes());
        out.push(b';');
        out.extend(info.nar_size.to_string().as_bytes());
        out.push(b';');
        let mut refs = info.references.iter().peekable();
        while let Some(reference) = refs.next() {
            out.extend(store_dir.as_os_str().as_encoded_bytes());
            out.push(b'/');
            out.extend(reference.as_bytes());
            if refs.peek().is_some() {
                out.push(b',');
            }
        }
        out
    }

    /// Signs `message`, returning its canonical `{name}:{base64}`
    /// representation.
    pub fn sign(&self, message: &[u8]) -> String {
        let signature = self.keypair.sk.sign(message, None);
        format!("{}:{}", self.name, BASE64.encode(signature.as_ref()))
    }

    /// Computes the fingerprint of `info` and signs it, returning the `Sig`
    /// value to attach.
    pub fn sign_narinfo(&self, store_dir: &Path, info: &NarInfo) -> String {
        let fingerprint = Self::fingerprint(store_dir, info);
        self.sign(&fingerprint)
    }
}

#[test]
fn test_fingerprint_format() {
    use crate::narinfo::Compression;
    use indexmap::IndexMap;
    let info = NarInfo {
        store_path: "/nix/store/p4pclmv1gyja5kzc26npqpia1qqxrf0l-ruby-2.7.3".to_string(),
        url: "nar/abc.nar".to_string(),
        compression: Compression::None,
        nar_hash: "sha256:1impfw8zdgisxkghq9a3q7cn7jb9zyzgxdydiamp8z2nlyyl0h5h".to_string(),
        nar_size: 18735072,
        references: vec![
            "0d71ygfwbmy1xjlbj1v027dfmy9cqavy-libffi-3.3".to_string(),
            "p4pclmv1gyja5kzc26npqpia1qqxrf0l-ruby-2.7.3".to_string(),
        ],
        deriver: None,
        sigs: vec![],
        extra: IndexMap::new(),
    };
    let fp = SecretKey::fingerprint(Path::new("/nix/store"), &info);
    assert_eq!(
        String::from_utf8(fp).unwrap(),
        "1;/nix/store/p4pclmv1gyja5kzc26npqpia1qqxrf0l-ruby-2.7.3;sha256:1impfw8zdgisxkghq9a3q7cn7jb9zyzgxdydiamp8z2nlyyl0h5h;18735072;/nix/store/0d71ygfwbmy1xjlbj1v027dfmy9cqavy-libffi-3.3,/nix/store/p4pclmv1gyja5kzc26npqpia1qqxrf0l-ruby-2.7.3"
    );
}

#[test]
fn test_sign_and_verify_round_trip() {
    let keypair = KeyPair::generate();
    let exported = format!(
        "test-key:{}",
        BASE64.encode(keypair.as_ref())
    );
    let key = SecretKey::from_str(&exported).unwrap();
    let sig = key.sign(b"hello world");
    let (name, payload) = sig.split_once(':').unwrap();
    assert_eq!(name, "test-key");
    let sig_bytes = BASE64.decode(payload).unwrap();
    let signature = ed25519_compact::Signature::from_slice(&sig_bytes).unwrap();
    keypair.pk.verify(b"hello world", &signature).unwrap();
}

#[test]
fn test_from_str_missing_colon() {
    SecretKey::from_str("not-a-valid-key").unwrap_err();
}
