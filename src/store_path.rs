//! Utils to work with store paths, i.e. `<storeDir>/hash-name`.

use std::{
    ffi::OsStr,
    os::unix::ffi::OsStrExt,
    path::{Path, PathBuf},
};

use crate::hash::HashPart;

/// A store path rooted at a given store directory.
///
/// A store path upholds the following invariants:
/// - starts with `<storeDir>/`
/// - the next component starts with a valid 32-character [`HashPart`], then
///   a `-`, then at least one more character.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorePath {
    path: PathBuf,
    hash_part: HashPart,
}

impl AsRef<Path> for StorePath {
    fn as_ref(&self) -> &Path {
        self.path.as_ref()
    }
}

impl StorePath {
    /// Validates that `path` is a store path under `store_dir`.
    pub fn new(store_dir: &Path, path: &Path) -> anyhow::Result<Self> {
        anyhow::ensure!(
            path.starts_with(store_dir),
            "{} does not start with {}",
            path.display(),
            store_dir.display()
        );
        let store_dir_components = store_dir.components().count();
        let Some(std::path::Component::Normal(leaf)) =
            path.components().nth(store_dir_components)
        else {
            anyhow::bail!(
                "{} is just {}, not a store path inside it",
                path.display(),
                store_dir.display()
            )
        };
        let leaf_str = leaf
            .to_str()
            .ok_or_else(|| anyhow::anyhow!("leaf of {} is not valid UTF-8", path.display()))?;
        let dash = leaf_str
            .as_bytes()
            .get(32)
            .filter(|&&b| b == b'-')
            .ok_or_else(|| anyhow::anyhow!("{} has no hash-name separator", path.display()))?;
        let _ = dash;
        anyhow::ensure!(
            leaf_str.len() > 33,
            "{} has an empty name after the hash",
            path.display()
        );
        let hash_part = HashPart::new(&leaf_str[..32])?;
        Ok(Self {
            path: path.to_path_buf(),
            hash_part,
        })
    }

    /// Builds a store path from a hash part and a name, e.g.
    /// `(hbqz...gwl, sl-5.05)` -> `<storeDir>/hbqz...gwl-sl-5.05`.
    pub fn from_hash_and_name(store_dir: &Path, hash_part: &HashPart, name: &str) -> Self {
        Self {
            path: store_dir.join(format!("{hash_part}-{name}")),
            hash_part: hash_part.clone(),
        }
    }

    /// Returns the `hash-name` leaf of the path.
    pub fn leaf(&self) -> &OsStr {
        self.path.file_name().expect("validated to have a leaf")
    }

    /// Returns the leaf as a `&str` (guaranteed valid UTF-8 by construction).
    pub fn leaf_str(&self) -> &str {
        self.leaf().to_str().expect("validated to be UTF-8")
    }

    /// Returns the hash part of the path.
    pub fn hash_part(&self) -> &HashPart {
        &self.hash_part
    }

    /// Returns the `name` part of the leaf, i.e. everything after
    /// `<hashpart>-`.
    pub fn name(&self) -> &str {
        &self.leaf_str()[33..]
    }
}

#[test]
fn test_store_path_relative_path() {
    StorePath::new(
        Path::new("/nix/store"),
        Path::new("./nix/store/hbqzhmrscihnl9vgvw9nqhlzc64r1gwl-sl-5.05"),
    )
    .unwrap_err();
}

#[test]
fn test_store_path_storedir() {
    StorePath::new(Path::new("/nix/store"), Path::new("/nix/store")).unwrap_err();
}

#[test]
fn test_store_path_truncated() {
    StorePath::new(
        Path::new("/nix/store"),
        Path::new("/nix/store/hbqzhmrscihnl9vgvw9nqhlzc64r1"),
    )
    .unwrap_err();
}

#[test]
fn test_store_path_bad_hash() {
    StorePath::new(
        Path::new("/nix/store"),
        &PathBuf::from(OsStr::from_bytes(
            &b"/nix/store/hbqzhmrsci\xffnl9vgvw9nqhlzc64r1gwl-sl-5.05"[..],
        )),
    )
    .unwrap_err();
}

#[test]
fn test_store_path_name() {
    let path = StorePath::new(
        Path::new("/nix/store"),
        Path::new("/nix/store/hbqzhmrscihnl9vgvw9nqhlzc64r1gwl-sl-5.05"),
    )
    .unwrap();
    assert_eq!(path.name(), "sl-5.05");
    assert_eq!(&**path.hash_part(), "hbqzhmrscihnl9vgvw9nqhlzc64r1gwl");
}

#[test]
fn test_store_path_custom_dir() {
    let path = StorePath::new(
        Path::new("/srv/nix"),
        Path::new("/srv/nix/hbqzhmrscihnl9vgvw9nqhlzc64r1gwl-sl-5.05"),
    )
    .unwrap();
    assert_eq!(path.leaf_str(), "hbqzhmrscihnl9vgvw9nqhlzc64r1gwl-sl-5.05");
}

#[test]
fn test_store_path_from_hash_and_name() {
    let hash = HashPart::new("hbqzhmrscihnl9vgvw9nqhlzc64r1gwl").unwrap();
    let path = StorePath::from_hash_and_name(Path::new("/nix/store"), &hash, "sl-5.05");
    assert_eq!(
        path.as_ref() as &Path,
        Path::new("/nix/store/hbqzhmrscihnl9vgvw9nqhlzc64r1gwl-sl-5.05")
    );
}
