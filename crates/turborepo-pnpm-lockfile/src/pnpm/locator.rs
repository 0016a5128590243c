use std::{
    borrow::Borrow,
    cmp::Ordering,
    fmt,
    hash::{Hash, Hasher},
};

use serde::Serialize;

use super::{
    dep_path::{self, DepPath},
    Error, SupportedLockfileVersion,
};

/// Key of a resolved package in the lockfile's `packages` (or v9
/// `snapshots`) section.
///
/// Identity, ordering and hashing are those of the key string, so a
/// `Map<Locator, _>` can be queried with a `&str`.
#[derive(Debug, Clone)]
pub struct Locator {
    key: String,
    name: String,
    version: String,
    peer_suffix: Option<String>,
}

impl Locator {
    /// Parses a package key.
    ///
    /// Keys of git, tarball and local directory packages don't follow the
    /// `name@version` convention. For those the `name` and `version` fields
    /// of the entry are authoritative.
    pub fn parse(
        version: SupportedLockfileVersion,
        key: &str,
        entry_name: Option<&str>,
        entry_version: Option<&str>,
    ) -> Result<Self, Error> {
        let parsed = match key.starts_with("file:") || key.starts_with("link:") {
            true => Err(dep_path::Error::MissingName(key.to_owned())),
            false => DepPath::parse(version, key),
        };
        match (parsed, entry_name) {
            (Ok(dp), Some(name)) if dp.name != name => Ok(Self::from_entry(key, name, entry_version)),
            (Ok(dp), _) => Ok(Self {
                key: key.to_owned(),
                name: dp.name.to_owned(),
                version: dp.version.to_owned(),
                peer_suffix: dp.peer_suffix.map(|s| s.to_owned()),
            }),
            (Err(_), Some(name)) if !name.is_empty() => {
                Ok(Self::from_entry(key, name, entry_version))
            }
            (Err(source), _) => Err(Error::MalformedLocator {
                key: key.to_owned(),
                source,
            }),
        }
    }

    fn from_entry(key: &str, name: &str, version: Option<&str>) -> Self {
        Self {
            key: key.to_owned(),
            name: name.to_owned(),
            version: version.unwrap_or(key).to_owned(),
            peer_suffix: None,
        }
    }

    pub fn as_str(&self) -> &str {
        &self.key
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Version without any peer or patch suffix
    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn peer_suffix(&self) -> Option<&str> {
        self.peer_suffix.as_deref()
    }

    /// Version with the peer suffix attached, as importers record it
    pub fn full_version(&self) -> String {
        self.dep_path().full_version().into_owned()
    }

    /// The key with the peer suffix removed. In v9 lockfiles this is the key
    /// of the `packages` entry that holds the resolution of a snapshot.
    pub fn without_peer_suffix(&self) -> &str {
        match self.peer_suffix() {
            Some(suffix) if self.key.ends_with(suffix) => {
                let key = &self.key[..self.key.len() - suffix.len()];
                key.strip_suffix('_').unwrap_or(key)
            }
            _ => &self.key,
        }
    }

    /// `name@version` as used by `patchedDependencies`
    pub fn patch_key(&self) -> String {
        format!("{}@{}", self.name, self.version)
    }

    pub fn patch_hash(&self) -> Option<&str> {
        self.dep_path().patch_hash()
    }

    fn dep_path(&self) -> DepPath<'_> {
        DepPath::new(&self.name, &self.version).with_peer_suffix(self.peer_suffix())
    }
}

impl PartialEq for Locator {
    fn eq(&self, other: &Self) -> bool {
        self.key == other.key
    }
}

impl Eq for Locator {}

impl PartialOrd for Locator {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Locator {
    fn cmp(&self, other: &Self) -> Ordering {
        self.key.cmp(&other.key)
    }
}

impl Hash for Locator {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.key.hash(state)
    }
}

impl Borrow<str> for Locator {
    fn borrow(&self) -> &str {
        &self.key
    }
}

impl fmt::Display for Locator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.key)
    }
}

impl Serialize for Locator {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.key)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use test_case::test_case;

    use super::*;

    const V5: SupportedLockfileVersion = SupportedLockfileVersion::V5;
    const V6: SupportedLockfileVersion = SupportedLockfileVersion::V6;
    const V9: SupportedLockfileVersion = SupportedLockfileVersion::V7AndV9;

    #[test_case(V5, "/next/12.2.5_ir3quccc6i62x6qn6jjhyjjiey", None, None, "next", "12.2.5", Some("ir3quccc6i62x6qn6jjhyjjiey") ; "registry with peer hash")]
    #[test_case(V5, "file:packages/ui", Some("ui"), Some("0.0.0"), "ui", "0.0.0", None ; "injected")]
    #[test_case(
        V5,
        "github.com/peerigon/dashboard-icons/ce27ef933144e09cef3911025f3649040a8571b6",
        Some("dashboard-icons"),
        Some("1.0.0"),
        "dashboard-icons",
        "1.0.0",
        None
        ; "git"
    )]
    #[test_case(V6, "/@scope/child@1.0.0", None, None, "@scope/child", "1.0.0", None ; "scoped")]
    #[test_case(V9, "next@14.2.3(react@18.3.1)", None, None, "next", "14.2.3", Some("(react@18.3.1)") ; "v9 snapshot")]
    fn test_parse(
        version: SupportedLockfileVersion,
        key: &str,
        entry_name: Option<&str>,
        entry_version: Option<&str>,
        name: &str,
        bare_version: &str,
        peer_suffix: Option<&str>,
    ) {
        let locator = Locator::parse(version, key, entry_name, entry_version).unwrap();
        assert_eq!(locator.as_str(), key);
        assert_eq!(locator.name(), name);
        assert_eq!(locator.version(), bare_version);
        assert_eq!(locator.peer_suffix(), peer_suffix);
    }

    #[test_case(V5, "file:packages/ui" ; "local without name")]
    #[test_case(V6, "not-a-key" ; "no leading slash")]
    #[test_case(V9, "not-a-key" ; "no version")]
    fn test_malformed(version: SupportedLockfileVersion, key: &str) {
        let err = Locator::parse(version, key, None, None).unwrap_err();
        assert!(
            matches!(&err, Error::MalformedLocator { key: k, .. } if k == key),
            "unexpected error: {err}"
        );
    }

    #[test_case(V5, "/react-dom/18.2.0_react@18.2.0", "/react-dom/18.2.0" ; "v5")]
    #[test_case(V9, "react-dom@18.3.1(react@18.3.1)", "react-dom@18.3.1" ; "v9")]
    #[test_case(V9, "react@18.3.1", "react@18.3.1" ; "no suffix")]
    fn test_without_peer_suffix(version: SupportedLockfileVersion, key: &str, expected: &str) {
        let locator = Locator::parse(version, key, None, None).unwrap();
        assert_eq!(locator.without_peer_suffix(), expected);
    }

    #[test]
    fn test_str_lookup() {
        let mut map = BTreeMap::new();
        map.insert(Locator::parse(V9, "b@1.0.0", None, None).unwrap(), 2);
        map.insert(Locator::parse(V9, "a@1.0.0", None, None).unwrap(), 1);
        assert_eq!(map.get("a@1.0.0"), Some(&1));
        assert_eq!(
            map.keys().map(|l| l.as_str()).collect::<Vec<_>>(),
            vec!["a@1.0.0", "b@1.0.0"]
        );
    }
}
