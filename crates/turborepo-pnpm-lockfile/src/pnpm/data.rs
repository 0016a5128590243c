use std::{borrow::Cow, collections::HashMap};

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::json;

use super::{
    de::{self, ROOT_IMPORTER},
    dep_path::{edge_target, EdgeTarget},
    ser, Locator, LockfileVersion, SupportedLockfileVersion,
};
use crate::{Lockfile, Package};

pub(super) type Map<K, V> = std::collections::BTreeMap<K, V>;

#[derive(Debug, PartialEq, Clone)]
pub struct PnpmLockfile {
    pub(super) lockfile_version: LockfileVersion,
    pub(super) version: SupportedLockfileVersion,
    pub(super) metadata: Metadata,
    pub(super) importers: IndexMap<String, ProjectSnapshot>,
    // Set if the root project was written at the top level of the document
    // instead of under `importers`
    pub(super) inline_root: bool,
    pub(super) packages: Map<Locator, PackageSnapshot>,
    // Only present in v9 lockfiles, holds the dependency edges while
    // `packages` holds the resolutions.
    pub(super) snapshots: Option<Map<Locator, PackageSnapshot>>,
}

/// Lockfile wide settings that are carried through a prune unchanged.
#[derive(Debug, Default, PartialEq, Clone)]
pub(super) struct Metadata {
    pub(super) settings: Option<LockfileSettings>,
    pub(super) never_built_dependencies: Option<Vec<String>>,
    pub(super) only_built_dependencies: Option<Vec<String>>,
    pub(super) overrides: Option<Map<String, String>>,
    pub(super) package_extensions_checksum: Option<String>,
    pub(super) patched_dependencies: Option<Map<String, PatchFile>>,
    pub(super) time: Option<Map<String, String>>,
    // Top level keys we don't know about, emitted as is
    pub(super) other: IndexMap<String, serde_yaml::Value>,
}

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq, Clone)]
pub(super) struct PatchFile {
    pub(super) path: String,
    pub(super) hash: String,
}

#[derive(Debug, Serialize, Deserialize, PartialEq, Clone)]
#[serde(rename_all = "camelCase")]
pub(super) struct LockfileSettings {
    #[serde(skip_serializing_if = "Option::is_none")]
    auto_install_peers: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    exclude_links_from_lockfile: Option<bool>,
    #[serde(flatten)]
    other: Map<String, serde_yaml::Value>,
}

/// The four groups of dependency edges a project or package can declare.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum DependencyKind {
    Dependencies,
    OptionalDependencies,
    DevDependencies,
    PeerDependencies,
}

impl DependencyKind {
    pub const ALL: [Self; 4] = [
        Self::Dependencies,
        Self::OptionalDependencies,
        Self::DevDependencies,
        Self::PeerDependencies,
    ];

    pub fn field_name(self) -> &'static str {
        match self {
            Self::Dependencies => "dependencies",
            Self::OptionalDependencies => "optionalDependencies",
            Self::DevDependencies => "devDependencies",
            Self::PeerDependencies => "peerDependencies",
        }
    }

    pub fn from_field_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.field_name() == name)
    }
}

#[derive(Debug, Default, PartialEq, Eq, Clone)]
pub(super) struct ProjectSnapshot {
    pub(super) dependencies: Map<DependencyKind, Map<String, Dependency>>,
    pub(super) dependencies_meta: Option<Map<String, DependenciesMeta>>,
    pub(super) publish_directory: Option<String>,
}

#[derive(Debug, Serialize, PartialEq, Eq, Clone)]
pub(super) struct Dependency {
    pub(super) specifier: String,
    pub(super) version: String,
}

#[derive(Debug, Default, PartialEq, Clone)]
pub(super) struct PackageSnapshot {
    pub(super) resolution: Option<PackageResolution>,
    pub(super) id: Option<String>,
    pub(super) name: Option<String>,
    pub(super) version: Option<String>,
    pub(super) edges: Map<DependencyKind, Map<String, String>>,
    pub(super) patched: Option<bool>,
    pub(super) other: IndexMap<String, serde_yaml::Value>,
}

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq, Clone)]
pub(super) struct DependenciesMeta {
    #[serde(skip_serializing_if = "Option::is_none")]
    injected: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    node: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    patch: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq, Clone)]
pub(super) struct PackageResolution {
    // Type field, cannot use serde(tag) due to tarball having an empty type field
    // tarball -> none
    // directory -> 'directory'
    // git repository -> 'git'
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub(super) type_field: Option<String>,
    // Tarball fields
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(super) integrity: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(super) tarball: Option<String>,
    // Directory fields
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(super) directory: Option<String>,
    // Git repository fields
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(super) repo: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(super) commit: Option<String>,
}

impl ProjectSnapshot {
    /// All declared dependencies as `(kind, name, dependency)`
    pub(super) fn iter(&self) -> impl Iterator<Item = (DependencyKind, &str, &Dependency)> {
        self.dependencies.iter().flat_map(|(kind, deps)| {
            deps.iter()
                .map(move |(name, dep)| (*kind, name.as_str(), dep))
        })
    }

    // Given a dependency will find the specifier and resolved version that
    // appear in the importer object
    fn find_resolution(&self, name: &str) -> Option<&Dependency> {
        [
            DependencyKind::Dependencies,
            DependencyKind::DevDependencies,
            DependencyKind::OptionalDependencies,
            DependencyKind::PeerDependencies,
        ]
        .into_iter()
        .find_map(|kind| self.dependencies.get(&kind)?.get(name))
    }
}

impl PackageSnapshot {
    /// All outgoing edges as `(kind, name, reference)`
    pub(super) fn edges(&self) -> impl Iterator<Item = (DependencyKind, &str, &str)> {
        self.edges.iter().flat_map(|(kind, edges)| {
            edges
                .iter()
                .map(move |(name, reference)| (*kind, name.as_str(), reference.as_str()))
        })
    }
}

impl PnpmLockfile {
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, crate::Error> {
        de::decode(bytes)
    }

    /// Serializes the lockfile in the layout of its schema version.
    pub fn encode(&self) -> Result<Vec<u8>, crate::Error> {
        ser::encode(self)
    }

    // The section that holds dependency edges for the lockfile's version
    pub(super) fn edge_source(&self) -> &Map<Locator, PackageSnapshot> {
        self.snapshots.as_ref().unwrap_or(&self.packages)
    }

    pub(super) fn get_workspace(
        &self,
        workspace_path: &str,
    ) -> Result<(&str, &ProjectSnapshot), crate::Error> {
        let key = match workspace_path {
            // For pnpm, the root is named "."
            "" => ROOT_IMPORTER,
            k => k,
        };
        self.importers
            .get_key_value(key)
            .map(|(key, project)| (key.as_str(), project))
            .ok_or_else(|| crate::Error::UnknownWorkspace(workspace_path.into()))
    }

    fn package_for(&self, locator: &Locator, entry: &PackageSnapshot) -> Package {
        let version = entry
            .version
            .clone()
            .or_else(|| {
                // v9 snapshots carry no metadata, the `packages` entry does
                self.snapshots.as_ref()?;
                self.packages
                    .get(locator.without_peer_suffix())?
                    .version
                    .clone()
            })
            .unwrap_or_else(|| locator.full_version());
        Package::new(locator.as_str(), version)
    }

    fn package_key<'a>(&self, name: &str, reference: &'a str) -> Option<Cow<'a, str>> {
        match edge_target(self.version, name, reference) {
            EdgeTarget::Link(_) => None,
            EdgeTarget::Injected { key, .. } | EdgeTarget::Package(key) => Some(key),
        }
    }
}

impl Lockfile for PnpmLockfile {
    #[tracing::instrument(skip(self))]
    fn resolve_specifier<'a>(
        &'a self,
        workspace_path: &str,
        name: &str,
        specifier: &str,
    ) -> Result<Option<&'a str>, crate::Error> {
        let (_, importer) = self.get_workspace(workspace_path)?;
        Ok(importer
            .find_resolution(name)
            .filter(|dependency| dependency.specifier == specifier)
            .map(|dependency| dependency.version.as_str()))
    }

    #[tracing::instrument(skip(self))]
    fn resolve_package(
        &self,
        workspace_path: &str,
        name: &str,
        version: &str,
    ) -> Result<Option<Package>, crate::Error> {
        // Check if version is a key
        if let Some((locator, entry)) = self.edge_source().get_key_value(version) {
            return Ok(Some(self.package_for(locator, entry)));
        }

        // Transitive dependencies aren't declared by any importer and are
        // already exact references
        let resolved_version = self
            .resolve_specifier(workspace_path, name, version)?
            .unwrap_or(version);

        let Some(key) = self.package_key(name, resolved_version) else {
            return Ok(None);
        };
        Ok(self
            .edge_source()
            .get_key_value(key.as_ref())
            .map(|(locator, entry)| self.package_for(locator, entry)))
    }

    fn all_dependencies(&self, key: &str) -> Result<Option<HashMap<String, String>>, crate::Error> {
        let Some(entry) = self.edge_source().get(key) else {
            return Ok(None);
        };
        Ok(Some(
            entry
                .edges()
                .filter(|(kind, _, _)| {
                    matches!(
                        kind,
                        DependencyKind::Dependencies | DependencyKind::OptionalDependencies
                    )
                })
                .map(|(_, name, reference)| (name.to_string(), reference.to_string()))
                .collect(),
        ))
    }

    fn subgraph(
        &self,
        workspace_packages: &[String],
        packages: &[String],
    ) -> Result<Box<dyn Lockfile>, crate::Error> {
        Ok(Box::new(self.prune(workspace_packages, packages)?))
    }

    fn encode(&self) -> Result<Vec<u8>, crate::Error> {
        PnpmLockfile::encode(self)
    }

    fn patches(&self) -> Vec<String> {
        let mut patches = self
            .metadata
            .patched_dependencies
            .iter()
            .flatten()
            .map(|(_, patch)| patch.path.clone())
            .collect::<Vec<_>>();
        patches.sort();
        patches
    }

    fn global_change_key(&self) -> Vec<u8> {
        let mut buf = vec![b'p', b'n', b'p', b'm', 0];

        serde_json::to_writer(
            &mut buf,
            &json!({
                "version": self.lockfile_version.version,
                "checksum": self.metadata.package_extensions_checksum,
                "overrides": self.metadata.overrides,
                "patched_deps": self.metadata.patched_dependencies,
                "settings": self.metadata.settings,
            }),
        )
        .expect("writing to Vec cannot fail");

        buf
    }

    fn turbo_version(&self) -> Option<String> {
        let (_, root) = self.get_workspace("").ok()?;
        let dependency = root.find_resolution("turbo")?;
        let key = self.package_key("turbo", &dependency.version)?;
        let (locator, _) = self.edge_source().get_key_value(key.as_ref())?;
        Some(locator.version().to_owned())
    }

    fn human_name(&self, package: &Package) -> Option<String> {
        let (locator, _) = self.edge_source().get_key_value(package.key.as_str())?;
        Some(format!("{}@{}", locator.name(), package.version))
    }
}

/// Returns true if any lockfile wide setting differs between the two
/// lockfiles, in which case every package should be considered changed.
pub fn pnpm_global_change(
    prev_contents: &[u8],
    curr_contents: &[u8],
) -> Result<bool, crate::Error> {
    let prev_data = PnpmLockfile::from_bytes(prev_contents)?;
    let curr_data = PnpmLockfile::from_bytes(curr_contents)?;
    let (prev, curr) = (&prev_data.metadata, &curr_data.metadata);
    Ok(prev_data.lockfile_version != curr_data.lockfile_version
        || prev.package_extensions_checksum != curr.package_extensions_checksum
        || prev.overrides != curr.overrides
        || prev.patched_dependencies != curr.patched_dependencies
        || prev.settings != curr.settings)
}
