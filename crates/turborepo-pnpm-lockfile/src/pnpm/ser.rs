use std::cmp::Ordering;

use itertools::Itertools;
use serde::{
    ser::{Error as _, SerializeMap},
    Serialize, Serializer,
};

use super::{
    data::{DependencyKind, Map, PackageSnapshot, PnpmLockfile, ProjectSnapshot},
    de::ROOT_IMPORTER,
    Error, LockfileVersion, SupportedLockfileVersion, VersionFormat,
};

impl Serialize for LockfileVersion {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match self.format {
            VersionFormat::String => serializer.serialize_str(&self.version),
            VersionFormat::Float => {
                let version: f32 = self.version.parse().map_err(|_| {
                    S::Error::custom(format!(
                        "lockfile version '{}' is not a valid float",
                        self.version
                    ))
                })?;
                serializer.serialize_f32(version)
            }
        }
    }
}

impl Serialize for PackageSnapshot {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let mut map = serializer.serialize_map(None)?;
        if let Some(resolution) = &self.resolution {
            map.serialize_entry("resolution", resolution)?;
        }
        if let Some(id) = &self.id {
            map.serialize_entry("id", id)?;
        }
        if let Some(name) = &self.name {
            map.serialize_entry("name", name)?;
        }
        if let Some(version) = &self.version {
            map.serialize_entry("version", version)?;
        }
        for kind in DependencyKind::ALL {
            if let Some(edges) = self.edges.get(&kind) {
                map.serialize_entry(kind.field_name(), edges)?;
            }
        }
        if let Some(patched) = &self.patched {
            map.serialize_entry("patched", patched)?;
        }
        for (key, value) in &self.other {
            map.serialize_entry(key, value)?;
        }
        map.end()
    }
}

struct ProjectView<'a> {
    version: SupportedLockfileVersion,
    project: &'a ProjectSnapshot,
}

impl Serialize for ProjectView<'_> {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let mut map = serializer.serialize_map(None)?;
        serialize_project_fields(&mut map, self.version, self.project)?;
        map.end()
    }
}

// Shared between importers and the root project of lockfiles without
// workspaces, which is written at the top level.
fn serialize_project_fields<M: SerializeMap>(
    map: &mut M,
    version: SupportedLockfileVersion,
    project: &ProjectSnapshot,
) -> Result<(), M::Error> {
    match version {
        SupportedLockfileVersion::V5 => {
            let specifiers = project
                .iter()
                .map(|(_, name, dependency)| (name, dependency.specifier.as_str()))
                .collect::<Map<_, _>>();
            if !specifiers.is_empty() {
                map.serialize_entry("specifiers", &specifiers)?;
            }
            for (kind, dependencies) in &project.dependencies {
                let versions = dependencies
                    .iter()
                    .map(|(name, dependency)| (name, dependency.version.as_str()))
                    .collect::<Map<_, _>>();
                map.serialize_entry(kind.field_name(), &versions)?;
            }
        }
        SupportedLockfileVersion::V6 | SupportedLockfileVersion::V7AndV9 => {
            for (kind, dependencies) in &project.dependencies {
                map.serialize_entry(kind.field_name(), dependencies)?;
            }
        }
    }
    if let Some(meta) = &project.dependencies_meta {
        map.serialize_entry("dependenciesMeta", meta)?;
    }
    if let Some(publish_directory) = &project.publish_directory {
        map.serialize_entry("publishDirectory", publish_directory)?;
    }
    Ok(())
}

// The root importer comes first, the rest are sorted
fn importer_order(a: &str, b: &str) -> Ordering {
    (a != ROOT_IMPORTER, a).cmp(&(b != ROOT_IMPORTER, b))
}

struct Importers<'a>(&'a PnpmLockfile);

impl Serialize for Importers<'_> {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let lockfile = self.0;
        let mut map = serializer.serialize_map(Some(lockfile.importers.len()))?;
        for (path, project) in lockfile
            .importers
            .iter()
            .sorted_by(|(a, _), (b, _)| importer_order(a, b))
        {
            map.serialize_entry(
                path,
                &ProjectView {
                    version: lockfile.version,
                    project,
                },
            )?;
        }
        map.end()
    }
}

impl Serialize for PnpmLockfile {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let metadata = &self.metadata;
        let mut map = serializer.serialize_map(None)?;
        map.serialize_entry("lockfileVersion", &self.lockfile_version)?;
        if let Some(settings) = &metadata.settings {
            map.serialize_entry("settings", settings)?;
        }
        if let Some(never_built) = &metadata.never_built_dependencies {
            map.serialize_entry("neverBuiltDependencies", never_built)?;
        }
        if let Some(only_built) = &metadata.only_built_dependencies {
            map.serialize_entry("onlyBuiltDependencies", only_built)?;
        }
        if let Some(overrides) = &metadata.overrides {
            map.serialize_entry("overrides", overrides)?;
        }
        if let Some(checksum) = &metadata.package_extensions_checksum {
            map.serialize_entry("packageExtensionsChecksum", checksum)?;
        }
        if let Some(patches) = &metadata.patched_dependencies {
            map.serialize_entry("patchedDependencies", patches)?;
        }
        match self.inline_root {
            true => {
                if let Some(root) = self.importers.get(ROOT_IMPORTER) {
                    serialize_project_fields(&mut map, self.version, root)?;
                }
            }
            false => map.serialize_entry("importers", &Importers(self))?,
        }
        if !self.packages.is_empty() {
            map.serialize_entry("packages", &self.packages)?;
        }
        if let Some(snapshots) = &self.snapshots {
            map.serialize_entry("snapshots", snapshots)?;
        }
        if let Some(time) = &metadata.time {
            map.serialize_entry("time", time)?;
        }
        for (key, value) in &metadata.other {
            map.serialize_entry(key, value)?;
        }
        map.end()
    }
}

// Checks that the lockfile can be written in a form it can be read back from
fn check_invariants(lockfile: &PnpmLockfile) -> Result<(), Error> {
    if let Some(path) = lockfile.importers.keys().find(|path| path.is_empty()) {
        return Err(Error::Invariant(format!("importer with empty path '{path}'")));
    }
    if lockfile.inline_root
        && lockfile
            .importers
            .keys()
            .any(|path| path != ROOT_IMPORTER)
    {
        return Err(Error::Invariant(
            "lockfile without importers section has workspace projects".into(),
        ));
    }
    let locators = lockfile
        .packages
        .keys()
        .chain(lockfile.snapshots.iter().flat_map(|snapshots| snapshots.keys()));
    for locator in locators {
        if locator.name().is_empty() || locator.as_str().is_empty() {
            return Err(Error::Invariant(format!(
                "package entry '{locator}' has no name"
            )));
        }
    }
    Ok(())
}

#[tracing::instrument(skip_all)]
pub(super) fn encode(lockfile: &PnpmLockfile) -> Result<Vec<u8>, crate::Error> {
    check_invariants(lockfile)?;
    Ok(serde_yaml::to_string(lockfile)?.into_bytes())
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn test_importer_order() {
        let mut paths = vec!["packages/ui", ".", "apps/web", "apps/docs"];
        paths.sort_by(|a, b| importer_order(a, b));
        assert_eq!(paths, vec![".", "apps/docs", "apps/web", "packages/ui"]);
    }

    #[test]
    fn test_lockfile_version() {
        let float = LockfileVersion {
            version: "5.4".into(),
            format: VersionFormat::Float,
        };
        let string = LockfileVersion {
            version: "6.0".into(),
            format: VersionFormat::String,
        };
        assert_eq!(serde_yaml::to_string(&float).unwrap(), "5.4\n");
        assert_eq!(serde_yaml::to_string(&string).unwrap(), "'6.0'\n");
        let invalid = LockfileVersion {
            version: "five".into(),
            format: VersionFormat::Float,
        };
        assert!(serde_yaml::to_string(&invalid).is_err());
    }

    #[test]
    fn test_package_snapshot_round_trip() {
        let original_contents = "a:
  resolution:
    type: directory
    directory: packages/ui
  name: ui
  version: 0.0.0
  dev: false
b:
  resolution:
    integrity: deadbeef
    tarball: path/to/tarball.tar.gz
  name: tar
  version: 0.0.0
  dev: false
c:
  resolution:
    repo: great-repo.git
    commit: greatcommit
  name: git
  version: 0.0.0
  dependencies:
    foo: 1.0.0
  dev: false
";
        let original_parsed: Map<String, PackageSnapshot> =
            serde_yaml::from_str(original_contents).unwrap();
        let contents = serde_yaml::to_string(&original_parsed).unwrap();
        assert_eq!(original_contents, &contents);
    }
}
