use std::{collections::HashSet, fmt};

use indexmap::IndexMap;
use serde::{
    de::{self, DeserializeSeed, IgnoredAny, MapAccess, SeqAccess, Visitor},
    Deserialize,
};

use super::{
    data::{
        DependenciesMeta, Dependency, DependencyKind, Metadata, PackageSnapshot, PnpmLockfile,
        ProjectSnapshot,
    },
    Error, Locator, LockfileVersion, SupportedLockfileVersion, VersionFormat,
};

type Map<K, V> = std::collections::BTreeMap<K, V>;

impl From<f32> for LockfileVersion {
    fn from(value: f32) -> Self {
        Self {
            version: value.to_string(),
            format: VersionFormat::Float,
        }
    }
}

impl From<String> for LockfileVersion {
    fn from(value: String) -> Self {
        Self {
            version: value,
            format: VersionFormat::String,
        }
    }
}

impl<'de> Deserialize<'de> for LockfileVersion {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum StringOrNum {
            Str(String),
            Num(f32),
        }

        Ok(match StringOrNum::deserialize(deserializer)? {
            StringOrNum::Num(x) => LockfileVersion::from(x),
            StringOrNum::Str(s) => LockfileVersion::from(s),
        })
    }
}

/// A scalar taken as the text it was written as.
///
/// YAML would read an unquoted `1.0` as a float and `1.10` as `1.1`. Versions
/// and specifiers are opaque strings so they must never go through that
/// inference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(super) struct ForcedString(pub(super) String);

impl From<ForcedString> for String {
    fn from(value: ForcedString) -> Self {
        value.0
    }
}

impl<'de> Deserialize<'de> for ForcedString {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        deserializer.deserialize_str(ForcedStringVisitor)
    }
}

struct ForcedStringVisitor;

impl<'de> Visitor<'de> for ForcedStringVisitor {
    type Value = ForcedString;

    fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
        formatter.write_str("a scalar")
    }

    fn visit_str<E: de::Error>(self, v: &str) -> Result<Self::Value, E> {
        Ok(ForcedString(v.to_owned()))
    }

    fn visit_string<E: de::Error>(self, v: String) -> Result<Self::Value, E> {
        Ok(ForcedString(v))
    }

    // Only reachable from self describing formats that have already typed
    // the scalar.
    fn visit_bool<E: de::Error>(self, v: bool) -> Result<Self::Value, E> {
        Ok(ForcedString(v.to_string()))
    }

    fn visit_i64<E: de::Error>(self, v: i64) -> Result<Self::Value, E> {
        Ok(ForcedString(v.to_string()))
    }

    fn visit_u64<E: de::Error>(self, v: u64) -> Result<Self::Value, E> {
        Ok(ForcedString(v.to_string()))
    }

    fn visit_f64<E: de::Error>(self, v: f64) -> Result<Self::Value, E> {
        Ok(ForcedString(v.to_string()))
    }
}

fn next_string<'de, A: MapAccess<'de>>(map: &mut A) -> Result<String, A::Error> {
    Ok(map.next_value::<ForcedString>()?.into())
}

fn next_string_map<'de, A: MapAccess<'de>>(map: &mut A) -> Result<Map<String, String>, A::Error> {
    Ok(map
        .next_value::<Map<String, ForcedString>>()?
        .into_iter()
        .map(|(k, v)| (k, v.into()))
        .collect())
}

fn next_string_list<'de, A: MapAccess<'de>>(map: &mut A) -> Result<Vec<String>, A::Error> {
    Ok(map
        .next_value::<Vec<ForcedString>>()?
        .into_iter()
        .map(String::from)
        .collect())
}

/// First pass over a document, only looks for the schema version.
pub(super) enum Probe {
    Mapping(Option<LockfileVersion>),
    NotMapping,
}

impl<'de> Deserialize<'de> for Probe {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        deserializer.deserialize_any(ProbeVisitor)
    }
}

struct ProbeVisitor;

impl<'de> Visitor<'de> for ProbeVisitor {
    type Value = Probe;

    fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
        formatter.write_str("a pnpm lockfile")
    }

    fn visit_map<A: MapAccess<'de>>(self, mut map: A) -> Result<Self::Value, A::Error> {
        let mut version = None;
        while let Some(key) = map.next_key::<ForcedString>()? {
            match key.0.as_str() {
                "lockfileVersion" => version = Some(map.next_value()?),
                _ => {
                    map.next_value::<IgnoredAny>()?;
                }
            }
        }
        Ok(Probe::Mapping(version))
    }

    fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> Result<Self::Value, A::Error> {
        while seq.next_element::<IgnoredAny>()?.is_some() {}
        Ok(Probe::NotMapping)
    }

    fn visit_unit<E: de::Error>(self) -> Result<Self::Value, E> {
        Ok(Probe::NotMapping)
    }

    fn visit_none<E: de::Error>(self) -> Result<Self::Value, E> {
        Ok(Probe::NotMapping)
    }

    fn visit_bool<E: de::Error>(self, _: bool) -> Result<Self::Value, E> {
        Ok(Probe::NotMapping)
    }

    fn visit_i64<E: de::Error>(self, _: i64) -> Result<Self::Value, E> {
        Ok(Probe::NotMapping)
    }

    fn visit_u64<E: de::Error>(self, _: u64) -> Result<Self::Value, E> {
        Ok(Probe::NotMapping)
    }

    fn visit_f64<E: de::Error>(self, _: f64) -> Result<Self::Value, E> {
        Ok(Probe::NotMapping)
    }

    fn visit_str<E: de::Error>(self, _: &str) -> Result<Self::Value, E> {
        Ok(Probe::NotMapping)
    }
}

#[derive(Debug, Deserialize)]
struct RawDependency {
    specifier: Option<ForcedString>,
    version: Option<ForcedString>,
}

// Pre v6 importers list versions per kind and all specifiers in a separate
// map, later versions nest both under the dependency name.
#[derive(Debug)]
enum RawDependencies {
    Versions(Map<String, String>),
    Entries(Map<String, RawDependency>),
}

#[derive(Debug, Default)]
pub(super) struct RawProject {
    specifiers: Option<Map<String, String>>,
    dependencies: Map<DependencyKind, RawDependencies>,
    dependencies_meta: Option<Map<String, DependenciesMeta>>,
    publish_directory: Option<String>,
}

impl RawProject {
    // Returns false if the field isn't part of a project snapshot
    fn visit_field<'de, A: MapAccess<'de>>(
        &mut self,
        version: SupportedLockfileVersion,
        key: &str,
        map: &mut A,
    ) -> Result<bool, A::Error> {
        if let Some(kind) = DependencyKind::from_field_name(key) {
            let dependencies = match version {
                SupportedLockfileVersion::V5 => RawDependencies::Versions(next_string_map(map)?),
                SupportedLockfileVersion::V6 | SupportedLockfileVersion::V7AndV9 => {
                    RawDependencies::Entries(map.next_value()?)
                }
            };
            self.dependencies.insert(kind, dependencies);
            return Ok(true);
        }
        match key {
            "specifiers" if version == SupportedLockfileVersion::V5 => {
                self.specifiers = Some(next_string_map(map)?)
            }
            "dependenciesMeta" => self.dependencies_meta = Some(map.next_value()?),
            "publishDirectory" => self.publish_directory = Some(next_string(map)?),
            _ => return Ok(false),
        }
        Ok(true)
    }

    fn into_project(self, workspace: &str) -> Result<ProjectSnapshot, Error> {
        let malformed = |package: &str, reason| Error::MalformedImporter {
            workspace: workspace.to_owned(),
            package: package.to_owned(),
            reason,
        };
        let specifiers = self.specifiers.unwrap_or_default();
        let mut seen_specifiers = HashSet::new();
        let mut dependencies = Map::new();
        for (kind, raw) in self.dependencies {
            let mut bucket = Map::new();
            match raw {
                RawDependencies::Versions(versions) => {
                    for (name, version) in versions {
                        let specifier = specifiers
                            .get(&name)
                            .ok_or_else(|| malformed(&name, "missing a specifier"))?;
                        seen_specifiers.insert(name.clone());
                        bucket.insert(
                            name,
                            Dependency {
                                specifier: specifier.clone(),
                                version,
                            },
                        );
                    }
                }
                RawDependencies::Entries(entries) => {
                    for (name, RawDependency { specifier, version }) in entries {
                        let specifier =
                            specifier.ok_or_else(|| malformed(&name, "missing a specifier"))?;
                        let version =
                            version.ok_or_else(|| malformed(&name, "missing a resolved version"))?;
                        bucket.insert(
                            name,
                            Dependency {
                                specifier: specifier.into(),
                                version: version.into(),
                            },
                        );
                    }
                }
            }
            if !bucket.is_empty() {
                dependencies.insert(kind, bucket);
            }
        }
        if let Some(name) = specifiers
            .keys()
            .find(|name| !seen_specifiers.contains(*name))
        {
            return Err(malformed(name, "missing a resolved version"));
        }

        Ok(ProjectSnapshot {
            dependencies,
            dependencies_meta: self.dependencies_meta,
            publish_directory: self.publish_directory,
        })
    }
}

struct ProjectSeed(SupportedLockfileVersion);

impl<'de> DeserializeSeed<'de> for ProjectSeed {
    type Value = RawProject;

    fn deserialize<D>(self, deserializer: D) -> Result<Self::Value, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        deserializer.deserialize_map(self)
    }
}

impl<'de> Visitor<'de> for ProjectSeed {
    type Value = RawProject;

    fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
        formatter.write_str("an importer")
    }

    fn visit_map<A: MapAccess<'de>>(self, mut map: A) -> Result<Self::Value, A::Error> {
        let mut project = RawProject::default();
        while let Some(key) = map.next_key::<String>()? {
            if !project.visit_field(self.0, &key, &mut map)? {
                map.next_value::<IgnoredAny>()?;
            }
        }
        Ok(project)
    }
}

struct ImportersSeed(SupportedLockfileVersion);

impl<'de> DeserializeSeed<'de> for ImportersSeed {
    type Value = IndexMap<String, RawProject>;

    fn deserialize<D>(self, deserializer: D) -> Result<Self::Value, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        deserializer.deserialize_map(self)
    }
}

impl<'de> Visitor<'de> for ImportersSeed {
    type Value = IndexMap<String, RawProject>;

    fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
        formatter.write_str("a map of importers")
    }

    fn visit_map<A: MapAccess<'de>>(self, mut map: A) -> Result<Self::Value, A::Error> {
        let mut importers = IndexMap::new();
        while let Some(path) = map.next_key::<String>()? {
            let project = map.next_value_seed(ProjectSeed(self.0))?;
            importers.insert(path, project);
        }
        Ok(importers)
    }
}

impl<'de> Deserialize<'de> for PackageSnapshot {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        deserializer.deserialize_map(PackageSnapshotVisitor)
    }
}

struct PackageSnapshotVisitor;

impl<'de> Visitor<'de> for PackageSnapshotVisitor {
    type Value = PackageSnapshot;

    fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
        formatter.write_str("a package entry")
    }

    fn visit_map<A: MapAccess<'de>>(self, mut map: A) -> Result<Self::Value, A::Error> {
        let mut snapshot = PackageSnapshot::default();
        while let Some(key) = map.next_key::<String>()? {
            if let Some(kind) = DependencyKind::from_field_name(&key) {
                let edges = next_string_map(&mut map)?;
                if !edges.is_empty() {
                    snapshot.edges.insert(kind, edges);
                }
                continue;
            }
            match key.as_str() {
                "resolution" => snapshot.resolution = Some(map.next_value()?),
                "id" => snapshot.id = Some(next_string(&mut map)?),
                "name" => snapshot.name = Some(next_string(&mut map)?),
                "version" => snapshot.version = Some(next_string(&mut map)?),
                "patched" => snapshot.patched = Some(map.next_value()?),
                _ => {
                    let value = map.next_value::<serde_yaml::Value>()?;
                    snapshot.other.insert(key, value);
                }
            }
        }
        Ok(snapshot)
    }
}

/// Second pass over a document once the schema family is known.
pub(super) struct DocumentSeed(pub(super) SupportedLockfileVersion);

#[derive(Debug, Default)]
pub(super) struct RawDocument {
    metadata: Metadata,
    importers: Option<IndexMap<String, RawProject>>,
    root: RawProject,
    packages: Map<String, PackageSnapshot>,
    snapshots: Option<Map<String, PackageSnapshot>>,
}

impl<'de> DeserializeSeed<'de> for DocumentSeed {
    type Value = RawDocument;

    fn deserialize<D>(self, deserializer: D) -> Result<Self::Value, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        deserializer.deserialize_map(self)
    }
}

impl<'de> Visitor<'de> for DocumentSeed {
    type Value = RawDocument;

    fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
        formatter.write_str("a pnpm lockfile")
    }

    fn visit_map<A: MapAccess<'de>>(self, mut map: A) -> Result<Self::Value, A::Error> {
        let version = self.0;
        let mut doc = RawDocument::default();
        while let Some(key) = map.next_key::<String>()? {
            let metadata = &mut doc.metadata;
            match key.as_str() {
                // Already read by the probe
                "lockfileVersion" => {
                    map.next_value::<IgnoredAny>()?;
                }
                "settings" => metadata.settings = Some(map.next_value()?),
                "neverBuiltDependencies" => {
                    metadata.never_built_dependencies = Some(next_string_list(&mut map)?)
                }
                "onlyBuiltDependencies" => {
                    metadata.only_built_dependencies = Some(next_string_list(&mut map)?)
                }
                "overrides" => metadata.overrides = Some(next_string_map(&mut map)?),
                "packageExtensionsChecksum" => {
                    metadata.package_extensions_checksum = Some(next_string(&mut map)?)
                }
                "patchedDependencies" => metadata.patched_dependencies = Some(map.next_value()?),
                "time" => metadata.time = Some(next_string_map(&mut map)?),
                "importers" => doc.importers = Some(map.next_value_seed(ImportersSeed(version))?),
                "packages" => doc.packages = map.next_value()?,
                "snapshots" if version == SupportedLockfileVersion::V7AndV9 => {
                    doc.snapshots = Some(map.next_value()?)
                }
                _ => {
                    if !doc.root.visit_field(version, &key, &mut map)? {
                        let value = map.next_value::<serde_yaml::Value>()?;
                        doc.metadata.other.insert(key, value);
                    }
                }
            }
        }
        Ok(doc)
    }
}

impl RawDocument {
    fn into_lockfile(
        self,
        lockfile_version: LockfileVersion,
        version: SupportedLockfileVersion,
    ) -> Result<PnpmLockfile, Error> {
        let RawDocument {
            metadata,
            importers,
            root,
            packages,
            snapshots,
        } = self;

        // Lockfiles of repositories without workspaces keep the root project
        // at the top level
        let inline_root = importers.is_none();
        let importers = match importers {
            Some(importers) => importers
                .into_iter()
                .map(|(path, raw)| {
                    let project = raw.into_project(&path)?;
                    Ok((path, project))
                })
                .collect::<Result<IndexMap<_, _>, Error>>()?,
            None => IndexMap::from([(ROOT_IMPORTER.to_owned(), root.into_project(ROOT_IMPORTER)?)]),
        };

        Ok(PnpmLockfile {
            lockfile_version,
            version,
            metadata,
            importers,
            inline_root,
            packages: with_locators(version, packages)?,
            snapshots: snapshots
                .map(|snapshots| with_locators(version, snapshots))
                .transpose()?,
        })
    }
}

fn with_locators(
    version: SupportedLockfileVersion,
    entries: Map<String, PackageSnapshot>,
) -> Result<Map<Locator, PackageSnapshot>, Error> {
    entries
        .into_iter()
        .map(|(key, entry)| {
            let locator =
                Locator::parse(version, &key, entry.name.as_deref(), entry.version.as_deref())?;
            Ok((locator, entry))
        })
        .collect()
}

pub(super) const ROOT_IMPORTER: &str = ".";

#[tracing::instrument(skip_all, fields(len = contents.len()))]
pub(super) fn decode(contents: &[u8]) -> Result<PnpmLockfile, crate::Error> {
    if contents.iter().all(u8::is_ascii_whitespace) {
        return Err(Error::MalformedDocument.into());
    }
    let lockfile_version = match serde_yaml::from_slice::<Probe>(contents)? {
        Probe::NotMapping => return Err(Error::MalformedDocument.into()),
        Probe::Mapping(None) => {
            return Err(Error::UnsupportedSchema("missing lockfileVersion".into()).into())
        }
        Probe::Mapping(Some(version)) => version,
    };
    let version = lockfile_version.supported()?;
    tracing::debug!(
        lockfile_version = %lockfile_version.version,
        ?version,
        "decoding pnpm lockfile"
    );

    let raw = DocumentSeed(version).deserialize(serde_yaml::Deserializer::from_slice(contents))?;
    Ok(raw.into_lockfile(lockfile_version, version)?)
}
