use std::collections::{HashSet, VecDeque};

use super::{
    data::{Map, PackageSnapshot, PatchFile, PnpmLockfile},
    de::ROOT_IMPORTER,
    dep_path::{edge_target, resolve_workspace_path, EdgeTarget},
    Locator,
};

/// Walks the dependency graph from a set of importers, collecting every
/// importer and package entry that is reachable.
struct Closure<'a> {
    lockfile: &'a PnpmLockfile,
    importers: HashSet<&'a str>,
    locators: HashSet<&'a Locator>,
    importer_queue: VecDeque<&'a str>,
    locator_queue: VecDeque<&'a Locator>,
}

impl<'a> Closure<'a> {
    fn new(lockfile: &'a PnpmLockfile) -> Self {
        Self {
            lockfile,
            importers: HashSet::new(),
            locators: HashSet::new(),
            importer_queue: VecDeque::new(),
            locator_queue: VecDeque::new(),
        }
    }

    // Returns false if there is no importer at the given path
    fn add_importer(&mut self, path: &str) -> bool {
        let Some((path, _)) = self.lockfile.importers.get_key_value(path) else {
            return false;
        };
        if self.importers.insert(path) {
            self.importer_queue.push_back(path);
        }
        true
    }

    fn add_locator(&mut self, key: &str) {
        let Some((locator, _)) = self.lockfile.edge_source().get_key_value(key) else {
            // Unresolved peers and skipped optional dependencies have no entry
            tracing::trace!(key, "no package entry, skipping");
            return;
        };
        if self.locators.insert(locator) {
            self.locator_queue.push_back(locator);
        }
    }

    // `base` is the importer the edge is declared in, references in package
    // entries are relative to the repository root
    fn follow(&mut self, base: &str, name: &str, reference: &str) {
        match edge_target(self.lockfile.version, name, reference) {
            EdgeTarget::Link(path) => match resolve_workspace_path(base, path) {
                Some(importer) if self.add_importer(&importer) => {}
                _ => tracing::debug!(base, name, reference, "link outside of workspace"),
            },
            EdgeTarget::Injected { key, path } => {
                self.add_locator(&key);
                if let Some(importer) = resolve_workspace_path(ROOT_IMPORTER, path) {
                    self.add_importer(&importer);
                }
            }
            EdgeTarget::Package(key) => self.add_locator(&key),
        }
    }

    fn run(&mut self) {
        let lockfile = self.lockfile;
        loop {
            if let Some(path) = self.importer_queue.pop_front() {
                let Some(project) = lockfile.importers.get(path) else {
                    continue;
                };
                for (_, name, dependency) in project.iter() {
                    self.follow(path, name, &dependency.version);
                }
            } else if let Some(locator) = self.locator_queue.pop_front() {
                let Some(entry) = lockfile.edge_source().get(locator) else {
                    continue;
                };
                for (_, name, reference) in entry.edges() {
                    self.follow(ROOT_IMPORTER, name, reference);
                }
            } else {
                break;
            }
        }
    }
}

impl PnpmLockfile {
    /// Produces a lockfile containing only the given workspaces, the root
    /// project, and everything they transitively depend on.
    ///
    /// `packages` names extra packages that should be kept along with their
    /// dependencies, every version of a package with that name is retained.
    #[tracing::instrument(skip_all, fields(workspaces = workspace_packages.len()))]
    pub fn prune(
        &self,
        workspace_packages: &[String],
        packages: &[String],
    ) -> Result<Self, crate::Error> {
        let mut closure = Closure::new(self);
        closure.add_importer(ROOT_IMPORTER);
        for workspace in workspace_packages {
            let (path, _) = self.get_workspace(workspace)?;
            closure.add_importer(path);
        }
        let extra_names = packages.iter().map(String::as_str).collect::<HashSet<_>>();
        for locator in self.edge_source().keys() {
            if extra_names.contains(locator.name()) {
                closure.add_locator(locator.as_str());
            }
        }
        closure.run();
        tracing::debug!(
            importers = closure.importers.len(),
            packages = closure.locators.len(),
            "pruned lockfile"
        );

        let importers = self
            .importers
            .iter()
            .filter(|(path, _)| closure.importers.contains(path.as_str()))
            .map(|(path, project)| (path.clone(), project.clone()))
            .collect();
        let retained = self
            .edge_source()
            .iter()
            .filter(|(locator, _)| closure.locators.contains(locator))
            .map(|(locator, entry)| (locator.clone(), entry.clone()))
            .collect::<Map<_, _>>();

        let mut metadata = self.metadata.clone();
        metadata.patched_dependencies = self
            .metadata
            .patched_dependencies
            .as_ref()
            .map(|patches| Self::prune_patches(patches, &retained));

        let (packages, snapshots) = match self.snapshots {
            Some(_) => {
                let resolutions = retained
                    .keys()
                    .map(Locator::without_peer_suffix)
                    .collect::<HashSet<_>>();
                let packages = self
                    .packages
                    .iter()
                    .filter(|(locator, _)| resolutions.contains(locator.as_str()))
                    .map(|(locator, entry)| (locator.clone(), entry.clone()))
                    .collect();
                (packages, Some(retained))
            }
            None => (retained, None),
        };

        Ok(Self {
            lockfile_version: self.lockfile_version.clone(),
            version: self.version,
            metadata,
            importers,
            inline_root: self.inline_root,
            packages,
            snapshots,
        })
    }

    fn prune_patches(
        patches: &Map<String, PatchFile>,
        pruned_packages: &Map<Locator, PackageSnapshot>,
    ) -> Map<String, PatchFile> {
        let mut pruned_patches = Map::new();
        for locator in pruned_packages.keys() {
            let patch_key = locator.patch_key();
            if let Some(patch) = patches
                .get(&patch_key)
                .filter(|patch| locator.patch_hash() == Some(patch.hash.as_str()))
            {
                pruned_patches.insert(patch_key, patch.clone());
            }
        }
        pruned_patches
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use itertools::Itertools;
    use pretty_assertions::assert_eq;
    use test_case::test_case;

    use super::*;
    use crate::Lockfile;

    const PNPM7: &[u8] = include_bytes!("../../fixtures/pnpm7-workspace.yaml").as_slice();
    const PNPM8: &[u8] = include_bytes!("../../fixtures/pnpm8.yaml").as_slice();
    const PNPM9: &[u8] = include_bytes!("../../fixtures/pnpm9.yaml").as_slice();

    fn importer_paths(lockfile: &PnpmLockfile) -> Vec<&str> {
        lockfile.importers.keys().map(String::as_str).sorted().collect()
    }

    fn package_keys(packages: &Map<Locator, PackageSnapshot>) -> Vec<&str> {
        packages.keys().map(Locator::as_str).collect()
    }

    #[test]
    fn test_injected_package_is_kept() {
        let lockfile = PnpmLockfile::from_bytes(PNPM7).unwrap();
        let pruned = lockfile.prune(&["apps/docs".into()], &[]).unwrap();
        assert!(pruned.packages.contains_key("file:packages/ui"));
        assert_eq!(importer_paths(&pruned), vec![".", "apps/docs", "packages/ui"]);
        // The injected copy depends on react through packages/ui
        assert!(pruned.packages.contains_key("/react/18.2.0"));
        assert!(!pruned.packages.contains_key("/lodash/4.17.21_ehchni3mpmovsvjxesffg2i5a4"));
    }

    #[test]
    fn test_linked_workspace_is_kept() {
        let lockfile = PnpmLockfile::from_bytes(PNPM7).unwrap();
        let pruned = lockfile.prune(&["apps/web".into()], &[]).unwrap();
        assert_eq!(importer_paths(&pruned), vec![".", "apps/web", "packages/ui"]);
        assert!(!pruned.packages.contains_key("file:packages/ui"));
        assert!(pruned.packages.contains_key("/lodash/4.17.21_ehchni3mpmovsvjxesffg2i5a4"));
        assert_eq!(pruned.patches(), vec!["patches/lodash@4.17.21.patch"]);
    }

    #[test]
    fn test_patches_are_pruned() {
        let lockfile = PnpmLockfile::from_bytes(PNPM7).unwrap();
        let pruned = lockfile.prune(&["packages/ui".into()], &[]).unwrap();
        assert!(pruned.patches().is_empty());
        assert_eq!(pruned.metadata.patched_dependencies, Some(Map::new()));
    }

    #[test]
    fn test_root_only() {
        let lockfile = PnpmLockfile::from_bytes(PNPM7).unwrap();
        let pruned = lockfile.prune(&[], &[]).unwrap();
        assert_eq!(importer_paths(&pruned), vec!["."]);
        assert_eq!(
            package_keys(&pruned.packages),
            vec!["/prettier/2.7.1", "/turbo-linux-64/1.4.6", "/turbo/1.4.6"]
        );
    }

    #[test]
    fn test_v6_links() {
        let lockfile = PnpmLockfile::from_bytes(PNPM8).unwrap();
        let pruned = lockfile.prune(&["packages/a".into()], &[]).unwrap();
        assert_eq!(importer_paths(&pruned), vec![".", "packages/a", "packages/c"]);
        assert_eq!(
            package_keys(&pruned.packages),
            vec![
                "/is-number@6.0.0",
                "/is-odd@3.0.1",
                "/lodash@4.17.21",
                "/turbo-linux-64@1.6.3",
                "/turbo@1.6.3",
            ]
        );
    }

    #[test]
    fn test_v9_snapshots() {
        let lockfile = PnpmLockfile::from_bytes(PNPM9).unwrap();
        let pruned = lockfile.prune(&["packages/ui".into()], &[]).unwrap();
        assert_eq!(importer_paths(&pruned), vec![".", "packages/ui"]);
        assert_eq!(
            package_keys(pruned.snapshots.as_ref().unwrap()),
            vec![
                "js-tokens@4.0.0",
                "loose-envify@1.4.0",
                "react@18.3.1",
                "turbo-linux-64@2.0.4",
                "turbo@2.0.4",
                "typescript@5.4.5",
            ]
        );
        assert_eq!(
            package_keys(&pruned.packages),
            package_keys(pruned.snapshots.as_ref().unwrap())
        );

        let pruned = lockfile.prune(&["apps/web".into()], &[]).unwrap();
        let snapshots = pruned.snapshots.as_ref().unwrap();
        assert!(snapshots.contains_key("next@14.2.3(react-dom@18.3.1(react@18.3.1))(react@18.3.1)"));
        assert!(snapshots.contains_key("react-dom@18.3.1(react@18.3.1)"));
        assert!(pruned.packages.contains_key("next@14.2.3"));
        assert!(pruned.packages.contains_key("react-dom@18.3.1"));
        assert!(!pruned.packages.contains_key("left-pad@1.3.0"));
        assert_eq!(importer_paths(&pruned), vec![".", "apps/web", "packages/ui"]);
    }

    #[test_case(PNPM7, "/left-pad/1.3.0" ; "v5")]
    #[test_case(PNPM9, "left-pad@1.3.0" ; "v9")]
    fn test_extra_packages(fixture: &[u8], key: &str) {
        let lockfile = PnpmLockfile::from_bytes(fixture).unwrap();
        let pruned = lockfile.prune(&[], &[]).unwrap();
        assert!(!pruned.packages.contains_key(key));
        let pruned = lockfile.prune(&[], &["left-pad".into()]).unwrap();
        assert!(pruned.packages.contains_key(key));
    }

    #[test]
    fn test_cycles_terminate() {
        let contents = "lockfileVersion: '6.0'
importers:
  .:
    dependencies:
      a:
        specifier: ^1.0.0
        version: 1.0.0
packages:
  /a@1.0.0:
    resolution: {integrity: sha512-a}
    dependencies:
      b: 1.0.0
    dev: false
  /b@1.0.0:
    resolution: {integrity: sha512-b}
    dependencies:
      a: 1.0.0
    dev: false
  /c@1.0.0:
    resolution: {integrity: sha512-c}
    dev: false
";
        let lockfile = PnpmLockfile::from_bytes(contents.as_bytes()).unwrap();
        let pruned = lockfile.prune(&[], &[]).unwrap();
        assert_eq!(package_keys(&pruned.packages), vec!["/a@1.0.0", "/b@1.0.0"]);
        let pruned = lockfile.prune(&[], &["c".into()]).unwrap();
        assert_eq!(
            package_keys(&pruned.packages),
            vec!["/a@1.0.0", "/b@1.0.0", "/c@1.0.0"]
        );
    }

    #[test]
    fn test_unknown_workspace() {
        let lockfile = PnpmLockfile::from_bytes(PNPM7).unwrap();
        let err = lockfile
            .prune(&["apps/docs".into(), "apps/bad_workspace".into()], &[])
            .unwrap_err();
        assert!(
            matches!(&err, crate::Error::UnknownWorkspace(path) if path == "apps/bad_workspace"),
            "unexpected error: {err}"
        );
    }

    #[test]
    fn test_pruned_lockfile_round_trips() {
        for fixture in [PNPM7, PNPM8, PNPM9] {
            let lockfile = PnpmLockfile::from_bytes(fixture).unwrap();
            let workspaces = lockfile
                .importers
                .keys()
                .filter(|path| path.as_str() != ROOT_IMPORTER)
                .take(1)
                .cloned()
                .collect::<Vec<_>>();
            let pruned = lockfile.prune(&workspaces, &[]).unwrap();
            let decoded = PnpmLockfile::from_bytes(&pruned.encode().unwrap()).unwrap();
            assert_eq!(decoded, pruned);
        }
    }

    // Every importer and package reachable from `roots`, following edges the
    // same way pnpm links them.
    fn reachable(lockfile: &PnpmLockfile, roots: &[&str]) -> (BTreeSet<String>, BTreeSet<String>) {
        enum Node {
            Importer(String),
            Package(String),
        }
        let mut importers = BTreeSet::new();
        let mut packages = BTreeSet::new();
        let mut stack = roots
            .iter()
            .map(|path| Node::Importer(path.to_string()))
            .collect::<Vec<_>>();
        while let Some(node) = stack.pop() {
            let edges: Vec<(String, String, String)> = match node {
                Node::Importer(path) => {
                    let Some(project) = lockfile.importers.get(&path) else {
                        continue;
                    };
                    if !importers.insert(path.clone()) {
                        continue;
                    }
                    project
                        .iter()
                        .map(|(_, name, dep)| (path.clone(), name.into(), dep.version.clone()))
                        .collect()
                }
                Node::Package(key) => {
                    let Some(entry) = lockfile.edge_source().get(key.as_str()) else {
                        continue;
                    };
                    if !packages.insert(key) {
                        continue;
                    }
                    entry
                        .edges()
                        .map(|(_, name, reference)| (".".into(), name.into(), reference.into()))
                        .collect()
                }
            };
            for (base, name, reference) in edges {
                match edge_target(lockfile.version, &name, &reference) {
                    EdgeTarget::Link(path) => {
                        stack.extend(resolve_workspace_path(&base, path).map(Node::Importer));
                    }
                    EdgeTarget::Injected { key, path } => {
                        stack.push(Node::Package(key.into_owned()));
                        stack.extend(resolve_workspace_path(".", path).map(Node::Importer));
                    }
                    EdgeTarget::Package(key) => stack.push(Node::Package(key.into_owned())),
                }
            }
        }
        (importers, packages)
    }

    fn contents(lockfile: &PnpmLockfile) -> (BTreeSet<String>, BTreeSet<String>) {
        (
            lockfile.importers.keys().cloned().collect(),
            lockfile
                .edge_source()
                .keys()
                .map(|locator| locator.as_str().to_owned())
                .collect(),
        )
    }

    #[test_case(PNPM7 ; "v5")]
    #[test_case(PNPM8 ; "v6")]
    #[test_case(PNPM9 ; "v9")]
    fn test_closure_is_minimal(fixture: &[u8]) {
        let lockfile = PnpmLockfile::from_bytes(fixture).unwrap();
        let workspaces = lockfile
            .importers
            .keys()
            .filter(|path| path.as_str() != ROOT_IMPORTER)
            .cloned()
            .collect::<Vec<_>>();
        for subset in workspaces.iter().cloned().powerset() {
            let pruned = lockfile.prune(&subset, &[]).unwrap();
            let roots = subset
                .iter()
                .map(String::as_str)
                .chain([ROOT_IMPORTER])
                .collect::<Vec<_>>();

            // Everything reachable from the requested workspaces is kept
            assert_eq!(
                contents(&pruned),
                reachable(&lockfile, &roots),
                "pruning to {subset:?}"
            );
            // and nothing in the pruned lockfile is unreachable
            assert_eq!(contents(&pruned), reachable(&pruned, &roots));
        }
    }
}
