//! pnpm lockfile parsing, analysis, and serialization
//!
//! Parsing and analysis are used to track which external packages a workspace
//! package depends on. This allows a lockfile change to invalidate only the
//! workspaces which depend on the changed external packages instead of
//! everything.
//!
//! Serialization is used to prune a lockfile down to a subset of workspaces
//! and is far more error prone than deserialization and analysis.

#![deny(clippy::all)]

mod error;
mod pnpm;

use std::{
    any::Any,
    collections::{HashMap, HashSet},
};

pub use error::Error;
pub use pnpm::{
    pnpm_global_change, pnpm_subgraph, DependencyKind, Error as PnpmError, Locator, PnpmLockfile,
};
use rayon::prelude::*;
use serde::Serialize;

#[derive(Debug, PartialEq, Eq, Clone, PartialOrd, Ord, Hash, Serialize)]
pub struct Package {
    pub key: String,
    pub version: String,
}

/// A trait for exposing common operations for lockfile parsing, analysis, and
/// encoding.
///
/// External packages are identified by key strings which have no shared
/// structure other than being able to uniquely identify a package in the
/// corresponding lockfile. When programming against these keys they should be
/// viewed as a black box and any logic for handling them should live in the
/// specific lockfile implementation which might have additional understanding
/// of them. Using `human_name` can provide a version of the key that is
/// formatted for human viewing.
///
/// We cannot easily expose lockfiles as a standard
/// graph due to overrides that various lockfile formats support. A dependency
/// of `"package": "1.0.0"` might resolve to a different version depending on
/// how it is imported. See https://pnpm.io/settings#overrides
pub trait Lockfile: Send + Sync + Any + std::fmt::Debug {
    /// Look up the version a workspace's dependency declaration was resolved
    /// to. The specifier must match the declaration exactly, `None` is
    /// returned if the workspace doesn't declare the dependency with that
    /// specifier.
    ///
    /// The empty workspace path refers to the repository root.
    fn resolve_specifier<'a>(
        &'a self,
        workspace_path: &str,
        name: &str,
        specifier: &str,
    ) -> Result<Option<&'a str>, Error>;

    /// Resolve a dependency declaration from a workspace package to a lockfile
    /// key
    fn resolve_package(
        &self,
        workspace_path: &str,
        name: &str,
        version: &str,
    ) -> Result<Option<Package>, Error>;

    /// Given a lockfile key return all (prod/optional) direct dependencies
    /// of that package.
    fn all_dependencies(&self, key: &str) -> Result<Option<HashMap<String, String>>, Error>;

    /// Given a list of workspace packages and names of external packages,
    /// produce a lockfile that only references those workspaces and packages
    /// along with everything they depend on.
    fn subgraph(
        &self,
        workspace_packages: &[String],
        packages: &[String],
    ) -> Result<Box<dyn Lockfile>, Error>;

    /// Encode the lockfile to a string of bytes that can be written to disk
    fn encode(&self) -> Result<Vec<u8>, Error>;

    /// All patch files referenced in the lockfile, relative to the repository
    /// root
    fn patches(&self) -> Vec<String> {
        Vec::new()
    }

    /// Serialized form of every setting that affects all packages
    fn global_change_key(&self) -> Vec<u8>;

    /// Determine if there's a global change between two lockfiles
    ///
    /// This generally is only `true` across lockfile version changes or when a
    /// setting changes where it is safer to view everything as changed rather
    /// than try to understand the change.
    fn global_change(&self, other: &dyn Lockfile) -> bool {
        self.global_change_key() != other.global_change_key()
    }

    /// Return any turbo version found in the lockfile
    ///
    /// Used for identifying which version of `turbo` the lockfile references if
    /// no local `turbo` binary is found.
    fn turbo_version(&self) -> Option<String>;

    /// A human friendly version of a lockfile key.
    /// Usually of the form `package@version`, but version might include
    /// additional information to convey difference from other packages in
    /// the lockfile e.g. differing peer dependencies.
    #[allow(unused)]
    fn human_name(&self, package: &Package) -> Option<String> {
        None
    }
}

/// Takes a lockfile, and a map of workspace directory paths -> (package name,
/// version) and calculates the transitive closures for all of them
pub fn all_transitive_closures<L: Lockfile + ?Sized>(
    lockfile: &L,
    workspaces: HashMap<String, HashMap<String, String>>,
    ignore_missing_packages: bool,
) -> Result<HashMap<String, HashSet<Package>>, Error> {
    workspaces
        .into_par_iter()
        .map(|(workspace, unresolved_deps)| {
            let closure = transitive_closure(
                lockfile,
                &workspace,
                unresolved_deps,
                ignore_missing_packages,
            )?;
            Ok((workspace, closure))
        })
        .collect()
}

#[tracing::instrument(skip_all)]
pub fn transitive_closure<L: Lockfile + ?Sized>(
    lockfile: &L,
    workspace_path: &str,
    unresolved_deps: HashMap<String, String>,
    ignore_missing_packages: bool,
) -> Result<HashSet<Package>, Error> {
    let mut transitive_deps = HashSet::new();
    transitive_closure_helper(
        lockfile,
        workspace_path,
        unresolved_deps,
        &mut transitive_deps,
        ignore_missing_packages,
    )?;

    Ok(transitive_deps)
}

fn transitive_closure_helper<L: Lockfile + ?Sized>(
    lockfile: &L,
    workspace_path: &str,
    unresolved_deps: HashMap<String, impl AsRef<str>>,
    resolved_deps: &mut HashSet<Package>,
    ignore_missing_packages: bool,
) -> Result<(), Error> {
    for (name, specifier) in unresolved_deps {
        let pkg = match lockfile.resolve_package(workspace_path, &name, specifier.as_ref()) {
            Ok(pkg) => pkg,
            Err(Error::UnknownWorkspace(_)) if ignore_missing_packages => {
                continue;
            }
            Err(e) => return Err(e),
        };

        match pkg {
            None => {
                continue;
            }
            Some(pkg) if resolved_deps.contains(&pkg) => {
                continue;
            }
            Some(pkg) => {
                let all_deps = lockfile.all_dependencies(&pkg.key)?;
                resolved_deps.insert(pkg);
                if let Some(deps) = all_deps {
                    // we've already found one unresolved dependency, so we can't ignore its set of
                    // dependencies.
                    transitive_closure_helper(
                        lockfile,
                        workspace_path,
                        deps,
                        resolved_deps,
                        false,
                    )?;
                }
            }
        }
    }

    Ok(())
}

impl Package {
    pub fn new(key: impl Into<String>, version: impl Into<String>) -> Self {
        let key = key.into();
        let version = version.into();
        Self { key, version }
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    const PNPM7: &[u8] = include_bytes!("../fixtures/pnpm7-workspace.yaml").as_slice();

    #[test]
    fn test_transitive_closure() {
        let lockfile = PnpmLockfile::from_bytes(PNPM7).unwrap();
        let closures = all_transitive_closures(
            &lockfile,
            HashMap::from([
                (
                    "packages/ui".to_string(),
                    HashMap::from([("react".to_string(), "^18.2.0".to_string())]),
                ),
                (
                    "apps/bad_workspace".to_string(),
                    HashMap::from([("react".to_string(), "^18.2.0".to_string())]),
                ),
            ]),
            true,
        )
        .unwrap();

        let mut closure = closures["packages/ui"].iter().cloned().collect::<Vec<_>>();
        closure.sort();
        assert_eq!(
            closure,
            vec![
                Package::new("/js-tokens/4.0.0", "4.0.0"),
                Package::new("/loose-envify/1.4.0", "1.4.0"),
                Package::new("/react/18.2.0", "18.2.0"),
            ]
        );
        assert!(closures["apps/bad_workspace"].is_empty());
    }

    #[test]
    fn test_missing_workspace_is_an_error() {
        let lockfile = PnpmLockfile::from_bytes(PNPM7).unwrap();
        let result = transitive_closure(
            &lockfile,
            "apps/bad_workspace",
            HashMap::from([("react".to_string(), "^18.2.0".to_string())]),
            false,
        );
        assert!(matches!(result, Err(Error::UnknownWorkspace(_))));
    }

    #[test]
    fn test_boxed_subgraph() {
        let lockfile: Box<dyn Lockfile> = Box::new(PnpmLockfile::from_bytes(PNPM7).unwrap());
        let pruned = lockfile.subgraph(&["packages/ui".into()], &[]).unwrap();
        assert!(pruned
            .resolve_specifier("packages/ui", "react", "^18.2.0")
            .unwrap()
            .is_some());
        assert!(lockfile.global_change(pruned.as_ref()));
        assert_eq!(
            pruned.human_name(&Package::new("/react/18.2.0", "18.2.0")),
            Some("react@18.2.0".into())
        );
    }
}
