mod data;
mod de;
mod dep_path;
mod locator;
mod ser;
mod subgraph;

pub use data::{pnpm_global_change, DependencyKind, PnpmLockfile};
pub use locator::Locator;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("lockfile document must be a mapping at the top level")]
    MalformedDocument,
    #[error("unsupported lockfile version: {0}")]
    UnsupportedSchema(String),
    #[error("malformed importer '{workspace}': dependency '{package}' is {reason}")]
    MalformedImporter {
        workspace: String,
        package: String,
        reason: &'static str,
    },
    #[error("unable to parse package key '{key}': {source}")]
    MalformedLocator {
        key: String,
        #[source]
        source: dep_path::Error,
    },
    #[error("refusing to encode invalid lockfile: {0}")]
    Invariant(String),
}

#[derive(Debug, PartialEq, Eq, Clone)]
struct LockfileVersion {
    version: String,
    format: VersionFormat,
}

#[derive(Debug, PartialEq, Eq, Clone)]
enum VersionFormat {
    String,
    Float,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupportedLockfileVersion {
    V5,
    V6,
    // As of pnpm@9.0.0-rc.0 the lockfile version will now match the pnpm version
    // Lockfile version 7.0 and 9.0 are both the same version
    // See https://github.com/pnpm/pnpm/pull/7861
    V7AndV9,
}

impl LockfileVersion {
    fn supported(&self) -> Result<SupportedLockfileVersion, Error> {
        let major = self
            .version
            .split('.')
            .next()
            .and_then(|major| major.parse::<u32>().ok());
        match major {
            Some(5) => Ok(SupportedLockfileVersion::V5),
            Some(6) => Ok(SupportedLockfileVersion::V6),
            Some(7) | Some(9) => Ok(SupportedLockfileVersion::V7AndV9),
            _ => Err(Error::UnsupportedSchema(self.version.clone())),
        }
    }
}

pub fn pnpm_subgraph(
    contents: &[u8],
    workspace_packages: &[String],
    packages: &[String],
) -> Result<Vec<u8>, crate::Error> {
    let lockfile = PnpmLockfile::from_bytes(contents)?;
    let pruned_lockfile = lockfile.prune(workspace_packages, packages)?;
    let new_contents = pruned_lockfile.encode()?;
    Ok(new_contents)
}

#[cfg(test)]
mod tests {
    use test_case::test_case;

    use super::*;

    #[test_case("5.4", VersionFormat::Float, Ok(SupportedLockfileVersion::V5) ; "v5 float")]
    #[test_case("5", VersionFormat::Float, Ok(SupportedLockfileVersion::V5) ; "v5 integer")]
    #[test_case("6.0", VersionFormat::String, Ok(SupportedLockfileVersion::V6) ; "v6")]
    #[test_case("6.1", VersionFormat::String, Ok(SupportedLockfileVersion::V6) ; "v6 minor")]
    #[test_case("7.0", VersionFormat::String, Ok(SupportedLockfileVersion::V7AndV9) ; "v7")]
    #[test_case("9.0", VersionFormat::String, Ok(SupportedLockfileVersion::V7AndV9) ; "v9")]
    #[test_case("4.0", VersionFormat::Float, Err("4.0") ; "too old")]
    #[test_case("8.0", VersionFormat::String, Err("8.0") ; "never released")]
    #[test_case("latest", VersionFormat::String, Err("latest") ; "not a number")]
    fn test_supported_version(
        version: &str,
        format: VersionFormat,
        expected: Result<SupportedLockfileVersion, &str>,
    ) {
        let version = LockfileVersion {
            version: version.into(),
            format,
        };
        match (version.supported(), expected) {
            (Ok(actual), Ok(expected)) => assert_eq!(actual, expected),
            (Err(Error::UnsupportedSchema(actual)), Err(expected)) => assert_eq!(actual, expected),
            (actual, expected) => panic!("Mismatched result: {:?} {:?}", actual, expected),
        }
    }
}
