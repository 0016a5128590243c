use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Workspace '{0}' not found in lockfile")]
    UnknownWorkspace(String),
    #[error("Unable to parse lockfile document: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error(transparent)]
    Pnpm(#[from] crate::pnpm::Error),
}
