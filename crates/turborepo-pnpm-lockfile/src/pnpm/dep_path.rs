use std::borrow::Cow;

use nom::{
    branch::alt,
    bytes::complete::{is_not, tag},
    combinator::{opt, recognize},
    sequence::tuple,
    Finish, IResult,
};

use super::SupportedLockfileVersion;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Nom(#[from] nom::error::Error<String>),
    #[error("dependency path '{0}' contains no '@'")]
    MissingAt(String),
    #[error("dependency path '{0}' has an empty version following '@'")]
    MissingVersion(String),
    #[error("dependency path '{0}' has an empty package name")]
    MissingName(String),
}

/// A parsed package key, borrowing from the key it was parsed from.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct DepPath<'a> {
    pub name: &'a str,
    pub version: &'a str,
    pub host: Option<&'a str>,
    pub peer_suffix: Option<&'a str>,
}

/// Where a dependency edge points to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EdgeTarget<'a> {
    /// `link:` reference to a sibling workspace package. The path is relative
    /// to whoever declares the edge.
    Link(&'a str),
    /// `file:` reference to a workspace package that gets copied into
    /// `node_modules`. It has both a package entry and an importer.
    Injected { key: Cow<'a, str>, path: &'a str },
    /// Key of a package entry
    Package(Cow<'a, str>),
}

impl<'a> DepPath<'a> {
    pub fn new(name: &'a str, version: &'a str) -> Self {
        Self {
            name,
            version,
            host: None,
            peer_suffix: None,
        }
    }

    pub fn parse(version: SupportedLockfileVersion, input: &'a str) -> Result<Self, Error> {
        let dep_path = match version {
            SupportedLockfileVersion::V7AndV9 => parse_dep_path_v9(input)?,
            SupportedLockfileVersion::V5 | SupportedLockfileVersion::V6 => {
                let (_, dep_path) = parse_dep_path(input).map_err(|e| e.to_owned()).finish()?;
                dep_path
            }
        };
        if dep_path.name.is_empty() {
            return Err(Error::MissingName(input.to_owned()));
        }
        Ok(dep_path)
    }

    pub fn with_host(mut self, host: Option<&'a str>) -> Self {
        self.host = host;
        self
    }

    pub fn with_peer_suffix(mut self, peer_suffix: Option<&'a str>) -> Self {
        self.peer_suffix = peer_suffix;
        self
    }

    /// Version including any peer or patch suffix in the form the lockfile
    /// family writes it in importer sections.
    pub fn full_version(&self) -> Cow<'a, str> {
        match self.peer_suffix {
            // v6+ suffixes are self delimiting
            Some(suffix) if suffix.starts_with('(') => format!("{}{suffix}", self.version).into(),
            Some(suffix) => format!("{}_{suffix}", self.version).into(),
            None => self.version.into(),
        }
    }

    pub fn patch_hash(&self) -> Option<&'a str> {
        self.peer_suffix.and_then(|s| {
            if s.starts_with('(') {
                let (_, suffixes) = parse_v6_suffixes(s).ok()?;
                suffixes
                    .into_iter()
                    .find_map(|s| s.strip_prefix("patch_hash="))
            } else if let Some(idx) = s.find('_') {
                Some(&s[..idx])
            } else {
                // A lone pre v6 suffix is either a patch hash or a peer hash
                Some(s)
            }
        })
    }
}

/// Builds the package key for a registry package.
pub fn format_key(version: SupportedLockfileVersion, name: &str, reference: &str) -> String {
    match version {
        SupportedLockfileVersion::V5 => format!("/{name}/{reference}"),
        SupportedLockfileVersion::V6 => format!("/{name}@{reference}"),
        SupportedLockfileVersion::V7AndV9 => format!("{name}@{reference}"),
    }
}

/// Classifies the reference of a dependency edge `name: reference`.
// Mirrors `refToRelative` from `@pnpm/dependency-path`
pub fn edge_target<'a>(
    version: SupportedLockfileVersion,
    name: &str,
    reference: &'a str,
) -> EdgeTarget<'a> {
    if let Some(path) = reference.strip_prefix("link:") {
        return EdgeTarget::Link(path);
    }
    if let Some(path) = reference.strip_prefix("file:") {
        let key = match version {
            SupportedLockfileVersion::V7AndV9 => format!("{name}@{reference}").into(),
            SupportedLockfileVersion::V5 | SupportedLockfileVersion::V6 => reference.into(),
        };
        return EdgeTarget::Injected { key, path };
    }
    let is_key = match version {
        SupportedLockfileVersion::V7AndV9 => {
            if reference.starts_with('@') {
                true
            } else if let Some(at) = reference.find('@') {
                let before_colon = reference.find(':').map_or(true, |colon| at < colon);
                let before_paren = reference.find('(').map_or(true, |paren| at < paren);
                before_colon && before_paren
            } else {
                false
            }
        }
        SupportedLockfileVersion::V5 | SupportedLockfileVersion::V6 => {
            let without_suffix = reference
                .find('(')
                .map_or(reference, |paren| &reference[..paren]);
            without_suffix.contains('/')
        }
    };
    match is_key {
        true => EdgeTarget::Package(reference.into()),
        false => EdgeTarget::Package(format_key(version, name, reference).into()),
    }
}

/// Joins a relative path onto a workspace path, returning the importer key.
/// The root importer is `.`. Returns `None` if the path escapes the repo.
pub fn resolve_workspace_path(base: &str, relative: &str) -> Option<String> {
    let mut components: Vec<&str> = base
        .split('/')
        .filter(|c| !c.is_empty() && *c != ".")
        .collect();
    for component in relative.split('/') {
        match component {
            "" | "." => (),
            ".." => {
                components.pop()?;
            }
            c => components.push(c),
        }
    }
    match components.is_empty() {
        true => Some(".".into()),
        false => Some(components.join("/")),
    }
}

// See https://github.com/pnpm/pnpm/blob/185ab01adfc927ea23d2db08a14723bf51d0025f/packages/dependency-path/src/index.ts#L96
// A '@' or a '/' is accepted as the separator which lets the same parser
// handle both v5 and v6 keys.
fn parse_dep_path(i: &str) -> IResult<&str, DepPath<'_>> {
    let (i, host) = parse_host(i)?;
    let (i, _) = nom::character::complete::char('/')(i)?;
    let (i, name) = parse_name(i)?;
    let (i, _) = nom::character::complete::one_of("/@")(i)?;
    let (i, version) = parse_version(i)?;
    let (i, peer_suffix) = opt(alt((parse_new_peer_suffix, parse_old_peer_suffix)))(i)?;
    let (_, _) = nom::combinator::eof(i)?;
    Ok((
        "",
        DepPath::new(name, version)
            .with_host(host)
            .with_peer_suffix(peer_suffix),
    ))
}

fn parse_dep_path_v9(input: &str) -> Result<DepPath<'_>, Error> {
    if input.is_empty() {
        return Err(Error::MissingAt(input.to_owned()));
    }
    // skip the first character so scoped packages aren't split on their scope
    let sep_index = input
        .get(1..)
        .and_then(|rest| rest.find('@'))
        .ok_or_else(|| Error::MissingAt(input.to_owned()))?
        + 1;
    if sep_index + 1 >= input.len() {
        return Err(Error::MissingVersion(input.to_owned()));
    }
    let (name, version) = input.split_at(sep_index);
    let version = &version[1..];

    let (version, peer_suffix) = match version.find('(') {
        Some(paren_index) if version.ends_with(')') => {
            let (version, peer_suffix) = version.split_at(paren_index);
            (version, Some(peer_suffix))
        }
        _ => (version, None),
    };

    Ok(DepPath::new(name, version).with_peer_suffix(peer_suffix))
}

fn parse_host(i: &str) -> IResult<&str, Option<&str>> {
    let (i, host) = opt(is_not("/"))(i)?;
    Ok((i, host))
}

fn parse_name(i: &str) -> IResult<&str, &str> {
    let (i, name) = alt((parse_name_with_scope, is_not("/@")))(i)?;
    Ok((i, name))
}

fn parse_name_with_scope(i: &str) -> IResult<&str, &str> {
    let (i, name) = recognize(tuple((tag("@"), is_not("/"), tag("/"), is_not("/@"))))(i)?;
    Ok((i, name))
}

fn parse_version(i: &str) -> IResult<&str, &str> {
    // pre v6 lockfiles use _ to delimit version from metadata
    // v6+ wraps metadata in (
    let (i, version) = is_not("_(")(i)?;
    Ok((i, version))
}

fn parse_old_peer_suffix(i: &str) -> IResult<&str, &str> {
    let (rest, _) = tag("_")(i)?;
    Ok(("", rest))
}

fn parse_new_peer_suffix(i: &str) -> IResult<&str, &str> {
    let (i, suffix) = recognize(parse_v6_suffixes)(i)?;
    Ok((i, suffix))
}

fn parse_v6_suffix(i: &str) -> IResult<&str, &str> {
    let (i, _) = tag("(")(i)?;
    let (i, entry) = is_not(")")(i)?;
    let (i, _) = tag(")")(i)?;
    Ok((i, entry))
}

fn parse_v6_suffixes(i: &str) -> IResult<&str, Vec<&str>> {
    let (i, suffixes) = nom::multi::many1(parse_v6_suffix)(i)?;
    Ok((i, suffixes))
}
