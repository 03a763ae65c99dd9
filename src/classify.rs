// src/classify.rs

//! Dependency origin classification
//!
//! Each driver hands the raw locator it found in a lockfile to one of the
//! functions here and gets back exactly one [`Origin`]:
//!
//! | Locator | Rule |
//! |---------|------|
//! | VCS | the ref must be a full 40-hex commit id |
//! | direct URL | exactly one digest candidate (explicit or `#hash=` / `#<algo>=` fragment) |
//! | local path | inside the source tree, or allow-listed; never absolute |
//! | registry | no extra checks |

use std::path::Path;
use url::Url;

use crate::error::{Error, Result};
use crate::hash::{Hash, HashAlgorithm};
use crate::model::Origin;
use crate::paths::lexical_join;
use crate::scm::is_full_commit;

/// A direct URL with its fragment qualifiers split off
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UrlLocator {
    /// URL without the fragment
    pub url: String,
    /// Digests carried in the fragment
    pub hashes: Vec<Hash>,
    /// `#egg=<name>`
    pub egg: Option<String>,
}

/// Split `#hash=algo:hex`, `#<algo>=hex` and `#egg=name` qualifiers off a URL
pub fn parse_url_locator(raw: &str) -> Result<UrlLocator> {
    let mut parsed = Url::parse(raw)
        .map_err(|e| Error::ValidationError(format!("Invalid URL {raw}: {e}")))?;
    let fragment = parsed.fragment().map(str::to_string);
    parsed.set_fragment(None);

    let mut hashes = Vec::new();
    let mut egg = None;
    if let Some(fragment) = fragment {
        for qualifier in fragment.split('&').filter(|q| !q.is_empty()) {
            let (key, value) = qualifier.split_once('=').ok_or_else(|| {
                Error::ValidationError(format!("Malformed URL qualifier {qualifier} in {raw}"))
            })?;
            match key {
                "hash" => hashes.push(Hash::parse_prefixed(value)?),
                "egg" => egg = Some(value.to_string()),
                other => {
                    if let Ok(algorithm) = other.parse::<HashAlgorithm>() {
                        hashes.push(Hash::new(algorithm, value)?);
                    }
                }
            }
        }
    }

    Ok(UrlLocator {
        url: parsed.to_string(),
        hashes,
        egg,
    })
}

/// Classify a VCS dependency
pub fn classify_vcs(name: &str, url: &str, reference: &str) -> Result<Origin> {
    if !is_full_commit(reference) {
        return Err(Error::ValidationError(format!(
            "The dependency {name} uses the git reference {reference:?}, which is not a full \
             commit id; symbolic and abbreviated references are not reproducible"
        )));
    }
    Ok(Origin::Vcs {
        url: url.to_string(),
        commit: reference.to_lowercase(),
    })
}

/// Classify a direct-URL dependency
///
/// Candidates are the union of `explicit` and the URL's own fragment digests;
/// exactly one distinct candidate is required.
pub fn classify_url(name: &str, raw_url: &str, explicit: &[Hash]) -> Result<Origin> {
    let locator = parse_url_locator(raw_url)?;
    match locator.url.split(':').next() {
        Some("http") | Some("https") => {}
        _ => {
            return Err(Error::UnsupportedFeature(format!(
                "The dependency {name} uses an unsupported URL scheme: {raw_url}"
            )));
        }
    }

    let mut candidates: Vec<Hash> = explicit.to_vec();
    for hash in locator.hashes {
        if !candidates.contains(&hash) {
            candidates.push(hash);
        }
    }

    match candidates.len() {
        1 => Ok(Origin::Url {
            url: locator.url,
            hash: candidates.remove(0),
        }),
        0 => Err(Error::ValidationError(format!(
            "The URL dependency {name} must specify exactly one hash \
             (for example {raw_url}#hash=sha256:<digest>)"
        ))),
        n => Err(Error::ValidationError(format!(
            "The URL dependency {name} specifies {n} hashes; exactly one is required"
        ))),
    }
}

/// Classify a local-path dependency declared by the package at `package_dir`
pub fn classify_local(
    name: &str,
    raw_path: &str,
    package_dir: &Path,
    source_root: &Path,
    allowlisted: bool,
) -> Result<Origin> {
    let path = Path::new(raw_path);
    if path.is_absolute() {
        return Err(Error::UnsupportedFeature(format!(
            "The dependency {name} points at the absolute path {raw_path}"
        )));
    }

    let resolved = lexical_join(package_dir, path).ok_or_else(|| {
        Error::ValidationError(format!("The dependency {name} has an invalid path {raw_path}"))
    })?;

    if resolved.starts_with(source_root) || allowlisted {
        Ok(Origin::LocalPath {
            path: raw_path.to_string(),
        })
    } else {
        Err(Error::ValidationError(format!(
            "The dependency {name} at {raw_path} is outside the source tree and not allow-listed"
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hash::hash_bytes;

    fn digest() -> Hash {
        hash_bytes(HashAlgorithm::Sha256, b"bar")
    }

    #[test]
    fn test_vcs_requires_full_commit() {
        let sha = "0123456789abcdef0123456789abcdef01234567";
        let origin = classify_vcs("lib", "https://github.com/a/lib.git", sha).unwrap();
        assert!(matches!(origin, Origin::Vcs { ref commit, .. } if commit == sha));

        assert!(classify_vcs("lib", "https://github.com/a/lib.git", "main").is_err());
        assert!(classify_vcs("lib", "https://github.com/a/lib.git", "0123456").is_err());
    }

    #[test]
    fn test_url_with_fragment_hash() {
        let raw = format!("https://example.org/bar.tar.gz#hash={}", digest().to_prefixed_string());
        let origin = classify_url("bar", &raw, &[]).unwrap();
        match origin {
            Origin::Url { url, hash } => {
                assert_eq!(url, "https://example.org/bar.tar.gz");
                assert_eq!(hash, digest());
            }
            other => panic!("unexpected origin {other:?}"),
        }
    }

    #[test]
    fn test_url_with_algo_fragment_and_egg() {
        let raw = format!("https://example.org/bar.zip#egg=bar&sha256={}", digest().value);
        let locator = parse_url_locator(&raw).unwrap();
        assert_eq!(locator.egg.as_deref(), Some("bar"));
        assert_eq!(locator.hashes, vec![digest()]);
    }

    #[test]
    fn test_url_hash_count() {
        let url = "https://example.org/bar.tar.gz";
        assert!(classify_url("bar", url, &[]).is_err());
        assert!(classify_url("bar", url, &[digest()]).is_ok());

        let other = hash_bytes(HashAlgorithm::Sha256, b"other");
        assert!(classify_url("bar", url, &[digest(), other]).is_err());

        // the same digest given twice is still one candidate
        let raw = format!("{url}#hash={}", digest().to_prefixed_string());
        assert!(classify_url("bar", &raw, &[digest()]).is_ok());
    }

    #[test]
    fn test_url_scheme() {
        let err = classify_url("bar", "ftp://example.org/bar.tar.gz", &[digest()]).unwrap_err();
        assert!(matches!(err, Error::UnsupportedFeature(_)));
    }

    #[test]
    fn test_local_paths() {
        let root = Path::new("/bundle/app");
        let pkg = Path::new("/bundle/app/web");

        assert!(classify_local("lib", "../lib", pkg, root, false).is_ok());
        assert!(classify_local("lib", "../../elsewhere", pkg, root, false).is_err());
        assert!(classify_local("lib", "../../elsewhere", pkg, root, true).is_ok());
        assert!(classify_local("lib", "/opt/lib", pkg, root, true).is_err());
    }
}
