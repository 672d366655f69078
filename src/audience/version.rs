//! Version comparison for `semver_*` match types.
//!
//! Targets may be partial (`"2"`, `"2.1"`): only as many components as the target specifies are
//! compared, so `"2.1.5"` equals target `"2.1"`. Complete versions on both sides use semver
//! precedence rules.
use std::{cmp::Ordering, sync::OnceLock};

use regex::Regex;
use semver::{BuildMetadata, Version};

fn version_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^(\d+)(\.\d+){0,2}(-[0-9A-Za-z.\-]+)?(\+[0-9A-Za-z.\-]+)?$")
            .expect("version regex should compile")
    })
}

/// A version split into numeric release components and an optional pre-release/build suffix.
#[derive(Debug, PartialEq, Eq)]
struct VersionParts<'a> {
    release: Vec<u64>,
    pre_release: Option<&'a str>,
    build: Option<&'a str>,
}

impl<'a> VersionParts<'a> {
    fn parse(version: &'a str) -> Option<VersionParts<'a>> {
        if !version_regex().is_match(version) {
            return None;
        }

        let (rest, build) = match version.split_once('+') {
            Some((rest, build)) => (rest, Some(build)),
            None => (version, None),
        };
        let (release, pre_release) = match rest.split_once('-') {
            Some((release, pre)) => (release, Some(pre)),
            None => (rest, None),
        };

        let release = release
            .split('.')
            .map(|it| it.parse().ok())
            .collect::<Option<Vec<u64>>>()?;

        Some(VersionParts {
            release,
            pre_release,
            build,
        })
    }

    fn suffix(&self) -> Option<&'a str> {
        self.pre_release.or(self.build)
    }
}

/// Compare `user_version` against `target_version`.
///
/// Returns `None` if either version is malformed.
pub(crate) fn compare_versions(target_version: &str, user_version: &str) -> Option<Ordering> {
    let target = VersionParts::parse(target_version)?;
    let user = VersionParts::parse(user_version)?;

    if target.release.len() == 3 && user.release.len() == 3 {
        return Some(compare_complete(target_version, user_version));
    }

    for (idx, target_part) in target.release.iter().enumerate() {
        let Some(user_part) = user.release.get(idx) else {
            // User version is shorter than the target.
            return Some(if target.suffix().is_some() {
                Ordering::Greater
            } else {
                Ordering::Less
            });
        };
        match user_part.cmp(target_part) {
            Ordering::Equal => {}
            other => return Some(other),
        }
    }

    if target.release.len() == user.release.len() {
        match (user.suffix(), target.suffix()) {
            (Some(u), Some(t)) => return Some(u.cmp(t)),
            (Some(_), None) if user.pre_release.is_some() => return Some(Ordering::Less),
            _ => {}
        }
    }

    Some(Ordering::Equal)
}

fn compare_complete(target_version: &str, user_version: &str) -> Ordering {
    // Both inputs passed the regex with three release components, so they are valid semver.
    let parse = |v: &str| {
        Version::parse(v).map(|mut v| {
            v.build = BuildMetadata::EMPTY;
            v
        })
    };
    match (parse(user_version), parse(target_version)) {
        (Ok(user), Ok(target)) => user.cmp(&target),
        _ => Ordering::Equal,
    }
}

#[cfg(test)]
mod tests {
    use std::cmp::Ordering;

    use super::compare_versions;

    #[test]
    fn equal_versions() {
        assert_eq!(compare_versions("2.0.0", "2.0.0"), Some(Ordering::Equal));
        assert_eq!(compare_versions("2.0", "2.0.1"), Some(Ordering::Equal));
        assert_eq!(compare_versions("2", "2.9.1"), Some(Ordering::Equal));
        assert_eq!(compare_versions("2.0.0", "2.0.0+build"), Some(Ordering::Equal));
    }

    #[test]
    fn ordered_versions() {
        assert_eq!(compare_versions("2.0.0", "2.0.1"), Some(Ordering::Greater));
        assert_eq!(compare_versions("2.0.1", "2.0.0"), Some(Ordering::Less));
        assert_eq!(compare_versions("1.10.0", "1.2.0"), Some(Ordering::Less));
        assert_eq!(compare_versions("2.1", "2.0.9"), Some(Ordering::Less));
        assert_eq!(compare_versions("2.1", "3"), Some(Ordering::Greater));
    }

    #[test]
    fn pre_release_is_lower() {
        assert_eq!(compare_versions("2.0.0", "2.0.0-beta"), Some(Ordering::Less));
        assert_eq!(
            compare_versions("2.0.0-beta", "2.0.0-alpha"),
            Some(Ordering::Less)
        );
        assert_eq!(compare_versions("2.0.0-beta", "2.0.0"), Some(Ordering::Greater));
    }

    #[test]
    fn shorter_user_version() {
        assert_eq!(compare_versions("2.0.1", "2.0"), Some(Ordering::Less));
    }

    #[test]
    fn malformed_versions() {
        assert_eq!(compare_versions("2.0.0", "2 .0"), None);
        assert_eq!(compare_versions("2.0.0.1", "2.0.0"), None);
        assert_eq!(compare_versions("2.0.0", "a.b.c"), None);
        assert_eq!(compare_versions("", "1.0.0"), None);
    }
}
