//! Diff a manifest against an observed tree.
//!
//! Both sides are flattened to `path -> effective keyvals` maps (honouring
//! `/set` inheritance and dropping `ignore`d subtrees), joined by decoded
//! path, and compared keyword by keyword. The observed side is either a
//! fresh walk of a live root or a tar-derived hierarchy.

use std::collections::BTreeMap;
use std::fmt;
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};

use anyhow::Result;
use serde::Serialize;

use crate::cancel::CancelFlag;
use crate::hierarchy::{DirectoryHierarchy, EntryKind};
use crate::keywords::{find, KeyVal, Keyword};
use crate::vis::vis_token;
use crate::walk::Walker;

/// One property that did not match, or a per-entry I/O problem.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Failure {
    pub path: String,
    pub keyword: String,
    pub expected: String,
    pub got: String,
}

impl Failure {
    pub(crate) fn io(path: &Path, keyword: impl Into<String>, error: impl fmt::Display) -> Self {
        Failure {
            path: display_path(path.as_os_str().as_bytes()),
            keyword: keyword.into(),
            expected: String::new(),
            got: error.to_string(),
        }
    }
}

impl fmt::Display for Failure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:?}: keyword {:?}: expected {}; got {}",
            self.path, self.keyword, self.expected, self.got
        )
    }
}

/// The three disjoint outcomes of a check, plus nothing else: an empty
/// result is a clean tree.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct CheckResult {
    pub failures: Vec<Failure>,
    pub missing: Vec<String>,
    pub extra: Vec<String>,
}

impl CheckResult {
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty() && self.missing.is_empty() && self.extra.is_empty()
    }
}

/// Checks a live tree against a manifest.
///
/// `keywords` restricts what is compared; `None` compares every keyword the
/// manifest uses. Walker I/O failures surface as [`Failure`]s.
pub fn check(
    root: impl AsRef<Path>,
    dh: &DirectoryHierarchy,
    keywords: Option<&[Keyword]>,
    cancel: Option<CancelFlag>,
) -> Result<CheckResult> {
    let used: Vec<Keyword> = match keywords {
        Some(keywords) => keywords.to_vec(),
        None => dh.used_keywords(),
    };
    let walk_keywords: Vec<Keyword> = used.iter().filter(|k| k.is_comparable()).cloned().collect();
    let mut walker = Walker::new(&walk_keywords);
    if let Some(flag) = &cancel {
        walker = walker.with_cancel(flag.clone());
    }
    let observed = walker.walk(root)?;
    let mut result = compare(dh, &observed, keywords, cancel);
    result.failures.extend(walker.failures().iter().cloned());
    Ok(result)
}

/// Checks a tar-derived hierarchy against a manifest.
pub fn tar_check(
    tar_dh: &DirectoryHierarchy,
    dh: &DirectoryHierarchy,
    keywords: Option<&[Keyword]>,
) -> CheckResult {
    compare(dh, tar_dh, keywords, None)
}

/// Compares two hierarchies entry by entry.
pub fn compare(
    expected_dh: &DirectoryHierarchy,
    observed_dh: &DirectoryHierarchy,
    keywords: Option<&[Keyword]>,
    cancel: Option<CancelFlag>,
) -> CheckResult {
    let expected = flatten(expected_dh);
    let observed = flatten(observed_dh);
    let mut result = CheckResult::default();

    for (path, exp) in &expected {
        if cancel.as_ref().is_some_and(CancelFlag::is_cancelled) {
            return result;
        }
        let Some(obs) = observed.get(path) else {
            if find(exp, &Keyword::Optional).is_none() {
                result.missing.push(display_path(path));
            }
            continue;
        };
        let nochange = find(exp, &Keyword::Nochange).is_some();
        for kv in exp {
            let keyword = kv.keyword();
            if !keyword.is_comparable() {
                continue;
            }
            if nochange && *keyword != Keyword::Type {
                continue;
            }
            if let Some(filter) = keywords {
                if !filter_matches(filter, keyword) {
                    continue;
                }
            }
            let observed_kv = find(obs, keyword).or_else(|| {
                time_family_alt(keyword).and_then(|alt| find(obs, &alt))
            });
            match observed_kv {
                Some(observed_kv) => {
                    if !values_match(kv, observed_kv) {
                        result.failures.push(Failure {
                            path: display_path(path),
                            keyword: keyword.name(),
                            expected: kv.value().to_owned(),
                            got: observed_kv.value().to_owned(),
                        });
                    }
                }
                // A recorded attribute that is gone is drift; anything else
                // the observed side simply did not produce is not compared.
                None if matches!(keyword, Keyword::Xattr(_)) => {
                    result.failures.push(Failure {
                        path: display_path(path),
                        keyword: keyword.name(),
                        expected: kv.value().to_owned(),
                        got: "missing".to_owned(),
                    });
                }
                None => (),
            }
        }
    }

    for path in observed.keys() {
        if !expected.contains_key(path) {
            result.extra.push(display_path(path));
        }
    }
    result
}

type FlatMap = BTreeMap<Vec<u8>, Vec<KeyVal>>;

/// Expands a hierarchy into `decoded path -> effective keyvals`, dropping
/// `ignore`d entries and everything beneath them.
fn flatten(dh: &DirectoryHierarchy) -> FlatMap {
    let mut map = FlatMap::new();
    let mut ignored: Vec<PathBuf> = Vec::new();
    for entry in dh.entries() {
        if !matches!(entry.kind, EntryKind::Relative | EntryKind::Full) {
            continue;
        }
        let path = dh.path_of(entry);
        if ignored.iter().any(|prefix| path.starts_with(prefix)) {
            continue;
        }
        let keyvals = dh.effective_keyvals(entry);
        if find(&keyvals, &Keyword::Ignore).is_some() {
            ignored.push(path);
            continue;
        }
        map.insert(path.as_os_str().as_bytes().to_vec(), keyvals);
    }
    map
}

/// Whether the caller's keyword restriction includes this keyword, with
/// `time` and `tar_time` treated as one family.
fn filter_matches(filter: &[Keyword], keyword: &Keyword) -> bool {
    if filter.contains(keyword) {
        return true;
    }
    time_family_alt(keyword).is_some_and(|alt| filter.contains(&alt))
}

fn time_family_alt(keyword: &Keyword) -> Option<Keyword> {
    match keyword {
        Keyword::Time => Some(Keyword::TarTime),
        Keyword::TarTime => Some(Keyword::Time),
        _ => None,
    }
}

/// Value equality with the documented tie-breaks: digests compare as
/// case-insensitive hex, timestamps compare numerically, and a
/// `time`/`tar_time` pairing compares whole seconds only.
fn values_match(expected: &KeyVal, observed: &KeyVal) -> bool {
    let keyword = expected.keyword();
    if keyword.is_digest() {
        return expected.value().eq_ignore_ascii_case(observed.value());
    }
    if matches!(keyword, Keyword::Time | Keyword::TarTime) {
        let truncate = expected.keyword() != observed.keyword()
            || matches!(keyword, Keyword::TarTime);
        return match (parse_stamp(expected.value()), parse_stamp(observed.value())) {
            (Some(a), Some(b)) if truncate => a.0 == b.0,
            (Some(a), Some(b)) => a == b,
            _ => expected.value() == observed.value(),
        };
    }
    expected.value() == observed.value()
}

fn parse_stamp(value: &str) -> Option<(i64, u64)> {
    match value.split_once('.') {
        Some((secs, nanos)) => Some((secs.parse().ok()?, nanos.parse().ok()?)),
        None => Some((value.parse().ok()?, 0)),
    }
}

fn display_path(bytes: &[u8]) -> String {
    vis_token(bytes)
}

#[cfg(test)]
mod tests {
    use indoc::indoc;

    use super::*;
    use crate::parse::parse_manifest;

    fn result(expected: &str, observed: &str) -> CheckResult {
        let expected = parse_manifest(expected).unwrap();
        let observed = parse_manifest(observed).unwrap();
        compare(&expected, &observed, None, None)
    }

    #[test]
    fn identical_manifests_are_clean() {
        let text = indoc! {"
            /set uid=0 gid=0
            . type=dir mode=0755
                a type=file size=5 mode=0644
        "};
        assert!(result(text, text).is_clean());
    }

    #[test]
    fn a_changed_value_is_a_failure() {
        let expected = indoc! {"
            . type=dir
                a type=file mode=0644
        "};
        let observed = indoc! {"
            . type=dir
                a type=file mode=0600
        "};
        let result = result(expected, observed);
        assert_eq!(result.failures.len(), 1);
        assert_eq!(result.failures[0].keyword, "mode");
        assert_eq!(result.failures[0].expected, "0644");
        assert_eq!(result.failures[0].got, "0600");
        assert!(result.missing.is_empty() && result.extra.is_empty());
    }

    #[test]
    fn set_inheritance_feeds_the_comparison() {
        let expected = indoc! {"
            /set mode=0644
            . type=dir
                a type=file
        "};
        let observed = indoc! {"
            . type=dir
                a type=file mode=0600
        "};
        let result = result(expected, observed);
        assert_eq!(result.failures.len(), 1);
        assert_eq!(result.failures[0].keyword, "mode");
    }

    #[test]
    fn missing_and_extra_are_disjoint() {
        let expected = indoc! {"
            . type=dir
                a type=file
                b type=file
        "};
        let observed = indoc! {"
            . type=dir
                b type=file
                c type=file
        "};
        let result = result(expected, observed);
        assert!(result.failures.is_empty());
        assert_eq!(result.missing, vec!["a"]);
        assert_eq!(result.extra, vec!["c"]);
    }

    #[test]
    fn optional_suppresses_missing_but_not_failures() {
        let expected = indoc! {"
            . type=dir
                a type=file optional
                b type=file mode=0644 optional
        "};
        let observed = indoc! {"
            . type=dir
                b type=file mode=0600
        "};
        let result = result(expected, observed);
        assert!(result.missing.is_empty());
        assert_eq!(result.failures.len(), 1);
        assert_eq!(result.failures[0].keyword, "mode");
    }

    #[test]
    fn nochange_suppresses_all_but_type() {
        let expected = indoc! {"
            . type=dir
                a type=file mode=0644 nochange
                b type=dir nochange
        "};
        let observed = indoc! {"
            . type=dir
                a type=file mode=0600
                b type=file
        "};
        let result = result(expected, observed);
        assert_eq!(result.failures.len(), 1);
        assert_eq!(result.failures[0].path, "b");
        assert_eq!(result.failures[0].keyword, "type");
    }

    #[test]
    fn ignore_drops_the_subtree() {
        let expected = indoc! {"
            . type=dir
            cache type=dir ignore
                junk type=file
            ..
                a type=file
        "};
        let observed = indoc! {"
            . type=dir
                a type=file
        "};
        assert!(result(expected, observed).is_clean());
    }

    #[test]
    fn digests_compare_case_insensitively() {
        let expected = ". type=dir\n    a type=file md5digest=D41D8CD98F00B204E9800998ECF8427E\n";
        let observed = ". type=dir\n    a type=file md5=d41d8cd98f00b204e9800998ecf8427e\n";
        assert!(result(expected, observed).is_clean());
    }

    #[test]
    fn tar_time_pairs_with_time_on_whole_seconds() {
        let expected = ". type=dir\n    a type=file time=1459787154.119825690\n";
        let observed = ". type=dir\n    a type=file tar_time=1459787154.000000000\n";
        assert!(result(expected, observed).is_clean());

        let observed = ". type=dir\n    a type=file tar_time=1459787155.000000000\n";
        assert_eq!(result(expected, observed).failures.len(), 1);
    }

    #[test]
    fn exact_time_comparison_needs_matching_nanoseconds() {
        let expected = ". type=dir\n    a type=file time=1.000000001\n";
        let observed = ". type=dir\n    a type=file time=1.000000002\n";
        assert_eq!(result(expected, observed).failures.len(), 1);
    }

    #[test]
    fn keyword_restriction_limits_the_comparison() {
        let expected = ". type=dir\n    a type=file mode=0644 uid=0\n";
        let observed = ". type=dir\n    a type=file mode=0600 uid=1\n";
        let expected = parse_manifest(expected).unwrap();
        let observed = parse_manifest(observed).unwrap();
        let result = compare(&expected, &observed, Some(&[Keyword::Uid]), None);
        assert_eq!(result.failures.len(), 1);
        assert_eq!(result.failures[0].keyword, "uid");
    }

    #[test]
    fn lost_xattrs_are_reported() {
        let expected = ". type=dir\n    a type=file xattr.user.note=YWJj\n";
        let observed = ". type=dir\n    a type=file\n";
        let result = result(expected, observed);
        assert_eq!(result.failures.len(), 1);
        assert_eq!(result.failures[0].keyword, "xattr.user.note");
        assert_eq!(result.failures[0].got, "missing");
    }

    #[test]
    fn cancelled_compare_returns_partial_result() {
        let flag = CancelFlag::new();
        flag.cancel();
        let expected = parse_manifest(". type=dir\n    a type=file\n").unwrap();
        let observed = parse_manifest(". type=dir\n").unwrap();
        let result = compare(&expected, &observed, None, Some(flag));
        assert!(result.missing.is_empty());
    }
}
