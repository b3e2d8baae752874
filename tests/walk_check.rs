//! End-to-end walk, check and update scenarios on real temporary trees.

use std::fs;
use std::path::Path;
use std::time::{Duration, SystemTime};

use tempfile::tempdir;
use treespec::keywords::{DEFAULT_KEYWORDS, DEFAULT_UPDATE_KEYWORDS};
use treespec::{check, parse_manifest, update, walk, CancelFlag, Keyword, Walker};

fn small_tree(root: &Path) {
    fs::write(root.join("a"), "hello").unwrap();
    fs::create_dir(root.join("b")).unwrap();
    fs::write(root.join("b").join("c"), "world").unwrap();
}

/// Keywords that stay stable when a directory's contents change.
const STRUCTURAL: [Keyword; 3] = [Keyword::Type, Keyword::Size, Keyword::Mode];

#[test]
fn walked_manifest_round_trips_and_checks_clean() {
    let dir = tempdir().unwrap();
    small_tree(dir.path());

    let dh = walk::walk(dir.path(), &DEFAULT_KEYWORDS).unwrap();
    let reparsed = parse_manifest(&dh.to_text()).unwrap();
    assert_eq!(dh, reparsed);

    let result = check::check(dir.path(), &reparsed, None, None).unwrap();
    assert!(result.is_clean(), "unexpected drift: {result:?}");
}

#[test]
fn content_keywords_check_clean_against_themselves() {
    let dir = tempdir().unwrap();
    small_tree(dir.path());

    let mut keywords = DEFAULT_KEYWORDS.to_vec();
    keywords.extend([Keyword::Sha1, Keyword::Sha256, Keyword::Cksum, Keyword::Md5]);
    let dh = walk::walk(dir.path(), &keywords).unwrap();
    let result = check::check(dir.path(), &dh, None, None).unwrap();
    assert!(result.is_clean(), "unexpected drift: {result:?}");
}

#[test]
fn touched_mtime_is_reported_and_update_restores_it() {
    let dir = tempdir().unwrap();
    let file = dir.path().join("tmpfile");
    fs::write(&file, "I know half of you half as well as I ought to").unwrap();

    let mut keywords = DEFAULT_KEYWORDS.to_vec();
    keywords.push(Keyword::Sha1);
    let dh = walk::walk(dir.path(), &keywords).unwrap();

    // Touch the file so only its mtime drifts.
    let handle = fs::File::options().write(true).open(&file).unwrap();
    handle
        .set_modified(SystemTime::UNIX_EPOCH + Duration::from_secs(1_000_000_000))
        .unwrap();
    drop(handle);

    let result = check::check(dir.path(), &dh, None, None).unwrap();
    assert!(!result.failures.is_empty(), "expected an mtime failure");
    assert!(result.failures.iter().all(|f| f.keyword == "time"));

    let result = update(dir.path(), &dh, &DEFAULT_UPDATE_KEYWORDS, None).unwrap();
    assert!(result.failures.is_empty(), "update failed: {result:?}");

    let result = check::check(dir.path(), &dh, None, None).unwrap();
    assert!(result.is_clean(), "still drifting: {result:?}");
}

#[test]
fn update_is_idempotent() {
    let dir = tempdir().unwrap();
    small_tree(dir.path());
    let dh = walk::walk(dir.path(), &DEFAULT_KEYWORDS).unwrap();

    let first = update(dir.path(), &dh, &DEFAULT_UPDATE_KEYWORDS, None).unwrap();
    let second = update(dir.path(), &dh, &DEFAULT_UPDATE_KEYWORDS, None).unwrap();
    assert!(first.failures.is_empty());
    assert_eq!(first, second);
    let result = check::check(dir.path(), &dh, None, None).unwrap();
    assert!(result.is_clean(), "unexpected drift: {result:?}");
}

#[test]
fn removed_file_is_missing() {
    let dir = tempdir().unwrap();
    small_tree(dir.path());
    let dh = walk::walk(dir.path(), &STRUCTURAL).unwrap();

    fs::remove_file(dir.path().join("b").join("c")).unwrap();

    let result = check::check(dir.path(), &dh, None, None).unwrap();
    assert_eq!(result.missing, vec!["b/c"]);
    assert!(result.failures.is_empty(), "failures: {:?}", result.failures);
    assert!(result.extra.is_empty());
}

#[test]
fn unexpected_file_is_extra() {
    let dir = tempdir().unwrap();
    small_tree(dir.path());
    let dh = walk::walk(dir.path(), &STRUCTURAL).unwrap();

    fs::write(dir.path().join("b").join("d"), "surprise").unwrap();

    let result = check::check(dir.path(), &dh, None, None).unwrap();
    assert_eq!(result.extra, vec!["b/d"]);
    assert!(result.failures.is_empty(), "failures: {:?}", result.failures);
    assert!(result.missing.is_empty());
}

#[test]
fn symlinks_record_their_target_and_skip_content() {
    let dir = tempdir().unwrap();
    fs::write(dir.path().join("target"), "data").unwrap();
    std::os::unix::fs::symlink("target", dir.path().join("ln")).unwrap();

    let mut keywords = DEFAULT_KEYWORDS.to_vec();
    keywords.push(Keyword::Sha256);
    let dh = walk::walk(dir.path(), &keywords).unwrap();

    let link = dh.entries().iter().find(|e| e.name == "ln").unwrap();
    let keyvals = dh.effective_keyvals(link);
    assert!(keyvals
        .iter()
        .any(|kv| *kv.keyword() == Keyword::Link && kv.value() == "target"));
    assert!(keyvals
        .iter()
        .any(|kv| *kv.keyword() == Keyword::Type && kv.value() == "link"));
    // No digest for the symlink itself.
    assert!(!keyvals.iter().any(|kv| *kv.keyword() == Keyword::Sha256));

    let result = check::check(dir.path(), &dh, None, None).unwrap();
    assert!(result.is_clean(), "unexpected drift: {result:?}");
}

#[test]
fn escaped_names_survive_walk_and_check() {
    let dir = tempdir().unwrap();
    fs::write(dir.path().join("with space"), "x").unwrap();
    fs::write(dir.path().join("glob*name"), "y").unwrap();

    let dh = walk::walk(dir.path(), &STRUCTURAL).unwrap();
    let text = dh.to_text();
    assert!(text.contains("with\\040space"));
    assert!(text.contains("glob\\052name"));

    let reparsed = parse_manifest(&text).unwrap();
    let result = check::check(dir.path(), &reparsed, None, None).unwrap();
    assert!(result.is_clean(), "unexpected drift: {result:?}");
}

#[test]
fn exclusion_filters_drop_subtrees() {
    let dir = tempdir().unwrap();
    small_tree(dir.path());
    fs::create_dir(dir.path().join("skipme")).unwrap();
    fs::write(dir.path().join("skipme").join("inner"), "z").unwrap();

    let mut walker = Walker::new(&STRUCTURAL).exclude(Box::new(|path, _| {
        path.file_name()
            .map(|name| name.to_string_lossy().starts_with("skip"))
            .unwrap_or(false)
    }));
    let dh = walker.walk(dir.path()).unwrap();
    assert!(walker.failures().is_empty());
    assert!(!dh.entries().iter().any(|e| e.name == "skipme"));
    assert!(!dh.entries().iter().any(|e| e.name == "inner"));
}

#[test]
fn cancelled_walk_returns_a_partial_hierarchy() {
    let dir = tempdir().unwrap();
    small_tree(dir.path());

    let flag = CancelFlag::new();
    flag.cancel();
    let mut walker = Walker::new(&STRUCTURAL).with_cancel(flag);
    let dh = walker.walk(dir.path()).unwrap();
    assert!(dh.entries().is_empty());
}

#[test]
fn xattrs_round_trip_when_the_filesystem_supports_them() {
    let dir = tempdir().unwrap();
    let file = dir.path().join("tagged");
    fs::write(&file, "x").unwrap();
    // "aGk=" is base64("hi"); some filesystems refuse user xattrs entirely.
    let attr = Keyword::Xattr("user.note".into());
    if treespec::keywords::update::update(&attr, &file, "aGk=").is_err() {
        return;
    }

    let mut keywords = STRUCTURAL.to_vec();
    keywords.push(Keyword::Xattr(String::new()));
    let dh = walk::walk(dir.path(), &keywords).unwrap();
    let entry = dh.entries().iter().find(|e| e.name == "tagged").unwrap();
    let keyvals = dh.effective_keyvals(entry);
    assert!(keyvals
        .iter()
        .any(|kv| *kv.keyword() == Keyword::Xattr("user.note".into()) && kv.value() == "aGk="));

    let result = check::check(dir.path(), &dh, None, None).unwrap();
    assert!(result.is_clean(), "unexpected drift: {result:?}");
}
