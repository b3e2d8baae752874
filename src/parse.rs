//! Textual manifest to [`DirectoryHierarchy`].
//!
//! The format is line oriented, so the parser classifies one line at a
//! time, tokenises it on unescaped whitespace, and folds the results into
//! the hierarchy while tracking the active `/set` frame and the stack of
//! enclosing directory entries.

use std::ffi::OsString;
use std::fmt::{self, Display};
use std::os::unix::ffi::OsStringExt;

use nom::{
    bytes::complete::is_not,
    character::complete::{space0, space1},
    combinator::all_consuming,
    error::VerboseError,
    multi::separated_list1,
    sequence::delimited,
    IResult,
};

use crate::hierarchy::{DirectoryHierarchy, Entry, EntryKind};
use crate::keywords::{merge_set, KeyVal, Keyword};
use crate::vis::unvis_token;

type Res<T, U> = IResult<T, U, VerboseError<T>>;

/// A manifest syntax error, carrying the offending line.
#[derive(Debug, PartialEq, Eq)]
pub struct ParseError {
    message: String,
    line_number: usize,
    line: String,
}

impl ParseError {
    fn new(message: impl Into<String>, line_number: usize, line: &str) -> Self {
        ParseError {
            message: message.into(),
            line_number,
            line: line.to_owned(),
        }
    }

    pub fn line_number(&self) -> usize {
        self.line_number
    }
}

impl Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Error: {}", self.message)?;
        writeln!(f, "     |")?;
        writeln!(f, "{:4} | {}", self.line_number, self.line)?;
        write!(f, "     |")
    }
}

impl std::error::Error for ParseError {}

/// Parses a manifest from text.
pub fn parse_manifest(text: &str) -> Result<DirectoryHierarchy, ParseError> {
    let mut dh = DirectoryHierarchy::default();
    // Active /set frame, and the stack of enclosing directory entries.
    let mut active: Vec<KeyVal> = Vec::new();
    let mut active_frame: Option<usize> = None;
    let mut dirs: Vec<usize> = Vec::new();

    for (index, line) in text.lines().enumerate() {
        let number = index + 1;
        let pos = dh.entries().len();
        let trimmed = line.trim_matches(|c| c == ' ' || c == '\t');

        if trimmed.is_empty() {
            dh.push(Entry::blank(pos));
            continue;
        }
        if trimmed.starts_with('#') {
            dh.push(Entry::comment(pos, line));
            continue;
        }

        let tokens = tokenize(line).map_err(|e| ParseError::new(e, number, line))?;
        let (first, rest) = tokens.split_first().expect("tokenize yields tokens");

        if let Some(directive) = first.strip_prefix('/') {
            match directive {
                "set" => {
                    let keyvals = parse_keyvals(rest).map_err(|e| ParseError::new(e, number, line))?;
                    active = merge_set(&active, &keyvals);
                    active_frame = Some(dh.push_set_frame(active.clone()));
                    dh.push(Entry::special(pos, *first, keyvals));
                }
                "unset" => {
                    let mut keyvals = Vec::with_capacity(rest.len());
                    for token in rest {
                        let keyword: Keyword = token
                            .parse()
                            .map_err(|e| ParseError::new(format!("{e}"), number, line))?;
                        if *token == "all" {
                            active.clear();
                        } else {
                            active.retain(|kv| *kv.keyword() != keyword);
                        }
                        keyvals.push(KeyVal::bare(keyword));
                    }
                    active_frame = if active.is_empty() {
                        None
                    } else {
                        Some(dh.push_set_frame(active.clone()))
                    };
                    dh.push(Entry::special(pos, *first, keyvals));
                }
                "comment" => {
                    let mut entry = Entry::special(pos, *first, vec![]);
                    entry.raw = line.to_owned();
                    dh.push(entry);
                }
                _ => {
                    return Err(ParseError::new(
                        format!("unknown special directive {first:?}"),
                        number,
                        line,
                    ));
                }
            }
            continue;
        }

        if *first == ".." {
            if dirs.pop().is_none() {
                return Err(ParseError::new("unbalanced \"..\"", number, line));
            }
            dh.push(Entry::dot_dot(pos));
            continue;
        }

        let name = unvis_token(first)
            .map_err(|e| ParseError::new(format!("bad path escape: {e}"), number, line))?;
        let keyvals = parse_keyvals(rest).map_err(|e| ParseError::new(e, number, line))?;

        let kind = if first.contains('/') {
            EntryKind::Full
        } else {
            EntryKind::Relative
        };
        let entry = Entry {
            kind,
            pos,
            raw: String::new(),
            name: OsString::from_vec(name),
            keyvals,
            parent: if kind == EntryKind::Relative {
                dirs.last().copied()
            } else {
                None
            },
            set: active_frame,
        };
        // Relative directory entries become the enclosing directory for the
        // lines that follow; full-path entries never do.
        let makes_dir = kind == EntryKind::Relative && entry.is_dir();
        let index = dh.push(entry);
        if makes_dir {
            dirs.push(index);
        }
    }
    Ok(dh)
}

fn tokenize(line: &str) -> Result<Vec<&str>, String> {
    let result: Res<&str, Vec<&str>> =
        all_consuming(delimited(space0, separated_list1(space1, is_not(" \t")), space0))(line);
    match result {
        Ok((_, tokens)) => Ok(tokens),
        Err(_) => Err("malformed line".to_owned()),
    }
}

fn parse_keyvals(tokens: &[&str]) -> Result<Vec<KeyVal>, String> {
    tokens
        .iter()
        .map(|token| KeyVal::parse(token).map_err(|e| e.to_string()))
        .collect()
}
