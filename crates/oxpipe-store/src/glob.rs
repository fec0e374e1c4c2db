//! Glob resolution relative to a base directory.
//!
//! Patterns follow the usual file-system glob dialect:
//!
//! | token    | matches                                         |
//! |----------|-------------------------------------------------|
//! | `*`      | any run of characters within one path segment  |
//! | `**`     | any run of characters, crossing segments        |
//! | `?`      | exactly one character within a segment          |
//! | `[a-z]`  | one character from the class (`[!..]` negates)  |
//! | `{a,b}`  | either alternative                              |
//! | `\x`     | the literal character `x`                       |
//!
//! Matching is done against the path relative to the base directory, with
//! `/` as separator, so `*.xml` only matches direct children and `**/*.xml`
//! only matches files at least one directory down.

use std::path::{Path, PathBuf};

use regex::Regex;
use tracing::{debug, warn};
use walkdir::WalkDir;

use crate::{Result, StoreError};

/// Whether `value` contains any glob metacharacter (`* [ ] { } ? !`).
pub fn is_glob_pattern(value: &str) -> bool {
    value
        .chars()
        .any(|c| matches!(c, '*' | '[' | ']' | '{' | '}' | '?' | '!'))
}

/// Normalize separators in a pattern to the `/` the matcher expects.
///
/// On hosts whose separator is `\` the backslash cannot double as an
/// escape character, so it is rewritten. Elsewhere the pattern is returned
/// unchanged.
pub fn normalize_pattern(pattern: &str) -> String {
    if std::path::MAIN_SEPARATOR == '\\' {
        pattern.replace('\\', "/")
    } else {
        pattern.to_string()
    }
}

/// A compiled glob pattern.
#[derive(Debug, Clone)]
pub struct GlobPattern {
    source: String,
    regex: Regex,
}

impl GlobPattern {
    /// Compile a glob pattern.
    pub fn new(pattern: &str) -> Result<Self> {
        let translated = translate(pattern)?;
        let regex = Regex::new(&translated).map_err(|e| StoreError::InvalidPattern {
            pattern: pattern.to_string(),
            reason: e.to_string(),
        })?;
        Ok(Self {
            source: pattern.to_string(),
            regex,
        })
    }

    /// The pattern as written.
    pub fn as_str(&self) -> &str {
        &self.source
    }

    /// Match a `/`-separated relative path.
    pub fn matches(&self, relative: &str) -> bool {
        self.regex.is_match(relative)
    }

    /// Match a relative path, normalizing host separators first.
    pub fn matches_path(&self, relative: &Path) -> bool {
        self.matches(&crate::slash_path(relative))
    }
}

/// Find every file under `base` whose base-relative path matches `pattern`.
///
/// Directories are never returned. Results come back as absolute paths in
/// traversal order. Unreadable entries are logged and skipped.
pub fn find_files(pattern: &str, base: &Path) -> Result<Vec<PathBuf>> {
    let glob = GlobPattern::new(&normalize_pattern(pattern))?;
    let mut found = Vec::new();

    for entry in WalkDir::new(base).min_depth(1) {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                warn!(base = %base.display(), error = %e, "Skipping unreadable entry");
                continue;
            }
        };
        if !entry.file_type().is_file() {
            continue;
        }
        let Ok(relative) = entry.path().strip_prefix(base) else {
            continue;
        };
        if glob.matches_path(relative) {
            let absolute = std::path::absolute(entry.path())
                .map_err(|e| StoreError::io(entry.path(), e))?;
            found.push(absolute);
        }
    }

    debug!(pattern, base = %base.display(), matches = found.len(), "Resolved glob");
    Ok(found)
}

fn invalid(pattern: &str, reason: &str) -> StoreError {
    StoreError::InvalidPattern {
        pattern: pattern.to_string(),
        reason: reason.to_string(),
    }
}

/// Translate a glob into an anchored regular expression.
fn translate(pattern: &str) -> Result<String> {
    let chars: Vec<char> = pattern.chars().collect();
    let mut out = String::with_capacity(pattern.len() * 2);
    out.push('^');

    let mut in_group = false;
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        match c {
            '\\' => {
                let Some(&next) = chars.get(i + 1) else {
                    return Err(invalid(pattern, "dangling escape"));
                };
                out.push_str(&regex::escape(&next.to_string()));
                i += 1;
            }
            '*' => {
                if chars.get(i + 1) == Some(&'*') {
                    out.push_str(".*");
                    i += 1;
                } else {
                    out.push_str("[^/]*");
                }
            }
            '?' => out.push_str("[^/]"),
            '[' => {
                i = translate_class(pattern, &chars, i, &mut out)?;
            }
            '{' => {
                if in_group {
                    return Err(invalid(pattern, "nested groups are not supported"));
                }
                out.push_str("(?:");
                in_group = true;
            }
            '}' if in_group => {
                out.push(')');
                in_group = false;
            }
            ',' if in_group => out.push('|'),
            _ => out.push_str(&regex::escape(&c.to_string())),
        }
        i += 1;
    }

    if in_group {
        return Err(invalid(pattern, "missing '}'"));
    }
    out.push('$');
    Ok(out)
}

/// Translate a bracket expression starting at `start` (the `[`).
///
/// Returns the index of the closing `]`.
fn translate_class(pattern: &str, chars: &[char], start: usize, out: &mut String) -> Result<usize> {
    let mut i = start + 1;
    let negated = matches!(chars.get(i), Some('!') | Some('^'));
    if negated {
        i += 1;
    }

    out.push_str(if negated { "[[^/]&&[^" } else { "[[^/]&&[" });

    let mut first = true;
    while i < chars.len() {
        let c = chars[i];
        match c {
            ']' if !first => {
                out.push_str("]]");
                return Ok(i);
            }
            '/' => return Err(invalid(pattern, "explicit '/' in character class")),
            '-' if !first && chars.get(i + 1).is_some_and(|n| *n != ']') => out.push('-'),
            '\\' => {
                let Some(&next) = chars.get(i + 1) else {
                    return Err(invalid(pattern, "dangling escape"));
                };
                out.push_str(&regex::escape(&next.to_string()));
                i += 1;
            }
            _ => push_class_literal(out, c),
        }
        first = false;
        i += 1;
    }

    Err(invalid(pattern, "missing ']'"))
}

fn push_class_literal(out: &mut String, c: char) {
    if matches!(c, '[' | ']' | '&' | '~' | '-' | '^' | '\\') {
        out.push('\\');
    }
    out.push(c);
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn matches(pattern: &str, path: &str) -> bool {
        GlobPattern::new(pattern).unwrap().matches(path)
    }

    #[test]
    fn test_is_glob_pattern() {
        assert!(is_glob_pattern("*.xml"));
        assert!(is_glob_pattern("a/[bc].txt"));
        assert!(is_glob_pattern("{a,b}"));
        assert!(is_glob_pattern("file?.txt"));
        assert!(is_glob_pattern("!x"));
        assert!(!is_glob_pattern("plain/file.xml"));
        assert!(!is_glob_pattern(""));
    }

    #[test]
    fn test_star_stays_in_segment() {
        assert!(matches("*.java", "A.java"));
        assert!(!matches("*.java", "src/A.java"));
    }

    #[test]
    fn test_double_star_crosses_segments() {
        assert!(matches("**/*.java", "src/A.java"));
        assert!(matches("**/*.java", "src/main/A.java"));
        assert!(!matches("**/*.java", "A.java"));
        assert!(matches("**.java", "A.java"));
        assert!(matches("**.java", "src/main/A.java"));
    }

    #[test]
    fn test_question_mark() {
        assert!(matches("file?.txt", "file1.txt"));
        assert!(!matches("file?.txt", "file10.txt"));
        assert!(!matches("a?b", "a/b"));
    }

    #[test]
    fn test_character_classes() {
        assert!(matches("[abc].txt", "b.txt"));
        assert!(!matches("[abc].txt", "d.txt"));
        assert!(matches("[a-c].txt", "c.txt"));
        assert!(matches("[!a-c].txt", "d.txt"));
        assert!(!matches("[!a-c].txt", "a.txt"));
        assert!(matches("[-x].txt", "-.txt"));
    }

    #[test]
    fn test_alternation() {
        assert!(matches("*.{xml,psml}", "doc.xml"));
        assert!(matches("*.{xml,psml}", "doc.psml"));
        assert!(!matches("*.{xml,psml}", "doc.txt"));
    }

    #[test]
    fn test_literal_dots_and_escapes() {
        assert!(!matches("a.txt", "abtxt"));
        assert!(matches("a\\*.txt", "a*.txt"));
        assert!(!matches("a\\*.txt", "ab.txt"));
    }

    #[test]
    fn test_invalid_patterns() {
        assert!(GlobPattern::new("[abc").is_err());
        assert!(GlobPattern::new("{a,b").is_err());
        assert!(GlobPattern::new("{a,{b}}").is_err());
        assert!(GlobPattern::new("[a/b]").is_err());
        assert!(GlobPattern::new("abc\\").is_err());
    }

    #[test]
    fn test_find_files_returns_files_only() {
        let tmp = TempDir::new().unwrap();
        let base = tmp.path();
        std::fs::create_dir_all(base.join("src/main")).unwrap();
        std::fs::create_dir_all(base.join("dir.java")).unwrap();
        std::fs::write(base.join("A.java"), "").unwrap();
        std::fs::write(base.join("src/B.java"), "").unwrap();
        std::fs::write(base.join("src/main/C.java"), "").unwrap();
        std::fs::write(base.join("src/notes.txt"), "").unwrap();

        let names = |pattern: &str| {
            let mut names: Vec<String> = find_files(pattern, base)
                .unwrap()
                .into_iter()
                .map(|p| p.file_name().unwrap().to_string_lossy().into_owned())
                .collect();
            names.sort();
            names
        };

        assert_eq!(names("*.java"), vec!["A.java"]);
        assert_eq!(names("**/*.java"), vec!["B.java", "C.java"]);
        assert_eq!(names("**.java"), vec!["A.java", "B.java", "C.java"]);
        assert!(names("*.pdf").is_empty());
    }

    #[test]
    fn test_find_files_absolute() {
        let tmp = TempDir::new().unwrap();
        std::fs::write(tmp.path().join("x.xml"), "").unwrap();
        let found = find_files("*.xml", tmp.path()).unwrap();
        assert_eq!(found.len(), 1);
        assert!(found[0].is_absolute());
    }
}
