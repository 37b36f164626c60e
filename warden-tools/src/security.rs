//! Path and command canonicalization for governed operations.
//!
//! Everything the policy layer compares goes through here first: paths are
//! made absolute, `..` is folded and symlinks of existing ancestors are
//! resolved; command lines are tokenized and re-rendered in one canonical
//! spelling.

use std::path::{Component, Path, PathBuf};

/// Fold `.` and `..` without touching the filesystem. `..` never climbs
/// above the root.
pub fn normalize_lexically(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::Prefix(p) => out.push(p.as_os_str()),
            Component::RootDir => out.push(Component::RootDir.as_os_str()),
            Component::CurDir => {}
            Component::ParentDir => {
                let at_root = out.parent().is_none();
                if !at_root {
                    out.pop();
                }
            }
            Component::Normal(part) => out.push(part),
        }
    }
    out
}

/// Resolve `path` to an absolute canonical form.
///
/// Relative paths are taken relative to `base` (itself made absolute
/// against the process working directory). The deepest existing ancestor is
/// canonicalized so symlinks cannot redirect the remainder; components that
/// do not exist yet are appended as-is.
pub fn resolve_path(path: &Path, base: &Path) -> PathBuf {
    let joined = if path.is_absolute() {
        path.to_path_buf()
    } else {
        base.join(path)
    };
    let absolute = if joined.is_absolute() {
        joined
    } else {
        match std::env::current_dir() {
            Ok(cwd) => cwd.join(joined),
            Err(_) => joined,
        }
    };
    let normalized = normalize_lexically(&absolute);

    let mut existing = normalized.as_path();
    let mut rest: Vec<&std::ffi::OsStr> = Vec::new();
    loop {
        if let Ok(canonical) = existing.canonicalize() {
            let mut resolved = canonical;
            for part in rest.iter().rev() {
                resolved.push(part);
            }
            return resolved;
        }
        match (existing.parent(), existing.file_name()) {
            (Some(parent), Some(name)) => {
                rest.push(name);
                existing = parent;
            }
            _ => return normalized,
        }
    }
}

/// [`resolve_path`] relative to the process working directory.
pub fn resolve_in_cwd(path: &Path) -> PathBuf {
    let cwd = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("/"));
    resolve_path(path, &cwd)
}

/// `child` lies strictly below `parent` (component-wise, never equal).
pub fn is_strict_descendant(child: &Path, parent: &Path) -> bool {
    child != parent && child.starts_with(parent)
}

/// `child` is `root` or lies below it.
pub fn is_within(child: &Path, root: &Path) -> bool {
    child.starts_with(root)
}

/// Paths carrying NUL bytes never reach the filesystem.
pub fn has_nul(path: &str) -> bool {
    path.contains('\0')
}

/// Split a command line into words, honouring `'…'`, `"…"` and backslash
/// escapes. Unterminated quotes are an error.
pub fn split_words(input: &str) -> Result<Vec<String>, String> {
    let mut words = Vec::new();
    let mut current = String::new();
    let mut in_word = false;
    let mut chars = input.chars();

    while let Some(c) = chars.next() {
        match c {
            c if c.is_whitespace() => {
                if in_word {
                    words.push(std::mem::take(&mut current));
                    in_word = false;
                }
            }
            '\'' => {
                in_word = true;
                loop {
                    match chars.next() {
                        Some('\'') => break,
                        Some(ch) => current.push(ch),
                        None => return Err("unterminated single quote".into()),
                    }
                }
            }
            '"' => {
                in_word = true;
                loop {
                    match chars.next() {
                        Some('"') => break,
                        Some('\\') => match chars.next() {
                            Some(ch @ ('"' | '\\')) => current.push(ch),
                            Some(ch) => {
                                current.push('\\');
                                current.push(ch);
                            }
                            None => return Err("unterminated double quote".into()),
                        },
                        Some(ch) => current.push(ch),
                        None => return Err("unterminated double quote".into()),
                    }
                }
            }
            '\\' => {
                in_word = true;
                match chars.next() {
                    Some(ch) => current.push(ch),
                    None => return Err("trailing backslash".into()),
                }
            }
            c => {
                in_word = true;
                current.push(c);
            }
        }
    }
    if in_word {
        words.push(current);
    }
    Ok(words)
}

/// Quote `word` so that [`split_words`] reads it back unchanged.
pub fn quote_word(word: &str) -> String {
    let needs_quotes = word.is_empty()
        || word
            .chars()
            .any(|c| c.is_whitespace() || matches!(c, '"' | '\'' | '\\'));
    if !needs_quotes {
        return word.to_string();
    }
    let mut out = String::with_capacity(word.len() + 2);
    out.push('"');
    for c in word.chars() {
        if matches!(c, '"' | '\\') {
            out.push('\\');
        }
        out.push(c);
    }
    out.push('"');
    out
}

/// Canonical spelling of a program invocation: executable name lower-cased,
/// words separated by one space, words with whitespace or quotes re-quoted.
pub fn canonical_command(program: &str, args: &[String]) -> String {
    let mut out = quote_word(&program.trim().to_lowercase());
    for arg in args {
        out.push(' ');
        out.push_str(&quote_word(arg));
    }
    out
}

/// Join words into one line that [`split_words`] splits back the same way.
pub fn join_words(words: &[String]) -> String {
    words
        .iter()
        .map(|w| quote_word(w))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Canonical spelling of a free-form command line.
pub fn normalize_command_line(line: &str) -> Result<String, String> {
    let words = split_words(line.trim())?;
    let Some((program, args)) = words.split_first() else {
        return Err("empty command".into());
    };
    Ok(canonical_command(program, args))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn lexical_normalization_folds_parent_dirs() {
        assert_eq!(
            normalize_lexically(Path::new("/data/reports/../../etc/passwd")),
            PathBuf::from("/etc/passwd")
        );
        assert_eq!(
            normalize_lexically(Path::new("/../../etc")),
            PathBuf::from("/etc")
        );
        assert_eq!(
            normalize_lexically(Path::new("/a/./b/")),
            PathBuf::from("/a/b")
        );
    }

    #[test]
    fn resolve_relative_against_base() {
        let tmp = TempDir::new().unwrap();
        let base = tmp.path().canonicalize().unwrap();
        let resolved = resolve_path(Path::new("sub/new.txt"), &base);
        assert_eq!(resolved, base.join("sub").join("new.txt"));
    }

    #[test]
    fn resolve_traversal_escapes_scope() {
        let tmp = TempDir::new().unwrap();
        let base = tmp.path().canonicalize().unwrap();
        let scope = base.join("reports");
        std::fs::create_dir_all(&scope).unwrap();

        let resolved = resolve_path(&scope.join("../../etc/passwd"), &base);
        assert!(!is_strict_descendant(&resolved, &scope));
    }

    #[cfg(unix)]
    #[test]
    fn resolve_follows_symlinked_ancestor() {
        let tmp = TempDir::new().unwrap();
        let base = tmp.path().canonicalize().unwrap();
        let scope = base.join("scope");
        let outside = base.join("outside");
        std::fs::create_dir_all(&scope).unwrap();
        std::fs::create_dir_all(&outside).unwrap();
        std::os::unix::fs::symlink(&outside, scope.join("link")).unwrap();

        let resolved = resolve_path(&scope.join("link/secret.txt"), &base);
        assert_eq!(resolved, outside.join("secret.txt"));
        assert!(!is_strict_descendant(&resolved, &scope));
    }

    #[test]
    fn strict_descendant_excludes_self_and_siblings() {
        let parent = Path::new("/data/reports");
        assert!(is_strict_descendant(Path::new("/data/reports/q3.txt"), parent));
        assert!(!is_strict_descendant(Path::new("/data/reports"), parent));
        assert!(!is_strict_descendant(Path::new("/data/reports2/x"), parent));
        assert!(is_within(Path::new("/data/reports"), parent));
    }

    #[test]
    fn split_words_handles_quotes() {
        assert_eq!(
            split_words(r#"write /tmp/a.txt "hello world" 'it''s'"#).unwrap(),
            vec!["write", "/tmp/a.txt", "hello world", "its"]
        );
        assert_eq!(split_words(r#"a\ b"#).unwrap(), vec!["a b"]);
        assert_eq!(split_words(r#""""#).unwrap(), vec![""]);
        assert!(split_words("'open").is_err());
        assert!(split_words("\"open").is_err());
    }

    #[test]
    fn command_normalization() {
        assert_eq!(
            normalize_command_line("  Backup.SH   --full  ").unwrap(),
            "backup.sh --full"
        );
        assert_eq!(
            canonical_command("echo", &["hello world".to_string()]),
            r#"echo "hello world""#
        );
        assert_eq!(
            normalize_command_line(r#"echo "hello world""#).unwrap(),
            canonical_command("ECHO", &["hello world".to_string()])
        );
        assert!(normalize_command_line("   ").is_err());
    }

    #[test]
    fn argument_case_is_preserved() {
        assert_ne!(
            normalize_command_line("tar -C /Data").unwrap(),
            normalize_command_line("tar -C /data").unwrap()
        );
    }

    #[test]
    fn joined_words_split_back() {
        let words: Vec<String> = ["propose", "a b", r#"say "hi""#, r"C:\tmp", "it's", ""]
            .iter()
            .map(|s| s.to_string())
            .collect();
        assert_eq!(split_words(&join_words(&words)).unwrap(), words);
    }
}
