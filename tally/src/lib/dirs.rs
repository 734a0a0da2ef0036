//! Diagnostic-directory plumbing: lexical path cleanup, tree creation and
//! the per-record file naming scheme shared with the `sift` tool.

use std::fs;
use std::io;
use std::path::{Component, Path, PathBuf};

/// Lexically normalize `path`: collapse `.`, duplicate separators and
/// resolvable `..` components. Never touches the filesystem, so symlinks are
/// not chased. An empty result becomes `.`.
pub fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for comp in path.components() {
        match comp {
            Component::Prefix(_) | Component::RootDir => out.push(comp),
            Component::CurDir => {}
            Component::ParentDir => match out.components().next_back() {
                Some(Component::Normal(_)) => {
                    out.pop();
                }
                // "/../x" collapses to "/x"; a relative leading ".." stays.
                Some(Component::RootDir) => {}
                _ => out.push(".."),
            },
            Component::Normal(name) => out.push(name),
        }
    }
    if out.as_os_str().is_empty() {
        out.push(".");
    }
    out
}

/// Create `path` and every missing ancestor, walking the normalized
/// components one directory at a time.
pub fn ensure_tree(path: &Path) -> io::Result<()> {
    let clean = normalize(path);
    let mut stem = PathBuf::new();
    for comp in clean.components() {
        stem.push(comp);
        match fs::create_dir(&stem) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {}
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

/// File name of one tracked allocation: `a<id>-s<size>-l<alignment>`.
pub fn record_name(id: u32, size: usize, alignment: usize) -> String {
    format!("a{id}-s{size}-l{alignment}")
}

/// Inverse of [`record_name`]; `None` for anything else in the directory.
pub fn parse_record_name(name: &str) -> Option<(u32, usize, usize)> {
    let rest = name.strip_prefix('a')?;
    let (id, rest) = rest.split_once("-s")?;
    let (size, alignment) = rest.split_once("-l")?;
    Some((id.parse().ok()?, size.parse().ok()?, alignment.parse().ok()?))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_collapses_lexical_noise() {
        assert_eq!(normalize(Path::new("a//b/./c")), PathBuf::from("a/b/c"));
        assert_eq!(normalize(Path::new("a/b/../c")), PathBuf::from("a/c"));
        assert_eq!(normalize(Path::new("/../x")), PathBuf::from("/x"));
        assert_eq!(normalize(Path::new("../x")), PathBuf::from("../x"));
        assert_eq!(normalize(Path::new("a/..")), PathBuf::from("."));
    }

    #[test]
    fn record_names_round_trip() {
        let name = record_name(7, 4096, 64);
        assert_eq!(name, "a7-s4096-l64");
        assert_eq!(parse_record_name(&name), Some((7, 4096, 64)));
        assert_eq!(parse_record_name("log.txt"), None);
    }

    #[test]
    fn ensure_tree_builds_nested_dirs() {
        let root = std::env::temp_dir().join(format!("tally-dirs-{}", std::process::id()));
        let deep = root.join("one/two/three");
        ensure_tree(&deep).unwrap();
        assert!(deep.is_dir());
        ensure_tree(&deep).unwrap();
        std::fs::remove_dir_all(&root).ok();
    }
}
