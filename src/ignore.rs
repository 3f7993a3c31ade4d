//! Ignore patterns.
//!
//! `.dcfh/ignore` holds one extended regular expression per line, `#`
//! starts a comment. Patterns are matched against the forward slash
//! normalised relative path. The metadata directory itself is always
//! excluded. A missing or unreadable ignore file is not fatal.

use std::path::Path;

use regex::Regex;

pub struct IgnoreList {
    patterns: Vec<Regex>,
}

impl IgnoreList {
    fn with_defaults() -> Self {
        Self {
            patterns: vec![Regex::new(r"^\.dcfh(/.*)?$").unwrap()],
        }
    }

    pub fn load(meta_dir: &Path) -> Self {
        let mut list = Self::with_defaults();
        let path = meta_dir.join("ignore");
        match std::fs::read_to_string(&path) {
            Ok(content) => list.add_lines(&content),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => (),
            Err(err) => log::warn!("unable to read ignore file {:?} - {}", path, err),
        }
        list
    }

    fn add_lines(&mut self, content: &str) {
        for (lineno, raw_line) in content.lines().enumerate() {
            let line = raw_line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            match Regex::new(line) {
                Ok(pattern) => self.patterns.push(pattern),
                Err(err) => {
                    log::warn!("bad ignore pattern on line {} - {}", lineno + 1, err)
                }
            }
        }
    }

    pub fn is_ignored(&self, rel_path: &str) -> bool {
        self.patterns.iter().any(|p| p.is_match(rel_path))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn metadata_dir_always_ignored() {
        let list = IgnoreList::with_defaults();
        assert!(list.is_ignored(".dcfh"));
        assert!(list.is_ignored(".dcfh/main.idx"));
        assert!(!list.is_ignored("src/main.rs"));
        assert!(!list.is_ignored("a.dcfh"));
    }

    #[test]
    fn custom_patterns() {
        let mut list = IgnoreList::with_defaults();
        list.add_lines("# build output\n\\.o$\n^target/\n\nbad[regex\n");
        assert!(list.is_ignored("src/foo.o"));
        assert!(list.is_ignored("target/debug/foo"));
        assert!(!list.is_ignored("src/foo.c"));
        assert!(!list.is_ignored("subdir/target/x"));
    }
}
