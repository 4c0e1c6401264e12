use crate::Result;
use regex::Regex;
use std::path::{Path, PathBuf};

pub const DEFAULT_FILE_PATTERN: &str = r"^.+\.json$";

/// File-name filter for tracked record files.
#[derive(Debug, Clone)]
pub struct FilePattern {
    regex: Regex,
}

impl FilePattern {
    pub fn new(pattern: &str) -> Result<Self> {
        Ok(Self {
            regex: Regex::new(pattern)?,
        })
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        self.regex.as_str()
    }

    /// Matches against the final path component only.
    #[must_use]
    pub fn matches(&self, path: &Path) -> bool {
        file_name(path).is_some_and(|name| self.regex.is_match(&name))
    }
}

impl Default for FilePattern {
    fn default() -> Self {
        Self {
            regex: Regex::new(DEFAULT_FILE_PATTERN).expect("default pattern compiles"),
        }
    }
}

#[must_use]
pub fn file_name(path: &Path) -> Option<String> {
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
}

/// Scanner for record files directly inside the watched directory
pub struct FileScanner<'a> {
    root: &'a Path,
    pattern: &'a FilePattern,
}

impl<'a> FileScanner<'a> {
    pub fn new(root: &'a Path, pattern: &'a FilePattern) -> Self {
        Self { root, pattern }
    }

    /// Matching regular files, sorted by name. Subdirectories are not descended.
    pub fn scan(&self) -> Result<Vec<PathBuf>> {
        let mut files = Vec::new();
        for entry in std::fs::read_dir(self.root)? {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    log::warn!("Failed to read entry: {e}");
                    continue;
                }
            };
            let Ok(file_type) = entry.file_type() else {
                continue;
            };
            if !file_type.is_file() {
                continue;
            }
            let path = entry.path();
            if self.pattern.matches(&path) {
                files.push(path);
            }
        }
        files.sort();
        log::info!("Found {} record files", files.len());
        Ok(files)
    }
}

#[cfg(test)]
mod tests {
    use super::{FilePattern, FileScanner};
    use pretty_assertions::assert_eq;
    use std::fs;
    use std::path::Path;
    use tempfile::tempdir;

    #[test]
    fn pattern_matches_file_name_only() {
        let pattern = FilePattern::new(r"^.+\.xml$").unwrap();
        assert!(pattern.matches(Path::new("/data/watch/a.xml")));
        assert!(!pattern.matches(Path::new("/data/watch.xml/a.txt")));
        assert!(!pattern.matches(Path::new("/data/watch/.xml")));
    }

    #[test]
    fn scan_is_sorted_and_skips_directories() {
        let temp = tempdir().unwrap();
        fs::write(temp.path().join("b.json"), b"{}").unwrap();
        fs::write(temp.path().join("a.json"), b"{}").unwrap();
        fs::write(temp.path().join("notes.txt"), b"").unwrap();
        fs::create_dir(temp.path().join("nested.json")).unwrap();

        let pattern = FilePattern::default();
        let files = FileScanner::new(temp.path(), &pattern).scan().unwrap();
        let names: Vec<_> = files
            .iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, ["a.json", "b.json"]);
    }
}
