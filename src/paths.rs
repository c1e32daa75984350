use std::path::{Path, PathBuf};

pub trait ExpandHome {
    fn expand_home(&self) -> PathBuf;
}

impl ExpandHome for PathBuf {
    fn expand_home(&self) -> PathBuf {
        self.as_path().expand_home()
    }
}

impl ExpandHome for Path {
    fn expand_home(&self) -> PathBuf {
        let path_str = self.to_string_lossy();
        if !path_str.starts_with('~') {
            return self.to_path_buf();
        }

        let home = std::env::var("HOME").unwrap_or_else(|_| String::from("/"));
        if path_str == "~" {
            return PathBuf::from(home);
        }

        if let Some(stripped) = path_str.strip_prefix("~/") {
            return PathBuf::from(home).join(stripped);
        }

        self.to_path_buf()
    }
}

impl ExpandHome for str {
    fn expand_home(&self) -> PathBuf {
        Path::new(self).expand_home()
    }
}

/// Resolves `entry` against `root` unless it is already absolute.
pub fn resolve_under(root: &Path, entry: &str) -> PathBuf {
    let entry = entry.expand_home();
    if entry.is_absolute() {
        entry
    } else {
        root.join(entry)
    }
}
