//! File metadata gathered for up-to-date checks.

/// Stat info gathered for a file.  This also models "file is absent".
/// It's not using an Option<> just because it makes the code using it easier
/// to follow.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum FileInfo {
    Missing,
    Stat(StatInfo),
}

/// The identity of a filesystem object, compared structurally to decide
/// whether a file has changed between builds.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub struct StatInfo {
    pub device: u64,
    pub inode: u64,
    pub mode: u32,
    pub size: u64,
    pub mtime: i64,
    pub mtime_nsec: i64,
}

impl FileInfo {
    /// stat() an on-disk path.  Any failure to stat is treated as missing.
    pub fn for_path(path: &str) -> FileInfo {
        match std::fs::metadata(path) {
            Ok(meta) => FileInfo::Stat(StatInfo::from_metadata(&meta)),
            Err(_) => FileInfo::Missing,
        }
    }

    pub fn is_missing(&self) -> bool {
        matches!(self, FileInfo::Missing)
    }
}

impl StatInfo {
    #[cfg(unix)]
    fn from_metadata(meta: &std::fs::Metadata) -> StatInfo {
        use std::os::unix::fs::MetadataExt;
        StatInfo {
            device: meta.dev(),
            inode: meta.ino(),
            mode: meta.mode(),
            size: meta.size(),
            mtime: meta.mtime(),
            mtime_nsec: meta.mtime_nsec(),
        }
    }

    #[cfg(not(unix))]
    fn from_metadata(meta: &std::fs::Metadata) -> StatInfo {
        // No device/inode identity off Unix; size and mtime still catch
        // ordinary edits.
        let mtime = meta
            .modified()
            .ok()
            .and_then(|t| t.duration_since(std::time::SystemTime::UNIX_EPOCH).ok());
        StatInfo {
            device: 0,
            inode: 0,
            mode: 0,
            size: meta.len(),
            mtime: mtime.map(|d| d.as_secs() as i64).unwrap_or(0),
            mtime_nsec: mtime.map(|d| d.subsec_nanos() as i64).unwrap_or(0),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_path() {
        assert!(FileInfo::for_path("this/path/should/not/exist").is_missing());
    }

    #[test]
    fn existing_path_changes_with_size() {
        let dir = std::env::temp_dir().join("grist-fs-test");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("stamp");
        let path = path.to_str().unwrap();

        std::fs::write(path, "one").unwrap();
        let before = FileInfo::for_path(path);
        assert!(!before.is_missing());

        std::fs::write(path, "longer content").unwrap();
        let after = FileInfo::for_path(path);
        assert_ne!(before, after);
    }
}
