//! Source-tree enumeration and receiver-side naming.
//!
//! The sender flattens its CLI roots into a list of [`FileRecord`]s up
//! front, so permission problems and symlink cycles surface before any
//! byte goes over the wire. The receiver side maps incoming names onto
//! non-colliding local paths.

use std::collections::HashSet;
use std::fs::{self, File};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use walkdir::WalkDir;

use crate::error::{Result, TrzszError};

/// One entry of a transfer batch. `rel_path` starts at the root's own
/// name; `path_id` is the index of the CLI root it came from.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct FileRecord {
    pub path_id: i64,
    #[serde(skip)]
    pub abs_path: PathBuf,
    #[serde(rename = "path_name")]
    pub rel_path: Vec<String>,
    pub is_dir: bool,
}

impl FileRecord {
    /// Leaf name, shown in progress output.
    pub fn file_name(&self) -> &str {
        self.rel_path.last().map(String::as_str).unwrap_or_default()
    }
}

/// Enumerate every CLI root into records, failing fast on anything the
/// transfer would later choke on.
pub fn check_paths_readable(paths: &[PathBuf], directory: bool) -> Result<Vec<FileRecord>> {
    let mut list = Vec::new();
    for (path_id, p) in paths.iter().enumerate() {
        let path = std::path::absolute(p)?;
        let meta = match fs::metadata(&path) {
            Ok(meta) => meta,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(TrzszError::fail(format!(
                    "No such file: {}",
                    path.display()
                )))
            }
            Err(e) => return Err(e.into()),
        };
        if !directory && meta.is_dir() {
            return Err(TrzszError::fail(format!(
                "Is a directory: {}",
                path.display()
            )));
        }
        walk_one_root(path_id as i64, &path, &mut list)?;
    }
    check_duplicate_names(&list)?;
    Ok(list)
}

fn walk_one_root(path_id: i64, root: &Path, list: &mut Vec<FileRecord>) -> Result<()> {
    let root_name = file_name_of(root);
    let mut visited_dirs: HashSet<PathBuf> = HashSet::new();
    for entry in WalkDir::new(root).follow_links(true) {
        let entry = entry.map_err(|e| {
            if e.loop_ancestor().is_some() {
                let path = e.path().map(Path::to_path_buf).unwrap_or_default();
                TrzszError::fail(format!("Duplicate link: {}", path.display()))
            } else {
                TrzszError::fail(format!("Walk error: {}", e))
            }
        })?;
        let path = entry.path();
        let mut rel_path = vec![root_name.clone()];
        if entry.depth() > 0 {
            for seg in path.strip_prefix(root).unwrap_or(path).components() {
                rel_path.push(seg.as_os_str().to_string_lossy().into_owned());
            }
        }
        let file_type = entry.file_type();
        if file_type.is_dir() {
            // resolve symlinked dirs so two links to one target fail
            // instead of duplicating (or looping) the subtree
            let real = fs::canonicalize(path)?;
            if !visited_dirs.insert(real) {
                return Err(TrzszError::fail(format!(
                    "Duplicate link: {}",
                    path.display()
                )));
            }
            list.push(FileRecord {
                path_id,
                abs_path: path.to_path_buf(),
                rel_path,
                is_dir: true,
            });
        } else if file_type.is_file() {
            if access_readable(path).is_err() {
                return Err(TrzszError::fail(format!(
                    "No permission to read: {}",
                    path.display()
                )));
            }
            list.push(FileRecord {
                path_id,
                abs_path: path.to_path_buf(),
                rel_path,
                is_dir: false,
            });
        } else {
            return Err(TrzszError::fail(format!(
                "Not a regular file: {}",
                path.display()
            )));
        }
    }
    Ok(())
}

fn file_name_of(path: &Path) -> String {
    path.file_name()
        .unwrap_or(path.as_os_str())
        .to_string_lossy()
        .into_owned()
}

/// The walker cannot produce duplicates on its own; this guards the
/// receiver against a batch that would silently overwrite itself.
pub fn check_duplicate_names(list: &[FileRecord]) -> Result<()> {
    let mut seen = HashSet::new();
    for record in list {
        let joined = record.rel_path.join("/");
        if !seen.insert(joined.clone()) {
            return Err(TrzszError::fail(format!("Duplicate name: {}", joined)));
        }
    }
    Ok(())
}

/// Destination sanity check before the handshake starts.
pub fn check_path_writable(path: &Path) -> Result<()> {
    let meta = match fs::metadata(path) {
        Ok(meta) => meta,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(TrzszError::fail(format!(
                "No such directory: {}",
                path.display()
            )))
        }
        Err(e) => return Err(e.into()),
    };
    if !meta.is_dir() {
        return Err(TrzszError::fail(format!(
            "Not a directory: {}",
            path.display()
        )));
    }
    if access_writable(path).is_err() {
        return Err(TrzszError::fail(format!(
            "No permission to write: {}",
            path.display()
        )));
    }
    Ok(())
}

#[cfg(unix)]
fn access(path: &Path, mode: libc::c_int) -> std::io::Result<()> {
    use std::os::unix::ffi::OsStrExt;
    let cpath = std::ffi::CString::new(path.as_os_str().as_bytes())
        .map_err(|_| std::io::Error::from(std::io::ErrorKind::InvalidInput))?;
    if unsafe { libc::access(cpath.as_ptr(), mode) } == 0 {
        Ok(())
    } else {
        Err(std::io::Error::last_os_error())
    }
}

#[cfg(unix)]
fn access_readable(path: &Path) -> std::io::Result<()> {
    access(path, libc::R_OK)
}

#[cfg(unix)]
fn access_writable(path: &Path) -> std::io::Result<()> {
    access(path, libc::W_OK)
}

#[cfg(not(unix))]
fn access_readable(path: &Path) -> std::io::Result<()> {
    File::open(path).map(|_| ())
}

#[cfg(not(unix))]
fn access_writable(path: &Path) -> std::io::Result<()> {
    let meta = fs::metadata(path)?;
    if meta.permissions().readonly() {
        return Err(std::io::Error::from(std::io::ErrorKind::PermissionDenied));
    }
    Ok(())
}

/// First free name among `name`, `name.0` .. `name.999`.
pub fn get_new_name(path: &Path, name: &str) -> Result<String> {
    if !path.join(name).exists() {
        return Ok(name.to_string());
    }
    for i in 0..1000 {
        let new_name = format!("{}.{}", name, i);
        if !path.join(&new_name).exists() {
            return Ok(new_name);
        }
    }
    Err(TrzszError::fail("Fail to assign new file name"))
}

/// Create a file for writing, translating the errnos users actually hit
/// into the protocol's messages.
pub fn do_create_file(path: &Path) -> Result<File> {
    File::create(path).map_err(|e| translate_create_error(e, path))
}

#[cfg(unix)]
fn translate_create_error(e: std::io::Error, path: &Path) -> TrzszError {
    match e.raw_os_error() {
        Some(libc::EACCES) => {
            TrzszError::fail(format!("No permission to write: {}", path.display()))
        }
        Some(libc::EISDIR) => TrzszError::fail(format!("Is a directory: {}", path.display())),
        _ => TrzszError::fail(format!("{}", e)),
    }
}

#[cfg(not(unix))]
fn translate_create_error(e: std::io::Error, path: &Path) -> TrzszError {
    match e.kind() {
        std::io::ErrorKind::PermissionDenied => {
            TrzszError::fail(format!("No permission to write: {}", path.display()))
        }
        _ => TrzszError::fail(format!("{}", e)),
    }
}

/// `mkdir -p` semantics; an existing non-directory in the way fails.
pub fn do_create_directory(path: &Path) -> Result<()> {
    match fs::metadata(path) {
        Ok(meta) if meta.is_dir() => Ok(()),
        Ok(_) => Err(TrzszError::fail(format!(
            "Not a directory: {}",
            path.display()
        ))),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            create_dir_all_0755(path)?;
            Ok(())
        }
        Err(e) => Err(e.into()),
    }
}

#[cfg(unix)]
fn create_dir_all_0755(path: &Path) -> std::io::Result<()> {
    use std::os::unix::fs::DirBuilderExt;
    fs::DirBuilder::new().recursive(true).mode(0o755).create(path)
}

#[cfg(not(unix))]
fn create_dir_all_0755(path: &Path) -> std::io::Result<()> {
    fs::create_dir_all(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn single_file_record() {
        let tmp = TempDir::new().unwrap();
        let file = tmp.path().join("note.txt");
        fs::write(&file, "hi").unwrap();

        let list = check_paths_readable(&[file.clone()], false).unwrap();
        assert_eq!(list.len(), 1);
        assert_eq!(list[0].path_id, 0);
        assert_eq!(list[0].rel_path, vec!["note.txt".to_string()]);
        assert!(!list[0].is_dir);
    }

    #[test]
    fn directory_roots_need_the_flag() {
        let tmp = TempDir::new().unwrap();
        let err = check_paths_readable(&[tmp.path().to_path_buf()], false).unwrap_err();
        assert!(err.to_string().starts_with("Is a directory:"));
    }

    #[test]
    fn missing_path_fails_fast() {
        let err = check_paths_readable(&[PathBuf::from("/definitely/not/here")], true).unwrap_err();
        assert!(err.to_string().starts_with("No such file:"));
    }

    #[test]
    fn tree_walk_yields_dirs_then_files() {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path().join("d");
        fs::create_dir_all(root.join("sub")).unwrap();
        fs::write(root.join("sub/f"), "hi").unwrap();

        let list = check_paths_readable(&[root], true).unwrap();
        let rels: Vec<String> = list.iter().map(|r| r.rel_path.join("/")).collect();
        assert_eq!(rels, vec!["d", "d/sub", "d/sub/f"]);
        assert!(list[0].is_dir && list[1].is_dir && !list[2].is_dir);
        assert!(list.iter().all(|r| r.path_id == 0));
    }

    #[cfg(unix)]
    #[test]
    fn symlink_to_visited_dir_is_a_duplicate_link() {
        use std::os::unix::fs::symlink;
        let tmp = TempDir::new().unwrap();
        let root = tmp.path().join("d");
        fs::create_dir_all(root.join("real")).unwrap();
        symlink(root.join("real"), root.join("alias")).unwrap();

        let err = check_paths_readable(&[root], true).unwrap_err();
        assert!(err.to_string().starts_with("Duplicate link:"), "{}", err);
    }

    #[cfg(unix)]
    #[test]
    fn symlink_cycle_errors_instead_of_recursing() {
        use std::os::unix::fs::symlink;
        let tmp = TempDir::new().unwrap();
        let root = tmp.path().join("d");
        fs::create_dir_all(root.join("sub")).unwrap();
        symlink(&root, root.join("sub/back")).unwrap();

        let err = check_paths_readable(&[root], true).unwrap_err();
        assert!(err.to_string().starts_with("Duplicate link:"), "{}", err);
    }

    #[cfg(unix)]
    #[test]
    fn fifo_is_not_a_regular_file() {
        use std::os::unix::ffi::OsStrExt;
        let tmp = TempDir::new().unwrap();
        let fifo = tmp.path().join("pipe");
        let cpath = std::ffi::CString::new(fifo.as_os_str().as_bytes()).unwrap();
        assert_eq!(unsafe { libc::mkfifo(cpath.as_ptr(), 0o644) }, 0);

        let err = check_paths_readable(&[tmp.path().to_path_buf()], true).unwrap_err();
        assert!(err.to_string().starts_with("Not a regular file:"));
    }

    #[test]
    fn new_name_probes_in_order() {
        let tmp = TempDir::new().unwrap();
        assert_eq!(get_new_name(tmp.path(), "f").unwrap(), "f");
        fs::write(tmp.path().join("f"), "").unwrap();
        fs::write(tmp.path().join("f.0"), "").unwrap();
        fs::write(tmp.path().join("f.1"), "").unwrap();
        assert_eq!(get_new_name(tmp.path(), "f").unwrap(), "f.2");
    }

    #[test]
    fn writable_check_messages() {
        let tmp = TempDir::new().unwrap();
        assert!(check_path_writable(tmp.path()).is_ok());

        let err = check_path_writable(&tmp.path().join("nope")).unwrap_err();
        assert!(err.to_string().starts_with("No such directory:"));

        let file = tmp.path().join("plain");
        fs::write(&file, "").unwrap();
        let err = check_path_writable(&file).unwrap_err();
        assert!(err.to_string().starts_with("Not a directory:"));
    }

    #[test]
    fn create_directory_rejects_file_in_the_way() {
        let tmp = TempDir::new().unwrap();
        let blocker = tmp.path().join("x");
        fs::write(&blocker, "").unwrap();
        let err = do_create_directory(&blocker).unwrap_err();
        assert!(err.to_string().starts_with("Not a directory:"));

        do_create_directory(&tmp.path().join("a/b/c")).unwrap();
        assert!(tmp.path().join("a/b/c").is_dir());
    }

    #[test]
    fn create_file_over_directory_translates_errno() {
        let tmp = TempDir::new().unwrap();
        let dir = tmp.path().join("d");
        fs::create_dir(&dir).unwrap();
        let err = do_create_file(&dir).unwrap_err();
        assert!(err.to_string().starts_with("Is a directory:"), "{}", err);
    }

    #[test]
    fn duplicate_rel_paths_rejected() {
        let rec = |rel: &[&str]| FileRecord {
            path_id: 0,
            abs_path: PathBuf::new(),
            rel_path: rel.iter().map(|s| s.to_string()).collect(),
            is_dir: false,
        };
        assert!(check_duplicate_names(&[rec(&["a", "b"]), rec(&["a", "c"])]).is_ok());
        let err = check_duplicate_names(&[rec(&["a", "b"]), rec(&["a", "b"])]).unwrap_err();
        assert!(err.to_string().starts_with("Duplicate name:"));
    }

    #[test]
    fn record_wire_format() {
        let record = FileRecord {
            path_id: 3,
            abs_path: PathBuf::from("/tmp/d/sub/f"),
            rel_path: vec!["d".into(), "sub".into(), "f".into()],
            is_dir: false,
        };
        let json = serde_json::to_string(&record).unwrap();
        assert_eq!(
            json,
            r#"{"path_id":3,"path_name":["d","sub","f"],"is_dir":false}"#
        );
        let parsed: FileRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.rel_path, record.rel_path);
        assert_eq!(parsed.abs_path, PathBuf::new());
    }
}
