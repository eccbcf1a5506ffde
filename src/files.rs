//! Capability-scoped file helpers.

use camino::Utf8Path;
use cap_std::{ambient_authority, fs_utf8::Dir};

use crate::error::BuildError;

fn split(path: &Utf8Path) -> Result<(&Utf8Path, &str), BuildError> {
    let file_name = path.file_name().ok_or_else(|| BuildError::Io {
        path: path.to_string(),
        message: String::from("path has no file name"),
    })?;
    let parent = path
        .parent()
        .filter(|parent| !parent.as_str().is_empty())
        .unwrap_or_else(|| Utf8Path::new("."));
    Ok((parent, file_name))
}

fn open_parent(path: &Utf8Path, parent: &Utf8Path) -> Result<Dir, BuildError> {
    Dir::open_ambient_dir(parent, ambient_authority()).map_err(|err| BuildError::Io {
        path: path.to_string(),
        message: err.to_string(),
    })
}

/// Reads `path` as UTF-8.
///
/// # Errors
///
/// Returns [`BuildError::Io`] when the file cannot be read.
pub fn read_to_string(path: &Utf8Path) -> Result<String, BuildError> {
    let (parent, file_name) = split(path)?;
    open_parent(path, parent)?
        .read_to_string(file_name)
        .map_err(|err| BuildError::Io {
            path: path.to_string(),
            message: err.to_string(),
        })
}

/// Writes `contents` to `path`, replacing any existing file.
///
/// # Errors
///
/// Returns [`BuildError::Io`] when the parent directory cannot be opened or
/// the write fails.
pub fn write(path: &Utf8Path, contents: &str) -> Result<(), BuildError> {
    let (parent, file_name) = split(path)?;
    open_parent(path, parent)?
        .write(file_name, contents)
        .map_err(|err| BuildError::Io {
            path: path.to_string(),
            message: err.to_string(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use camino::Utf8PathBuf;
    use tempfile::TempDir;

    #[test]
    fn write_then_read_in_place() {
        let tmp = TempDir::new().unwrap_or_else(|err| panic!("temp dir: {err}"));
        let path = Utf8PathBuf::from_path_buf(tmp.path().join("key.pem"))
            .unwrap_or_else(|path| panic!("non-UTF-8 temp path: {}", path.display()));

        write(&path, "material").unwrap_or_else(|err| panic!("write: {err}"));
        let contents = read_to_string(&path).unwrap_or_else(|err| panic!("read: {err}"));

        assert_eq!(contents, "material");
    }

    #[test]
    fn reading_a_missing_file_names_the_path() {
        let err = read_to_string(Utf8Path::new("/definitely/not/here.txt"))
            .expect_err("missing file");
        assert!(
            matches!(err, BuildError::Io { ref path, .. } if path == "/definitely/not/here.txt"),
            "unexpected: {err}"
        );
    }
}
