//! On-disk state: session files, render descriptors and the length cache all land through
//! `write_atomic`, so a reader never sees a half-written file.

use std::{fs, io::Write, path::Path};

use anyhow::{Context, Result};
use tracing::{debug, info, instrument};

use crate::session::Session;

/// Replaces `path` with `bytes` by writing a sibling temp file and renaming it into place.
/// Missing parent directories are created.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let directory = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    fs::create_dir_all(directory)
        .with_context(|| format!("cannot create {}", directory.display()))?;

    let mut staged = tempfile::NamedTempFile::new_in(directory)
        .with_context(|| format!("cannot stage a write in {}", directory.display()))?;
    staged
        .write_all(bytes)
        .and_then(|()| staged.as_file().sync_all())
        .with_context(|| format!("cannot stage {}", path.display()))?;
    staged
        .persist(path)
        .map_err(|error| anyhow::Error::new(error.error))
        .with_context(|| format!("cannot replace {}", path.display()))?;

    debug!(path = %path.display(), bytes = bytes.len(), "file replaced");
    Ok(())
}

#[instrument(skip(session), fields(session = %session.name, path = %path.display()))]
pub fn save_session(path: &Path, session: &Session) -> Result<()> {
    let json = serde_json::to_vec_pretty(session).context("session is not serializable")?;
    write_atomic(path, &json)?;
    info!(tracks = session.tracks().count(), "session saved");
    Ok(())
}

/// Reads a session file as written by `save_session`. Callers check the contents before use.
#[instrument(fields(path = %path.display()))]
pub fn load_session(path: &Path) -> Result<Session> {
    let content = fs::read(path).with_context(|| format!("cannot read {}", path.display()))?;
    let session: Session = serde_json::from_slice(&content)
        .with_context(|| format!("{} is not a session file", path.display()))?;
    info!(session = %session.name, "session loaded");
    Ok(session)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn atomic_writes_replace_content_and_leave_no_staging_files() {
        let temp = tempfile::tempdir().expect("tempdir should be creatable");
        let path = temp.path().join("nested").join("state.json");

        write_atomic(&path, b"first").expect("first write");
        write_atomic(&path, b"second").expect("second write");

        assert_eq!(fs::read(&path).expect("file reads"), b"second");
        let entries: Vec<_> = fs::read_dir(path.parent().expect("has parent"))
            .expect("dir lists")
            .collect();
        assert_eq!(entries.len(), 1);
    }

    #[test]
    fn directory_in_the_way_fails_the_write() {
        let temp = tempfile::tempdir().expect("tempdir should be creatable");
        let path = temp.path().join("taken");
        fs::create_dir(&path).expect("dir should be creatable");
        assert!(write_atomic(&path, b"data").is_err());
    }
}
