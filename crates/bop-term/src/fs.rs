use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};

use crate::config::RegistrationId;
use crate::error::{TermError, TermResult};

pub const TERM_FILE_EXTENSION: &str = "logbuffer";

/// Directory layout of file-backed term buffers.
///
/// ```text
/// <root>/<channel>/<stream_id>/<session_id>/<registration_id>/term-<index>.logbuffer
/// ```
///
/// The channel is reduced to a filesystem-safe name. The registration id keeps a
/// re-registered publication from truncating files a released one still maps.
#[derive(Debug, Clone)]
pub struct TermLayout {
    root: PathBuf,
}

impl TermLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn publication_dir(
        &self,
        channel: &str,
        stream_id: i32,
        session_id: i32,
        registration_id: RegistrationId,
    ) -> PathBuf {
        self.root
            .join(sanitize_channel(channel))
            .join(stream_id.to_string())
            .join(session_id.to_string())
            .join(registration_id.to_string())
    }

    pub fn term_path(
        &self,
        channel: &str,
        stream_id: i32,
        session_id: i32,
        registration_id: RegistrationId,
        term_index: usize,
    ) -> PathBuf {
        self.publication_dir(channel, stream_id, session_id, registration_id)
            .join(format!("term-{term_index}.{TERM_FILE_EXTENSION}"))
    }
}

/// Reduces a channel URI to characters safe in a single path component.
pub fn sanitize_channel(channel: &str) -> String {
    let sanitized: String = channel
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '.' {
                c
            } else {
                '_'
            }
        })
        .collect();
    if sanitized.is_empty() || sanitized.chars().all(|c| c == '.') {
        format!("_{sanitized}")
    } else {
        sanitized
    }
}

/// Creates (or truncates) `path` and sizes it to exactly `len` bytes.
pub fn create_fixed_size_file(path: &Path, len: u64) -> TermResult<File> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(true)
        .open(path)?;
    file.set_len(len)?;
    let actual = file.metadata()?.len();
    if actual != len {
        return Err(TermError::invalid_state(format!(
            "term file {} sized to {actual} bytes, expected {len}",
            path.display()
        )));
    }
    Ok(file)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn channel_names_become_single_components() {
        assert_eq!(
            sanitize_channel("udp://localhost:40123"),
            "udp___localhost_40123"
        );
        assert_eq!(sanitize_channel("ipc"), "ipc");
        assert_eq!(sanitize_channel(".."), "_..");
        assert_eq!(sanitize_channel(""), "_");
    }

    #[test]
    fn term_paths_are_keyed_by_identity() {
        let layout = TermLayout::new("/var/bop");
        let path = layout.term_path("udp://host:1", 10, -3, RegistrationId::new(5), 2);
        assert_eq!(
            path,
            PathBuf::from("/var/bop/udp___host_1/10/-3/5/term-2.logbuffer")
        );
    }

    #[test]
    fn fixed_size_file_has_requested_length() {
        let tmp = TempDir::new().expect("tempdir");
        let path = tmp.path().join("a/b/term-0.logbuffer");
        let file = create_fixed_size_file(&path, 4096).expect("create");
        assert_eq!(file.metadata().expect("metadata").len(), 4096);
    }
}
