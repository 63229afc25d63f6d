//! Archive Builder: stages the entrypoint and input files into one POSIX ustar archive ready
//! to be streamed into a container or pod.

use std::io::Cursor;

use sandbox_types::{validate_relative_path, SandboxError, ENTRYPOINT_NAME, SANDBOX_GID, SANDBOX_UID};
use tar::{Builder, EntryType, Header};

use crate::wrapper::code_to_execute;

const FILE_MODE: u32 = 0o644;
const DIR_MODE: u32 = 0o755;

/// One input file the caller wants staged into the workspace, by its already-resolved bytes
/// (the Request Coordinator is responsible for turning a file-id into these bytes).
#[derive(Debug, Clone)]
pub struct StagedFile {
    pub path: String,
    pub content: Vec<u8>,
}

/// Builds a tar archive carrying `__main__.py` (the possibly-wrapped `code`) at its root,
/// followed by each staged file under its validated path, with parent directory entries
/// inserted exactly once and in depth order ahead of their first child.
///
/// Fails with `InvalidPath` if any staged path is invalid, or collides with the entrypoint name
/// once normalized — before any bytes are written to the archive.
pub fn build_archive(
    code: &str,
    files: &[StagedFile],
    last_line_interactive: bool,
) -> Result<Vec<u8>, SandboxError> {
    // Validate every path up front so a rejection never leaves a partially built archive.
    let mut validated = Vec::with_capacity(files.len());
    for file in files {
        let rel = validate_relative_path(&file.path)?;
        if rel.as_str() == ENTRYPOINT_NAME {
            return Err(SandboxError::InvalidPath {
                path: file.path.clone(),
                reason: format!("'{ENTRYPOINT_NAME}' is reserved for the execution entrypoint"),
            });
        }
        validated.push((rel, &file.content));
    }

    let mut buf = Vec::new();
    {
        let mut builder = Builder::new(&mut buf);
        builder.mode(tar::HeaderMode::Complete);

        let code_to_run = code_to_execute(code, last_line_interactive);
        append_file(&mut builder, ENTRYPOINT_NAME, code_to_run.as_bytes())?;

        let mut created_dirs: Vec<String> = Vec::new();
        for (rel, content) in &validated {
            let parts: Vec<&str> = rel.as_str().split('/').collect();
            for i in 0..parts.len().saturating_sub(1) {
                let dir_path = parts[..=i].join("/");
                if !created_dirs.iter().any(|d| d == &dir_path) {
                    append_directory(&mut builder, &dir_path)?;
                    created_dirs.push(dir_path);
                }
            }
            append_file(&mut builder, rel.as_str(), content)?;
        }

        builder
            .finish()
            .map_err(|e| SandboxError::BackendError {
                message: format!("failed to finalize archive: {e}"),
            })?;
    }

    Ok(buf)
}

fn append_file<W: std::io::Write>(
    builder: &mut Builder<W>,
    path: &str,
    content: &[u8],
) -> Result<(), SandboxError> {
    let mut header = Header::new_ustar();
    header.set_entry_type(EntryType::Regular);
    header
        .set_path(path)
        .map_err(|e| io_err(path, e))?;
    header.set_size(content.len() as u64);
    header.set_mode(FILE_MODE);
    header.set_uid(SANDBOX_UID as u64);
    header.set_gid(SANDBOX_GID as u64);
    header.set_cksum();
    builder
        .append(&header, Cursor::new(content))
        .map_err(|e| io_err(path, e))
}

fn append_directory<W: std::io::Write>(
    builder: &mut Builder<W>,
    path: &str,
) -> Result<(), SandboxError> {
    let mut header = Header::new_ustar();
    header.set_entry_type(EntryType::Directory);
    header
        .set_path(&format!("{path}/"))
        .map_err(|e| io_err(path, e))?;
    header.set_size(0);
    header.set_mode(DIR_MODE);
    header.set_uid(SANDBOX_UID as u64);
    header.set_gid(SANDBOX_GID as u64);
    header.set_cksum();
    builder
        .append(&header, Cursor::new(&[] as &[u8]))
        .map_err(|e| io_err(path, e))
}

fn io_err(path: &str, e: std::io::Error) -> SandboxError {
    SandboxError::BackendError {
        message: format!("failed to append '{path}' to archive: {e}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;
    use tar::Archive;

    fn member_names(bytes: &[u8]) -> Vec<String> {
        let mut archive = Archive::new(Cursor::new(bytes));
        archive
            .entries()
            .unwrap()
            .map(|e| e.unwrap().path().unwrap().to_string_lossy().into_owned())
            .collect()
    }

    #[test]
    fn archive_contains_entrypoint_first() {
        let archive = build_archive("print('hi')", &[], false).unwrap();
        let names = member_names(&archive);
        assert_eq!(names[0], ENTRYPOINT_NAME);
    }

    #[test]
    fn parent_directories_precede_children() {
        let files = vec![StagedFile {
            path: "a/b/input.txt".to_string(),
            content: b"hello".to_vec(),
        }];
        let archive = build_archive("print(1)", &files, false).unwrap();
        let names = member_names(&archive);
        assert_eq!(
            names,
            vec![
                ENTRYPOINT_NAME.to_string(),
                "a/".to_string(),
                "a/b/".to_string(),
                "a/b/input.txt".to_string(),
            ]
        );
    }

    #[test]
    fn rejects_path_colliding_with_entrypoint() {
        let files = vec![StagedFile {
            path: "__main__.py".to_string(),
            content: b"x".to_vec(),
        }];
        let err = build_archive("print(1)", &files, false).unwrap_err();
        assert!(matches!(err, SandboxError::InvalidPath { .. }));
    }

    #[test]
    fn rejects_escaping_path() {
        let files = vec![StagedFile {
            path: "../escape.txt".to_string(),
            content: b"x".to_vec(),
        }];
        assert!(build_archive("print(1)", &files, false).is_err());
    }

    #[test]
    fn file_sizes_and_owner_round_trip() {
        let files = vec![StagedFile {
            path: "data.bin".to_string(),
            content: vec![0xFFu8; 300],
        }];
        let archive = build_archive("print(1)", &files, false).unwrap();
        let mut tar = Archive::new(Cursor::new(&archive));
        for entry in tar.entries().unwrap() {
            let mut entry = entry.unwrap();
            if entry.path().unwrap().to_str() == Some("data.bin") {
                assert_eq!(entry.header().size().unwrap(), 300);
                assert_eq!(entry.header().uid().unwrap(), SANDBOX_UID as u64);
                assert_eq!(entry.header().mode().unwrap(), FILE_MODE);
                let mut buf = Vec::new();
                entry.read_to_end(&mut buf).unwrap();
                assert_eq!(buf, vec![0xFFu8; 300]);
            }
        }
    }
}
