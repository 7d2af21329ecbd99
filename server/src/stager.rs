use md5::{Digest, Md5};
use snafu::{ResultExt, Snafu};
use std::fs::{DirBuilder, File};
use std::io::{Read, Write};
use std::os::unix::fs::{chown, DirBuilderExt, PermissionsExt};
use std::path::{Path, PathBuf};
use tracing::info;

use crate::problem::SubmitEntry;
use crate::types::SubmittedFile;

#[derive(Debug, Snafu)]
pub enum StageError {
    #[snafu(display("Could not create directory `{}`", path.display()))]
    CreateDir {
        path: PathBuf,
        source: std::io::Error,
    },
    #[snafu(display("Could not change ownership of `{}`", path.display()))]
    Chown {
        path: PathBuf,
        source: std::io::Error,
    },
    #[snafu(display("Could not copy submit file `{path}`"))]
    CopyFile {
        path: String,
        source: std::io::Error,
    },
    #[snafu(display("Could not walk submit dir `{path}`"))]
    WalkDir {
        path: String,
        source: walkdir::Error,
    },
}

impl StageError {
    /// The line shown to the submitting user. Identifies the offending path.
    pub fn user_message(&self) -> String {
        match self {
            Self::CopyFile { path, .. } => format!("failed to copy submit file {path}"),
            Self::WalkDir { path, .. } => format!("failed to copy submit dir {path}"),
            Self::CreateDir { path, .. } | Self::Chown { path, .. } => {
                format!("failed to prepare submit dir {}", path.display())
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct StagedDirs {
    pub root: PathBuf,
    pub submits: PathBuf,
    pub work: PathBuf,
}

/// Creates the per-submission tree: `<root>`, `<root>/submits` (the inputs,
/// later mounted read-only) and `<root>/work` (mutable), all mode 0700 and
/// owned by the judge uid/gid.
pub fn create_dirs(root: &Path, uid: u32, gid: u32) -> Result<StagedDirs, StageError> {
    let submits = root.join("submits");
    let work = root.join("work");
    for dir in [root, &submits, &work] {
        make_owned_dir(dir, uid, gid)?;
    }
    Ok(StagedDirs {
        root: root.to_path_buf(),
        submits,
        work,
    })
}

/// Copies every required submit entry from the user inbox into the staging
/// tree, hashing each file on the way. The first failure aborts; whatever
/// was staged already is left on disk for inspection.
pub fn stage_files(
    inbox: &Path,
    submits: &Path,
    entries: &[SubmitEntry],
    uid: u32,
    gid: u32,
) -> Result<Vec<SubmittedFile>, StageError> {
    let mut files = Vec::new();

    for entry in entries {
        if entry.is_dir {
            stage_dir(inbox, submits, &entry.path, uid, gid, &mut files)?;
        } else {
            files.push(stage_file(inbox, submits, &entry.path, uid, gid)?);
        }
    }

    Ok(files)
}

fn stage_dir(
    inbox: &Path,
    submits: &Path,
    dir: &str,
    uid: u32,
    gid: u32,
    files: &mut Vec<SubmittedFile>,
) -> Result<(), StageError> {
    let src_root = inbox.join(dir);

    for step in walkdir::WalkDir::new(&src_root) {
        let step = step.context(WalkDirSnafu { path: dir })?;
        if !step.file_type().is_file() {
            continue;
        }
        let relative = step
            .path()
            .strip_prefix(&src_root)
            .expect("walked path is under its root");
        let path = Path::new(dir).join(relative);
        let path = path.to_string_lossy().into_owned();
        files.push(stage_file(inbox, submits, &path, uid, gid)?);
    }

    Ok(())
}

fn stage_file(
    inbox: &Path,
    submits: &Path,
    path: &str,
    uid: u32,
    gid: u32,
) -> Result<SubmittedFile, StageError> {
    let src = inbox.join(path);
    let dst = submits.join(path);

    if let Some(parent) = dst.parent() {
        ensure_dir_chain(submits, parent, uid, gid)?;
    }

    let hash = copy_hashed(&src, &dst).context(CopyFileSnafu { path })?;

    // Inputs are read-only for everyone once staged.
    std::fs::set_permissions(&dst, std::fs::Permissions::from_mode(0o400))
        .context(CopyFileSnafu { path })?;
    chown(&dst, Some(uid), Some(gid)).context(ChownSnafu { path: dst.clone() })?;

    info!(src = %src.display(), dst = %dst.display(), %hash, "Staged submit file");

    Ok(SubmittedFile {
        path: path.to_string(),
        hash,
    })
}

/// Creates every missing directory between `base` and `target` (inclusive),
/// each mode 0700 and chowned.
fn ensure_dir_chain(base: &Path, target: &Path, uid: u32, gid: u32) -> Result<(), StageError> {
    let relative = match target.strip_prefix(base) {
        Ok(relative) => relative,
        Err(_) => return Ok(()),
    };

    let mut current = base.to_path_buf();
    for component in relative.components() {
        current.push(component);
        if !current.exists() {
            make_owned_dir(&current, uid, gid)?;
        }
    }
    Ok(())
}

/// Creates (if missing) and chowns a single directory, mode 0700. Also used
/// for the per-user SFTP inboxes.
pub fn ensure_owned_dir(path: &Path, uid: u32, gid: u32) -> Result<(), StageError> {
    make_owned_dir(path, uid, gid)
}

fn make_owned_dir(path: &Path, uid: u32, gid: u32) -> Result<(), StageError> {
    if !path.exists() {
        DirBuilder::new()
            .recursive(true)
            .mode(0o700)
            .create(path)
            .context(CreateDirSnafu { path })?;
    }
    chown(path, Some(uid), Some(gid)).context(ChownSnafu { path })?;
    Ok(())
}

/// Streams `src` into `dst`, computing the MD5 of the bytes as they pass.
fn copy_hashed(src: &Path, dst: &Path) -> std::io::Result<String> {
    let mut reader = File::open(src)?;
    let mut writer = File::create(dst)?;
    let mut hasher = Md5::new();
    let mut buf = [0u8; 64 * 1024];

    loop {
        let n = reader.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
        writer.write_all(&buf[..n])?;
    }
    writer.sync_all()?;

    Ok(hex::encode(hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::MetadataExt;

    fn owner_of(path: &Path) -> (u32, u32) {
        let meta = std::fs::metadata(path).unwrap();
        (meta.uid(), meta.gid())
    }

    #[test]
    fn stages_a_single_file_with_hash_and_mode() {
        let tmp = tempfile::tempdir().unwrap();
        let inbox = tmp.path().join("inbox");
        let submits = tmp.path().join("submits");
        std::fs::create_dir_all(&inbox).unwrap();
        std::fs::write(inbox.join("hello.txt"), b"10\n").unwrap();
        std::fs::create_dir_all(&submits).unwrap();
        let (uid, gid) = owner_of(tmp.path());

        let entries = [SubmitEntry {
            path: "hello.txt".to_string(),
            is_dir: false,
        }];
        let files = stage_files(&inbox, &submits, &entries, uid, gid).unwrap();

        assert_eq!(files.len(), 1);
        assert_eq!(files[0].path, "hello.txt");
        // md5 of "10\n"
        assert_eq!(files[0].hash, "31d30eea8d0968d6458e0ad0027c9f80");

        let staged = submits.join("hello.txt");
        assert_eq!(std::fs::read(&staged).unwrap(), b"10\n");
        let mode = std::fs::metadata(&staged).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o400);
    }

    #[test]
    fn stages_a_directory_recursively() {
        let tmp = tempfile::tempdir().unwrap();
        let inbox = tmp.path().join("inbox");
        let submits = tmp.path().join("submits");
        std::fs::create_dir_all(inbox.join("src/deep")).unwrap();
        std::fs::create_dir_all(&submits).unwrap();
        std::fs::write(inbox.join("src/main.c"), b"int main(){}\n").unwrap();
        std::fs::write(inbox.join("src/deep/util.c"), b"// util\n").unwrap();
        let (uid, gid) = owner_of(tmp.path());

        let entries = [SubmitEntry {
            path: "src".to_string(),
            is_dir: true,
        }];
        let mut files = stage_files(&inbox, &submits, &entries, uid, gid).unwrap();
        files.sort_by(|a, b| a.path.cmp(&b.path));

        let paths: Vec<&str> = files.iter().map(|f| f.path.as_str()).collect();
        assert_eq!(paths, ["src/deep/util.c", "src/main.c"]);
        assert!(submits.join("src/deep/util.c").exists());

        let dir_mode = std::fs::metadata(submits.join("src"))
            .unwrap()
            .permissions()
            .mode();
        assert_eq!(dir_mode & 0o777, 0o700);
    }

    #[test]
    fn missing_file_aborts_with_the_offending_path() {
        let tmp = tempfile::tempdir().unwrap();
        let inbox = tmp.path().join("inbox");
        let submits = tmp.path().join("submits");
        std::fs::create_dir_all(&inbox).unwrap();
        std::fs::create_dir_all(&submits).unwrap();
        let (uid, gid) = owner_of(tmp.path());

        let entries = [SubmitEntry {
            path: "main.cpp".to_string(),
            is_dir: false,
        }];
        let err = stage_files(&inbox, &submits, &entries, uid, gid).unwrap_err();
        assert_eq!(err.user_message(), "failed to copy submit file main.cpp");
    }

    #[test]
    fn create_dirs_builds_the_three_level_tree() {
        let tmp = tempfile::tempdir().unwrap();
        let (uid, gid) = owner_of(tmp.path());
        let dirs = create_dirs(&tmp.path().join("1234-u1"), uid, gid).unwrap();
        assert!(dirs.root.is_dir());
        assert!(dirs.submits.is_dir());
        assert!(dirs.work.is_dir());
        let mode = std::fs::metadata(&dirs.work).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o700);
    }
}
