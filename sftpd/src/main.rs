use russh_sftp::protocol::{
    Attrs, Data, File, FileAttributes, Handle, Name, OpenFlags, Status, StatusCode, Version,
};
use std::collections::HashMap;
use std::io::SeekFrom;
use std::os::unix::fs::MetadataExt;
use std::path::{Component, Path, PathBuf};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tracing::{debug, info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Every session is rooted here; the judge bind-mounts the user's inbox at
/// this path.
const ROOT: &str = "/work";
const LISTEN_ADDR: &str = "0.0.0.0:2207";

#[tokio::main]
async fn main() {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .init();

    let listener = TcpListener::bind(LISTEN_ADDR)
        .await
        .expect("Can listen on the SFTP port");
    info!(addr = LISTEN_ADDR, "SFTP server listening");

    // One connection per container: the tunnel dials in exactly once and the
    // container goes away when the session ends.
    let (stream, peer) = listener.accept().await.expect("Can accept the connection");
    info!(peer = %peer, "Client connected");

    russh_sftp::server::run(stream, SftpSession::new(PathBuf::from(ROOT))).await;

    info!("SFTP server exited");
}

/// Cleans a client-supplied path into a virtual absolute path under "/".
/// `..` clamps at the root, so nothing can escape the work directory.
fn normalize_virtual(path: &str) -> PathBuf {
    let mut virt = PathBuf::from("/");
    for component in Path::new(path).components() {
        match component {
            Component::RootDir | Component::Prefix(_) | Component::CurDir => {}
            Component::ParentDir => {
                virt.pop();
            }
            Component::Normal(part) => virt.push(part),
        }
    }
    virt
}

fn status_code_for(e: &std::io::Error) -> StatusCode {
    match e.kind() {
        std::io::ErrorKind::NotFound => StatusCode::NoSuchFile,
        std::io::ErrorKind::PermissionDenied => StatusCode::PermissionDenied,
        _ => StatusCode::Failure,
    }
}

fn attributes_for(meta: &std::fs::Metadata) -> FileAttributes {
    FileAttributes {
        size: Some(meta.len()),
        uid: Some(meta.uid()),
        gid: Some(meta.gid()),
        permissions: Some(meta.mode()),
        atime: Some(meta.atime() as u32),
        mtime: Some(meta.mtime() as u32),
        ..Default::default()
    }
}

enum OpenHandle {
    File(tokio::fs::File),
    /// Directory listing, handed out on the first `readdir`, EOF afterwards.
    Dir(Option<Vec<File>>),
}

struct SftpSession {
    root: PathBuf,
    version: Option<u32>,
    handles: HashMap<String, OpenHandle>,
    next_handle: u64,
}

impl SftpSession {
    fn new(root: PathBuf) -> Self {
        Self {
            root,
            version: None,
            handles: HashMap::new(),
            next_handle: 0,
        }
    }

    /// Maps a client path onto the filesystem, confined under the root.
    fn real_path(&self, path: &str) -> PathBuf {
        let virt = normalize_virtual(path);
        let relative = virt.strip_prefix("/").unwrap_or(&virt);
        self.root.join(relative)
    }

    fn store(&mut self, handle: OpenHandle) -> String {
        let key = format!("h{}", self.next_handle);
        self.next_handle += 1;
        self.handles.insert(key.clone(), handle);
        key
    }

    fn file_mut(&mut self, handle: &str) -> Result<&mut tokio::fs::File, StatusCode> {
        match self.handles.get_mut(handle) {
            Some(OpenHandle::File(file)) => Ok(file),
            _ => Err(StatusCode::BadMessage),
        }
    }

    fn ok_status(id: u32) -> Status {
        Status {
            id,
            status_code: StatusCode::Ok,
            error_message: "Ok".to_string(),
            language_tag: "en-US".to_string(),
        }
    }
}

impl russh_sftp::server::Handler for SftpSession {
    type Error = StatusCode;

    fn unimplemented(&self) -> Self::Error {
        StatusCode::OpUnsupported
    }

    async fn init(
        &mut self,
        version: u32,
        extensions: HashMap<String, String>,
    ) -> Result<Version, Self::Error> {
        if self.version.is_some() {
            warn!("Duplicate SFTP init");
            return Err(StatusCode::ConnectionLost);
        }
        self.version = Some(version);
        debug!(version, ?extensions, "SFTP session initialized");
        Ok(Version::new())
    }

    async fn realpath(&mut self, id: u32, path: String) -> Result<Name, Self::Error> {
        let virt = normalize_virtual(&path);
        Ok(Name {
            id,
            files: vec![File::dummy(virt.to_string_lossy())],
        })
    }

    async fn open(
        &mut self,
        id: u32,
        filename: String,
        pflags: OpenFlags,
        _attrs: FileAttributes,
    ) -> Result<Handle, Self::Error> {
        let path = self.real_path(&filename);
        let mut options = tokio::fs::OpenOptions::new();
        options
            .read(pflags.contains(OpenFlags::READ))
            .write(pflags.contains(OpenFlags::WRITE))
            .append(pflags.contains(OpenFlags::APPEND))
            .create(pflags.contains(OpenFlags::CREATE))
            .truncate(pflags.contains(OpenFlags::TRUNCATE))
            .create_new(pflags.contains(OpenFlags::EXCLUDE));

        let file = options.open(&path).await.map_err(|e| {
            debug!(path = %path.display(), error = %e, "Open failed");
            status_code_for(&e)
        })?;

        Ok(Handle {
            id,
            handle: self.store(OpenHandle::File(file)),
        })
    }

    async fn close(&mut self, id: u32, handle: String) -> Result<Status, Self::Error> {
        self.handles.remove(&handle);
        Ok(Self::ok_status(id))
    }

    async fn read(
        &mut self,
        id: u32,
        handle: String,
        offset: u64,
        len: u32,
    ) -> Result<Data, Self::Error> {
        let file = self.file_mut(&handle)?;
        file.seek(SeekFrom::Start(offset))
            .await
            .map_err(|e| status_code_for(&e))?;

        let mut data = vec![0u8; len as usize];
        let mut filled = 0;
        while filled < data.len() {
            let n = file
                .read(&mut data[filled..])
                .await
                .map_err(|e| status_code_for(&e))?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        if filled == 0 {
            return Err(StatusCode::Eof);
        }
        data.truncate(filled);
        Ok(Data { id, data })
    }

    async fn write(
        &mut self,
        id: u32,
        handle: String,
        offset: u64,
        data: Vec<u8>,
    ) -> Result<Status, Self::Error> {
        let file = self.file_mut(&handle)?;
        file.seek(SeekFrom::Start(offset))
            .await
            .map_err(|e| status_code_for(&e))?;
        file.write_all(&data)
            .await
            .map_err(|e| status_code_for(&e))?;
        Ok(Self::ok_status(id))
    }

    async fn fstat(&mut self, id: u32, handle: String) -> Result<Attrs, Self::Error> {
        let file = self.file_mut(&handle)?;
        let meta = file.metadata().await.map_err(|e| status_code_for(&e))?;
        Ok(Attrs {
            id,
            attrs: attributes_for(&meta),
        })
    }

    async fn stat(&mut self, id: u32, path: String) -> Result<Attrs, Self::Error> {
        let meta = tokio::fs::metadata(self.real_path(&path))
            .await
            .map_err(|e| status_code_for(&e))?;
        Ok(Attrs {
            id,
            attrs: attributes_for(&meta),
        })
    }

    async fn lstat(&mut self, id: u32, path: String) -> Result<Attrs, Self::Error> {
        let meta = tokio::fs::symlink_metadata(self.real_path(&path))
            .await
            .map_err(|e| status_code_for(&e))?;
        Ok(Attrs {
            id,
            attrs: attributes_for(&meta),
        })
    }

    async fn setstat(
        &mut self,
        id: u32,
        _path: String,
        _attrs: FileAttributes,
    ) -> Result<Status, Self::Error> {
        // Uploads keep whatever modes the inbox enforces.
        Ok(Self::ok_status(id))
    }

    async fn fsetstat(
        &mut self,
        id: u32,
        _handle: String,
        _attrs: FileAttributes,
    ) -> Result<Status, Self::Error> {
        Ok(Self::ok_status(id))
    }

    async fn opendir(&mut self, id: u32, path: String) -> Result<Handle, Self::Error> {
        let real = self.real_path(&path);
        let mut reader = tokio::fs::read_dir(&real)
            .await
            .map_err(|e| status_code_for(&e))?;

        let mut files = Vec::new();
        while let Some(entry) = reader.next_entry().await.map_err(|e| status_code_for(&e))? {
            let name = entry.file_name().to_string_lossy().into_owned();
            let attrs = match entry.metadata().await {
                Ok(meta) => attributes_for(&meta),
                Err(_) => FileAttributes::default(),
            };
            files.push(File::new(name, attrs));
        }

        Ok(Handle {
            id,
            handle: self.store(OpenHandle::Dir(Some(files))),
        })
    }

    async fn readdir(&mut self, id: u32, handle: String) -> Result<Name, Self::Error> {
        match self.handles.get_mut(&handle) {
            Some(OpenHandle::Dir(entries)) => match entries.take() {
                Some(files) => Ok(Name { id, files }),
                None => Err(StatusCode::Eof),
            },
            _ => Err(StatusCode::BadMessage),
        }
    }

    async fn mkdir(
        &mut self,
        id: u32,
        path: String,
        _attrs: FileAttributes,
    ) -> Result<Status, Self::Error> {
        tokio::fs::create_dir(self.real_path(&path))
            .await
            .map_err(|e| status_code_for(&e))?;
        Ok(Self::ok_status(id))
    }

    async fn rmdir(&mut self, id: u32, path: String) -> Result<Status, Self::Error> {
        tokio::fs::remove_dir(self.real_path(&path))
            .await
            .map_err(|e| status_code_for(&e))?;
        Ok(Self::ok_status(id))
    }

    async fn remove(&mut self, id: u32, filename: String) -> Result<Status, Self::Error> {
        tokio::fs::remove_file(self.real_path(&filename))
            .await
            .map_err(|e| status_code_for(&e))?;
        Ok(Self::ok_status(id))
    }

    async fn rename(
        &mut self,
        id: u32,
        oldpath: String,
        newpath: String,
    ) -> Result<Status, Self::Error> {
        tokio::fs::rename(self.real_path(&oldpath), self.real_path(&newpath))
            .await
            .map_err(|e| status_code_for(&e))?;
        Ok(Self::ok_status(id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use russh_sftp::server::Handler;

    #[test]
    fn client_paths_cannot_escape_the_root() {
        assert_eq!(normalize_virtual("/"), PathBuf::from("/"));
        assert_eq!(normalize_virtual("foo.txt"), PathBuf::from("/foo.txt"));
        assert_eq!(normalize_virtual("/a/b/../c"), PathBuf::from("/a/c"));
        assert_eq!(normalize_virtual("../../etc/passwd"), PathBuf::from("/etc/passwd"));
        assert_eq!(normalize_virtual("/.."), PathBuf::from("/"));
        assert_eq!(normalize_virtual("./x/./y"), PathBuf::from("/x/y"));
    }

    #[test]
    fn real_paths_stay_under_the_session_root() {
        let session = SftpSession::new(PathBuf::from("/work"));
        assert_eq!(
            session.real_path("../../etc/shadow"),
            PathBuf::from("/work/etc/shadow")
        );
        assert_eq!(session.real_path("/up.txt"), PathBuf::from("/work/up.txt"));
    }

    #[tokio::test]
    async fn upload_then_download_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let mut session = SftpSession::new(dir.path().to_path_buf());

        let open = session
            .open(
                1,
                "/hello.txt".to_string(),
                OpenFlags::WRITE | OpenFlags::CREATE | OpenFlags::TRUNCATE,
                FileAttributes::default(),
            )
            .await
            .unwrap();
        session
            .write(2, open.handle.clone(), 0, b"10\n".to_vec())
            .await
            .unwrap();
        session.close(3, open.handle).await.unwrap();

        assert_eq!(
            std::fs::read(dir.path().join("hello.txt")).unwrap(),
            b"10\n"
        );

        let open = session
            .open(
                4,
                "hello.txt".to_string(),
                OpenFlags::READ,
                FileAttributes::default(),
            )
            .await
            .unwrap();
        let data = session.read(5, open.handle.clone(), 0, 1024).await.unwrap();
        assert_eq!(data.data, b"10\n");
        // Past the end of the file the read reports EOF.
        assert_eq!(
            session.read(6, open.handle.clone(), 3, 1024).await.unwrap_err(),
            StatusCode::Eof
        );
        session.close(7, open.handle).await.unwrap();
    }

    #[tokio::test]
    async fn listing_hands_out_entries_once() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.txt"), b"a").unwrap();
        std::fs::write(dir.path().join("b.txt"), b"b").unwrap();
        let mut session = SftpSession::new(dir.path().to_path_buf());

        let open = session.opendir(1, "/".to_string()).await.unwrap();
        let name = session.readdir(2, open.handle.clone()).await.unwrap();
        assert_eq!(name.files.len(), 2);

        assert_eq!(
            session.readdir(3, open.handle.clone()).await.unwrap_err(),
            StatusCode::Eof
        );
    }

    #[tokio::test]
    async fn missing_files_report_no_such_file() {
        let dir = tempfile::tempdir().unwrap();
        let mut session = SftpSession::new(dir.path().to_path_buf());
        assert_eq!(
            session.stat(1, "/nope".to_string()).await.unwrap_err(),
            StatusCode::NoSuchFile
        );
    }
}
