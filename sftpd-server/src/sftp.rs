//! SFTP subsystem engine.
//!
//! [`SftpEngine`] runs the russh-sftp protocol loop over a channel stream with
//! [`FsBackend`] answering requests from the local filesystem. Client paths
//! are virtual: `/` maps to the configured root directory, and `..` never
//! climbs above it.

use crate::config::SftpConfig;
use crate::dispatch::SFTP_SUBSYSTEM;
use crate::stream::{StreamEnd, TrackedStream};
use crate::subsystem::{EngineOutcome, SubsystemEngine, SubsystemError};
use async_trait::async_trait;
use russh_sftp::protocol::{
    Attrs, Data, File, FileAttributes, Handle, Name, OpenFlags, Status, StatusCode, Version,
};
use std::collections::HashMap;
use std::io::{self, SeekFrom};
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncSeekExt, AsyncWrite, AsyncWriteExt};

/// Engine serving the `sftp` subsystem from a directory tree.
#[derive(Debug, Clone)]
pub struct SftpEngine {
    config: SftpConfig,
}

impl SftpEngine {
    pub fn new(config: SftpConfig) -> Self {
        Self { config }
    }
}

impl SubsystemEngine for SftpEngine {
    fn name(&self) -> &'static str {
        SFTP_SUBSYSTEM
    }

    async fn serve<S>(&self, stream: S) -> Result<EngineOutcome, SubsystemError>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let backend = FsBackend::open(&self.config)
            .await
            .map_err(|e| SubsystemError::Start(format!("{}: {}", self.config.root_dir.display(), e)))?;

        let (stream, ended) = TrackedStream::new(stream);
        russh_sftp::server::run(stream, backend).await;

        match ended.await {
            Ok(StreamEnd::Eof) => Ok(EngineOutcome::EndOfStream),
            Ok(StreamEnd::Error(e)) => Err(SubsystemError::Io(e)),
            Ok(StreamEnd::Released) | Err(_) => Ok(EngineOutcome::Completed),
        }
    }
}

enum OpenHandle {
    File { file: fs::File, path: PathBuf },
    Dir { path: PathBuf, listed: bool },
}

/// Filesystem-backed request handler for one SFTP session.
pub struct FsBackend {
    root: PathBuf,
    read_only: bool,
    max_read_size: u32,
    handles: HashMap<String, OpenHandle>,
    next_handle: u64,
}

impl FsBackend {
    /// Opens a backend rooted at the configured directory.
    pub async fn open(config: &SftpConfig) -> io::Result<Self> {
        let root = fs::canonicalize(&config.root_dir).await?;
        if !fs::metadata(&root).await?.is_dir() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "root is not a directory",
            ));
        }
        Ok(Self {
            root,
            read_only: config.read_only,
            max_read_size: config.max_read_size,
            handles: HashMap::new(),
            next_handle: 0,
        })
    }

    /// Maps a client path onto the local filesystem.
    pub fn resolve(&self, path: &str) -> PathBuf {
        let virtual_path = normalize(path);
        self.root.join(virtual_path.trim_start_matches('/'))
    }

    /// Maps a local path back to a client path, if it lies under the root.
    fn to_virtual(&self, local: &Path) -> Option<String> {
        local
            .strip_prefix(&self.root)
            .ok()
            .map(|rest| normalize(&rest.to_string_lossy()))
    }

    /// Resolves a symlink target. Relative targets are taken from the link's
    /// directory in client space, so neither form can leave the root.
    #[cfg(unix)]
    fn link_target(&self, linkpath: &str, targetpath: &str) -> PathBuf {
        if targetpath.starts_with('/') {
            return self.resolve(targetpath);
        }
        let link = normalize(linkpath);
        let parent = link.rsplit_once('/').map_or("", |(parent, _)| parent);
        self.resolve(&format!("{}/{}", parent, targetpath))
    }

    fn insert(&mut self, handle: OpenHandle) -> String {
        self.next_handle += 1;
        let key = format!("h{}", self.next_handle);
        self.handles.insert(key.clone(), handle);
        key
    }

    fn writable(&self) -> Result<(), StatusCode> {
        if self.read_only {
            Err(StatusCode::PermissionDenied)
        } else {
            Ok(())
        }
    }

    async fn apply_attrs(path: &Path, attrs: &FileAttributes) -> io::Result<()> {
        if let Some(size) = attrs.size {
            let file = fs::OpenOptions::new().write(true).open(path).await?;
            file.set_len(size).await?;
        }
        if let Some(mode) = attrs.permissions {
            set_mode(path, mode).await?;
        }
        Ok(())
    }
}

#[cfg(unix)]
async fn set_mode(path: &Path, mode: u32) -> io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, std::fs::Permissions::from_mode(mode & 0o7777)).await
}

#[cfg(not(unix))]
async fn set_mode(path: &Path, mode: u32) -> io::Result<()> {
    let mut permissions = fs::metadata(path).await?.permissions();
    permissions.set_readonly(mode & 0o200 == 0);
    fs::set_permissions(path, permissions).await
}

/// Normalizes a client path to an absolute virtual path.
pub fn normalize(path: &str) -> String {
    let mut parts: Vec<&str> = Vec::new();
    for part in path.split('/') {
        match part {
            "" | "." => {}
            ".." => {
                parts.pop();
            }
            p => parts.push(p),
        }
    }
    format!("/{}", parts.join("/"))
}

fn status_code(err: &io::Error) -> StatusCode {
    match err.kind() {
        io::ErrorKind::NotFound => StatusCode::NoSuchFile,
        io::ErrorKind::PermissionDenied => StatusCode::PermissionDenied,
        _ => StatusCode::Failure,
    }
}

fn io_status(err: io::Error) -> StatusCode {
    tracing::debug!("sftp request failed: {}", err);
    status_code(&err)
}

fn ok(id: u32) -> Status {
    Status {
        id,
        status_code: StatusCode::Ok,
        error_message: "Ok".to_string(),
        language_tag: "en-US".to_string(),
    }
}

/// Converts a Unix timestamp to the protocol's 32-bit field, omitting
/// values it cannot carry.
fn wire_time(secs: i64) -> Option<u32> {
    u32::try_from(secs).ok()
}

#[cfg(unix)]
fn attributes(meta: &std::fs::Metadata) -> FileAttributes {
    use std::os::unix::fs::MetadataExt;
    FileAttributes {
        size: Some(meta.len()),
        uid: Some(meta.uid()),
        gid: Some(meta.gid()),
        permissions: Some(meta.mode()),
        atime: wire_time(meta.atime()),
        mtime: wire_time(meta.mtime()),
        ..Default::default()
    }
}

#[cfg(not(unix))]
fn attributes(meta: &std::fs::Metadata) -> FileAttributes {
    let kind = if meta.is_dir() { 0o040000 } else { 0o100000 };
    let mode = if meta.permissions().readonly() { 0o444 } else { 0o644 };
    FileAttributes {
        size: Some(meta.len()),
        permissions: Some(kind | mode),
        ..Default::default()
    }
}

/// Renders an `ls -l` style line for directory listings.
fn long_name(name: &str, attrs: &FileAttributes) -> String {
    let mode = attrs.permissions.unwrap_or(0);
    let kind = match mode & 0o170000 {
        0o040000 => 'd',
        0o120000 => 'l',
        _ => '-',
    };
    let mut perms = String::with_capacity(10);
    perms.push(kind);
    for shift in [6, 3, 0] {
        let bits = (mode >> shift) & 0o7;
        perms.push(if bits & 0o4 != 0 { 'r' } else { '-' });
        perms.push(if bits & 0o2 != 0 { 'w' } else { '-' });
        perms.push(if bits & 0o1 != 0 { 'x' } else { '-' });
    }
    format!(
        "{} 1 {} {} {} {} {}",
        perms,
        attrs.uid.unwrap_or(0),
        attrs.gid.unwrap_or(0),
        attrs.size.unwrap_or(0),
        attrs.mtime.unwrap_or(0),
        name
    )
}

#[async_trait]
impl russh_sftp::server::Handler for FsBackend {
    type Error = StatusCode;

    fn unimplemented(&self) -> Self::Error {
        StatusCode::OpUnsupported
    }

    async fn init(
        &mut self,
        version: u32,
        _extensions: HashMap<String, String>,
    ) -> Result<Version, Self::Error> {
        tracing::debug!("sftp client version {}", version);
        Ok(Version::new())
    }

    async fn open(
        &mut self,
        id: u32,
        filename: String,
        pflags: OpenFlags,
        _attrs: FileAttributes,
    ) -> Result<Handle, Self::Error> {
        let mutating = pflags.intersects(
            OpenFlags::WRITE | OpenFlags::APPEND | OpenFlags::CREATE | OpenFlags::TRUNCATE,
        );
        if mutating {
            self.writable()?;
        }

        let path = self.resolve(&filename);
        let mut options = fs::OpenOptions::new();
        options
            .read(pflags.contains(OpenFlags::READ))
            .write(pflags.contains(OpenFlags::WRITE))
            .append(pflags.contains(OpenFlags::APPEND));
        if pflags.contains(OpenFlags::CREATE) {
            if pflags.contains(OpenFlags::EXCLUDE) {
                options.create_new(true);
            } else {
                options.create(true);
            }
        }
        if pflags.contains(OpenFlags::TRUNCATE) {
            options.truncate(true);
        }

        let file = options.open(&path).await.map_err(io_status)?;
        let handle = self.insert(OpenHandle::File { file, path });
        Ok(Handle { id, handle })
    }

    async fn close(&mut self, id: u32, handle: String) -> Result<Status, Self::Error> {
        match self.handles.remove(&handle) {
            Some(OpenHandle::File { mut file, .. }) => {
                file.flush().await.map_err(io_status)?;
                Ok(ok(id))
            }
            Some(OpenHandle::Dir { .. }) => Ok(ok(id)),
            None => Err(StatusCode::Failure),
        }
    }

    async fn read(
        &mut self,
        id: u32,
        handle: String,
        offset: u64,
        len: u32,
    ) -> Result<Data, Self::Error> {
        let len = len.min(self.max_read_size) as usize;
        let Some(OpenHandle::File { file, .. }) = self.handles.get_mut(&handle) else {
            return Err(StatusCode::Failure);
        };

        file.seek(SeekFrom::Start(offset)).await.map_err(io_status)?;
        let mut data = vec![0u8; len];
        let mut filled = 0;
        while filled < len {
            let n = file.read(&mut data[filled..]).await.map_err(io_status)?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        if filled == 0 && len > 0 {
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
        self.writable()?;
        let Some(OpenHandle::File { file, .. }) = self.handles.get_mut(&handle) else {
            return Err(StatusCode::Failure);
        };

        file.seek(SeekFrom::Start(offset)).await.map_err(io_status)?;
        file.write_all(&data).await.map_err(io_status)?;
        file.flush().await.map_err(io_status)?;
        Ok(ok(id))
    }

    async fn lstat(&mut self, id: u32, path: String) -> Result<Attrs, Self::Error> {
        let meta = fs::symlink_metadata(self.resolve(&path))
            .await
            .map_err(io_status)?;
        Ok(Attrs {
            id,
            attrs: attributes(&meta),
        })
    }

    async fn stat(&mut self, id: u32, path: String) -> Result<Attrs, Self::Error> {
        let meta = fs::metadata(self.resolve(&path)).await.map_err(io_status)?;
        Ok(Attrs {
            id,
            attrs: attributes(&meta),
        })
    }

    async fn fstat(&mut self, id: u32, handle: String) -> Result<Attrs, Self::Error> {
        let meta = match self.handles.get(&handle) {
            Some(OpenHandle::File { file, .. }) => file.metadata().await,
            Some(OpenHandle::Dir { path, .. }) => fs::metadata(path).await,
            None => return Err(StatusCode::Failure),
        }
        .map_err(io_status)?;
        Ok(Attrs {
            id,
            attrs: attributes(&meta),
        })
    }

    async fn setstat(
        &mut self,
        id: u32,
        path: String,
        attrs: FileAttributes,
    ) -> Result<Status, Self::Error> {
        self.writable()?;
        Self::apply_attrs(&self.resolve(&path), &attrs)
            .await
            .map_err(io_status)?;
        Ok(ok(id))
    }

    async fn fsetstat(
        &mut self,
        id: u32,
        handle: String,
        attrs: FileAttributes,
    ) -> Result<Status, Self::Error> {
        self.writable()?;
        let path = match self.handles.get(&handle) {
            Some(OpenHandle::File { path, .. }) | Some(OpenHandle::Dir { path, .. }) => path.clone(),
            None => return Err(StatusCode::Failure),
        };
        Self::apply_attrs(&path, &attrs).await.map_err(io_status)?;
        Ok(ok(id))
    }

    async fn opendir(&mut self, id: u32, path: String) -> Result<Handle, Self::Error> {
        let path = self.resolve(&path);
        let meta = fs::metadata(&path).await.map_err(io_status)?;
        if !meta.is_dir() {
            return Err(StatusCode::Failure);
        }
        let handle = self.insert(OpenHandle::Dir {
            path,
            listed: false,
        });
        Ok(Handle { id, handle })
    }

    async fn readdir(&mut self, id: u32, handle: String) -> Result<Name, Self::Error> {
        let path = match self.handles.get_mut(&handle) {
            Some(OpenHandle::Dir { path, listed }) => {
                if *listed {
                    return Err(StatusCode::Eof);
                }
                *listed = true;
                path.clone()
            }
            _ => return Err(StatusCode::Failure),
        };

        let mut entries = fs::read_dir(&path).await.map_err(io_status)?;
        let mut files = Vec::new();
        while let Some(entry) = entries.next_entry().await.map_err(io_status)? {
            let meta = match fs::symlink_metadata(entry.path()).await {
                Ok(meta) => meta,
                Err(e) => {
                    tracing::debug!("skipping {}: {}", entry.path().display(), e);
                    continue;
                }
            };
            let filename = entry.file_name().to_string_lossy().into_owned();
            let attrs = attributes(&meta);
            files.push(File {
                longname: long_name(&filename, &attrs),
                filename,
                attrs,
            });
        }
        files.sort_by(|a, b| a.filename.cmp(&b.filename));
        Ok(Name { id, files })
    }

    async fn remove(&mut self, id: u32, filename: String) -> Result<Status, Self::Error> {
        self.writable()?;
        fs::remove_file(self.resolve(&filename))
            .await
            .map_err(io_status)?;
        Ok(ok(id))
    }

    async fn mkdir(
        &mut self,
        id: u32,
        path: String,
        attrs: FileAttributes,
    ) -> Result<Status, Self::Error> {
        self.writable()?;
        let path = self.resolve(&path);
        fs::create_dir(&path).await.map_err(io_status)?;
        if attrs.permissions.is_some() {
            let mode_only = FileAttributes {
                permissions: attrs.permissions,
                ..Default::default()
            };
            Self::apply_attrs(&path, &mode_only)
                .await
                .map_err(io_status)?;
        }
        Ok(ok(id))
    }

    async fn rmdir(&mut self, id: u32, path: String) -> Result<Status, Self::Error> {
        self.writable()?;
        fs::remove_dir(self.resolve(&path))
            .await
            .map_err(io_status)?;
        Ok(ok(id))
    }

    async fn realpath(&mut self, id: u32, path: String) -> Result<Name, Self::Error> {
        let normalized = normalize(&path);
        Ok(Name {
            id,
            files: vec![File {
                filename: normalized.clone(),
                longname: normalized,
                attrs: FileAttributes::default(),
            }],
        })
    }

    async fn rename(
        &mut self,
        id: u32,
        oldpath: String,
        newpath: String,
    ) -> Result<Status, Self::Error> {
        self.writable()?;
        fs::rename(self.resolve(&oldpath), self.resolve(&newpath))
            .await
            .map_err(io_status)?;
        Ok(ok(id))
    }

    async fn readlink(&mut self, id: u32, path: String) -> Result<Name, Self::Error> {
        let target = fs::read_link(self.resolve(&path))
            .await
            .map_err(io_status)?;
        let target = if target.is_absolute() {
            self.to_virtual(&target).ok_or_else(|| {
                tracing::debug!("link {} points outside the root", path);
                StatusCode::PermissionDenied
            })?
        } else {
            target.to_string_lossy().into_owned()
        };
        Ok(Name {
            id,
            files: vec![File {
                filename: target.clone(),
                longname: target,
                attrs: FileAttributes::default(),
            }],
        })
    }

    #[cfg(unix)]
    async fn symlink(
        &mut self,
        id: u32,
        linkpath: String,
        targetpath: String,
    ) -> Result<Status, Self::Error> {
        self.writable()?;
        let target = self.link_target(&linkpath, &targetpath);
        fs::symlink(target, self.resolve(&linkpath))
            .await
            .map_err(io_status)?;
        Ok(ok(id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use russh_sftp::server::Handler;
    use tempfile::TempDir;

    async fn backend(dir: &TempDir, read_only: bool) -> FsBackend {
        let config = SftpConfig {
            root_dir: dir.path().to_path_buf(),
            read_only,
            max_read_size: 16,
        };
        FsBackend::open(&config).await.unwrap()
    }

    fn flags(f: &[OpenFlags]) -> OpenFlags {
        f.iter().fold(OpenFlags::empty(), |acc, x| acc | *x)
    }

    #[test]
    fn test_normalize() {
        assert_eq!(normalize(""), "/");
        assert_eq!(normalize("."), "/");
        assert_eq!(normalize("/"), "/");
        assert_eq!(normalize("a/b"), "/a/b");
        assert_eq!(normalize("/a/./b/../c/"), "/a/c");
        assert_eq!(normalize("../../etc/passwd"), "/etc/passwd");
        assert_eq!(normalize("//a//b"), "/a/b");
    }

    #[test]
    fn test_long_name() {
        let attrs = FileAttributes {
            size: Some(42),
            permissions: Some(0o040755),
            ..Default::default()
        };
        let line = long_name("docs", &attrs);
        assert!(line.starts_with("drwxr-xr-x"));
        assert!(line.ends_with(" docs"));
        assert!(line.contains(" 42 "));
    }

    #[tokio::test]
    async fn test_resolve_stays_under_root() {
        let dir = TempDir::new().unwrap();
        let fs = backend(&dir, false).await;
        let root = std::fs::canonicalize(dir.path()).unwrap();

        assert_eq!(fs.resolve("/"), root);
        assert_eq!(fs.resolve("../../etc/passwd"), root.join("etc/passwd"));
        assert!(fs.resolve("/a/../../..").starts_with(&root));
    }

    #[tokio::test]
    async fn test_missing_root_fails_to_open() {
        let config = SftpConfig {
            root_dir: PathBuf::from("/no/such/sftp/root"),
            ..Default::default()
        };
        assert!(FsBackend::open(&config).await.is_err());
    }

    #[tokio::test]
    async fn test_write_then_read() {
        let dir = TempDir::new().unwrap();
        let mut fs = backend(&dir, false).await;

        let handle = fs
            .open(
                1,
                "/hello.txt".into(),
                flags(&[OpenFlags::WRITE, OpenFlags::CREATE, OpenFlags::TRUNCATE]),
                FileAttributes::default(),
            )
            .await
            .unwrap();
        assert_eq!(handle.id, 1);
        fs.write(2, handle.handle.clone(), 0, b"hello world".to_vec())
            .await
            .unwrap();
        fs.close(3, handle.handle).await.unwrap();

        assert_eq!(
            std::fs::read(dir.path().join("hello.txt")).unwrap(),
            b"hello world"
        );

        let handle = fs
            .open(4, "hello.txt".into(), OpenFlags::READ, FileAttributes::default())
            .await
            .unwrap();
        let data = fs.read(5, handle.handle.clone(), 6, 100).await.unwrap();
        assert_eq!(data.id, 5);
        assert_eq!(data.data, b"world");

        let eof = fs.read(6, handle.handle.clone(), 11, 100).await.unwrap_err();
        assert!(matches!(eof, StatusCode::Eof));
        fs.close(7, handle.handle).await.unwrap();
    }

    #[tokio::test]
    async fn test_read_is_capped() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("big"), vec![7u8; 64]).unwrap();
        let mut fs = backend(&dir, false).await;

        let handle = fs
            .open(1, "/big".into(), OpenFlags::READ, FileAttributes::default())
            .await
            .unwrap();
        let data = fs.read(2, handle.handle, 0, 64).await.unwrap();
        assert_eq!(data.data.len(), 16);
    }

    #[tokio::test]
    async fn test_exclusive_create_fails_on_existing() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("taken"), b"x").unwrap();
        let mut fs = backend(&dir, false).await;

        let err = fs
            .open(
                1,
                "/taken".into(),
                flags(&[OpenFlags::WRITE, OpenFlags::CREATE, OpenFlags::EXCLUDE]),
                FileAttributes::default(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, StatusCode::Failure));
    }

    #[tokio::test]
    async fn test_readdir_lists_once_then_eof() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("b.txt"), b"b").unwrap();
        std::fs::write(dir.path().join("a.txt"), b"a").unwrap();
        std::fs::create_dir(dir.path().join("sub")).unwrap();
        let mut fs = backend(&dir, false).await;

        let handle = fs.opendir(1, "/".into()).await.unwrap();
        let listing = fs.readdir(2, handle.handle.clone()).await.unwrap();
        let names: Vec<&str> = listing.files.iter().map(|f| f.filename.as_str()).collect();
        assert_eq!(names, vec!["a.txt", "b.txt", "sub"]);
        assert!(listing.files[2].longname.starts_with('d'));

        let eof = fs.readdir(3, handle.handle.clone()).await.unwrap_err();
        assert!(matches!(eof, StatusCode::Eof));
        fs.close(4, handle.handle).await.unwrap();
    }

    #[tokio::test]
    async fn test_opendir_on_file_fails() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("f"), b"").unwrap();
        let mut fs = backend(&dir, false).await;
        assert!(fs.opendir(1, "/f".into()).await.is_err());
        let missing = fs.opendir(2, "/nope".into()).await.unwrap_err();
        assert!(matches!(missing, StatusCode::NoSuchFile));
    }

    #[tokio::test]
    async fn test_directory_lifecycle() {
        let dir = TempDir::new().unwrap();
        let mut fs = backend(&dir, false).await;

        fs.mkdir(1, "/docs".into(), FileAttributes::default())
            .await
            .unwrap();
        let attrs = fs.stat(2, "/docs".into()).await.unwrap();
        assert_eq!(attrs.attrs.permissions.unwrap() & 0o170000, 0o040000);

        fs.rename(3, "/docs".into(), "/papers".into()).await.unwrap();
        assert!(dir.path().join("papers").is_dir());

        fs.rmdir(4, "/papers".into()).await.unwrap();
        let gone = fs.stat(5, "/papers".into()).await.unwrap_err();
        assert!(matches!(gone, StatusCode::NoSuchFile));
    }

    #[tokio::test]
    async fn test_setstat_truncates() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("log"), b"0123456789").unwrap();
        let mut fs = backend(&dir, false).await;

        let attrs = FileAttributes {
            size: Some(4),
            ..Default::default()
        };
        fs.setstat(1, "/log".into(), attrs).await.unwrap();
        assert_eq!(std::fs::read(dir.path().join("log")).unwrap(), b"0123");
    }

    #[tokio::test]
    async fn test_remove_file() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("tmp"), b"x").unwrap();
        let mut fs = backend(&dir, false).await;

        fs.remove(1, "/tmp".into()).await.unwrap();
        assert!(!dir.path().join("tmp").exists());
        let again = fs.remove(2, "/tmp".into()).await.unwrap_err();
        assert!(matches!(again, StatusCode::NoSuchFile));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_symlink_roundtrip_is_virtual() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("target"), b"x").unwrap();
        let mut fs = backend(&dir, false).await;

        fs.symlink(1, "/link".into(), "/target".into()).await.unwrap();
        let name = fs.readlink(2, "/link".into()).await.unwrap();
        assert_eq!(name.files[0].filename, "/target");

        let lstat = fs.lstat(3, "/link".into()).await.unwrap();
        assert_eq!(lstat.attrs.permissions.unwrap() & 0o170000, 0o120000);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_relative_symlink_stays_under_root() {
        let outer = TempDir::new().unwrap();
        let root = outer.path().join("root");
        std::fs::create_dir(&root).unwrap();
        std::fs::write(outer.path().join("secret.txt"), b"outside-root").unwrap();
        std::fs::write(root.join("secret.txt"), b"inside").unwrap();
        let config = SftpConfig {
            root_dir: root.clone(),
            read_only: false,
            max_read_size: 64,
        };
        let mut fs = FsBackend::open(&config).await.unwrap();

        fs.symlink(1, "/link".into(), "../secret.txt".into())
            .await
            .unwrap();
        let name = fs.readlink(2, "/link".into()).await.unwrap();
        assert_eq!(name.files[0].filename, "/secret.txt");

        let handle = fs
            .open(3, "/link".into(), flags(&[OpenFlags::READ]), FileAttributes::default())
            .await
            .unwrap()
            .handle;
        let data = fs.read(4, handle, 0, 64).await.unwrap();
        assert_eq!(data.data, b"inside");

        std::fs::create_dir(root.join("sub")).unwrap();
        fs.symlink(5, "/sub/up".into(), "../../../secret.txt".into())
            .await
            .unwrap();
        let name = fs.readlink(6, "/sub/up".into()).await.unwrap();
        assert_eq!(name.files[0].filename, "/secret.txt");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_readlink_outside_root_fails() {
        let outer = TempDir::new().unwrap();
        let root = outer.path().join("root");
        std::fs::create_dir(&root).unwrap();
        let secret = outer.path().join("secret.txt");
        std::fs::write(&secret, b"outside-root").unwrap();
        std::os::unix::fs::symlink(&secret, root.join("escape")).unwrap();
        let config = SftpConfig {
            root_dir: root,
            read_only: false,
            max_read_size: 64,
        };
        let mut fs = FsBackend::open(&config).await.unwrap();

        let err = fs.readlink(1, "/escape".into()).await.unwrap_err();
        assert!(matches!(err, StatusCode::PermissionDenied));
    }

    #[test]
    fn test_wire_time_omits_out_of_range() {
        assert_eq!(wire_time(0), Some(0));
        assert_eq!(wire_time(1_700_000_000), Some(1_700_000_000));
        assert_eq!(wire_time(-1), None);
        assert_eq!(wire_time(i64::from(u32::MAX) + 1), None);
    }

    #[tokio::test]
    async fn test_realpath() {
        let dir = TempDir::new().unwrap();
        let mut fs = backend(&dir, false).await;
        let name = fs.realpath(1, ".".into()).await.unwrap();
        assert_eq!(name.files[0].filename, "/");
        let name = fs.realpath(2, "a/../b/./c".into()).await.unwrap();
        assert_eq!(name.files[0].filename, "/b/c");
    }

    #[tokio::test]
    async fn test_read_only_denies_mutation() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("keep"), b"x").unwrap();
        let mut fs = backend(&dir, true).await;

        let err = fs
            .open(
                1,
                "/new".into(),
                flags(&[OpenFlags::WRITE, OpenFlags::CREATE]),
                FileAttributes::default(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, StatusCode::PermissionDenied));

        let err = fs
            .mkdir(2, "/d".into(), FileAttributes::default())
            .await
            .unwrap_err();
        assert!(matches!(err, StatusCode::PermissionDenied));

        let err = fs.remove(3, "/keep".into()).await.unwrap_err();
        assert!(matches!(err, StatusCode::PermissionDenied));
        assert!(dir.path().join("keep").exists());

        let handle = fs
            .open(4, "/keep".into(), OpenFlags::READ, FileAttributes::default())
            .await
            .unwrap();
        assert_eq!(fs.read(5, handle.handle, 0, 8).await.unwrap().data, b"x");
    }

    #[tokio::test]
    async fn test_unknown_handle() {
        let dir = TempDir::new().unwrap();
        let mut fs = backend(&dir, false).await;

        assert!(matches!(
            fs.read(1, "h99".into(), 0, 4).await.unwrap_err(),
            StatusCode::Failure
        ));
        assert!(matches!(
            fs.close(2, "h99".into()).await.unwrap_err(),
            StatusCode::Failure
        ));
        assert!(matches!(
            fs.readdir(3, "h99".into()).await.unwrap_err(),
            StatusCode::Failure
        ));
    }

    #[tokio::test]
    async fn test_engine_start_failure() {
        let engine = SftpEngine::new(SftpConfig {
            root_dir: PathBuf::from("/no/such/sftp/root"),
            ..Default::default()
        });
        let (local, _peer) = tokio::io::duplex(64);
        let err = engine.serve(local).await.unwrap_err();
        assert!(matches!(err, SubsystemError::Start(_)));
    }

    #[tokio::test]
    async fn test_engine_serves_client() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("hello.txt"), b"hi").unwrap();
        let engine = SftpEngine::new(SftpConfig {
            root_dir: dir.path().to_path_buf(),
            ..Default::default()
        });
        let (local, peer) = tokio::io::duplex(64 * 1024);
        let serving = tokio::spawn(async move { engine.serve(local).await });

        let client = russh_sftp::client::SftpSession::new(peer).await.unwrap();
        assert_eq!(client.canonicalize(".").await.unwrap(), "/");
        let meta = client.metadata("/hello.txt").await.unwrap();
        assert_eq!(meta.size, Some(2));

        serving.abort();
    }
}
