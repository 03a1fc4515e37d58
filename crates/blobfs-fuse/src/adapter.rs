//! FUSE adapter over [`BlobFs`].
//!
//! Translates inode-based kernel requests into path-based filesystem calls
//! and errors into errno values. Closing a file is synchronous: the commit
//! happens on `flush`, so `close(2)` reports commit failures.

#[cfg(all(feature = "fuse", target_os = "linux"))]
mod imp {
    use std::ffi::OsStr;
    use std::path::Path;
    use std::sync::Arc;
    use std::time::Duration;

    use blobfs_config::{log_fuse_debug, log_fuse_warn, MountConfig};
    use blobfs_vfs::{Attr, BlobFs, EntryKind, VfsError};
    use crossbeam_channel::Receiver;
    use fuser::{
        FileAttr, FileType, Filesystem, KernelConfig, MountOption, ReplyAttr, ReplyCreate,
        ReplyData, ReplyDirectory, ReplyEmpty, ReplyEntry, ReplyOpen, ReplyWrite, Request,
        TimeOrNow,
    };
    use libc::c_int;

    use crate::inode::InodeTable;
    use crate::lifecycle::{self, MountBackend, MountError};
    use crate::probe;

    // Entries change under the kernel; keep its caching short.
    const TTL: Duration = Duration::from_secs(1);
    const BLOCK_SIZE: u64 = 4096;

    pub struct FuseAdapter {
        fs: Arc<BlobFs>,
        inodes: InodeTable,
        uid: u32,
        gid: u32,
    }

    impl FuseAdapter {
        pub fn new(fs: Arc<BlobFs>) -> Self {
            Self {
                fs,
                inodes: InodeTable::new(),
                uid: 0,
                gid: 0,
            }
        }

        fn file_attr(&self, ino: u64, attr: &Attr) -> FileAttr {
            let is_dir = attr.kind == EntryKind::Dir;
            FileAttr {
                ino,
                size: attr.size,
                blocks: attr.size.div_ceil(BLOCK_SIZE),
                atime: attr.mtime,
                mtime: attr.mtime,
                ctime: attr.mtime,
                crtime: attr.mtime,
                kind: file_type(attr.kind),
                perm: attr.perm,
                nlink: if is_dir { 2 } else { 1 },
                uid: self.uid,
                gid: self.gid,
                rdev: 0,
                flags: 0,
                blksize: BLOCK_SIZE as u32,
            }
        }

        fn path(&self, ino: u64) -> Result<String, c_int> {
            self.inodes
                .get_path(ino)
                .map(str::to_string)
                .ok_or(libc::ENOENT)
        }

        fn child(&self, parent: u64, name: &OsStr) -> Result<String, c_int> {
            let name = name.to_str().ok_or(libc::EINVAL)?;
            self.inodes.child_path(parent, name).ok_or(libc::ENOENT)
        }

        /// Attributes for `path`, registering its inode.
        fn entry(&mut self, path: &str) -> Result<FileAttr, c_int> {
            let attr = self.fs.getattr(path).map_err(|e| errno("getattr", path, &e))?;
            let ino = self.inodes.get_or_create(path);
            Ok(self.file_attr(ino, &attr))
        }
    }

    fn file_type(kind: EntryKind) -> FileType {
        match kind {
            EntryKind::Dir => FileType::Directory,
            EntryKind::File => FileType::RegularFile,
        }
    }

    fn errno(op: &'static str, target: &str, e: &VfsError) -> c_int {
        if e.is_not_found() {
            log_fuse_debug!("Not found", op = op, target = target);
        } else {
            log_fuse_warn!(
                "Request failed",
                op = op,
                target = target,
                error = tracing::field::display(e)
            );
        }
        e.errno()
    }

    fn to_offset(offset: i64) -> Result<u64, c_int> {
        u64::try_from(offset).map_err(|_| libc::EINVAL)
    }

    impl Filesystem for FuseAdapter {
        fn init(&mut self, req: &Request<'_>, _config: &mut KernelConfig) -> Result<(), c_int> {
            self.uid = req.uid();
            self.gid = req.gid();
            Ok(())
        }

        fn destroy(&mut self) {
            for (fh, e) in self.fs.flush_all() {
                log_fuse_warn!(
                    "Dirty handle lost at unmount",
                    fh = fh,
                    error = tracing::field::display(&e)
                );
            }
        }

        fn lookup(&mut self, _req: &Request, parent: u64, name: &OsStr, reply: ReplyEntry) {
            match self.child(parent, name).and_then(|path| self.entry(&path)) {
                Ok(attr) => reply.entry(&TTL, &attr, 0),
                Err(e) => reply.error(e),
            }
        }

        fn getattr(&mut self, _req: &Request, ino: u64, reply: ReplyAttr) {
            let result = self.path(ino).and_then(|path| {
                let attr = self.fs.getattr(&path).map_err(|e| errno("getattr", &path, &e))?;
                Ok(self.file_attr(ino, &attr))
            });
            match result {
                Ok(attr) => reply.attr(&TTL, &attr),
                Err(e) => reply.error(e),
            }
        }

        fn setattr(
            &mut self,
            _req: &Request<'_>,
            ino: u64,
            _mode: Option<u32>,
            _uid: Option<u32>,
            _gid: Option<u32>,
            size: Option<u64>,
            _atime: Option<TimeOrNow>,
            _mtime: Option<TimeOrNow>,
            _ctime: Option<std::time::SystemTime>,
            fh: Option<u64>,
            _crtime: Option<std::time::SystemTime>,
            _chgtime: Option<std::time::SystemTime>,
            _bkuptime: Option<std::time::SystemTime>,
            _flags: Option<u32>,
            reply: ReplyAttr,
        ) {
            let result = self.path(ino).and_then(|path| {
                let attr = match size {
                    Some(size) => self.fs.truncate(&path, fh, size),
                    // Only size changes are meaningful here.
                    None => self.fs.getattr(&path),
                };
                let attr = attr.map_err(|e| errno("setattr", &path, &e))?;
                Ok(self.file_attr(ino, &attr))
            });
            match result {
                Ok(attr) => reply.attr(&TTL, &attr),
                Err(e) => reply.error(e),
            }
        }

        fn opendir(&mut self, _req: &Request<'_>, ino: u64, _flags: i32, reply: ReplyOpen) {
            let result = self.path(ino).and_then(|path| {
                let attr = self.fs.getattr(&path).map_err(|e| errno("opendir", &path, &e))?;
                if attr.kind == EntryKind::Dir {
                    Ok(())
                } else {
                    Err(libc::ENOTDIR)
                }
            });
            match result {
                Ok(()) => reply.opened(0, 0),
                Err(e) => reply.error(e),
            }
        }

        fn readdir(
            &mut self,
            _req: &Request,
            ino: u64,
            _fh: u64,
            offset: i64,
            mut reply: ReplyDirectory,
        ) {
            let path = match self.path(ino) {
                Ok(p) => p,
                Err(e) => return reply.error(e),
            };
            let listing = match self.fs.readdir(&path) {
                Ok(l) => l,
                Err(e) => return reply.error(errno("readdir", &path, &e)),
            };
            let parent = self
                .inodes
                .get_inode(&InodeTable::parent_path(&path))
                .unwrap_or(InodeTable::ROOT_INODE);

            let mut entries = vec![
                (ino, FileType::Directory, ".".to_string()),
                (parent, FileType::Directory, "..".to_string()),
            ];
            for item in listing {
                let child = format!("{}/{}", path.trim_end_matches('/'), item.name);
                let child_ino = self.inodes.get_or_create(&child);
                entries.push((child_ino, file_type(item.kind), item.name));
            }

            let skip = usize::try_from(offset).unwrap_or(0);
            for (i, (ino, kind, name)) in entries.into_iter().enumerate().skip(skip) {
                // The offset handed back is where the next call resumes.
                if reply.add(ino, (i + 1) as i64, kind, name) {
                    break;
                }
            }
            reply.ok();
        }

        fn open(&mut self, _req: &Request<'_>, ino: u64, flags: i32, reply: ReplyOpen) {
            let result = self
                .path(ino)
                .and_then(|path| self.fs.open(&path, flags).map_err(|e| errno("open", &path, &e)));
            match result {
                Ok(fh) => reply.opened(fh, 0),
                Err(e) => reply.error(e),
            }
        }

        fn create(
            &mut self,
            _req: &Request<'_>,
            parent: u64,
            name: &OsStr,
            _mode: u32,
            _umask: u32,
            flags: i32,
            reply: ReplyCreate,
        ) {
            let result = self.child(parent, name).and_then(|path| {
                let (fh, attr) = self
                    .fs
                    .create(&path, flags)
                    .map_err(|e| errno("create", &path, &e))?;
                let ino = self.inodes.get_or_create(&path);
                Ok((fh, self.file_attr(ino, &attr)))
            });
            match result {
                Ok((fh, attr)) => reply.created(&TTL, &attr, 0, fh, 0),
                Err(e) => reply.error(e),
            }
        }

        fn read(
            &mut self,
            _req: &Request,
            _ino: u64,
            fh: u64,
            offset: i64,
            size: u32,
            _flags: i32,
            _lock_owner: Option<u64>,
            reply: ReplyData,
        ) {
            let result = to_offset(offset).and_then(|offset| {
                self.fs
                    .read(fh, offset, size)
                    .map_err(|e| errno("read", &fh.to_string(), &e))
            });
            match result {
                Ok(data) => reply.data(&data),
                Err(e) => reply.error(e),
            }
        }

        fn write(
            &mut self,
            _req: &Request<'_>,
            _ino: u64,
            fh: u64,
            offset: i64,
            data: &[u8],
            _write_flags: u32,
            _flags: i32,
            _lock_owner: Option<u64>,
            reply: ReplyWrite,
        ) {
            let result = to_offset(offset).and_then(|offset| {
                self.fs
                    .write(fh, offset, data)
                    .map_err(|e| errno("write", &fh.to_string(), &e))
            });
            match result {
                Ok(n) => reply.written(n),
                Err(e) => reply.error(e),
            }
        }

        fn flush(&mut self, _req: &Request<'_>, _ino: u64, fh: u64, _lock_owner: u64, reply: ReplyEmpty) {
            match self.fs.flush(fh) {
                Ok(()) => reply.ok(),
                Err(e) => reply.error(errno("flush", &fh.to_string(), &e)),
            }
        }

        fn fsync(&mut self, _req: &Request<'_>, _ino: u64, fh: u64, _datasync: bool, reply: ReplyEmpty) {
            match self.fs.flush(fh) {
                Ok(()) => reply.ok(),
                Err(e) => reply.error(errno("fsync", &fh.to_string(), &e)),
            }
        }

        fn release(
            &mut self,
            _req: &Request<'_>,
            _ino: u64,
            fh: u64,
            _flags: i32,
            _lock_owner: Option<u64>,
            _flush: bool,
            reply: ReplyEmpty,
        ) {
            let result = self.fs.release(fh);
            let still_pending = self.fs.retry_pending();
            if still_pending > 0 {
                log_fuse_debug!("Releases awaiting commit", pending = still_pending);
            }
            match result {
                Ok(()) => reply.ok(),
                Err(e) => reply.error(errno("release", &fh.to_string(), &e)),
            }
        }

        fn mkdir(
            &mut self,
            _req: &Request<'_>,
            parent: u64,
            name: &OsStr,
            _mode: u32,
            _umask: u32,
            reply: ReplyEntry,
        ) {
            let result = self.child(parent, name).and_then(|path| {
                let attr = self.fs.mkdir(&path).map_err(|e| errno("mkdir", &path, &e))?;
                let ino = self.inodes.get_or_create(&path);
                Ok(self.file_attr(ino, &attr))
            });
            match result {
                Ok(attr) => reply.entry(&TTL, &attr, 0),
                Err(e) => reply.error(e),
            }
        }

        fn unlink(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
            let result = self.child(parent, name).and_then(|path| {
                self.fs.unlink(&path).map_err(|e| errno("unlink", &path, &e))?;
                self.inodes.remove_by_path(&path);
                Ok(())
            });
            match result {
                Ok(()) => reply.ok(),
                Err(e) => reply.error(e),
            }
        }

        fn rmdir(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
            let result = self.child(parent, name).and_then(|path| {
                self.fs.rmdir(&path).map_err(|e| errno("rmdir", &path, &e))?;
                self.inodes.remove_by_path(&path);
                Ok(())
            });
            match result {
                Ok(()) => reply.ok(),
                Err(e) => reply.error(e),
            }
        }

        fn rename(
            &mut self,
            _req: &Request<'_>,
            parent: u64,
            name: &OsStr,
            newparent: u64,
            newname: &OsStr,
            flags: u32,
            reply: ReplyEmpty,
        ) {
            if flags != 0 {
                // RENAME_NOREPLACE / RENAME_EXCHANGE are not supported.
                return reply.error(libc::EINVAL);
            }
            let result = self.child(parent, name).and_then(|from| {
                let to = self.child(newparent, newname)?;
                self.fs.rename(&from, &to).map_err(|e| errno("rename", &from, &e))?;
                self.inodes.rename(&from, &to);
                Ok(())
            });
            match result {
                Ok(()) => reply.ok(),
                Err(e) => reply.error(e),
            }
        }
    }

    fn mount_options(config: &MountConfig) -> Vec<MountOption> {
        let mut opts = vec![
            MountOption::FSName(config.fs_name.clone()),
            MountOption::Subtype(config.fs_name.clone()),
            MountOption::NoAtime,
        ];
        if config.allow_other {
            opts.push(MountOption::AllowOther);
        }
        opts
    }

    /// Serves a [`BlobFs`] through `fuser` on a background session.
    pub struct FuseBackend {
        fs: Arc<BlobFs>,
        config: MountConfig,
        session: Option<fuser::BackgroundSession>,
    }

    impl FuseBackend {
        pub fn new(fs: Arc<BlobFs>, config: MountConfig) -> Self {
            Self {
                fs,
                config,
                session: None,
            }
        }
    }

    impl MountBackend for FuseBackend {
        fn start(&mut self, mount_point: &Path) -> Result<(), MountError> {
            let adapter = FuseAdapter::new(Arc::clone(&self.fs));
            let session = fuser::spawn_mount2(adapter, mount_point, &mount_options(&self.config))?;
            self.session = Some(session);
            Ok(())
        }

        fn stop(&mut self) -> Receiver<()> {
            let (tx, rx) = crossbeam_channel::bounded(1);
            let session = self.session.take();
            let spawned = std::thread::Builder::new()
                .name("blobfs-unmount".to_string())
                .spawn(move || {
                    // Dropping the session unmounts and ends the request loop.
                    drop(session);
                    let _ = tx.send(());
                });
            if let Err(e) = spawned {
                log_fuse_warn!("Unmount thread failed to start", error = tracing::field::display(&e));
            }
            rx
        }

        fn is_mounted(&self, mount_point: &Path) -> bool {
            probe::is_mounted(mount_point, &self.config.fs_name)
        }

        fn force_unmount(&mut self, mount_point: &Path) -> Result<(), MountError> {
            lifecycle::force_unmount(mount_point)
        }

        fn kill(&mut self) {
            // Any unmount thread left by `stop` ends once the kernel
            // connection is gone.
            if self.session.take().is_some() {
                log_fuse_debug!("Session dropped without graceful stop");
            }
        }
    }
}

#[cfg(not(all(feature = "fuse", target_os = "linux")))]
mod imp {
    use std::path::Path;
    use std::sync::Arc;

    use blobfs_config::MountConfig;
    use blobfs_vfs::BlobFs;
    use crossbeam_channel::Receiver;

    use crate::lifecycle::{self, MountBackend, MountError};

    /// Placeholder backend for non-Linux or non-feature builds.
    pub struct FuseBackend;

    impl FuseBackend {
        pub fn new(_fs: Arc<BlobFs>, _config: MountConfig) -> Self {
            Self
        }
    }

    impl MountBackend for FuseBackend {
        fn start(&mut self, _mount_point: &Path) -> Result<(), MountError> {
            #[cfg(not(target_os = "linux"))]
            let reason = format!("only available on Linux (current: {})", std::env::consts::OS);
            #[cfg(target_os = "linux")]
            let reason = "compile with --features fuse to enable".to_string();
            Err(MountError::Unsupported(reason))
        }

        fn stop(&mut self) -> Receiver<()> {
            let (tx, rx) = crossbeam_channel::bounded(1);
            let _ = tx.send(());
            rx
        }

        fn is_mounted(&self, _mount_point: &Path) -> bool {
            false
        }

        fn force_unmount(&mut self, mount_point: &Path) -> Result<(), MountError> {
            lifecycle::force_unmount(mount_point)
        }

        fn kill(&mut self) {}
    }
}

#[cfg(all(feature = "fuse", target_os = "linux"))]
pub use imp::FuseAdapter;
pub use imp::FuseBackend;
