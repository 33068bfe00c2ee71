//! FUSE adapter: maps [`fuser::Filesystem`] callbacks to [`VfsOps`].

use std::ffi::OsStr;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use tracing::{debug, error, instrument, trace};

use super::ops::{BLOCK_SIZE, VfsOps};
use super::update_bridge::KernelNotifier;
use super::{INode, INodeType, InodeAddr, OpenFlags, VfsError};

/// Trait abstracting the `.error(errno)` method common to all fuser reply types.
trait FuseReply {
    fn error(self, errno: i32);
}

macro_rules! impl_fuse_reply {
    ($($ty:ty),* $(,)?) => {
        $(impl FuseReply for $ty {
            fn error(self, errno: i32) {
                // Calls the inherent fuser method (not this trait method).
                self.error(errno);
            }
        })*
    };
}

// ReplyEmpty and ReplyStatfs are excluded: release, releasedir and statfs cannot fail.
impl_fuse_reply!(
    fuser::ReplyEntry,
    fuser::ReplyAttr,
    fuser::ReplyDirectory,
    fuser::ReplyOpen,
    fuser::ReplyData,
);

/// Extension trait on `Result<T, VfsError>` for FUSE reply handling.
///
/// Centralizes the error-logging + errno-reply path so each FUSE callback
/// only has to express its success path.
trait FuseResultExt<T> {
    fn fuse_reply<R: FuseReply>(self, reply: R, on_ok: impl FnOnce(T, R));
}

impl<T> FuseResultExt<T> for Result<T, VfsError> {
    fn fuse_reply<R: FuseReply>(self, reply: R, on_ok: impl FnOnce(T, R)) {
        match self {
            Ok(val) => on_ok(val, reply),
            Err(e) => {
                debug!(error = %e, "replying error");
                reply.error(e.into());
            }
        }
    }
}

/// Convert an `INode` to the fuser-specific `FileAttr`.
fn inode_to_fuser_attr(inode: &INode, block_size: u32) -> fuser::FileAttr {
    let nlink = match inode.itype {
        INodeType::Directory => 2,
        INodeType::File => 1,
    };
    fuser::FileAttr {
        ino: inode.addr,
        size: inode.size,
        blocks: inode.size.div_ceil(512),
        atime: inode.last_modified_at,
        mtime: inode.last_modified_at,
        ctime: inode.last_modified_at,
        crtime: inode.create_time,
        kind: inode_type_to_fuser(inode.itype),
        perm: inode.permissions.bits(),
        nlink,
        uid: inode.uid,
        gid: inode.gid,
        rdev: 0,
        blksize: block_size,
        flags: 0,
    }
}

fn inode_type_to_fuser(itype: INodeType) -> fuser::FileType {
    match itype {
        INodeType::Directory => fuser::FileType::Directory,
        INodeType::File => fuser::FileType::RegularFile,
    }
}

/// Kernel notifier backed by a mounted fuser session.
///
/// The session only exists once the mount is up, so the handle is filled in after construction.
/// Invalidations issued before that are dropped: the kernel has nothing cached yet.
#[derive(Default)]
pub struct SessionNotifier {
    notifier: OnceLock<fuser::Notifier>,
}

impl SessionNotifier {
    /// An unattached notifier.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach the session's notifier. Later calls are ignored.
    pub fn attach(&self, notifier: fuser::Notifier) {
        if self.notifier.set(notifier).is_err() {
            debug!("session notifier already attached");
        }
    }
}

/// The kernel answers `ENOENT` for entries it never cached.
fn log_inval_result(result: std::io::Result<()>, what: &str) {
    match result {
        Ok(()) => {}
        Err(e) if e.raw_os_error() == Some(libc::ENOENT) => {
            trace!(what, "kernel had nothing cached");
        }
        Err(e) => error!(what, error = %e, "kernel invalidation failed"),
    }
}

impl KernelNotifier for SessionNotifier {
    fn inval_entry(&self, parent: InodeAddr, name: &OsStr) {
        if let Some(notifier) = self.notifier.get() {
            log_inval_result(notifier.inval_entry(parent, name), "entry");
        }
    }

    fn inval_inode(&self, inode: InodeAddr) {
        if let Some(notifier) = self.notifier.get() {
            log_inval_result(notifier.inval_inode(inode, 0, 0), "inode");
        }
    }
}

/// Bridges [`VfsOps`] to the [`fuser::Filesystem`] trait.
///
/// The session thread blocks on the tokio runtime for every kernel call.
pub struct FuserAdapter {
    ops: Arc<VfsOps>,
    ttl: Duration,
    runtime: tokio::runtime::Handle,
}

impl FuserAdapter {
    /// Serve `ops`, letting the kernel cache entries and attributes for `ttl`.
    #[must_use]
    pub fn new(ops: Arc<VfsOps>, ttl: Duration, runtime: tokio::runtime::Handle) -> Self {
        Self { ops, ttl, runtime }
    }
}

impl fuser::Filesystem for FuserAdapter {
    #[instrument(name = "FuserAdapter::lookup", skip(self, _req, reply))]
    fn lookup(
        &mut self,
        _req: &fuser::Request<'_>,
        parent: u64,
        name: &OsStr,
        reply: fuser::ReplyEntry,
    ) {
        self.runtime
            .block_on(self.ops.lookup(parent, name))
            .fuse_reply(reply, |inode, reply| {
                let f_attr = inode_to_fuser_attr(&inode, BLOCK_SIZE);
                debug!(?f_attr, "replying...");
                reply.entry(&self.ttl, &f_attr, 0);
            });
    }

    #[instrument(name = "FuserAdapter::getattr", skip(self, _req, _fh, reply))]
    fn getattr(
        &mut self,
        _req: &fuser::Request<'_>,
        ino: u64,
        _fh: Option<u64>,
        reply: fuser::ReplyAttr,
    ) {
        self.runtime
            .block_on(self.ops.getattr(ino))
            .fuse_reply(reply, |inode, reply| {
                let attr = inode_to_fuser_attr(&inode, BLOCK_SIZE);
                debug!(?attr, "replying...");
                reply.attr(&self.ttl, &attr);
            });
    }

    #[instrument(name = "FuserAdapter::opendir", skip(self, _req, _flags, reply))]
    fn opendir(&mut self, _req: &fuser::Request<'_>, ino: u64, _flags: i32, reply: fuser::ReplyOpen) {
        self.runtime
            .block_on(self.ops.opendir(ino))
            .fuse_reply(reply, |fh, reply| {
                debug!(handle = fh, "replying...");
                reply.opened(fh, 0);
            });
    }

    #[instrument(name = "FuserAdapter::readdir", skip(self, _req, offset, reply))]
    fn readdir(
        &mut self,
        _req: &fuser::Request<'_>,
        ino: u64,
        fh: u64,
        offset: i64,
        mut reply: fuser::ReplyDirectory,
    ) {
        let offset_u64 = offset.cast_unsigned();
        let entries = match self.ops.readdir(fh, offset_u64) {
            Ok(entries) => entries,
            Err(e) => {
                debug!(error = %e, "replying error");
                reply.error(e.into());
                return;
            }
        };

        for (i, entry) in (offset_u64..).zip(&entries) {
            let kind = inode_type_to_fuser(entry.itype);
            let Ok(idx): Result<i64, _> = (i + 1).try_into() else {
                error!("Directory entry index {} too large for fuser", i + 1);
                reply.error(libc::EIO);
                return;
            };

            trace!(name = ?entry.name, ino = entry.ino, "adding entry to reply...");
            if reply.add(entry.ino, idx, kind, &entry.name) {
                debug!("buffer full for now, stopping readdir");
                break;
            }
        }

        debug!("finalizing reply...");
        reply.ok();
    }

    #[instrument(name = "FuserAdapter::releasedir", skip(self, _req, _ino, _flags, reply))]
    fn releasedir(
        &mut self,
        _req: &fuser::Request<'_>,
        _ino: u64,
        fh: u64,
        _flags: i32,
        reply: fuser::ReplyEmpty,
    ) {
        self.ops.releasedir(fh);
        reply.ok();
    }

    #[instrument(name = "FuserAdapter::open", skip(self, _req, flags, reply))]
    fn open(&mut self, _req: &fuser::Request<'_>, ino: u64, flags: i32, reply: fuser::ReplyOpen) {
        let flags = OpenFlags::from_bits_truncate(flags);
        self.runtime
            .block_on(self.ops.open(ino, flags))
            .fuse_reply(reply, |fh, reply| {
                debug!(handle = fh, "replying...");
                reply.opened(fh, 0);
            });
    }

    #[instrument(
        name = "FuserAdapter::read",
        skip(self, _req, _ino, fh, offset, size, _flags, _lock_owner, reply)
    )]
    fn read(
        &mut self,
        _req: &fuser::Request<'_>,
        _ino: u64,
        fh: u64,
        offset: i64,
        size: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: fuser::ReplyData,
    ) {
        self.runtime
            .block_on(self.ops.read(fh, offset.cast_unsigned(), size))
            .fuse_reply(reply, |data, reply| {
                debug!(read_bytes = data.len(), "replying...");
                reply.data(&data);
            });
    }

    #[instrument(
        name = "FuserAdapter::release",
        skip(self, _req, _ino, fh, _flags, _lock_owner, _flush, reply)
    )]
    fn release(
        &mut self,
        _req: &fuser::Request<'_>,
        _ino: u64,
        fh: u64,
        _flags: i32,
        _lock_owner: Option<u64>,
        _flush: bool,
        reply: fuser::ReplyEmpty,
    ) {
        self.runtime.block_on(self.ops.release(fh));
        debug!("replying ok");
        reply.ok();
    }

    #[instrument(name = "FuserAdapter::forget", skip(self, _req, nlookup))]
    fn forget(&mut self, _req: &fuser::Request<'_>, ino: u64, nlookup: u64) {
        self.runtime.block_on(self.ops.forget(ino, nlookup));
    }

    #[instrument(name = "FuserAdapter::statfs", skip(self, _req, _ino, reply))]
    fn statfs(&mut self, _req: &fuser::Request<'_>, _ino: u64, reply: fuser::ReplyStatfs) {
        let stats = self.runtime.block_on(self.ops.statfs());
        debug!(?stats, "replying...");
        reply.statfs(
            stats.total_blocks,
            stats.free_blocks,
            stats.available_blocks,
            stats.total_inodes,
            stats.free_inodes,
            stats.block_size,
            stats.max_filename_length,
            0,
        );
    }
}
