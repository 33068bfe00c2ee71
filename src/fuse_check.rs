//! FUSE availability checks.

use std::path::Path;

const FUSE_DEVICE: &str = "/dev/fuse";

/// Mount helpers fuser falls back to when not running as root.
const MOUNT_HELPERS: [&str; 2] = ["fusermount3", "fusermount"];

/// Errors that can occur when verifying FUSE availability.
#[derive(Debug, thiserror::Error)]
pub enum FuseCheckError {
    /// The kernel module is not loaded or the device is not exposed.
    #[error(
        "/dev/fuse does not exist. msg-fs needs the fuse kernel module (try `modprobe fuse`)."
    )]
    NoDevice,

    /// No mount helper was found on `PATH`.
    #[error("neither fusermount3 nor fusermount was found on PATH. Install the fuse3 package.")]
    NoMountHelper,
}

fn on_path(binary: &str) -> bool {
    std::env::var_os("PATH")
        .is_some_and(|paths| std::env::split_paths(&paths).any(|dir| dir.join(binary).is_file()))
}

/// Verify that FUSE is installed and usable on the current platform.
///
/// Root can mount without a helper, so the helper check only applies to other users.
pub fn ensure_fuse() -> Result<(), FuseCheckError> {
    if !Path::new(FUSE_DEVICE).exists() {
        return Err(FuseCheckError::NoDevice);
    }

    if !nix::unistd::Uid::effective().is_root() && !MOUNT_HELPERS.iter().any(|h| on_path(h)) {
        return Err(FuseCheckError::NoMountHelper);
    }

    Ok(())
}
