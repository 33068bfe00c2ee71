use std::sync::Arc;
use std::time::SystemTime;

use tokio::select;
use tokio::task::JoinSet;

use msg_fs::fs::fuser::SessionNotifier;
use msg_fs::fs::ops::{AttrDefaults, VfsOps, VfsState};
use msg_fs::fs::update_bridge::{KernelNotifier, UpdateBridge};
use msg_fs::local_source::{LocalSource, LocalSourceOptions};
use msg_fs::vfs::VfsTree;

use crate::app_config;
use tracing::{debug, error, info};

mod managed_fuse {
    //! This module feels a little confusing, but it's designed to help you manage the lifecycle of
    //! fuse slightly better. fuser will not attempt to fuse unmount the filesystem when the
    //! `BackgroundSession` is dropped, and will only do a regular unmount, but we want to be
    //! aggressive and force an unmount if possible.
    use std::path::PathBuf;
    use std::sync::Arc;
    use std::time::Duration;

    use nix::errno::Errno;

    use super::{app_config, debug, error};
    use fuser::BackgroundSession;
    use msg_fs::fs::fuser::FuserAdapter;
    use msg_fs::fs::ops::VfsOps;

    pub struct FuseCoreScope {
        session: BackgroundSession,
    }

    impl FuseCoreScope {
        fn spawn(
            config: &app_config::Config,
            ops: Arc<VfsOps>,
            handle: tokio::runtime::Handle,
        ) -> Result<Self, std::io::Error> {
            let fuse_adapter = FuserAdapter::new(ops, config.attr_ttl(), handle);
            let mount_opts = [
                fuser::MountOption::FSName("msg-fs".to_owned()),
                fuser::MountOption::RO,
                fuser::MountOption::NoDev,
                fuser::MountOption::NoSuid,
                fuser::MountOption::AutoUnmount,
                fuser::MountOption::DefaultPermissions,
            ];

            Ok(Self {
                session: fuser::spawn_mount2(fuse_adapter, &config.mount_point, &mount_opts)?,
            })
        }

        /// Handle for pushing cache invalidations into the kernel.
        pub fn notifier(&self) -> fuser::Notifier {
            self.session.notifier()
        }
    }

    pub struct ManagedFuse {
        mount_point: PathBuf,
    }

    impl ManagedFuse {
        pub fn new(config: &app_config::Config) -> Self {
            Self {
                mount_point: config.mount_point.clone(),
            }
        }

        pub fn spawn(
            &self,
            config: &app_config::Config,
            ops: Arc<VfsOps>,
            handle: tokio::runtime::Handle,
        ) -> Result<FuseCoreScope, std::io::Error> {
            _ = self; // self used for calling convention.
            FuseCoreScope::spawn(config, ops, handle)
        }
    }

    impl Drop for ManagedFuse {
        fn drop(&mut self) {
            const UMOUNT_ATTEMPT_COUNT: usize = 10;
            const UMOUNT_ATTEMPT_DELAY: Duration = Duration::from_millis(10);

            debug!(mount_point = ?self.mount_point, "Confirming unmount of FUSE filesystem...");

            for i in 0..UMOUNT_ATTEMPT_COUNT {
                let result = {
                    #[cfg(target_os = "macos")]
                    {
                        nix::mount::unmount(&self.mount_point, nix::mount::MntFlags::MNT_FORCE)
                    }

                    #[cfg(target_os = "linux")]
                    {
                        nix::mount::umount2(&self.mount_point, nix::mount::MntFlags::MNT_DETACH)
                    }
                };

                match result {
                    Ok(()) => {
                        debug!(
                            "Successfully unmounted FUSE filesystem on attempt {}",
                            i + 1
                        );
                        break;
                    }
                    Err(Errno::EBUSY) => {
                        debug!(
                            "FUSE filesystem still busy on attempt {}. Retrying...",
                            i + 1
                        );
                        std::thread::sleep(UMOUNT_ATTEMPT_DELAY);
                    }
                    Err(Errno::EINVAL | Errno::ENOENT | Errno::EPERM) => {
                        debug!("FUSE filesystem already unmounted (attempt {})", i + 1);
                        break;
                    }
                    Err(e) => {
                        error!(
                            "Failed to unmount FUSE filesystem on attempt {}: {}",
                            i + 1,
                            e
                        );
                        break;
                    }
                }
            }
        }
    }
}

/// Prepares the mount point directory.
///
/// - If the directory exists and is non-empty, returns an error.
/// - If the directory does not exist, creates it (including parents) and logs an info message.
/// - If the directory exists and is empty, does nothing.
async fn prepare_mount_point(mount_point: &std::path::Path) -> Result<(), std::io::Error> {
    match tokio::fs::read_dir(mount_point).await {
        Ok(mut entries) => {
            if entries.next_entry().await?.is_some() {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::AlreadyExists,
                    format!(
                        "Mount point '{}' already exists and is not empty.",
                        mount_point.display()
                    ),
                ));
            }
            Ok(())
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            tokio::fs::create_dir_all(mount_point).await?;
            info!(path = %mount_point.display(), "Created mount point directory.");
            Ok(())
        }
        Err(e) => Err(e),
    }
}

async fn wait_for_exit() -> Result<(), std::io::Error> {
    use tokio::signal;
    let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())?;
    let mut sighup = signal::unix::signal(signal::unix::SignalKind::hangup())?;
    select! {
        _ = signal::ctrl_c() => {
            debug!("Received Ctrl+C signal, shutting down...");
        },
        _ = sigterm.recv() => {
            debug!("Received termination signal, shutting down...");
        },
        _ = sighup.recv() => {
            debug!("Received hangup signal, shutting down...");
        },
    }
    Ok(())
}

/// Main entry point for the daemon.
pub async fn run(
    config: app_config::Config,
    handle: tokio::runtime::Handle,
) -> Result<(), std::io::Error> {
    prepare_mount_point(&config.mount_point).await?;

    let state = VfsState::new(VfsTree::new()).shared();
    let notifier = Arc::new(SessionNotifier::new());
    let (bridge, producer) = UpdateBridge::new(
        Arc::clone(&state),
        Arc::clone(&notifier) as Arc<dyn KernelNotifier>,
        config.update_channel_capacity,
    );
    let bridge_task = tokio::spawn(bridge.run());

    let ops = Arc::new(VfsOps::new(
        state,
        AttrDefaults {
            uid: config.uid,
            gid: config.gid,
            time: SystemTime::now(),
        },
    ));

    info!("Mounting filesystem at {}.", config.mount_point.display());

    let fuse = managed_fuse::ManagedFuse::new(&config);
    {
        let session = fuse.spawn(&config, ops, handle.clone())?;
        notifier.attach(session.notifier());

        let mut sources = JoinSet::new();
        for source in &config.sources {
            info!(
                path = %source.path.display(),
                tree_path = %source.tree_path,
                "Mirroring source."
            );
            let local = LocalSource::new(
                &source.path,
                &source.tree_path,
                LocalSourceOptions {
                    exclude_empty: source.exclude_empty,
                    expand_archives: source.expand_archives,
                },
                producer.clone(),
            );
            sources.spawn(local.run(config.rescan_interval()));
        }
        drop(producer);

        info!("msg-fs is running. Press Ctrl+C to stop.");
        wait_for_exit().await?;

        sources.shutdown().await;
    }

    if let Err(e) = bridge_task.await {
        error!("Update bridge task failed: {e}");
    }
    Ok(())
}

pub fn spawn(config: app_config::Config) -> Result<(), std::io::Error> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    runtime.block_on(run(config, runtime.handle().clone()))
}
