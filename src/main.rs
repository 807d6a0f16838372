//! Mount a git repository with large-file pointer stubs served as
//! their full content.

use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;

use clap::Parser;
use fuser::MountOption;
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, fmt};

use pointer_fs::repo::RepoSnapshot;

mod fs;

use fs::PointerFs;

#[derive(Parser)]
#[command(version, about)]
struct Args {
    /// Path to the repository (or any directory inside it).
    repo_path: PathBuf,

    /// The path to the mount point.
    mount_point: PathBuf,

    /// Deadline for every outgoing HTTP request, in seconds.
    #[arg(long, env = "POINTER_FS_HTTP_TIMEOUT", default_value_t = 30)]
    http_timeout: u64,
}

fn main() {
    let args = Args::parse();
    fmt()
        .with_env_filter(
            EnvFilter::try_from_env("POINTER_FS_LOG")
                .or_else(|_| EnvFilter::try_from_default_env())
                .unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let repo = match RepoSnapshot::open(&args.repo_path) {
        Ok(repo) => repo,
        Err(e) => {
            error!("Failed to open repository: {e}");
            std::process::exit(1);
        }
    };
    info!(
        workdir = %repo.workdir().display(),
        remotes = repo.remotes().len(),
        "Opened repository"
    );

    let filesystem = match PointerFs::new(repo, Duration::from_secs(args.http_timeout)) {
        Ok(filesystem) => filesystem,
        Err(e) => {
            error!("Failed to initialize filesystem: {e}");
            std::process::exit(1);
        }
    };

    let options = vec![
        MountOption::RO,
        MountOption::AutoUnmount,
        MountOption::FSName("pointerfs".to_owned()),
    ];

    // Use spawn_mount2 to get a BackgroundSession that can be properly
    // cleaned up. When the session is dropped, the filesystem is
    // unmounted.
    let session = match fuser::spawn_mount2(filesystem, &args.mount_point, &options) {
        Ok(session) => session,
        Err(e) => {
            error!("Failed to mount filesystem: {e}");
            return;
        }
    };

    info!(
        "Mounted at {:?}. Press Ctrl+C to unmount.",
        args.mount_point
    );

    // Wait for CTRL+C signal.
    let (tx, rx) = std::sync::mpsc::channel();
    if let Err(e) = ctrlc::set_handler(move || {
        let _ = tx.send(());
    }) {
        error!("Failed to set Ctrl+C handler: {e}");
        // Fall back to just joining the session thread
        session.join();
        return;
    }

    // Block until we receive the signal.
    let _ = rx.recv();
    info!("Received Ctrl+C, unmounting...");

    // Force unmount the filesystem. This handles the case where
    // something is still accessing the mount. The kernel will send
    // DESTROY to our FUSE handler, causing the background thread to
    // exit.
    if force_unmount(&args.mount_point) {
        // Force unmount succeeded. Forget the session to prevent
        // fuser's destructor from trying to unmount again (which would
        // fail with "Invalid argument" since it's already unmounted).
        #[expect(clippy::mem_forget)]
        std::mem::forget(session);
    } else {
        // Force unmount failed, let fuser try its normal cleanup.
        session.join();
    }

    info!("Unmounted successfully.");
}

/// Force unmount a FUSE filesystem. Uses platform-specific commands.
/// Returns true if unmount succeeded, false otherwise.
fn force_unmount(mount_point: &Path) -> bool {
    #[cfg(target_os = "macos")]
    let result = Command::new("umount").arg("-f").arg(mount_point).status();

    #[cfg(target_os = "linux")]
    let result = Command::new("fusermount")
        .arg("-uz") // lazy unmount
        .arg(mount_point)
        .status();

    #[cfg(not(any(target_os = "macos", target_os = "linux")))]
    let result: Result<std::process::ExitStatus, std::io::Error> = Err(std::io::Error::new(
        std::io::ErrorKind::Unsupported,
        "unsupported platform",
    ));

    match result {
        Ok(status) if status.success() => {
            info!("Force unmount succeeded");
            true
        }
        Ok(status) => {
            warn!("Force unmount exited with status: {status}");
            false
        }
        Err(e) => {
            warn!("Force unmount failed: {e}");
            false
        }
    }
}
