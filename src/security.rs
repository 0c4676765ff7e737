#![forbid(unsafe_code)]

//! Startup guards shared by the RingPing binaries.

use std::{fs, path::Path};

use anyhow::{Context, Result, bail};
use nix::unistd::Uid;

/// Refuses to run as root. The server spawns yt-dlp/ffmpeg on user-supplied
/// URLs and writes into a public directory, neither of which should happen
/// with root privileges.
pub fn ensure_not_root(process: &str) -> Result<()> {
    ensure_not_root_for(Uid::current(), process)
}

fn ensure_not_root_for(uid: Uid, process: &str) -> Result<()> {
    if uid.is_root() {
        bail!("{process} must not be run as root; start it under a dedicated service account");
    }
    Ok(())
}

/// Creates `dir` if needed and checks that it is a writable directory by
/// dropping and removing a marker file.
pub fn ensure_writable_dir(dir: &Path) -> Result<()> {
    fs::create_dir_all(dir).with_context(|| format!("creating {}", dir.display()))?;
    if !dir.is_dir() {
        bail!("{} is not a directory", dir.display());
    }
    let marker = dir.join(".ringping-write-check");
    fs::write(&marker, b"").with_context(|| format!("{} is not writable", dir.display()))?;
    fs::remove_file(&marker).with_context(|| format!("removing {}", marker.display()))?;
    Ok(())
}
