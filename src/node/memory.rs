// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

//! Memory limits for runtimes that cannot make a container's memory cap visible to the
//! container itself. The kubelet reads `/proc/meminfo`, so a generated one is mounted over it.

use std::path::{Path, PathBuf};

use log::{debug, warn};

use crate::{
    context::Context,
    error::{Error, Result},
};

pub const MEMINFO_MOUNT: &str = "/proc/meminfo:ro";
pub const EDAC_MOUNT: &str = "/sys/devices/system/edac:ro";

/// Host directory whose presence makes the kubelet try to read memory controller information.
const HOST_EDAC_DIR: &str = "/sys/devices/system/edac";

/// Volume mounts ending in one of these are generated per node and must not be copied to another.
pub const DO_NOT_COPY_VOLUME_SUFFIXES: [&str; 2] = [MEMINFO_MOUNT, EDAC_MOUNT];

/// Parse a docker-style memory size such as `512m`, `2g` or `1048576` into bytes. Units are
/// binary (`1k` is 1024 bytes) and case-insensitive; a trailing `b` is accepted (`512mb`).
pub fn parse_size(size: &str) -> Result<u64> {
    let invalid = || Error::InvalidConfig(format!("invalid memory size '{size}'"));

    let lower = size.trim().to_ascii_lowercase();
    let lower = lower.strip_suffix('b').unwrap_or(&lower);
    let split = lower
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(lower.len());
    let (digits, unit) = lower.split_at(split);

    let value: u64 = digits.parse().map_err(|_| invalid())?;
    let multiplier: u64 = match unit {
        "" => 1,
        "k" => 1 << 10,
        "m" => 1 << 20,
        "g" => 1 << 30,
        "t" => 1 << 40,
        _ => return Err(invalid()),
    };

    value.checked_mul(multiplier).ok_or_else(invalid)
}

/// Host directory holding the generated files of `node_name`.
pub fn fake_dir(state_dir: &Path, node_name: &str) -> PathBuf {
    state_dir.join(format!(".{node_name}"))
}

/// A `/proc/meminfo` reporting `bytes` of total (and free) memory.
pub fn meminfo_content(bytes: u64) -> String {
    let kb = bytes / 1024;
    format!(
        "MemTotal:       {kb:>8} kB\n\
         MemFree:        {kb:>8} kB\n\
         MemAvailable:   {kb:>8} kB\n\
         Buffers:               0 kB\n\
         Cached:                0 kB\n\
         SwapCached:            0 kB\n\
         SwapTotal:             0 kB\n\
         SwapFree:              0 kB\n"
    )
}

/// Write the fake files for `node_name` and return the volume mounts exposing them.
pub async fn prepare_fake_files(ctx: &Context, node_name: &str, bytes: u64) -> Result<Vec<String>> {
    let dir = fake_dir(&ctx.state_dir, node_name);
    tokio::fs::create_dir_all(&dir).await?;

    let meminfo = dir.join("meminfo");
    tokio::fs::write(&meminfo, meminfo_content(bytes)).await?;
    let mut volumes = vec![format!("{}:{MEMINFO_MOUNT}", meminfo.display())];

    if tokio::fs::try_exists(HOST_EDAC_DIR).await.unwrap_or(false) {
        let edac = dir.join("edac");
        tokio::fs::create_dir_all(&edac).await?;
        volumes.push(format!("{}:{EDAC_MOUNT}", edac.display()));
    }

    debug!("Prepared fake memory files for node {node_name} in {}", dir.display());
    Ok(volumes)
}

/// Remove the fake files of `node_name`, if there are any.
pub async fn cleanup(ctx: &Context, node_name: &str) -> Result<()> {
    let dir = fake_dir(&ctx.state_dir, node_name);
    match tokio::fs::remove_dir_all(&dir).await {
        Ok(()) => {
            debug!("Removed fake files of node {node_name}");
            Ok(())
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => {
            warn!("Could not remove {}: {e}", dir.display());
            Err(e.into())
        }
    }
}
