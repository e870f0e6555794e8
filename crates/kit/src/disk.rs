//! Per-VM disk preparation.
//!
//! The guest disk is a full copy of the base image, grown to the requested
//! size. The base image itself is never modified. A failed step leaves
//! whatever it produced in place; nothing is cleaned up automatically.

use camino::Utf8Path;
use color_eyre::eyre::{eyre, Context};
use color_eyre::Result;
use serde::Deserialize;
use tracing::{info, warn};

use crate::command_run::{ToolCommand, ToolRunner};
use crate::utils::gib_to_bytes;

/// The subset of `qemu-img info --output=json` we look at.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "kebab-case")]
struct ImageInfo {
    virtual_size: u64,
}

fn image_info(runner: &dyn ToolRunner, path: &Utf8Path) -> Result<ImageInfo> {
    let cmd = ToolCommand::new("qemu-img").args(["info", "--output=json", path.as_str()]);
    runner.run_and_parse_json(&cmd)
}

/// Copy `base` to `dest` and resize the copy to `size_gb` GiB.
///
/// An existing `dest` is overwritten after a warning. Requests smaller than
/// the base image's virtual size are refused, since shrinking would
/// truncate the guest filesystem.
pub fn prepare_disk(
    runner: &dyn ToolRunner,
    base: &Utf8Path,
    dest: &Utf8Path,
    size_gb: u32,
) -> Result<()> {
    if dest.exists() {
        warn!("Overwriting existing disk {dest}");
    }
    info!("Creating VM disk {dest}");
    runner
        .run(&ToolCommand::new("cp").args([base.as_str(), dest.as_str()]))
        .with_context(|| format!("Failed to copy {base} to {dest}"))?;

    let info = image_info(runner, dest).with_context(|| format!("Inspecting {dest}"))?;
    let requested = gib_to_bytes(size_gb);
    if requested < info.virtual_size {
        return Err(eyre!(
            "Requested disk size {size_gb}G is smaller than the base image ({} bytes); \
             refusing to shrink",
            info.virtual_size
        ));
    }

    info!("Resizing disk to {size_gb}G");
    let resize = ToolCommand::new("qemu-img")
        .args(["resize", dest.as_str()])
        .arg(format!("{size_gb}G"));
    runner
        .run(&resize)
        .with_context(|| format!("Failed to resize {dest}"))?;
    Ok(())
}
