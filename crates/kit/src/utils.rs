use color_eyre::eyre::eyre;
use color_eyre::Result;

/// Bytes in one GiB; disk sizes on the command line are in this unit.
pub const GIB: u64 = 1024 * 1024 * 1024;

pub fn gib_to_bytes(gib: u32) -> u64 {
    u64::from(gib) * GIB
}

/// Fail unless running with effective UID 0.
///
/// Writing to the libvirt image directory and defining system domains both
/// need root.
pub fn require_root() -> Result<()> {
    if rustix::process::geteuid().is_root() {
        Ok(())
    } else {
        Err(eyre!("This command must be run as root"))
    }
}
