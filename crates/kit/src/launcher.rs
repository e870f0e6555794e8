//! Defining and starting the guest under libvirt via `virt-install`.

use camino::Utf8PathBuf;
use color_eyre::eyre::Context;
use color_eyre::Result;
use tracing::info;

use crate::command_run::{ToolCommand, ToolRunner};

/// Everything `virt-install` needs to import and boot the guest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VmDefinition {
    pub name: String,
    pub vcpus: u32,
    pub memory_mb: u32,
    pub disk_path: Utf8PathBuf,
    pub disk_size_gb: u32,
    pub payload_path: Utf8PathBuf,
    pub bridge: String,
    pub os_variant: String,
}

/// Commas separate suboptions in virt-install's option syntax; a literal
/// comma is written twice.
fn escape_suboption(value: &str) -> String {
    value.replace(',', ",,")
}

impl VmDefinition {
    pub fn virt_install_command(&self) -> ToolCommand {
        ToolCommand::new("virt-install")
            .args(["--name", self.name.as_str()])
            .args(["--vcpus".to_owned(), self.vcpus.to_string()])
            .args(["--memory".to_owned(), self.memory_mb.to_string()])
            .arg(format!(
                "--disk=path={},format=qcow2,bus=virtio,size={}",
                escape_suboption(self.disk_path.as_str()),
                self.disk_size_gb
            ))
            .arg(format!(
                "--disk=path={},device=cdrom",
                escape_suboption(self.payload_path.as_str())
            ))
            .args(["--os-variant", self.os_variant.as_str()])
            .arg("--network")
            .arg(format!("bridge={},model=virtio", escape_suboption(&self.bridge)))
            .args(["--boot", "hd", "--noautoconsole", "--import"])
    }
}

/// Whether libvirt already has a domain, running or not, named `name`.
pub fn domain_exists(runner: &dyn ToolRunner, name: &str) -> Result<bool> {
    let out = runner
        .run(&ToolCommand::new("virsh").args(["list", "--all", "--name"]))
        .context("Listing libvirt domains")?;
    Ok(out.stdout.lines().any(|l| l.trim() == name))
}

/// Register the domain and start it without attaching a console.
///
/// A rejected definition is surfaced with virt-install's own diagnostic.
pub fn define_and_start(runner: &dyn ToolRunner, def: &VmDefinition) -> Result<()> {
    info!("Launching VM {}", def.name);
    runner
        .run(&def.virt_install_command())
        .with_context(|| format!("Failed to launch VM {}", def.name))?;
    Ok(())
}
