//! Host paths, guest defaults and the site profile table.
//!
//! All configuration is resolved once at startup and handed down as plain
//! values. The site profile table decides, from the host's own address,
//! which mirror the base image is fetched from and which DNS servers the
//! guest is given.

use std::net::Ipv4Addr;

use camino::{Utf8Path, Utf8PathBuf};
use clap::Parser;
use color_eyre::eyre::{eyre, Context};
use color_eyre::Result;
use ipnet::Ipv4Net;
use serde::Deserialize;

pub const DEFAULT_BASE_IMAGE: &str = "/root/Downloads/Rocky-9-GenericCloud.latest.x86_64.qcow2";
pub const DEFAULT_IMAGES_DIR: &str = "/var/lib/libvirt/images";
pub const DEFAULT_BRIDGE: &str = "br0";
pub const DEFAULT_OS_VARIANT: &str = "rocky9";
pub const DEFAULT_GUEST_USER: &str = "rocky";
pub const DEFAULT_PACKAGES: [&str; 3] = ["vim", "telnet", "epel-release"];
/// Default budget for the whole base image transfer, in seconds.
pub const DEFAULT_DOWNLOAD_TIMEOUT_SECS: u64 = 3600;

/// Mirror and resolver selection for one address range.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct SiteProfile {
    pub name: String,
    /// Host addresses inside this network select the profile. Absent only
    /// on the fallback profile.
    #[serde(default)]
    pub prefix: Option<Ipv4Net>,
    pub image_url: String,
    pub dns: [Ipv4Addr; 2],
}

/// Ordered profile table; the first matching prefix wins.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct SiteProfiles {
    #[serde(default)]
    pub profiles: Vec<SiteProfile>,
    pub fallback: SiteProfile,
}

impl SiteProfiles {
    /// The internal lab network uses a local mirror and domestic resolvers,
    /// everything else the upstream mirror and public resolvers.
    pub fn builtin() -> Self {
        Self {
            profiles: vec![SiteProfile {
                name: "internal".to_owned(),
                prefix: Some(Ipv4Net::new_assert(Ipv4Addr::new(192, 168, 100, 0), 24)),
                image_url:
                    "http://192.168.100.10:8000/images/Rocky-9-GenericCloud-Base.latest.x86_64.qcow2"
                        .to_owned(),
                dns: [Ipv4Addr::new(223, 5, 5, 5), Ipv4Addr::new(223, 6, 6, 6)],
            }],
            fallback: SiteProfile {
                name: "public".to_owned(),
                prefix: None,
                image_url: "http://download.rockylinux.org/pub/rocky/9/images/x86_64/Rocky-9-GenericCloud.latest.x86_64.qcow2"
                    .to_owned(),
                dns: [Ipv4Addr::new(8, 8, 8, 8), Ipv4Addr::new(8, 8, 4, 4)],
            },
        }
    }

    /// Load a replacement table from a JSON file.
    pub fn load(path: &Utf8Path) -> Result<Self> {
        let buf = std::fs::read_to_string(path)
            .with_context(|| format!("Reading site profiles from {path}"))?;
        let profiles: Self = serde_json::from_str(&buf)
            .with_context(|| format!("Parsing site profiles in {path}"))?;
        profiles.check()?;
        Ok(profiles)
    }

    fn check(&self) -> Result<()> {
        if let Some(p) = self.profiles.iter().find(|p| p.prefix.is_none()) {
            return Err(eyre!(
                "Site profile '{}' has no prefix; only the fallback may omit it",
                p.name
            ));
        }
        Ok(())
    }

    pub fn select(&self, host_ip: Ipv4Addr) -> &SiteProfile {
        self.profiles
            .iter()
            .find(|p| p.prefix.is_some_and(|net| net.contains(&host_ip)))
            .unwrap_or(&self.fallback)
    }
}

/// Site profile table selection.
#[derive(Debug, Clone, Default, Parser)]
pub struct SiteOpts {
    /// JSON file replacing the built-in site profile table
    #[clap(long, env = "CVK_PROFILES")]
    pub profiles: Option<Utf8PathBuf>,
}

impl SiteOpts {
    pub fn site_profiles(&self) -> Result<SiteProfiles> {
        match self.profiles.as_deref() {
            Some(path) => SiteProfiles::load(path),
            None => Ok(SiteProfiles::builtin()),
        }
    }
}

/// Where things live on the hypervisor host.
#[derive(Debug, Clone, Parser)]
pub struct HostConfig {
    /// Local path of the cached base image
    #[clap(long, env = "CVK_BASE_IMAGE", default_value = DEFAULT_BASE_IMAGE)]
    pub base_image: Utf8PathBuf,

    /// Expected SHA-256 of a freshly downloaded base image
    #[clap(long, env = "CVK_BASE_IMAGE_SHA256")]
    pub base_image_sha256: Option<String>,

    /// Directory receiving per-VM disks and first-boot volumes
    #[clap(long, env = "CVK_IMAGES_DIR", default_value = DEFAULT_IMAGES_DIR)]
    pub images_dir: Utf8PathBuf,

    /// Host bridge the guest NIC is attached to
    #[clap(long, env = "CVK_BRIDGE", default_value = DEFAULT_BRIDGE)]
    pub bridge: String,

    /// OS profile hint passed to virt-install
    #[clap(long, env = "CVK_OS_VARIANT", default_value = DEFAULT_OS_VARIANT)]
    pub os_variant: String,

    /// Timeout in seconds for the base image download
    #[clap(long, env = "CVK_DOWNLOAD_TIMEOUT", default_value_t = DEFAULT_DOWNLOAD_TIMEOUT_SECS)]
    pub download_timeout: u64,

    #[clap(flatten)]
    pub site: SiteOpts,
}

impl HostConfig {
    pub fn guest_disk_path(&self, vm_name: &str) -> Utf8PathBuf {
        self.images_dir.join(format!("{vm_name}.qcow2"))
    }

    pub fn payload_path(&self, vm_name: &str) -> Utf8PathBuf {
        self.images_dir.join(format!("{vm_name}-cloud-init.iso"))
    }
}

/// What the guest gets configured with at first boot.
#[derive(Debug, Clone, Parser)]
pub struct GuestConfig {
    /// Name of the account created in the guest
    #[clap(long, default_value = DEFAULT_GUEST_USER)]
    pub guest_user: String,

    /// Package installed at first boot (repeatable)
    #[clap(long = "package", default_values_t = DEFAULT_PACKAGES.map(String::from))]
    pub packages: Vec<String>,
}

impl Default for GuestConfig {
    fn default() -> Self {
        Self {
            guest_user: DEFAULT_GUEST_USER.to_owned(),
            packages: DEFAULT_PACKAGES.map(String::from).to_vec(),
        }
    }
}
