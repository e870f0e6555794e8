//! First-boot payload for the guest's cloud-init agent.
//!
//! Two documents are produced: `meta-data`, naming the instance, and
//! `user-data`, a `#cloud-config` document that installs packages, creates
//! the login account with a SHA-512-crypt password hash, and carries a
//! shell script run by the guest at first boot. Both are packed into an
//! ISO9660 volume labelled `cidata`, which is how cloud-init's NoCloud
//! datasource finds them.
//!
//! The documents are serialized as JSON. YAML is a superset of JSON, so
//! cloud-init reads them unchanged, and we avoid hand-formatting YAML.
//!
//! The first-boot script is opaque text from our point of view: it is a
//! template with `{ADDRESS}`, `{GATEWAY}` and `{DNS}` placeholders that are
//! substituted with shell-quoted values. It never runs on the host.

use std::net::Ipv4Addr;

use camino::{Utf8Path, Utf8PathBuf};
use clap::Parser;
use color_eyre::eyre::{eyre, Context};
use color_eyre::Result;
use indoc::indoc;
use serde::{Deserialize, Serialize};
use sha_crypt::{sha512_simple, Sha512Params};
use tracing::{debug, info};

use crate::command_run::{ToolCommand, ToolRunner};
use crate::config::{GuestConfig, SiteOpts};
use crate::network::{self, GUEST_PREFIX_LEN};
use crate::validate;

/// Volume label the NoCloud datasource looks for.
pub const VOLUME_LABEL: &str = "cidata";
pub const USER_DATA: &str = "user-data";
pub const META_DATA: &str = "meta-data";
const CLOUD_CONFIG_HEADER: &str = "#cloud-config";
/// SHA-512-crypt rounds; 5000 is the crypt(3) default.
const HASH_ROUNDS: usize = 5_000;

/// Static addressing applied by the guest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GuestNetwork {
    pub address: Ipv4Addr,
    pub prefix_len: u8,
    pub gateway: Ipv4Addr,
    pub dns: [Ipv4Addr; 2],
}

/// Inputs for one payload.
#[derive(Clone)]
pub struct PayloadSpec<'a> {
    pub vm_name: &'a str,
    pub password: &'a str,
    pub network: GuestNetwork,
    pub guest: &'a GuestConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct MetaData {
    pub instance_id: String,
    pub local_hostname: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserData {
    pub packages: Vec<String>,
    pub users: Vec<GuestUser>,
    pub chpasswd: Chpasswd,
    pub ssh_pwauth: bool,
    pub runcmd: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GuestUser {
    pub name: String,
    #[serde(rename = "ssh-authorized-keys")]
    pub ssh_authorized_keys: Vec<String>,
    pub lock_passwd: bool,
    /// crypt(3) hash, never the plaintext
    pub passwd: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chpasswd {
    pub expire: bool,
}

/// The two rendered documents.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FirstBootDocuments {
    pub meta_data: String,
    pub user_data: String,
}

/// Hash a password with SHA-512-crypt and a random salt.
pub fn hash_password(password: &str) -> Result<String> {
    let params = Sha512Params::new(HASH_ROUNDS)
        .map_err(|e| eyre!("Invalid SHA-512-crypt parameters: {e:?}"))?;
    sha512_simple(password, &params).map_err(|e| eyre!("Failed to hash password: {e:?}"))
}

/// Render the first-boot script for the guest.
fn first_boot_script(net: &GuestNetwork) -> Result<String> {
    let quote = |s: String| -> Result<String> {
        Ok(shlex::try_quote(&s)
            .map_err(|e| eyre!("Failed to quote {s:?}: {e}"))?
            .into_owned())
    };
    let address = quote(format!("{}/{}", net.address, net.prefix_len))?;
    let gateway = quote(net.gateway.to_string())?;
    let dns = quote(format!("{} {}", net.dns[0], net.dns[1]))?;

    let script = indoc! {r#"
        set -eu
        dev=$(ip route show default | awk '{print $5; exit}')
        profile=$(nmcli -g GENERAL.CONNECTION device show "$dev")
        nmcli connection modify "$profile" ipv4.addresses {ADDRESS}
        nmcli connection modify "$profile" ipv4.gateway {GATEWAY}
        nmcli connection modify "$profile" ipv4.dns {DNS}
        nmcli connection modify "$profile" ipv4.method manual
        nmcli connection up "$profile"
        root_part=$(findmnt -n -o SOURCE /)
        root_disk=/dev/$(lsblk -n -o PKNAME "$root_part" | head -n 1)
        part_num=$(cat /sys/class/block/$(basename "$root_part")/partition)
        growpart "$root_disk" "$part_num" || true
        case "$(findmnt -n -o FSTYPE /)" in
            ext4) resize2fs "$root_part" ;;
            xfs) xfs_growfs / ;;
        esac
    "#}
    .replace("{ADDRESS}", &address)
    .replace("{GATEWAY}", &gateway)
    .replace("{DNS}", &dns);
    Ok(script)
}

/// Render `meta-data` and `user-data` without touching the filesystem.
pub fn render_documents(spec: &PayloadSpec<'_>) -> Result<FirstBootDocuments> {
    let meta = MetaData {
        instance_id: spec.vm_name.to_owned(),
        local_hostname: spec.vm_name.to_owned(),
    };
    let user = UserData {
        packages: spec.guest.packages.clone(),
        users: vec![GuestUser {
            name: spec.guest.guest_user.clone(),
            ssh_authorized_keys: Vec::new(),
            lock_passwd: false,
            passwd: hash_password(spec.password)?,
        }],
        chpasswd: Chpasswd { expire: false },
        ssh_pwauth: true,
        runcmd: vec![first_boot_script(&spec.network)?],
    };
    let meta_data = serde_json::to_string_pretty(&meta)? + "\n";
    let user_data = format!(
        "{CLOUD_CONFIG_HEADER}\n{}\n",
        serde_json::to_string_pretty(&user)?
    );
    Ok(FirstBootDocuments {
        meta_data,
        user_data,
    })
}

fn genisoimage_command(iso_path: &Utf8Path, documents: &[&Utf8Path]) -> ToolCommand {
    ToolCommand::new("genisoimage")
        .arg("-output")
        .arg(iso_path.as_str())
        .args(["-volid", VOLUME_LABEL, "-joliet", "-rock"])
        .args(documents.iter().map(|p| p.as_str()))
}

/// Render the documents and package them as a `cidata` ISO at `iso_path`.
///
/// The documents are staged in a temporary directory that is removed on
/// every exit path.
pub fn generate(
    runner: &dyn ToolRunner,
    spec: &PayloadSpec<'_>,
    iso_path: &Utf8Path,
) -> Result<Utf8PathBuf> {
    let docs = render_documents(spec)?;

    let td = tempfile::tempdir().context("Creating staging directory for cloud-init documents")?;
    let staging = Utf8Path::from_path(td.path())
        .ok_or_else(|| eyre!("Staging directory path is not UTF-8: {:?}", td.path()))?;
    let user_data = staging.join(USER_DATA);
    let meta_data = staging.join(META_DATA);
    std::fs::write(&user_data, &docs.user_data)
        .with_context(|| format!("Writing {user_data}"))?;
    std::fs::write(&meta_data, &docs.meta_data)
        .with_context(|| format!("Writing {meta_data}"))?;
    debug!("Staged cloud-init documents in {staging}");

    runner
        .run(&genisoimage_command(iso_path, &[&user_data, &meta_data]))
        .context("Failed to create cloud-init ISO")?;
    info!("Created first-boot volume {iso_path}");
    Ok(iso_path.to_owned())
}

/// Options for the `render-payload` command.
#[derive(Debug, Parser)]
pub struct RenderPayloadOpts {
    /// VM name (instance id and hostname)
    #[clap(long)]
    pub name: String,

    /// Password for the guest account
    #[clap(long, env = "CVK_PASSWORD", hide_env_values = true)]
    pub password: String,

    /// Static address assigned to the guest
    #[clap(long)]
    pub ip: Ipv4Addr,

    /// Default gateway for the guest
    #[clap(long)]
    pub gateway: Ipv4Addr,

    /// DNS server (give exactly two; default: from the site profiles)
    #[clap(long, num_args = 1)]
    pub dns: Vec<Ipv4Addr>,

    /// Host address used to select the site profile (default: --ip)
    #[clap(long)]
    pub host_ip: Option<Ipv4Addr>,

    #[clap(flatten)]
    pub site: SiteOpts,

    #[clap(flatten)]
    pub guest: GuestConfig,
}

/// Execute the `render-payload` command.
pub fn run_render(opts: RenderPayloadOpts) -> Result<()> {
    validate::validate_vm_name(&opts.name)?;
    validate::validate_password(&opts.password)?;
    let dns = match opts.dns.as_slice() {
        [] => {
            let profiles = opts.site.site_profiles()?;
            network::select_dns(&profiles, opts.host_ip.unwrap_or(opts.ip))
        }
        [a, b] => [*a, *b],
        other => return Err(eyre!("Expected exactly two --dns servers, got {}", other.len())),
    };
    let spec = PayloadSpec {
        vm_name: &opts.name,
        password: &opts.password,
        network: GuestNetwork {
            address: opts.ip,
            prefix_len: GUEST_PREFIX_LEN,
            gateway: opts.gateway,
            dns,
        },
        guest: &opts.guest,
    };
    let docs = render_documents(&spec)?;
    println!("==> {META_DATA} <==");
    print!("{}", docs.meta_data);
    println!("==> {USER_DATA} <==");
    print!("{}", docs.user_data);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command_run::ToolOutput;
    use std::cell::RefCell;

    fn parse_user_data(doc: &str) -> Result<UserData> {
        let body = doc
            .strip_prefix(CLOUD_CONFIG_HEADER)
            .ok_or_else(|| eyre!("user-data does not start with {CLOUD_CONFIG_HEADER}"))?;
        serde_json::from_str(body).context("Parsing user-data")
    }

    fn demo_network() -> GuestNetwork {
        GuestNetwork {
            address: Ipv4Addr::new(10, 0, 0, 50),
            prefix_len: 24,
            gateway: Ipv4Addr::new(10, 0, 0, 1),
            dns: [Ipv4Addr::new(8, 8, 8, 8), Ipv4Addr::new(8, 8, 4, 4)],
        }
    }

    /// Records genisoimage invocations along with the staged file contents.
    #[derive(Default)]
    struct IsoRecorder {
        calls: RefCell<Vec<ToolCommand>>,
        staged: RefCell<Vec<(String, String)>>,
        fail: bool,
    }

    impl ToolRunner for IsoRecorder {
        fn run(&self, cmd: &ToolCommand) -> Result<ToolOutput> {
            self.calls.borrow_mut().push(cmd.clone());
            for arg in cmd.args.iter().filter(|a| a.ends_with("-data")) {
                let content = std::fs::read_to_string(arg)?;
                self.staged.borrow_mut().push((arg.clone(), content));
            }
            if self.fail {
                return Err(eyre!("genisoimage: write error"));
            }
            Ok(ToolOutput::default())
        }
    }

    #[test]
    fn test_user_data_round_trip() {
        let guest = GuestConfig::default();
        let spec = PayloadSpec {
            vm_name: "demo-1",
            password: "abc123",
            network: demo_network(),
            guest: &guest,
        };
        let docs = render_documents(&spec).unwrap();
        assert!(docs.user_data.starts_with("#cloud-config\n"));

        let ud = parse_user_data(&docs.user_data).unwrap();
        let script = &ud.runcmd[0];
        assert!(script.contains("ipv4.addresses 10.0.0.50/24"));
        assert!(script.contains("ipv4.gateway 10.0.0.1"));
        assert!(script.contains("ipv4.dns '8.8.8.8 8.8.4.4'"));
        for placeholder in ["{ADDRESS}", "{GATEWAY}", "{DNS}"] {
            assert!(!script.contains(placeholder));
        }

        let user = &ud.users[0];
        assert_eq!(user.name, "rocky");
        assert_ne!(user.passwd, "abc123");
        assert!(user.passwd.starts_with("$6$"));
        assert!(sha_crypt::sha512_check("abc123", &user.passwd).is_ok());
        assert!(!docs.user_data.contains("abc123"));
        assert!(ud.ssh_pwauth);
        assert!(!ud.chpasswd.expire);
        assert_eq!(ud.packages, vec!["vim", "telnet", "epel-release"]);
    }

    #[test]
    fn test_meta_data_names_instance() {
        let guest = GuestConfig::default();
        let spec = PayloadSpec {
            vm_name: "web-01",
            password: "abc123",
            network: demo_network(),
            guest: &guest,
        };
        let docs = render_documents(&spec).unwrap();
        let meta: MetaData = serde_json::from_str(&docs.meta_data).unwrap();
        assert_eq!(meta.instance_id, "web-01");
        assert_eq!(meta.local_hostname, "web-01");
        assert!(docs.meta_data.contains("\"local-hostname\""));
    }

    #[test]
    fn test_hashes_are_salted() {
        let a = hash_password("abc123").unwrap();
        let b = hash_password("abc123").unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_script_handles_both_filesystems() {
        let script = first_boot_script(&demo_network()).unwrap();
        assert!(script.contains("resize2fs"));
        assert!(script.contains("xfs_growfs"));
        assert!(script.contains("growpart"));
        assert!(script.contains("ipv4.method manual"));
    }

    #[test]
    fn test_script_targets_default_route_profile() {
        let script = first_boot_script(&demo_network()).unwrap();
        let dev = script.find("ip route show default").unwrap();
        let profile = script
            .find(r#"profile=$(nmcli -g GENERAL.CONNECTION device show "$dev")"#)
            .unwrap();
        let first_modify = script.find("nmcli connection modify").unwrap();
        assert!(dev < profile && profile < first_modify);
        assert!(!script.contains("connection show --active"));
    }

    #[test]
    fn test_generate_packages_cidata_and_cleans_up() {
        let guest = GuestConfig::default();
        let spec = PayloadSpec {
            vm_name: "demo-1",
            password: "abc123",
            network: demo_network(),
            guest: &guest,
        };
        let runner = IsoRecorder::default();
        let iso = Utf8Path::new("/var/lib/libvirt/images/demo-1-cloud-init.iso");
        let out = generate(&runner, &spec, iso).unwrap();
        assert_eq!(out, iso);

        let calls = runner.calls.borrow();
        assert_eq!(calls.len(), 1);
        let cmd = &calls[0];
        assert_eq!(cmd.program, "genisoimage");
        assert_eq!(
            &cmd.args[..6],
            [
                "-output",
                "/var/lib/libvirt/images/demo-1-cloud-init.iso",
                "-volid",
                "cidata",
                "-joliet",
                "-rock",
            ]
        );
        assert_eq!(cmd.args.len(), 8);

        let staged = runner.staged.borrow();
        assert_eq!(staged.len(), 2);
        assert!(staged[0].0.ends_with("/user-data"));
        assert!(staged[0].1.contains("10.0.0.50/24"));
        assert!(staged[1].0.ends_with("/meta-data"));
        // The staging directory is gone once generate() returns.
        for (path, _) in staged.iter() {
            assert!(!Utf8Path::new(path).exists());
        }
    }

    #[test]
    fn test_generate_failure_still_cleans_up() {
        let guest = GuestConfig::default();
        let spec = PayloadSpec {
            vm_name: "demo-1",
            password: "abc123",
            network: demo_network(),
            guest: &guest,
        };
        let runner = IsoRecorder {
            fail: true,
            ..Default::default()
        };
        let err = generate(&runner, &spec, Utf8Path::new("/nonexistent/x.iso")).unwrap_err();
        assert!(format!("{err:#}").contains("genisoimage: write error"));
        let staged = runner.staged.borrow();
        assert_eq!(staged.len(), 2);
        let staging_dir = Utf8Path::new(&staged[0].0).parent().unwrap();
        assert!(!staging_dir.exists());
    }
}
