//! Discovery of host network facts and derivation of the guest's addressing.

use std::net::Ipv4Addr;

use color_eyre::eyre::{eyre, Context};
use color_eyre::Result;
use tracing::debug;

use crate::command_run::{ToolCommand, ToolRunner};
use crate::config::SiteProfiles;

/// The guest is placed in the host's /24.
pub const GUEST_PREFIX_LEN: u8 = 24;

/// Addressing for one provisioning run, computed once and then read-only.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkContext {
    pub host_ip: Ipv4Addr,
    pub gateway: Ipv4Addr,
    pub assigned_ip: Ipv4Addr,
    pub dns_servers: [Ipv4Addr; 2],
    pub image_source_url: String,
}

impl NetworkContext {
    /// Derive the context from already known host facts.
    pub fn derive(
        host_ip: Ipv4Addr,
        gateway: Ipv4Addr,
        ip_suffix: u8,
        profiles: &SiteProfiles,
    ) -> Self {
        debug!("Site profile for {host_ip}: {}", profiles.select(host_ip).name);
        Self {
            host_ip,
            gateway,
            assigned_ip: assigned_ip(host_ip, ip_suffix),
            dns_servers: select_dns(profiles, host_ip),
            image_source_url: select_image_source(profiles, host_ip).to_owned(),
        }
    }

    /// Query the host, then derive.
    pub fn resolve(
        runner: &dyn ToolRunner,
        ip_suffix: u8,
        profiles: &SiteProfiles,
    ) -> Result<Self> {
        let (host_ip, gateway) = resolve_host_network(runner)?;
        let ctx = Self::derive(host_ip, gateway, ip_suffix, profiles);
        debug!("Resolved network context: {ctx:?}");
        Ok(ctx)
    }
}

/// Find the host's primary IPv4 address and default gateway.
///
/// There is no fallback: if either query fails the caller must abort.
pub fn resolve_host_network(runner: &dyn ToolRunner) -> Result<(Ipv4Addr, Ipv4Addr)> {
    let out = runner
        .run(&ToolCommand::new("hostname").arg("-I"))
        .context("Unable to get host IP address")?;
    let host_ip = parse_host_ip(&out.stdout)?;

    let out = runner
        .run(&ToolCommand::new("ip").args(["route", "show", "default"]))
        .context("Unable to get default gateway")?;
    let gateway = parse_default_gateway(&out.stdout)?;

    debug!("Host IP {host_ip}, default gateway {gateway}");
    Ok((host_ip, gateway))
}

/// First IPv4 address in `hostname -I` output.
fn parse_host_ip(output: &str) -> Result<Ipv4Addr> {
    output
        .split_whitespace()
        .find_map(|w| w.parse::<Ipv4Addr>().ok())
        .ok_or_else(|| eyre!("No IPv4 address in `hostname -I` output: {:?}", output.trim()))
}

/// The address after `via` on the first line of `ip route show default`.
fn parse_default_gateway(output: &str) -> Result<Ipv4Addr> {
    let line = output
        .lines()
        .find(|l| l.starts_with("default"))
        .ok_or_else(|| eyre!("No default route found"))?;
    let mut words = line.split_whitespace();
    words
        .by_ref()
        .find(|w| *w == "via")
        .ok_or_else(|| eyre!("Default route has no gateway: {line:?}"))?;
    let gw = words
        .next()
        .ok_or_else(|| eyre!("Default route has no gateway: {line:?}"))?;
    gw.parse()
        .with_context(|| format!("Invalid gateway address {gw:?}"))
}

pub fn select_image_source(profiles: &SiteProfiles, host_ip: Ipv4Addr) -> &str {
    &profiles.select(host_ip).image_url
}

pub fn select_dns(profiles: &SiteProfiles, host_ip: Ipv4Addr) -> [Ipv4Addr; 2] {
    profiles.select(host_ip).dns
}

/// Replace the last octet of the host address.
pub fn assigned_ip(host_ip: Ipv4Addr, ip_suffix: u8) -> Ipv4Addr {
    let [a, b, c, _] = host_ip.octets();
    Ipv4Addr::new(a, b, c, ip_suffix)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command_run::ToolOutput;

    struct CannedRunner {
        hostname: &'static str,
        route: Option<&'static str>,
    }

    impl ToolRunner for CannedRunner {
        fn run(&self, cmd: &ToolCommand) -> Result<ToolOutput> {
            let stdout = match cmd.program.as_str() {
                "hostname" => self.hostname,
                "ip" => self.route.ok_or_else(|| eyre!("ip: command failed"))?,
                other => return Err(eyre!("unexpected tool {other}")),
            };
            Ok(ToolOutput {
                stdout: stdout.to_owned(),
            })
        }
    }

    #[test]
    fn test_assigned_ip_keeps_host_slash24() {
        assert_eq!(
            assigned_ip(Ipv4Addr::new(10, 0, 0, 5), 50),
            Ipv4Addr::new(10, 0, 0, 50)
        );
        assert_eq!(
            assigned_ip(Ipv4Addr::new(192, 168, 100, 20), 254),
            Ipv4Addr::new(192, 168, 100, 254)
        );
    }

    #[test]
    fn test_parse_host_ip_skips_ipv6() {
        assert_eq!(
            parse_host_ip("fe80::1 10.0.0.5 172.17.0.1 \n").unwrap(),
            Ipv4Addr::new(10, 0, 0, 5)
        );
        assert!(parse_host_ip("\n").is_err());
    }

    #[test]
    fn test_parse_default_gateway() {
        let out = "default via 10.0.0.1 dev br0 proto static metric 425 \n";
        assert_eq!(parse_default_gateway(out).unwrap(), Ipv4Addr::new(10, 0, 0, 1));
        assert!(parse_default_gateway("").is_err());
        assert!(parse_default_gateway("default dev wg0 scope link\n").is_err());
    }

    #[test]
    fn test_resolve_end_to_end() {
        let runner = CannedRunner {
            hostname: "10.0.0.5\n",
            route: Some("default via 10.0.0.1 dev br0\n"),
        };
        let ctx = NetworkContext::resolve(&runner, 50, &SiteProfiles::builtin()).unwrap();
        assert_eq!(ctx.host_ip, Ipv4Addr::new(10, 0, 0, 5));
        assert_eq!(ctx.gateway, Ipv4Addr::new(10, 0, 0, 1));
        assert_eq!(ctx.assigned_ip, Ipv4Addr::new(10, 0, 0, 50));
        assert_eq!(ctx.dns_servers, [Ipv4Addr::new(8, 8, 8, 8), Ipv4Addr::new(8, 8, 4, 4)]);
        assert!(ctx.image_source_url.starts_with("http://download.rockylinux.org/"));
    }

    #[test]
    fn test_internal_range_selects_mirror_and_dns() {
        let profiles = SiteProfiles::builtin();
        let host = Ipv4Addr::new(192, 168, 100, 30);
        assert!(select_image_source(&profiles, host).starts_with("http://192.168.100.10:8000/"));
        assert_eq!(
            select_dns(&profiles, host),
            [Ipv4Addr::new(223, 5, 5, 5), Ipv4Addr::new(223, 6, 6, 6)]
        );
    }

    #[test]
    fn test_resolve_fails_without_gateway() {
        let runner = CannedRunner {
            hostname: "10.0.0.5\n",
            route: None,
        };
        let err = NetworkContext::resolve(&runner, 50, &SiteProfiles::builtin()).unwrap_err();
        assert!(format!("{err:#}").contains("Unable to get default gateway"));
    }
}
