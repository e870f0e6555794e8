//! The provisioning pipeline: validation through launch.
//!
//! Stages run strictly in order, each to completion, and the first failure
//! ends the run. Nothing is retried and nothing already produced is rolled
//! back; the outcome records the failing stage and the last one that
//! completed so the operator knows what was left on disk.

use std::fmt;
use std::net::Ipv4Addr;
use std::time::Duration;

use clap::Parser;
use color_eyre::eyre::{eyre, Context};
use color_eyre::{Report, Result};
use tracing::info;

use crate::command_run::{HostRunner, ToolRunner};
use crate::config::{GuestConfig, HostConfig, SiteProfiles};
use crate::disk;
use crate::image::{self, HttpSource, ImageSource};
use crate::launcher::{self, VmDefinition};
use crate::network::{NetworkContext, GUEST_PREFIX_LEN};
use crate::payload::{self, GuestNetwork, PayloadSpec};
use crate::validate::{ProvisioningRequest, RawRequest, RequestArgs};

#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
pub enum Stage {
    Validating,
    ResolvingNetwork,
    AcquiringImage,
    PreparingDisk,
    GeneratingPayload,
    Launching,
    Done,
}

/// What the operator needs to log in to the new guest.
#[derive(Clone, PartialEq, Eq)]
pub struct ProvisionSummary {
    pub vm_name: String,
    pub assigned_ip: Ipv4Addr,
    pub cpu_count: u32,
    pub memory_gb: u32,
    pub disk_size_gb: u32,
    pub username: String,
    pub password: String,
}

impl fmt::Debug for ProvisionSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProvisionSummary")
            .field("vm_name", &self.vm_name)
            .field("assigned_ip", &self.assigned_ip)
            .field("cpu_count", &self.cpu_count)
            .field("memory_gb", &self.memory_gb)
            .field("disk_size_gb", &self.disk_size_gb)
            .field("username", &self.username)
            .finish_non_exhaustive()
    }
}

impl fmt::Display for ProvisionSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let rule = "=".repeat(40);
        writeln!(f, "{rule}")?;
        writeln!(f, "VM '{}' created successfully!", self.vm_name)?;
        writeln!(f, "IP Address: {}", self.assigned_ip)?;
        writeln!(f, "CPU: {}", self.cpu_count)?;
        writeln!(f, "Memory: {} GB", self.memory_gb)?;
        writeln!(f, "Disk: {} GB", self.disk_size_gb)?;
        writeln!(f, "Username: {}", self.username)?;
        writeln!(f, "Password: {}", self.password)?;
        write!(f, "{rule}")
    }
}

#[derive(Debug)]
pub struct PipelineFailure {
    pub stage: Stage,
    pub last_completed: Option<Stage>,
    pub error: Report,
}

impl PipelineFailure {
    /// The error, wrapped with which stage failed and how far the run got.
    pub fn into_report(self) -> Report {
        let last = self
            .last_completed
            .map_or_else(|| "none".to_owned(), |s| s.to_string());
        self.error.wrap_err(format!(
            "Provisioning failed at stage {} (last completed stage: {last})",
            self.stage
        ))
    }
}

#[derive(Debug)]
pub enum PipelineOutcome {
    Done(ProvisionSummary),
    Failed(PipelineFailure),
}

/// Tracks the position in the stage sequence.
#[derive(Debug, Default)]
struct Progress {
    last_completed: Option<Stage>,
}

impl Progress {
    fn stage<T>(
        &mut self,
        stage: Stage,
        f: impl FnOnce() -> Result<T>,
    ) -> Result<T, PipelineFailure> {
        info!("Stage {stage}: starting");
        match f() {
            Ok(v) => {
                info!("Stage {stage}: complete");
                self.last_completed = Some(stage);
                Ok(v)
            }
            Err(error) => Err(PipelineFailure {
                stage,
                last_completed: self.last_completed,
                error,
            }),
        }
    }
}

/// Everything a run needs besides the request itself.
pub struct Pipeline<'a> {
    pub runner: &'a dyn ToolRunner,
    pub source: &'a dyn ImageSource,
    pub host: &'a HostConfig,
    pub guest: &'a GuestConfig,
    pub profiles: &'a SiteProfiles,
}

impl Pipeline<'_> {
    /// Run every stage for `raw`. `progress` receives download progress.
    pub fn run(&self, raw: &RawRequest, progress: &mut dyn FnMut(u64, u64)) -> PipelineOutcome {
        match self.run_stages(raw, progress) {
            Ok(summary) => PipelineOutcome::Done(summary),
            Err(failure) => PipelineOutcome::Failed(failure),
        }
    }

    fn run_stages(
        &self,
        raw: &RawRequest,
        progress: &mut dyn FnMut(u64, u64),
    ) -> Result<ProvisionSummary, PipelineFailure> {
        let mut p = Progress::default();

        let request = p.stage(Stage::Validating, || {
            ProvisioningRequest::validate(raw).map_err(|rejected| eyre!(rejected))
        })?;
        let vm_name = request.vm_name();

        let net = p.stage(Stage::ResolvingNetwork, || {
            NetworkContext::resolve(self.runner, request.ip_suffix(), self.profiles)
        })?;
        info!("Guest address {} on host network of {}", net.assigned_ip, net.host_ip);

        p.stage(Stage::AcquiringImage, || {
            image::ensure_base_image(
                &self.host.base_image,
                &net.image_source_url,
                self.source,
                self.host.base_image_sha256.as_deref(),
                progress,
            )
            .with_context(|| format!("Failed to acquire base image from {}", net.image_source_url))
        })?;

        let disk_path = self.host.guest_disk_path(vm_name);
        p.stage(Stage::PreparingDisk, || {
            if launcher::domain_exists(self.runner, vm_name)? {
                return Err(eyre!(
                    "A VM named {vm_name} is already defined; refusing to overwrite {disk_path}"
                ));
            }
            disk::prepare_disk(
                self.runner,
                &self.host.base_image,
                &disk_path,
                request.disk_size_gb(),
            )
        })?;

        let payload_path = p.stage(Stage::GeneratingPayload, || {
            let spec = PayloadSpec {
                vm_name,
                password: request.password(),
                network: GuestNetwork {
                    address: net.assigned_ip,
                    prefix_len: GUEST_PREFIX_LEN,
                    gateway: net.gateway,
                    dns: net.dns_servers,
                },
                guest: self.guest,
            };
            payload::generate(self.runner, &spec, &self.host.payload_path(vm_name))
        })?;

        p.stage(Stage::Launching, || {
            let def = VmDefinition {
                name: vm_name.to_owned(),
                vcpus: request.cpu_count(),
                memory_mb: request.memory_mb(),
                disk_path,
                disk_size_gb: request.disk_size_gb(),
                payload_path,
                bridge: self.host.bridge.clone(),
                os_variant: self.host.os_variant.clone(),
            };
            launcher::define_and_start(self.runner, &def)
        })?;

        info!("Stage {}: VM {vm_name} is up", Stage::Done);
        Ok(ProvisionSummary {
            vm_name: vm_name.to_owned(),
            assigned_ip: net.assigned_ip,
            cpu_count: request.cpu_count(),
            memory_gb: request.memory_gb(),
            disk_size_gb: request.disk_size_gb(),
            username: self.guest.guest_user.clone(),
            password: request.password().to_owned(),
        })
    }
}

/// Options for the `create` command.
#[derive(Debug, Parser)]
pub struct CreateOpts {
    #[clap(flatten)]
    pub request: RequestArgs,

    #[clap(flatten)]
    pub host: HostConfig,

    #[clap(flatten)]
    pub guest: GuestConfig,

    /// Do not require root (the hypervisor tools will likely fail)
    #[clap(long, hide = true)]
    pub skip_root_check: bool,
}

/// Execute the `create` command.
pub fn run(opts: CreateOpts) -> Result<()> {
    if !opts.skip_root_check {
        crate::utils::require_root()?;
    }
    let profiles = opts.host.site.site_profiles()?;
    let raw = crate::prompt::complete_request(opts.request)?;
    let source = HttpSource::new(Duration::from_secs(opts.host.download_timeout))
        .context("Creating HTTP client")?;

    let pipeline = Pipeline {
        runner: &HostRunner,
        source: &source,
        host: &opts.host,
        guest: &opts.guest,
        profiles: &profiles,
    };
    let pb = crate::progress::create_download_progress_bar("Downloading base image");
    let outcome = pipeline.run(&raw, &mut crate::progress::bar_callback(&pb));
    pb.finish_and_clear();

    match outcome {
        PipelineOutcome::Done(summary) => {
            println!("\n{summary}\n");
            Ok(())
        }
        PipelineOutcome::Failed(failure) => Err(failure.into_report()),
    }
}
