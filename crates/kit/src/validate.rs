//! Validation gate for provisioning requests.
//!
//! Each field of a request has an independent check that takes the raw
//! string as typed by the operator and either accepts it (returning the
//! parsed value) or rejects it with a human-readable reason. A
//! [`ProvisioningRequest`] can only be obtained through
//! [`ProvisioningRequest::validate`], so nothing downstream ever sees an
//! unchecked value.

use std::fmt;
use std::ops::RangeInclusive;

use clap::Parser;
use color_eyre::{eyre::eyre, Result};

pub const IP_SUFFIX_RANGE: RangeInclusive<u32> = 1..=254;
pub const CPU_RANGE: RangeInclusive<u32> = 1..=16;
pub const MEMORY_GB_RANGE: RangeInclusive<u32> = 1..=32;
pub const DISK_GB_RANGE: RangeInclusive<u32> = 10..=2048;
pub const MIN_PASSWORD_LEN: usize = 6;

/// The fields of a provisioning request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "kebab-case")]
pub enum Field {
    IpSuffix,
    Password,
    VmName,
    CpuCount,
    MemoryGb,
    DiskSizeGb,
}

/// A single rejected field.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{field}: {reason}")]
pub struct FieldError {
    pub field: Field,
    pub reason: String,
}

impl FieldError {
    fn new(field: Field, reason: impl Into<String>) -> Self {
        Self {
            field,
            reason: reason.into(),
        }
    }
}

/// Every field error found in a request.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub struct Rejected(pub Vec<FieldError>);

impl fmt::Display for Rejected {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Invalid provisioning request:")?;
        for e in &self.0 {
            write!(f, "\n  {e}")?;
        }
        Ok(())
    }
}

/// Parse a plain decimal number within an inclusive range.
///
/// Only ASCII digits are accepted; signs, whitespace and empty input are
/// rejected along with out-of-range values.
fn parse_bounded(
    field: Field,
    raw: &str,
    range: RangeInclusive<u32>,
    what: &str,
) -> Result<u32, FieldError> {
    let reject = || {
        FieldError::new(
            field,
            format!(
                "{what} must be a number between {} and {}",
                range.start(),
                range.end()
            ),
        )
    };
    if raw.is_empty() || !raw.bytes().all(|b| b.is_ascii_digit()) {
        return Err(reject());
    }
    let value: u32 = raw.parse().map_err(|_| reject())?;
    if range.contains(&value) {
        Ok(value)
    } else {
        Err(reject())
    }
}

pub fn validate_ip_suffix(raw: &str) -> Result<u8, FieldError> {
    let v = parse_bounded(Field::IpSuffix, raw, IP_SUFFIX_RANGE, "IP suffix")?;
    // Range end is 254, so this cannot truncate.
    Ok(v as u8)
}

pub fn validate_password(raw: &str) -> Result<(), FieldError> {
    if raw.chars().count() < MIN_PASSWORD_LEN || raw.chars().any(char::is_whitespace) {
        return Err(FieldError::new(
            Field::Password,
            format!(
                "password must be at least {MIN_PASSWORD_LEN} characters long and contain no spaces"
            ),
        ));
    }
    Ok(())
}

pub fn validate_vm_name(raw: &str) -> Result<(), FieldError> {
    if raw.is_empty() || !raw.chars().all(|c| c.is_ascii_alphanumeric() || c == '-') {
        return Err(FieldError::new(
            Field::VmName,
            "VM name can only contain letters, numbers, and hyphen (-)",
        ));
    }
    if raw.chars().all(|c| c.is_ascii_digit()) {
        return Err(FieldError::new(
            Field::VmName,
            "VM name cannot be purely numeric",
        ));
    }
    Ok(())
}

pub fn validate_cpu_count(raw: &str) -> Result<u32, FieldError> {
    parse_bounded(Field::CpuCount, raw, CPU_RANGE, "CPU count")
}

pub fn validate_memory_gb(raw: &str) -> Result<u32, FieldError> {
    parse_bounded(Field::MemoryGb, raw, MEMORY_GB_RANGE, "memory (GB)")
}

pub fn validate_disk_size_gb(raw: &str) -> Result<u32, FieldError> {
    parse_bounded(Field::DiskSizeGb, raw, DISK_GB_RANGE, "disk size (GB)")
}

/// Unvalidated request fields, as typed on the command line or at a prompt.
#[derive(Debug, Clone, Default, Parser)]
pub struct RequestArgs {
    /// Last octet of the guest's IP address (1-254)
    #[clap(long)]
    pub ip_suffix: Option<String>,

    /// Password for the guest account (min 6 chars, no spaces)
    #[clap(long, env = "CVK_PASSWORD", hide_env_values = true)]
    pub password: Option<String>,

    /// Name of the VM (letters, numbers, and hyphen only)
    #[clap(long)]
    pub name: Option<String>,

    /// Number of virtual CPUs (1-16)
    #[clap(long)]
    pub cpus: Option<String>,

    /// Memory in GB (1-32)
    #[clap(long)]
    pub memory: Option<String>,

    /// Disk size in GB (10-2048)
    #[clap(long)]
    pub disk_size: Option<String>,
}

/// A fully populated, but not yet validated, request.
#[derive(Clone, Default)]
pub struct RawRequest {
    pub ip_suffix: String,
    pub password: String,
    pub vm_name: String,
    pub cpu_count: String,
    pub memory_gb: String,
    pub disk_size_gb: String,
}

impl fmt::Debug for RawRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RawRequest")
            .field("ip_suffix", &self.ip_suffix)
            .field("password", &"<redacted>")
            .field("vm_name", &self.vm_name)
            .field("cpu_count", &self.cpu_count)
            .field("memory_gb", &self.memory_gb)
            .field("disk_size_gb", &self.disk_size_gb)
            .finish()
    }
}

impl From<RequestArgs> for RawRequest {
    /// Missing values become empty strings, which every check rejects.
    fn from(args: RequestArgs) -> Self {
        Self {
            ip_suffix: args.ip_suffix.unwrap_or_default(),
            password: args.password.unwrap_or_default(),
            vm_name: args.name.unwrap_or_default(),
            cpu_count: args.cpus.unwrap_or_default(),
            memory_gb: args.memory.unwrap_or_default(),
            disk_size_gb: args.disk_size.unwrap_or_default(),
        }
    }
}

fn collect<T>(r: Result<T, FieldError>, errors: &mut Vec<FieldError>) -> Option<T> {
    r.map_err(|e| errors.push(e)).ok()
}

/// A request whose every field has passed validation.
#[derive(Clone, PartialEq, Eq)]
pub struct ProvisioningRequest {
    ip_suffix: u8,
    password: String,
    vm_name: String,
    cpu_count: u32,
    memory_gb: u32,
    disk_size_gb: u32,
}

impl fmt::Debug for ProvisioningRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProvisioningRequest")
            .field("ip_suffix", &self.ip_suffix)
            .field("password", &"<redacted>")
            .field("vm_name", &self.vm_name)
            .field("cpu_count", &self.cpu_count)
            .field("memory_gb", &self.memory_gb)
            .field("disk_size_gb", &self.disk_size_gb)
            .finish()
    }
}

impl ProvisioningRequest {
    /// Run every field check. There is no partial acceptance: any failure
    /// rejects the whole request, reporting all failing fields at once.
    pub fn validate(raw: &RawRequest) -> Result<Self, Rejected> {
        let mut errors = Vec::new();
        let ip_suffix = collect(validate_ip_suffix(&raw.ip_suffix), &mut errors);
        let password = collect(validate_password(&raw.password), &mut errors);
        let vm_name = collect(validate_vm_name(&raw.vm_name), &mut errors);
        let cpu_count = collect(validate_cpu_count(&raw.cpu_count), &mut errors);
        let memory_gb = collect(validate_memory_gb(&raw.memory_gb), &mut errors);
        let disk_size_gb = collect(validate_disk_size_gb(&raw.disk_size_gb), &mut errors);

        match (ip_suffix, password, vm_name, cpu_count, memory_gb, disk_size_gb) {
            (
                Some(ip_suffix),
                Some(()),
                Some(()),
                Some(cpu_count),
                Some(memory_gb),
                Some(disk_size_gb),
            ) if errors.is_empty() => {
                Ok(Self {
                    ip_suffix,
                    password: raw.password.clone(),
                    vm_name: raw.vm_name.clone(),
                    cpu_count,
                    memory_gb,
                    disk_size_gb,
                })
            }
            _ => Err(Rejected(errors)),
        }
    }

    pub fn ip_suffix(&self) -> u8 {
        self.ip_suffix
    }

    pub fn password(&self) -> &str {
        &self.password
    }

    pub fn vm_name(&self) -> &str {
        &self.vm_name
    }

    pub fn cpu_count(&self) -> u32 {
        self.cpu_count
    }

    pub fn memory_gb(&self) -> u32 {
        self.memory_gb
    }

    pub fn memory_mb(&self) -> u32 {
        self.memory_gb * 1024
    }

    pub fn disk_size_gb(&self) -> u32 {
        self.disk_size_gb
    }
}

/// Execute the `validate` command: check the request and report.
pub fn run(args: RequestArgs) -> Result<()> {
    match ProvisioningRequest::validate(&args.into()) {
        Ok(request) => {
            tracing::debug!("Accepted {request:?}");
            println!("ok");
            Ok(())
        }
        Err(rejected) => Err(eyre!(rejected)),
    }
}
