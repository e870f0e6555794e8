//! Interactive collection of request fields not given on the command line.
//!
//! Each prompt re-asks until its field check passes. Values supplied as
//! flags are passed through untouched; the validation stage judges them.

use std::io::IsTerminal;

use color_eyre::eyre::Context;
use color_eyre::Result;
use dialoguer::{Input, Password};

use crate::validate::{self, FieldError, RawRequest, RequestArgs};

fn ask(prompt: &str, check: fn(&str) -> Result<(), FieldError>) -> Result<String> {
    Input::<String>::new()
        .with_prompt(prompt)
        .validate_with(|input: &String| check(input).map_err(|e| e.reason))
        .interact_text()
        .with_context(|| format!("Reading {prompt:?}"))
}

fn ask_password() -> Result<String> {
    loop {
        let pw = Password::new()
            .with_prompt("Enter the password for the VM (min 6 chars, no spaces)")
            .interact()
            .context("Reading password")?;
        match validate::validate_password(&pw) {
            Ok(()) => return Ok(pw),
            Err(e) => eprintln!("{}", e.reason),
        }
    }
}

/// Fill in every missing field of `args`, prompting on the terminal.
///
/// Without a terminal on stdin nothing is asked; missing fields stay empty
/// and are rejected by validation.
pub fn complete_request(args: RequestArgs) -> Result<RawRequest> {
    if !std::io::stdin().is_terminal() {
        return Ok(args.into());
    }
    let ip_suffix = match args.ip_suffix {
        Some(v) => v,
        None => ask("Enter the last octet of the IP address (1-254)", |s| {
            validate::validate_ip_suffix(s).map(drop)
        })?,
    };
    let password = match args.password {
        Some(v) => v,
        None => ask_password()?,
    };
    let vm_name = match args.name {
        Some(v) => v,
        None => ask(
            "Enter the VM name (letters, numbers, and hyphen only)",
            validate::validate_vm_name,
        )?,
    };
    let cpu_count = match args.cpus {
        Some(v) => v,
        None => ask("Enter the number of CPUs (1-16)", |s| {
            validate::validate_cpu_count(s).map(drop)
        })?,
    };
    let memory_gb = match args.memory {
        Some(v) => v,
        None => ask("Enter the memory size in GB (1-32)", |s| {
            validate::validate_memory_gb(s).map(drop)
        })?,
    };
    let disk_size_gb = match args.disk_size {
        Some(v) => v,
        None => ask("Enter the disk size in GB (10-2048)", |s| {
            validate::validate_disk_size_gb(s).map(drop)
        })?,
    };
    Ok(RawRequest {
        ip_suffix,
        password,
        vm_name,
        cpu_count,
        memory_gb,
        disk_size_gb,
    })
}
