//! Integration tests for cvk

use camino::Utf8Path;

use color_eyre::eyre::eyre;
use color_eyre::Result;
use libtest_mimic::{Arguments, Trial};

pub(crate) use integration_tests::{integration_test, INTEGRATION_TESTS};

mod tests {
    pub mod fetch_image;
    pub mod render_payload;
    pub mod validate;
}

/// Get the path to the cvk binary, checking CVK_PATH env var first, then falling back to "cvk"
pub(crate) fn get_cvk_command() -> Result<String> {
    if let Ok(path) = std::env::var("CVK_PATH") {
        return Ok(path);
    }
    // Force the user to set this if we're running from the project dir
    if let Some(path) = ["target/debug/cvk", "target/release/cvk"]
        .into_iter()
        .find(|p| Utf8Path::new(p).exists())
    {
        return Err(eyre!(
            "Detected {path} - set CVK_PATH={path} to run using this binary"
        ));
    }
    Ok("cvk".to_owned())
}

fn main() {
    if std::env::consts::OS != "linux" {
        eprintln!(
            "Integration tests are only supported on Linux (current OS: {})",
            std::env::consts::OS
        );
        eprintln!("Skipping all integration tests.");
        std::process::exit(0);
    }

    let args = Arguments::from_args();

    let tests: Vec<Trial> = INTEGRATION_TESTS
        .iter()
        .map(|test| {
            let name = test.name;
            let f = test.f;
            Trial::test(name, move || f().map_err(|e| format!("{:?}", e).into()))
        })
        .collect();

    libtest_mimic::run(&args, tests).exit();
}
