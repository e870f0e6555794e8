//! Test registration for the cvk integration suite.
//!
//! Each test is a plain function registered into [`INTEGRATION_TESTS`] with
//! the [`integration_test!`] macro; the harness binary collects the slice
//! and hands it to libtest-mimic.

use color_eyre::Result;

/// A registered integration test.
#[derive(Debug)]
pub struct IntegrationTest {
    pub name: &'static str,
    pub f: fn() -> Result<()>,
}

impl IntegrationTest {
    pub const fn new(name: &'static str, f: fn() -> Result<()>) -> Self {
        Self { name, f }
    }
}

#[linkme::distributed_slice]
pub static INTEGRATION_TESTS: [IntegrationTest];

/// Register a `fn() -> Result<()>` as an integration test.
#[macro_export]
macro_rules! integration_test {
    ($fn:ident) => {
        const _: () = {
            #[::linkme::distributed_slice($crate::INTEGRATION_TESTS)]
            static TEST: $crate::IntegrationTest =
                $crate::IntegrationTest::new(stringify!($fn), $fn);
        };
    };
}
