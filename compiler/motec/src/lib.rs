//! The mote lowering driver.
//!
//! Loads one IR file per package, links them into a single module, runs the
//! lowering pipeline and prints the result. Failures are collected as
//! diagnostics and rendered by the binary.

pub mod driver;
pub mod load;
pub mod options;

use std::sync::Once;

pub use driver::{lower_packages, write_outputs, Lowered};
pub use load::{load_package, load_packages, LoadError};
pub use options::{parse_options, DriverOptions, OptionError};

/// Environment variable selecting the indented span tree output.
pub const LOG_TREE_ENV: &str = "MOTE_LOG_TREE";

static TRACING_INIT: Once = Once::new();

/// Initialize tracing from `RUST_LOG`.
///
/// Does nothing when `RUST_LOG` is unset. Safe to call more than once.
/// Enable with `RUST_LOG=mote_lower=debug`; set `MOTE_LOG_TREE=1` as well
/// to see pass spans as a tree.
pub fn init_tracing() {
    TRACING_INIT.call_once(|| {
        use tracing_subscriber::{fmt, prelude::*, EnvFilter};

        if std::env::var("RUST_LOG").is_err() {
            return;
        }
        let registry = tracing_subscriber::registry().with(EnvFilter::from_default_env());
        if std::env::var_os(LOG_TREE_ENV).is_some() {
            registry
                .with(
                    tracing_tree::HierarchicalLayer::new(2)
                        .with_targets(true)
                        .with_bracketed_fields(true),
                )
                .init();
        } else {
            registry
                .with(
                    fmt::layer()
                        .with_target(true)
                        .with_level(true)
                        .with_writer(std::io::stderr),
                )
                .init();
        }
    });
}
