//! Integration test harness
//!
//! Runs every integration test target and reports a summary.
//!
//! # Usage
//!
//! Run all targets:
//! ```text
//! cargo run -p integration-tests
//! ```
//!
//! Run one target directly:
//! ```text
//! cargo test -p integration-tests --test session_tests
//! cargo test -p integration-tests --test channel_tests
//! cargo test -p integration-tests --test dgc_tests
//! ```
//!
//! Increase logging with `RUST_LOG=debug`.

use std::process::Command;
use std::time::Instant;

const TARGETS: &[&str] = &["session_tests", "channel_tests", "dgc_tests"];

fn main() {
    let mut failures = Vec::new();
    let started = Instant::now();

    for target in TARGETS {
        println!("==> running {target}");
        let begin = Instant::now();
        let status = Command::new("cargo")
            .args(["test", "-p", "integration-tests", "--test", target])
            .status()
            .expect("failed to launch cargo");
        let elapsed = begin.elapsed();
        if status.success() {
            println!("==> {target} passed in {elapsed:.2?}");
        } else {
            println!("==> {target} FAILED in {elapsed:.2?}");
            failures.push(*target);
        }
    }

    println!();
    println!(
        "{} of {} targets passed in {:.2?}",
        TARGETS.len() - failures.len(),
        TARGETS.len(),
        started.elapsed()
    );
    if !failures.is_empty() {
        for target in &failures {
            println!("FAILED: {target}");
        }
        std::process::exit(1);
    }
}
