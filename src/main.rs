//! ledgerctl - ledger store CLI tool
//!
//! Operator command-line interface for inspecting and repairing the
//! persistent ledger state.

use ledgersync::cli;

fn main() {
    if let Err(e) = cli::run() {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}
