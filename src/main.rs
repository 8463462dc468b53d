//! scoutctl - contract scanner query tool
//!
//! Command-line interface for inspecting contracts, analyses and
//! checkpoints recorded in a scanner RocksDB database.

use contract_scout::cli;

fn main() {
    if let Err(e) = cli::run() {
        eprintln!("Error: {:#}", e);
        std::process::exit(1);
    }
}
