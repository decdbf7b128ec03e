//! Command line program for running `nestlink` simulator sessions.

#[macro_use]
extern crate log;

pub mod cli;

use colored::*;

fn main() {
    match cli::start(cli::app_matches()) {
        Ok(_) => (),
        Err(e) => {
            println!("{}{}", "error: ".red(), e);
            if e.root_cause().to_string() != e.to_string() {
                println!("Caused by:\n{}", e.root_cause())
            }
        }
    }
}
