#![deny(clippy::pedantic, clippy::all, clippy::nursery)]
#![allow(clippy::must_use_candidate)]

#[cfg(not(any(target_os = "macos", unix)))]
compile_error!("Only macos and unix are currently supported");

use clap::Parser;
use empath::controller::{Args, Empath};

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    Empath::new(&args)?.run()
}
