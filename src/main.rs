use clap::Parser;
use mimalloc::MiMalloc;

// Use MiMalloc for better performance when scanning images in parallel
#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

use meripper::cmd::Cmd;

fn main() {
    if let Err(e) = Cmd::parse().run() {
        eprintln!("\nERROR: {:#}", e);
        std::process::exit(1);
    }
}
