//! Version command implementation.

/// Version information for the CLI.
const VERSION: &str = env!("CARGO_PKG_VERSION");
const NAME: &str = env!("CARGO_PKG_NAME");

pub fn run() {
    println!("{NAME} {VERSION}");
    println!();
    println!("Local standalone, replica set and sharded cluster launcher.");
    println!();
    println!("Build info:");
    println!("  Target:       {}", std::env::consts::ARCH);
    println!("  OS:           {}", std::env::consts::OS);
}
