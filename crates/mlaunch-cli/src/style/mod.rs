//! Terminal styling for mlaunch output.
//!
//! `colors` holds the palette, `output` the cluster summaries, `table` the
//! process table and `spinner` the progress indicators.

use std::sync::atomic::{AtomicBool, Ordering};

pub mod colors;
pub mod output;
pub mod spinner;
pub mod table;

pub use output::*;
pub use spinner::*;
pub use table::*;

static NO_COLOR: AtomicBool = AtomicBool::new(false);

/// Turns colors off for `--no-color` or a set `NO_COLOR` variable.
pub fn init_color(no_color_flag: bool) {
    set_no_color(no_color_flag || std::env::var_os("NO_COLOR").is_some());
}

pub fn set_no_color(value: bool) {
    NO_COLOR.store(value, Ordering::Relaxed);
}

pub fn no_color() -> bool {
    NO_COLOR.load(Ordering::Relaxed)
}
