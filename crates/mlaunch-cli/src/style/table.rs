//! Table formatting using comfy-table.

use comfy_table::modifiers::UTF8_ROUND_CORNERS;
use comfy_table::presets::UTF8_FULL;
use comfy_table::{Attribute, Cell, ContentArrangement, Table};
use mlaunch_cluster::ProcessReport;

use super::colors::{SemanticStyle, Tone};
use super::output::{endpoint, health};

const HEADERS: [&str; 6] = ["Process", "Role", "Port", "PID", "Replica Set", "Status"];

fn toned_cell(text: &str, tone: Tone) -> Cell {
    if super::no_color() {
        Cell::new(text)
    } else {
        Cell::new(text).fg(tone.cell_color())
    }
}

/// Creates a styled table with one row per cluster process.
pub fn process_table(processes: &[ProcessReport]) -> Table {
    let mut table = Table::new();

    table
        .load_preset(UTF8_FULL)
        .apply_modifier(UTF8_ROUND_CORNERS)
        .set_content_arrangement(ContentArrangement::Dynamic);

    let header_cells: Vec<Cell> = HEADERS
        .iter()
        .map(|col| toned_cell(col, Tone::Header).add_attribute(Attribute::Bold))
        .collect();
    table.set_header(header_cells);

    for process in processes {
        let (status, tone) = health(process);
        table.add_row(vec![
            Cell::new(&process.id),
            Cell::new(process.role),
            Cell::new(endpoint(&process.host, process.port)),
            Cell::new(process.pid),
            Cell::new(process.replica_set.as_deref().unwrap_or("-")),
            toned_cell(status, tone),
        ]);
    }

    table
}

/// Prints the process table with a count footer.
pub fn print_process_table(processes: &[ProcessReport]) {
    if processes.is_empty() {
        println!("{}", "No processes recorded.".muted());
        return;
    }

    println!("{}", process_table(processes));

    let count = processes.len();
    let word = if count == 1 { "process" } else { "processes" };
    println!("{}", format!("({count} {word})").muted());
}
