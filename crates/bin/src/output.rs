//! Output formatting helpers for human-readable and JSON output.

use lansync::PeerInfo;

use crate::cli::Format;

/// Print a table with aligned columns in human-readable format.
///
/// `headers` and each row in `rows` must have the same length.
pub fn print_table(headers: &[&str], rows: &[Vec<String>]) {
    if rows.is_empty() {
        return;
    }

    // Calculate column widths (max of header and all row values)
    let col_count = headers.len();
    let mut widths: Vec<usize> = headers.iter().map(|h| h.len()).collect();
    for row in rows {
        for (i, cell) in row.iter().enumerate().take(col_count) {
            widths[i] = widths[i].max(cell.len());
        }
    }

    let header_line: Vec<String> = headers
        .iter()
        .enumerate()
        .map(|(i, h)| format!("{:<width$}", h, width = widths[i]))
        .collect();
    println!("{}", header_line.join("  "));

    for row in rows {
        let line: Vec<String> = row
            .iter()
            .enumerate()
            .take(col_count)
            .map(|(i, cell)| format!("{:<width$}", cell, width = widths[i]))
            .collect();
        println!("{}", line.join("  "));
    }
}

/// Print peers as a table or a JSON array.
pub fn print_peers(peers: &[PeerInfo], format: Format) -> Result<(), serde_json::Error> {
    match format {
        Format::Human => {
            if peers.is_empty() {
                println!("No peers");
                return Ok(());
            }
            let rows: Vec<Vec<String>> = peers
                .iter()
                .map(|p| {
                    vec![
                        p.peer_id.to_string(),
                        p.display_name.clone(),
                        p.endpoint(),
                        p.last_seen.format("%H:%M:%S").to_string(),
                    ]
                })
                .collect();
            print_table(&["PEER ID", "NAME", "ADDRESS", "LAST SEEN"], &rows);
        }
        Format::Json => println!("{}", serde_json::to_string(peers)?),
    }
    Ok(())
}
