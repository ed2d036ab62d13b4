//! Result-set formatting and `log`/`env_logger` wiring. Grounded on
//! `original_source/include/utils/logger.h`/`src/utils/logger.cpp`'s
//! `tabulate`/`tabulate_interactive`/`tabulate_batch`, dispatching on batch
//! mode the same way the original's `Config::batch_mode` check does.

/// Initializes the process-wide logger once, from `main.rs`. `RUST_LOG`
/// controls verbosity; defaults to `info` for this binary.
pub fn init() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
}

/// A rectangular result set: `header` names the columns, `rows` holds one
/// `Vec<String>` per row, each exactly `header.len()` long.
pub struct ResultTable<'a> {
    pub header: &'a [String],
    pub rows: &'a [Vec<String>],
}

impl ResultTable<'_> {
    /// Renders a bordered, column-width-aligned table (interactive mode) or
    /// CSV (batch mode), mirroring `Logger::tabulate`'s dispatch.
    pub fn render(&self, batch: bool) -> String {
        if batch {
            self.render_batch()
        } else {
            self.render_interactive()
        }
    }

    fn render_batch(&self) -> String {
        let mut out = String::new();
        out.push_str(&self.header.join(","));
        out.push('\n');
        for row in self.rows {
            out.push_str(&row.join(","));
            out.push('\n');
        }
        out
    }

    fn render_interactive(&self) -> String {
        let ncol = self.header.len();
        let mut width = vec![0usize; ncol];
        for (i, h) in self.header.iter().enumerate() {
            width[i] = width[i].max(h.len());
        }
        for row in self.rows {
            for (i, cell) in row.iter().enumerate() {
                width[i] = width[i].max(cell.len());
            }
        }

        let hline = {
            let mut s = String::from("+");
            for w in &width {
                s.push_str(&"-".repeat(w + 2));
                s.push('+');
            }
            s
        };

        let mut out = String::new();
        out.push_str(&hline);
        out.push('\n');
        out.push_str(&render_row(self.header, &width));
        out.push('\n');
        out.push_str(&hline);
        out.push('\n');
        for row in self.rows {
            out.push_str(&render_row(row, &width));
            out.push('\n');
        }
        out.push_str(&hline);
        out
    }
}

fn render_row(cells: &[String], width: &[usize]) -> String {
    let mut s = String::from("|");
    for (cell, w) in cells.iter().zip(width) {
        s.push(' ');
        s.push_str(&" ".repeat(w - cell.len()));
        s.push_str(cell);
        s.push_str(" |");
    }
    s
}

/// The `{"!ERROR", reason}` diagnostic row spec §7 requires on statement
/// failure.
pub fn error_row(reason: &str) -> String {
    format!("!ERROR,{reason}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn batch_mode_renders_csv() {
        let header = vec!["id".to_string(), "name".to_string()];
        let rows = vec![vec!["1".to_string(), "ada".to_string()]];
        let table = ResultTable { header: &header, rows: &rows };
        assert_eq!(table.render(true), "id,name\n1,ada\n");
    }

    #[test]
    fn interactive_mode_pads_columns_to_widest_cell() {
        let header = vec!["id".to_string(), "name".to_string()];
        let rows = vec![vec!["1".to_string(), "alexandria".to_string()]];
        let table = ResultTable { header: &header, rows: &rows };
        let rendered = table.render(false);
        assert!(rendered.contains("alexandria"));
        assert!(rendered.starts_with('+'));
    }

    #[test]
    fn error_row_matches_spec_shape() {
        assert_eq!(error_row("no such table: foo"), "!ERROR,no such table: foo");
    }
}
