//! Plain-text table rendering for the CLI: `simple`, `grid`, `html` and
//! `latex` output shapes.

use std::fmt;
use std::str::FromStr;

use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TableFormat {
    #[default]
    Simple,
    Grid,
    Html,
    Latex,
}

#[derive(Error, Debug)]
#[error("'{0}' is not a table format (simple, grid, html, latex)")]
pub struct ParseTableFormatError(String);

impl FromStr for TableFormat {
    type Err = ParseTableFormatError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.to_ascii_lowercase().as_str() {
            "simple" => Ok(TableFormat::Simple),
            "grid" => Ok(TableFormat::Grid),
            "html" => Ok(TableFormat::Html),
            "latex" => Ok(TableFormat::Latex),
            other => Err(ParseTableFormatError(other.to_string())),
        }
    }
}

impl fmt::Display for TableFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TableFormat::Simple => "simple",
            TableFormat::Grid => "grid",
            TableFormat::Html => "html",
            TableFormat::Latex => "latex",
        };
        f.write_str(name)
    }
}

/// Renders `rows` under `headers` in the requested format. Rows shorter than
/// the header count are padded with empty cells.
pub fn render(format: TableFormat, headers: &[&str], rows: &[Vec<String>]) -> String {
    match format {
        TableFormat::Simple => render_simple(headers, rows),
        TableFormat::Grid => render_grid(headers, rows),
        TableFormat::Html => render_html(headers, rows),
        TableFormat::Latex => render_latex(headers, rows),
    }
}

fn column_widths(headers: &[&str], rows: &[Vec<String>]) -> Vec<usize> {
    let mut widths: Vec<usize> = headers.iter().map(|h| h.len()).collect();
    for row in rows {
        for (i, cell) in row.iter().enumerate().take(widths.len()) {
            widths[i] = widths[i].max(cell.len());
        }
    }
    widths
}

fn cell<'a>(row: &'a [String], index: usize) -> &'a str {
    row.get(index).map(String::as_str).unwrap_or("")
}

fn render_simple(headers: &[&str], rows: &[Vec<String>]) -> String {
    let widths = column_widths(headers, rows);
    let mut out = String::new();

    let header_line: Vec<String> = headers
        .iter()
        .zip(&widths)
        .map(|(h, w)| format!("{h:<w$}"))
        .collect();
    out.push_str(header_line.join("  ").trim_end());
    out.push('\n');

    let rule: Vec<String> = widths.iter().map(|w| "-".repeat(*w)).collect();
    out.push_str(&rule.join("  "));
    out.push('\n');

    for row in rows {
        let line: Vec<String> = widths
            .iter()
            .enumerate()
            .map(|(i, w)| format!("{:<w$}", cell(row, i)))
            .collect();
        out.push_str(line.join("  ").trim_end());
        out.push('\n');
    }

    out
}

fn render_grid(headers: &[&str], rows: &[Vec<String>]) -> String {
    let widths = column_widths(headers, rows);
    let mut out = String::new();

    let rule = |fill: char| {
        let segments: Vec<String> = widths.iter().map(|w| fill.to_string().repeat(w + 2)).collect();
        format!("+{}+\n", segments.join("+"))
    };

    out.push_str(&rule('-'));
    let header_cells: Vec<String> = headers
        .iter()
        .zip(&widths)
        .map(|(h, w)| format!(" {h:<w$} "))
        .collect();
    out.push_str(&format!("|{}|\n", header_cells.join("|")));
    out.push_str(&rule('='));

    for row in rows {
        let cells: Vec<String> = widths
            .iter()
            .enumerate()
            .map(|(i, w)| format!(" {:<w$} ", cell(row, i)))
            .collect();
        out.push_str(&format!("|{}|\n", cells.join("|")));
        out.push_str(&rule('-'));
    }

    out
}

fn escape_html(value: &str) -> String {
    value
        .replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}

fn render_html(headers: &[&str], rows: &[Vec<String>]) -> String {
    let mut out = String::from("<table>\n<thead>\n<tr>");
    for header in headers {
        out.push_str(&format!("<th>{}</th>", escape_html(header)));
    }
    out.push_str("</tr>\n</thead>\n<tbody>\n");

    for row in rows {
        out.push_str("<tr>");
        for i in 0..headers.len() {
            out.push_str(&format!("<td>{}</td>", escape_html(cell(row, i))));
        }
        out.push_str("</tr>\n");
    }

    out.push_str("</tbody>\n</table>\n");
    out
}

fn escape_latex(value: &str) -> String {
    value
        .replace('\\', "\\textbackslash{}")
        .replace('&', "\\&")
        .replace('%', "\\%")
        .replace('_', "\\_")
        .replace('#', "\\#")
}

fn render_latex(headers: &[&str], rows: &[Vec<String>]) -> String {
    let spec = "l".repeat(headers.len());
    let mut out = format!("\\begin{{tabular}}{{{spec}}}\n\\hline\n");

    let header_cells: Vec<String> = headers.iter().map(|h| escape_latex(h)).collect();
    out.push_str(&format!("{} \\\\\n\\hline\n", header_cells.join(" & ")));

    for row in rows {
        let cells: Vec<String> = (0..headers.len())
            .map(|i| escape_latex(cell(row, i)))
            .collect();
        out.push_str(&format!("{} \\\\\n", cells.join(" & ")));
    }

    out.push_str("\\hline\n\\end{tabular}\n");
    out
}
