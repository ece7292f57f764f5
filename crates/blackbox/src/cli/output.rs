//! Output formatting utilities

use console::{style, Style};

/// Print a success message
pub fn success(message: &str) {
    println!("{} {}", style("✓").green().bold(), message);
}

/// Print an error message
pub fn error(message: &str) {
    eprintln!("{} {}", style("✗").red().bold(), message);
}

/// Print a warning message
pub fn warning(message: &str) {
    println!("{} {}", style("!").yellow().bold(), message);
}

/// Create a styled header
pub fn header(text: &str) -> String {
    style(text).bold().to_string()
}

/// Create a styled key-value line
pub fn key_value(key: &str, value: &str) -> String {
    format!("  {}: {}", style(key).dim(), value)
}

/// Style for paths
pub fn path_style() -> Style {
    Style::new().cyan()
}

/// Print an indented block, keeping at most `limit` lines
pub fn excerpt(text: &str, indent: usize, limit: usize) {
    let pad = " ".repeat(indent);
    for line in text.lines().take(limit) {
        println!("{pad}{}", style(line).dim());
    }
    if text.lines().count() > limit {
        println!("{pad}{}", style("...").dim());
    }
}
