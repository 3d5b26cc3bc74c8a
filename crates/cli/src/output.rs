//! Output formatting utilities

use clap::ValueEnum;
use colored::Colorize;

/// Output format for CLI commands
#[derive(Debug, Clone, Copy, Default, ValueEnum)]
pub enum OutputFormat {
    /// Table format (default)
    #[default]
    Table,
    /// JSON format
    Json,
}

/// Print a success message
pub fn print_success(message: &str) {
    println!("{} {}", "✓".green().bold(), message);
}

/// Print a warning message
pub fn print_warning(message: &str) {
    println!("{} {}", "⚠".yellow().bold(), message);
}

/// Print an info message
pub fn print_info(message: &str) {
    println!("{} {}", "ℹ".blue().bold(), message);
}

/// Format an hourly price delta; negative saves money
pub fn format_cost_delta(delta: Option<f64>) -> String {
    match delta {
        Some(d) if d < 0.0 => format!("-${:.4}/h", d.abs()).green().to_string(),
        Some(d) => format!("+${:.4}/h", d).red().to_string(),
        None => "-".to_string(),
    }
}

/// Format a unix timestamp as UTC
pub fn format_timestamp(ts: i64) -> String {
    chrono::DateTime::from_timestamp(ts, 0)
        .map(|dt| dt.format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_else(|| ts.to_string())
}

/// Color status based on value
pub fn color_status(status: &str) -> String {
    match status.to_lowercase().as_str() {
        "running" | "confirmed" | "success" | "graduated" => status.green().to_string(),
        "switching" | "draining" | "initiated" | "candidate" => status.yellow().to_string(),
        "zombie_terminating" | "rolled_back" => status.yellow().to_string(),
        "failed" | "terminated" | "archived" => status.red().to_string(),
        _ => status.to_string(),
    }
}
