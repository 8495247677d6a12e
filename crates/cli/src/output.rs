//! Output formatting for CLI

use colored::Colorize;

/// Print success message
pub fn print_success(message: &str) {
    println!("{} {}", "✔".green().bold(), message);
}

/// Print warning message
pub fn print_warning(message: &str) {
    eprintln!("{} {}", "!".yellow().bold(), message);
}

/// Print info message
pub fn print_info(message: &str) {
    println!("{} {}", "ℹ".cyan().bold(), message);
}
