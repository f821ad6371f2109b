//! Status output. Goes to stderr so stdout carries only payload.

use colored::Colorize;

pub fn success(msg: &str) {
    eprintln!("  {} {}", "\u{2714}".bright_green(), msg);
}

pub fn hint(msg: &str) {
    eprintln!("  {} {}", "-".bright_yellow(), msg.yellow());
}

pub fn error(msg: &str) {
    eprintln!("  {} {}", "\u{2718}".bright_red(), msg.bright_red());
}
