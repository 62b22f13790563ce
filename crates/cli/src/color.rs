// SPDX-License-Identifier: MIT

//! Terminal color handling for `cronicled`'s own output, independent of
//! `tracing-subscriber`'s log formatting. Priority: `NO_COLOR=1` disables,
//! `COLOR=1` forces, otherwise a TTY check — spec.md §6's `--nocolor` flag
//! is the fourth override, applied by the caller before anything here
//! checks the environment.

use clap::builder::styling::{Ansi256Color, Color, Style, Styles};
use std::io::IsTerminal;
use std::sync::atomic::{AtomicBool, Ordering};

pub mod codes {
    pub const HEADER: u8 = 74;
    pub const LITERAL: u8 = 250;
    pub const CONTEXT: u8 = 245;
}

static FORCE_PLAIN: AtomicBool = AtomicBool::new(false);

/// Set by `--nocolor` before any other output is produced.
pub fn force_plain() {
    FORCE_PLAIN.store(true, Ordering::Relaxed);
}

pub fn should_colorize() -> bool {
    if FORCE_PLAIN.load(Ordering::Relaxed) {
        return false;
    }
    if std::env::var("NO_COLOR").is_ok_and(|v| v == "1") {
        return false;
    }
    if std::env::var("COLOR").is_ok_and(|v| v == "1") {
        return true;
    }
    std::io::stdout().is_terminal()
}

pub fn styles() -> Styles {
    if !should_colorize() {
        return Styles::plain();
    }
    Styles::styled()
        .header(Style::new().fg_color(Some(Color::Ansi256(Ansi256Color(codes::HEADER)))))
        .literal(Style::new().fg_color(Some(Color::Ansi256(Ansi256Color(codes::LITERAL)))))
        .placeholder(Style::new().fg_color(Some(Color::Ansi256(Ansi256Color(codes::CONTEXT)))))
}

fn fg256(code: u8) -> String {
    format!("\x1b[38;5;{code}m")
}

const RESET: &str = "\x1b[0m";

pub fn header(text: &str) -> String {
    if should_colorize() {
        format!("{}{}{}", fg256(codes::HEADER), text, RESET)
    } else {
        text.to_string()
    }
}

pub fn context(text: &str) -> String {
    if should_colorize() {
        format!("{}{}{}", fg256(codes::CONTEXT), text, RESET)
    } else {
        text.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    #[serial]
    fn no_color_env_disables_regardless_of_tty() {
        std::env::set_var("NO_COLOR", "1");
        assert!(!should_colorize());
        std::env::remove_var("NO_COLOR");
    }

    #[test]
    #[serial]
    fn color_env_forces_on() {
        std::env::set_var("COLOR", "1");
        assert!(should_colorize());
        std::env::remove_var("COLOR");
    }
}
