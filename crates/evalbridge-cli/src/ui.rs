//! Terminal output: titled reports of aligned fields, and one-line notices.

use colored::{ColoredString, Colorize};
use std::fmt::Display;

/// Emphasis for a report value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tone {
    Plain,
    Good,
    Caution,
}

impl Tone {
    fn paint(self, value: &str) -> ColoredString {
        match self {
            Tone::Plain => value.normal(),
            Tone::Good => value.bright_green(),
            Tone::Caution => value.bright_yellow(),
        }
    }
}

/// A title followed by label/value rows, labels padded to the longest one.
#[derive(Debug)]
pub struct Report {
    title: String,
    rows: Vec<(String, String, Tone)>,
}

impl Report {
    pub fn new(title: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            rows: Vec::new(),
        }
    }

    pub fn field(&mut self, label: &str, value: impl Display) -> &mut Self {
        self.field_toned(label, value, Tone::Plain)
    }

    pub fn field_toned(&mut self, label: &str, value: impl Display, tone: Tone) -> &mut Self {
        self.rows.push((label.to_string(), value.to_string(), tone));
        self
    }

    fn render(&self) -> String {
        let width = self.rows.iter().map(|(l, _, _)| l.len()).max().unwrap_or(0);
        let mut out = format!("{} {}\n", "::".bright_cyan().bold(), self.title.bold());
        for (label, value, tone) in &self.rows {
            let label = format!("{label:<width$}");
            out.push_str(&format!("  {}  {}\n", label.dimmed(), tone.paint(value)));
        }
        out
    }

    pub fn print(&self) {
        print!("{}", self.render());
    }
}

/// Completed action.
pub fn done(msg: &str) {
    println!("{} {}", "\u{2714}".bright_green(), msg);
}

/// Secondary information, dimmed.
pub fn note(msg: &str) {
    println!("{}", msg.dimmed());
}

/// Failure on stderr, with a suggested fix when one is known.
pub fn failure(msg: &str, fix: Option<&str>) {
    eprintln!("{} {}", "\u{2718}".bright_red(), msg.bright_red());
    if let Some(fix) = fix {
        eprintln!("  {} {}", "try:".bright_yellow(), fix);
    }
}
