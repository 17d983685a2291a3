//! Color palette shared by messages and process tables.

use std::fmt::Display;

use comfy_table::Color;
use owo_colors::{OwoColorize, Style};

/// What a piece of output means, independent of where it is rendered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tone {
    Success,
    Error,
    Warning,
    Muted,
    Header,
    Code,
}

impl Tone {
    fn style(self) -> Style {
        match self {
            Self::Success => Style::new().green().bold(),
            Self::Error => Style::new().red().bold(),
            Self::Warning => Style::new().yellow(),
            Self::Muted => Style::new().dimmed(),
            Self::Header => Style::new().bold(),
            Self::Code => Style::new().blue(),
        }
    }

    /// The table cell color for the same meaning.
    pub fn cell_color(self) -> Color {
        match self {
            Self::Success => Color::Green,
            Self::Error => Color::Red,
            Self::Warning => Color::Yellow,
            Self::Muted => Color::DarkGrey,
            Self::Header => Color::Cyan,
            Self::Code => Color::Blue,
        }
    }
}

/// Renders `text` in `tone`, or plain when colors are off.
pub fn paint(text: impl Display, tone: Tone) -> String {
    if super::no_color() {
        text.to_string()
    } else {
        text.style(tone.style()).to_string()
    }
}

/// Shorthands for [`paint`].
pub trait SemanticStyle: Display {
    fn success(&self) -> String {
        paint(self, Tone::Success)
    }

    fn error(&self) -> String {
        paint(self, Tone::Error)
    }

    fn warning(&self) -> String {
        paint(self, Tone::Warning)
    }

    fn muted(&self) -> String {
        paint(self, Tone::Muted)
    }

    fn header(&self) -> String {
        paint(self, Tone::Header)
    }

    fn code(&self) -> String {
        paint(self, Tone::Code)
    }
}

impl<T: Display + ?Sized> SemanticStyle for T {}
