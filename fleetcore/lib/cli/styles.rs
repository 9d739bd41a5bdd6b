use std::{fmt::Write, sync::LazyLock};

use clap::builder::styling::{AnsiColor, Effects, Style, Styles};

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// Whether stdout is a terminal that understands ANSI escapes.
static IS_ANSI_TERMINAL: LazyLock<bool> =
    LazyLock::new(fleetutils::term::is_ansi_interactive_terminal);

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// The styles used for help output and status tables.
pub fn styles() -> Styles {
    Styles::styled()
        .header(AnsiColor::Yellow.on_default() | Effects::BOLD)
        .usage(AnsiColor::Yellow.on_default() | Effects::BOLD)
        .literal(AnsiColor::Blue.on_default() | Effects::BOLD)
        .placeholder(AnsiColor::Green.on_default())
        .error(AnsiColor::Red.on_default() | Effects::BOLD)
        .valid(AnsiColor::Green.on_default() | Effects::BOLD)
        .invalid(AnsiColor::Red.on_default() | Effects::BOLD)
}

fn apply_style(text: &str, style: &Style, enabled: bool) -> String {
    if !enabled {
        return text.to_string();
    }

    let mut styled = String::with_capacity(text.len() + 16);
    let _ = write!(styled, "{style}{text}{}", style.render_reset());
    styled
}

//--------------------------------------------------------------------------------------------------
// Traits
//--------------------------------------------------------------------------------------------------

/// Applies the [`styles`] to text when stdout is an ANSI terminal.
pub trait AnsiStyles {
    /// Header style.
    fn header(&self) -> String;

    /// Literal style.
    fn literal(&self) -> String;

    /// Style for healthy or successful states.
    fn valid(&self) -> String;

    /// Style for failed or unhealthy states.
    fn invalid(&self) -> String;
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

impl<T: AsRef<str> + ?Sized> AnsiStyles for T {
    fn header(&self) -> String {
        apply_style(self.as_ref(), styles().get_header(), *IS_ANSI_TERMINAL)
    }

    fn literal(&self) -> String {
        apply_style(self.as_ref(), styles().get_literal(), *IS_ANSI_TERMINAL)
    }

    fn valid(&self) -> String {
        apply_style(self.as_ref(), styles().get_valid(), *IS_ANSI_TERMINAL)
    }

    fn invalid(&self) -> String {
        apply_style(self.as_ref(), styles().get_invalid(), *IS_ANSI_TERMINAL)
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_apply_style_disabled_is_plain() {
        assert_eq!(apply_style("ready", styles().get_valid(), false), "ready");
    }

    #[test]
    fn test_apply_style_enabled_wraps_text() {
        let styled = apply_style("failed", styles().get_invalid(), true);
        assert!(styled.contains("\x1b[1m"));
        assert!(styled.contains("\x1b[31m"));
        assert!(styled.contains("failed"));
        assert!(styled.ends_with("\x1b[0m"));
    }
}
