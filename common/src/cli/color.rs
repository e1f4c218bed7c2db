//! Standardized CLI color policy.
//!
//! - Command-line choice wins.
//! - `NO_COLOR` disables colors.
//! - `EMACS` implies non-interactive output.
//! - In `Auto`, only enable colors when the target stream is a TTY.

use std::env;

/// When to emit ANSI colors. Usable directly as a `--color` value.
#[derive(clap::ValueEnum, Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ColorWhen {
    /// Enable colors only when output is a TTY
    #[default]
    Auto,

    /// Always enable colors
    Always,

    /// Never enable colors
    Never,
}

impl ColorWhen {
    // ---
    /// Returns whether ANSI color should be used for the given stream.
    pub fn should_color(self, stream: atty::Stream) -> bool {
        // ---
        match self {
            ColorWhen::Always => true,
            ColorWhen::Never => false,
            ColorWhen::Auto => !env_disables_color() && atty::is(stream),
        }
    }

    /// Convenience helper for stderr, where logs go.
    pub fn should_color_stderr(self) -> bool {
        // ---
        self.should_color(atty::Stream::Stderr)
    }
}

fn env_disables_color() -> bool {
    // ---
    env::var_os("NO_COLOR").is_some() || env::var_os("EMACS").is_some()
}
