//! Standardized CLI color policy.
//!
//! Mirrors common Rust tool behavior:
//! - Command-line choice wins.
//! - `NO_COLOR` disables colors.
//! - `EMACS` implies non-interactive output.
//! - In `Auto`, only enable colors when the target stream is a TTY.

use std::env;

/// When to emit ANSI colors. Usable directly as a `--color` value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum ColorWhen {
    /// Enable colors only when output is a TTY.
    Auto,

    /// Always enable colors.
    Always,

    /// Never enable colors.
    Never,
}

impl ColorWhen {
    // ---
    /// Returns whether ANSI color should be used for the given stream.
    pub fn should_color(self, stream: atty::Stream) -> bool {
        match self {
            ColorWhen::Always => true,
            ColorWhen::Never => false,
            ColorWhen::Auto => {
                if env::var_os("NO_COLOR").is_some() {
                    return false;
                }

                if env::var_os("EMACS").is_some() {
                    return false;
                }

                atty::is(stream)
            }
        }
    }

    /// Convenience helper for stderr (where tracing output goes).
    pub fn should_color_stderr(self) -> bool {
        self.should_color(atty::Stream::Stderr)
    }
}
