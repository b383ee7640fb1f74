//! Colored terminal output for decompilation summaries.
//!
//! Uses `termcolor` for cross-platform colored output. Respects the
//! `NO_COLOR` environment variable and the `--color` flag.

use ncs_decompiler::{Diagnostic, Status};
use std::io::Write;
use termcolor::{Color, ColorChoice, ColorSpec, StandardStream, WriteColor};

/// Resolve `ColorChoice` from CLI flag and environment.
///
/// Priority: `NO_COLOR` env > `--color` flag > auto-detect TTY.
pub fn resolve_color_choice(flag: Option<&str>) -> ColorChoice {
    if std::env::var_os("NO_COLOR").is_some() {
        return ColorChoice::Never;
    }
    match flag {
        Some("always") => ColorChoice::Always,
        Some("never") => ColorChoice::Never,
        _ => ColorChoice::Auto,
    }
}

/// Status/diagnostic writer for the decompile summary.
pub struct Reporter {
    stderr: StandardStream,
    verbose: bool,
}

impl Reporter {
    pub fn new(choice: ColorChoice, verbose: bool) -> Self {
        Self {
            stderr: StandardStream::stderr(choice),
            verbose,
        }
    }

    fn status_color(status: Status) -> Color {
        match status {
            Status::Success => Color::Green,
            Status::PartialCompare | Status::PartialCompile => Color::Yellow,
            Status::Failure => Color::Red,
        }
    }

    /// One line per decompiled file: colored status, then the paths.
    pub fn file_result(&mut self, status: Status, input: &str, output: &str) {
        let mut spec = ColorSpec::new();
        spec.set_fg(Some(Self::status_color(status))).set_bold(true);
        let _ = self.stderr.set_color(&spec);
        let _ = write!(self.stderr, "{:>15}", status.as_str());
        let _ = self.stderr.reset();
        let _ = writeln!(self.stderr, "  {input} -> {output}");
    }

    /// Pass diagnostics, dimmed, only in verbose mode.
    pub fn diagnostics(&mut self, diagnostics: &[Diagnostic]) {
        if !self.verbose {
            return;
        }
        let mut spec = ColorSpec::new();
        spec.set_dimmed(true);
        for diagnostic in diagnostics {
            let _ = self.stderr.set_color(&spec);
            let _ = writeln!(self.stderr, "    {diagnostic}");
            let _ = self.stderr.reset();
        }
    }

    /// A fatal, per-file error that still lets the batch continue.
    pub fn error(&mut self, message: &str) {
        let mut spec = ColorSpec::new();
        spec.set_fg(Some(Color::Red)).set_bold(true);
        let _ = self.stderr.set_color(&spec);
        let _ = write!(self.stderr, "error");
        let _ = self.stderr.reset();
        let _ = writeln!(self.stderr, ": {message}");
    }

    /// Batch footer: counts per status.
    pub fn summary(&mut self, total: usize, success: usize, partial: usize, failed: usize) {
        if total < 2 {
            return;
        }
        let _ = writeln!(
            self.stderr,
            "{total} file(s): {success} ok, {partial} partial, {failed} failed"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_color_flag_resolution() {
        // NO_COLOR wins over everything when set; only exercise the flag
        // paths when it is absent.
        if std::env::var_os("NO_COLOR").is_none() {
            assert_eq!(resolve_color_choice(Some("always")), ColorChoice::Always);
            assert_eq!(resolve_color_choice(Some("never")), ColorChoice::Never);
            assert_eq!(resolve_color_choice(None), ColorChoice::Auto);
        } else {
            assert_eq!(resolve_color_choice(Some("always")), ColorChoice::Never);
        }
    }
}
