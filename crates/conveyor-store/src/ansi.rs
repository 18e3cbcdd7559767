//! Terminal escape stripping for the full-text index.
//!
//! Raw task output keeps its escapes so the UI can render color; only the
//! indexed copy is cleaned.

use regex::Regex;
use std::sync::OnceLock;

fn escape_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        // Ordered alternation: string-type sequences first, then CSI, then
        // the remaining two-character escapes, a lone ESC, and C1 controls.
        Regex::new(
            r"(?x)
            \x1b \] [^\x07\x1b]* (?: \x07 | \x1b \\ )?   # OSC, BEL or ST terminated
            | \x1b [PX^_] [^\x1b]* (?: \x1b \\ )?        # DCS / SOS / PM / APC
            | \x1b \[ [0-?]* [\x20-/]* [@-~]             # CSI
            | \x1b [@-Z\\-_]                             # two-char escapes
            | \x1b                                       # lone ESC
            | [\u{80}-\u{9f}]                            # C1 controls
            ",
        )
        .expect("escape pattern compiles")
    })
}

/// Remove ANSI/control escape sequences from `input`.
pub fn strip_ansi(input: &str) -> String {
    escape_pattern().replace_all(input, "").into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_text_passes_through() {
        assert_eq!(strip_ansi("hello world"), "hello world");
    }

    #[test]
    fn strips_sgr_color() {
        assert_eq!(strip_ansi("\x1b[31mred\x1b[0m text"), "red text");
    }

    #[test]
    fn strips_cursor_movement() {
        assert_eq!(strip_ansi("\x1b[2J\x1b[1;1Hclear"), "clear");
    }

    #[test]
    fn strips_osc_with_bel() {
        assert_eq!(strip_ansi("\x1b]0;window title\x07body"), "body");
    }

    #[test]
    fn strips_osc_with_st() {
        assert_eq!(strip_ansi("\x1b]8;;http://x\x1b\\link"), "link");
    }

    #[test]
    fn strips_dcs_apc_pm_sos() {
        assert_eq!(strip_ansi("\x1bPdevice control\x1b\\ok"), "ok");
        assert_eq!(strip_ansi("\x1b_private\x1b\\ok"), "ok");
        assert_eq!(strip_ansi("\x1b^pm\x1b\\ok"), "ok");
        assert_eq!(strip_ansi("\x1bXsos\x1b\\ok"), "ok");
    }

    #[test]
    fn strips_two_char_escape_and_lone_esc() {
        assert_eq!(strip_ansi("\x1bM up"), " up");
        assert_eq!(strip_ansi("dangling\x1b"), "dangling");
    }

    #[test]
    fn strips_c1_controls() {
        assert_eq!(strip_ansi("a\u{9b}31mb"), "a31mb");
    }

    #[test]
    fn word_between_escapes_survives() {
        let input = "\x1b[1m\x1b[32mfindme\x1b[0m\x1b[2K";
        assert_eq!(strip_ansi(input), "findme");
    }
}
