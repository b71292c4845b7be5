// SPDX-License-Identifier: MIT

//! Time formatting helpers: a translator from Go's reference-time
//! layout strings (`"20060102-150405"`) to `chrono::format::strftime`
//! templates, so the configuration file's `logsuffixdate` / `logdate`
//! fields keep their original, widely-documented syntax.

/// Reference-time tokens ordered longest-first so a greedy left-to-right
/// scan never matches a prefix of a longer token (e.g. `"2"` inside `"2006"`).
const TOKENS: &[(&str, &str)] = &[
    ("2006", "%Y"),
    ("January", "%B"),
    ("Monday", "%A"),
    ("-07:00", "%:z"),
    ("Z07:00", "%:z"),
    ("-0700", "%z"),
    ("Z0700", "%z"),
    ("Jan", "%b"),
    ("Mon", "%a"),
    ("MST", "%Z"),
    ("06", "%y"),
    ("01", "%m"),
    ("02", "%d"),
    ("_2", "%e"),
    ("15", "%H"),
    ("03", "%I"),
    ("04", "%M"),
    ("05", "%S"),
    ("PM", "%p"),
    ("pm", "%P"),
    ("1", "%-m"),
    ("2", "%-d"),
    ("3", "%-I"),
    ("4", "%-M"),
    ("5", "%-S"),
];

/// Translate a Go reference-time layout string into a `chrono` strftime
/// template. Unrecognized characters (literal punctuation such as `-`
/// and `:` in `"20060102-150405"`) pass through unchanged.
pub fn go_layout_to_strftime(layout: &str) -> String {
    let mut out = String::with_capacity(layout.len() + 8);
    let bytes = layout.as_bytes();
    let mut i = 0;
    'outer: while i < bytes.len() {
        // Fractional seconds: a run of `.` followed by one or more `0`s.
        if bytes[i] == b'.' {
            let mut j = i + 1;
            while j < bytes.len() && bytes[j] == b'0' {
                j += 1;
            }
            if j > i + 1 {
                let precision = j - i - 1;
                out.push_str(&format!(".%{precision}f"));
                i = j;
                continue;
            }
        }
        for (tok, repl) in TOKENS {
            if layout[i..].starts_with(tok) {
                out.push_str(repl);
                i += tok.len();
                continue 'outer;
            }
        }
        // '%' is special to strftime; escape it so a literal percent survives.
        if bytes[i] == b'%' {
            out.push_str("%%");
        } else {
            out.push(layout[i..].chars().next().unwrap_or('\u{fffd}'));
        }
        i += layout[i..].chars().next().map(|c| c.len_utf8()).unwrap_or(1);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    #[test]
    fn translates_rotation_suffix_layout() {
        let strftime = go_layout_to_strftime("20060102-150405");
        assert_eq!(strftime, "%Y%m%d-%H%M%S");
        let ts = Utc.with_ymd_and_hms(2024, 3, 5, 13, 4, 5).unwrap();
        assert_eq!(ts.format(&strftime).to_string(), "20240305-130405");
    }

    #[test]
    fn translates_line_prefix_layout() {
        let strftime = go_layout_to_strftime("2006-01-02 15:04:05");
        let ts = Utc.with_ymd_and_hms(2024, 3, 5, 13, 4, 5).unwrap();
        assert_eq!(ts.format(&strftime).to_string(), "2024-03-05 13:04:05");
    }
}
