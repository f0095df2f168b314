//! Output scanning: completion marker, session ids and version banners.
//!
//! Everything here is a plain text scan over captured process output. The
//! marker match is an exact substring test; no normalization is applied.

use std::sync::LazyLock;

use regex::Regex;

/// Literal an agent emits to end a run loop early.
pub const COMPLETION_MARKER: &str = "<promise>COMPLETE</promise>";

/// Session id patterns, tried in order. The first pattern with a match wins.
static SESSION_ID_PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [
        r#""session_id"\s*:\s*"([^"]+)""#,
        r#""sessionID"\s*:\s*"([^"]+)""#,
        r"\b(ses_[A-Za-z0-9]+)\b",
        r"(?i)session(?:\s+id)?\s*[:=]\s*([A-Za-z0-9_-]{6,})",
    ]
    .iter()
    .map(|pattern| Regex::new(pattern).expect("session id pattern should be valid"))
    .collect()
});

static VERSION_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\d+\.\d+\.\d+[^\s]*").expect("version pattern should be valid")
});

/// Concatenate stdout and stderr the way both adapters scan them.
pub fn combined_output(stdout: &str, stderr: &str) -> String {
    let mut combined = String::with_capacity(stdout.len() + stderr.len());
    combined.push_str(stdout);
    combined.push_str(stderr);
    combined
}

pub fn contains_completion_marker(output: &str) -> bool {
    output.contains(COMPLETION_MARKER)
}

/// Return the first capture of the first matching pattern.
pub fn extract_session_id(output: &str) -> Option<String> {
    SESSION_ID_PATTERNS.iter().find_map(|pattern| {
        pattern
            .captures(output)
            .and_then(|caps| caps.get(1))
            .map(|m| m.as_str().to_string())
    })
}

/// Parse a `--version` banner.
///
/// Prefers a semver-looking token and falls back to the trimmed banner.
/// Empty output yields `None`.
pub fn parse_version(stdout: &str) -> Option<String> {
    let trimmed = stdout.trim();
    if trimmed.is_empty() {
        return None;
    }
    let version = VERSION_RE
        .find(trimmed)
        .map_or(trimmed, |m| m.as_str())
        .to_string();
    Some(version)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn marker_detected_anywhere_in_combined_output() {
        let combined = combined_output("working...\n", "done <promise>COMPLETE</promise>\n");
        assert!(contains_completion_marker(&combined));
        assert!(!contains_completion_marker("<promise>complete</promise>"));
        assert!(!contains_completion_marker("<promise>\u{1b}[1mCOMPLETE</promise>"));
    }

    #[test]
    fn marker_split_across_streams_matches_after_concatenation() {
        let combined = combined_output("<promise>COMP", "LETE</promise>");
        assert!(contains_completion_marker(&combined));
    }

    #[test]
    fn first_pattern_wins_over_later_ones() {
        let output = "session: fallback123\n{\"session_id\":\"abc-123\"}\nses_XYZ";
        assert_eq!(extract_session_id(output).as_deref(), Some("abc-123"));
    }

    #[test]
    fn opencode_style_ids_are_extracted() {
        let output = "INFO service=session sessionID=ses_4f2a9bc1 created\n";
        assert_eq!(extract_session_id(output).as_deref(), Some("ses_4f2a9bc1"));
        let output = "{\"type\":\"step\",\"sessionID\":\"ses_AbC\"}";
        assert_eq!(extract_session_id(output).as_deref(), Some("ses_AbC"));
    }

    #[test]
    fn missing_session_id_yields_none() {
        assert_eq!(extract_session_id("nothing to see here"), None);
        assert_eq!(extract_session_id(""), None);
    }

    #[test]
    fn duplicate_ids_are_not_deduplicated() {
        let output = "{\"session_id\":\"first\"}\n{\"session_id\":\"second\"}";
        assert_eq!(extract_session_id(output).as_deref(), Some("first"));
    }

    #[test]
    fn version_parsing_prefers_semver_token() {
        assert_eq!(
            parse_version("1.0.98 (Claude Code)\n").as_deref(),
            Some("1.0.98")
        );
        assert_eq!(parse_version("0.5.1-beta\n").as_deref(), Some("0.5.1-beta"));
        assert_eq!(parse_version("dev build\n").as_deref(), Some("dev build"));
        assert_eq!(parse_version("   \n"), None);
    }
}
