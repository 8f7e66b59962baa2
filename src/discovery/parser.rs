//! Producer output protocol.
//!
//! ```text
//! anything before the block is ignored
//! **************************************
//! <plain import line>
//! <base64 of one or more import lines>
//! **************************************
//! anything after the second sentinel is ignored
//! ```
//!
//! Only the first block is consumed. The base64 test is a heuristic, so a
//! line that fails to decode is treated as plain text.

use base64::{engine::general_purpose, Engine as _};

/// Run of 38 asterisks opening (and closing) the data block.
pub const SENTINEL: &str = "**************************************";

/// Expand producer stdout into the individual lines to import.
/// Blank lines are dropped.
pub fn extract_import_lines(output: &str) -> Vec<String> {
    let mut lines = Vec::new();
    let mut in_block = false;

    for raw in output.split('\n') {
        let line = raw.trim_end_matches('\r');
        if line.starts_with(SENTINEL) {
            if in_block {
                break;
            }
            in_block = true;
            continue;
        }
        if !in_block {
            continue;
        }

        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        match decode_base64_text(line) {
            Some(decoded) => lines.extend(split_lines(&decoded)),
            None => lines.push(line.to_string()),
        }
    }
    lines
}

/// Decode `s` if it looks like standard base64 of UTF-8 text.
pub fn decode_base64_text(s: &str) -> Option<String> {
    if !looks_like_base64(s) {
        return None;
    }
    let bytes = general_purpose::STANDARD.decode(s).ok()?;
    String::from_utf8(bytes).ok()
}

fn looks_like_base64(s: &str) -> bool {
    !s.is_empty()
        && s.len() % 4 == 0
        && s.bytes().all(|b| b.is_ascii_alphanumeric() || matches!(b, b'+' | b'/' | b'='))
}

fn split_lines(text: &str) -> impl Iterator<Item = String> + '_ {
    text.split('\n')
        .map(|l| l.trim())
        .filter(|l| !l.is_empty())
        .map(str::to_string)
}
