//! Extractive summaries for the Warm and Cold tiers.
//!
//! Sentences end after `.`, `!` or `?` followed by whitespace. A summary is
//! the longest run of leading sentences that fits the character budget; a
//! first sentence longer than the budget is cut on a char boundary and
//! suffixed with `...`.

use crate::error::{Error, Result};

const ELLIPSIS: &str = "...";

/// Splits `text` into trimmed, non-empty sentences.
pub fn sentences(text: &str) -> Vec<&str> {
    let mut out = Vec::new();
    let mut start = 0;
    let mut chars = text.char_indices().peekable();
    while let Some((i, c)) = chars.next() {
        if matches!(c, '.' | '!' | '?') {
            let at_boundary = match chars.peek() {
                Some((_, next)) => next.is_whitespace(),
                None => true,
            };
            if at_boundary {
                let end = i + c.len_utf8();
                let sentence = text[start..end].trim();
                if !sentence.is_empty() {
                    out.push(sentence);
                }
                start = end;
            }
        }
    }
    let tail = text[start..].trim();
    if !tail.is_empty() {
        out.push(tail);
    }
    out
}

/// Extractive summary of at most `max_chars` characters.
///
/// Fails on blank content.
pub fn summarize(text: &str, max_chars: usize) -> Result<String> {
    let parts = sentences(text);
    let Some(first) = parts.first() else {
        return Err(Error::Summarize("content is blank".into()));
    };
    if max_chars <= ELLIPSIS.len() {
        return Err(Error::Summarize(format!(
            "summary budget {} is too small",
            max_chars
        )));
    }

    if first.chars().count() > max_chars {
        return Ok(truncate_chars(first, max_chars));
    }

    let mut summary = String::from(*first);
    let mut used = first.chars().count();
    for sentence in parts.iter().skip(1) {
        let len = sentence.chars().count();
        if used + 1 + len > max_chars {
            break;
        }
        summary.push(' ');
        summary.push_str(sentence);
        used += 1 + len;
    }
    Ok(summary)
}

/// First sentence of `text`, capped at `max_chars`. Empty for blank input.
pub fn first_sentence(text: &str, max_chars: usize) -> String {
    match sentences(text).first() {
        Some(s) if s.chars().count() > max_chars => truncate_chars(s, max_chars),
        Some(s) => s.to_string(),
        None => String::new(),
    }
}

fn truncate_chars(s: &str, max_chars: usize) -> String {
    let keep = max_chars.saturating_sub(ELLIPSIS.len());
    match s.char_indices().nth(keep) {
        Some((idx, _)) => format!("{}{}", s[..idx].trim_end(), ELLIPSIS),
        None => s.to_string(),
    }
}
