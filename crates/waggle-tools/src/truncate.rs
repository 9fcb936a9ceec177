//! Uniform output truncation.
//!
//! Every serialized tool result passes through here exactly once. The length
//! function counts characters; swapping in a real tokenizer only means
//! replacing [`output_len`].

/// Default per-tool output limit, in characters.
pub const DEFAULT_OUTPUT_LIMIT: usize = 80_000;

/// Cut point floor: a truncation never lands before this share of the limit.
const CUT_FLOOR: f64 = 0.8;

/// The length function. Character count stands in for token count.
pub fn output_len(text: &str) -> usize {
    text.chars().count()
}

/// Truncate `text` to `limit`, preferring a line boundary at or past 80% of
/// the limit. Returns the (possibly cut) text and whether a cut happened.
pub fn truncate_output(text: String, limit: usize) -> (String, bool) {
    if limit == 0 || output_len(&text) <= limit {
        return (text, false);
    }

    let total = output_len(&text);
    let floor = (limit as f64 * CUT_FLOOR) as usize;

    // Walk char indices once, remembering the byte offset of the limit and
    // of the last newline inside the [floor, limit] window.
    let mut cut_byte = text.len();
    let mut newline_byte = None;
    for (count, (byte, ch)) in text.char_indices().enumerate() {
        if count >= limit {
            cut_byte = byte;
            break;
        }
        if ch == '\n' && count >= floor {
            newline_byte = Some(byte);
        }
    }

    let cut = newline_byte.unwrap_or(cut_byte);
    let mut out = text[..cut].to_string();
    out.push_str(&format!(
        "\n\n[output truncated: showing {} of {} characters; re-run with limit/offset \
         parameters to page through the full result]",
        output_len(&out),
        total
    ));
    (out, true)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_under_limit_untouched() {
        let (out, cut) = truncate_output("short".into(), 100);
        assert_eq!(out, "short");
        assert!(!cut);
    }

    #[test]
    fn test_cut_on_line_boundary() {
        // 10 lines of 10 chars (incl. newline) = 100 chars; limit 55 means
        // the floor is 44, so the newline at 49 wins.
        let text: String = (0..10).map(|i| format!("line-{i:04}\n")).collect();
        let (out, cut) = truncate_output(text, 55);
        assert!(cut);
        let body = out.split("\n\n[output truncated").next().unwrap();
        assert!(body.ends_with("line-0004"));
        assert!(out.contains("of 100 characters"));
    }

    #[test]
    fn test_hard_cut_without_newlines() {
        let text = "x".repeat(200);
        let (out, cut) = truncate_output(text, 50);
        assert!(cut);
        let body = out.split("\n\n[output truncated").next().unwrap();
        assert_eq!(body.chars().count(), 50);
    }

    #[test]
    fn test_early_newlines_ignored() {
        // Newline only at position 5, well before the 80% floor: hard cut.
        let mut text = "head\n".to_string();
        text.push_str(&"y".repeat(200));
        let (out, cut) = truncate_output(text, 100);
        assert!(cut);
        let body = out.split("\n\n[output truncated").next().unwrap();
        assert_eq!(body.chars().count(), 100);
    }

    #[test]
    fn test_multibyte_safe() {
        let text = "héllo wörld ".repeat(50);
        let limit = 40;
        let (out, cut) = truncate_output(text, limit);
        assert!(cut);
        let body = out.split("\n\n[output truncated").next().unwrap();
        assert_eq!(body.chars().count(), limit);
    }
}
