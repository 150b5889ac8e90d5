//! Completion-cleaning pipeline.
//!
//! Raw model output tends to echo the surrounding context, wrap code in
//! markdown fences, or leak chain-of-thought markers. Every stage here is a
//! total function over strings: any input produces a string, never an error.
//! An empty result means "discard this candidate".

/// Tuning knobs for the pipeline. All values are configuration-supplied;
/// the defaults mirror the shipped completion settings.
#[derive(Debug, Clone)]
pub struct CleanOptions {
    /// How many trailing characters of the prefix are scanned for overlap.
    pub overlap_window: usize,
    /// Minimum overlap length (in chars) worth stripping.
    pub min_overlap: usize,
    /// How many trailing prefix lines participate in line dedup.
    pub dedup_window_lines: usize,
    /// A candidate line must be longer than this (trimmed, in chars) to be
    /// dropped as a duplicate. Short repeated tokens like `}` stay.
    pub dedup_min_chars: usize,
    /// Cap on non-empty output lines.
    pub max_lines: usize,
}

impl Default for CleanOptions {
    fn default() -> Self {
        Self {
            overlap_window: 80,
            min_overlap: 2,
            dedup_window_lines: 10,
            dedup_min_chars: 10,
            max_lines: 3,
        }
    }
}

/// Remove response artifacts: thinking spans, markdown fences, and a leading
/// `Assistant:` label. Idempotent; unknown input passes through untouched.
pub fn strip_format(raw: &str) -> String {
    let text = strip_think(raw);
    let text = strip_fences(&text);
    let text = strip_assistant_label(&text);
    text.trim_start_matches('\n').to_string()
}

/// Drop thinking spans. A span runs from a `>` marker through the closing
/// `</think>` tag plus trailing whitespace; a closing tag with no marker
/// before it discards everything up to and including the tag.
fn strip_think(text: &str) -> String {
    let mut s = text.to_string();
    while let Some(close) = s.find("</think>") {
        let start = s[..close].find('>').unwrap_or(0);
        let end = close + "</think>".len();
        let rest = s[end..].trim_start();
        let mut next = String::with_capacity(start + rest.len());
        next.push_str(&s[..start]);
        next.push_str(rest);
        s = next;
    }
    s
}

/// Remove fence markers at line starts (``` with an optional language tag)
/// and at line ends. Fence-only lines disappear entirely.
fn strip_fences(text: &str) -> String {
    let mut out: Vec<&str> = Vec::new();
    for line in text.lines() {
        let mut rest = line;
        while let Some(after) = rest.strip_prefix("```") {
            rest = after.trim_start_matches(|c: char| c.is_alphanumeric() || c == '_');
        }
        while let Some(before) = rest.strip_suffix("```") {
            rest = before;
        }
        if rest.is_empty() && rest.len() != line.len() {
            continue;
        }
        out.push(rest);
    }
    out.join("\n")
}

fn strip_assistant_label(text: &str) -> String {
    const LABEL: &str = "assistant:";
    let trimmed = text.trim_start();
    match trimmed.get(..LABEL.len()) {
        Some(head) if head.eq_ignore_ascii_case(LABEL) => {
            trimmed[LABEL.len()..].trim_start().to_string()
        }
        _ => text.to_string(),
    }
}

/// Last `n` characters of `s`, on a char boundary.
pub fn char_tail(s: &str, n: usize) -> &str {
    let count = s.chars().count();
    if count <= n {
        return s;
    }
    let skip = count - n;
    match s.char_indices().nth(skip) {
        Some((idx, _)) => &s[idx..],
        None => s,
    }
}

/// Strip the longest overlap between the end of `prefix_tail` and the start
/// of `candidate`. Greedy: the scan runs from the longest possible overlap
/// down to `min_overlap` chars and stops at the first hit. No hit, or an
/// empty input, returns `candidate` unchanged.
pub fn strip_overlap(prefix_tail: &str, candidate: &str, min_overlap: usize) -> String {
    if prefix_tail.is_empty() || candidate.is_empty() {
        return candidate.to_string();
    }
    let boundaries: Vec<usize> = prefix_tail.char_indices().map(|(i, _)| i).collect();
    let total = boundaries.len();
    for (pos, &idx) in boundaries.iter().enumerate() {
        let overlap_chars = total - pos;
        if overlap_chars < min_overlap {
            break;
        }
        let tail = &prefix_tail[idx..];
        if candidate.starts_with(tail) {
            return candidate[tail.len()..].trim().to_string();
        }
    }
    candidate.to_string()
}

/// Drop candidate lines that already appear verbatim in the recent prefix.
/// Blank lines always survive; so do short lines, which repeat legitimately
/// in code (`}`, `);`).
pub fn dedup_lines(candidate: &str, prefix: &str, window_lines: usize, min_chars: usize) -> String {
    let prefix_lines: Vec<&str> = prefix.lines().collect();
    let start = prefix_lines.len().saturating_sub(window_lines);
    let recent: Vec<&str> = prefix_lines[start..].iter().map(|l| l.trim()).collect();

    let mut kept: Vec<&str> = Vec::new();
    for line in candidate.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            kept.push(line);
            continue;
        }
        if trimmed.chars().count() > min_chars && recent.contains(&trimmed) {
            continue;
        }
        kept.push(line);
    }
    kept.join("\n")
}

/// Collapse runs of three or more newlines down to a single blank line.
fn collapse_blank_runs(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut newlines = 0usize;
    for c in text.chars() {
        if c == '\n' {
            newlines += 1;
            if newlines <= 2 {
                out.push(c);
            }
        } else {
            newlines = 0;
            out.push(c);
        }
    }
    out
}

/// Truncate `candidate` so it contains at most `max_non_empty` non-empty
/// lines. The cut lands on the original line boundary that reaches the limit,
/// so interleaved blank lines up to that point are preserved.
pub fn limit_lines(candidate: &str, max_non_empty: usize) -> String {
    if max_non_empty == 0 {
        return String::new();
    }
    let lines: Vec<&str> = candidate.lines().collect();
    let total_non_empty = lines.iter().filter(|l| !l.trim().is_empty()).count();
    if total_non_empty <= max_non_empty {
        return candidate.to_string();
    }
    let mut seen = 0usize;
    let mut cut = lines.len();
    for (i, line) in lines.iter().enumerate() {
        if !line.trim().is_empty() {
            seen += 1;
            if seen == max_non_empty {
                cut = i + 1;
                break;
            }
        }
    }
    lines[..cut].join("\n")
}

/// Full pipeline for one raw candidate:
/// raw -> format-stripped -> overlap-stripped -> line-deduped -> limited.
/// An empty return value means the candidate should be discarded.
pub fn clean_completion(raw: &str, prefix: &str, opts: &CleanOptions) -> String {
    let stripped = strip_format(raw);
    if prefix.is_empty() {
        return stripped.trim().to_string();
    }
    let tail = char_tail(prefix, opts.overlap_window);
    let cleaned = strip_overlap(tail, stripped.trim(), opts.min_overlap);
    let cleaned = dedup_lines(&cleaned, prefix, opts.dedup_window_lines, opts.dedup_min_chars);
    let cleaned = collapse_blank_runs(&cleaned);
    let cleaned = limit_lines(&cleaned, opts.max_lines);
    cleaned.trim().to_string()
}

/// Apply the pipeline to each raw choice independently. The output has the
/// same length as the input; empty entries are the caller's to filter.
pub fn clean_batch(raws: &[String], prefix: &str, opts: &CleanOptions) -> Vec<String> {
    raws.iter().map(|raw| clean_completion(raw, prefix, opts)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strip_format_removes_fences() {
        assert_eq!(strip_format("```js\nconst y = 2;\n```"), "const y = 2;");
        assert_eq!(strip_format("plain text"), "plain text");
    }

    #[test]
    fn strip_format_removes_trailing_fence_on_code_line() {
        assert_eq!(strip_format("let x = 1;```"), "let x = 1;");
    }

    #[test]
    fn strip_format_removes_think_span() {
        assert_eq!(
            strip_format(">I should answer briefly.</think>\nhello"),
            "hello"
        );
    }

    #[test]
    fn strip_format_handles_bare_close_tag() {
        assert_eq!(strip_format("leaked reasoning</think>  actual"), "actual");
    }

    #[test]
    fn strip_format_removes_assistant_label() {
        assert_eq!(strip_format("Assistant: fn main() {}"), "fn main() {}");
        assert_eq!(strip_format("ASSISTANT: x"), "x");
    }

    #[test]
    fn strip_format_is_idempotent() {
        let inputs = [
            "```rust\nfn f() {}\n```",
            ">thinking</think>\nAssistant: code",
            "``````",
            "\n\n\nbody",
            "no markers at all",
        ];
        for input in inputs {
            let once = strip_format(input);
            assert_eq!(strip_format(&once), once, "input: {input:?}");
        }
    }

    #[test]
    fn overlap_strips_longest_match() {
        let out = strip_overlap(
            "...function add(a, b) {",
            "add(a, b) {\n  return a + b;\n}",
            2,
        );
        assert_eq!(out, "return a + b;\n}");
    }

    #[test]
    fn overlap_no_match_is_noop() {
        assert_eq!(strip_overlap("xyz", "hello world", 2), "hello world");
    }

    #[test]
    fn overlap_empty_inputs_are_noops() {
        assert_eq!(strip_overlap("", "abc", 2), "abc");
        assert_eq!(strip_overlap("abc", "", 2), "");
    }

    #[test]
    fn overlap_below_minimum_is_kept() {
        // Shared single char "a" is under the 2-char minimum.
        assert_eq!(strip_overlap("da", "and so on", 2), "and so on");
    }

    #[test]
    fn char_tail_respects_boundaries() {
        assert_eq!(char_tail("héllo", 3), "llo");
        assert_eq!(char_tail("ab", 10), "ab");
    }

    #[test]
    fn dedup_drops_long_repeated_line() {
        let prefix = "let result = compute(input);\nother();";
        let out = dedup_lines("let result = compute(input);\nnext();", prefix, 10, 10);
        assert_eq!(out, "next();");
    }

    #[test]
    fn dedup_keeps_short_repeated_line() {
        let prefix = "fn f() {\n}\n";
        let out = dedup_lines("}", prefix, 10, 10);
        assert_eq!(out, "}");
    }

    #[test]
    fn dedup_threshold_boundary() {
        // 5 chars: kept. 20 chars: dropped.
        let short = "ab();";
        let long = "let value = f(a, b);";
        let prefix = format!("{short}\n{long}\n");
        let candidate = format!("{short}\n{long}");
        let out = dedup_lines(&candidate, &prefix, 10, 10);
        assert_eq!(out, short);
    }

    #[test]
    fn dedup_preserves_blank_lines() {
        let prefix = "let long_repeated_line = 1;\n";
        let out = dedup_lines("a();\n\nlet long_repeated_line = 1;\n\nb();", prefix, 10, 10);
        assert_eq!(out, "a();\n\n\nb();");
    }

    #[test]
    fn dedup_only_looks_at_recent_window() {
        let mut prefix = String::from("let ancient_duplicate = 0;\n");
        for i in 0..12 {
            prefix.push_str(&format!("filler_line_number_{i}();\n"));
        }
        let out = dedup_lines("let ancient_duplicate = 0;", &prefix, 10, 10);
        assert_eq!(out, "let ancient_duplicate = 0;");
    }

    #[test]
    fn limit_truncates_at_line_boundary() {
        let candidate = "one();\n\ntwo();\nthree();\n\nfour();\nfive();";
        let out = limit_lines(candidate, 3);
        assert_eq!(out, "one();\n\ntwo();\nthree();");
    }

    #[test]
    fn limit_is_noop_under_cap() {
        let candidate = "one();\ntwo();";
        assert_eq!(limit_lines(candidate, 3), candidate);
    }

    #[test]
    fn pipeline_end_to_end_fence_and_duplicate() {
        let prefix = "const x = 1;\n";
        let raw = "```js\nconst x = 1;\nconst y = 2;\n```";
        let out = clean_completion(raw, prefix, &CleanOptions::default());
        assert_eq!(out, "const y = 2;");
    }

    #[test]
    fn pipeline_discards_pure_echo() {
        let prefix = "let total = items.iter().sum();\n";
        let raw = "let total = items.iter().sum();";
        let out = clean_completion(raw, prefix, &CleanOptions::default());
        assert_eq!(out, "");
    }

    #[test]
    fn pipeline_monotonic_shrink() {
        let prefix = "fn main() {\n    let a = 1;\n";
        let raws = [
            "```rust\nlet a = 1;\nlet b = 2;\n```",
            ">hmm</think>let c = 3;",
            "plain continuation",
            "",
        ];
        for raw in raws {
            let out = clean_completion(raw, prefix, &CleanOptions::default());
            assert!(out.len() <= raw.len(), "raw: {raw:?} out: {out:?}");
        }
    }

    #[test]
    fn batch_maps_each_choice_independently() {
        let prefix = "const x = 1;\n";
        let raws = vec![
            "const x = 1;".to_string(),
            "const z = 9;".to_string(),
        ];
        let out = clean_batch(&raws, prefix, &CleanOptions::default());
        assert_eq!(out, vec![String::new(), "const z = 9;".to_string()]);
    }
}
