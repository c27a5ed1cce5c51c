//! Extraction of a diff from conversational model output.
//!
//! Models wrap diffs in prose and code fences despite instructions. The
//! sanitizer recovers the embedded diff or reports that none is present; it
//! never judges structure, which is [`crate::core::diff_validator`]'s job.

/// Prefixes of lines that can legitimately appear inside a git diff.
const DIFF_LINE_PREFIXES: &[&str] = &[
    "diff --git ",
    "index ",
    "--- ",
    "+++ ",
    "@@",
    "new file mode",
    "deleted file mode",
    "old mode",
    "new mode",
    "similarity index",
    "dissimilarity index",
    "rename from",
    "rename to",
    "copy from",
    "copy to",
    "Binary files",
    " ",
    "+",
    "-",
    "\\",
];

/// Reason recorded when [`sanitize`] finds no diff.
pub const NO_DIFF_FOUND: &str = "no diff found in the response: output must be a raw unified diff \
starting with `diff --git` (no commentary, no code fences) or exactly NO_CHANGES";

/// Strip prose and code fences around an embedded diff.
///
/// Returns `None` when no plausible diff header (`diff --git` or a `---`/`+++`
/// pair) exists anywhere in `raw`. The returned text always ends with a newline.
pub fn sanitize(raw: &str) -> Option<String> {
    let normalized = raw.replace("\r\n", "\n");
    if is_header_start(normalized.trim_start()) {
        return extract_diff(&normalized);
    }
    let source = fenced_diff(&normalized).unwrap_or(normalized);
    extract_diff(&source)
}

/// Body of the first code fence that contains a diff header, if any.
///
/// Fence markers only count at column 0. Every line of a diff body carries a
/// one-character prefix, so backticks in context or added lines never open
/// or close a fence.
fn fenced_diff(text: &str) -> Option<String> {
    let mut inside: Option<(&'static str, Vec<&str>)> = None;
    for line in text.lines() {
        match inside.as_mut() {
            None => {
                if let Some(marker) = fence_marker(line) {
                    inside = Some((marker, Vec::new()));
                }
            }
            Some((marker, body)) => {
                if line.trim_end() == *marker {
                    if body.iter().any(|l| is_header_start(l)) {
                        return Some(join_lines(body));
                    }
                    inside = None;
                } else {
                    body.push(line);
                }
            }
        }
    }
    // Unterminated fence (truncated response): take what we have.
    match inside {
        Some((_, body)) if body.iter().any(|l| is_header_start(l)) => Some(join_lines(&body)),
        _ => None,
    }
}

fn fence_marker(line: &str) -> Option<&'static str> {
    if line.starts_with("```") {
        Some("```")
    } else if line.starts_with("~~~") {
        Some("~~~")
    } else {
        None
    }
}

fn is_header_start(line: &str) -> bool {
    line.starts_with("diff --git ")
}

fn extract_diff(text: &str) -> Option<String> {
    let lines: Vec<&str> = text.lines().collect();
    let start = lines.iter().position(|l| is_header_start(l)).or_else(|| {
        lines
            .windows(2)
            .position(|pair| pair[0].starts_with("--- ") && pair[1].starts_with("+++ "))
    })?;

    let mut kept: Vec<&str> = lines[start..]
        .iter()
        .copied()
        .take_while(|line| is_plausible_diff_line(line))
        .collect();
    // A lone space is a blank context line, not padding.
    while kept.last().is_some_and(|line| line.is_empty()) {
        kept.pop();
    }
    if kept.is_empty() {
        return None;
    }
    Some(join_lines(&kept))
}

fn is_plausible_diff_line(line: &str) -> bool {
    line.is_empty() || DIFF_LINE_PREFIXES.iter().any(|p| line.starts_with(p))
}

fn join_lines(lines: &[&str]) -> String {
    let mut out = lines.join("\n");
    out.push('\n');
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    const DIFF: &str = concat!(
        "diff --git a/a.txt b/a.txt\n",
        "--- a/a.txt\n",
        "+++ b/a.txt\n",
        "@@ -1 +1 @@\n",
        "-old\n",
        "+new\n",
    );

    #[test]
    fn raw_diff_passes_through() {
        assert_eq!(sanitize(DIFF).as_deref(), Some(DIFF));
    }

    #[test]
    fn strips_leading_and_trailing_prose() {
        let raw = format!("Sure! Here is the change you asked for:\n\n{DIFF}\nThis replaces old with new.\n");
        assert_eq!(sanitize(&raw).as_deref(), Some(DIFF));
    }

    #[test]
    fn strips_code_fences() {
        let raw = format!("I made this patch:\n```diff\n{DIFF}```\nLet me know!\n");
        assert_eq!(sanitize(&raw).as_deref(), Some(DIFF));
    }

    #[test]
    fn skips_fences_without_a_diff() {
        let raw = format!("```text\nsome notes\n```\n\n```patch\n{DIFF}```\n");
        assert_eq!(sanitize(&raw).as_deref(), Some(DIFF));
    }

    #[test]
    fn unterminated_fence_is_recovered() {
        let raw = format!("```diff\n{DIFF}");
        assert_eq!(sanitize(&raw).as_deref(), Some(DIFF));
    }

    #[test]
    fn normalizes_crlf_and_appends_newline() {
        let raw = DIFF.trim_end().replace('\n', "\r\n");
        assert_eq!(sanitize(&raw).as_deref(), Some(DIFF));
    }

    #[test]
    fn bare_file_headers_are_plausible() {
        let raw = "Here:\n--- a/a.txt\n+++ b/a.txt\n@@ -1 +1 @@\n-old\n+new\n";
        let out = sanitize(raw).expect("plausible diff");
        assert!(out.starts_with("--- a/a.txt"));
    }

    const README_AND_INDEX_DIFF: &str = concat!(
        "diff --git a/README.md b/README.md\n",
        "--- a/README.md\n",
        "+++ b/README.md\n",
        "@@ -1,5 +1,6 @@\n",
        " # demo\n",
        "+Install with:\n",
        " ```sh\n",
        " npm install\n",
        " ```\n",
        " \n",
        "diff --git a/src/index.ts b/src/index.ts\n",
        "--- a/src/index.ts\n",
        "+++ b/src/index.ts\n",
        "@@ -1 +1,2 @@\n",
        " export {};\n",
        "+export const hello = () => \"hello\";\n",
    );

    #[test]
    fn backticks_in_context_lines_keep_every_file_block() {
        assert_eq!(
            sanitize(README_AND_INDEX_DIFF).as_deref(),
            Some(README_AND_INDEX_DIFF)
        );
    }

    #[test]
    fn backticks_inside_a_fenced_diff_do_not_close_it() {
        let raw = format!("Here you go:\n```diff\n{README_AND_INDEX_DIFF}```\nDone.\n");
        assert_eq!(sanitize(&raw).as_deref(), Some(README_AND_INDEX_DIFF));
    }

    #[test]
    fn trailing_blank_context_line_is_kept() {
        let diff = concat!(
            "diff --git a/notes.txt b/notes.txt\n",
            "--- a/notes.txt\n",
            "+++ b/notes.txt\n",
            "@@ -1,2 +1,3 @@\n",
            " first\n",
            "+second\n",
            " \n",
        );
        let raw = format!("{diff}\n\n");
        assert_eq!(sanitize(&raw).as_deref(), Some(diff));
    }

    #[test]
    fn returns_none_without_any_header() {
        assert_eq!(sanitize("I could not find the file you mentioned."), None);
        assert_eq!(sanitize(""), None);
        assert_eq!(sanitize("```\nfn main() {}\n```"), None);
    }
}
