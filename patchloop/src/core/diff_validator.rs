//! Structural validation of unified diffs.
//!
//! Checks that candidate text is a well-formed `git`-style unified diff:
//! - output starts with a `diff --git` header
//! - every file block has a `---` line directly followed by a `+++` line
//! - every file block has at least one well-formed `@@ ... @@` hunk header
//! - hunk bodies only contain context, addition, removal or `\` marker lines
//!
//! Every structural problem is reported, not just the first, so the retry
//! prompt can address all of them at once.

use std::sync::LazyLock;

use regex::Regex;

use crate::core::types::NO_CHANGES_SENTINEL;

const DIFF_HEADER: &str = "diff --git ";

static HUNK_HEADER_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^@@ -\d+(?:,\d+)? \+\d+(?:,\d+)? @@").expect("hunk header regex is valid")
});

/// Outcome of [`validate`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Validation {
    Valid,
    /// Input is exactly the "no changes needed" sentinel.
    NoChanges,
    Invalid { reasons: Vec<String> },
}

impl Validation {
    pub fn is_ok(&self) -> bool {
        !matches!(self, Validation::Invalid { .. })
    }

    pub fn reasons(&self) -> &[String] {
        match self {
            Validation::Invalid { reasons } => reasons,
            _ => &[],
        }
    }
}

/// Validate `candidate` as a unified diff.
pub fn validate(candidate: &str) -> Validation {
    if candidate.trim() == NO_CHANGES_SENTINEL {
        return Validation::NoChanges;
    }
    if candidate.trim().is_empty() {
        return Validation::Invalid {
            reasons: vec![
                "output is empty; expected a unified diff starting with `diff --git`".to_string(),
            ],
        };
    }

    let mut reasons = Vec::new();
    let first_line = candidate
        .lines()
        .find(|line| !line.trim().is_empty())
        .unwrap_or_default();
    if !first_line.starts_with(DIFF_HEADER) {
        reasons.push(format!(
            "missing `diff --git` header: output must start with `diff --git a/<path> b/<path>` (found `{}`)",
            preview(first_line)
        ));
    }

    let blocks = split_file_blocks(candidate);
    if blocks.is_empty() && reasons.is_empty() {
        reasons.push("no file blocks found".to_string());
    }
    for block in &blocks {
        check_block(block, &mut reasons);
    }

    if reasons.is_empty() {
        Validation::Valid
    } else {
        Validation::Invalid { reasons }
    }
}

/// Lines of one `diff --git` block, header included.
struct FileBlock<'a> {
    header: &'a str,
    lines: Vec<&'a str>,
}

impl FileBlock<'_> {
    /// Path used in messages: the `b/` side of the header when present.
    fn label(&self) -> &str {
        let rest = self.header.trim_start_matches(DIFF_HEADER).trim();
        match rest.rfind(" b/") {
            Some(idx) => &rest[idx + 3..],
            None => rest,
        }
    }
}

fn split_file_blocks(text: &str) -> Vec<FileBlock<'_>> {
    let mut blocks: Vec<FileBlock<'_>> = Vec::new();
    for line in text.lines() {
        if line.starts_with(DIFF_HEADER) {
            blocks.push(FileBlock {
                header: line,
                lines: Vec::new(),
            });
        } else if let Some(block) = blocks.last_mut() {
            block.lines.push(line);
        }
    }
    blocks
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Phase {
    Extended,
    AfterOld,
    AfterNew,
    InHunk,
}

/// Per-block scan state.
struct BlockCheck<'r> {
    label: String,
    phase: Phase,
    saw_old: bool,
    saw_new: bool,
    hunks: usize,
    bad_line_reported: bool,
    reasons: &'r mut Vec<String>,
}

impl BlockCheck<'_> {
    fn line(&mut self, line: &str) {
        match self.phase {
            Phase::Extended => {
                if line.starts_with("--- ") {
                    self.saw_old = true;
                    self.phase = Phase::AfterOld;
                } else if line.starts_with("+++ ") {
                    self.saw_new = true;
                    self.reasons.push(format!(
                        "file `{}`: `+++` header appears before `---`",
                        self.label
                    ));
                    self.phase = Phase::AfterNew;
                } else if line.starts_with("@@") {
                    self.reasons.push(format!(
                        "file `{}`: hunk appears before `---`/`+++` headers",
                        self.label
                    ));
                    self.hunk_or_body(line);
                }
            }
            Phase::AfterOld => {
                if line.starts_with("+++ ") {
                    self.saw_new = true;
                    self.phase = Phase::AfterNew;
                    return;
                }
                self.reasons.push(format!(
                    "file `{}`: `+++` header must directly follow `---` (found `{}`)",
                    self.label,
                    preview(line)
                ));
                self.phase = Phase::AfterNew;
                self.hunk_or_body(line);
            }
            Phase::AfterNew | Phase::InHunk => self.hunk_or_body(line),
        }
    }

    fn hunk_or_body(&mut self, line: &str) {
        if line.starts_with("@@") {
            self.phase = Phase::InHunk;
            if HUNK_HEADER_RE.is_match(line) {
                self.hunks += 1;
            } else {
                self.reasons.push(format!(
                    "file `{}`: malformed hunk header `{}` (expected `@@ -a,b +c,d @@`)",
                    self.label,
                    preview(line)
                ));
            }
            return;
        }
        if self.phase == Phase::InHunk && is_hunk_body_line(line) {
            return;
        }
        if !self.bad_line_reported {
            self.bad_line_reported = true;
            self.reasons.push(format!(
                "file `{}`: unexpected line outside a hunk body: `{}`",
                self.label,
                preview(line)
            ));
        }
    }

    fn finish(self) {
        if !self.saw_old {
            self.reasons
                .push(format!("file `{}`: missing `--- a/<path>` header", self.label));
        }
        if !self.saw_new {
            self.reasons
                .push(format!("file `{}`: missing `+++ b/<path>` header", self.label));
        }
        if self.hunks == 0 {
            self.reasons.push(format!(
                "file `{}`: no `@@ -a,b +c,d @@` hunk header",
                self.label
            ));
        }
    }
}

fn check_block(block: &FileBlock<'_>, reasons: &mut Vec<String>) {
    let mut check = BlockCheck {
        label: block.label().to_string(),
        phase: Phase::Extended,
        saw_old: false,
        saw_new: false,
        hunks: 0,
        bad_line_reported: false,
        reasons,
    };
    for line in &block.lines {
        check.line(line);
    }
    check.finish();
}

fn is_hunk_body_line(line: &str) -> bool {
    line.is_empty()
        || line.starts_with(' ')
        || line.starts_with('+')
        || line.starts_with('-')
        || line.starts_with('\\')
}

fn preview(line: &str) -> String {
    const MAX: usize = 60;
    let trimmed = line.trim_end();
    if trimmed.chars().count() <= MAX {
        return trimmed.to_string();
    }
    let mut out: String = trimmed.chars().take(MAX).collect();
    out.push_str("...");
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    const VALID: &str = concat!(
        "diff --git a/src/lib.rs b/src/lib.rs\n",
        "index 1111111..2222222 100644\n",
        "--- a/src/lib.rs\n",
        "+++ b/src/lib.rs\n",
        "@@ -1,2 +1,3 @@\n",
        " fn a() {}\n",
        "+fn b() {}\n",
        " \n",
        "\\ No newline at end of file\n",
    );

    #[test]
    fn accepts_well_formed_diff() {
        assert_eq!(validate(VALID), Validation::Valid);
    }

    #[test]
    fn accepts_multi_file_diff_with_new_file() {
        let diff = format!(
            "{VALID}diff --git a/new.txt b/new.txt\nnew file mode 100644\n--- /dev/null\n+++ b/new.txt\n@@ -0,0 +1 @@\n+hello\n"
        );
        assert_eq!(validate(&diff), Validation::Valid);
    }

    #[test]
    fn sentinel_is_distinct_valid_outcome() {
        let outcome = validate("NO_CHANGES");
        assert_eq!(outcome, Validation::NoChanges);
        assert!(outcome.is_ok());
    }

    #[test]
    fn missing_header_is_reported() {
        let inputs = [
            "--- a/x\n+++ b/x\n@@ -1 +1 @@\n-a\n+b\n",
            "Here is your change:\n",
            "@@ -1 +1 @@\n-a\n+b\n",
        ];
        for input in inputs {
            let outcome = validate(input);
            assert!(!outcome.is_ok(), "{input:?} should be rejected");
            assert!(
                outcome
                    .reasons()
                    .iter()
                    .any(|reason| reason.contains("diff --git")),
                "reasons for {input:?}: {:?}",
                outcome.reasons()
            );
        }
    }

    #[test]
    fn empty_output_is_rejected() {
        let outcome = validate("   \n");
        assert!(!outcome.is_ok());
        assert!(outcome.reasons()[0].contains("empty"));
    }

    #[test]
    fn reports_every_structural_error_together() {
        let diff = "diff --git a/one.rs b/one.rs\n\
--- a/one.rs\n\
@@ -1 +1 @@\n\
-a\n\
+b\n\
diff --git a/two.rs b/two.rs\n\
--- a/two.rs\n\
+++ b/two.rs\n";
        let outcome = validate(diff);
        let reasons = outcome.reasons();
        assert!(reasons.iter().any(|r| r.contains("one.rs") && r.contains("+++")));
        assert!(reasons.iter().any(|r| r.contains("two.rs") && r.contains("hunk")));
        assert!(reasons.len() >= 2);
    }

    #[test]
    fn rejects_malformed_hunk_header() {
        let diff = "diff --git a/x b/x\n--- a/x\n+++ b/x\n@@ lines 1-3 @@\n-a\n+b\n";
        let outcome = validate(diff);
        assert!(
            outcome
                .reasons()
                .iter()
                .any(|r| r.contains("malformed hunk header"))
        );
    }

    #[test]
    fn rejects_prose_inside_hunk() {
        let diff = "diff --git a/x b/x\n--- a/x\n+++ b/x\n@@ -1 +1 @@\n-a\n+b\nThis change renames a to b.\n";
        let outcome = validate(diff);
        assert!(
            outcome
                .reasons()
                .iter()
                .any(|r| r.contains("unexpected line"))
        );
    }

    #[test]
    fn validation_is_deterministic() {
        let diff = "diff --git a/x b/x\n--- a/x\n";
        assert_eq!(validate(diff), validate(diff));
    }
}
