//! Extraction of structure from free-form agent output.
//!
//! LLM output loosely follows the templates the context builder asks
//! for, so every function here is tolerant: markdown decoration is
//! stripped, casing is ignored, and malformed input yields "no
//! structure found" rather than an error. The state machine treats an
//! empty result as "no verdict, try again" (reviewer) or "no subtasks"
//! (planner).

use std::sync::LazyLock;

use regex::Regex;

use crate::core::types::{ParsedReview, ParsedSubtask, Verdict};

static NUMBERED_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(?:\d+[.)]\s*|[-*]\s+)(.+)").unwrap());
static PRIORITY_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\(priority:\s*(high|medium|low)\)").unwrap());

/// Titles that are section labels from markdown analysis, not tasks.
const GARBAGE_TITLES: &[&str] = &[
    "existing mitigations",
    "known limitations",
    "low-risk issues",
    "high-risk issues",
    "medium-risk issues",
    "summary",
    "overview",
    "background",
    "findings",
    "analysis",
    "recommendations",
    "conclusion",
    "references",
    "notes",
    "already mitigated",
    "documented as",
    "currently",
];

/// Extract a `BLOCKED:` question from agent output.
///
/// Handles the formats LLMs produce:
///
/// ```text
/// BLOCKED: question                (clean format)
/// **BLOCKED: question**            (markdown bold)
/// **BLOCKED:** question            (markdown bold on the label)
/// > BLOCKED: question              (blockquote)
/// ```
///
/// The keyword match is case-insensitive and the first match wins.
pub fn parse_blocked(output: &str) -> Option<String> {
    for line in output.lines() {
        let cleaned = line.trim().trim_start_matches(['>', '*', '#', '-', ' ']);
        let cleaned = cleaned.trim();
        if cleaned.len() >= 8
            && cleaned.is_char_boundary(8)
            && cleaned[..8].eq_ignore_ascii_case("blocked:")
        {
            let reason = cleaned[8..].trim().trim_matches('*').trim();
            if reason.is_empty() {
                return None;
            }
            return Some(reason.to_string());
        }
    }
    None
}

/// Extract subtasks from planner output.
///
/// Expected format:
///
/// ```text
/// SUBTASKS:
/// 1. [Title] - [Description] (priority: high)
/// 2. [Title] - [Description] (priority: medium)
/// ```
///
/// Bare numbered or bulleted lists without the header are also
/// accepted. When the header is present, everything before it is
/// ignored (pre-amble is common). Output is capped at 10 subtasks.
pub fn parse_subtasks(output: &str) -> Vec<ParsedSubtask> {
    let mut subtasks = Vec::new();
    let mut in_section = false;

    let has_explicit_header = output
        .lines()
        .any(|line| starts_with_ignore_case(line.trim(), "SUBTASKS:"));

    for line in output.lines() {
        let trimmed = line.trim();

        if starts_with_ignore_case(trimmed, "SUBTASKS:") {
            in_section = true;
            continue;
        }

        // Empty lines within the section are allowed.
        if in_section && trimmed.is_empty() {
            continue;
        }
        if in_section && !NUMBERED_RE.is_match(trimmed) && !trimmed.is_empty() {
            // Non-list line after subtasks started: a new header ends the section.
            if trimmed.ends_with(':') {
                break;
            }
            continue;
        }

        if !in_section {
            // With an explicit header, skip everything before it.
            if has_explicit_header {
                continue;
            }
            // Fallback: a numbered list anywhere starts the section.
            if !NUMBERED_RE.is_match(trimmed) {
                continue;
            }
            in_section = true;
        }

        let Some(caps) = NUMBERED_RE.captures(trimmed) else {
            continue;
        };
        let mut content = caps[1].to_string();

        let mut priority = "medium".to_string();
        if let Some(pri) = PRIORITY_RE.captures(&content) {
            priority = pri[1].to_string();
            content = PRIORITY_RE.replace_all(&content, "").trim().to_string();
        }

        let (raw_title, description) = match content.find(" - ") {
            Some(idx) if idx > 0 => (
                content[..idx].trim().to_string(),
                content[idx + 3..].trim().to_string(),
            ),
            _ => (content, String::new()),
        };

        // Strip markdown: brackets, backticks, surrounding bold, trailing colons.
        let cleaned = raw_title.trim_matches(['[', ']', '`']);
        let cleaned = cleaned.strip_prefix("**").unwrap_or(cleaned);
        let cleaned = cleaned.strip_suffix("**").unwrap_or(cleaned);
        let title = cleaned.trim_end_matches(':').trim().to_string();

        if is_garbage_title(&title) {
            continue;
        }

        if !title.is_empty() {
            subtasks.push(ParsedSubtask {
                title,
                description,
                priority,
            });
        }
    }

    // Cap to prevent runaway parsing.
    subtasks.truncate(10);
    subtasks
}

/// True if a title looks like a section header or analysis fragment
/// rather than an actionable subtask.
fn is_garbage_title(title: &str) -> bool {
    let lower = title.to_lowercase();
    if GARBAGE_TITLES.iter().any(|p| lower.starts_with(p)) {
        return true;
    }
    // Very short titles are not real subtasks.
    title.len() < 5
}

/// Extract the verdict and comments from reviewer output.
///
/// Supports multiple formats since LLMs rarely follow templates exactly:
///
/// ```text
/// VERDICT: APPROVE           (explicit verdict line)
/// **Verdict:** Approve       (markdown formatted)
/// I approve these changes    (natural language, fallback heuristic)
/// LGTM                       (common shorthand)
/// ```
pub fn parse_review(output: &str) -> ParsedReview {
    let mut result = ParsedReview::default();
    let lines: Vec<&str> = output.lines().collect();

    // Pass 1: explicit VERDICT: line.
    for (i, line) in lines.iter().enumerate() {
        let trimmed = line.trim();
        let line_upper = trimmed.to_uppercase();

        if line_upper.contains("VERDICT") && trimmed.contains(':') {
            if let Some(idx) = trimmed.find(':') {
                let after_colon = trimmed[idx + 1..]
                    .to_uppercase()
                    .replace(['*', '`', '#'], "");
                let after_colon = after_colon.trim();

                if after_colon.contains("APPROVE") || after_colon.contains("ACCEPT") {
                    result.verdict = Some(Verdict::Approve);
                } else if after_colon.contains("REJECT") || after_colon.contains("FAIL") {
                    result.verdict = Some(Verdict::Reject);
                }
            }
        }

        // Comments section: COMMENTS:, ISSUES:, PROBLEMS:, FINDINGS:.
        if ["COMMENTS:", "ISSUES:", "PROBLEMS:", "FINDINGS:"]
            .iter()
            .any(|h| line_upper.starts_with(h))
        {
            for cl in lines[i + 1..].iter().map(|l| l.trim()) {
                if cl.is_empty() {
                    continue;
                }
                if cl.starts_with('-') || cl.starts_with('*') || cl.starts_with('•') {
                    let comment = cl.trim_start_matches(['-', '*', '•']).trim();
                    let comment = comment.strip_prefix("**").unwrap_or(comment);
                    if !comment.is_empty() {
                        result.comments.push(comment.to_string());
                    }
                } else if cl.ends_with(':') {
                    break; // New section header.
                }
            }
        }
    }

    // Pass 2: no explicit verdict, so score natural-language signals.
    if result.verdict.is_none() {
        result.verdict = infer_verdict(&output.to_uppercase());
    }

    // Pass 3: still no comments, collect bullet points from anywhere.
    if result.comments.is_empty() {
        for line in &lines {
            let trimmed = line.trim();
            if (trimmed.starts_with("- ") || trimmed.starts_with("• ")) && trimmed.len() > 10 {
                let comment = trimmed.trim_start_matches(['-', '•']).trim();
                let comment = comment.strip_prefix("**").unwrap_or(comment);
                if !comment.is_empty() {
                    result.comments.push(comment.to_string());
                }
            }
        }
    }

    result
}

/// Guess the verdict from natural language when no VERDICT line exists.
fn infer_verdict(upper_output: &str) -> Option<Verdict> {
    const APPROVE_SIGNALS: &[&str] = &[
        "LGTM",
        "LOOKS GOOD",
        "I APPROVE",
        "APPROVED",
        "CHANGES ARE GOOD",
        "CHANGES LOOK GOOD",
        "NO ISSUES FOUND",
        "NO PROBLEMS FOUND",
        "SHIP IT",
        "READY TO MERGE",
    ];
    const REJECT_SIGNALS: &[&str] = &[
        "I REJECT",
        "REJECTED",
        "CHANGES REJECTED",
        "MUST BE FIXED",
        "NEEDS FIXING",
        "CRITICAL ISSUE",
        "NOT APPROVED",
        "DO NOT MERGE",
        "CANNOT APPROVE",
        "VULNERABILITY",
        "SECURITY ISSUE",
        "BUG FOUND",
        "HAS NOT BEEN FIXED",
        "NOT BEEN FIXED",
        "STILL VULNERABLE",
    ];

    let approve_score = APPROVE_SIGNALS
        .iter()
        .filter(|s| upper_output.contains(*s))
        .count();
    let reject_score = REJECT_SIGNALS
        .iter()
        .filter(|s| upper_output.contains(*s))
        .count();

    // A clear winner with at least one signal; reject wins ties.
    if reject_score > 0 && reject_score >= approve_score {
        return Some(Verdict::Reject);
    }
    if approve_score > 0 && approve_score > reject_score {
        return Some(Verdict::Approve);
    }
    None
}

fn starts_with_ignore_case(s: &str, prefix: &str) -> bool {
    s.len() >= prefix.len()
        && s.is_char_boundary(prefix.len())
        && s[..prefix.len()].eq_ignore_ascii_case(prefix)
}
