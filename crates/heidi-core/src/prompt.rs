//! Prompt assembly for loop runs.

use crate::completion::{FAIL_TOKEN, PASS_TOKEN};
use std::fmt::Write as _;
use std::path::Path;

/// Previous-attempt output carried into a retry prompt is cut to this many bytes.
pub const MAX_CARRIED_OUTPUT_BYTES: usize = 8 * 1024;

fn completion_instructions() -> String {
    format!(
        "When the task is fully complete, print {PASS_TOKEN} alone on the final line.\n\
         If it is not complete, print {FAIL_TOKEN} alone on the final line."
    )
}

/// First prompt of a loop run.
pub fn planning_prompt(task: &str) -> String {
    format!(
        "Plan the work needed for the task below, then carry it out.\n\n\
         ## Task\n{}\n\n{}\n",
        task.trim(),
        completion_instructions()
    )
}

/// Prompt for a retry, carrying the previous attempt's output and the audit reason.
pub fn retry_prompt(task: &str, attempt: u32, previous_output: &str, reason: &str) -> String {
    let mut prompt = format!(
        "Attempt {attempt} did not complete the task.\n\n## Task\n{}\n\n",
        task.trim()
    );
    let _ = write!(prompt, "## Why it was not accepted\n{reason}\n\n");
    let carried = tail(previous_output, MAX_CARRIED_OUTPUT_BYTES);
    if !carried.trim().is_empty() {
        let _ = write!(prompt, "## Previous output\n{carried}\n\n");
    }
    prompt.push_str("Continue from where the previous attempt stopped.\n\n");
    prompt.push_str(&completion_instructions());
    prompt.push('\n');
    prompt
}

/// Prompt asking the executor to audit an attempt.
pub fn audit_prompt(task: &str, output: &str) -> String {
    format!(
        "You are auditing another agent's work. Do not change anything.\n\n\
         ## Task\n{}\n\n## Agent output\n{}\n\n\
         Print {PASS_TOKEN} alone on the final line if the task is complete, \
         otherwise explain what is missing and print {FAIL_TOKEN} alone on the final line.\n",
        task.trim(),
        tail(output, MAX_CARRIED_OUTPUT_BYTES)
    )
}

/// Prefix used when the backend has no notion of a working directory.
pub fn with_workdir(workdir: &Path, prompt: &str) -> String {
    format!("WORKDIR: {}\n\n{prompt}", workdir.display())
}

/// Last `max_bytes` of `text`, cut on a char boundary.
pub fn tail(text: &str, max_bytes: usize) -> &str {
    if text.len() <= max_bytes {
        return text;
    }
    let mut start = text.len() - max_bytes;
    while !text.is_char_boundary(start) {
        start += 1;
    }
    &text[start..]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn planning_prompt_contains_task_and_tokens() {
        let prompt = planning_prompt("  add a README  ");
        assert!(prompt.contains("## Task\nadd a README\n"));
        assert!(prompt.contains(PASS_TOKEN));
        assert!(prompt.contains(FAIL_TOKEN));
    }

    #[test]
    fn retry_prompt_carries_previous_output() {
        let prompt = retry_prompt("fix tests", 1, "3 tests failed", "final line was not it");
        assert!(prompt.starts_with("Attempt 1 did not complete"));
        assert!(prompt.contains("## Previous output\n3 tests failed"));
        assert!(prompt.contains("final line was not it"));
    }

    #[test]
    fn retry_prompt_skips_empty_output() {
        let prompt = retry_prompt("fix tests", 2, "  \n", "no output");
        assert!(!prompt.contains("## Previous output"));
    }

    #[test]
    fn tail_respects_char_boundaries() {
        assert_eq!(tail("hello", 10), "hello");
        assert_eq!(tail("hello", 3), "llo");
        // 'é' is two bytes; cutting inside it moves forward.
        assert_eq!(tail("aé", 1), "");
        assert_eq!(tail("aéb", 2), "b");
    }

    #[test]
    fn workdir_prefix() {
        assert_eq!(
            with_workdir(Path::new("/repo"), "do it"),
            "WORKDIR: /repo\n\ndo it"
        );
    }

    #[test]
    fn audit_prompt_embeds_output() {
        let prompt = audit_prompt("ship it", "all done");
        assert!(prompt.contains("## Agent output\nall done"));
    }
}
