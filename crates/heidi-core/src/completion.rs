//! Completion predicate for loop runs.
//!
//! An attempt is complete when the last non-empty line of its output is
//! exactly [`PASS_TOKEN`] after trimming. [`FAIL_TOKEN`] on the last line is
//! an explicit "not done"; anything else is "not done, no verdict given".

/// Marker an agent prints on its own final line when the task is complete.
pub const PASS_TOKEN: &str = "<heidi>PASS</heidi>";

/// Marker an agent prints on its own final line when it knows it is not done.
pub const FAIL_TOKEN: &str = "<heidi>FAIL</heidi>";

/// Result of auditing one attempt's output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuditVerdict {
    /// Whether the task is judged complete.
    pub satisfied: bool,
    /// Whether a pass token appears somewhere other than the final line.
    pub is_malformed: bool,
    /// Short human-readable explanation, fed back into retry prompts.
    pub reason: String,
}

fn last_nonempty_line(output: &str) -> &str {
    output
        .lines()
        .rfind(|line| !line.trim().is_empty())
        .map_or("", str::trim)
}

/// Returns true if the output ends with the pass token.
pub fn is_complete(output: &str) -> bool {
    last_nonempty_line(output) == PASS_TOKEN
}

/// Audits an attempt's output.
///
/// ```
/// use heidi_core::completion::{audit, PASS_TOKEN};
///
/// assert!(audit(&format!("done\n{PASS_TOKEN}\n")).satisfied);
/// assert!(!audit("still working").satisfied);
/// ```
pub fn audit(output: &str) -> AuditVerdict {
    let last = last_nonempty_line(output);

    if last == PASS_TOKEN {
        return AuditVerdict {
            satisfied: true,
            is_malformed: false,
            reason: "pass token on final line".to_string(),
        };
    }

    let is_malformed = output.contains(PASS_TOKEN);
    let reason = if last == FAIL_TOKEN {
        "agent reported the task is not complete".to_string()
    } else if is_malformed {
        format!("{PASS_TOKEN} must be alone on the final line")
    } else if last.is_empty() {
        "attempt produced no output".to_string()
    } else {
        format!("final line was not {PASS_TOKEN}")
    };

    AuditVerdict {
        satisfied: false,
        is_malformed,
        reason,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bare_token_is_complete() {
        assert!(is_complete(PASS_TOKEN));
        assert!(audit(PASS_TOKEN).satisfied);
    }

    #[test]
    fn trailing_token_with_whitespace_is_complete() {
        let output = "Implemented the change.\n\n  <heidi>PASS</heidi>  \n\n";
        let verdict = audit(output);
        assert!(verdict.satisfied);
        assert!(!verdict.is_malformed);
    }

    #[test]
    fn token_mid_output_is_malformed() {
        let output = "I will print <heidi>PASS</heidi> when done.\nstill going";
        let verdict = audit(output);
        assert!(!verdict.satisfied);
        assert!(verdict.is_malformed);
        assert!(verdict.reason.contains("final line"));
    }

    #[test]
    fn token_with_suffix_on_same_line_is_not_complete() {
        assert!(!is_complete("<heidi>PASS</heidi> mostly"));
    }

    #[test]
    fn explicit_fail_token() {
        let verdict = audit("tests still red\n<heidi>FAIL</heidi>");
        assert!(!verdict.satisfied);
        assert!(!verdict.is_malformed);
        assert!(verdict.reason.contains("not complete"));
    }

    #[test]
    fn empty_output_is_not_complete() {
        let verdict = audit("   \n\n");
        assert!(!verdict.satisfied);
        assert_eq!(verdict.reason, "attempt produced no output");
    }

    #[test]
    fn case_matters() {
        assert!(!is_complete("<heidi>pass</heidi>"));
    }
}
