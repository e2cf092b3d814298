//! Output rendering for heidictl.
//!
//! Formats runs and transcript entries for terminal display.

use heidi_core::{RunKind, RunRecord, RunStatus, RunSummary, TranscriptEvent};

use crate::client::SubmitResponse;

/// Print confirmation after dispatching a run or loop.
pub fn print_submitted(kind: RunKind, response: &SubmitResponse) {
    println!("Dispatched {}: {}", kind.as_str(), response.run_id);
    println!("  Status: {}", format_status(response.status));
}

/// Print a list of runs in tabular format.
pub fn print_run_list(runs: &[RunSummary]) {
    if runs.is_empty() {
        println!("No runs found.");
        return;
    }

    println!(
        "{:<32}  {:<5}  {:<10}  {:<10}  {:<19}  {}",
        "RUN ID", "KIND", "STATUS", "EXECUTOR", "UPDATED", "TASK"
    );
    println!("{}", "-".repeat(110));

    for run in runs {
        println!(
            "{:<32}  {:<5}  {:<10}  {:<10}  {:<19}  {}",
            truncate(run.run_id.as_str(), 32),
            run.kind.as_str(),
            format_status(run.status),
            truncate(&run.executor, 10),
            format_time(&run.updated_at),
            truncate(first_line(&run.task), 40),
        );
    }

    println!();
    println!("{} run(s)", runs.len());
}

/// Print metadata, artifacts and transcript summary of a run.
pub fn print_run_details(record: &RunRecord) {
    let meta = &record.meta;
    println!("Run: {}", record.run_id);
    println!();
    println!("  Kind:        {}", meta.kind.as_str());
    println!("  Status:      {}", format_status(meta.status));
    println!("  Executor:    {}", meta.executor);
    if let Some(model) = &meta.model {
        println!("  Model:       {model}");
    }
    println!("  Workdir:     {}", meta.workdir);
    println!("  Attempts:    {}", meta.attempts);
    if let Some(max_retries) = meta.max_retries {
        println!("  Max Retries: {max_retries}");
    }
    println!("  Created:     {}", format_time(&meta.created_at));
    println!("  Updated:     {}", format_time(&meta.updated_at));
    println!();
    println!("  Task:");
    for line in meta.task.lines() {
        println!("    {line}");
    }

    if !record.events.is_empty() {
        println!();
        println!("  Events:");
        for event in &record.events {
            println!("    {}", format_event(event));
        }
    }

    if let Some(result) = &record.result {
        println!();
        println!("  Result:");
        for line in result.lines() {
            println!("    {line}");
        }
    }
    if let Some(error) = &record.error {
        println!();
        println!("  Error:");
        for line in error.lines() {
            println!("    {line}");
        }
    }
}

/// Print one streamed transcript entry.
pub fn print_event(event: &TranscriptEvent) {
    println!("{}", format_event(event));
}

fn format_event(event: &TranscriptEvent) -> String {
    let detail = match event.data.as_object() {
        Some(fields) => fields
            .iter()
            .filter(|(key, _)| key.as_str() != "run_id")
            .map(|(key, value)| match value {
                serde_json::Value::String(s) => format!("{key}={}", truncate(first_line(s), 60)),
                other => format!("{key}={other}"),
            })
            .collect::<Vec<_>>()
            .join(" "),
        None => String::new(),
    };
    format!(
        "{}  {:<18}  {detail}",
        event.timestamp.format("%H:%M:%S"),
        event.event_type
    )
}

fn format_status(status: RunStatus) -> &'static str {
    match status {
        RunStatus::Running => "RUNNING",
        RunStatus::Completed => "COMPLETED",
        RunStatus::Failed => "FAILED",
        RunStatus::Cancelled => "CANCELLED",
    }
}

fn format_time(dt: &chrono::DateTime<chrono::Utc>) -> String {
    dt.format("%Y-%m-%d %H:%M:%S").to_string()
}

fn first_line(s: &str) -> &str {
    s.lines().next().unwrap_or_default()
}

fn truncate(s: &str, max_chars: usize) -> String {
    if s.chars().count() <= max_chars {
        s.to_string()
    } else {
        let kept: String = s.chars().take(max_chars.saturating_sub(3)).collect();
        format!("{kept}...")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    #[test]
    fn truncate_respects_char_boundaries() {
        assert_eq!(truncate("short", 10), "short");
        assert_eq!(truncate("héllo wörld", 8), "héllo...");
    }

    #[test]
    fn event_line_skips_run_id() {
        let event = TranscriptEvent {
            timestamp: chrono::Utc.with_ymd_and_hms(2025, 1, 2, 3, 4, 5).unwrap(),
            event_type: "EXECUTOR_FINISHED".to_string(),
            data: json!({ "run_id": "abc", "attempt": 1, "ok": true }),
        };
        let line = format_event(&event);
        assert!(line.starts_with("03:04:05  EXECUTOR_FINISHED"));
        assert!(line.contains("attempt=1"));
        assert!(line.contains("ok=true"));
        assert!(!line.contains("abc"));
    }
}
