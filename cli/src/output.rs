//! Table formatting helpers for CLI output.

use comfy_table::{ContentArrangement, Table};

/// Create a borderless table with the given headers.
pub fn new_table(headers: &[&str]) -> Table {
    let mut table = Table::new();
    table.set_content_arrangement(ContentArrangement::Dynamic);
    table.load_preset(comfy_table::presets::NOTHING);
    table.set_header(headers);
    table
}

/// Format a byte count as a human-readable string.
pub fn format_bytes(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = 1024 * KB;
    const GB: u64 = 1024 * MB;

    if bytes >= GB {
        format!("{:.1} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.1} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.1} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} B", bytes)
    }
}

/// Format a timestamp relative to `now`, e.g. "5 minutes ago".
pub fn format_ago_from(
    dt: &chrono::DateTime<chrono::Utc>,
    now: chrono::DateTime<chrono::Utc>,
) -> String {
    let duration = now.signed_duration_since(*dt);

    let secs = duration.num_seconds();
    if secs < 0 {
        return "just now".to_string();
    }
    if secs < 60 {
        return format!("{secs} seconds ago");
    }

    let mins = duration.num_minutes();
    if mins < 60 {
        return format!("{mins} minutes ago");
    }

    let hours = duration.num_hours();
    if hours < 24 {
        return format!("{hours} hours ago");
    }

    let days = duration.num_days();
    if days < 30 {
        return format!("{days} days ago");
    }
    if days < 365 {
        return format!("{} months ago", days / 30);
    }
    format!("{} years ago", days / 365)
}

pub fn format_ago(dt: &chrono::DateTime<chrono::Utc>) -> String {
    format_ago_from(dt, chrono::Utc::now())
}

/// Quote and join an argv for display, truncated to `max` characters.
pub fn format_command(command: &str, args: &[String], max: usize) -> String {
    let mut full = command.to_string();
    for arg in args {
        full.push(' ');
        if arg.contains(char::is_whitespace) {
            full.push_str(&format!("{arg:?}"));
        } else {
            full.push_str(arg);
        }
    }
    let quoted = format!("\"{full}\"");
    if quoted.chars().count() <= max {
        return quoted;
    }
    let kept: String = quoted.chars().take(max.saturating_sub(2)).collect();
    format!("{kept}…\"")
}
