//! Retention policy for worker log files.
//!
//! Each worker writes one log file; left alone the daemon directory grows
//! without bound. A [`LogRetention`] decides which files are old enough to
//! remove and renders a human-readable description of the policy for the
//! startup log line.

use std::path::Path;

use chrono::{DateTime, Duration, Utc};

use crate::error::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogRetention {
    /// Never remove log files.
    Disabled,
    /// Remove files last modified more than this long ago.
    Relative(Duration),
    /// Remove files last modified before this instant.
    Absolute(DateTime<Utc>),
}

impl LogRetention {
    pub fn days(days: i64) -> Self {
        Self::Relative(Duration::days(days))
    }

    /// The cutoff instant, if the policy defines one.
    pub fn cutoff(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match self {
            Self::Disabled => None,
            Self::Relative(age) => Some(now - *age),
            Self::Absolute(instant) => Some(*instant),
        }
    }

    pub fn is_expired(&self, modified: DateTime<Utc>, now: DateTime<Utc>) -> bool {
        self.cutoff(now).is_some_and(|cutoff| modified < cutoff)
    }

    /// Render the policy for log output.
    ///
    /// Whole-day spans of two or more days read as "after N days"; shorter
    /// or uneven spans fall back to a terse duration; absolute policies name
    /// the cutoff timestamp.
    pub fn describe(&self) -> String {
        match self {
            Self::Disabled => "disabled".to_string(),
            Self::Relative(age) => {
                let days = age.num_days();
                if days >= 2 && *age == Duration::days(days) {
                    format!("after {days} days")
                } else {
                    format!("after {}", format_duration_terse(*age))
                }
            }
            Self::Absolute(instant) => {
                format!("older than {}", instant.format("%Y-%m-%d %H:%M:%S UTC"))
            }
        }
    }
}

/// Compact rendering like "1d2h", "90m", "45s".
fn format_duration_terse(duration: Duration) -> String {
    let mut seconds = duration.num_seconds().max(0);
    let days = seconds / 86_400;
    seconds %= 86_400;
    let hours = seconds / 3_600;
    seconds %= 3_600;
    let minutes = seconds / 60;
    seconds %= 60;

    let mut out = String::new();
    if days > 0 {
        out.push_str(&format!("{days}d"));
    }
    if hours > 0 {
        out.push_str(&format!("{hours}h"));
    }
    if minutes > 0 {
        out.push_str(&format!("{minutes}m"));
    }
    if seconds > 0 || out.is_empty() {
        out.push_str(&format!("{seconds}s"));
    }
    out
}

/// Remove expired `.log` files from a directory. Returns how many were
/// removed. A missing directory counts as nothing to do.
pub fn prune_expired_logs(dir: &Path, retention: LogRetention, now: DateTime<Utc>) -> Result<usize> {
    if retention == LogRetention::Disabled || !dir.is_dir() {
        return Ok(0);
    }

    let mut removed = 0;
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some("log") {
            continue;
        }
        let Ok(metadata) = entry.metadata() else {
            continue;
        };
        let Ok(modified) = metadata.modified() else {
            continue;
        };
        let modified: DateTime<Utc> = modified.into();
        if retention.is_expired(modified, now)
            && std::fs::remove_file(&path).is_ok()
        {
            tracing::debug!(path = %path.display(), "removed expired log file");
            removed += 1;
        }
    }
    Ok(removed)
}
