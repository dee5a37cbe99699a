use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Lifecycle state shared by postings and job records.
///
/// The same identifiers apply to both, though some transitions only make
/// sense on one of the two (a job record never goes back to `waiting` once
/// terminal; a posting oscillates between `waiting`/`executing`/`paused`
/// while units remain unfinished).
///
/// Stored as text; the column check constraints mirror this enum.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type,
)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum Status {
    Waiting,
    Executing,
    Done,
    ErroredOut,
    Paused,
    Cancelled,
}

#[derive(Error, Debug)]
#[error("'{0}' is not a valid status")]
pub struct ParseStatusError(String);

impl Status {
    pub const ALL: [Status; 6] = [
        Status::Waiting,
        Status::Executing,
        Status::Done,
        Status::ErroredOut,
        Status::Paused,
        Status::Cancelled,
    ];

    /// No further transitions occur from a terminal status.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Status::Done | Status::ErroredOut | Status::Cancelled)
    }

    /// Whether units of a posting in this status may be claimed.
    pub fn accepts_claims(&self) -> bool {
        matches!(self, Status::Waiting | Status::Executing)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Status::Waiting => "waiting",
            Status::Executing => "executing",
            Status::Done => "done",
            Status::ErroredOut => "errored_out",
            Status::Paused => "paused",
            Status::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Status {
    type Err = ParseStatusError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.to_ascii_lowercase().replace('-', "_").as_str() {
            "waiting" => Ok(Status::Waiting),
            "executing" => Ok(Status::Executing),
            "done" => Ok(Status::Done),
            "errored_out" => Ok(Status::ErroredOut),
            "paused" => Ok(Status::Paused),
            "cancelled" => Ok(Status::Cancelled),
            _ => Err(ParseStatusError(value.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_statuses() {
        assert!(Status::Done.is_terminal());
        assert!(Status::ErroredOut.is_terminal());
        assert!(Status::Cancelled.is_terminal());
        assert!(!Status::Waiting.is_terminal());
        assert!(!Status::Executing.is_terminal());
        assert!(!Status::Paused.is_terminal());
    }

    #[test]
    fn claimable_posting_statuses() {
        assert!(Status::Waiting.accepts_claims());
        assert!(Status::Executing.accepts_claims());
        assert!(!Status::Paused.accepts_claims());
        assert!(!Status::Cancelled.accepts_claims());
    }

    #[test]
    fn parses_dashed_and_cased_spellings() {
        assert_eq!("errored-out".parse::<Status>().unwrap(), Status::ErroredOut);
        assert_eq!("Waiting".parse::<Status>().unwrap(), Status::Waiting);
        assert!("finished".parse::<Status>().is_err());
    }

    #[test]
    fn display_round_trips() {
        for status in Status::ALL {
            assert_eq!(status.to_string().parse::<Status>().unwrap(), status);
        }
    }
}
