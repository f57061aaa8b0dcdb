use std::fmt;
use std::str::FromStr;

use crate::error::ParseError;

/// Lifecycle status of a work item, persisted as a single-character Postgres enum.
///
/// New: inserted by ingestion, never attempted.
/// Processing: claimed by a run; also the highest retry priority, since a
/// Processing item outside a live batch was orphaned by a crashed run.
/// Error: a transient failure, re-enterable into the pending pool.
/// Success and Invalid are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, sqlx::Type)]
#[sqlx(type_name = "work_status")]
pub enum WorkStatus {
    #[sqlx(rename = "N")]
    New,
    #[sqlx(rename = "P")]
    Processing,
    #[sqlx(rename = "E")]
    Error,
    #[sqlx(rename = "S")]
    Success,
    #[sqlx(rename = "I")]
    Invalid,
}

impl WorkStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkStatus::New => "N",
            WorkStatus::Processing => "P",
            WorkStatus::Error => "E",
            WorkStatus::Success => "S",
            WorkStatus::Invalid => "I",
        }
    }

    /// A terminal status is never re-entered into the pending pool.
    pub fn is_terminal(&self) -> bool {
        matches!(self, WorkStatus::Success | WorkStatus::Invalid)
    }

    pub fn is_pending(&self) -> bool {
        matches!(
            self,
            WorkStatus::New | WorkStatus::Processing | WorkStatus::Error
        )
    }

    /// The legal transition table: {New, Error} -> Processing -> {Success, Error, Invalid}.
    /// The store's guarded UPDATEs enforce the same table in SQL; this is the
    /// typed source of truth.
    pub fn can_transition_to(&self, next: WorkStatus) -> bool {
        matches!(
            (*self, next),
            (WorkStatus::New | WorkStatus::Error, WorkStatus::Processing)
                | (
                    WorkStatus::Processing,
                    WorkStatus::Success | WorkStatus::Error | WorkStatus::Invalid
                )
        )
    }
}

impl FromStr for WorkStatus {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "N" => Ok(WorkStatus::New),
            "P" => Ok(WorkStatus::Processing),
            "E" => Ok(WorkStatus::Error),
            "S" => Ok(WorkStatus::Success),
            "I" => Ok(WorkStatus::Invalid),
            invalid => Err(ParseError::ParseWorkStatusError(invalid.to_owned())),
        }
    }
}

impl fmt::Display for WorkStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
