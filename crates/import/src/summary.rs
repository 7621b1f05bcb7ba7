use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    NotFound,
    RequestDenied,
    OtherFailure,
    InvalidRow,
    StoreRejected,
}

impl FailureReason {
    pub fn as_code(self) -> &'static str {
        match self {
            Self::NotFound => "not_found",
            Self::RequestDenied => "request_denied",
            Self::OtherFailure => "other_failure",
            Self::InvalidRow => "invalid_row",
            Self::StoreRejected => "store_rejected",
        }
    }

    /// Geocoding failures still leave the service in the catalog, unlocated.
    pub fn service_written(self) -> bool {
        matches!(self, Self::NotFound | Self::RequestDenied | Self::OtherFailure)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RowFailure {
    /// 1-based, counted below the header.
    pub row: usize,
    pub reason: FailureReason,
    pub detail: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImportSummary {
    pub run_id: Uuid,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<PathBuf>,
    pub total: usize,
    pub succeeded: usize,
    pub failed: usize,
    /// Successes that needed no write at all.
    pub already_present: usize,
    pub failures_by_reason: BTreeMap<FailureReason, usize>,
    pub failures: Vec<RowFailure>,
}

impl ImportSummary {
    pub fn new(run_id: Uuid) -> Self {
        Self {
            run_id,
            source: None,
            total: 0,
            succeeded: 0,
            failed: 0,
            already_present: 0,
            failures_by_reason: BTreeMap::new(),
            failures: Vec::new(),
        }
    }

    pub fn record_success(&mut self, already_present: bool) {
        self.total += 1;
        self.succeeded += 1;
        if already_present {
            self.already_present += 1;
        }
    }

    pub fn record_failure(&mut self, row: usize, reason: FailureReason, detail: impl Into<String>) {
        self.total += 1;
        self.failed += 1;
        *self.failures_by_reason.entry(reason).or_default() += 1;
        self.failures.push(RowFailure {
            row,
            reason,
            detail: detail.into(),
        });
    }

    pub fn failures_for(&self, reason: FailureReason) -> usize {
        self.failures_by_reason.get(&reason).copied().unwrap_or(0)
    }

    /// Folds another run's counts into this one. Row failures keep their own
    /// row numbers, so merged failures are only meaningful per source.
    pub fn absorb(&mut self, other: &ImportSummary) {
        self.total += other.total;
        self.succeeded += other.succeeded;
        self.failed += other.failed;
        self.already_present += other.already_present;
        for (reason, count) in &other.failures_by_reason {
            *self.failures_by_reason.entry(*reason).or_default() += count;
        }
        self.failures.extend(other.failures.iter().cloned());
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DirectorySummary {
    pub files: Vec<ImportSummary>,
    pub total: ImportSummary,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn absorb_adds_counts() {
        let mut total = ImportSummary::new(Uuid::nil());
        let mut file = ImportSummary::new(Uuid::nil());
        file.record_success(false);
        file.record_success(true);
        file.record_failure(3, FailureReason::NotFound, "no match");

        total.absorb(&file);
        total.absorb(&file);

        assert_eq!(total.total, 6);
        assert_eq!(total.succeeded, 4);
        assert_eq!(total.already_present, 2);
        assert_eq!(total.failures_for(FailureReason::NotFound), 2);
        assert_eq!(total.failures_for(FailureReason::RequestDenied), 0);
    }
}
