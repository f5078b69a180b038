//! Named queues.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// One of the fixed set of job queues.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum QueueName {
    /// AI extraction/classification of uploaded case documents
    DocumentAnalysis,
    /// AI prefill of immigration form fields
    FormAutofill,
    /// AI case recommendations
    Recommendations,
    /// Case completeness analysis
    Completeness,
    /// Case success-score estimation
    SuccessScore,
    /// Transactional email delivery
    Email,
    /// Terminally failed jobs awaiting manual inspection
    DeadLetter,
}

/// Workload class of a queue, which selects its timing profile.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkloadClass {
    /// Handlers call an AI provider and may run for minutes.
    AiBound,
    /// Handlers deliver something quickly (email).
    Delivery,
}

impl QueueName {
    /// Every queue, dead-letter included.
    pub const ALL: [QueueName; 7] = [
        QueueName::DocumentAnalysis,
        QueueName::FormAutofill,
        QueueName::Recommendations,
        QueueName::Completeness,
        QueueName::SuccessScore,
        QueueName::Email,
        QueueName::DeadLetter,
    ];

    /// Queues served by a worker (everything except the dead-letter queue).
    pub fn worker_queues() -> impl Iterator<Item = QueueName> {
        Self::ALL.into_iter().filter(|q| *q != QueueName::DeadLetter)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            QueueName::DocumentAnalysis => "document-analysis",
            QueueName::FormAutofill => "form-autofill",
            QueueName::Recommendations => "recommendations",
            QueueName::Completeness => "completeness",
            QueueName::SuccessScore => "success-score",
            QueueName::Email => "email",
            QueueName::DeadLetter => "dead-letter",
        }
    }

    /// Workload class used to pick lock/stall timings.
    pub fn workload_class(&self) -> WorkloadClass {
        match self {
            QueueName::Email | QueueName::DeadLetter => WorkloadClass::Delivery,
            _ => WorkloadClass::AiBound,
        }
    }

    /// Upper-snake form used for per-queue environment variables.
    pub fn env_key(&self) -> String {
        self.as_str().replace('-', "_").to_uppercase()
    }
}

impl fmt::Display for QueueName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Returned when parsing an unrecognised queue name.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Unknown queue: {0}")]
pub struct UnknownQueue(pub String);

impl FromStr for QueueName {
    type Err = UnknownQueue;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        QueueName::ALL
            .into_iter()
            .find(|q| q.as_str() == s)
            .ok_or_else(|| UnknownQueue(s.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_queue_name_parse() {
        for queue in QueueName::ALL {
            assert_eq!(queue.as_str().parse::<QueueName>(), Ok(queue));
        }
        assert!("pdf-render".parse::<QueueName>().is_err());
    }

    #[test]
    fn test_serde_matches_as_str() {
        let json = serde_json::to_string(&QueueName::SuccessScore).unwrap();
        assert_eq!(json, "\"success-score\"");
    }

    #[test]
    fn test_worker_queues_exclude_dead_letter() {
        let queues: Vec<_> = QueueName::worker_queues().collect();
        assert_eq!(queues.len(), 6);
        assert!(!queues.contains(&QueueName::DeadLetter));
    }

    #[test]
    fn test_workload_class() {
        assert_eq!(QueueName::Email.workload_class(), WorkloadClass::Delivery);
        assert_eq!(QueueName::FormAutofill.workload_class(), WorkloadClass::AiBound);
        assert_eq!(QueueName::SuccessScore.env_key(), "SUCCESS_SCORE");
    }
}
