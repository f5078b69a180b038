//! Queue-specific job payloads.
//!
//! Payloads travel as camelCase JSON objects. Each type is bound to the
//! queue it is enqueued on through [`JobPayload`].

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::provider::ProviderPreference;
use crate::queue::QueueName;

/// A payload type that belongs to a single queue.
pub trait JobPayload: Serialize + DeserializeOwned + Send + Sync {
    /// Queue the payload is enqueued on.
    fn queue(&self) -> QueueName;

    /// Key used to reject duplicate enqueues.
    fn idempotency_key(&self) -> String;
}

/// Job to analyze an uploaded case document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DocumentAnalysisPayload {
    pub document_id: String,
    pub case_id: String,
    pub user_id: String,
    /// Object storage path of the uploaded file
    pub storage_path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub document_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider: Option<ProviderPreference>,
}

impl DocumentAnalysisPayload {
    pub fn new(
        document_id: impl Into<String>,
        case_id: impl Into<String>,
        user_id: impl Into<String>,
        storage_path: impl Into<String>,
    ) -> Self {
        Self {
            document_id: document_id.into(),
            case_id: case_id.into(),
            user_id: user_id.into(),
            storage_path: storage_path.into(),
            document_type: None,
            provider: None,
        }
    }

    /// Set the provider preference.
    pub fn with_provider(mut self, provider: ProviderPreference) -> Self {
        self.provider = Some(provider);
        self
    }
}

impl JobPayload for DocumentAnalysisPayload {
    fn queue(&self) -> QueueName {
        QueueName::DocumentAnalysis
    }

    fn idempotency_key(&self) -> String {
        format!("document-analysis:{}", self.document_id)
    }
}

/// Job to prefill a form from the case's extracted data.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FormAutofillPayload {
    pub form_id: String,
    pub case_id: String,
    pub user_id: String,
    /// Form type identifier (e.g. "I-130")
    pub form_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider: Option<ProviderPreference>,
}

impl JobPayload for FormAutofillPayload {
    fn queue(&self) -> QueueName {
        QueueName::FormAutofill
    }

    fn idempotency_key(&self) -> String {
        format!("form-autofill:{}", self.form_id)
    }
}

/// Case-level AI job: recommendations, completeness or success score.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CaseInsightPayload {
    #[serde(skip)]
    kind: Option<QueueName>,
    pub case_id: String,
    pub user_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider: Option<ProviderPreference>,
}

impl CaseInsightPayload {
    /// Recommendations job for a case.
    pub fn recommendations(case_id: impl Into<String>, user_id: impl Into<String>) -> Self {
        Self::for_queue(QueueName::Recommendations, case_id, user_id)
    }

    /// Completeness analysis job for a case.
    pub fn completeness(case_id: impl Into<String>, user_id: impl Into<String>) -> Self {
        Self::for_queue(QueueName::Completeness, case_id, user_id)
    }

    /// Success-score job for a case.
    pub fn success_score(case_id: impl Into<String>, user_id: impl Into<String>) -> Self {
        Self::for_queue(QueueName::SuccessScore, case_id, user_id)
    }

    fn for_queue(queue: QueueName, case_id: impl Into<String>, user_id: impl Into<String>) -> Self {
        Self {
            kind: Some(queue),
            case_id: case_id.into(),
            user_id: user_id.into(),
            provider: None,
        }
    }
}

impl JobPayload for CaseInsightPayload {
    fn queue(&self) -> QueueName {
        self.kind.unwrap_or(QueueName::Recommendations)
    }

    fn idempotency_key(&self) -> String {
        format!("{}:{}", self.queue(), self.case_id)
    }
}

/// Transactional email job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EmailPayload {
    pub user_id: String,
    /// Template/kind of email (e.g. "deadline-reminder")
    pub email_type: String,
    pub to: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub case_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template_id: Option<String>,
}

impl JobPayload for EmailPayload {
    fn queue(&self) -> QueueName {
        QueueName::Email
    }

    fn idempotency_key(&self) -> String {
        format!(
            "email:{}:{}:{}",
            self.user_id,
            self.email_type,
            self.case_id.as_deref().unwrap_or("-")
        )
    }
}
