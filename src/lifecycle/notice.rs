//! Termination notice sources.
//!
//! A source is polled by the drain controller. It answers `Some(notice)` once
//! the host running this worker is about to go away.

use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors raised while polling a notice source.
#[derive(Debug, Error)]
pub enum NoticeError {
    #[error("Metadata request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Metadata endpoint returned HTTP {0}")]
    UnexpectedStatus(u16),
}

/// An impending shutdown of this worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TerminationNotice {
    /// Human-readable cause, carried into the drain report.
    pub reason: String,
    /// Whether the fleet manager expects an acknowledgement once drained.
    pub fleet_managed: bool,
}

impl TerminationNotice {
    /// A notice issued by the fleet's control plane.
    pub fn fleet(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
            fleet_managed: true,
        }
    }

    /// A notice raised locally, e.g. by a signal.
    pub fn local(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
            fleet_managed: false,
        }
    }
}

/// Something the drain controller can poll for termination notices.
#[async_trait]
pub trait TerminationSource: Send + Sync {
    /// Short name used in logs.
    fn name(&self) -> &str;

    /// Returns a notice once termination is imminent.
    async fn poll(&self) -> Result<Option<TerminationNotice>, NoticeError>;
}

/// Polls an instance metadata endpoint.
///
/// `200` means a termination is scheduled and the body describes it; `404`
/// means nothing is scheduled.
pub struct HttpMetadataNotice {
    client: Client,
    url: String,
}

impl HttpMetadataNotice {
    /// Creates a source for the given endpoint.
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            client: Client::builder()
                .timeout(Duration::from_secs(2))
                .build()
                .unwrap_or_else(|_| Client::new()),
            url: url.into(),
        }
    }

    /// Returns the polled endpoint.
    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl TerminationSource for HttpMetadataNotice {
    fn name(&self) -> &str {
        "metadata"
    }

    async fn poll(&self) -> Result<Option<TerminationNotice>, NoticeError> {
        let response = self
            .client
            .get(&self.url)
            .header("User-Agent", "trialforge/1.0")
            .send()
            .await?;

        match response.status() {
            StatusCode::OK => {
                let body = response.text().await.unwrap_or_default();
                Ok(Some(TerminationNotice::fleet(describe_notice(&body))))
            }
            StatusCode::NOT_FOUND => Ok(None),
            status => Err(NoticeError::UnexpectedStatus(status.as_u16())),
        }
    }
}

fn describe_notice(body: &str) -> String {
    let body = body.trim();
    if body.is_empty() {
        "termination notice".to_string()
    } else {
        format!("termination notice: {}", body)
    }
}

/// In-process source, triggered explicitly.
#[derive(Default)]
pub struct ManualNotice {
    notice: Mutex<Option<TerminationNotice>>,
}

impl ManualNotice {
    /// Creates an untriggered source.
    pub fn new() -> Self {
        Self::default()
    }

    /// Raises a notice. The first one wins.
    pub fn trigger(&self, notice: TerminationNotice) {
        let mut slot = match self.notice.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if slot.is_none() {
            *slot = Some(notice);
        }
    }

    /// Returns whether a notice has been raised.
    pub fn is_triggered(&self) -> bool {
        match self.notice.lock() {
            Ok(guard) => guard.is_some(),
            Err(poisoned) => poisoned.into_inner().is_some(),
        }
    }
}

#[async_trait]
impl TerminationSource for ManualNotice {
    fn name(&self) -> &str {
        "manual"
    }

    async fn poll(&self) -> Result<Option<TerminationNotice>, NoticeError> {
        Ok(match self.notice.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_manual_notice_first_trigger_wins() {
        let source = ManualNotice::new();
        assert!(source.poll().await.unwrap().is_none());

        source.trigger(TerminationNotice::fleet("scale in"));
        source.trigger(TerminationNotice::local("SIGTERM"));

        let notice = source.poll().await.unwrap().unwrap();
        assert_eq!(notice.reason, "scale in");
        assert!(notice.fleet_managed);
        assert!(source.is_triggered());
    }

    #[test]
    fn test_describe_notice() {
        assert_eq!(describe_notice("  \n"), "termination notice");
        assert_eq!(
            describe_notice("{\"action\":\"terminate\"}"),
            "termination notice: {\"action\":\"terminate\"}"
        );
    }

    #[test]
    fn test_notice_error_display() {
        assert!(NoticeError::UnexpectedStatus(503).to_string().contains("503"));
    }
}
