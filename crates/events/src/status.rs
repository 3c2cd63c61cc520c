//! Status-change message.

use bandscore_core::{SubmissionId, SubmissionStatus, UserId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A submission moved from one lifecycle status to another.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusChanged {
    pub submission_id: SubmissionId,
    pub user_id: UserId,
    pub from: SubmissionStatus,
    pub to: SubmissionStatus,
    /// Attempt number of the job that caused the change (0 when no job ran).
    pub attempt: u32,
    pub at: DateTime<Utc>,
}

impl StatusChanged {
    /// Topic name used on the live stream (`submission.scored`, ...).
    pub fn topic(&self) -> String {
        format!("submission.{}", self.to.as_str().to_ascii_lowercase())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn topic_follows_target_status() {
        let msg = StatusChanged {
            submission_id: SubmissionId::new(),
            user_id: UserId::new(),
            from: SubmissionStatus::Processing,
            to: SubmissionStatus::Scored,
            attempt: 1,
            at: Utc::now(),
        };
        assert_eq!(msg.topic(), "submission.scored");
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["to"], "SCORED");
    }
}
