//! Writers for the AwaitingResponse columns.
//!
//! Everything that changes a recipient's conversation state goes through
//! here, including the dispatcher after an interactive send.

use chrono::{DateTime, Utc};

use crate::error::DatabaseError;
use crate::phone::PhoneNumber;
use crate::recipients::ConversationState;
use crate::store::Database;

/// Start waiting for an answer to `template_id`. Replaces any earlier wait.
pub async fn mark_awaiting(
    store: &dyn Database,
    phone: &PhoneNumber,
    template_id: &str,
    since: DateTime<Utc>,
) -> Result<(), DatabaseError> {
    let state = ConversationState::AwaitingResponse {
        template_id: template_id.to_string(),
        since,
    };
    store.set_conversation_state(phone, &state).await
}

pub async fn clear_awaiting(store: &dyn Database, phone: &PhoneNumber) -> Result<(), DatabaseError> {
    store
        .set_conversation_state(phone, &ConversationState::Idle)
        .await
}

/// Whether a wait that began at `since` has lapsed by `now`.
pub fn is_expired(since: DateTime<Utc>, now: DateTime<Utc>, window: chrono::Duration) -> bool {
    now - since > window
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, TimeZone};

    use super::*;

    #[test]
    fn window_is_inclusive() {
        let since = Utc.with_ymd_and_hms(2026, 4, 1, 12, 0, 0).unwrap();
        let window = Duration::hours(24);
        assert!(!is_expired(since, since + Duration::hours(24), window));
        assert!(is_expired(since, since + Duration::hours(24) + Duration::seconds(1), window));
    }
}
