//! Inbound reply state machine.
//!
//! Priority, first match wins: system command, crisis keyword, interactive
//! answer (only while awaiting and inside the window), fallback help.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::json;
use tracing::{debug, warn};

use crate::catalog::personalize;
use crate::config::ConversationConfig;
use crate::conversation::commands::{self, CrisisKeyword, Inbound, SystemCommand};
use crate::conversation::state::{clear_awaiting, is_expired, mark_awaiting};
use crate::error::DatabaseError;
use crate::event_log::{EventLog, LogKind};
use crate::phone::PhoneNumber;
use crate::recipients::{ConversationState, LifecycleStatus, Recipient, RecipientClass, RecipientLocks};
use crate::store::Database;
use crate::transport::{Transport, send_with_timeout};

pub const SYSTEM_STOP: &str = "system_stop";
pub const SYSTEM_START: &str = "system_start";
pub const SYSTEM_RESET: &str = "system_reset";
pub const SYSTEM_UPSELL: &str = "system_upsell";
pub const SYSTEM_HELP: &str = "system_help";
pub const SYSTEM_ACK: &str = "system_ack";

const STOP_FALLBACK: &str =
    "You have been unsubscribed and will receive no more messages. Reply START to resume.";
const START_FALLBACK: &str = "Welcome back, {name}! Your messages will resume.";
const RESET_FALLBACK: &str = "Your program has been reset and will start again from day one.";
const UPSELL_FALLBACK: &str =
    "Restarting your program is available to subscribers. Subscribe to keep your practice going.";
const HELP_FALLBACK: &str = "Reply STOP to unsubscribe or HELP for support.";
const ACK_FALLBACK: &str = "Thanks for sharing, {name}.";

/// Result of one inbound message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReplyOutcome {
    pub handled: bool,
    pub action: String,
    /// Text sent back, or a short note when nothing was sent.
    pub message: String,
}

impl ReplyOutcome {
    fn handled(action: &str, message: impl Into<String>) -> Self {
        Self {
            handled: true,
            action: action.to_string(),
            message: message.into(),
        }
    }

    fn unhandled(action: &str, message: impl Into<String>) -> Self {
        Self {
            handled: false,
            action: action.to_string(),
            message: message.into(),
        }
    }
}

pub struct ConversationEngine {
    store: Arc<dyn Database>,
    transport: Arc<dyn Transport>,
    locks: Arc<RecipientLocks>,
    log: EventLog,
    config: ConversationConfig,
    send_timeout: Duration,
}

impl ConversationEngine {
    pub fn new(
        store: Arc<dyn Database>,
        transport: Arc<dyn Transport>,
        locks: Arc<RecipientLocks>,
        log: EventLog,
        config: ConversationConfig,
        send_timeout: Duration,
    ) -> Self {
        Self {
            store,
            transport,
            locks,
            log,
            config,
            send_timeout,
        }
    }

    /// Handle one inbound message. `handled` is false only for a malformed
    /// sender or an internal failure.
    pub async fn handle_reply(&self, raw_phone: &str, text: &str, now: DateTime<Utc>) -> ReplyOutcome {
        let phone = match PhoneNumber::parse(raw_phone) {
            Ok(phone) => phone,
            Err(e) => {
                warn!(raw = raw_phone, "Inbound message rejected: {e}");
                return ReplyOutcome::unhandled("rejected", e.to_string());
            }
        };

        match self.route(&phone, text, now).await {
            Ok(outcome) => outcome,
            Err(e) => {
                self.log
                    .log(
                        LogKind::Error,
                        "reply handling failed",
                        Some(&phone),
                        Some(json!({ "error": e.to_string(), "text": text })),
                    )
                    .await;
                ReplyOutcome::unhandled("error", e.to_string())
            }
        }
    }

    async fn route(
        &self,
        phone: &PhoneNumber,
        text: &str,
        now: DateTime<Utc>,
    ) -> Result<ReplyOutcome, DatabaseError> {
        let Some(r) = self.store.get_recipient(phone).await? else {
            self.log
                .log(
                    LogKind::Reply,
                    "reply from unknown number",
                    Some(phone),
                    Some(json!({ "text": text })),
                )
                .await;
            return Ok(ReplyOutcome::handled("unknown_recipient", "no reply sent"));
        };

        match commands::classify(text) {
            Inbound::Command(cmd) => return self.handle_command(r, cmd).await,
            Inbound::Crisis(keyword) => return self.handle_crisis(&r, keyword, text).await,
            Inbound::Text => {}
        }

        // The awaiting state is shared with sends of interactive templates.
        let _guard = self.locks.lock(phone).await;
        let r = self.store.get_recipient(phone).await?.unwrap_or(r);

        if !r.is_active() {
            self.log
                .log(
                    LogKind::Reply,
                    "reply while not active",
                    Some(phone),
                    Some(json!({ "status": r.status.to_string(), "text": text })),
                )
                .await;
            return Ok(ReplyOutcome::handled("ignored", "recipient is not active"));
        }

        if let ConversationState::AwaitingResponse { template_id, since } = &r.conversation
            && let Some(outcome) = self
                .handle_interactive(&r, template_id, *since, text, now)
                .await?
        {
            return Ok(outcome);
        }

        let body = self.system_text(SYSTEM_HELP, HELP_FALLBACK).await?;
        let sent = self.reply(&r, &body, SYSTEM_HELP).await;
        self.log
            .log(
                LogKind::Reply,
                "unrecognized reply",
                Some(phone),
                Some(json!({ "text": text })),
            )
            .await;
        Ok(ReplyOutcome::handled("fallback", sent))
    }

    async fn handle_command(
        &self,
        r: Recipient,
        cmd: SystemCommand,
    ) -> Result<ReplyOutcome, DatabaseError> {
        // Lifecycle and progression writes must not interleave with a send.
        let _guard = self.locks.lock(&r.phone).await;
        let r = self.store.get_recipient(&r.phone).await?.unwrap_or(r);

        self.log
            .log(
                LogKind::Command,
                &cmd.to_string(),
                Some(&r.phone),
                Some(json!({ "status": r.status.to_string(), "class": r.class.to_string() })),
            )
            .await;

        let (action, template_id, fallback) = match cmd {
            SystemCommand::Stop => {
                if r.status == LifecycleStatus::Active {
                    self.store
                        .set_lifecycle(&r.phone, LifecycleStatus::Stopped, Some(r.sequence_position))
                        .await?;
                }
                if r.conversation.is_awaiting() {
                    clear_awaiting(self.store.as_ref(), &r.phone).await?;
                }
                ("stop", SYSTEM_STOP, STOP_FALLBACK)
            }
            SystemCommand::Start => match r.status {
                LifecycleStatus::Expired => ("start_refused", SYSTEM_UPSELL, UPSELL_FALLBACK),
                LifecycleStatus::Stopped => {
                    self.store
                        .set_lifecycle(&r.phone, LifecycleStatus::Active, None)
                        .await?;
                    ("start", SYSTEM_START, START_FALLBACK)
                }
                LifecycleStatus::Active => ("start", SYSTEM_START, START_FALLBACK),
            },
            SystemCommand::Reset => {
                if r.class == RecipientClass::Subscriber {
                    self.store.reset_progress(&r.phone).await?;
                    if r.conversation.is_awaiting() {
                        clear_awaiting(self.store.as_ref(), &r.phone).await?;
                    }
                    ("reset", SYSTEM_RESET, RESET_FALLBACK)
                } else {
                    ("reset_refused", SYSTEM_UPSELL, UPSELL_FALLBACK)
                }
            }
        };

        let body = self.system_text(template_id, fallback).await?;
        let sent = self.reply(&r, &body, template_id).await;
        Ok(ReplyOutcome::handled(action, sent))
    }

    async fn handle_crisis(
        &self,
        r: &Recipient,
        keyword: CrisisKeyword,
        text: &str,
    ) -> Result<ReplyOutcome, DatabaseError> {
        self.log
            .log(
                LogKind::Crisis,
                &format!("crisis keyword {}", keyword.as_str()),
                Some(&r.phone),
                Some(json!({ "keyword": keyword.as_str(), "text": text })),
            )
            .await;

        let template_id = keyword.template_id();
        let body = self.system_text(&template_id, keyword.fallback()).await?;
        let sent = self.reply(r, &body, &template_id).await;
        Ok(ReplyOutcome::handled("crisis", sent))
    }

    /// `Ok(None)` means the wait was cleared and the message falls through.
    async fn handle_interactive(
        &self,
        r: &Recipient,
        template_id: &str,
        since: DateTime<Utc>,
        text: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<ReplyOutcome>, DatabaseError> {
        if is_expired(since, now, self.config.awaiting_window) {
            debug!(phone = %r.phone, template_id, "Awaiting state expired");
            clear_awaiting(self.store.as_ref(), &r.phone).await?;
            return Ok(None);
        }

        let template = self.store.get_template(template_id).await?;
        let Some(template) = template.filter(|t| !t.options.is_empty()) else {
            warn!(phone = %r.phone, template_id, "Awaited template missing or has no options");
            clear_awaiting(self.store.as_ref(), &r.phone).await?;
            return Ok(None);
        };

        let Some(letter) = template.options.match_reply(text) else {
            let body = format!("Please reply with {}.", template.options.describe());
            let sent = self.reply(r, &body, &template.id).await;
            self.log
                .log(
                    LogKind::Reply,
                    "invalid option",
                    Some(&r.phone),
                    Some(json!({ "template_id": template.id, "text": text })),
                )
                .await;
            return Ok(Some(ReplyOutcome::handled("reprompt", sent)));
        };

        let answer = letter.to_string();
        let marked = self
            .store
            .mark_delivery_responded(&r.phone, &template.id, &answer, now)
            .await?;
        clear_awaiting(self.store.as_ref(), &r.phone).await?;

        let followup = self
            .store
            .get_template(&template.followup_id(letter))
            .await?
            .filter(|t| t.active);
        let (body, reply_id) = match followup {
            Some(f) => {
                if f.is_interactive() && !f.options.is_empty() {
                    mark_awaiting(self.store.as_ref(), &r.phone, &f.id, now).await?;
                }
                (f.body, f.id)
            }
            None => (
                self.system_text(SYSTEM_ACK, ACK_FALLBACK).await?,
                SYSTEM_ACK.to_string(),
            ),
        };
        let sent = self.reply(r, &body, &reply_id).await;

        self.log
            .log(
                LogKind::Reply,
                "interactive answer",
                Some(&r.phone),
                Some(json!({
                    "template_id": template.id,
                    "answer": answer,
                    "reply_template": reply_id,
                    "delivery_marked": marked,
                })),
            )
            .await;
        Ok(Some(ReplyOutcome::handled("interactive_reply", sent)))
    }

    async fn system_text(&self, id: &str, fallback: &str) -> Result<String, DatabaseError> {
        Ok(self
            .store
            .get_template(id)
            .await?
            .filter(|t| t.active)
            .map(|t| t.body)
            .unwrap_or_else(|| fallback.to_string()))
    }

    /// Personalize and send a conversational reply. Returns the text. Replies
    /// are not deliveries: they neither count toward the cap nor advance
    /// progression.
    async fn reply(&self, r: &Recipient, body: &str, template_id: &str) -> String {
        let text = personalize(body, r.display_name.as_deref());
        if let Err(e) = send_with_timeout(
            self.transport.as_ref(),
            self.send_timeout,
            &r.phone,
            &text,
            template_id,
        )
        .await
        {
            self.log
                .log(
                    LogKind::Error,
                    "reply send failed",
                    Some(&r.phone),
                    Some(json!({ "template_id": template_id, "error": e.to_string() })),
                )
                .await;
        }
        text
    }
}
