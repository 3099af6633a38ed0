// Notification outbox
//
// Reducers never talk to the mail provider. They queue rows here and an
// external mail worker (an authorized worker) subscribes, renders the
// template, sends, and reports back through `mark_email_sent`.

use serde_json::{json, Value};
use spacetimedb::{
    client_visibility_filter, reducer, table, Filter, Identity, ReducerContext, ScheduleAt,
    SpacetimeType, Table, Timestamp,
};

use crate::config::{
    EMAIL_RETENTION_DAYS, EMAIL_SENDER, MAX_EMAIL_ATTEMPTS, MICROS_PER_DAY, MICROS_PER_MINUTE,
    OUTBOX_CLEANUP_INTERVAL_SECS,
};
use crate::error::reject;
use crate::{format_display_date, profile, require_worker, short_id, Raffle, RaffleEntry};

/// Queued transactional email
/// SECURITY: public table with RLS - only authorized workers can see rows
#[table(name = email_outbox, public)]
pub struct EmailOutbox {
    #[primary_key]
    #[auto_inc]
    pub id: u64,

    #[index(btree)]
    pub raffle_id: u64,

    pub recipient: Identity,

    /// Template key, e.g. "raffle_winner"
    pub template: String,

    /// JSON: {from, to, template, subject, data}
    pub payload: String,

    /// Created timestamp for FIFO processing
    #[index(btree)]
    pub created_at: Timestamp,

    pub status: EmailStatus,

    pub attempts: u8,

    /// When to retry (None = now)
    pub next_retry_at: Option<Timestamp>,

    pub last_error: Option<String>,

    pub sent_at: Option<Timestamp>,
}

#[derive(SpacetimeType, Debug, Clone, Copy, PartialEq)]
pub enum EmailStatus {
    Pending,
    Sent,
    /// Gave up after MAX_EMAIL_ATTEMPTS
    DeadLetter,
}

#[client_visibility_filter]
const EMAIL_OUTBOX_VISIBILITY: Filter = Filter::Sql(
    "SELECT eo.* FROM email_outbox eo
     JOIN authorized_worker aw WHERE aw.identity = :sender"
);

/// Schedule table for outbox cleanup
#[table(name = outbox_cleanup_schedule, scheduled(cleanup_email_outbox))]
pub struct OutboxCleanupSchedule {
    #[primary_key]
    #[auto_inc]
    pub id: u64,

    pub scheduled_at: ScheduleAt,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum EmailTemplate {
    RaffleWinner,
    RaffleResult,
}

impl EmailTemplate {
    pub fn key(&self) -> &'static str {
        match self {
            EmailTemplate::RaffleWinner => "raffle_winner",
            EmailTemplate::RaffleResult => "raffle_result",
        }
    }

    pub fn subject(&self, raffle_title: &str) -> String {
        match self {
            EmailTemplate::RaffleWinner => format!("You won the {} raffle!", raffle_title),
            EmailTemplate::RaffleResult => format!("{} raffle results", raffle_title),
        }
    }
}

pub fn email_payload(to: &str, template: EmailTemplate, raffle_title: &str, data: Value) -> Value {
    json!({
        "from": EMAIL_SENDER,
        "to": to,
        "template": template.key(),
        "subject": template.subject(raffle_title),
        "data": data,
    })
}

/// Delay before the next attempt, or None once the email should be dead-lettered
/// `attempts` is the count after the failure being recorded: 1, 2, 4, 8 minutes
pub fn retry_delay_micros(attempts: u8) -> Option<i64> {
    if attempts >= MAX_EMAIL_ATTEMPTS {
        return None;
    }
    let backoff_minutes = 1i64 << attempts.saturating_sub(1).min(4);
    Some(backoff_minutes * MICROS_PER_MINUTE)
}

pub(crate) fn schedule_outbox_cleanup(ctx: &ReducerContext) {
    // Check if scheduler already exists to avoid duplicates on republish
    if ctx.db.outbox_cleanup_schedule().iter().count() == 0 {
        ctx.db.outbox_cleanup_schedule().insert(OutboxCleanupSchedule {
            id: 0, // auto_inc
            scheduled_at: ScheduleAt::Interval(
                std::time::Duration::from_secs(OUTBOX_CLEANUP_INTERVAL_SECS).into(),
            ),
        });
    }
}

fn queue_email(
    ctx: &ReducerContext,
    raffle_id: u64,
    recipient: Identity,
    template: EmailTemplate,
    payload: Value,
) {
    ctx.db.email_outbox().insert(EmailOutbox {
        id: 0, // auto_inc
        raffle_id,
        recipient,
        template: template.key().to_string(),
        payload: payload.to_string(),
        created_at: ctx.timestamp,
        status: EmailStatus::Pending,
        attempts: 0,
        next_retry_at: None, // Ready to send immediately
        last_error: None,
        sent_at: None,
    });
}

/// Queue the winner email and a result email for every other entrant
/// Entrants without an email address on their profile are skipped
pub(crate) fn queue_draw_notifications(
    ctx: &ReducerContext,
    raffle: &Raffle,
    winner_name: &str,
    entries: &[RaffleEntry],
) {
    let Some(winner_id) = raffle.winner_user_id else {
        return;
    };
    let selected_on = raffle
        .winner_selected_at
        .map(format_display_date)
        .unwrap_or_default();

    let mut queued = 0usize;
    let mut skipped = 0usize;

    for entry in entries {
        let Some(email) = ctx.db.profile()
            .identity()
            .find(&entry.user_id)
            .and_then(|p| p.email)
        else {
            skipped += 1;
            continue;
        };

        let (template, data) = if entry.user_id == winner_id {
            (
                EmailTemplate::RaffleWinner,
                json!({
                    "raffle_title": raffle.title,
                    "prize": raffle.prize,
                    "prize_amount": raffle.prize_amount,
                    "winner_name": winner_name,
                    "your_tickets": entry.entry_count,
                    "selected_on": selected_on,
                }),
            )
        } else {
            (
                EmailTemplate::RaffleResult,
                json!({
                    "raffle_title": raffle.title,
                    "prize": raffle.prize,
                    "winner_name": winner_name,
                    "your_tickets": entry.entry_count,
                    "selected_on": selected_on,
                }),
            )
        };

        queue_email(
            ctx,
            raffle.id,
            entry.user_id,
            template,
            email_payload(&email, template, &raffle.title, data),
        );
        queued += 1;
    }

    log::info!("[EMAIL] queued raffle:{} emails:{} no_address:{}", raffle.id, queued, skipped);
}

/// What a worker's delivery report did to an outbox row
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Delivery {
    Sent,
    /// Failed, next attempt after this many micros
    Retry(i64),
    DeadLetter,
    /// Failure reported for a row that is no longer pending
    Ignored,
}

/// Apply a delivery report to an outbox row
/// Failures only count against pending rows, so a stale report never
/// dead-letters an email that was already delivered
pub fn apply_delivery_report(email: &mut EmailOutbox, error: Option<String>, now: Timestamp) -> Delivery {
    let Some(err) = error else {
        email.status = EmailStatus::Sent;
        email.sent_at = Some(now);
        email.last_error = None;
        email.next_retry_at = None;
        return Delivery::Sent;
    };

    if email.status != EmailStatus::Pending {
        return Delivery::Ignored;
    }

    email.attempts = email.attempts.saturating_add(1);
    email.last_error = Some(err);

    match retry_delay_micros(email.attempts) {
        Some(delay) => {
            let next_retry_micros = now.to_micros_since_unix_epoch() + delay;
            email.next_retry_at = Some(Timestamp::from_micros_since_unix_epoch(next_retry_micros));
            Delivery::Retry(delay)
        }
        None => {
            email.status = EmailStatus::DeadLetter;
            email.next_retry_at = None;
            Delivery::DeadLetter
        }
    }
}

/// Put a dead letter back in the queue with a fresh retention window
pub fn requeue(email: &mut EmailOutbox, now: Timestamp) {
    email.status = EmailStatus::Pending;
    email.attempts = 0;
    email.next_retry_at = None;
    email.created_at = now;
}

/// Sent rows age from sent_at, everything else from created_at
pub fn is_expired(email: &EmailOutbox, now: Timestamp) -> bool {
    let reference = match email.status {
        EmailStatus::Sent => email.sent_at.unwrap_or(email.created_at),
        EmailStatus::Pending | EmailStatus::DeadLetter => email.created_at,
    };
    now.to_micros_since_unix_epoch() - reference.to_micros_since_unix_epoch()
        > EMAIL_RETENTION_DAYS * MICROS_PER_DAY
}

/// Mark an email as sent, or record a failed attempt (called by the mail worker)
/// Failures only affect the outbox row, never raffle state
#[reducer]
pub fn mark_email_sent(ctx: &ReducerContext, email_id: u64, error: Option<String>) -> Result<(), String> {
    require_worker(ctx).map_err(|e| reject("EMAIL", "mark_email_sent", e))?;

    let Some(mut email) = ctx.db.email_outbox().id().find(&email_id) else {
        log::error!("mark_email_sent: Email {} not found", email_id);
        return Ok(());
    };

    match apply_delivery_report(&mut email, error, ctx.timestamp) {
        Delivery::Sent => {
            log::info!("[EMAIL] sent id:{} template:{} to:{}", email_id, email.template, short_id(&email.recipient));
        }
        Delivery::Retry(delay) => {
            log::warn!(
                "[EMAIL] failed id:{} attempt:{} retry_in:{}m error:{:?}",
                email_id,
                email.attempts,
                delay / MICROS_PER_MINUTE,
                email.last_error
            );
        }
        Delivery::DeadLetter => {
            log::error!(
                "[EMAIL] ✗ gave up id:{} attempts:{} error:{:?}",
                email_id,
                email.attempts,
                email.last_error
            );
        }
        Delivery::Ignored => {
            log::warn!("[EMAIL] ignored failure report id:{} status:{:?}", email_id, email.status);
            return Ok(());
        }
    }

    ctx.db.email_outbox().id().update(email);
    Ok(())
}

/// Purge old outbox rows
/// Sent rows go EMAIL_RETENTION_DAYS after sent_at; undelivered rows go the same
/// span after created_at, logged with their payload so they can be replayed
#[reducer]
pub fn cleanup_email_outbox(ctx: &ReducerContext, _schedule: OutboxCleanupSchedule) {
    // Only allow scheduler to call this, not clients
    if ctx.sender != ctx.identity() {
        log::warn!("Client {} attempted to call cleanup_email_outbox", ctx.sender);
        return;
    }

    let mut purged = 0usize;

    let expired: Vec<EmailOutbox> = ctx.db.email_outbox()
        .iter()
        .filter(|e| is_expired(e, ctx.timestamp))
        .collect();

    for email in expired {
        if email.status != EmailStatus::Sent {
            log::error!(
                "[EMAIL] ✗ dead_letter id:{} raffle:{} to:{} attempts:{} error:{} payload:{}",
                email.id,
                email.raffle_id,
                short_id(&email.recipient),
                email.attempts,
                email.last_error.as_deref().unwrap_or("none"),
                email.payload
            );
        }
        ctx.db.email_outbox().id().delete(&email.id);
        purged += 1;
    }

    if purged > 0 {
        log::info!("[EMAIL] cleanup purged:{}", purged);
    }
}

/// Admin panel helper: re-queue every dead letter for a raffle
#[reducer]
pub fn retry_dead_letters(ctx: &ReducerContext, raffle_id: u64) -> Result<(), String> {
    require_worker(ctx).map_err(|e| reject("EMAIL", "retry_dead_letters", e))?;

    let dead: Vec<EmailOutbox> = ctx.db.email_outbox()
        .raffle_id()
        .filter(&raffle_id)
        .filter(|e| e.status == EmailStatus::DeadLetter)
        .collect();
    let count = dead.len();

    for mut email in dead {
        requeue(&mut email, ctx.timestamp);
        ctx.db.email_outbox().id().update(email);
    }

    log::info!("[EMAIL] requeued raffle:{} dead_letters:{}", raffle_id, count);
    Ok(())
}
