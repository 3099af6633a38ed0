// Raffle lifecycle and the task verification workflow
//
// Normal ticket path: a user submits a task, an admin verifies it, and the
// verification issues TICKETS_PER_VERIFIED_TASK tickets tagged with the task.

use serde_json::json;
use spacetimedb::{reducer, ReducerContext, Table};

use crate::config::{MAX_TASK_TYPE_LEN, MAX_TITLE_LEN, MAX_USERNAME_LEN, TICKETS_PER_VERIFIED_TASK};
use crate::error::{reject, RaffleError};
use crate::{
    count_user_tickets, find_raffle, raffle, raffle_task, raffle_ticket, require_admin,
    set_entry_count, short_id, Raffle, RaffleTask, RaffleTicket, TaskStatus, TicketSource,
};

/// Lowercase snake_case key, e.g. " Twitter Follow " -> "twitter_follow"
fn normalize_task_type(task_type: &str) -> Result<String, RaffleError> {
    let normalized: String = task_type
        .trim()
        .to_lowercase()
        .split(|c: char| c.is_whitespace() || c == '-')
        .filter(|part| !part.is_empty())
        .collect::<Vec<_>>()
        .join("_");

    if normalized.is_empty() {
        return Err(RaffleError::InvalidInput("task type is empty".into()));
    }
    if normalized.len() > MAX_TASK_TYPE_LEN {
        return Err(RaffleError::InvalidInput(format!(
            "task type longer than {} characters",
            MAX_TASK_TYPE_LEN
        )));
    }
    if !normalized.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
        return Err(RaffleError::InvalidInput(format!("task type '{}' has invalid characters", normalized)));
    }
    Ok(normalized)
}

fn validate_title(title: &str) -> Result<String, RaffleError> {
    let title = title.trim();
    if title.is_empty() {
        return Err(RaffleError::InvalidInput("title is empty".into()));
    }
    if title.chars().count() > MAX_TITLE_LEN {
        return Err(RaffleError::InvalidInput(format!("title longer than {} characters", MAX_TITLE_LEN)));
    }
    Ok(title.to_string())
}

/// Trimmed handle without a leading '@'; empty means none
fn normalize_username(username: Option<String>) -> Result<Option<String>, RaffleError> {
    let Some(raw) = username else {
        return Ok(None);
    };
    let handle = raw.trim().trim_start_matches('@').trim();
    if handle.is_empty() {
        return Ok(None);
    }
    if handle.chars().count() > MAX_USERNAME_LEN {
        return Err(RaffleError::InvalidInput(format!("username longer than {} characters", MAX_USERNAME_LEN)));
    }
    Ok(Some(handle.to_string()))
}

/// Admin: open a new raffle
#[reducer]
pub fn create_raffle(ctx: &ReducerContext, title: String, prize: String, prize_amount: Option<u64>) -> Result<(), String> {
    open_raffle(ctx, &title, &prize, prize_amount).map_err(|e| reject("RAFFLE", "create_raffle", e))
}

fn open_raffle(ctx: &ReducerContext, title: &str, prize: &str, prize_amount: Option<u64>) -> Result<(), RaffleError> {
    require_admin(ctx)?;
    let title = validate_title(title)?;
    let prize = prize.trim().to_string();
    if prize.is_empty() {
        return Err(RaffleError::InvalidInput("prize is empty".into()));
    }

    let raffle = ctx.db.raffle().insert(Raffle {
        id: 0, // auto_inc
        title,
        prize,
        prize_amount,
        winner_user_id: None,
        winner_selected_at: None,
        is_active: true,
        created_at: ctx.timestamp,
    });

    log::info!("[RAFFLE] created raffle:{} title:\"{}\" by:{}", raffle.id, raffle.title, short_id(&ctx.sender));
    Ok(())
}

/// Admin: stop accepting task submissions without drawing
/// A closed raffle can still be drawn
#[reducer]
pub fn close_raffle(ctx: &ReducerContext, raffle_id: u64) -> Result<(), String> {
    deactivate_raffle(ctx, raffle_id).map_err(|e| reject("RAFFLE", "close_raffle", e))
}

fn deactivate_raffle(ctx: &ReducerContext, raffle_id: u64) -> Result<(), RaffleError> {
    require_admin(ctx)?;
    let mut raffle = find_raffle(ctx, raffle_id)?;
    if !raffle.is_active {
        return Err(RaffleError::RaffleInactive(raffle_id));
    }
    raffle.is_active = false;
    ctx.db.raffle().id().update(raffle);

    log::info!("[RAFFLE] closed raffle:{} by:{}", raffle_id, short_id(&ctx.sender));
    Ok(())
}

/// Submit a task for verification
/// Each task type counts once per user per raffle; a rejected task may be resubmitted
#[reducer]
pub fn submit_raffle_task(
    ctx: &ReducerContext,
    raffle_id: u64,
    task_type: String,
    username: Option<String>,
) -> Result<(), String> {
    submit_task(ctx, raffle_id, &task_type, username)
        .map_err(|e| reject("TASK", "submit_raffle_task", e))
}

fn submit_task(
    ctx: &ReducerContext,
    raffle_id: u64,
    task_type: &str,
    username: Option<String>,
) -> Result<(), RaffleError> {
    let raffle = find_raffle(ctx, raffle_id)?;
    if !raffle.is_active || raffle.winner_user_id.is_some() {
        return Err(RaffleError::RaffleInactive(raffle_id));
    }

    let task_type = normalize_task_type(task_type)?;
    let username = normalize_username(username)?;

    let duplicate = ctx.db.raffle_task()
        .user_id()
        .filter(&ctx.sender)
        .any(|t| {
            t.raffle_id == raffle_id
                && t.task_type == task_type
                && t.verification_status != TaskStatus::Rejected
        });
    if duplicate {
        return Err(RaffleError::DuplicateTask { raffle_id, task_type });
    }

    let task = ctx.db.raffle_task().insert(RaffleTask {
        id: 0, // auto_inc
        raffle_id,
        user_id: ctx.sender,
        task_type,
        verification_status: TaskStatus::Pending,
        username,
        submitted_at: ctx.timestamp,
        verified_at: None,
    });

    log::info!(
        "[TASK] submitted task:{} raffle:{} user:{} type:{}",
        task.id,
        raffle_id,
        short_id(&ctx.sender),
        task.task_type
    );
    Ok(())
}

/// Admin: approve or reject a pending task
/// Approval issues the task's tickets and refreshes the entry count
#[reducer]
pub fn verify_raffle_task(ctx: &ReducerContext, task_id: u64, approved: bool) -> Result<(), String> {
    review_task(ctx, task_id, approved).map_err(|e| reject("TASK", "verify_raffle_task", e))
}

fn review_task(ctx: &ReducerContext, task_id: u64, approved: bool) -> Result<(), RaffleError> {
    require_admin(ctx)?;

    let mut task = ctx.db.raffle_task()
        .id()
        .find(&task_id)
        .ok_or(RaffleError::TaskNotFound(task_id))?;
    if task.verification_status != TaskStatus::Pending {
        return Err(RaffleError::TaskAlreadyReviewed(task_id));
    }

    if !approved {
        task.verification_status = TaskStatus::Rejected;
        ctx.db.raffle_task().id().update(task);
        log::info!("[TASK] rejected task:{} by:{}", task_id, short_id(&ctx.sender));
        return Ok(());
    }

    let raffle = find_raffle(ctx, task.raffle_id)?;
    if raffle.winner_user_id.is_some() {
        return Err(RaffleError::WinnerAlreadySelected(raffle.id));
    }

    task.verification_status = TaskStatus::Verified;
    task.verified_at = Some(ctx.timestamp);
    let (raffle_id, user_id) = (task.raffle_id, task.user_id);

    let metadata = json!({ "task_type": task.task_type }).to_string();
    for _ in 0..TICKETS_PER_VERIFIED_TASK {
        ctx.db.raffle_ticket().insert(RaffleTicket {
            id: 0, // auto_inc
            raffle_id,
            user_id,
            ticket_source: TicketSource::Task,
            task_id: Some(task_id),
            metadata: metadata.clone(),
            created_at: ctx.timestamp,
        });
    }
    ctx.db.raffle_task().id().update(task);

    let entry_count = count_user_tickets(ctx, raffle_id, user_id);
    set_entry_count(ctx, raffle_id, user_id, entry_count);

    log::info!(
        "[TASK] verified task:{} raffle:{} user:{} entries:{} by:{}",
        task_id,
        raffle_id,
        short_id(&user_id),
        entry_count,
        short_id(&ctx.sender)
    );
    Ok(())
}
