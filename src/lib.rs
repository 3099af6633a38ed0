use spacetimedb::{
    client_visibility_filter, reducer, table, Filter, Identity, ReducerContext, SpacetimeType,
    Table, Timestamp,
};

mod config;
mod draw;
mod error;
mod notify;
mod reconcile;
mod restore;
mod tasks;

use config::MAX_DISPLAY_NAME_LEN;
use error::{reject, RaffleError};

// ==================== TABLES ====================

/// A prize drawing
/// Lifecycle: created active, concluded once when a winner is recorded (no re-draw)
#[table(name = raffle, public)]
#[derive(Clone, Debug)]
pub struct Raffle {
    #[primary_key]
    #[auto_inc]
    pub id: u64,

    pub title: String,

    /// Prize description shown to entrants
    pub prize: String,

    /// Prize value in cents (display only)
    pub prize_amount: Option<u64>,

    /// Set exactly once by select_raffle_winner
    pub winner_user_id: Option<Identity>,

    pub winner_selected_at: Option<Timestamp>,

    /// False once a winner is drawn or an admin closes the raffle
    pub is_active: bool,

    pub created_at: Timestamp,
}

/// A per-user action (social follow, quiz, ...) that earns tickets once verified
#[table(name = raffle_task, public)]
#[derive(Clone, Debug)]
pub struct RaffleTask {
    #[primary_key]
    #[auto_inc]
    pub id: u64,

    #[index(btree)]
    pub raffle_id: u64,

    #[index(btree)]
    pub user_id: Identity,

    /// Normalized task key, e.g. "twitter_follow"
    pub task_type: String,

    pub verification_status: TaskStatus,

    /// Handle on the external platform the task was done on
    pub username: Option<String>,

    pub submitted_at: Timestamp,

    pub verified_at: Option<Timestamp>,
}

#[derive(SpacetimeType, Debug, Clone, Copy, PartialEq)]
pub enum TaskStatus {
    Pending,
    Verified,
    Rejected,
}

/// One row = one chance in the draw
#[table(name = raffle_ticket, public)]
#[derive(Clone, Debug)]
pub struct RaffleTicket {
    #[primary_key]
    #[auto_inc]
    pub id: u64,

    #[index(btree)]
    pub raffle_id: u64,

    #[index(btree)]
    pub user_id: Identity,

    pub ticket_source: TicketSource,

    /// Task that earned this ticket (None for legacy imports)
    pub task_id: Option<u64>,

    /// JSON object, e.g. {"repair": true, "repaired_at": "..."}
    pub metadata: String,

    pub created_at: Timestamp,
}

#[derive(SpacetimeType, Debug, Clone, Copy, PartialEq)]
pub enum TicketSource {
    /// Issued when a task was verified
    Task,
    /// Inserted by the reconciler
    Repair,
    /// Imported by bulk_restore_raffle
    Restore,
}

/// Cached ticket count per (raffle, user) - the weight used by the draw
/// CACHE INVALIDATION: rewritten on task verification, restore, and every reconciliation
#[table(name = raffle_entry, public)]
#[derive(Clone, Debug)]
pub struct RaffleEntry {
    #[primary_key]
    #[auto_inc]
    pub id: u64,

    #[index(btree)]
    pub raffle_id: u64,

    #[index(btree)]
    pub user_id: Identity,

    pub entry_count: u32,

    pub updated_at: Timestamp,
}

/// Display name and notification address
/// PRIVATE: holds email addresses
#[table(name = profile)]
#[derive(Clone, Debug)]
pub struct Profile {
    #[primary_key]
    pub identity: Identity,

    pub display_name: String,

    pub email: Option<String>,

    pub updated_at: Timestamp,
}

/// Role memberships checked by admin reducers
#[table(name = user_role)]
pub struct UserRole {
    #[primary_key]
    pub identity: Identity,

    pub role: Role,

    pub granted_by: Identity,

    pub granted_at: Timestamp,
}

#[derive(SpacetimeType, Debug, Clone, Copy, PartialEq)]
pub enum Role {
    User,
    Admin,
}

/// Authorized identities (module owner, mail worker, admin panel)
/// Used for RLS filtering and reducer authorization checks
#[table(name = authorized_worker)]
pub struct AuthorizedWorker {
    #[primary_key]
    pub identity: Identity,
}

/// JSON response bodies of admin operations (repair runs, draws)
/// SECURITY: public table with RLS - only authorized workers can see rows
#[table(name = admin_report, public)]
pub struct AdminReport {
    #[primary_key]
    #[auto_inc]
    pub id: u64,

    #[index(btree)]
    pub raffle_id: u64,

    pub kind: ReportKind,

    pub created_at: Timestamp,

    pub body: String,
}

#[derive(SpacetimeType, Debug, Clone, Copy, PartialEq)]
pub enum ReportKind {
    Repair,
    Draw,
}

// ==================== ROW LEVEL SECURITY ====================

#[client_visibility_filter]
const ADMIN_REPORT_VISIBILITY: Filter = Filter::Sql(
    "SELECT ar.* FROM admin_report ar
     JOIN authorized_worker aw WHERE aw.identity = :sender"
);

/// Entrants see their own tasks (usernames are not public)
#[client_visibility_filter]
const RAFFLE_TASK_OWNER_VISIBILITY: Filter = Filter::Sql(
    "SELECT * FROM raffle_task WHERE user_id = :sender"
);

#[client_visibility_filter]
const RAFFLE_TASK_WORKER_VISIBILITY: Filter = Filter::Sql(
    "SELECT rt.* FROM raffle_task rt
     JOIN authorized_worker aw WHERE aw.identity = :sender"
);

// ==================== HELPER FUNCTIONS ====================

fn is_authorized_worker(ctx: &ReducerContext) -> bool {
    ctx.db.authorized_worker().identity().find(&ctx.sender).is_some()
}

/// Authorized workers count as admins
pub(crate) fn is_admin(ctx: &ReducerContext) -> bool {
    is_authorized_worker(ctx)
        || ctx.db.user_role()
            .identity()
            .find(&ctx.sender)
            .map_or(false, |r| r.role == Role::Admin)
}

pub(crate) fn require_admin(ctx: &ReducerContext) -> Result<(), RaffleError> {
    if is_admin(ctx) {
        Ok(())
    } else {
        Err(RaffleError::Unauthorized)
    }
}

pub(crate) fn require_worker(ctx: &ReducerContext) -> Result<(), RaffleError> {
    if is_authorized_worker(ctx) {
        Ok(())
    } else {
        Err(RaffleError::Unauthorized)
    }
}

pub(crate) fn find_raffle(ctx: &ReducerContext, raffle_id: u64) -> Result<Raffle, RaffleError> {
    ctx.db.raffle()
        .id()
        .find(&raffle_id)
        .ok_or(RaffleError::RaffleNotFound(raffle_id))
}

pub(crate) fn find_entry(ctx: &ReducerContext, raffle_id: u64, user_id: Identity) -> Option<RaffleEntry> {
    ctx.db.raffle_entry()
        .raffle_id()
        .filter(&raffle_id)
        .find(|e| e.user_id == user_id)
}

/// Overwrite (or create) the cached entry count for a user
pub(crate) fn set_entry_count(ctx: &ReducerContext, raffle_id: u64, user_id: Identity, entry_count: u32) {
    match find_entry(ctx, raffle_id, user_id) {
        Some(mut entry) => {
            if entry.entry_count != entry_count {
                entry.entry_count = entry_count;
                entry.updated_at = ctx.timestamp;
                ctx.db.raffle_entry().id().update(entry);
            }
        }
        None => {
            ctx.db.raffle_entry().insert(RaffleEntry {
                id: 0, // auto_inc
                raffle_id,
                user_id,
                entry_count,
                updated_at: ctx.timestamp,
            });
        }
    }
}

pub(crate) fn count_user_tickets(ctx: &ReducerContext, raffle_id: u64, user_id: Identity) -> u32 {
    ctx.db.raffle_ticket()
        .raffle_id()
        .filter(&raffle_id)
        .filter(|t| t.user_id == user_id)
        .count() as u32
}

/// Abbreviated identity for logs and nameless entrants
pub(crate) fn short_id(identity: &Identity) -> String {
    let hex = identity.to_string();
    hex[..12.min(hex.len())].to_string()
}

/// Profile display name, falling back to the abbreviated identity
pub(crate) fn display_name(ctx: &ReducerContext, identity: &Identity) -> String {
    ctx.db.profile()
        .identity()
        .find(identity)
        .map(|p| p.display_name)
        .unwrap_or_else(|| short_id(identity))
}

fn to_datetime(ts: Timestamp) -> Option<chrono::DateTime<chrono::Utc>> {
    let micros = ts.to_micros_since_unix_epoch();
    chrono::DateTime::from_timestamp(
        micros.div_euclid(1_000_000),
        (micros.rem_euclid(1_000_000) * 1_000) as u32,
    )
}

/// RFC3339 with millisecond precision, e.g. "2025-10-16T00:00:00.250Z"
pub(crate) fn format_rfc3339(ts: Timestamp) -> String {
    to_datetime(ts)
        .map(|dt| dt.to_rfc3339_opts(chrono::SecondsFormat::Millis, true))
        .unwrap_or_default()
}

/// Human-readable date for emails, e.g. "October 16, 2025"
pub(crate) fn format_display_date(ts: Timestamp) -> String {
    to_datetime(ts)
        .map(|dt| dt.format("%B %-d, %Y").to_string())
        .unwrap_or_default()
}

fn validate_display_name(name: &str) -> Result<String, RaffleError> {
    let name = name.trim();
    if name.is_empty() {
        return Err(RaffleError::InvalidInput("display name is empty".into()));
    }
    if name.chars().count() > MAX_DISPLAY_NAME_LEN {
        return Err(RaffleError::InvalidInput(format!(
            "display name longer than {} characters",
            MAX_DISPLAY_NAME_LEN
        )));
    }
    Ok(name.to_string())
}

/// Shape check only; deliverability is the mail worker's problem
fn validate_email(email: &str) -> Result<String, RaffleError> {
    let email = email.trim().to_lowercase();
    let invalid = || RaffleError::InvalidInput(format!("invalid email '{}'", email));

    if email.len() > 254 || email.chars().any(char::is_whitespace) {
        return Err(invalid());
    }
    let (local, domain) = email.split_once('@').ok_or_else(invalid)?;
    if local.is_empty() || domain.contains('@') {
        return Err(invalid());
    }
    if !domain.contains('.') || domain.starts_with('.') || domain.ends_with('.') {
        return Err(invalid());
    }
    Ok(email)
}

// ==================== REDUCERS ====================

/// Initialize module - owner becomes an authorized worker, outbox cleanup is scheduled
#[reducer(init)]
pub fn init(ctx: &ReducerContext) {
    // In init, ctx.sender is the module owner identity
    if ctx.db.authorized_worker().identity().find(&ctx.sender).is_none() {
        ctx.db.authorized_worker().insert(AuthorizedWorker {
            identity: ctx.sender,
        });
    }

    notify::schedule_outbox_cleanup(ctx);

    log::info!("Raffle module initialized successfully");
}

/// Set the caller's display name and notification email
#[reducer]
pub fn set_profile(ctx: &ReducerContext, display_name: String, email: Option<String>) -> Result<(), String> {
    let display_name = validate_display_name(&display_name)
        .map_err(|e| reject("PROFILE", "set_profile", e))?;
    let email = email
        .filter(|e| !e.trim().is_empty())
        .map(|e| validate_email(&e))
        .transpose()
        .map_err(|e| reject("PROFILE", "set_profile", e))?;

    let profile = Profile {
        identity: ctx.sender,
        display_name,
        email,
        updated_at: ctx.timestamp,
    };

    if ctx.db.profile().identity().find(&ctx.sender).is_some() {
        ctx.db.profile().identity().update(profile);
    } else {
        ctx.db.profile().insert(profile);
        log::info!("[PROFILE] created user:{}", short_id(&ctx.sender));
    }
    Ok(())
}

fn parse_identity_hex(identity_hex: &str) -> Result<Identity, RaffleError> {
    Identity::from_hex(identity_hex.trim())
        .map_err(|e| RaffleError::InvalidInput(format!("identity '{}': {}", identity_hex, e)))
}

/// Grant a role to an identity (Role::User demotes an admin)
/// Only authorized workers can change roles
#[reducer]
pub fn grant_role(ctx: &ReducerContext, identity_hex: String, role: Role) -> Result<(), String> {
    require_worker(ctx).map_err(|e| reject("ADMIN", "grant_role", e))?;

    let identity = parse_identity_hex(&identity_hex).map_err(|e| reject("ADMIN", "grant_role", e))?;

    let row = UserRole {
        identity,
        role,
        granted_by: ctx.sender,
        granted_at: ctx.timestamp,
    };
    if ctx.db.user_role().identity().find(&identity).is_some() {
        ctx.db.user_role().identity().update(row);
    } else {
        ctx.db.user_role().insert(row);
    }

    log::info!("[ADMIN] role user:{} role:{:?} by:{}", short_id(&identity), role, short_id(&ctx.sender));
    Ok(())
}

/// Drop an identity's role row entirely; it falls back to a plain user
/// Only authorized workers can change roles
#[reducer]
pub fn revoke_role(ctx: &ReducerContext, identity_hex: String) -> Result<(), String> {
    require_worker(ctx).map_err(|e| reject("ADMIN", "revoke_role", e))?;

    let identity = parse_identity_hex(&identity_hex).map_err(|e| reject("ADMIN", "revoke_role", e))?;

    if !ctx.db.user_role().identity().delete(&identity) {
        return Err(reject(
            "ADMIN",
            "revoke_role",
            RaffleError::InvalidInput(format!("identity {} has no role", short_id(&identity))),
        ));
    }

    log::info!("[ADMIN] revoked role user:{} by:{}", short_id(&identity), short_id(&ctx.sender));
    Ok(())
}
