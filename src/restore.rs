// Bulk restore reducer for migrating raffles from the previous datastore
// Accepts one raffle document exported by the admin panel (TypeScript SDK format)

use std::collections::{BTreeMap, HashMap};

use serde_json::Value;
use spacetimedb::{reducer, Identity, ReducerContext, Table, Timestamp};

use crate::error::{reject, RaffleError};
use crate::{
    raffle, raffle_task, raffle_ticket, require_worker, set_entry_count, Raffle, RaffleTask,
    RaffleTicket, TaskStatus, TicketSource,
};

/// Parsed export: legacy ids are kept only to re-link tickets to tasks
#[derive(Debug)]
pub(crate) struct RaffleExport {
    pub raffle: Raffle,
    /// (legacy task id, task)
    pub tasks: Vec<(u64, RaffleTask)>,
    /// (legacy task id, ticket)
    pub tickets: Vec<(Option<u64>, RaffleTicket)>,
}

/// Parse Timestamp from SDK JSON format: {"__timestamp_micros_since_unix_epoch__": "123456"}
fn parse_timestamp_json(val: &Value) -> Result<Timestamp, String> {
    let micros_str = val.get("__timestamp_micros_since_unix_epoch__")
        .and_then(|v| v.as_str())
        .ok_or("Missing or invalid timestamp field")?;

    let micros: i64 = micros_str.parse()
        .map_err(|e| format!("Invalid timestamp micros: {}", e))?;

    Ok(Timestamp::from_micros_since_unix_epoch(micros))
}

/// Parse Identity from SDK JSON format: {"__identity__": "c200..."} or a bare hex string
fn parse_identity_json(val: &Value) -> Result<Identity, String> {
    let hex = val.get("__identity__")
        .and_then(|v| v.as_str())
        .or_else(|| val.as_str())
        .ok_or("Missing or invalid identity field")?;

    Identity::from_hex(hex).map_err(|e| format!("Invalid identity '{}': {}", hex, e))
}

/// Legacy ids may be exported as numbers or strings
fn parse_id(val: Option<&Value>) -> Option<u64> {
    val.and_then(|v| v.as_u64().or_else(|| v.as_str().and_then(|s| s.parse().ok())))
}

fn parse_task_status(s: &str) -> Result<TaskStatus, String> {
    match s.to_lowercase().as_str() {
        "pending" => Ok(TaskStatus::Pending),
        "verified" => Ok(TaskStatus::Verified),
        "rejected" => Ok(TaskStatus::Rejected),
        other => Err(format!("Unknown verification status '{}'", other)),
    }
}

fn parse_ticket_source(s: Option<&str>) -> TicketSource {
    match s.map(|s| s.to_lowercase()).as_deref() {
        Some("task") => TicketSource::Task,
        Some("repair") => TicketSource::Repair,
        _ => TicketSource::Restore,
    }
}

fn parse_raffle(r: &Value) -> Result<Raffle, String> {
    Ok(Raffle {
        id: 0, // auto_inc
        title: r.get("title").and_then(|v| v.as_str()).ok_or("Raffle: missing title")?.to_string(),
        prize: r.get("prize").and_then(|v| v.as_str()).ok_or("Raffle: missing prize")?.to_string(),
        prize_amount: r.get("prizeAmount").and_then(|v| v.as_u64()),
        winner_user_id: r.get("winnerUserId")
            .filter(|v| !v.is_null())
            .map(parse_identity_json)
            .transpose()?,
        winner_selected_at: r.get("winnerSelectedAt")
            .filter(|v| !v.is_null())
            .map(parse_timestamp_json)
            .transpose()?,
        is_active: r.get("isActive").and_then(|v| v.as_bool()).ok_or("Raffle: missing isActive")?,
        created_at: parse_timestamp_json(r.get("createdAt").ok_or("Raffle: missing createdAt")?)?,
    })
}

fn parse_task(t: &Value, i: usize) -> Result<(u64, RaffleTask), String> {
    let legacy_id = parse_id(t.get("id")).ok_or(format!("Task {}: missing id", i))?;
    let status = t.get("verificationStatus")
        .and_then(|v| v.as_str())
        .ok_or(format!("Task {}: missing verificationStatus", i))?;

    Ok((legacy_id, RaffleTask {
        id: 0, // auto_inc
        raffle_id: 0, // linked on insert
        user_id: parse_identity_json(t.get("userId").ok_or(format!("Task {}: missing userId", i))?)
            .map_err(|e| format!("Task {}: {}", i, e))?,
        task_type: t.get("taskType").and_then(|v| v.as_str()).ok_or(format!("Task {}: missing taskType", i))?.to_string(),
        verification_status: parse_task_status(status).map_err(|e| format!("Task {}: {}", i, e))?,
        username: t.get("username").and_then(|v| v.as_str()).map(|s| s.to_string()),
        submitted_at: parse_timestamp_json(t.get("submittedAt").ok_or(format!("Task {}: missing submittedAt", i))?)?,
        verified_at: t.get("verifiedAt").and_then(|v| parse_timestamp_json(v).ok()),
    }))
}

fn parse_ticket(t: &Value, i: usize) -> Result<(Option<u64>, RaffleTicket), String> {
    let metadata = match t.get("metadata") {
        Some(Value::String(s)) => s.clone(),
        Some(v) if v.is_object() => v.to_string(),
        _ => "{}".to_string(),
    };

    Ok((parse_id(t.get("taskId")), RaffleTicket {
        id: 0, // auto_inc
        raffle_id: 0, // linked on insert
        user_id: parse_identity_json(t.get("userId").ok_or(format!("Ticket {}: missing userId", i))?)
            .map_err(|e| format!("Ticket {}: {}", i, e))?,
        ticket_source: parse_ticket_source(t.get("ticketSource").and_then(|v| v.as_str())),
        task_id: None, // linked on insert
        metadata,
        created_at: parse_timestamp_json(t.get("createdAt").ok_or(format!("Ticket {}: missing createdAt", i))?)?,
    }))
}

/// Parse a `{raffle, tasks, tickets}` export document
pub(crate) fn parse_raffle_export(json_data: &str) -> Result<RaffleExport, RaffleError> {
    let data: Value = serde_json::from_str(json_data)
        .map_err(|e| RaffleError::Restore(format!("Invalid JSON: {}", e)))?;

    let raffle = parse_raffle(data.get("raffle").ok_or_else(|| RaffleError::Restore("Missing raffle".into()))?)
        .map_err(RaffleError::Restore)?;

    let empty = Vec::new();
    let tasks = data.get("tasks").and_then(|v| v.as_array()).unwrap_or(&empty)
        .iter()
        .enumerate()
        .map(|(i, t)| parse_task(t, i))
        .collect::<Result<Vec<_>, _>>()
        .map_err(RaffleError::Restore)?;
    let tickets = data.get("tickets").and_then(|v| v.as_array()).unwrap_or(&empty)
        .iter()
        .enumerate()
        .map(|(i, t)| parse_ticket(t, i))
        .collect::<Result<Vec<_>, _>>()
        .map_err(RaffleError::Restore)?;

    // Every ticket must point at an exported task (or at none)
    for (i, (legacy_task, _)) in tickets.iter().enumerate() {
        if let Some(legacy) = legacy_task {
            if !tasks.iter().any(|(id, _)| id == legacy) {
                return Err(RaffleError::Restore(format!("Ticket {}: unknown taskId {}", i, legacy)));
            }
        }
    }

    Ok(RaffleExport { raffle, tasks, tickets })
}

/// Restore one raffle with its tasks and tickets from JSON
/// Entry counts are rebuilt from the restored tickets
/// Protected by authorization check - only authorized workers can call this
#[reducer]
pub fn bulk_restore_raffle(ctx: &ReducerContext, json_data: String) -> Result<(), String> {
    restore_raffle(ctx, &json_data).map_err(|e| reject("RESTORE", "bulk_restore_raffle", e))
}

fn restore_raffle(ctx: &ReducerContext, json_data: &str) -> Result<(), RaffleError> {
    require_worker(ctx)?;
    let export = parse_raffle_export(json_data)?;

    let raffle = ctx.db.raffle().insert(export.raffle);
    let raffle_id = raffle.id;

    let mut task_ids: HashMap<u64, u64> = HashMap::new();
    for (legacy_id, mut task) in export.tasks {
        task.raffle_id = raffle_id;
        let inserted = ctx.db.raffle_task().insert(task);
        task_ids.insert(legacy_id, inserted.id);
    }

    let mut ticket_counts: BTreeMap<Identity, u32> = BTreeMap::new();
    for (legacy_task, mut ticket) in export.tickets {
        ticket.raffle_id = raffle_id;
        ticket.task_id = legacy_task.and_then(|id| task_ids.get(&id).copied());
        *ticket_counts.entry(ticket.user_id).or_default() += 1;
        ctx.db.raffle_ticket().insert(ticket);
    }

    for (user_id, count) in &ticket_counts {
        set_entry_count(ctx, raffle_id, *user_id, *count);
    }

    log::info!(
        "✅ Restored raffle:{} tasks:{} tickets:{} entrants:{}",
        raffle_id,
        task_ids.len(),
        ticket_counts.values().sum::<u32>(),
        ticket_counts.len()
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ts(micros: i64) -> Value {
        json!({ "__timestamp_micros_since_unix_epoch__": micros.to_string() })
    }

    fn sample_export() -> Value {
        let alice = Identity::from_byte_array([1; 32]).to_string();
        let bob = Identity::from_byte_array([2; 32]).to_string();
        json!({
            "raffle": {
                "title": "Genesis",
                "prize": "Hardware wallet",
                "prizeAmount": 15000,
                "winnerUserId": null,
                "isActive": true,
                "createdAt": ts(1_000),
            },
            "tasks": [
                { "id": "41", "userId": alice, "taskType": "twitter_follow",
                  "verificationStatus": "verified", "username": "alice",
                  "submittedAt": ts(2_000), "verifiedAt": ts(3_000) },
                { "id": 42, "userId": { "__identity__": bob }, "taskType": "discord_join",
                  "verificationStatus": "PENDING", "submittedAt": ts(2_500) },
            ],
            "tickets": [
                { "userId": alice, "taskId": 41, "ticketSource": "task", "createdAt": ts(3_000) },
                { "userId": alice, "taskId": "41", "metadata": { "repair": true }, "createdAt": ts(3_000) },
                { "userId": bob, "createdAt": ts(4_000) },
            ],
        })
    }

    #[test]
    fn test_parse_timestamp_json() {
        assert_eq!(
            parse_timestamp_json(&ts(1_760_572_800_000_000)).unwrap(),
            Timestamp::from_micros_since_unix_epoch(1_760_572_800_000_000)
        );
        assert!(parse_timestamp_json(&json!({ "micros": "1" })).is_err());
        assert!(parse_timestamp_json(&json!({ "__timestamp_micros_since_unix_epoch__": "soon" })).is_err());
    }

    #[test]
    fn test_parse_identity_json() {
        let id = Identity::from_byte_array([9; 32]);
        assert_eq!(parse_identity_json(&json!(id.to_string())).unwrap(), id);
        assert_eq!(parse_identity_json(&json!({ "__identity__": id.to_string() })).unwrap(), id);
        assert!(parse_identity_json(&json!("not-hex")).is_err());
        assert!(parse_identity_json(&json!(42)).is_err());
    }

    #[test]
    fn test_parse_raffle_export() {
        let export = parse_raffle_export(&sample_export().to_string()).unwrap();

        assert_eq!(export.raffle.title, "Genesis");
        assert_eq!(export.raffle.prize_amount, Some(15000));
        assert!(export.raffle.is_active);
        assert!(export.raffle.winner_user_id.is_none());

        assert_eq!(export.tasks.len(), 2);
        assert_eq!(export.tasks[0].0, 41);
        assert_eq!(export.tasks[0].1.verification_status, TaskStatus::Verified);
        assert_eq!(export.tasks[0].1.username.as_deref(), Some("alice"));
        assert_eq!(export.tasks[1].0, 42);
        assert_eq!(export.tasks[1].1.verification_status, TaskStatus::Pending);
        assert_eq!(export.tasks[1].1.user_id, Identity::from_byte_array([2; 32]));

        assert_eq!(export.tickets.len(), 3);
        assert_eq!(export.tickets[0].0, Some(41));
        assert_eq!(export.tickets[0].1.ticket_source, TicketSource::Task);
        assert_eq!(export.tickets[1].0, Some(41));
        assert_eq!(export.tickets[1].1.ticket_source, TicketSource::Restore);
        assert_eq!(export.tickets[1].1.metadata, r#"{"repair":true}"#);
        assert_eq!(export.tickets[2].0, None);
        assert_eq!(export.tickets[2].1.metadata, "{}");
    }

    #[test]
    fn test_parse_raffle_export_errors() {
        let mut doc = sample_export();
        doc["tasks"][1]["verificationStatus"] = json!("approved");
        let err = parse_raffle_export(&doc.to_string()).unwrap_err();
        assert_eq!(err, RaffleError::Restore("Task 1: Unknown verification status 'approved'".into()));

        let mut doc = sample_export();
        doc["tickets"][2]["taskId"] = json!(99);
        let err = parse_raffle_export(&doc.to_string()).unwrap_err();
        assert_eq!(err, RaffleError::Restore("Ticket 2: unknown taskId 99".into()));

        let mut doc = sample_export();
        doc["raffle"].as_object_mut().unwrap().remove("title");
        assert!(parse_raffle_export(&doc.to_string()).is_err());

        assert!(matches!(parse_raffle_export("not json"), Err(RaffleError::Restore(_))));
    }
}
