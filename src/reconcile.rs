// Ticket reconciliation
//
// Verified tasks are the source of truth: every user with `n` verified tasks
// on a raffle must end up with exactly `n × TICKETS_PER_VERIFIED_TASK` ticket
// rows and the same number in their cached entry count. Planning is a pure
// function over the loaded rows; the reducer applies the plan inside one
// transaction, so a failed run leaves nothing half-repaired.

use std::collections::BTreeMap;

use serde_json::{json, Value};
use spacetimedb::{reducer, Identity, ReducerContext, Table};

use crate::config::TICKETS_PER_VERIFIED_TASK;
use crate::error::{reject, RaffleError};
use crate::{
    admin_report, find_raffle, format_rfc3339, raffle_task, raffle_ticket, require_admin,
    set_entry_count, short_id, AdminReport, RaffleTask, RaffleTicket, ReportKind, TaskStatus,
    TicketSource,
};

/// Corrective work for one user
#[derive(Debug, Clone, PartialEq)]
pub struct UserRepair {
    pub user_id: Identity,
    /// verified tasks × tickets per task
    pub expected: u32,
    /// ticket rows found
    pub actual: u32,
    /// Surplus tickets to delete, newest first
    pub delete_ticket_ids: Vec<u64>,
    /// One task id per ticket to insert
    pub create_for_tasks: Vec<u64>,
}

impl UserRepair {
    pub fn is_mismatch(&self) -> bool {
        self.expected != self.actual
    }
}

/// Plan the repair for every user holding at least one verified task
///
/// Users without verified tasks are left alone, even if they hold tickets.
/// Surplus removal drops the most recently created tickets (ties broken by
/// higher id). Deficits are topped up per task, capped at the overall deficit
/// so untagged tickets still count toward the total.
pub fn plan_reconciliation(tasks: &[RaffleTask], tickets: &[RaffleTicket]) -> Vec<UserRepair> {
    let mut verified: BTreeMap<Identity, Vec<&RaffleTask>> = BTreeMap::new();
    for task in tasks.iter().filter(|t| t.verification_status == TaskStatus::Verified) {
        verified.entry(task.user_id).or_default().push(task);
    }

    verified
        .into_iter()
        .map(|(user_id, user_tasks)| {
            let mut user_tickets: Vec<&RaffleTicket> =
                tickets.iter().filter(|t| t.user_id == user_id).collect();
            let expected = user_tasks.len() as u32 * TICKETS_PER_VERIFIED_TASK;
            let actual = user_tickets.len() as u32;

            let mut delete_ticket_ids = Vec::new();
            let mut create_for_tasks = Vec::new();

            if actual > expected {
                user_tickets.sort_by(|a, b| {
                    b.created_at.cmp(&a.created_at).then_with(|| b.id.cmp(&a.id))
                });
                delete_ticket_ids = user_tickets
                    .iter()
                    .take((actual - expected) as usize)
                    .map(|t| t.id)
                    .collect();
            } else if actual < expected {
                for task in &user_tasks {
                    let have = user_tickets
                        .iter()
                        .filter(|t| t.task_id == Some(task.id))
                        .count() as u32;
                    for _ in have..TICKETS_PER_VERIFIED_TASK {
                        create_for_tasks.push(task.id);
                    }
                }
                create_for_tasks.truncate((expected - actual) as usize);
            }

            UserRepair {
                user_id,
                expected,
                actual,
                delete_ticket_ids,
                create_for_tasks,
            }
        })
        .collect()
}

/// Response body: {success, message, repairs: [...], total_fixed}
pub fn repair_report(plans: &[UserRepair]) -> Value {
    let repairs: Vec<Value> = plans
        .iter()
        .filter(|p| p.is_mismatch())
        .map(|p| {
            let mut repair = json!({
                "user_id": p.user_id.to_string(),
                "old_tickets": p.actual,
                "new_tickets": p.expected,
            });
            if !p.delete_ticket_ids.is_empty() {
                repair["deleted"] = json!(p.delete_ticket_ids.len());
            }
            if !p.create_for_tasks.is_empty() {
                repair["created"] = json!(p.create_for_tasks.len());
            }
            repair
        })
        .collect();

    let total_fixed = repairs.len();
    let message = if total_fixed == 0 {
        format!("All {} users already had correct ticket counts", plans.len())
    } else {
        format!("Fixed ticket counts for {} of {} users", total_fixed, plans.len())
    };

    json!({
        "success": true,
        "message": message,
        "repairs": repairs,
        "total_fixed": total_fixed,
    })
}

/// Admin: rebuild tickets and entry counts for a raffle from its verified tasks
/// The JSON report is written to admin_report
#[reducer]
pub fn repair_raffle_tickets(ctx: &ReducerContext, raffle_id: u64) -> Result<(), String> {
    reconcile_raffle(ctx, raffle_id).map_err(|e| reject("REPAIR", "repair_raffle_tickets", e))
}

fn reconcile_raffle(ctx: &ReducerContext, raffle_id: u64) -> Result<(), RaffleError> {
    require_admin(ctx)?;
    find_raffle(ctx, raffle_id)?;

    let tasks: Vec<RaffleTask> = ctx.db.raffle_task().raffle_id().filter(&raffle_id).collect();
    let tickets: Vec<RaffleTicket> = ctx.db.raffle_ticket().raffle_id().filter(&raffle_id).collect();
    let plans = plan_reconciliation(&tasks, &tickets);

    let metadata = json!({
        "repair": true,
        "repaired_at": format_rfc3339(ctx.timestamp),
    })
    .to_string();

    for plan in &plans {
        for ticket_id in &plan.delete_ticket_ids {
            ctx.db.raffle_ticket().id().delete(ticket_id);
        }
        for task_id in &plan.create_for_tasks {
            ctx.db.raffle_ticket().insert(RaffleTicket {
                id: 0, // auto_inc
                raffle_id,
                user_id: plan.user_id,
                ticket_source: TicketSource::Repair,
                task_id: Some(*task_id),
                metadata: metadata.clone(),
                created_at: ctx.timestamp,
            });
        }

        // Unconditional: heals a stale cache even when tickets were already right
        set_entry_count(ctx, raffle_id, plan.user_id, plan.expected);

        if plan.is_mismatch() {
            log::info!(
                "[REPAIR] raffle:{} user:{} tickets:{}→{} deleted:{} created:{}",
                raffle_id,
                short_id(&plan.user_id),
                plan.actual,
                plan.expected,
                plan.delete_ticket_ids.len(),
                plan.create_for_tasks.len()
            );
        }
    }

    let report = repair_report(&plans);
    let total_fixed = report["total_fixed"].as_u64().unwrap_or(0);

    ctx.db.admin_report().insert(AdminReport {
        id: 0, // auto_inc
        raffle_id,
        kind: ReportKind::Repair,
        created_at: ctx.timestamp,
        body: report.to_string(),
    });

    log::info!(
        "[REPAIR] complete raffle:{} users:{} fixed:{} by:{}",
        raffle_id,
        plans.len(),
        total_fixed,
        short_id(&ctx.sender)
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use spacetimedb::Timestamp;

    fn user(n: u8) -> Identity {
        Identity::from_byte_array([n; 32])
    }

    fn task(id: u64, user_id: Identity, status: TaskStatus) -> RaffleTask {
        RaffleTask {
            id,
            raffle_id: 1,
            user_id,
            task_type: format!("task_{}", id),
            verification_status: status,
            username: None,
            submitted_at: Timestamp::from_micros_since_unix_epoch(0),
            verified_at: None,
        }
    }

    fn ticket(id: u64, user_id: Identity, task_id: Option<u64>, created_micros: i64) -> RaffleTicket {
        RaffleTicket {
            id,
            raffle_id: 1,
            user_id,
            ticket_source: TicketSource::Task,
            task_id,
            metadata: "{}".to_string(),
            created_at: Timestamp::from_micros_since_unix_epoch(created_micros),
        }
    }

    /// Apply a plan to in-memory rows the way the reducer applies it to tables
    fn apply(plans: &[UserRepair], tickets: &mut Vec<RaffleTicket>) {
        let mut next_id = tickets.iter().map(|t| t.id).max().unwrap_or(0) + 1;
        for plan in plans {
            tickets.retain(|t| !plan.delete_ticket_ids.contains(&t.id));
            for task_id in &plan.create_for_tasks {
                tickets.push(ticket(next_id, plan.user_id, Some(*task_id), 9_000));
                next_id += 1;
            }
        }
    }

    #[test]
    fn test_surplus_deletes_newest_tickets() {
        let (alice, bob) = (user(1), user(2));
        let tasks = vec![
            task(10, alice, TaskStatus::Verified),
            task(11, alice, TaskStatus::Verified),
            task(12, bob, TaskStatus::Verified),
        ];
        let mut tickets: Vec<RaffleTicket> = (0..6)
            .map(|i| ticket(100 + i, alice, Some(10 + i % 2), 1_000 * i as i64))
            .collect();
        tickets.push(ticket(200, bob, Some(12), 0));
        tickets.push(ticket(201, bob, Some(12), 0));

        let plans = plan_reconciliation(&tasks, &tickets);
        assert_eq!(plans.len(), 2);

        let alice_plan = plans.iter().find(|p| p.user_id == alice).unwrap();
        assert_eq!(alice_plan.expected, 4);
        assert_eq!(alice_plan.actual, 6);
        assert_eq!(alice_plan.delete_ticket_ids, vec![105, 104]);
        assert!(alice_plan.create_for_tasks.is_empty());

        let bob_plan = plans.iter().find(|p| p.user_id == bob).unwrap();
        assert!(!bob_plan.is_mismatch());

        let report = repair_report(&plans);
        assert_eq!(report["total_fixed"], 1);
        assert_eq!(report["repairs"][0]["deleted"], 2);
        assert_eq!(report["repairs"][0]["old_tickets"], 6);
        assert_eq!(report["repairs"][0]["new_tickets"], 4);
        assert!(report["repairs"][0].get("created").is_none());
    }

    #[test]
    fn test_deficit_creates_repair_tickets() {
        let alice = user(1);
        let tasks = vec![task(10, alice, TaskStatus::Verified)];

        let plans = plan_reconciliation(&tasks, &[]);
        assert_eq!(plans.len(), 1);
        assert_eq!(plans[0].expected, 2);
        assert_eq!(plans[0].actual, 0);
        assert_eq!(plans[0].create_for_tasks, vec![10, 10]);

        let report = repair_report(&plans);
        assert_eq!(report["success"], true);
        assert_eq!(report["total_fixed"], 1);
        assert_eq!(report["repairs"][0]["created"], 2);
        assert_eq!(report["repairs"][0]["user_id"], alice.to_string());
    }

    #[test]
    fn test_surplus_tie_broken_by_id() {
        let alice = user(1);
        let tasks = vec![task(10, alice, TaskStatus::Verified)];
        let tickets = vec![
            ticket(1, alice, Some(10), 500),
            ticket(2, alice, Some(10), 500),
            ticket(3, alice, Some(10), 500),
        ];

        let plans = plan_reconciliation(&tasks, &tickets);
        assert_eq!(plans[0].delete_ticket_ids, vec![3]);
    }

    #[test]
    fn test_untagged_tickets_cap_top_up() {
        let alice = user(1);
        let tasks = vec![
            task(10, alice, TaskStatus::Verified),
            task(11, alice, TaskStatus::Verified),
        ];
        // One legacy ticket with no task plus one for task 10
        let tickets = vec![ticket(1, alice, None, 0), ticket(2, alice, Some(10), 0)];

        let plans = plan_reconciliation(&tasks, &tickets);
        assert_eq!(plans[0].expected, 4);
        assert_eq!(plans[0].actual, 2);
        assert_eq!(plans[0].create_for_tasks, vec![10, 11]);
    }

    #[test]
    fn test_unverified_users_untouched() {
        let (alice, carol) = (user(1), user(3));
        let tasks = vec![
            task(10, alice, TaskStatus::Verified),
            task(11, alice, TaskStatus::Pending),
            task(12, carol, TaskStatus::Rejected),
        ];
        let tickets = vec![
            ticket(1, alice, Some(10), 0),
            ticket(2, alice, Some(10), 0),
            ticket(3, carol, Some(12), 0),
            ticket(4, carol, Some(12), 0),
            ticket(5, carol, Some(12), 0),
        ];

        let plans = plan_reconciliation(&tasks, &tickets);
        assert_eq!(plans.len(), 1);
        assert_eq!(plans[0].user_id, alice);
        assert_eq!(plans[0].expected, 2);
        assert!(!plans[0].is_mismatch());
    }

    #[test]
    fn test_reconciliation_is_idempotent() {
        let (alice, bob) = (user(1), user(2));
        let tasks = vec![
            task(10, alice, TaskStatus::Verified),
            task(11, alice, TaskStatus::Verified),
            task(12, bob, TaskStatus::Verified),
        ];
        let mut tickets = vec![
            ticket(1, alice, Some(10), 0),
            ticket(2, bob, Some(12), 0),
            ticket(3, bob, Some(12), 10),
            ticket(4, bob, Some(12), 20),
            ticket(5, bob, None, 30),
        ];

        let first = plan_reconciliation(&tasks, &tickets);
        assert_eq!(repair_report(&first)["total_fixed"], 2);
        apply(&first, &mut tickets);

        for plan in &first {
            let count = tickets.iter().filter(|t| t.user_id == plan.user_id).count() as u32;
            assert_eq!(count, plan.expected);
        }

        let second = plan_reconciliation(&tasks, &tickets);
        assert!(second.iter().all(|p| !p.is_mismatch()));
        assert!(second.iter().all(|p| p.delete_ticket_ids.is_empty() && p.create_for_tasks.is_empty()));

        let report = repair_report(&second);
        assert_eq!(report["total_fixed"], 0);
        assert_eq!(report["repairs"].as_array().unwrap().len(), 0);
    }
}
