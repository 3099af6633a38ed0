// Weighted winner draw

use serde_json::{json, Value};
use spacetimedb::{reducer, rand::Rng, Identity, ReducerContext, Table};

use crate::error::{reject, RaffleError};
use crate::{
    admin_report, display_name, find_raffle, notify, raffle, raffle_entry, require_admin,
    short_id, AdminReport, Raffle, RaffleEntry, ReportKind,
};

/// Sum of entry counts
pub fn total_weight(entries: &[RaffleEntry]) -> u64 {
    entries.iter().map(|e| e.entry_count as u64).sum()
}

/// Cumulative-weight selection
/// `roll` must lie in `[0, total_weight)`; each entry owns `entry_count`
/// consecutive roll values in iteration order. Returns None when out of range.
pub fn pick_weighted(entries: &[RaffleEntry], roll: u64) -> Option<&RaffleEntry> {
    let mut cumulative = 0u64;
    entries.iter().find(|e| {
        cumulative += e.entry_count as u64;
        roll < cumulative
    })
}

/// Draw preconditions: no winner yet and at least one ticket
/// Returns the total weight to roll against
pub fn check_drawable(raffle: &Raffle, entries: &[RaffleEntry]) -> Result<u64, RaffleError> {
    if raffle.winner_user_id.is_some() {
        return Err(RaffleError::WinnerAlreadySelected(raffle.id));
    }
    match total_weight(entries) {
        0 => Err(RaffleError::NoEntries(raffle.id)),
        total => Ok(total),
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct DrawOutcome {
    pub winner_id: Identity,
    pub winner_name: String,
    pub winner_tickets: u32,
    pub total_tickets: u64,
    pub total_participants: usize,
}

impl DrawOutcome {
    /// Response body: {success, winner_id, winner_name, total_participants}
    pub fn to_json(&self) -> Value {
        json!({
            "success": true,
            "winner_id": self.winner_id.to_string(),
            "winner_name": self.winner_name,
            "total_participants": self.total_participants,
        })
    }
}

/// Admin: draw the winner of a raffle, weighted by entry count
/// Concludes the raffle and queues winner/entrant emails
#[reducer]
pub fn select_raffle_winner(ctx: &ReducerContext, raffle_id: u64) -> Result<(), String> {
    draw_winner(ctx, raffle_id)
        .map(|_| ())
        .map_err(|e| reject("DRAW", "select_raffle_winner", e))
}

fn draw_winner(ctx: &ReducerContext, raffle_id: u64) -> Result<DrawOutcome, RaffleError> {
    require_admin(ctx)?;

    let mut raffle = find_raffle(ctx, raffle_id)?;
    let entries: Vec<RaffleEntry> = ctx.db.raffle_entry()
        .raffle_id()
        .filter(&raffle_id)
        .filter(|e| e.entry_count > 0)
        .collect();
    let total_tickets = check_drawable(&raffle, &entries)?;

    let roll = {
        let mut rng = ctx.rng();
        rng.gen_range(0..total_tickets)
    };
    let winner = pick_weighted(&entries, roll)
        .ok_or(RaffleError::NoEntries(raffle_id))?
        .clone();

    raffle.winner_user_id = Some(winner.user_id);
    raffle.winner_selected_at = Some(ctx.timestamp);
    raffle.is_active = false;
    ctx.db.raffle().id().update(raffle.clone());

    let outcome = DrawOutcome {
        winner_id: winner.user_id,
        winner_name: display_name(ctx, &winner.user_id),
        winner_tickets: winner.entry_count,
        total_tickets,
        total_participants: entries.len(),
    };

    ctx.db.admin_report().insert(AdminReport {
        id: 0, // auto_inc
        raffle_id,
        kind: ReportKind::Draw,
        created_at: ctx.timestamp,
        body: outcome.to_json().to_string(),
    });

    log::info!(
        "[DRAW] winner raffle:{} user:{} name:\"{}\" tickets:{}/{} participants:{} by:{}",
        raffle_id,
        short_id(&outcome.winner_id),
        outcome.winner_name,
        outcome.winner_tickets,
        outcome.total_tickets,
        outcome.total_participants,
        short_id(&ctx.sender)
    );

    // Queued, not sent: delivery failures never undo the draw
    notify::queue_draw_notifications(ctx, &raffle, &outcome.winner_name, &entries);

    Ok(outcome)
}

#[cfg(test)]
mod tests {
    use super::*;
    use spacetimedb::Timestamp;

    fn entry(n: u8, entry_count: u32) -> RaffleEntry {
        RaffleEntry {
            id: n as u64,
            raffle_id: 1,
            user_id: Identity::from_byte_array([n; 32]),
            entry_count,
            updated_at: Timestamp::from_micros_since_unix_epoch(0),
        }
    }

    fn sample_raffle(winner: Option<Identity>) -> Raffle {
        Raffle {
            id: 1,
            title: "Genesis".to_string(),
            prize: "Hardware wallet".to_string(),
            prize_amount: None,
            winner_user_id: winner,
            winner_selected_at: winner.map(|_| Timestamp::from_micros_since_unix_epoch(0)),
            is_active: winner.is_none(),
            created_at: Timestamp::from_micros_since_unix_epoch(0),
        }
    }

    #[test]
    fn test_drawn_raffle_cannot_be_drawn_again() {
        let concluded = sample_raffle(Some(Identity::from_byte_array([1; 32])));
        assert_eq!(
            check_drawable(&concluded, &[entry(1, 2), entry(2, 3)]),
            Err(RaffleError::WinnerAlreadySelected(1))
        );
    }

    #[test]
    fn test_draw_without_tickets_fails() {
        let open = sample_raffle(None);
        assert_eq!(check_drawable(&open, &[]), Err(RaffleError::NoEntries(1)));
        assert_eq!(check_drawable(&open, &[entry(1, 0), entry(2, 0)]), Err(RaffleError::NoEntries(1)));
    }

    #[test]
    fn test_drawable_raffle_returns_total_weight() {
        let open = sample_raffle(None);
        assert_eq!(check_drawable(&open, &[entry(1, 1), entry(2, 3)]), Ok(4));

        // A closed raffle without a winner is still drawable
        let mut closed = sample_raffle(None);
        closed.is_active = false;
        assert_eq!(check_drawable(&closed, &[entry(1, 2)]), Ok(2));
    }

    #[test]
    fn test_total_weight() {
        assert_eq!(total_weight(&[]), 0);
        assert_eq!(total_weight(&[entry(1, 1), entry(2, 3), entry(3, 0)]), 4);
    }

    #[test]
    fn test_pick_weighted_boundaries() {
        let entries = vec![entry(1, 2), entry(2, 3)];
        assert_eq!(pick_weighted(&entries, 0).unwrap().id, 1);
        assert_eq!(pick_weighted(&entries, 1).unwrap().id, 1);
        assert_eq!(pick_weighted(&entries, 2).unwrap().id, 2);
        assert_eq!(pick_weighted(&entries, 4).unwrap().id, 2);
        assert!(pick_weighted(&entries, 5).is_none());
        assert!(pick_weighted(&[], 0).is_none());
    }

    #[test]
    fn test_zero_weight_never_selected() {
        let entries = vec![entry(1, 0), entry(2, 2), entry(3, 0)];
        for roll in 0..total_weight(&entries) {
            assert_eq!(pick_weighted(&entries, roll).unwrap().id, 2);
        }
    }

    #[test]
    fn test_selection_proportional_to_tickets() {
        // A=1 ticket, B=3 tickets: over every roll value B wins exactly 3× as often
        let entries = vec![entry(1, 1), entry(2, 3)];
        let total = total_weight(&entries);
        let trials = 4_000u64;

        let mut wins = [0u64; 2];
        for i in 0..trials {
            let roll = i % total;
            let winner = pick_weighted(&entries, roll).unwrap();
            wins[(winner.id - 1) as usize] += 1;
        }

        assert_eq!(wins[0] + wins[1], trials);
        assert_eq!(wins[1], 3 * wins[0]);
    }

    #[test]
    fn test_outcome_json() {
        let outcome = DrawOutcome {
            winner_id: Identity::from_byte_array([7; 32]),
            winner_name: "vitalik".to_string(),
            winner_tickets: 4,
            total_tickets: 10,
            total_participants: 3,
        };
        let body = outcome.to_json();
        assert_eq!(body["success"], true);
        assert_eq!(body["winner_name"], "vitalik");
        assert_eq!(body["total_participants"], 3);
        assert_eq!(body["winner_id"], Identity::from_byte_array([7; 32]).to_string());
    }
}
