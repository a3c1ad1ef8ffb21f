//! Gift assignment draw.
//!
//! A draw shuffles the participants until the shuffled order is a derangement
//! of the input order (no participant keeps its position), then links the
//! shuffled order into a single ring: each participant gives to the next one,
//! and the last gives to the first.
//!
//! ## Invariants
//! - Every participant is a giver exactly once and a receiver exactly once.
//! - Nobody gives to themselves.
//! - Following giver -> receiver from any participant visits everyone before
//!   returning (one cycle, not several).
//!
//! The search is bounded by [`MAX_DRAW_ATTEMPTS`]. Exhausting it is an error and
//! the caller's state must be left untouched.

use miam_types::{Assignment, Participant, ParticipantId, MIN_PARTICIPANTS};
use rand::seq::SliceRandom;
use rand::Rng;
use std::collections::{HashMap, HashSet};
use thiserror::Error;

/// Upper bound on shuffles tried before giving up.
pub const MAX_DRAW_ATTEMPTS: usize = 100;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DrawError {
    #[error("need at least {min} participants to draw (got {got})")]
    TooFewParticipants { got: usize, min: usize },
    #[error("participant {0} appears more than once")]
    DuplicateParticipant(ParticipantId),
    #[error("could not generate valid assignments after {attempts} attempts")]
    NoDerangement { attempts: usize },
}

/// Reasons a stored set of assignments does not describe a valid draw.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AssignmentError {
    #[error("expected {expected} assignments, found {found}")]
    CountMismatch { expected: usize, found: usize },
    #[error("participant {0} is not registered")]
    UnknownParticipant(ParticipantId),
    #[error("participant {0} gives more than once")]
    DuplicateGiver(ParticipantId),
    #[error("participant {0} receives more than once")]
    DuplicateReceiver(ParticipantId),
    #[error("participant {0} is assigned to themselves")]
    SelfAssignment(ParticipantId),
    #[error("assignments form a cycle of {len} instead of {expected}")]
    NotSingleCycle { len: usize, expected: usize },
}

/// Outcome of a successful draw.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Draw {
    /// Participants in shuffled order. `assignments[i]` has `order[i]` as giver.
    pub order: Vec<ParticipantId>,
    pub assignments: Vec<Assignment>,
    /// Number of shuffles it took, in `1..=MAX_DRAW_ATTEMPTS`.
    pub attempts: usize,
}

impl Draw {
    /// Receiver for `giver`, if they took part.
    pub fn receiver_of(&self, giver: ParticipantId) -> Option<ParticipantId> {
        self.assignments
            .iter()
            .find(|a| a.giver_id == giver)
            .map(|a| a.receiver_id)
    }
}

/// Draws with the default attempt budget.
pub fn draw<R: Rng + ?Sized>(participants: &[Participant], rng: &mut R) -> Result<Draw, DrawError> {
    draw_with_attempts(participants, rng, MAX_DRAW_ATTEMPTS)
}

/// Draws with an explicit attempt budget.
pub fn draw_with_attempts<R: Rng + ?Sized>(
    participants: &[Participant],
    rng: &mut R,
    max_attempts: usize,
) -> Result<Draw, DrawError> {
    if participants.len() < MIN_PARTICIPANTS {
        return Err(DrawError::TooFewParticipants {
            got: participants.len(),
            min: MIN_PARTICIPANTS,
        });
    }
    let mut seen = HashSet::with_capacity(participants.len());
    for participant in participants {
        if !seen.insert(participant.id) {
            return Err(DrawError::DuplicateParticipant(participant.id));
        }
    }

    let mut shuffled: Vec<&Participant> = participants.iter().collect();
    for attempt in 1..=max_attempts {
        shuffled.shuffle(rng);
        if is_derangement(participants, &shuffled) {
            tracing::debug!(attempt, participants = participants.len(), "draw found derangement");
            return Ok(link_ring(&shuffled, attempt));
        }
    }

    Err(DrawError::NoDerangement {
        attempts: max_attempts,
    })
}

fn is_derangement(original: &[Participant], shuffled: &[&Participant]) -> bool {
    original
        .iter()
        .zip(shuffled.iter())
        .all(|(before, after)| before.id != after.id)
}

fn link_ring(order: &[&Participant], attempts: usize) -> Draw {
    let len = order.len();
    let assignments = order
        .iter()
        .enumerate()
        .map(|(index, giver)| Assignment::between(giver, order[(index + 1) % len]))
        .collect();
    Draw {
        order: order.iter().map(|p| p.id).collect(),
        assignments,
        attempts,
    }
}

/// Checks that `assignments` is a complete single-cycle draw over `participants`.
pub fn verify_assignments(
    participants: &[Participant],
    assignments: &[Assignment],
) -> Result<(), AssignmentError> {
    if assignments.len() != participants.len() {
        return Err(AssignmentError::CountMismatch {
            expected: participants.len(),
            found: assignments.len(),
        });
    }
    let registered: HashSet<ParticipantId> = participants.iter().map(|p| p.id).collect();

    let mut next: HashMap<ParticipantId, ParticipantId> = HashMap::with_capacity(assignments.len());
    let mut receivers = HashSet::with_capacity(assignments.len());
    for assignment in assignments {
        for id in [assignment.giver_id, assignment.receiver_id] {
            if !registered.contains(&id) {
                return Err(AssignmentError::UnknownParticipant(id));
            }
        }
        if assignment.giver_id == assignment.receiver_id {
            return Err(AssignmentError::SelfAssignment(assignment.giver_id));
        }
        if next
            .insert(assignment.giver_id, assignment.receiver_id)
            .is_some()
        {
            return Err(AssignmentError::DuplicateGiver(assignment.giver_id));
        }
        if !receivers.insert(assignment.receiver_id) {
            return Err(AssignmentError::DuplicateReceiver(assignment.receiver_id));
        }
    }

    // Givers and receivers are both bijective onto the registered set here, so
    // walking from any start terminates back at it.
    let Some(start) = assignments.first().map(|a| a.giver_id) else {
        return Ok(());
    };
    let mut len = 1;
    let mut current = next[&start];
    while current != start {
        current = next[&current];
        len += 1;
    }
    if len != participants.len() {
        return Err(AssignmentError::NotSingleCycle {
            len,
            expected: participants.len(),
        });
    }
    Ok(())
}
