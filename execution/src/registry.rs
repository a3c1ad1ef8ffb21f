//! Exchange registry state machine.
//!
//! Wraps a [`DrawerRecord`] and owns every rule about how it may change. The
//! registry performs no I/O: callers pass the current time and a random source,
//! then persist [`Registry::record`] after a successful mutation.
//!
//! Failed operations leave the record exactly as it was.

use chrono::{DateTime, Utc};
use miam_types::{
    normalize_email, Countdown, DrawerRecord, NewParticipant, Participant, ParticipantId, Phase,
    ValidationError, MIN_PARTICIPANTS,
};
use rand::Rng;
use thiserror::Error;

use crate::deadline;
use crate::draw::{self, Draw, DrawError};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RegistryError {
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error("this email is already registered")]
    DuplicateEmail,
    #[error("registration is closed: the draw has been performed")]
    RegistrationClosed,
    #[error("participant {0} not found")]
    UnknownParticipant(ParticipantId),
    #[error("participants cannot be removed after the draw; reset first")]
    RemovalAfterDraw,
    #[error("draw has already been performed; request a redraw to overwrite it")]
    AlreadyDrawn,
    #[error(transparent)]
    Draw(#[from] DrawError),
}

#[derive(Clone, Debug)]
pub struct Registry {
    record: DrawerRecord,
}

impl Registry {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            record: DrawerRecord::new(now),
        }
    }

    pub fn from_record(record: DrawerRecord) -> Self {
        Self { record }
    }

    pub fn record(&self) -> &DrawerRecord {
        &self.record
    }

    pub fn into_record(self) -> DrawerRecord {
        self.record
    }

    pub fn phase(&self) -> Phase {
        self.record.phase
    }

    pub fn participants(&self) -> &[Participant] {
        &self.record.participants
    }

    pub fn draw_ready(&self) -> bool {
        self.record.participants.len() >= MIN_PARTICIPANTS
    }

    pub fn countdown(&self, now: DateTime<Utc>) -> Option<Countdown> {
        deadline::countdown(self.record.deadline, now)
    }

    /// Adds a participant. The id is the registration time in milliseconds,
    /// bumped past the newest existing id so ids stay unique and increasing.
    pub fn register(
        &mut self,
        input: NewParticipant,
        now: DateTime<Utc>,
    ) -> Result<&Participant, RegistryError> {
        if self.record.phase == Phase::Drawn {
            return Err(RegistryError::RegistrationClosed);
        }
        if self.email_taken(&input.email, None) {
            return Err(RegistryError::DuplicateEmail);
        }

        let registered_at_ms = deadline::unix_ms(now);
        let id = match self.record.participants.iter().map(|p| p.id.0).max() {
            Some(last) if last >= registered_at_ms => last.saturating_add(1),
            _ => registered_at_ms,
        };
        self.record
            .participants
            .push(input.into_participant(ParticipantId(id), registered_at_ms));
        self.touch(now);
        let index = self.record.participants.len() - 1;
        Ok(&self.record.participants[index])
    }

    /// Removes a participant during registration.
    pub fn remove(&mut self, id: ParticipantId, now: DateTime<Utc>) -> Result<Participant, RegistryError> {
        if self.record.phase == Phase::Drawn {
            return Err(RegistryError::RemovalAfterDraw);
        }
        let index = self
            .record
            .participants
            .iter()
            .position(|p| p.id == id)
            .ok_or(RegistryError::UnknownParticipant(id))?;
        let removed = self.record.participants.remove(index);
        self.touch(now);
        Ok(removed)
    }

    /// Changes a participant's email. After a draw the assignments that mention
    /// the participant are updated as well, so notifications reach the new address.
    pub fn update_email(
        &mut self,
        id: ParticipantId,
        raw_email: &str,
        now: DateTime<Utc>,
    ) -> Result<&Participant, RegistryError> {
        let email = normalize_email(raw_email)?;
        let index = self
            .record
            .participants
            .iter()
            .position(|p| p.id == id)
            .ok_or(RegistryError::UnknownParticipant(id))?;
        if self.email_taken(&email, Some(id)) {
            return Err(RegistryError::DuplicateEmail);
        }

        for assignment in &mut self.record.assignments {
            if assignment.giver_id == id {
                assignment.giver_email = email.clone();
            }
            if assignment.receiver_id == id {
                assignment.receiver_email = email.clone();
            }
        }
        self.record.participants[index].email = email;
        self.touch(now);
        Ok(&self.record.participants[index])
    }

    pub fn set_deadline(&mut self, deadline: DateTime<Utc>, now: DateTime<Utc>) {
        self.record.deadline = Some(deadline);
        self.touch(now);
    }

    /// Clears the deadline. Returns whether one was set.
    pub fn clear_deadline(&mut self, now: DateTime<Utc>) -> bool {
        let had_deadline = self.record.deadline.take().is_some();
        self.touch(now);
        had_deadline
    }

    /// Drops participants and assignments and reopens registration. The
    /// deadline is kept.
    pub fn reset(&mut self, now: DateTime<Utc>) {
        self.record.participants.clear();
        self.record.assignments.clear();
        self.record.phase = Phase::Registration;
        self.touch(now);
    }

    /// Runs the draw over the current participants and stores the result.
    ///
    /// In the drawn phase `redraw` must be set; the new assignments then
    /// replace the old ones.
    pub fn perform_draw<R: Rng + ?Sized>(
        &mut self,
        rng: &mut R,
        redraw: bool,
        now: DateTime<Utc>,
    ) -> Result<Draw, RegistryError> {
        self.perform_draw_with_attempts(rng, redraw, now, draw::MAX_DRAW_ATTEMPTS)
    }

    /// [`Registry::perform_draw`] with an explicit shuffle budget.
    pub fn perform_draw_with_attempts<R: Rng + ?Sized>(
        &mut self,
        rng: &mut R,
        redraw: bool,
        now: DateTime<Utc>,
        max_attempts: usize,
    ) -> Result<Draw, RegistryError> {
        if self.record.phase == Phase::Drawn && !redraw {
            return Err(RegistryError::AlreadyDrawn);
        }
        let result = draw::draw_with_attempts(&self.record.participants, rng, max_attempts)?;
        self.record.assignments = result.assignments.clone();
        self.record.phase = Phase::Drawn;
        self.touch(now);
        Ok(result)
    }

    fn email_taken(&self, email: &str, except: Option<ParticipantId>) -> bool {
        self.record
            .participants
            .iter()
            .filter(|p| Some(p.id) != except)
            .any(|p| p.email.eq_ignore_ascii_case(email))
    }

    fn touch(&mut self, now: DateTime<Utc>) {
        self.record.updated_at = now;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::draw::verify_assignments;
    use crate::mocks::{create_new_participant, BASE_REGISTERED_AT_MS};
    use chrono::{Duration, TimeZone};
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn now() -> DateTime<Utc> {
        Utc.timestamp_millis_opt(BASE_REGISTERED_AT_MS as i64).unwrap()
    }

    fn registry_with(count: usize) -> Registry {
        let mut registry = Registry::new(now());
        for index in 0..count {
            registry
                .register(create_new_participant(index), now())
                .unwrap();
        }
        registry
    }

    #[test]
    fn test_register_assigns_increasing_ids() {
        let registry = registry_with(3);
        let ids: Vec<u64> = registry.participants().iter().map(|p| p.id.0).collect();
        assert_eq!(
            ids,
            vec![
                BASE_REGISTERED_AT_MS,
                BASE_REGISTERED_AT_MS + 1,
                BASE_REGISTERED_AT_MS + 2
            ]
        );
        assert!(registry
            .participants()
            .iter()
            .all(|p| p.registered_at_ms == BASE_REGISTERED_AT_MS));
    }

    #[test]
    fn test_register_rejects_duplicate_email_case_insensitive() {
        let mut registry = registry_with(1);
        let mut dup = create_new_participant(5);
        dup.email = "ELF0@workshop.test".to_string();
        assert_eq!(
            registry.register(dup, now()).unwrap_err(),
            RegistryError::DuplicateEmail
        );
        assert_eq!(registry.participants().len(), 1);
    }

    #[test]
    fn test_register_stays_open_after_deadline() {
        let mut registry = registry_with(0);
        registry.set_deadline(now() - Duration::hours(1), now());
        assert!(registry.register(create_new_participant(0), now()).is_ok());
        assert_eq!(registry.countdown(now()), None);
    }

    #[test]
    fn test_register_closed_after_draw() {
        let mut registry = registry_with(3);
        registry
            .perform_draw(&mut StdRng::seed_from_u64(1), false, now())
            .unwrap();
        assert_eq!(
            registry
                .register(create_new_participant(9), now())
                .unwrap_err(),
            RegistryError::RegistrationClosed
        );
    }

    #[test]
    fn test_remove_participant() {
        let mut registry = registry_with(3);
        let id = registry.participants()[1].id;
        let removed = registry.remove(id, now()).unwrap();
        assert_eq!(removed.id, id);
        assert_eq!(registry.participants().len(), 2);
        assert_eq!(
            registry.remove(id, now()).unwrap_err(),
            RegistryError::UnknownParticipant(id)
        );
    }

    #[test]
    fn test_remove_rejected_after_draw() {
        let mut registry = registry_with(3);
        registry
            .perform_draw(&mut StdRng::seed_from_u64(1), false, now())
            .unwrap();
        let id = registry.participants()[0].id;
        assert_eq!(
            registry.remove(id, now()).unwrap_err(),
            RegistryError::RemovalAfterDraw
        );
    }

    #[test]
    fn test_update_email_rules() {
        let mut registry = registry_with(2);
        let first = registry.participants()[0].id;

        assert_eq!(
            registry.update_email(first, "no-at-sign", now()).unwrap_err(),
            RegistryError::Validation(ValidationError::InvalidEmail)
        );
        assert_eq!(
            registry
                .update_email(first, "Elf1@Workshop.test", now())
                .unwrap_err(),
            RegistryError::DuplicateEmail
        );
        // Re-saving one's own address is fine.
        assert!(registry.update_email(first, "ELF0@workshop.test", now()).is_ok());

        let updated = registry
            .update_email(first, " Rudolph@North.Pole ", now())
            .unwrap();
        assert_eq!(updated.email, "rudolph@north.pole");

        let missing = ParticipantId(1);
        assert_eq!(
            registry.update_email(missing, "a@b", now()).unwrap_err(),
            RegistryError::UnknownParticipant(missing)
        );
    }

    #[test]
    fn test_update_email_rewrites_assignments() {
        let mut registry = registry_with(4);
        registry
            .perform_draw(&mut StdRng::seed_from_u64(5), false, now())
            .unwrap();
        let id = registry.participants()[2].id;
        registry.update_email(id, "new@north.pole", now()).unwrap();

        let assignments = &registry.record().assignments;
        let as_giver = assignments.iter().find(|a| a.giver_id == id).unwrap();
        let as_receiver = assignments.iter().find(|a| a.receiver_id == id).unwrap();
        assert_eq!(as_giver.giver_email, "new@north.pole");
        assert_eq!(as_receiver.receiver_email, "new@north.pole");
    }

    #[test]
    fn test_draw_requires_redraw_flag() {
        let mut registry = registry_with(5);
        let mut rng = StdRng::seed_from_u64(11);
        let first = registry.perform_draw(&mut rng, false, now()).unwrap();
        assert_eq!(registry.phase(), Phase::Drawn);
        verify_assignments(registry.participants(), &registry.record().assignments).unwrap();

        assert_eq!(
            registry.perform_draw(&mut rng, false, now()).unwrap_err(),
            RegistryError::AlreadyDrawn
        );
        assert_eq!(registry.record().assignments, first.assignments);

        let second = registry.perform_draw(&mut rng, true, now()).unwrap();
        assert_eq!(registry.record().assignments, second.assignments);
    }

    #[test]
    fn test_failed_draw_leaves_record_untouched() {
        let mut registry = registry_with(2);
        let before = registry.record().clone();
        let later = now() + Duration::minutes(5);
        let err = registry
            .perform_draw(&mut StdRng::seed_from_u64(1), false, later)
            .unwrap_err();
        assert_eq!(
            err,
            RegistryError::Draw(DrawError::TooFewParticipants {
                got: 2,
                min: MIN_PARTICIPANTS
            })
        );
        assert_eq!(registry.record(), &before);
    }

    #[test]
    fn test_exhausted_draw_budget_leaves_record_untouched() {
        let mut registry = registry_with(4);
        let mut rng = StdRng::seed_from_u64(3);
        let before = registry.record().clone();
        let later = now() + Duration::minutes(1);
        assert_eq!(
            registry
                .perform_draw_with_attempts(&mut rng, false, later, 0)
                .unwrap_err(),
            RegistryError::Draw(DrawError::NoDerangement { attempts: 0 })
        );
        assert_eq!(registry.record(), &before);

        let first = registry.perform_draw(&mut rng, false, now()).unwrap();
        let drawn = registry.record().clone();
        assert_eq!(
            registry
                .perform_draw_with_attempts(&mut rng, true, later, 0)
                .unwrap_err(),
            RegistryError::Draw(DrawError::NoDerangement { attempts: 0 })
        );
        assert_eq!(registry.record(), &drawn);
        assert_eq!(registry.record().assignments, first.assignments);
    }

    #[test]
    fn test_reset_keeps_deadline() {
        let mut registry = registry_with(3);
        let deadline = now() + Duration::days(3);
        registry.set_deadline(deadline, now());
        registry
            .perform_draw(&mut StdRng::seed_from_u64(2), false, now())
            .unwrap();

        let later = now() + Duration::seconds(10);
        registry.reset(later);
        let record = registry.record();
        assert!(record.participants.is_empty());
        assert!(record.assignments.is_empty());
        assert_eq!(record.phase, Phase::Registration);
        assert_eq!(record.deadline, Some(deadline));
        assert_eq!(record.updated_at, later);
    }

    #[test]
    fn test_clear_deadline_reports_previous_state() {
        let mut registry = registry_with(0);
        assert!(!registry.clear_deadline(now()));
        registry.set_deadline(now() + Duration::hours(2), now());
        assert!(registry.countdown(now()).is_some());
        assert!(registry.clear_deadline(now()));
        assert_eq!(registry.countdown(now()), None);
    }
}
