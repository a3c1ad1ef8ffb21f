use miam_types::{NewParticipant, Participant, ParticipantId};

/// Base registration time for generated participants (2025-11-01T00:00:00Z).
pub const BASE_REGISTERED_AT_MS: u64 = 1_761_955_200_000;

/// Creates `count` participants with distinct ids and emails, in registration order.
pub fn create_participants(count: usize) -> Vec<Participant> {
    (0..count).map(create_participant).collect()
}

/// Creates the `index`-th deterministic participant.
pub fn create_participant(index: usize) -> Participant {
    let registered_at_ms = BASE_REGISTERED_AT_MS + index as u64;
    create_new_participant(index).into_participant(ParticipantId(registered_at_ms), registered_at_ms)
}

/// Creates validated registration input for the `index`-th participant.
pub fn create_new_participant(index: usize) -> NewParticipant {
    NewParticipant {
        name: format!("Elf{index}"),
        surname: format!("Helper{index}"),
        email: format!("elf{index}@workshop.test"),
    }
}
