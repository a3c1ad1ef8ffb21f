//! Shared domain and wire types for the MIAM drawer.

pub mod api;
pub mod drawer;
pub mod participant;

pub use api::MIN_PARTICIPANTS;
pub use drawer::{Assignment, Countdown, DrawerRecord, Phase};
pub use participant::{
    normalize_email, Field, NewParticipant, Participant, ParticipantId, ValidationError,
};
