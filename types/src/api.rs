//! Request and response bodies shared by the server and the client SDK.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::drawer::{Assignment, Countdown, Phase};
use crate::participant::{Participant, ParticipantId};

/// Minimum number of participants required before a draw.
pub const MIN_PARTICIPANTS: usize = 3;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RegisterRequest {
    pub name: String,
    pub surname: String,
    pub email: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct UpdateEmailRequest {
    pub email: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SetDeadlineRequest {
    pub deadline: DateTime<Utc>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct DrawRequest {
    /// Must be set to overwrite assignments from an earlier draw.
    #[serde(default)]
    pub redraw: bool,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LoginRequest {
    pub password: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LoginResponse {
    pub token: String,
    pub expires_at_ms: u64,
}

/// What anyone may see: first names only, never emails.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublicParticipant {
    pub id: ParticipantId,
    pub name: String,
}

impl From<&Participant> for PublicParticipant {
    fn from(participant: &Participant) -> Self {
        Self {
            id: participant.id,
            name: participant.name.clone(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StatusResponse {
    pub phase: Phase,
    pub participant_count: usize,
    pub deadline: Option<DateTime<Utc>>,
    pub countdown: Option<Countdown>,
    pub draw_ready: bool,
    pub participants: Vec<PublicParticipant>,
}

/// Delivery outcome for a batch of notification emails.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotifyResponse {
    pub sent: usize,
    pub failed: usize,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DrawResponse {
    pub attempts: usize,
    pub assignments: Vec<Assignment>,
    pub notifications: NotifyResponse,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    pub message: String,
}
