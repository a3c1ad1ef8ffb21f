use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::participant::{Participant, ParticipantId};

/// Lifecycle of an exchange.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    /// Participants may join; the admin has not drawn yet.
    #[default]
    Registration,
    /// Assignments exist. Registration is closed until a reset.
    Drawn,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Registration => "registration",
            Phase::Drawn => "drawn",
        }
    }
}

impl std::str::FromStr for Phase {
    type Err = &'static str;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.to_ascii_lowercase().as_str() {
            "registration" => Ok(Self::Registration),
            "drawn" => Ok(Self::Drawn),
            _ => Err("valid values: registration, drawn"),
        }
    }
}

/// One giver/receiver pair produced by a draw.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Assignment {
    pub giver_id: ParticipantId,
    pub giver_name: String,
    pub giver_email: String,
    pub receiver_id: ParticipantId,
    pub receiver_name: String,
    pub receiver_email: String,
}

impl Assignment {
    pub fn between(giver: &Participant, receiver: &Participant) -> Self {
        Self {
            giver_id: giver.id,
            giver_name: giver.full_name(),
            giver_email: giver.email.clone(),
            receiver_id: receiver.id,
            receiver_name: receiver.full_name(),
            receiver_email: receiver.email.clone(),
        }
    }
}

/// The single document describing an exchange.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DrawerRecord {
    pub participants: Vec<Participant>,
    pub phase: Phase,
    pub deadline: Option<DateTime<Utc>>,
    pub assignments: Vec<Assignment>,
    pub updated_at: DateTime<Utc>,
}

impl DrawerRecord {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            participants: Vec::new(),
            phase: Phase::Registration,
            deadline: None,
            assignments: Vec::new(),
            updated_at: now,
        }
    }
}

/// Time left until the deadline, split the way it is displayed.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Countdown {
    pub days: u64,
    pub hours: u64,
    pub minutes: u64,
    pub seconds: u64,
}

impl Countdown {
    const MS_PER_SECOND: u64 = 1_000;
    const MS_PER_MINUTE: u64 = 60 * Self::MS_PER_SECOND;
    const MS_PER_HOUR: u64 = 60 * Self::MS_PER_MINUTE;
    const MS_PER_DAY: u64 = 24 * Self::MS_PER_HOUR;

    /// Splits a remaining duration in milliseconds. Sub-second remainders are dropped.
    pub fn from_millis(distance_ms: u64) -> Self {
        Self {
            days: distance_ms / Self::MS_PER_DAY,
            hours: (distance_ms % Self::MS_PER_DAY) / Self::MS_PER_HOUR,
            minutes: (distance_ms % Self::MS_PER_HOUR) / Self::MS_PER_MINUTE,
            seconds: (distance_ms % Self::MS_PER_MINUTE) / Self::MS_PER_SECOND,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn countdown_splits_components() {
        let ms = 2 * 86_400_000 + 3 * 3_600_000 + 4 * 60_000 + 5_000 + 999;
        let countdown = Countdown::from_millis(ms);
        assert_eq!(
            countdown,
            Countdown {
                days: 2,
                hours: 3,
                minutes: 4,
                seconds: 5
            }
        );
    }

    #[test]
    fn phase_serializes_snake_case() {
        assert_eq!(serde_json::to_string(&Phase::Drawn).unwrap(), "\"drawn\"");
        assert_eq!("Registration".parse::<Phase>().unwrap(), Phase::Registration);
        assert!("finished".parse::<Phase>().is_err());
    }

    #[test]
    fn record_roundtrips_through_json() {
        let now = DateTime::parse_from_rfc3339("2025-12-01T10:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        let mut record = DrawerRecord::new(now);
        record.deadline = Some(now);
        let json = serde_json::to_string(&record).unwrap();
        let decoded: DrawerRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(decoded, record);
    }
}
