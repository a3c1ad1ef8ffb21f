use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Unique participant identifier.
///
/// Allocated by the registry from the registration time in unix milliseconds,
/// so identifiers also order participants by arrival.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ParticipantId(pub u64);

impl fmt::Display for ParticipantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for ParticipantId {
    type Err = std::num::ParseIntError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        value.trim().parse().map(ParticipantId)
    }
}

/// Which registration field failed validation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Field {
    Name,
    Surname,
    Email,
}

impl Field {
    pub fn as_str(&self) -> &'static str {
        match self {
            Field::Name => "name",
            Field::Surname => "surname",
            Field::Email => "email",
        }
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("all fields are required (missing {})", .0.as_str())]
    EmptyField(Field),
    #[error("please enter a valid email")]
    InvalidEmail,
}

/// A registered participant.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Participant {
    pub id: ParticipantId,
    pub name: String,
    pub surname: String,
    pub email: String,
    #[serde(default)]
    pub registered_at_ms: u64,
}

impl Participant {
    pub fn full_name(&self) -> String {
        format!("{} {}", self.name, self.surname)
    }
}

/// Trimmed, lower-cased email, or an error when it cannot be an address.
///
/// Only the presence of `@` is checked; delivery is the mail provider's problem.
pub fn normalize_email(raw: &str) -> Result<String, ValidationError> {
    let email = raw.trim();
    if email.is_empty() {
        return Err(ValidationError::EmptyField(Field::Email));
    }
    if !email.contains('@') {
        return Err(ValidationError::InvalidEmail);
    }
    Ok(email.to_lowercase())
}

/// Registration input after trimming, before an id is assigned.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NewParticipant {
    pub name: String,
    pub surname: String,
    pub email: String,
}

impl NewParticipant {
    /// Validates raw form input.
    ///
    /// Emptiness of every field is checked before the email shape, matching the
    /// order users see errors in.
    pub fn parse(name: &str, surname: &str, email: &str) -> Result<Self, ValidationError> {
        let name = name.trim();
        let surname = surname.trim();
        if name.is_empty() {
            return Err(ValidationError::EmptyField(Field::Name));
        }
        if surname.is_empty() {
            return Err(ValidationError::EmptyField(Field::Surname));
        }
        let email = normalize_email(email)?;
        Ok(Self {
            name: name.to_string(),
            surname: surname.to_string(),
            email,
        })
    }

    pub fn into_participant(self, id: ParticipantId, registered_at_ms: u64) -> Participant {
        Participant {
            id,
            name: self.name,
            surname: self.surname,
            email: self.email,
            registered_at_ms,
        }
    }
}
