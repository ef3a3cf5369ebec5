use std::fmt;

use serde::{Deserialize, Serialize};
use sqlx::{SqlitePool, sqlite::SqlitePoolOptions};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::{ChatError, ChatResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Role {
    Doctor,
    Patient,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        use Role::*;
        match self {
            Doctor => write!(f, "DOCTOR"),
            Patient => write!(f, "PATIENT"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Participant {
    pub id: String,
    pub role: Role,
}

impl Participant {
    pub fn new(id: impl Into<String>, role: Role) -> Self {
        Self { id: id.into(), role }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoleAssignment {
    pub doctor: String,
    pub patient: String,
}

impl RoleAssignment {
    /// Needs one doctor and one patient with distinct ids.
    pub fn from_pair(a: &Participant, b: &Participant) -> ChatResult<Self> {
        if a.id == b.id {
            return Err(ChatError::InvalidParticipants(format!(
                "{} cannot open a room with themselves",
                a.id
            )));
        }

        match (a.role, b.role) {
            (Role::Doctor, Role::Patient) => Ok(Self {
                doctor: a.id.clone(),
                patient: b.id.clone(),
            }),
            (Role::Patient, Role::Doctor) => Ok(Self {
                doctor: b.id.clone(),
                patient: a.id.clone(),
            }),
            (role, _) => Err(ChatError::InvalidParticipants(format!(
                "both participants are {role}"
            ))),
        }
    }
}

/// Order-independent key for a pair of user ids.
pub fn pair_key(a: &str, b: &str) -> String {
    if a <= b {
        format!("{a}|{b}")
    } else {
        format!("{b}|{a}")
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Room {
    pub id: Uuid,
    pub participants: [String; 2],
    pub role_assignment: RoleAssignment,
    pub last_message_text: Option<String>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub last_message_at: Option<OffsetDateTime>,
    #[serde(skip)]
    pub last_message_seq: Option<i64>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

impl Room {
    pub fn new(roles: RoleAssignment) -> Self {
        let mut participants = [roles.doctor.clone(), roles.patient.clone()];
        participants.sort();

        Self {
            id: Uuid::now_v7(),
            participants,
            role_assignment: roles,
            last_message_text: None,
            last_message_at: None,
            last_message_seq: None,
            created_at: OffsetDateTime::now_utc(),
        }
    }

    pub fn pair_key(&self) -> String {
        pair_key(&self.participants[0], &self.participants[1])
    }

    pub fn has_participant(&self, user_id: &str) -> bool {
        self.participants.iter().any(|p| p == user_id)
    }

    pub fn role_of(&self, user_id: &str) -> Option<Role> {
        if self.role_assignment.doctor == user_id {
            Some(Role::Doctor)
        } else if self.role_assignment.patient == user_id {
            Some(Role::Patient)
        } else {
            None
        }
    }

    /// The other participant, if `user_id` is one of the two.
    pub fn counterpart(&self, user_id: &str) -> Option<Participant> {
        match self.role_of(user_id)? {
            Role::Doctor => Some(Participant::new(&self.role_assignment.patient, Role::Patient)),
            Role::Patient => Some(Participant::new(&self.role_assignment.doctor, Role::Doctor)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: Uuid,
    pub room_id: Uuid,
    /// Commit position within the room, starting at 1.
    pub seq: i64,
    pub sender_id: String,
    pub sender_display_name: String,
    pub text: String,
    #[serde(with = "time::serde::rfc3339")]
    pub sent_at: OffsetDateTime,
}

/// What the store needs to append; id, seq and time are assigned on commit.
#[derive(Debug, Clone)]
pub struct NewMessage {
    pub room_id: Uuid,
    pub sender_id: String,
    pub sender_display_name: String,
    pub text: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Counterpart {
    pub id: String,
    pub role: Role,
    pub display_name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomSummary {
    pub room_id: Uuid,
    pub counterpart: Counterpart,
    pub last_message_text: Option<String>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub last_message_at: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

pub fn to_millis(at: OffsetDateTime) -> i64 {
    (at.unix_timestamp_nanos() / 1_000_000) as i64
}

pub fn from_millis(ms: i64) -> ChatResult<OffsetDateTime> {
    Ok(OffsetDateTime::from_unix_timestamp_nanos(ms as i128 * 1_000_000)?)
}

pub async fn connect(database_url: &str, max_connections: u32) -> anyhow::Result<SqlitePool> {
    let mut options = SqlitePoolOptions::new().max_connections(max_connections);

    // every in-memory connection is its own database, so keep exactly one alive
    if database_url.contains(":memory:") {
        options = options
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None);
    }

    let db_pool = options.connect(database_url).await?;

    migrate(&db_pool).await?;
    Ok(db_pool)
}

pub async fn migrate(db_pool: &SqlitePool) -> anyhow::Result<()> {
    sqlx::migrate!("./migrations").run(db_pool).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pair_key_ignores_order() {
        assert_eq!(pair_key("d1", "p1"), pair_key("p1", "d1"));
        assert_ne!(pair_key("d1", "p1"), pair_key("d1", "p2"));
    }

    #[test]
    fn role_assignment_needs_one_of_each() {
        let d = Participant::new("d1", Role::Doctor);
        let p = Participant::new("p1", Role::Patient);

        let roles = RoleAssignment::from_pair(&p, &d).unwrap();
        assert_eq!(roles.doctor, "d1");
        assert_eq!(roles.patient, "p1");

        let d2 = Participant::new("d2", Role::Doctor);
        assert!(matches!(
            RoleAssignment::from_pair(&d, &d2),
            Err(ChatError::InvalidParticipants(_))
        ));

        let same = Participant::new("d1", Role::Patient);
        assert!(matches!(
            RoleAssignment::from_pair(&d, &same),
            Err(ChatError::InvalidParticipants(_))
        ));
    }

    #[test]
    fn counterpart_is_the_other_side() {
        let room = Room::new(RoleAssignment {
            doctor: "d1".to_owned(),
            patient: "p1".to_owned(),
        });

        assert_eq!(room.counterpart("d1"), Some(Participant::new("p1", Role::Patient)));
        assert_eq!(room.counterpart("p1"), Some(Participant::new("d1", Role::Doctor)));
        assert_eq!(room.counterpart("x"), None);
    }

    #[test]
    fn millis_survive_the_trip() {
        let ms = 1_760_000_000_123;
        assert_eq!(to_millis(from_millis(ms).unwrap()), ms);
    }

    #[test]
    fn role_serializes_upper_case() {
        assert_eq!(serde_json::to_string(&Role::Patient).unwrap(), "\"PATIENT\"");
    }
}
