use std::str::FromStr;

use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use time::OffsetDateTime;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, sqlx::Type)]
#[sqlx(type_name = "registration_status", rename_all = "UPPERCASE")]
#[serde(rename_all = "UPPERCASE")]
pub enum RegistrationStatus {
    Pending,
    Confirmed,
    Cancelled,
}

impl FromStr for RegistrationStatus {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(Self::Pending),
            "CONFIRMED" => Ok(Self::Confirmed),
            "CANCELLED" => Ok(Self::Cancelled),
            _ => Err(()),
        }
    }
}

/// Course as seen by the registration flow.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
#[serde(rename_all = "camelCase")]
pub struct Course {
    pub id: Uuid,
    pub title: String,
    pub description: String,
    pub max_participants: Option<i32>,
    pub registered_count: i32,
    pub join_link: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub start_date: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub end_date: OffsetDateTime,
    pub session_time: Option<String>, // "HH:MM"
    pub session_duration: Option<i32>, // minutes
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

impl Course {
    pub fn is_full(&self) -> bool {
        self.max_participants
            .is_some_and(|max| self.registered_count >= max)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
#[serde(rename_all = "camelCase")]
pub struct Registration {
    pub id: Uuid,
    pub user_id: Uuid,
    pub course_id: Uuid,
    #[serde(with = "time::serde::rfc3339")]
    pub registration_date: OffsetDateTime,
    pub status: RegistrationStatus,
}

/// Registrant fields exposed alongside a registration.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Registrant {
    pub id: Uuid,
    pub name: String,
    pub email: String,
    pub phone: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct CourseSummary {
    pub id: Uuid,
    pub title: String,
}
