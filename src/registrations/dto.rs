use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::registrations::repo_types::{Course, CourseSummary, Registrant, Registration};

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterRequest {
    pub course_id: Uuid,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct UpdateStatusRequest {
    pub status: String,
}

/// Registrant projection returned with a new registration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisteredUser {
    pub id: Uuid,
    pub name: String,
    pub email: String,
}

/// Body of a successful `POST /registrations`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistrationDetails {
    #[serde(flatten)]
    pub registration: Registration,
    pub user: RegisteredUser,
    pub course: Course,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MyRegistration {
    #[serde(flatten)]
    pub registration: Registration,
    pub course: Course,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdminRegistration {
    #[serde(flatten)]
    pub registration: Registration,
    pub user: Registrant,
    pub course: CourseSummary,
}
