use std::collections::HashMap;

use anyhow::Context;
use async_trait::async_trait;
use sqlx::{FromRow, PgPool};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::{
    db::is_unique_violation,
    error::{AppError, AppResult},
    registrations::repo_types::{
        Course, CourseSummary, Registrant, Registration, RegistrationStatus,
    },
};

#[async_trait]
pub trait RegistrationRepo: Send + Sync {
    async fn find_course(&self, course_id: Uuid) -> AppResult<Option<Course>>;

    async fn find_registration(
        &self,
        user_id: Uuid,
        course_id: Uuid,
    ) -> AppResult<Option<Registration>>;

    /// Creates a CONFIRMED registration and increments the course counter as one
    /// unit. The increment only applies while the course has room, so
    /// `registered_count` never exceeds `max_participants`.
    ///
    /// Fails with `CourseFull`, `CourseNotFound` or `AlreadyRegistered`; on any
    /// failure neither write is applied.
    async fn enroll(&self, user_id: Uuid, course_id: Uuid) -> AppResult<(Registration, Course)>;

    /// Newest first.
    async fn list_for_user(&self, user_id: Uuid) -> AppResult<Vec<(Registration, Course)>>;

    /// Newest first.
    async fn list_all(&self) -> AppResult<Vec<(Registration, Registrant, CourseSummary)>>;

    async fn update_status(
        &self,
        registration_id: Uuid,
        status: RegistrationStatus,
    ) -> AppResult<Option<Registration>>;
}

const COURSE_COLUMNS: &str = r#"
    id, title, description, max_participants, registered_count, join_link,
    start_date, end_date, session_time, session_duration, created_at
"#;

const REGISTRATION_COLUMNS: &str = "id, user_id, course_id, registration_date, status";

#[derive(Clone)]
pub struct PgRegistrationRepo {
    db: PgPool,
}

impl PgRegistrationRepo {
    pub fn new(db: PgPool) -> Self {
        Self { db }
    }
}

#[derive(FromRow)]
struct AdminRow {
    id: Uuid,
    user_id: Uuid,
    course_id: Uuid,
    registration_date: OffsetDateTime,
    status: RegistrationStatus,
    user_name: String,
    user_email: String,
    user_phone: Option<String>,
    course_title: String,
}

#[async_trait]
impl RegistrationRepo for PgRegistrationRepo {
    async fn find_course(&self, course_id: Uuid) -> AppResult<Option<Course>> {
        let sql = format!("SELECT {COURSE_COLUMNS} FROM courses WHERE id = $1");
        let course = sqlx::query_as::<_, Course>(&sql)
            .bind(course_id)
            .fetch_optional(&self.db)
            .await?;
        Ok(course)
    }

    async fn find_registration(
        &self,
        user_id: Uuid,
        course_id: Uuid,
    ) -> AppResult<Option<Registration>> {
        let sql = format!(
            "SELECT {REGISTRATION_COLUMNS} FROM registrations WHERE user_id = $1 AND course_id = $2"
        );
        let registration = sqlx::query_as::<_, Registration>(&sql)
            .bind(user_id)
            .bind(course_id)
            .fetch_optional(&self.db)
            .await?;
        Ok(registration)
    }

    async fn enroll(&self, user_id: Uuid, course_id: Uuid) -> AppResult<(Registration, Course)> {
        let mut tx = self.db.begin().await.context("begin tx")?;

        let increment = format!(
            r#"
            UPDATE courses
               SET registered_count = registered_count + 1
             WHERE id = $1
               AND (max_participants IS NULL OR registered_count < max_participants)
            RETURNING {COURSE_COLUMNS}
            "#
        );
        let course = sqlx::query_as::<_, Course>(&increment)
            .bind(course_id)
            .fetch_optional(&mut *tx)
            .await?;

        let Some(course) = course else {
            let exists = sqlx::query_scalar::<_, Uuid>("SELECT id FROM courses WHERE id = $1")
                .bind(course_id)
                .fetch_optional(&mut *tx)
                .await?;
            tx.rollback().await.context("rollback tx")?;
            return Err(match exists {
                Some(_) => AppError::CourseFull,
                None => AppError::CourseNotFound,
            });
        };

        let insert = format!(
            r#"
            INSERT INTO registrations (user_id, course_id, status)
            VALUES ($1, $2, $3)
            RETURNING {REGISTRATION_COLUMNS}
            "#
        );
        // Dropping `tx` on the error path rolls back the increment.
        let registration = sqlx::query_as::<_, Registration>(&insert)
            .bind(user_id)
            .bind(course_id)
            .bind(RegistrationStatus::Confirmed)
            .fetch_one(&mut *tx)
            .await
            .map_err(|e| {
                if is_unique_violation(&e) {
                    AppError::AlreadyRegistered
                } else {
                    e.into()
                }
            })?;

        tx.commit().await.context("commit tx")?;
        Ok((registration, course))
    }

    async fn list_for_user(&self, user_id: Uuid) -> AppResult<Vec<(Registration, Course)>> {
        let sql = format!(
            "SELECT {REGISTRATION_COLUMNS} FROM registrations WHERE user_id = $1 \
             ORDER BY registration_date DESC"
        );
        let registrations = sqlx::query_as::<_, Registration>(&sql)
            .bind(user_id)
            .fetch_all(&self.db)
            .await?;
        if registrations.is_empty() {
            return Ok(Vec::new());
        }

        let ids: Vec<Uuid> = registrations.iter().map(|r| r.course_id).collect();
        let sql = format!("SELECT {COURSE_COLUMNS} FROM courses WHERE id = ANY($1)");
        let courses: HashMap<Uuid, Course> = sqlx::query_as::<_, Course>(&sql)
            .bind(&ids)
            .fetch_all(&self.db)
            .await?
            .into_iter()
            .map(|c| (c.id, c))
            .collect();

        Ok(registrations
            .into_iter()
            .filter_map(|r| courses.get(&r.course_id).cloned().map(|c| (r, c)))
            .collect())
    }

    async fn list_all(&self) -> AppResult<Vec<(Registration, Registrant, CourseSummary)>> {
        let rows = sqlx::query_as::<_, AdminRow>(
            r#"
            SELECT r.id, r.user_id, r.course_id, r.registration_date, r.status,
                   u.name AS user_name, u.email AS user_email, u.phone AS user_phone,
                   c.title AS course_title
              FROM registrations r
              JOIN users u ON u.id = r.user_id
              JOIN courses c ON c.id = r.course_id
             ORDER BY r.registration_date DESC
            "#,
        )
        .fetch_all(&self.db)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| {
                (
                    Registration {
                        id: row.id,
                        user_id: row.user_id,
                        course_id: row.course_id,
                        registration_date: row.registration_date,
                        status: row.status,
                    },
                    Registrant {
                        id: row.user_id,
                        name: row.user_name,
                        email: row.user_email,
                        phone: row.user_phone,
                    },
                    CourseSummary {
                        id: row.course_id,
                        title: row.course_title,
                    },
                )
            })
            .collect())
    }

    async fn update_status(
        &self,
        registration_id: Uuid,
        status: RegistrationStatus,
    ) -> AppResult<Option<Registration>> {
        let sql = format!(
            "UPDATE registrations SET status = $2 WHERE id = $1 RETURNING {REGISTRATION_COLUMNS}"
        );
        let registration = sqlx::query_as::<_, Registration>(&sql)
            .bind(registration_id)
            .bind(status)
            .fetch_optional(&self.db)
            .await?;
        Ok(registration)
    }
}
