use tracing::{info, warn};
use uuid::Uuid;

use crate::{
    auth::claims::TokenPayload,
    calendar,
    error::{AppError, AppResult},
    mail::{self, ConfirmationLinks},
    registrations::{
        dto::{AdminRegistration, MyRegistration, RegisteredUser, RegistrationDetails},
        repo_types::{Registration, RegistrationStatus},
    },
    state::AppState,
};

/// Enroll the caller in a course exactly once.
///
/// The duplicate and capacity pre-checks only pick the error early; the
/// repository's `enroll` re-checks both atomically, so concurrent callers
/// can never push `registered_count` past `max_participants`.
pub async fn register(
    state: &AppState,
    caller: TokenPayload,
    course_id: Uuid,
) -> AppResult<RegistrationDetails> {
    if state
        .registrations
        .find_registration(caller.user_id, course_id)
        .await?
        .is_some()
    {
        return Err(AppError::AlreadyRegistered);
    }

    let course = state
        .registrations
        .find_course(course_id)
        .await?
        .ok_or(AppError::CourseNotFound)?;
    if course.is_full() {
        warn!(course_id = %course_id, "course is full");
        return Err(AppError::CourseFull);
    }

    let user = state
        .users
        .find_by_id(caller.user_id)
        .await?
        .ok_or(AppError::NotFound("User not found"))?;

    let (registration, course) = state.registrations.enroll(user.id, course_id).await?;
    info!(
        user_id = %user.id,
        course_id = %course.id,
        registered = course.registered_count,
        "registered for course"
    );

    let calendar_url = calendar::google_calendar_url(&course);
    let ics_url = calendar::ics_feed_url(&state.config.client_url, course.id);
    mail::dispatch(
        state.mailer.clone(),
        mail::registration_confirmation(
            &state.config,
            &user.email,
            &user.name,
            &course.title,
            ConfirmationLinks {
                join_link: course.join_link.as_deref(),
                google_calendar_url: &calendar_url,
                ics_url: &ics_url,
            },
        ),
    );

    Ok(RegistrationDetails {
        registration,
        user: RegisteredUser {
            id: user.id,
            name: user.name,
            email: user.email,
        },
        course,
    })
}

pub async fn my_registrations(state: &AppState, user_id: Uuid) -> AppResult<Vec<MyRegistration>> {
    Ok(state
        .registrations
        .list_for_user(user_id)
        .await?
        .into_iter()
        .map(|(registration, course)| MyRegistration {
            registration,
            course,
        })
        .collect())
}

pub async fn all_registrations(state: &AppState) -> AppResult<Vec<AdminRegistration>> {
    Ok(state
        .registrations
        .list_all()
        .await?
        .into_iter()
        .map(|(registration, user, course)| AdminRegistration {
            registration,
            user,
            course,
        })
        .collect())
}

/// Administrative transition. `registered_count` is left as is.
pub async fn update_status(
    state: &AppState,
    registration_id: Uuid,
    raw_status: &str,
) -> AppResult<Registration> {
    let status: RegistrationStatus = raw_status
        .parse()
        .map_err(|_| AppError::Validation("Invalid status".into()))?;
    let registration = state
        .registrations
        .update_status(registration_id, status)
        .await?
        .ok_or(AppError::NotFound("Registration not found"))?;
    info!(registration_id = %registration.id, status = ?status, "registration status updated");
    Ok(registration)
}

#[cfg(test)]
mod tests {
    use std::{sync::Arc, time::Duration};

    use super::*;
    use crate::{
        auth::repo_types::{AuthProvider, NewUser, Role},
        mail::EmailKind,
        memory::Fakes,
    };

    async fn user(state: &AppState, email: &str) -> TokenPayload {
        let created = state
            .users
            .create(NewUser {
                name: "Reg".into(),
                email: email.into(),
                phone: Some("+1 555".into()),
                password_hash: None,
                auth_provider: AuthProvider::Email,
                google_id: None,
                avatar_url: None,
                email_verified: true,
                email_verify_token: None,
            })
            .await
            .unwrap();
        TokenPayload {
            user_id: created.id,
            role: Role::User,
        }
    }

    fn setup() -> (AppState, Fakes) {
        AppState::fake_parts()
    }

    #[tokio::test]
    async fn first_seat_then_full() {
        let (state, fakes) = setup();
        let course = fakes.store.insert_course("Retreat", Some(1), 0);
        let a = user(&state, "a@x.com").await;
        let b = user(&state, "b@x.com").await;

        let details = register(&state, a, course.id).await.unwrap();
        assert_eq!(details.registration.status, RegistrationStatus::Confirmed);
        assert_eq!(details.course.registered_count, 1);
        assert_eq!(details.user.email, "a@x.com");

        let err = register(&state, b, course.id).await.unwrap_err();
        assert!(matches!(err, AppError::CourseFull));
        assert_eq!(fakes.store.course(course.id).unwrap().registered_count, 1);
    }

    #[tokio::test]
    async fn registering_twice_keeps_one_row() {
        let (state, fakes) = setup();
        let course = fakes.store.insert_course("Open", None, 0);
        let a = user(&state, "a@x.com").await;

        register(&state, a, course.id).await.unwrap();
        let err = register(&state, a, course.id).await.unwrap_err();
        assert!(matches!(err, AppError::AlreadyRegistered));
        assert_eq!(fakes.store.registrations_for(course.id).len(), 1);
        assert_eq!(fakes.store.course(course.id).unwrap().registered_count, 1);
    }

    #[tokio::test]
    async fn already_registered_wins_over_full() {
        let (state, fakes) = setup();
        let course = fakes.store.insert_course("Tiny", Some(1), 0);
        let a = user(&state, "a@x.com").await;
        register(&state, a, course.id).await.unwrap();
        assert!(matches!(
            register(&state, a, course.id).await,
            Err(AppError::AlreadyRegistered)
        ));
    }

    #[tokio::test]
    async fn full_course_stays_at_capacity() {
        let (state, fakes) = setup();
        let course = fakes.store.insert_course("Full", Some(3), 3);
        let a = user(&state, "a@x.com").await;
        assert!(matches!(
            register(&state, a, course.id).await,
            Err(AppError::CourseFull)
        ));
        assert_eq!(fakes.store.course(course.id).unwrap().registered_count, 3);
        assert!(fakes.store.registrations_for(course.id).is_empty());
    }

    #[tokio::test]
    async fn unknown_course() {
        let (state, _) = setup();
        let a = user(&state, "a@x.com").await;
        assert!(matches!(
            register(&state, a, Uuid::new_v4()).await,
            Err(AppError::CourseNotFound)
        ));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_last_seat_goes_to_one_user() {
        let (state, fakes) = setup();
        let course = fakes.store.insert_course("Last seat", Some(5), 4);
        let mut callers = Vec::new();
        for i in 0..8 {
            callers.push(user(&state, &format!("u{i}@x.com")).await);
        }

        let state = Arc::new(state);
        let handles: Vec<_> = callers
            .into_iter()
            .map(|caller| {
                let state = state.clone();
                let course_id = course.id;
                tokio::spawn(async move { register(&state, caller, course_id).await })
            })
            .collect();

        let mut ok = 0;
        for h in handles {
            match h.await.unwrap() {
                Ok(_) => ok += 1,
                Err(e) => assert!(matches!(e, AppError::CourseFull)),
            }
        }
        assert_eq!(ok, 1);
        assert_eq!(fakes.store.course(course.id).unwrap().registered_count, 5);
        assert_eq!(fakes.store.registrations_for(course.id).len(), 1);
    }

    #[tokio::test]
    async fn confirmation_email_carries_links() {
        let (state, fakes) = setup();
        let course = fakes.store.insert_course("Sangha", None, 0);
        let a = user(&state, "a@x.com").await;
        register(&state, a, course.id).await.unwrap();

        let sent = tokio::time::timeout(Duration::from_secs(2), fakes.mailer.wait_for(1))
            .await
            .unwrap();
        assert_eq!(sent[0].kind, EmailKind::RegistrationConfirmation);
        assert_eq!(sent[0].to, "a@x.com");
        assert!(sent[0].html.contains("calendar.google.com"));
        assert!(sent[0].html.contains(&format!("/api/v1/calendar/ics/{}", course.id)));
    }

    #[tokio::test]
    async fn lists_and_status_updates() {
        let (state, fakes) = setup();
        let c1 = fakes.store.insert_course("One", None, 0);
        let c2 = fakes.store.insert_course("Two", Some(10), 0);
        let a = user(&state, "a@x.com").await;
        let b = user(&state, "b@x.com").await;
        register(&state, a, c1.id).await.unwrap();
        register(&state, a, c2.id).await.unwrap();
        let reg_b = register(&state, b, c2.id).await.unwrap();

        let mine = my_registrations(&state, a.user_id).await.unwrap();
        assert_eq!(mine.len(), 2);
        assert!(mine.iter().all(|r| r.registration.user_id == a.user_id));

        let all = all_registrations(&state).await.unwrap();
        assert_eq!(all.len(), 3);
        let row = all
            .iter()
            .find(|r| r.registration.id == reg_b.registration.id)
            .unwrap();
        assert_eq!(row.user.email, "b@x.com");
        assert_eq!(row.user.phone.as_deref(), Some("+1 555"));
        assert_eq!(row.course.title, "Two");

        let updated = update_status(&state, reg_b.registration.id, "CANCELLED")
            .await
            .unwrap();
        assert_eq!(updated.status, RegistrationStatus::Cancelled);
        assert_eq!(fakes.store.course(c2.id).unwrap().registered_count, 2);

        assert!(matches!(
            update_status(&state, reg_b.registration.id, "DONE").await,
            Err(AppError::Validation(_))
        ));
        assert!(matches!(
            update_status(&state, Uuid::new_v4(), "PENDING").await,
            Err(AppError::NotFound(_))
        ));
    }
}
