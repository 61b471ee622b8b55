//! In-process implementations of the storage, mail and identity-provider seams.
//! They back `AppState::fake()` and the test suite.

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex, MutexGuard,
    },
};

use async_trait::async_trait;
use time::OffsetDateTime;
use tokio::sync::Notify;
use uuid::Uuid;

use crate::{
    auth::{
        google::{GoogleIdentity, GoogleTokenVerifier},
        repo::UserRepo,
        repo_types::{NewUser, Role, User},
    },
    error::{AppError, AppResult},
    mail::{Mailer, OutgoingEmail},
    registrations::{
        repo::RegistrationRepo,
        repo_types::{Course, CourseSummary, Registrant, Registration, RegistrationStatus},
    },
};

#[derive(Default)]
struct Tables {
    users: HashMap<Uuid, User>,
    courses: HashMap<Uuid, Course>,
    registrations: Vec<Registration>,
}

impl Tables {
    fn google_id_taken(&self, google_id: &str, except: Option<Uuid>) -> bool {
        self.users
            .values()
            .any(|u| u.google_id.as_deref() == Some(google_id) && Some(u.id) != except)
    }
}

/// Users, courses and registrations behind one lock, so every trait method
/// is atomic with respect to the others.
#[derive(Default)]
pub struct MemoryStore {
    tables: Mutex<Tables>,
    round_trips: AtomicUsize,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of times the tables were locked; one per store operation.
    pub fn round_trips(&self) -> usize {
        self.round_trips.load(Ordering::SeqCst)
    }

    fn lock(&self) -> AppResult<MutexGuard<'_, Tables>> {
        self.round_trips.fetch_add(1, Ordering::SeqCst);
        self.tables
            .lock()
            .map_err(|_| AppError::Internal(anyhow::anyhow!("memory store poisoned")))
    }

    fn with_user<T>(&self, id: Uuid, f: impl FnOnce(&mut User) -> T) -> AppResult<T> {
        let mut t = self.lock()?;
        let user = t.users.get_mut(&id).ok_or(AppError::NotFound("User not found"))?;
        Ok(f(user))
    }

    pub fn insert_course(
        &self,
        title: &str,
        max_participants: Option<i32>,
        registered_count: i32,
    ) -> Course {
        let now = OffsetDateTime::now_utc();
        let course = Course {
            id: Uuid::new_v4(),
            title: title.to_owned(),
            description: String::new(),
            max_participants,
            registered_count,
            join_link: None,
            start_date: now,
            end_date: now,
            session_time: None,
            session_duration: None,
            created_at: now,
        };
        if let Ok(mut t) = self.lock() {
            t.courses.insert(course.id, course.clone());
        }
        course
    }

    pub fn course(&self, id: Uuid) -> Option<Course> {
        self.lock().ok()?.courses.get(&id).cloned()
    }

    pub fn user_by_email(&self, email: &str) -> Option<User> {
        self.lock()
            .ok()?
            .users
            .values()
            .find(|u| u.email == email)
            .cloned()
    }

    pub fn set_role(&self, id: Uuid, role: Role) {
        let _ = self.with_user(id, |u| u.role = role);
    }

    pub fn registrations_for(&self, course_id: Uuid) -> Vec<Registration> {
        self.lock()
            .map(|t| {
                t.registrations
                    .iter()
                    .filter(|r| r.course_id == course_id)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }
}

#[async_trait]
impl UserRepo for MemoryStore {
    async fn find_by_email(&self, email: &str) -> AppResult<Option<User>> {
        Ok(self.lock()?.users.values().find(|u| u.email == email).cloned())
    }

    async fn find_by_id(&self, id: Uuid) -> AppResult<Option<User>> {
        Ok(self.lock()?.users.get(&id).cloned())
    }

    async fn find_by_google_id(&self, google_id: &str) -> AppResult<Option<User>> {
        Ok(self
            .lock()?
            .users
            .values()
            .find(|u| u.google_id.as_deref() == Some(google_id))
            .cloned())
    }

    async fn find_by_email_verify_token(&self, token: &str) -> AppResult<Option<User>> {
        Ok(self
            .lock()?
            .users
            .values()
            .find(|u| u.email_verify_token.as_deref() == Some(token))
            .cloned())
    }

    async fn create(&self, new: NewUser) -> AppResult<User> {
        let mut t = self.lock()?;
        if t.users.values().any(|u| u.email == new.email) {
            return Err(AppError::DuplicateEmail);
        }
        if let Some(google_id) = new.google_id.as_deref() {
            if t.google_id_taken(google_id, None) {
                return Err(AppError::DuplicateGoogleAccount);
            }
        }
        let user = User {
            id: Uuid::new_v4(),
            name: new.name,
            email: new.email,
            phone: new.phone,
            password_hash: new.password_hash,
            role: Role::User,
            auth_provider: new.auth_provider,
            google_id: new.google_id,
            avatar_url: new.avatar_url,
            email_verified: new.email_verified,
            email_verify_token: new.email_verify_token,
            refresh_token: None,
            created_at: OffsetDateTime::now_utc(),
        };
        t.users.insert(user.id, user.clone());
        Ok(user)
    }

    async fn link_google(
        &self,
        id: Uuid,
        google_id: &str,
        avatar_url: Option<&str>,
    ) -> AppResult<User> {
        let mut t = self.lock()?;
        if t.google_id_taken(google_id, Some(id)) {
            return Err(AppError::DuplicateGoogleAccount);
        }
        let u = t.users.get_mut(&id).ok_or(AppError::NotFound("User not found"))?;
        u.google_id = Some(google_id.to_owned());
        if let Some(url) = avatar_url {
            u.avatar_url = Some(url.to_owned());
        }
        u.email_verified = true;
        Ok(u.clone())
    }

    async fn set_refresh_token(&self, id: Uuid, token: Option<&str>) -> AppResult<()> {
        self.with_user(id, |u| u.refresh_token = token.map(str::to_owned))
    }

    async fn rotate_refresh_token(&self, id: Uuid, expected: &str, next: &str) -> AppResult<bool> {
        self.with_user(id, |u| {
            if u.refresh_token.as_deref() == Some(expected) {
                u.refresh_token = Some(next.to_owned());
                true
            } else {
                false
            }
        })
    }

    async fn issue_reset_token(&self, email: &str, token: &str) -> AppResult<Option<User>> {
        let mut t = self.lock()?;
        Ok(t.users.values_mut().find(|u| u.email == email).map(|u| {
            u.email_verify_token = Some(token.to_owned());
            u.clone()
        }))
    }

    async fn mark_email_verified(&self, id: Uuid) -> AppResult<()> {
        self.with_user(id, |u| {
            u.email_verified = true;
            u.email_verify_token = None;
        })
    }

    async fn reset_password(&self, id: Uuid, password_hash: &str) -> AppResult<()> {
        self.with_user(id, |u| {
            u.password_hash = Some(password_hash.to_owned());
            u.email_verify_token = None;
        })
    }
}

#[async_trait]
impl RegistrationRepo for MemoryStore {
    async fn find_course(&self, course_id: Uuid) -> AppResult<Option<Course>> {
        Ok(self.lock()?.courses.get(&course_id).cloned())
    }

    async fn find_registration(
        &self,
        user_id: Uuid,
        course_id: Uuid,
    ) -> AppResult<Option<Registration>> {
        Ok(self
            .lock()?
            .registrations
            .iter()
            .find(|r| r.user_id == user_id && r.course_id == course_id)
            .cloned())
    }

    async fn enroll(&self, user_id: Uuid, course_id: Uuid) -> AppResult<(Registration, Course)> {
        let mut t = self.lock()?;
        if t
            .registrations
            .iter()
            .any(|r| r.user_id == user_id && r.course_id == course_id)
        {
            return Err(AppError::AlreadyRegistered);
        }
        let course = t.courses.get_mut(&course_id).ok_or(AppError::CourseNotFound)?;
        if course.is_full() {
            return Err(AppError::CourseFull);
        }
        course.registered_count += 1;
        let course = course.clone();

        let registration = Registration {
            id: Uuid::new_v4(),
            user_id,
            course_id,
            registration_date: OffsetDateTime::now_utc(),
            status: RegistrationStatus::Confirmed,
        };
        t.registrations.push(registration.clone());
        Ok((registration, course))
    }

    async fn list_for_user(&self, user_id: Uuid) -> AppResult<Vec<(Registration, Course)>> {
        let t = self.lock()?;
        let mut out: Vec<_> = t
            .registrations
            .iter()
            .filter(|r| r.user_id == user_id)
            .filter_map(|r| t.courses.get(&r.course_id).map(|c| (r.clone(), c.clone())))
            .collect();
        out.sort_by(|a, b| b.0.registration_date.cmp(&a.0.registration_date));
        Ok(out)
    }

    async fn list_all(&self) -> AppResult<Vec<(Registration, Registrant, CourseSummary)>> {
        let t = self.lock()?;
        let mut out: Vec<_> = t
            .registrations
            .iter()
            .filter_map(|r| {
                let user = t.users.get(&r.user_id)?;
                let course = t.courses.get(&r.course_id)?;
                Some((
                    r.clone(),
                    Registrant {
                        id: user.id,
                        name: user.name.clone(),
                        email: user.email.clone(),
                        phone: user.phone.clone(),
                    },
                    CourseSummary {
                        id: course.id,
                        title: course.title.clone(),
                    },
                ))
            })
            .collect();
        out.sort_by(|a, b| b.0.registration_date.cmp(&a.0.registration_date));
        Ok(out)
    }

    async fn update_status(
        &self,
        registration_id: Uuid,
        status: RegistrationStatus,
    ) -> AppResult<Option<Registration>> {
        let mut t = self.lock()?;
        Ok(t
            .registrations
            .iter_mut()
            .find(|r| r.id == registration_id)
            .map(|r| {
                r.status = status;
                r.clone()
            }))
    }
}

/// Keeps every message handed to it.
#[derive(Default)]
pub struct RecordingMailer {
    sent: Mutex<Vec<OutgoingEmail>>,
    notify: Notify,
}

impl RecordingMailer {
    pub fn sent(&self) -> Vec<OutgoingEmail> {
        self.sent.lock().map(|s| s.clone()).unwrap_or_default()
    }

    /// Resolves once at least `n` messages were sent.
    pub async fn wait_for(&self, n: usize) -> Vec<OutgoingEmail> {
        loop {
            let sent = self.sent();
            if sent.len() >= n {
                return sent;
            }
            self.notify.notified().await;
        }
    }
}

#[async_trait]
impl Mailer for RecordingMailer {
    async fn send(&self, email: OutgoingEmail) -> anyhow::Result<()> {
        self.sent
            .lock()
            .map_err(|_| anyhow::anyhow!("mailer poisoned"))?
            .push(email);
        self.notify.notify_one();
        Ok(())
    }
}

/// Accepts only the ID tokens registered with [`StaticGoogleVerifier::insert`].
#[derive(Default)]
pub struct StaticGoogleVerifier {
    tokens: Mutex<HashMap<String, GoogleIdentity>>,
}

impl StaticGoogleVerifier {
    pub fn insert(&self, id_token: &str, identity: GoogleIdentity) {
        if let Ok(mut tokens) = self.tokens.lock() {
            tokens.insert(id_token.to_owned(), identity);
        }
    }
}

#[async_trait]
impl GoogleTokenVerifier for StaticGoogleVerifier {
    async fn verify(&self, id_token: &str) -> AppResult<GoogleIdentity> {
        let tokens = self
            .tokens
            .lock()
            .map_err(|_| AppError::Internal(anyhow::anyhow!("verifier poisoned")))?;
        let identity = tokens
            .get(id_token)
            .cloned()
            .ok_or(AppError::InvalidFederatedToken)?;
        if identity.email.is_empty() {
            return Err(AppError::InvalidFederatedToken);
        }
        Ok(identity)
    }
}

/// Handles to the fakes behind an `AppState::fake_parts()` state.
#[derive(Clone)]
pub struct Fakes {
    pub store: Arc<MemoryStore>,
    pub mailer: Arc<RecordingMailer>,
    pub google: Arc<StaticGoogleVerifier>,
}
