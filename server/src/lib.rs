use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use miam_execution::{Registry, RegistryError};
use miam_types::api::{DrawResponse, NotifyResponse, PublicParticipant, StatusResponse};
use miam_types::{Assignment, DrawerRecord, NewParticipant, Participant, ParticipantId};
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::RwLock;
use tracing::{info, warn};

mod api;
pub use api::Api;

pub mod config;
pub use config::{MailerConfig, MailerKind, ServerConfig};
mod error;
pub use error::ApiError;
pub mod mailer;
pub use mailer::{Email, MailError, Mailer};
pub mod metrics;
pub use metrics::MetricsSnapshot;
use metrics::{HttpMetrics, MailMetrics, PersistenceMetrics};
mod persistence;
pub use persistence::{DrawerStore, PersistenceBackendConfig};
mod sessions;
pub use sessions::{hash_password, AdminAuth, Session};

/// Shared state behind every request.
pub struct Drawer {
    config: ServerConfig,
    registry: RwLock<Registry>,
    // Only locked while `registry` is write-locked.
    rng: Mutex<StdRng>,
    store: Option<DrawerStore>,
    mailer: Mailer,
    auth: AdminAuth,
    http_metrics: HttpMetrics,
    mail_metrics: MailMetrics,
    persistence_metrics: Arc<PersistenceMetrics>,
}

impl Drawer {
    /// Builds a drawer, loading the stored record when a database is configured.
    pub async fn open(config: ServerConfig) -> anyhow::Result<Self> {
        let persistence_metrics = Arc::new(PersistenceMetrics::default());
        let backend = match (config.postgres_url.clone(), config.sqlite_path.clone()) {
            (Some(url), sqlite) => {
                if sqlite.is_some() {
                    warn!("Postgres URL set; ignoring SQLite path.");
                }
                Some(PersistenceBackendConfig::Postgres(url))
            }
            (None, Some(path)) => Some(PersistenceBackendConfig::Sqlite(path)),
            (None, None) => None,
        };

        let (store, record) = match backend {
            Some(backend) => {
                let buffer = config.persistence_buffer_capacity();
                let metrics = Arc::clone(&persistence_metrics);
                let (store, record) = tokio::task::spawn_blocking(move || {
                    DrawerStore::load_and_start(backend, buffer, metrics, Utc::now())
                })
                .await??;
                (Some(store), record)
            }
            None => {
                warn!("No database configured; drawer state is memory-only.");
                (None, DrawerRecord::new(Utc::now()))
            }
        };

        Self::with_record(config, record, store, persistence_metrics)
    }

    /// Memory-only drawer with an empty record.
    pub fn new(config: ServerConfig) -> anyhow::Result<Self> {
        Self::with_record(
            config,
            DrawerRecord::new(Utc::now()),
            None,
            Arc::new(PersistenceMetrics::default()),
        )
    }

    fn with_record(
        config: ServerConfig,
        record: DrawerRecord,
        store: Option<DrawerStore>,
        persistence_metrics: Arc<PersistenceMetrics>,
    ) -> anyhow::Result<Self> {
        let mailer = Mailer::from_config(&config.mailer)?;
        let auth = AdminAuth::new(config.admin_password_hash.clone(), config.session_ttl());
        if !auth.enabled() {
            warn!("No admin password configured; admin routes are disabled.");
        }
        let rng = match config.draw_seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Ok(Self {
            config,
            registry: RwLock::new(Registry::from_record(record)),
            rng: Mutex::new(rng),
            store,
            mailer,
            auth,
            http_metrics: HttpMetrics::default(),
            mail_metrics: MailMetrics::default(),
            persistence_metrics,
        })
    }

    pub fn now_ms() -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|duration| duration.as_millis() as u64)
            .unwrap_or(0)
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn mailer(&self) -> &Mailer {
        &self.mailer
    }

    pub fn auth(&self) -> &AdminAuth {
        &self.auth
    }

    pub(crate) fn http_metrics(&self) -> &HttpMetrics {
        &self.http_metrics
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            http: self.http_metrics.snapshot(),
            mail: self.mail_metrics.snapshot(),
            persistence: self.persistence_metrics.snapshot(),
        }
    }

    /// Waits for queued writes to reach the database.
    pub async fn flush(&self) {
        if let Some(store) = &self.store {
            store.flush().await;
        }
    }

    pub async fn record(&self) -> DrawerRecord {
        self.registry.read().await.record().clone()
    }

    pub async fn status(&self, now: DateTime<Utc>) -> StatusResponse {
        let registry = self.registry.read().await;
        let record = registry.record();
        StatusResponse {
            phase: record.phase,
            participant_count: record.participants.len(),
            deadline: record.deadline,
            countdown: registry.countdown(now),
            draw_ready: registry.draw_ready(),
            participants: record.participants.iter().map(PublicParticipant::from).collect(),
        }
    }

    /// Registers a participant and sends the confirmation email.
    ///
    /// A failed email is logged; the registration still succeeds.
    pub async fn register(&self, input: NewParticipant) -> Result<Participant, ApiError> {
        let participant = self
            .mutate(|registry, now| registry.register(input, now).cloned())
            .await?;
        info!(id = %participant.id, "participant registered");
        self.deliver(&Email::confirmation(&participant)).await;
        Ok(participant)
    }

    pub async fn participants(&self) -> Vec<Participant> {
        self.registry.read().await.participants().to_vec()
    }

    pub async fn remove_participant(&self, id: ParticipantId) -> Result<Participant, ApiError> {
        let removed = self.mutate(|registry, now| registry.remove(id, now)).await?;
        info!(id = %removed.id, "participant removed");
        Ok(removed)
    }

    pub async fn update_email(
        &self,
        id: ParticipantId,
        email: &str,
    ) -> Result<Participant, ApiError> {
        self.mutate(|registry, now| registry.update_email(id, email, now).cloned())
            .await
    }

    pub async fn set_deadline(&self, deadline: DateTime<Utc>) -> Result<(), ApiError> {
        self.mutate(|registry, now| {
            registry.set_deadline(deadline, now);
            Ok(())
        })
        .await?;
        info!(deadline = %deadline.to_rfc3339(), "deadline set");
        Ok(())
    }

    pub async fn clear_deadline(&self) -> Result<bool, ApiError> {
        self.mutate(|registry, now| Ok(registry.clear_deadline(now)))
            .await
    }

    pub async fn reset(&self) -> Result<(), ApiError> {
        self.mutate(|registry, now| {
            registry.reset(now);
            Ok(())
        })
        .await?;
        info!("drawer reset");
        Ok(())
    }

    /// Performs the draw, stores it and emails every giver.
    pub async fn draw(&self, redraw: bool) -> Result<DrawResponse, ApiError> {
        let result = self
            .mutate(|registry, now| {
                let mut rng = self
                    .rng
                    .lock()
                    .unwrap_or_else(|poisoned| poisoned.into_inner());
                registry.perform_draw_with_attempts(
                    &mut *rng,
                    redraw,
                    now,
                    self.config.draw_max_attempts,
                )
            })
            .await?;
        info!(
            participants = result.assignments.len(),
            attempts = result.attempts,
            redraw,
            "draw completed"
        );
        let notifications = self.notify(&result.assignments).await;
        Ok(DrawResponse {
            attempts: result.attempts,
            assignments: result.assignments,
            notifications,
        })
    }

    pub async fn assignments(&self) -> Vec<Assignment> {
        self.registry.read().await.record().assignments.clone()
    }

    /// Sends the current assignments again.
    pub async fn notify_assignments(&self) -> NotifyResponse {
        let assignments = self.assignments().await;
        self.notify(&assignments).await
    }

    /// Applies a registry operation and queues the new record for storage.
    ///
    /// The write happens before the lock is released so stored snapshots follow
    /// the order of mutations.
    async fn mutate<T>(
        &self,
        op: impl FnOnce(&mut Registry, DateTime<Utc>) -> Result<T, RegistryError>,
    ) -> Result<T, ApiError> {
        let mut registry = self.registry.write().await;
        let value = op(&mut *registry, Utc::now())?;
        if let Some(store) = &self.store {
            store.persist(registry.record().clone()).await;
        }
        Ok(value)
    }

    async fn notify(&self, assignments: &[Assignment]) -> NotifyResponse {
        let delivered: Vec<bool> = stream::iter(assignments.iter().map(Email::assignment))
            .map(|email| async move { self.deliver(&email).await })
            .buffer_unordered(self.config.notify_concurrency())
            .collect()
            .await;
        let sent = delivered.iter().filter(|ok| **ok).count();
        NotifyResponse {
            sent,
            failed: delivered.len() - sent,
        }
    }

    async fn deliver(&self, email: &Email) -> bool {
        match self.mailer.send(email).await {
            Ok(message_id) => {
                self.mail_metrics.inc_sent();
                info!(to = %email.to, message_id = %message_id, "email sent");
                true
            }
            Err(err) => {
                self.mail_metrics.inc_failed();
                warn!(to = %email.to, error = %err, "email failed");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use miam_execution::mocks::create_new_participant;
    use miam_execution::{verify_assignments, DrawError};
    use miam_types::Phase;

    fn drawer() -> Drawer {
        Drawer::new(ServerConfig::for_tests(None)).unwrap()
    }

    #[tokio::test]
    async fn register_sends_confirmation() {
        let drawer = drawer();
        let participant = drawer.register(create_new_participant(0)).await.unwrap();
        let sent = drawer.mailer().sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].to, participant.email);
        assert_eq!(drawer.metrics().mail.sent, 1);
    }

    #[tokio::test]
    async fn draw_notifies_every_giver() {
        let drawer = drawer();
        for index in 0..5 {
            drawer.register(create_new_participant(index)).await.unwrap();
        }
        let response = drawer.draw(false).await.unwrap();
        assert_eq!(response.notifications, NotifyResponse { sent: 5, failed: 0 });

        let record = drawer.record().await;
        assert_eq!(record.phase, Phase::Drawn);
        verify_assignments(&record.participants, &record.assignments).unwrap();

        let assignment_emails: Vec<_> = drawer
            .mailer()
            .sent()
            .into_iter()
            .skip(5)
            .map(|email| email.to)
            .collect();
        assert_eq!(assignment_emails.len(), 5);
        for participant in &record.participants {
            assert!(assignment_emails.contains(&participant.email));
        }
    }

    #[tokio::test]
    async fn failed_draw_keeps_state_and_sends_nothing() {
        let drawer = drawer();
        for index in 0..2 {
            drawer.register(create_new_participant(index)).await.unwrap();
        }
        let before = drawer.record().await;
        assert!(drawer.draw(false).await.is_err());
        assert_eq!(drawer.record().await, before);
        assert_eq!(drawer.mailer().sent().len(), 2);
    }

    #[tokio::test]
    async fn exhausted_draw_budget_keeps_stored_state() {
        let dir = tempfile::tempdir().unwrap();
        let config = ServerConfig {
            sqlite_path: Some(dir.path().join("drawer.db")),
            draw_max_attempts: 0,
            ..ServerConfig::for_tests(None)
        };

        let drawer = Drawer::open(config.clone()).await.unwrap();
        for index in 0..4 {
            drawer.register(create_new_participant(index)).await.unwrap();
        }
        drawer.flush().await;
        let before = drawer.record().await;

        let err = drawer.draw(false).await.unwrap_err();
        assert!(matches!(
            err,
            ApiError::Registry(RegistryError::Draw(DrawError::NoDerangement { attempts: 0 }))
        ));
        assert_eq!(drawer.record().await, before);
        assert_eq!(drawer.mailer().sent().len(), 4);
        drawer.flush().await;
        drop(drawer);

        let reopened = Drawer::open(config).await.unwrap();
        assert_eq!(reopened.record().await, before);
    }

    #[tokio::test]
    async fn concurrent_draws_do_not_interleave() {
        let drawer = Arc::new(drawer());
        for index in 0..6 {
            drawer.register(create_new_participant(index)).await.unwrap();
        }
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let drawer = Arc::clone(&drawer);
                tokio::spawn(async move { drawer.draw(true).await })
            })
            .collect();
        for handle in handles {
            handle.await.unwrap().unwrap();
        }
        let record = drawer.record().await;
        verify_assignments(&record.participants, &record.assignments).unwrap();
    }

    #[tokio::test]
    async fn state_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let config = ServerConfig {
            sqlite_path: Some(dir.path().join("drawer.db")),
            ..ServerConfig::for_tests(None)
        };

        let drawer = Drawer::open(config.clone()).await.unwrap();
        for index in 0..3 {
            drawer.register(create_new_participant(index)).await.unwrap();
        }
        drawer.draw(false).await.unwrap();
        drawer.flush().await;
        let expected = drawer.record().await;
        drop(drawer);

        let reopened = Drawer::open(config).await.unwrap();
        assert_eq!(reopened.record().await, expected);
    }
}
