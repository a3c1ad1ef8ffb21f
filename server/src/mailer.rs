use miam_types::{Assignment, Participant};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tracing::info;
use uuid::Uuid;

use crate::config::{MailerConfig, MailerKind};

const CONFIRMATION_SUBJECT: &str = "🎄 Welcome to MIAM Magical Drawer!";
const ASSIGNMENT_SUBJECT: &str = "🎁 Your MIAM Magical Drawer Assignment is Here!";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Email {
    pub to: String,
    pub subject: String,
    pub text: String,
}

impl Email {
    pub fn confirmation(participant: &Participant) -> Self {
        Self {
            to: participant.email.clone(),
            subject: CONFIRMATION_SUBJECT.to_string(),
            text: format!(
                "Hi {},\n\n\
                 You are registered for the MIAM Magical Drawer gift exchange.\n\
                 Once registration closes, the draw will pick the person you gift \
                 a musical note to, and we will email you their name.\n\n\
                 See you soon!",
                participant.name
            ),
        }
    }

    pub fn assignment(assignment: &Assignment) -> Self {
        Self {
            to: assignment.giver_email.clone(),
            subject: ASSIGNMENT_SUBJECT.to_string(),
            text: format!(
                "Hi {},\n\n\
                 The draw is done! You will be gifting a musical note to:\n\n\
                 {}\n\n\
                 Keep it a secret and have fun!",
                assignment.giver_name, assignment.receiver_name
            ),
        }
    }
}

#[derive(Debug, Error)]
pub enum MailError {
    #[error("mail request failed: {0}")]
    Reqwest(#[from] reqwest::Error),
    #[error("mail provider rejected message ({status}): {body}")]
    Rejected { status: u16, body: String },
}

#[derive(Serialize)]
struct ResendRequest<'a> {
    from: &'a str,
    to: [&'a str; 1],
    subject: &'a str,
    text: &'a str,
}

#[derive(Deserialize)]
struct ResendResponse {
    id: String,
}

/// Client for the Resend `POST /emails` endpoint.
#[derive(Clone)]
pub struct ResendMailer {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
    from: String,
}

impl ResendMailer {
    pub fn new(base_url: &str, api_key: String, from: String) -> Result<Self, MailError> {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
            from,
        })
    }

    async fn send(&self, email: &Email) -> Result<String, MailError> {
        let response = self
            .http
            .post(format!("{}/emails", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&ResendRequest {
                from: &self.from,
                to: [&email.to],
                subject: &email.subject,
                text: &email.text,
            })
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(MailError::Rejected {
                status: status.as_u16(),
                body,
            });
        }
        let sent: ResendResponse = response.json().await?;
        Ok(sent.id)
    }
}

/// Outgoing mail transport.
#[derive(Clone)]
pub enum Mailer {
    Resend(ResendMailer),
    Log { from: String },
    Outbox(Arc<Mutex<Vec<Email>>>),
}

impl Mailer {
    /// Builds the configured transport. A Resend mailer without an API key
    /// falls back to logging.
    pub fn from_config(config: &MailerConfig) -> Result<Self, MailError> {
        match (config.kind, config.resend_api_key.as_ref()) {
            (MailerKind::Resend, Some(api_key)) => Ok(Self::Resend(ResendMailer::new(
                &config.resend_base_url,
                api_key.clone(),
                config.from.clone(),
            )?)),
            (MailerKind::Resend, None) => {
                tracing::warn!("RESEND_API_KEY not set; emails will be logged instead of sent");
                Ok(Self::Log {
                    from: config.from.clone(),
                })
            }
            (MailerKind::Log, _) => Ok(Self::Log {
                from: config.from.clone(),
            }),
            (MailerKind::Outbox, _) => Ok(Self::outbox()),
        }
    }

    pub fn outbox() -> Self {
        Self::Outbox(Arc::new(Mutex::new(Vec::new())))
    }

    /// Sends one message and returns the provider's message id.
    pub async fn send(&self, email: &Email) -> Result<String, MailError> {
        match self {
            Mailer::Resend(resend) => resend.send(email).await,
            Mailer::Log { from } => {
                info!(
                    from = %from,
                    to = %email.to,
                    subject = %email.subject,
                    "email (not delivered)"
                );
                Ok(format!("log-{}", Uuid::new_v4()))
            }
            Mailer::Outbox(outbox) => {
                if let Ok(mut sent) = outbox.lock() {
                    sent.push(email.clone());
                }
                Ok(format!("outbox-{}", Uuid::new_v4()))
            }
        }
    }

    /// Messages captured by an outbox mailer; empty for other transports.
    pub fn sent(&self) -> Vec<Email> {
        match self {
            Mailer::Outbox(outbox) => outbox.lock().map(|sent| sent.clone()).unwrap_or_default(),
            _ => Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{extract::State, http::HeaderMap, http::StatusCode, routing::post, Json, Router};
    use miam_execution::mocks::create_participant;
    use tokio::net::TcpListener;

    type Captured = Arc<Mutex<Vec<(Option<String>, serde_json::Value)>>>;

    async fn resend_stub(
        State(captured): State<Captured>,
        headers: HeaderMap,
        Json(body): Json<serde_json::Value>,
    ) -> (StatusCode, Json<serde_json::Value>) {
        let auth = headers
            .get("authorization")
            .and_then(|value| value.to_str().ok())
            .map(str::to_string);
        let reject = body["to"][0] == "bounce@workshop.test";
        captured.lock().unwrap().push((auth, body));
        if reject {
            return (
                StatusCode::UNPROCESSABLE_ENTITY,
                Json(serde_json::json!({ "message": "invalid recipient" })),
            );
        }
        (StatusCode::OK, Json(serde_json::json!({ "id": "msg_123" })))
    }

    async fn spawn_stub() -> (String, Captured) {
        let captured = Captured::default();
        let app = Router::new()
            .route("/emails", post(resend_stub))
            .with_state(Arc::clone(&captured));
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        (format!("http://{addr}"), captured)
    }

    #[test]
    fn confirmation_greets_first_name() {
        let participant = create_participant(0);
        let email = Email::confirmation(&participant);
        assert_eq!(email.to, participant.email);
        assert_eq!(email.subject, CONFIRMATION_SUBJECT);
        assert!(email.text.starts_with(&format!("Hi {},", participant.name)));
    }

    #[test]
    fn assignment_names_receiver() {
        let giver = create_participant(0);
        let receiver = create_participant(1);
        let email = Email::assignment(&Assignment::between(&giver, &receiver));
        assert_eq!(email.to, giver.email);
        assert_eq!(email.subject, ASSIGNMENT_SUBJECT);
        assert!(email.text.contains(&giver.full_name()));
        assert!(email.text.contains(&receiver.full_name()));
    }

    #[tokio::test]
    async fn resend_posts_message() {
        let (base_url, captured) = spawn_stub().await;
        let mailer = Mailer::from_config(&MailerConfig {
            kind: MailerKind::Resend,
            from: "Drawer <drawer@workshop.test>".to_string(),
            resend_api_key: Some("re_test".to_string()),
            resend_base_url: base_url,
        })
        .unwrap();

        let email = Email::confirmation(&create_participant(2));
        let id = mailer.send(&email).await.unwrap();
        assert_eq!(id, "msg_123");

        let captured = captured.lock().unwrap();
        let (auth, body) = &captured[0];
        assert_eq!(auth.as_deref(), Some("Bearer re_test"));
        assert_eq!(body["from"], "Drawer <drawer@workshop.test>");
        assert_eq!(body["to"][0], email.to.as_str());
        assert_eq!(body["subject"], CONFIRMATION_SUBJECT);
    }

    #[tokio::test]
    async fn resend_surfaces_rejections() {
        let (base_url, _captured) = spawn_stub().await;
        let mailer = Mailer::Resend(
            ResendMailer::new(&base_url, "re_test".to_string(), "a@b".to_string()).unwrap(),
        );
        let email = Email {
            to: "bounce@workshop.test".to_string(),
            subject: "hi".to_string(),
            text: "hi".to_string(),
        };
        match mailer.send(&email).await {
            Err(MailError::Rejected { status, body }) => {
                assert_eq!(status, 422);
                assert!(body.contains("invalid recipient"));
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[tokio::test]
    async fn missing_api_key_falls_back_to_log() {
        let mailer = Mailer::from_config(&MailerConfig {
            kind: MailerKind::Resend,
            ..MailerConfig::default()
        })
        .unwrap();
        assert!(matches!(mailer, Mailer::Log { .. }));
        assert!(mailer
            .send(&Email::confirmation(&create_participant(0)))
            .await
            .unwrap()
            .starts_with("log-"));
    }

    #[tokio::test]
    async fn outbox_records_messages() {
        let mailer = Mailer::outbox();
        mailer
            .send(&Email::confirmation(&create_participant(0)))
            .await
            .unwrap();
        assert_eq!(mailer.sent().len(), 1);
    }
}
