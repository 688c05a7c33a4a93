//! Executes dispatch jobs against live session connections.

use async_trait::async_trait;
use tracing::info;

use super::{DispatchError, Job, JobExecutor, JobPayload};
use crate::attachment::{AttachmentPipeline, RemoteDocument};
use crate::backend::{Connection, OutboundContent};
use crate::session::SessionManager;

/// Footer shown under link buttons.
const BUTTON_FOOTER: &str = "WA Gateway";

/// Sends each job through the connection of the session it was routed to.
pub struct SessionJobExecutor {
    sessions: SessionManager,
    attachments: AttachmentPipeline,
}

impl SessionJobExecutor {
    pub fn new(sessions: SessionManager, attachments: AttachmentPipeline) -> Self {
        Self {
            sessions,
            attachments,
        }
    }

    async fn send_document(
        &self,
        job: &Job,
        connection: &dyn Connection,
        source: &RemoteDocument,
    ) -> Result<(), DispatchError> {
        info!(job_id = %job.id, wa = %job.session, url = %source.url, status = "SENDING_FILE", "Fetching attachment");
        let document = self.attachments.fetch(&job.id, source).await?;

        let result = connection.send(&job.target, document.content()).await;
        self.attachments.schedule_cleanup(&job.id, document.path);
        result.map_err(DispatchError::from)
    }
}

#[async_trait]
impl JobExecutor for SessionJobExecutor {
    async fn execute(&self, job: &Job) -> Result<(), DispatchError> {
        let connection = self
            .sessions
            .connection(&job.session)
            .ok_or_else(|| DispatchError::SessionUnavailable(job.session.clone()))?;

        let content = match &job.payload {
            JobPayload::Text { text } => OutboundContent::Text { text: text.clone() },
            JobPayload::Document(source) => {
                return self.send_document(job, connection.as_ref(), source).await;
            }
            JobPayload::Poll {
                question,
                options,
                max_answers,
            } => OutboundContent::Poll {
                name: question.clone(),
                values: options.clone(),
                selectable_count: *max_answers,
            },
            JobPayload::Button {
                text,
                url,
                button_text,
            } => OutboundContent::Button {
                text: text.clone(),
                footer: BUTTON_FOOTER.to_string(),
                url: url.clone(),
                display_text: button_text.clone(),
            },
        };

        connection.send(&job.target, content).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    use std::io;
    use std::sync::Mutex;

    use tempfile::TempDir;
    use tokio_util::sync::CancellationToken;
    use tracing_subscriber::fmt::writer::MakeWriter;

    use crate::attachment::tests::{PDF_BYTES, pipeline, spawn_fixture_server};
    use crate::backend::ConnectionEvent;
    use crate::dispatch::DispatchQueue;
    use crate::session::SessionState;
    use crate::session::manager::tests::{FakeBackend, FakeConnection, Link, MemoryCredentialStore};

    /// Collects formatted log lines for assertions.
    #[derive(Clone, Default)]
    struct LogCapture {
        buf: Arc<Mutex<Vec<u8>>>,
    }

    impl LogCapture {
        fn contents(&self) -> String {
            String::from_utf8_lossy(&self.buf.lock().unwrap()).to_string()
        }
    }

    struct LogCaptureWriter {
        buf: Arc<Mutex<Vec<u8>>>,
    }

    impl<'a> MakeWriter<'a> for LogCapture {
        type Writer = LogCaptureWriter;

        fn make_writer(&'a self) -> Self::Writer {
            LogCaptureWriter {
                buf: Arc::clone(&self.buf),
            }
        }
    }

    impl io::Write for LogCaptureWriter {
        fn write(&mut self, data: &[u8]) -> io::Result<usize> {
            self.buf.lock().unwrap().extend_from_slice(data);
            Ok(data.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    async fn ready_session(name: &str, temp: &TempDir) -> (SessionManager, Link, SessionJobExecutor) {
        let (backend, mut links) = FakeBackend::new(0);
        let manager = SessionManager::new(
            vec![name.to_string()],
            backend,
            Arc::new(MemoryCredentialStore::default()),
            Duration::from_secs(5),
        );
        manager.start(name).await.unwrap();
        let link = links.recv().await.unwrap();
        link.events
            .send(ConnectionEvent::Opened { self_id: None })
            .await
            .unwrap();
        for _ in 0..1000 {
            if manager.is_ready(name) {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert_eq!(manager.status(name).unwrap().state, SessionState::Ready);

        let executor = SessionJobExecutor::new(manager.clone(), pipeline(temp.path(), 50));
        (manager, link, executor)
    }

    fn job(session: &str, payload: JobPayload) -> Job {
        Job {
            id: "01jtestjob".to_string(),
            session: session.to_string(),
            target: "62811@s.whatsapp.net".to_string(),
            payload,
            enqueued_at: chrono::Utc::now(),
        }
    }

    fn sent(connection: &FakeConnection) -> Vec<(String, OutboundContent)> {
        connection.sent.lock().unwrap().clone()
    }

    #[tokio::test(flavor = "current_thread")]
    async fn queued_text_is_sent_exactly_once() {
        let logs = LogCapture::default();
        let subscriber = tracing_subscriber::fmt()
            .with_ansi(false)
            .without_time()
            .with_writer(logs.clone())
            .finish();
        let _guard = tracing::subscriber::set_default(subscriber);

        let tmp = TempDir::new().unwrap();
        let (manager, link, executor) = ready_session("upb", &tmp).await;

        let (queue, worker) = DispatchQueue::new(Duration::from_millis(10));
        let id = queue
            .enqueue(
                "upb",
                "62811@s.whatsapp.net",
                JobPayload::Text {
                    text: "hello".to_string(),
                },
            )
            .unwrap();
        assert!(!id.is_empty());
        drop(queue);
        worker
            .run(Arc::new(executor), CancellationToken::new())
            .await;

        assert_eq!(
            sent(&link.connection),
            vec![(
                "62811@s.whatsapp.net".to_string(),
                OutboundContent::Text {
                    text: "hello".to_string()
                }
            )]
        );

        let output = logs.contents();
        let delivered: Vec<&str> = output
            .lines()
            .filter(|line| line.contains("Job delivered"))
            .collect();
        assert_eq!(delivered.len(), 1, "{}", output);
        assert!(delivered[0].contains(r#"status="SENT""#), "{}", delivered[0]);
        assert!(delivered[0].contains(&format!("job_id={}", id)), "{}", delivered[0]);
        assert!(delivered[0].contains("wa=upb"), "{}", delivered[0]);
        assert!(output.contains(r#"status="QUEUE_STARTED""#));
        manager.shutdown().await;
    }

    #[tokio::test]
    async fn poll_and_button_map_to_backend_content() {
        let tmp = TempDir::new().unwrap();
        let (_manager, link, executor) = ready_session("upb", &tmp).await;

        executor
            .execute(&job(
                "upb",
                JobPayload::Poll {
                    question: "Lunch?".to_string(),
                    options: vec!["Rice".to_string(), "Noodles".to_string()],
                    max_answers: 1,
                },
            ))
            .await
            .unwrap();
        executor
            .execute(&job(
                "upb",
                JobPayload::Button {
                    text: "Open the portal".to_string(),
                    url: "https://example.com".to_string(),
                    button_text: "Open".to_string(),
                },
            ))
            .await
            .unwrap();

        let sent = sent(&link.connection);
        assert_eq!(
            sent[0].1,
            OutboundContent::Poll {
                name: "Lunch?".to_string(),
                values: vec!["Rice".to_string(), "Noodles".to_string()],
                selectable_count: 1,
            }
        );
        assert_eq!(
            sent[1].1,
            OutboundContent::Button {
                text: "Open the portal".to_string(),
                footer: BUTTON_FOOTER.to_string(),
                url: "https://example.com".to_string(),
                display_text: "Open".to_string(),
            }
        );
    }

    #[tokio::test]
    async fn unknown_session_fails_without_sending() {
        let tmp = TempDir::new().unwrap();
        let (_manager, link, executor) = ready_session("upb", &tmp).await;

        let result = executor
            .execute(&job(
                "ghost",
                JobPayload::Text {
                    text: "hi".to_string(),
                },
            ))
            .await;
        assert!(matches!(result, Err(DispatchError::SessionUnavailable(name)) if name == "ghost"));
        assert!(sent(&link.connection).is_empty());
    }

    #[tokio::test]
    async fn document_is_downloaded_sent_and_cleaned_up() {
        let base = spawn_fixture_server().await;
        let tmp = TempDir::new().unwrap();
        let (_manager, link, executor) = ready_session("upb", &tmp).await;

        executor
            .execute(&job(
                "upb",
                JobPayload::Document(RemoteDocument {
                    url: format!("{}/doc.pdf", base),
                    caption: Some("Report".to_string()),
                    file_name: None,
                }),
            ))
            .await
            .unwrap();

        let sent = sent(&link.connection);
        assert_eq!(sent.len(), 1);
        match &sent[0].1 {
            OutboundContent::Document {
                data,
                mimetype,
                file_name,
                caption,
            } => {
                assert_eq!(data.as_ref(), PDF_BYTES);
                assert_eq!(mimetype, "application/pdf");
                assert_eq!(file_name, "01jtestjob.pdf");
                assert_eq!(caption, "Report");
            }
            other => panic!("unexpected content {:?}", other),
        }

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(!tmp.path().join("01jtestjob.pdf").exists());
    }

    #[tokio::test]
    async fn empty_document_is_never_sent() {
        let base = spawn_fixture_server().await;
        let tmp = TempDir::new().unwrap();
        let (_manager, link, executor) = ready_session("upb", &tmp).await;

        let result = executor
            .execute(&job(
                "upb",
                JobPayload::Document(RemoteDocument {
                    url: format!("{}/empty", base),
                    caption: None,
                    file_name: None,
                }),
            ))
            .await;

        assert!(matches!(
            result,
            Err(DispatchError::Attachment(crate::attachment::AttachmentError::Empty))
        ));
        assert!(sent(&link.connection).is_empty());
    }

    #[tokio::test]
    async fn untyped_document_is_never_sent() {
        let base = spawn_fixture_server().await;
        let tmp = TempDir::new().unwrap();
        let (_manager, link, executor) = ready_session("upb", &tmp).await;

        let result = executor
            .execute(&job(
                "upb",
                JobPayload::Document(RemoteDocument {
                    url: format!("{}/untyped", base),
                    caption: None,
                    file_name: None,
                }),
            ))
            .await;

        assert!(result.is_err());
        assert!(sent(&link.connection).is_empty());
    }
}
