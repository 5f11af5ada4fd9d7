//! Per-connection protocol engine: control frames arm uploads, binary frames
//! complete them.

use std::path::PathBuf;
use std::sync::Arc;

use metrics::counter;
use tracing::{debug, info, warn};

use super::connection::Connection;
use super::messages::{ControlMessage, StatusReply};
use super::session::{UploadError, UploadSession};
use crate::metrics::{PROTOCOL_ERRORS_TOTAL, UPLOAD_BYTES_TOTAL, UPLOAD_ERRORS_TOTAL, UPLOADS_TOTAL};

/// Reply to `{"type":"test"}`.
pub const TEST_RECEIVED: &str = "Test message received";
/// Reply when the destination for an upload cannot be opened.
pub const FAILED_TO_WRITE_FILE: &str = "Failed to write file";
/// Reply to a binary frame with no upload armed.
pub const METADATA_NOT_RECEIVED: &str = "Metadata not received yet";
/// Reply when writing the payload fails.
pub const FAILED_TO_WRITE_VIDEO: &str = "Failed to write video data";
/// Reply after a payload has been stored.
pub const VIDEO_UPLOADED: &str = "Video uploaded successfully";

/// Handles one connection's inbound frames, in arrival order.
pub struct ProtocolEngine {
    connection: Arc<Connection>,
    upload_dir: PathBuf,
    session: UploadSession,
}

impl ProtocolEngine {
    /// Create an engine with an idle upload session.
    pub fn new(connection: Arc<Connection>, upload_dir: PathBuf) -> Self {
        Self {
            connection,
            upload_dir,
            session: UploadSession::Idle,
        }
    }

    /// Whether an upload is armed and waiting for its payload.
    pub fn is_armed(&self) -> bool {
        self.session.is_armed()
    }

    /// Handle a text frame. `None` means no reply is sent.
    pub async fn handle_text(&mut self, text: &str) -> Option<StatusReply> {
        let message = match ControlMessage::parse(text) {
            Ok(message) => message,
            Err(err) => {
                debug!(conn_id = %self.connection.id, error = ?err, "rejected control frame");
                counter!(PROTOCOL_ERRORS_TOTAL, "kind" => err.kind()).increment(1);
                return Some(StatusReply::error(err.to_string()));
            }
        };

        match message {
            ControlMessage::ClientInfo { client_name } => {
                if let Some(name) = client_name {
                    info!(conn_id = %self.connection.id, client_name = %name, "client identified");
                    self.connection.set_client_name(name);
                }
                None
            }
            ControlMessage::Test => Some(StatusReply::success(TEST_RECEIVED)),
            ControlMessage::Upload(metadata) => {
                let filename = metadata.filename.clone();
                match self.session.arm(&self.upload_dir, metadata).await {
                    Ok(()) => {
                        debug!(conn_id = %self.connection.id, %filename, "upload armed");
                        None
                    }
                    Err(err) => {
                        warn!(conn_id = %self.connection.id, %filename, error = %err, "cannot open upload destination");
                        counter!(UPLOAD_ERRORS_TOTAL, "kind" => err.kind()).increment(1);
                        Some(StatusReply::error(FAILED_TO_WRITE_FILE))
                    }
                }
            }
        }
    }

    /// Handle a binary frame: the payload of the armed upload.
    pub async fn handle_binary(&mut self, payload: &[u8]) -> StatusReply {
        match self.session.consume(payload).await {
            Ok(done) => {
                info!(
                    conn_id = %self.connection.id,
                    filename = %done.filename,
                    bytes = done.size,
                    "upload complete"
                );
                counter!(UPLOADS_TOTAL).increment(1);
                counter!(UPLOAD_BYTES_TOTAL).increment(done.size);
                self.connection.record_upload(done);
                StatusReply::success(VIDEO_UPLOADED)
            }
            Err(UploadError::NotArmed) => {
                debug!(conn_id = %self.connection.id, bytes = payload.len(), "payload without metadata dropped");
                counter!(UPLOAD_ERRORS_TOTAL, "kind" => UploadError::NotArmed.kind()).increment(1);
                StatusReply::error(METADATA_NOT_RECEIVED)
            }
            Err(err) => {
                warn!(conn_id = %self.connection.id, error = %err, "upload write failed");
                counter!(UPLOAD_ERRORS_TOTAL, "kind" => err.kind()).increment(1);
                StatusReply::error(FAILED_TO_WRITE_VIDEO)
            }
        }
    }

    /// Abandon any armed upload. Called once when the connection ends.
    pub fn finish(&mut self) {
        if let Some(path) = self.session.abandon() {
            info!(conn_id = %self.connection.id, path = %path.display(), "upload left unfinished at disconnect");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::websocket::connection::tests::connected;
    use crate::websocket::messages::ReplyStatus;

    fn engine(dir: &std::path::Path) -> (ProtocolEngine, Arc<Connection>) {
        let (conn, _frames) = connected("e0000001");
        (ProtocolEngine::new(Arc::clone(&conn), dir.join("uploads")), conn)
    }

    #[tokio::test]
    async fn test_message_replies_success() {
        let dir = tempfile::tempdir().unwrap();
        let (mut engine, _conn) = engine(dir.path());
        let reply = engine.handle_text(r#"{"type":"test"}"#).await.unwrap();
        assert_eq!(reply, StatusReply::success(TEST_RECEIVED));
    }

    #[tokio::test]
    async fn client_info_sets_name_silently() {
        let dir = tempfile::tempdir().unwrap();
        let (mut engine, conn) = engine(dir.path());
        let reply = engine
            .handle_text(r#"{"type":"clientInfo","clientName":"Dock Cam"}"#)
            .await;
        assert!(reply.is_none());
        assert_eq!(conn.client_name().as_deref(), Some("Dock Cam"));
    }

    #[tokio::test]
    async fn protocol_errors_reply_and_continue() {
        let dir = tempfile::tempdir().unwrap();
        let (mut engine, _conn) = engine(dir.path());
        assert_eq!(
            engine.handle_text("not json").await,
            Some(StatusReply::error("Invalid JSON"))
        );
        assert_eq!(
            engine.handle_text(r#"{"type":"upload"}"#).await,
            Some(StatusReply::error("Invalid upload metadata"))
        );
        assert_eq!(
            engine.handle_text(r#"{"type":"bogus"}"#).await,
            Some(StatusReply::error("Unknown message type"))
        );
        assert!(!engine.is_armed());
    }

    #[tokio::test]
    async fn binary_before_metadata_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let (mut engine, conn) = engine(dir.path());
        let reply = engine.handle_binary(&[1, 2, 3]).await;
        assert_eq!(reply, StatusReply::error(METADATA_NOT_RECEIVED));
        assert!(conn.last_upload().is_none());
        assert!(!dir.path().join("uploads").exists());
    }

    #[tokio::test]
    async fn upload_then_binary_stores_file() {
        let dir = tempfile::tempdir().unwrap();
        let (mut engine, conn) = engine(dir.path());

        assert!(engine
            .handle_text(r#"{"type":"upload","filename":"a.mp4","filesize":3,"mimetype":"video/mp4"}"#)
            .await
            .is_none());
        assert!(engine.is_armed());

        let reply = engine.handle_binary(&[0, 1, 2]).await;
        assert_eq!(reply.status, ReplyStatus::Success);
        assert_eq!(reply.message, VIDEO_UPLOADED);
        assert_eq!(
            std::fs::read(dir.path().join("uploads").join("a.mp4")).unwrap(),
            vec![0, 1, 2]
        );

        let last = conn.last_upload().unwrap();
        assert_eq!(last.filename, "a.mp4");
        assert_eq!(last.size, 3);

        // Session is idle again.
        assert_eq!(
            engine.handle_binary(&[9]).await,
            StatusReply::error(METADATA_NOT_RECEIVED)
        );
    }

    #[tokio::test]
    async fn recorded_size_is_payload_length_not_declared() {
        let dir = tempfile::tempdir().unwrap();
        let (mut engine, conn) = engine(dir.path());
        let _ = engine
            .handle_text(r#"{"type":"upload","filename":"b.mp4","filesize":999}"#)
            .await;
        let _ = engine.handle_binary(b"four").await;
        assert_eq!(conn.last_upload().unwrap().size, 4);
    }

    #[tokio::test]
    async fn traversal_filename_fails_to_open() {
        let dir = tempfile::tempdir().unwrap();
        let (mut engine, _conn) = engine(dir.path());
        let reply = engine
            .handle_text(r#"{"type":"upload","filename":"../escape.mp4"}"#)
            .await;
        assert_eq!(reply, Some(StatusReply::error(FAILED_TO_WRITE_FILE)));
        assert!(!engine.is_armed());
        assert!(!dir.path().join("escape.mp4").exists());
    }

    #[tokio::test]
    async fn empty_filename_fails_to_open() {
        let dir = tempfile::tempdir().unwrap();
        let (mut engine, _conn) = engine(dir.path());
        let reply = engine.handle_text(r#"{"type":"upload","filename":""}"#).await;
        assert_eq!(reply, Some(StatusReply::error(FAILED_TO_WRITE_FILE)));
        assert!(!engine.is_armed());
    }

    #[tokio::test]
    async fn legacy_metadata_arms_upload() {
        let dir = tempfile::tempdir().unwrap();
        let (mut engine, _conn) = engine(dir.path());
        assert!(engine.handle_text(r#"{"filename":"legacy.mp4"}"#).await.is_none());
        assert!(engine.is_armed());
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn write_failure_replies_and_returns_to_idle() {
        let dir = tempfile::tempdir().unwrap();
        let uploads = dir.path().join("uploads");
        std::fs::create_dir_all(&uploads).unwrap();
        std::os::unix::fs::symlink("/dev/full", uploads.join("full.mp4")).unwrap();
        let (mut engine, conn) = engine(dir.path());

        assert!(engine
            .handle_text(r#"{"type":"upload","filename":"full.mp4"}"#)
            .await
            .is_none());
        assert!(engine.is_armed());

        let reply = engine.handle_binary(&[0u8; 4096]).await;
        assert_eq!(reply, StatusReply::error(FAILED_TO_WRITE_VIDEO));
        assert!(!engine.is_armed());
        assert!(conn.last_upload().is_none());

        // The next payload needs fresh metadata.
        assert_eq!(
            engine.handle_binary(&[1]).await,
            StatusReply::error(METADATA_NOT_RECEIVED)
        );
    }

    #[tokio::test]
    async fn finish_abandons_armed_upload() {
        let dir = tempfile::tempdir().unwrap();
        let (mut engine, conn) = engine(dir.path());
        let _ = engine
            .handle_text(r#"{"type":"upload","filename":"partial.mp4"}"#)
            .await;
        engine.finish();
        assert!(!engine.is_armed());
        assert!(conn.last_upload().is_none());
        assert!(dir.path().join("uploads").join("partial.mp4").exists());
    }
}
