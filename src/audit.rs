//! Audit logging for lexrag
//!
//! Structured JSONL events for pipeline outcomes: ingests, chat turns, and
//! gate blocks. Complements the record tables with an append-only trail.
//!
//! Features:
//! - One JSON object per line
//! - Automatic rotation (max 5MB per file, keep 5 files)
//! - Thread-safe writes
//! - No-op when constructed without a directory (tests, dry runs)

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::PathBuf;
use std::sync::Mutex;

/// Maximum size for a single log file (5MB)
const MAX_LOG_SIZE: u64 = 5 * 1024 * 1024;

/// Number of rotated log files to keep
const MAX_LOG_FILES: usize = 5;

const AUDIT_LOG_NAME: &str = "audit.log";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuditSeverity {
    Info,
    Warning,
    Error,
}

/// One audit event. `detail` carries event-specific structured payload;
/// secrets and raw model output never go in here.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEvent {
    pub timestamp: String,
    pub severity: AuditSeverity,
    pub event_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kb_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_id: Option<String>,
    pub detail: serde_json::Value,
}

impl AuditEvent {
    pub fn new(severity: AuditSeverity, event_type: &str, detail: serde_json::Value) -> Self {
        Self {
            timestamp: Utc::now().to_rfc3339(),
            severity,
            event_type: event_type.to_string(),
            kb_id: None,
            message_id: None,
            file_id: None,
            detail,
        }
    }

    pub fn with_kb(mut self, kb_id: &str) -> Self {
        self.kb_id = Some(kb_id.to_string());
        self
    }

    pub fn with_message(mut self, message_id: &str) -> Self {
        self.message_id = Some(message_id.to_string());
        self
    }

    pub fn with_file(mut self, file_id: &str) -> Self {
        self.file_id = Some(file_id.to_string());
        self
    }
}

/// Append-only audit log with rotation
pub struct AuditLog {
    path: Option<PathBuf>,
    write_lock: Mutex<()>,
}

impl AuditLog {
    /// Audit log in the given directory
    pub fn new(dir: PathBuf) -> Self {
        Self {
            path: Some(dir.join(AUDIT_LOG_NAME)),
            write_lock: Mutex::new(()),
        }
    }

    /// No-op log (tests, dry runs)
    pub fn disabled() -> Self {
        Self {
            path: None,
            write_lock: Mutex::new(()),
        }
    }

    pub fn log(&self, event: AuditEvent) {
        let Some(path) = &self.path else {
            return;
        };
        let Ok(line) = serde_json::to_string(&event) else {
            return;
        };

        let _guard = self.write_lock.lock().unwrap_or_else(|e| e.into_inner());

        if let Err(e) = self.rotate_if_needed(path) {
            tracing::warn!("audit log rotation failed: {}", e);
        }

        let result = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .and_then(|mut file| writeln!(file, "{}", line));
        if let Err(e) = result {
            tracing::warn!("audit log write failed: {}", e);
        }
    }

    fn rotate_if_needed(&self, path: &PathBuf) -> std::io::Result<()> {
        let size = match fs::metadata(path) {
            Ok(meta) => meta.len(),
            Err(_) => return Ok(()),
        };
        if size < MAX_LOG_SIZE {
            return Ok(());
        }

        // Shift audit.log.N -> audit.log.N+1, dropping the oldest
        for i in (1..MAX_LOG_FILES).rev() {
            let from = path.with_extension(format!("log.{}", i));
            let to = path.with_extension(format!("log.{}", i + 1));
            if from.exists() {
                if i + 1 > MAX_LOG_FILES - 1 {
                    let _ = fs::remove_file(&from);
                } else {
                    let _ = fs::rename(&from, &to);
                }
            }
        }
        fs::rename(path, path.with_extension("log.1"))?;
        Ok(())
    }

    // ── Event constructors ───────────────────────────────────────────────────

    pub fn ingest_completed(
        &self,
        kb_id: &str,
        file_id: &str,
        status: &str,
        node_count: usize,
        short_circuited: bool,
    ) {
        self.log(
            AuditEvent::new(
                AuditSeverity::Info,
                "ingest_completed",
                serde_json::json!({
                    "status": status,
                    "node_count": node_count,
                    "short_circuited": short_circuited,
                }),
            )
            .with_kb(kb_id)
            .with_file(file_id),
        );
    }

    pub fn chat_completed(&self, kb_id: &str, message_id: &str, status: &str) {
        self.log(
            AuditEvent::new(
                AuditSeverity::Info,
                "chat_completed",
                serde_json::json!({ "status": status }),
            )
            .with_kb(kb_id)
            .with_message(message_id),
        );
    }

    pub fn gate_blocked(&self, kb_id: &str, message_id: &str, stage: &str, reasons: &[String]) {
        self.log(
            AuditEvent::new(
                AuditSeverity::Warning,
                "gate_blocked",
                serde_json::json!({ "stage": stage, "reasons": reasons }),
            )
            .with_kb(kb_id)
            .with_message(message_id),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_disabled_log_is_noop() {
        let log = AuditLog::disabled();
        log.chat_completed("kb", "msg", "success");
        // Nothing to assert beyond not panicking
    }

    #[test]
    fn test_events_are_written_as_json_lines() {
        let dir = tempfile::tempdir().unwrap();
        let log = AuditLog::new(dir.path().to_path_buf());
        log.ingest_completed("kb-1", "file-1", "success", 12, false);
        log.gate_blocked("kb-1", "msg-1", "retrieval", &["no_evidence".into()]);

        let content = fs::read_to_string(dir.path().join(AUDIT_LOG_NAME)).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 2);

        let first: AuditEvent = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(first.event_type, "ingest_completed");
        assert_eq!(first.kb_id.as_deref(), Some("kb-1"));
        assert_eq!(first.detail["node_count"], serde_json::json!(12));

        let second: AuditEvent = serde_json::from_str(lines[1]).unwrap();
        assert_eq!(second.severity, AuditSeverity::Warning);
        assert_eq!(second.detail["reasons"][0], "no_evidence");
    }

    #[test]
    fn test_rotation_keeps_bounded_files() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(AUDIT_LOG_NAME);
        // Pre-fill beyond the limit so the next write rotates
        std::fs::write(&path, vec![b'x'; (MAX_LOG_SIZE + 1) as usize]).unwrap();

        let log = AuditLog::new(dir.path().to_path_buf());
        log.chat_completed("kb", "msg", "success");

        assert!(path.exists());
        assert!(dir.path().join("audit.log.1").exists());
        let content = fs::read_to_string(&path).unwrap();
        assert_eq!(content.lines().count(), 1);
    }
}
