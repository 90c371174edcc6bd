use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::status::{ServerStats, WorkerStats};
use crate::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Master,
    Worker,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskHeader {
    pub task_id: Uuid,
    pub filename: String,
    pub mime_type: String,
    pub size: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadResult {
    pub filename: String,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl UploadResult {
    pub fn succeeded(filename: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            filename: filename.into(),
            success: true,
            url: Some(url.into()),
            error: None,
        }
    }

    pub fn failed(filename: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            filename: filename.into(),
            success: false,
            url: None,
            error: Some(error.into()),
        }
    }
}

/// Aggregated session progress as seen by the master.
///
/// `completed + failed` never decreases over the life of a session.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadProgress {
    pub completed: u64,
    pub failed: u64,
    pub total: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_file: Option<String>,
    /// Pause length in milliseconds while the origin is rate limiting.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub waiting_for: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wait_start: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub waiting_worker_id: Option<Uuid>,
}

impl UploadProgress {
    pub fn finished(&self) -> u64 {
        self.completed + self.failed
    }
}

/// JSON text frame discriminated by `type`. `task` and `assign` headers are
/// each followed by exactly one binary frame carrying the payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum Message {
    Register {
        role: Role,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        session_id: Option<Uuid>,
    },
    Registered {
        assigned_id: Uuid,
        session_id: Uuid,
        server_stats: ServerStats,
    },
    SubmitTasks {
        tasks: Vec<TaskHeader>,
    },
    Task(TaskHeader),
    TasksSubmitted {
        count: usize,
        total_pending: usize,
    },
    Assign(TaskHeader),
    TaskResult {
        task_id: Uuid,
        result: UploadResult,
        stats: WorkerStats,
    },
    Progress {
        task_id: Uuid,
        result: UploadResult,
        progress: UploadProgress,
    },
    RateLimitHit {
        task_id: Uuid,
        retry_after_ms: u64,
    },
    Waiting {
        progress: UploadProgress,
    },
    SessionComplete {
        progress: UploadProgress,
    },
    Heartbeat,
    GetStats,
    Stats {
        server_stats: ServerStats,
    },
    DisconnectNotice {
        reason: String,
    },
    Error {
        message: String,
    },
}

impl Message {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Register { .. } => "register",
            Self::Registered { .. } => "registered",
            Self::SubmitTasks { .. } => "submitTasks",
            Self::Task(_) => "task",
            Self::TasksSubmitted { .. } => "tasksSubmitted",
            Self::Assign(_) => "assign",
            Self::TaskResult { .. } => "taskResult",
            Self::Progress { .. } => "progress",
            Self::RateLimitHit { .. } => "rateLimitHit",
            Self::Waiting { .. } => "waiting",
            Self::SessionComplete { .. } => "sessionComplete",
            Self::Heartbeat => "heartbeat",
            Self::GetStats => "getStats",
            Self::Stats { .. } => "stats",
            Self::DisconnectNotice { .. } => "disconnectNotice",
            Self::Error { .. } => "error",
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::Error {
            message: message.into(),
        }
    }

    pub fn encode(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Parses a text frame. Anything that is not a known message is a
    /// protocol error.
    pub fn decode(text: &str) -> Result<Self> {
        serde_json::from_str(text).map_err(|e| Error::protocol(format!("malformed message: {e}")))
    }
}

/// Pairs a payload header with the binary frame that must follow it.
#[derive(Debug, Default)]
pub struct PayloadAssembler {
    pending: Option<TaskHeader>,
}

impl PayloadAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn expect_payload(&mut self, header: TaskHeader) -> Result<()> {
        if let Some(prev) = &self.pending {
            return Err(Error::protocol(format!(
                "header for task {} received while payload for task {} is outstanding",
                header.task_id, prev.task_id
            )));
        }
        self.pending = Some(header);
        Ok(())
    }

    /// A text frame between a header and its payload breaks the pairing.
    pub fn check_text_allowed(&self, kind: &str) -> Result<()> {
        match &self.pending {
            Some(h) => Err(Error::protocol(format!(
                "{kind} received while payload for task {} is outstanding",
                h.task_id
            ))),
            None => Ok(()),
        }
    }

    pub fn accept_binary(&mut self, bytes: Vec<u8>) -> Result<(TaskHeader, Vec<u8>)> {
        let header = self
            .pending
            .take()
            .ok_or_else(|| Error::protocol("binary frame without a preceding task header"))?;
        if header.size != bytes.len() as u64 {
            return Err(Error::protocol(format!(
                "payload for task {} is {} bytes, header declared {}",
                header.task_id,
                bytes.len(),
                header.size
            )));
        }
        Ok((header, bytes))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header(size: u64) -> TaskHeader {
        TaskHeader {
            task_id: Uuid::new_v4(),
            filename: "a.png".to_string(),
            mime_type: "image/png".to_string(),
            size,
        }
    }

    #[test]
    fn task_header_matches_wire_shape() {
        let h = header(3);
        let v = serde_json::to_value(Message::Task(h.clone())).unwrap();
        assert_eq!(v["type"], "task");
        assert_eq!(v["taskId"], h.task_id.to_string());
        assert_eq!(v["filename"], "a.png");
        assert_eq!(v["mimeType"], "image/png");
        assert_eq!(v["size"], 3);
    }

    #[test]
    fn rate_limit_hit_uses_camel_case_fields() {
        let text = format!(
            r#"{{"type":"rateLimitHit","taskId":"{}","retryAfterMs":1500}}"#,
            Uuid::nil()
        );
        let msg = Message::decode(&text).unwrap();
        assert_eq!(
            msg,
            Message::RateLimitHit {
                task_id: Uuid::nil(),
                retry_after_ms: 1500
            }
        );
    }

    #[test]
    fn unknown_type_is_protocol_error() {
        let err = Message::decode(r#"{"type":"WORKER_REGISTER"}"#).unwrap_err();
        assert!(matches!(err, Error::Protocol { .. }));
        let err = Message::decode("not json").unwrap_err();
        assert!(matches!(err, Error::Protocol { .. }));
    }

    #[test]
    fn register_without_session_id_decodes() {
        let msg = Message::decode(r#"{"type":"register","role":"worker"}"#).unwrap();
        assert_eq!(
            msg,
            Message::Register {
                role: Role::Worker,
                session_id: None
            }
        );
        assert_eq!(msg.kind(), "register");
    }

    #[test]
    fn unit_messages_carry_only_type() {
        assert_eq!(Message::Heartbeat.encode().unwrap(), r#"{"type":"heartbeat"}"#);
        assert_eq!(
            Message::decode(r#"{"type":"getStats"}"#).unwrap(),
            Message::GetStats
        );
    }

    #[test]
    fn assembler_pairs_header_with_next_binary_frame() {
        let mut asm = PayloadAssembler::new();
        let h = header(4);
        asm.expect_payload(h.clone()).unwrap();
        assert!(asm.check_text_allowed("heartbeat").is_err());

        let (got, bytes) = asm.accept_binary(vec![1, 2, 3, 4]).unwrap();
        assert_eq!(got, h);
        assert_eq!(bytes, vec![1, 2, 3, 4]);
        assert!(asm.check_text_allowed("heartbeat").is_ok());
    }

    #[test]
    fn assembler_rejects_orphan_frames_and_double_headers() {
        let mut asm = PayloadAssembler::new();
        assert!(asm.accept_binary(vec![0]).is_err());

        asm.expect_payload(header(1)).unwrap();
        assert!(asm.expect_payload(header(1)).is_err());
    }

    #[test]
    fn assembler_rejects_size_mismatch() {
        let mut asm = PayloadAssembler::new();
        asm.expect_payload(header(10)).unwrap();
        let err = asm.accept_binary(vec![0; 9]).unwrap_err();
        assert!(matches!(err, Error::Protocol { .. }));
        assert!(asm.check_text_allowed("heartbeat").is_ok());
    }
}
