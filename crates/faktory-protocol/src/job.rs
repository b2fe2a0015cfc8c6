//! Job descriptors and job-lifecycle payloads.
//!
//! A [`Job`] is the unit of work submitted with `PUSH` and returned by
//! `FETCH`.  Beyond the required fields, callers may attach arbitrary
//! JSON keys; these pass through the client opaquely in both directions
//! (the server also adds its own fields to fetched jobs, e.g.
//! `created_at`, `enqueued_at`).

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Upper bound on backtrace lines transmitted with `FAIL`.
pub const MAX_BACKTRACE_LINES: usize = 100;

/// A background job: required `jobtype`, `queue`, and `args`, an optional
/// `jid` (assigned on push when absent), and opaque pass-through fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    /// Unique job id.  Left `None` by callers who want one generated.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub jid: Option<String>,
    pub jobtype: String,
    pub queue: String,
    pub args: Vec<serde_json::Value>,
    /// Caller- or server-supplied fields carried verbatim.
    #[serde(flatten)]
    pub custom: serde_json::Map<String, serde_json::Value>,
}

impl Job {
    /// A job on the `default` queue with no jid assigned yet.
    pub fn new(jobtype: impl Into<String>, args: Vec<serde_json::Value>) -> Self {
        Job {
            jid: None,
            jobtype: jobtype.into(),
            queue: "default".to_owned(),
            args,
            custom: serde_json::Map::new(),
        }
    }

    pub fn on_queue(mut self, queue: impl Into<String>) -> Self {
        self.queue = queue.into();
        self
    }

    pub fn with_jid(mut self, jid: impl Into<String>) -> Self {
        self.jid = Some(jid.into());
        self
    }

    /// Attach a pass-through field (e.g. `retry`, `priority`, or
    /// application metadata).
    pub fn with_custom(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.custom.insert(key.into(), value);
        self
    }
}

/// Generate a fresh job id (UUID v4).
pub fn generate_jid() -> String {
    Uuid::new_v4().to_string()
}

/// Failure details reported with `FAIL`.
///
/// The backtrace is truncated to [`MAX_BACKTRACE_LINES`] on the wire; the
/// in-memory value is left untouched.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Fail {
    pub errtype: String,
    pub message: String,
    #[serde(default)]
    pub backtrace: Vec<String>,
}

impl Fail {
    pub fn new(errtype: impl Into<String>, message: impl Into<String>) -> Self {
        Fail {
            errtype: errtype.into(),
            message: message.into(),
            backtrace: Vec::new(),
        }
    }

    pub fn with_backtrace(mut self, lines: Vec<String>) -> Self {
        self.backtrace = lines;
        self
    }

    /// The JSON object transmitted as the `FAIL` argument.
    pub fn wire_payload(&self, jid: &str) -> serde_json::Value {
        let backtrace = &self.backtrace[..self.backtrace.len().min(MAX_BACKTRACE_LINES)];
        serde_json::json!({
            "jid": jid,
            "errtype": self.errtype,
            "message": self.message,
            "backtrace": backtrace,
        })
    }
}

/// Server verdict on a `BEAT`.
///
/// A plain `+OK` means keep working; a bulk reply carries a `state` field
/// instructing the worker to quiet down (finish in-flight work, fetch no
/// more) or terminate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BeatState {
    Ok,
    Quiet,
    Terminate,
}

impl BeatState {
    /// Map the `state` field of a bulk BEAT reply.  Unknown values return
    /// `None`; callers surface those as protocol errors.
    pub fn from_state(state: &str) -> Option<Self> {
        match state {
            "quiet" => Some(BeatState::Quiet),
            "terminate" => Some(BeatState::Terminate),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_job_defaults_to_default_queue_without_jid() {
        let job = Job::new("testJob", vec![serde_json::json!(7)]);
        assert_eq!(job.queue, "default");
        assert!(job.jid.is_none());
    }

    #[test]
    fn job_serializes_without_jid_key_when_absent() {
        let job = Job::new("t", vec![]);
        let json = serde_json::to_string(&job).unwrap();
        assert!(!json.contains("\"jid\""));
    }

    #[test]
    fn custom_fields_flatten_into_the_top_level_object() {
        let job = Job::new("t", vec![])
            .with_custom("retry", serde_json::json!(3))
            .with_custom("priority", serde_json::json!(9));
        let value = serde_json::to_value(&job).unwrap();
        assert_eq!(value["retry"], 3);
        assert_eq!(value["priority"], 9);
    }

    #[test]
    fn fetched_job_keeps_server_fields_in_custom() {
        let wire = r#"{
            "jid": "abc123def",
            "jobtype": "testJob",
            "queue": "q-abc123",
            "args": [7],
            "created_at": "2026-01-01T00:00:00Z",
            "enqueued_at": "2026-01-01T00:00:01Z"
        }"#;
        let job: Job = serde_json::from_str(wire).unwrap();
        assert_eq!(job.jid.as_deref(), Some("abc123def"));
        assert_eq!(job.args, vec![serde_json::json!(7)]);
        assert_eq!(job.custom["created_at"], "2026-01-01T00:00:00Z");
    }

    #[test]
    fn generated_jid_is_long_enough() {
        let jid = generate_jid();
        assert!(jid.len() >= 8, "jid '{jid}' too short");
        assert_ne!(generate_jid(), jid);
    }

    #[test]
    fn fail_payload_truncates_backtrace_to_limit() {
        let lines: Vec<String> = (0..250).map(|i| format!("frame {i}")).collect();
        let fail = Fail::new("RuntimeError", "EHANGRY").with_backtrace(lines);
        let payload = fail.wire_payload("jid-1");
        assert_eq!(
            payload["backtrace"].as_array().unwrap().len(),
            MAX_BACKTRACE_LINES
        );
        assert_eq!(payload["backtrace"][0], "frame 0");
        assert_eq!(payload["jid"], "jid-1");
    }

    #[test]
    fn fail_payload_keeps_short_backtraces_intact() {
        let fail =
            Fail::new("E", "m").with_backtrace(vec!["a".to_owned(), "b".to_owned()]);
        let payload = fail.wire_payload("j");
        assert_eq!(payload["backtrace"].as_array().unwrap().len(), 2);
    }

    #[test]
    fn beat_state_maps_known_values_only() {
        assert_eq!(BeatState::from_state("quiet"), Some(BeatState::Quiet));
        assert_eq!(BeatState::from_state("terminate"), Some(BeatState::Terminate));
        assert_eq!(BeatState::from_state("dance"), None);
    }

    mod properties {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            /// The wire payload never carries more than the cap, whatever
            /// the caller supplies.
            #[test]
            fn backtrace_is_always_capped(n in 0usize..400) {
                let lines: Vec<String> = (0..n).map(|i| i.to_string()).collect();
                let fail = Fail::new("E", "m").with_backtrace(lines);
                let sent = fail.wire_payload("j")["backtrace"]
                    .as_array()
                    .unwrap()
                    .len();
                prop_assert_eq!(sent, n.min(MAX_BACKTRACE_LINES));
            }
        }
    }
}
