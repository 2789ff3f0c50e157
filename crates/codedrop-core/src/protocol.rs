// Wire and in-process message types shared by the relay, the client and the
// tab-side automation.

use std::fmt;

use serde::{Deserialize, Serialize};

/// One code-delivery request as it travels over the relay.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobFrame {
    /// Page the code was written for (problem statement URL).
    pub url: String,
    /// Source code to submit.
    pub code: String,
}

/// What a tab receives for one submission.
///
/// Judges that submit from a problem-specific page only need the code; judges
/// with a shared submit form also need the problem identifier. The untagged
/// representation keeps the wire form either a bare string or
/// `{"code": ..., "problem": ...}`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Payload {
    Code(String),
    Problem { code: String, problem: String },
}

impl Payload {
    /// The source code regardless of payload shape.
    pub fn code(&self) -> &str {
        match self {
            Payload::Code(code) => code,
            Payload::Problem { code, .. } => code,
        }
    }

    /// The problem identifier, if this payload carries one.
    pub fn problem(&self) -> Option<&str> {
        match self {
            Payload::Code(_) => None,
            Payload::Problem { problem, .. } => Some(problem),
        }
    }
}

/// A job resolved against a judge profile: where to submit and what to send.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubmissionTask {
    pub target_url: String,
    pub payload: Payload,
}

impl SubmissionTask {
    /// The message handed to the tab's page context for this task.
    pub fn to_message(&self) -> DeliveryMessage {
        DeliveryMessage {
            url: self.target_url.clone(),
            code: self.payload.clone(),
        }
    }
}

/// Message delivered into a tab. Field names match what the page-side
/// listener has always received: `{url, code}`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeliveryMessage {
    pub url: String,
    pub code: Payload,
}

/// Identifier of a browser tab assigned by the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TabId(pub u64);

impl fmt::Display for TabId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "tab#{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn job_frame_parses_from_wire_json() {
        let frame: JobFrame =
            serde_json::from_str(r#"{"url":"https://www.luogu.com.cn/problem/P1001","code":"int main(){}"}"#)
                .unwrap();
        assert_eq!(frame.url, "https://www.luogu.com.cn/problem/P1001");
        assert_eq!(frame.code, "int main(){}");
    }

    #[test]
    fn job_frame_missing_code_is_rejected() {
        let result: Result<JobFrame, _> = serde_json::from_str(r#"{"url":"x"}"#);
        assert!(result.is_err());
    }

    #[test]
    fn bare_code_payload_serializes_as_string() {
        let json = serde_json::to_value(Payload::Code("x".into())).unwrap();
        assert_eq!(json, serde_json::json!("x"));
    }

    #[test]
    fn problem_payload_serializes_as_object() {
        let payload = Payload::Problem {
            code: "x".into(),
            problem: "1234C".into(),
        };
        let json = serde_json::to_value(&payload).unwrap();
        assert_eq!(json, serde_json::json!({"code": "x", "problem": "1234C"}));
    }

    #[test]
    fn delivery_message_accepts_both_payload_shapes() {
        let bare: DeliveryMessage =
            serde_json::from_str(r#"{"url":"u","code":"src"}"#).unwrap();
        assert_eq!(bare.code, Payload::Code("src".into()));

        let structured: DeliveryMessage =
            serde_json::from_str(r#"{"url":"u","code":{"code":"src","problem":"A"}}"#).unwrap();
        assert_eq!(structured.code.problem(), Some("A"));
        assert_eq!(structured.code.code(), "src");
    }

    #[test]
    fn task_to_message_keeps_url_and_payload() {
        let task = SubmissionTask {
            target_url: "https://codeforces.com/problemset/submit".into(),
            payload: Payload::Problem {
                code: "c".into(),
                problem: "4A".into(),
            },
        };
        let msg = task.to_message();
        assert_eq!(msg.url, task.target_url);
        assert_eq!(msg.code, task.payload);
    }
}
