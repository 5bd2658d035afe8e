//! Scripted provider: replays queued replies in order.
//!
//! Drives the loop without network access (tests, dry runs). Once the
//! queue is empty the last reply repeats, or the call fails with
//! `provider_unavailable` if nothing was ever queued.

use std::collections::VecDeque;
use std::sync::Mutex;

use super::{
    Completion, GatewayError, GatewayErrorKind, GenerateRequest, ModelProvider, Usage,
};

/// One queued reply.
#[derive(Debug, Clone, PartialEq)]
pub enum ScriptedReply {
    Text(String),
    Fail(GatewayErrorKind, String),
}

impl ScriptedReply {
    pub fn text(content: impl Into<String>) -> Self {
        ScriptedReply::Text(content.into())
    }

    pub fn fail(kind: GatewayErrorKind, message: impl Into<String>) -> Self {
        ScriptedReply::Fail(kind, message.into())
    }

    fn render(&self) -> Result<Completion, GatewayError> {
        match self {
            ScriptedReply::Text(content) => Ok(Completion {
                content: content.clone(),
                usage: Usage::default(),
                raw: serde_json::Value::Null,
            }),
            ScriptedReply::Fail(kind, message) => Err(GatewayError::from_kind(*kind, message.clone())),
        }
    }
}

#[derive(Debug, Default)]
struct Script {
    queue: VecDeque<ScriptedReply>,
    last: Option<ScriptedReply>,
    requests: Vec<GenerateRequest>,
}

/// Provider whose replies are fixed up front.
#[derive(Debug)]
pub struct ScriptedProvider {
    model: String,
    script: Mutex<Script>,
}

impl ScriptedProvider {
    pub fn new(replies: Vec<ScriptedReply>) -> Self {
        Self {
            model: "scripted".into(),
            script: Mutex::new(Script {
                queue: replies.into(),
                ..Script::default()
            }),
        }
    }

    pub fn push(&self, reply: ScriptedReply) {
        self.lock().queue.push_back(reply);
    }

    pub fn call_count(&self) -> usize {
        self.lock().requests.len()
    }

    /// Every request received so far, in order.
    pub fn requests(&self) -> Vec<GenerateRequest> {
        self.lock().requests.clone()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Script> {
        self.script.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl ModelProvider for ScriptedProvider {
    fn name(&self) -> &str {
        "scripted"
    }

    fn model(&self) -> &str {
        &self.model
    }

    fn complete(&self, request: &GenerateRequest) -> Result<Completion, GatewayError> {
        let mut script = self.lock();
        script.requests.push(request.clone());

        let reply = match script.queue.pop_front() {
            Some(reply) => {
                script.last = Some(reply.clone());
                reply
            }
            None => match &script.last {
                Some(last) => last.clone(),
                None => {
                    return Err(GatewayError::ProviderUnavailable(
                        "scripted provider has no replies".into(),
                    ))
                }
            },
        };
        reply.render()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request() -> GenerateRequest {
        GenerateRequest {
            system_prompt: "s".into(),
            user_content: "u".into(),
            temperature: 0.0,
            max_tokens: 1,
        }
    }

    #[test]
    fn replays_in_order_then_repeats_last() {
        let p = ScriptedProvider::new(vec![ScriptedReply::text("a"), ScriptedReply::text("b")]);
        assert_eq!(p.complete(&request()).unwrap().content, "a");
        assert_eq!(p.complete(&request()).unwrap().content, "b");
        assert_eq!(p.complete(&request()).unwrap().content, "b");
        assert_eq!(p.call_count(), 3);
    }

    #[test]
    fn empty_script_is_unavailable() {
        let p = ScriptedProvider::new(vec![]);
        let err = p.complete(&request()).unwrap_err();
        assert_eq!(err.kind(), GatewayErrorKind::ProviderUnavailable);
    }

    #[test]
    fn records_requests() {
        let p = ScriptedProvider::new(vec![ScriptedReply::text("a")]);
        p.complete(&request()).unwrap();
        assert_eq!(p.requests()[0].user_content, "u");
    }
}
