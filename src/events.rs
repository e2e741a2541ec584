//! Turn event stream: typed progress events pushed from the running turn to
//! the caller over an unbounded flume channel.
//!
//! Emission is best-effort. A caller that drops its [`TurnStream`] simply
//! stops observing; the turn itself keeps running (or is cancelled through
//! its handle, not through the stream).

use serde::{Deserialize, Serialize};

use crate::compose::TurnResponse;

/// Coarse phase of the turn state machine, for progress display.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnPhase {
    Init,
    Thinking,
    Generating,
    Acting,
    AwaitingApproval,
    Done,
    Failed,
    Interrupted,
    Cancelled,
}

/// One event in the life of a turn.
///
/// Exactly one terminal event (`Final` or `Error`) is emitted per turn.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TurnEvent {
    Start {
        session_id: String,
        request_id: String,
    },
    /// Incremental model output. Never retracted once emitted.
    Token {
        content: String,
    },
    ToolStart {
        tool_name: String,
        call_id: String,
    },
    ToolEnd {
        tool_name: String,
        call_id: String,
        success: bool,
    },
    Status {
        phase: TurnPhase,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        detail: Option<String>,
    },
    Final {
        response: TurnResponse,
    },
    Error {
        code: String,
        message: String,
    },
}

impl TurnEvent {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TurnEvent::Final { .. } | TurnEvent::Error { .. })
    }
}

/// Stream of [`TurnEvent`]s handed to the caller of `process_stream`.
pub type TurnStream = flume::r#async::RecvStream<'static, TurnEvent>;

/// Sending half of the turn's event channel, cloned into steps.
#[derive(Clone, Debug)]
pub struct EventEmitter {
    sender: flume::Sender<TurnEvent>,
}

impl EventEmitter {
    /// Create a connected emitter/stream pair for one turn.
    pub fn channel() -> (Self, TurnStream) {
        let (sender, receiver) = flume::unbounded();
        (Self { sender }, receiver.into_stream())
    }

    /// An emitter whose events go nowhere. For the non-streaming path.
    #[must_use]
    pub fn disconnected() -> Self {
        let (sender, _) = flume::unbounded();
        Self { sender }
    }

    /// Send an event; silently dropped when the stream has been released.
    pub fn emit(&self, event: TurnEvent) {
        let _ = self.sender.send(event);
    }

    pub fn status(&self, phase: TurnPhase) {
        self.emit(TurnEvent::Status {
            phase,
            detail: None,
        });
    }

    pub fn status_detail(&self, phase: TurnPhase, detail: impl Into<String>) {
        self.emit(TurnEvent::Status {
            phase,
            detail: Some(detail.into()),
        });
    }

    pub fn token(&self, content: impl Into<String>) {
        self.emit(TurnEvent::Token {
            content: content.into(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::StreamExt;

    #[tokio::test]
    async fn channel_delivers_in_order() {
        let (emitter, mut stream) = EventEmitter::channel();
        emitter.status(TurnPhase::Init);
        emitter.token("he");
        emitter.token("llo");
        drop(emitter);

        let mut got = Vec::new();
        while let Some(event) = stream.next().await {
            got.push(event);
        }
        assert_eq!(got.len(), 3);
        assert_eq!(
            got[0],
            TurnEvent::Status {
                phase: TurnPhase::Init,
                detail: None
            }
        );
        assert_eq!(
            got[2],
            TurnEvent::Token {
                content: "llo".into()
            }
        );
    }

    #[test]
    fn emit_after_stream_drop_is_silent() {
        let (emitter, stream) = EventEmitter::channel();
        drop(stream);
        emitter.token("unheard");
    }

    #[test]
    fn terminal_classification() {
        assert!(TurnEvent::Error {
            code: "CANCELLED".into(),
            message: "stopped".into()
        }
        .is_terminal());
        assert!(!TurnEvent::Token {
            content: "x".into()
        }
        .is_terminal());
    }
}
