//! Viewer WebSocket connections
//!
//! One task per viewer: forwards frames from the session's hub and
//! answers client messages (interaction, action, content, ping). A
//! failure here is local to the connection; the session and its other
//! subscribers never see it.

use axum::extract::ws::{Message, WebSocket};
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tracing::debug;

use browsercast_common::{
    ActionKind, ActionRequest, ActionResult, Coordinates, Frame, PageContent,
};
use browsercast_core::StreamEvent;

use crate::server::AppState;

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ServerMessage {
    Frame(Frame),
    #[serde(rename_all = "camelCase")]
    Status {
        message: String,
        session_id: String,
    },
    ActionResult {
        result: ActionResult,
    },
    Content {
        content: PageContent,
    },
    Pong,
    Error {
        message: String,
    },
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ClientMessage {
    Interaction(Interaction),
    Action { action: ActionRequest },
    GetContent,
    Ping,
}

/// Loose viewer interaction; which fields are present decides what it
/// means.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Interaction {
    #[serde(default)]
    x: Option<f64>,
    #[serde(default)]
    y: Option<f64>,
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    delta_y: Option<f64>,
    #[serde(default)]
    url: Option<String>,
}

impl Interaction {
    /// Map onto a structured action: coordinates mean click, text means
    /// type into the focused element, deltaY means scroll, url means
    /// navigate.
    fn into_action(self) -> Option<ActionRequest> {
        if let (Some(x), Some(y)) = (self.x, self.y) {
            return Some(ActionRequest {
                kind: ActionKind::Click,
                selector: None,
                value: None,
                coordinates: Some(Coordinates { x, y }),
            });
        }
        if let Some(text) = self.text {
            return Some(ActionRequest {
                kind: ActionKind::Type,
                selector: Some(":focus".to_string()),
                value: Some(text),
                coordinates: None,
            });
        }
        if let Some(delta_y) = self.delta_y {
            return Some(ActionRequest {
                kind: ActionKind::Scroll,
                selector: None,
                value: None,
                coordinates: Some(Coordinates { x: 0.0, y: delta_y }),
            });
        }
        if let Some(url) = self.url {
            return Some(ActionRequest::navigate(url));
        }
        None
    }
}

type Sink = SplitSink<WebSocket, Message>;

async fn send(sink: &mut Sink, message: &ServerMessage) -> anyhow::Result<()> {
    let text = serde_json::to_string(message)?;
    sink.send(Message::Text(text)).await?;
    Ok(())
}

/// Run one viewer connection to completion
pub async fn serve_viewer(
    state: AppState,
    session_id: String,
    socket: WebSocket,
) -> anyhow::Result<()> {
    let (mut sink, mut stream) = socket.split();

    let (session, subscriber_id, mut events) = match state.registry.subscribe(&session_id).await {
        Ok(subscription) => subscription,
        Err(e) => {
            let _ = send(
                &mut sink,
                &ServerMessage::Error {
                    message: e.to_string(),
                },
            )
            .await;
            let _ = sink.close().await;
            return Ok(());
        }
    };
    debug!("viewer attached to session {}", session_id);

    let greeted = send(
        &mut sink,
        &ServerMessage::Status {
            message: "streaming started".to_string(),
            session_id: session_id.clone(),
        },
    )
    .await;
    if greeted.is_err() {
        session.detach_subscriber(subscriber_id);
        return Ok(());
    }

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Some(StreamEvent::Frame(frame)) => {
                    if send(&mut sink, &ServerMessage::Frame(frame)).await.is_err() {
                        break;
                    }
                }
                Some(StreamEvent::Ended { reason }) => {
                    let _ = send(&mut sink, &ServerMessage::Status {
                        message: reason,
                        session_id: session_id.clone(),
                    }).await;
                    break;
                }
                // Hub dropped this subscriber (stalled or session gone).
                None => break,
            },
            incoming = stream.next() => match incoming {
                Some(Ok(Message::Text(text))) => {
                    let reply = match serde_json::from_str::<ClientMessage>(&text) {
                        Ok(message) => handle_client_message(&state, &session_id, message).await,
                        Err(e) => Some(ServerMessage::Error {
                            message: format!("unrecognized message: {e}"),
                        }),
                    };
                    if let Some(reply) = reply {
                        if send(&mut sink, &reply).await.is_err() {
                            break;
                        }
                    }
                }
                Some(Ok(Message::Close(_))) | None => {
                    debug!("viewer of session {} disconnected", session_id);
                    break;
                }
                Some(Ok(_)) => {} // ping/pong/binary handled by axum
                Some(Err(e)) => {
                    debug!("viewer socket error on session {}: {}", session_id, e);
                    break;
                }
            },
        }
    }

    session.detach_subscriber(subscriber_id);
    Ok(())
}

async fn handle_client_message(
    state: &AppState,
    session_id: &str,
    message: ClientMessage,
) -> Option<ServerMessage> {
    match message {
        ClientMessage::Ping => Some(ServerMessage::Pong),
        ClientMessage::Action { action } => {
            match state.registry.execute_action(session_id, action).await {
                Ok(result) => Some(ServerMessage::ActionResult { result }),
                Err(e) => Some(ServerMessage::Error {
                    message: e.to_string(),
                }),
            }
        }
        ClientMessage::GetContent => match state.registry.introspect(session_id).await {
            Ok(content) => Some(ServerMessage::Content { content }),
            Err(e) => Some(ServerMessage::Error {
                message: e.to_string(),
            }),
        },
        ClientMessage::Interaction(interaction) => {
            let Some(action) = interaction.into_action() else {
                return Some(ServerMessage::Error {
                    message: "empty interaction".to_string(),
                });
            };
            // Interactions are fire-and-forget; only lifecycle errors
            // are reported back.
            match state.registry.execute_action(session_id, action).await {
                Ok(_) => None,
                Err(e) => Some(ServerMessage::Error {
                    message: e.to_string(),
                }),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_message_matches_wire_format() {
        let message = ServerMessage::Frame(Frame {
            session_id: "s1".into(),
            frame_number: 12,
            data: "aGVsbG8=".into(),
            timestamp: "2024-01-01T00:00:00Z".into(),
        });
        let json = serde_json::to_value(&message).unwrap();
        assert_eq!(json["type"], "frame");
        assert_eq!(json["sessionId"], "s1");
        assert_eq!(json["frameNumber"], 12);
        assert_eq!(json["data"], "aGVsbG8=");
    }

    #[test]
    fn pong_is_just_a_tag() {
        let json = serde_json::to_value(&ServerMessage::Pong).unwrap();
        assert_eq!(json, serde_json::json!({ "type": "pong" }));
    }

    #[test]
    fn client_ping_parses() {
        let message: ClientMessage = serde_json::from_str(r#"{"type":"ping"}"#).unwrap();
        assert!(matches!(message, ClientMessage::Ping));
    }

    #[test]
    fn client_action_parses() {
        let message: ClientMessage = serde_json::from_str(
            r#"{"type":"action","action":{"type":"navigate","value":"https://example.test"}}"#,
        )
        .unwrap();
        match message {
            ClientMessage::Action { action } => {
                assert_eq!(action.kind, ActionKind::Navigate);
                assert_eq!(action.value.as_deref(), Some("https://example.test"));
            }
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[test]
    fn interaction_click_maps_to_coordinates() {
        let message: ClientMessage =
            serde_json::from_str(r#"{"type":"interaction","x":10,"y":20}"#).unwrap();
        let ClientMessage::Interaction(interaction) = message else {
            panic!("expected interaction");
        };
        let action = interaction.into_action().unwrap();
        assert_eq!(action.kind, ActionKind::Click);
        assert_eq!(action.coordinates.unwrap().y, 20.0);
    }

    #[test]
    fn interaction_text_types_into_focused_element() {
        let interaction = Interaction {
            text: Some("hello".into()),
            ..Default::default()
        };
        let action = interaction.into_action().unwrap();
        assert_eq!(action.kind, ActionKind::Type);
        assert_eq!(action.selector.as_deref(), Some(":focus"));
    }

    #[test]
    fn interaction_scroll_and_navigate_map() {
        let scroll = Interaction {
            delta_y: Some(120.0),
            ..Default::default()
        };
        let action = scroll.into_action().unwrap();
        assert_eq!(action.kind, ActionKind::Scroll);
        assert_eq!(action.coordinates.unwrap().y, 120.0);

        let nav = Interaction {
            url: Some("https://example.test".into()),
            ..Default::default()
        };
        let action = nav.into_action().unwrap();
        assert_eq!(action.kind, ActionKind::Navigate);
    }

    #[test]
    fn empty_interaction_maps_to_nothing() {
        assert!(Interaction::default().into_action().is_none());
    }
}
