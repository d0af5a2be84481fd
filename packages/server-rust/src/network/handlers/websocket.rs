//! Connection upgrade and message-based entry point.
//!
//! Each inbound text (or UTF-8 binary) frame is decoded as one envelope or a
//! batch. Every envelope is dispatched on its own task, so a slow operation
//! never holds back replies to its siblings.

use std::sync::Arc;

use axum::extract::ws::rejection::WebSocketUpgradeRejection;
use axum::extract::ws::{close_code, CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::http::{HeaderMap, Method, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::Json;
use futures_util::{SinkExt, StreamExt};
use switchyard_core::envelope::{self, Envelope, EnvelopeResponse};
use switchyard_core::{
    ContextValues, ExecutionContext, ProcedureError, RequestMeta, ServerEvent, Transport,
    TransportError, UpgradeData,
};
use tokio::sync::Semaphore;
use tracing::{debug, warn};

use super::{guarded, AppState};
use crate::network::connection::{ConnectionHandle, OutboundMessage};
use crate::network::middleware::REQUEST_ID_HEADER;

const SHUTDOWN_REASON: &str = "server shutting down";

/// Runs upgrade derivation, then hands the socket to the connection loop.
/// Derived headers are added to the upgrade response.
pub async fn ws_upgrade_handler(
    State(state): State<AppState>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    upgrade: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Response {
    let upgrade = match upgrade {
        Ok(upgrade) => upgrade,
        Err(rejection) => {
            let reason = rejection.body_text();
            emit_transport_error(&state, None, TransportError::UpgradeRejected { reason: reason.clone() });
            let error = ProcedureError::custom(StatusCode::INTERNAL_SERVER_ERROR, "UpgradeRejected", reason);
            return (error.status(), Json(error.to_body())).into_response();
        }
    };

    if !state.shutdown.is_accepting() {
        let error = ProcedureError::Overloaded;
        return (error.status(), Json(error.to_body())).into_response();
    }

    let request_id = headers
        .get(REQUEST_ID_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(str::to_owned);
    let meta = Arc::new(RequestMeta {
        method,
        uri,
        headers,
        request_id,
    });

    let UpgradeData { data, headers } = match derive_upgrade_data(&state, meta).await {
        Ok(derived) => derived,
        Err(error) => {
            let error = state.report(None, error);
            return (error.status(), Json(error.to_body())).into_response();
        }
    };

    let failed_state = state.clone();
    let mut response = upgrade
        .on_failed_upgrade(move |error: axum::Error| {
            emit_transport_error(
                &failed_state,
                None,
                TransportError::UpgradeRejected {
                    reason: error.to_string(),
                },
            );
        })
        .on_upgrade(move |socket| run_connection(state, socket, data));
    response.headers_mut().extend(headers);
    response
}

async fn derive_upgrade_data(state: &AppState, meta: Arc<RequestMeta>) -> Result<UpgradeData, ProcedureError> {
    if state.compiled.upgrades().is_empty() {
        return Ok(UpgradeData::default());
    }
    guarded(async {
        let ctx = state
            .compiled
            .context(Arc::clone(&state.instance), Transport::Request(meta))
            .await?;
        state.compiled.upgrade_data(&ctx).await
    })
    .await
}

/// Owns one socket from upgrade to close.
async fn run_connection(state: AppState, socket: WebSocket, data: ContextValues) {
    let (handle, mut outbound) = state.registry.register(&state.config.connection, data);
    let connection = handle.id.0;
    let dispatch_slots = Arc::new(Semaphore::new(state.config.connection.max_in_flight as usize));
    state.compiled.events().emit(&ServerEvent::Open { connection });

    let (mut sink, mut stream) = socket.split();
    let mut writer = tokio::spawn(async move {
        while let Some(message) = outbound.recv().await {
            match message {
                OutboundMessage::Text(text) => {
                    if sink.send(Message::Text(text.into())).await.is_err() {
                        break;
                    }
                }
                OutboundMessage::Close(reason) => {
                    let frame = reason.map(|reason| CloseFrame {
                        code: close_code::AWAY,
                        reason: reason.into(),
                    });
                    let _ = sink.send(Message::Close(frame)).await;
                    break;
                }
            }
        }
    });

    let mut shutdown = state.shutdown.subscribe();
    let mut code = None;
    let mut reason = None;
    loop {
        tokio::select! {
            frame = stream.next() => match frame {
                Some(Ok(Message::Text(text))) => on_message(&state, &handle, &dispatch_slots, text.as_str()),
                Some(Ok(Message::Binary(bytes))) => match std::str::from_utf8(&bytes) {
                    Ok(text) => on_message(&state, &handle, &dispatch_slots, text),
                    Err(_) => warn!(connection, "dropping non-UTF-8 binary frame"),
                },
                Some(Ok(Message::Close(frame))) => {
                    if let Some(frame) = frame {
                        code = Some(frame.code);
                        reason = Some(frame.reason.as_str().to_owned());
                    }
                    break;
                }
                Some(Ok(_)) => {}
                Some(Err(error)) => {
                    emit_transport_error(
                        &state,
                        Some(connection),
                        TransportError::Socket { reason: error.to_string() },
                    );
                    break;
                }
                None => break,
            },
            _ = shutdown.changed() => {
                reason = Some(SHUTDOWN_REASON.to_owned());
                break;
            }
        }
    }

    state.registry.remove(handle.id);
    // Flush queued replies, then close. The writer is aborted if the queue
    // stays full past the send timeout.
    let _ = handle.try_send(OutboundMessage::Close(reason.clone()));
    if tokio::time::timeout(state.config.connection.send_timeout, &mut writer)
        .await
        .is_err()
    {
        writer.abort();
    }

    debug!(connection, ?code, "connection closed");
    state.compiled.events().emit(&ServerEvent::Close {
        connection,
        code,
        reason,
    });
}

fn on_message(
    state: &AppState,
    handle: &Arc<ConnectionHandle>,
    dispatch_slots: &Arc<Semaphore>,
    text: &str,
) {
    let connection = handle.id.0;
    state.compiled.events().emit(&ServerEvent::Message {
        connection,
        size: text.len(),
    });

    let envelopes = match envelope::decode(text) {
        Ok(envelopes) => envelopes,
        Err(error) => {
            warn!(connection, %error, "dropping malformed message");
            return;
        }
    };

    for envelope in envelopes {
        let Ok(slot) = Arc::clone(dispatch_slots).try_acquire_owned() else {
            debug!(connection, method = %envelope.method, "shedding envelope");
            shed_envelope(state, handle, envelope.id);
            continue;
        };
        let dispatch = dispatch_envelope(state.clone(), Arc::clone(handle), envelope);
        tokio::spawn(async move {
            dispatch.await;
            drop(slot);
        });
    }
}

/// Answers an envelope that found no free dispatch slot.
fn shed_envelope(state: &AppState, handle: &ConnectionHandle, id: String) {
    let reply = EnvelopeResponse::failure(id, &ProcedureError::Overloaded);
    match reply.to_text() {
        Ok(text) => {
            if !handle.try_send(OutboundMessage::Text(text)) {
                emit_transport_error(state, Some(handle.id.0), TransportError::SendTimeout);
            }
        }
        Err(error) => warn!(connection = handle.id.0, %error, "reply could not be serialised"),
    }
}

/// Dispatches one envelope and queues exactly one reply for it.
async fn dispatch_envelope(state: AppState, handle: Arc<ConnectionHandle>, envelope: Envelope) {
    let _in_flight = state.shutdown.in_flight_guard();
    let Envelope { id, method, params } = envelope;

    let response = if state.compiled.contains(&method) {
        let outcome = guarded(async {
            let ctx = connection_context(&state, &handle).await?;
            state.compiled.call(&method, params, ctx).await
        })
        .await;
        match outcome {
            Ok(reply) => EnvelopeResponse::success(id, reply),
            Err(error) => {
                let error = state.report(Some(method.as_str().into()), error);
                EnvelopeResponse::failure(id, &error)
            }
        }
    } else {
        EnvelopeResponse::not_found(id, &method)
    };

    let text = match response.to_text() {
        Ok(text) => text,
        Err(error) => {
            warn!(connection = handle.id.0, %error, "reply could not be serialised");
            return;
        }
    };
    if let Err(error) = handle
        .send_timeout(OutboundMessage::Text(text), state.config.connection.send_timeout)
        .await
    {
        emit_transport_error(&state, Some(handle.id.0), error);
    }
}

/// Derived once per connection; a failed derivation is retried on the next
/// envelope.
async fn connection_context(
    state: &AppState,
    handle: &ConnectionHandle,
) -> Result<ExecutionContext, ProcedureError> {
    handle
        .context
        .get_or_try_init(|| {
            state.compiled.context(
                Arc::clone(&state.instance),
                Transport::Connection(Arc::clone(&handle.meta)),
            )
        })
        .await
        .cloned()
}

fn emit_transport_error(state: &AppState, connection: Option<u64>, error: TransportError) {
    state
        .compiled
        .events()
        .emit(&ServerEvent::TransportError { connection, error });
}
