//! Request dispatch: model-prefix routing and stream orchestration.

use std::sync::{Arc, Mutex};

use axum::{
    Json,
    body::Bytes,
    extract::State,
    http::HeaderMap,
    response::{IntoResponse, Response, Sse, sse::Event},
};
use config::ProviderType;
use futures::StreamExt;

use crate::{
    error::{LlmError, LlmResult, classify},
    messages::{
        anthropic::MessagesRequest,
        neutral::{NeutralEvent, NeutralTool},
    },
    provider::{Driver, InvokeRequest, ProviderHints},
    proxy::Passthrough,
    schema,
    sink::{DebugSink, FailureReport},
    transcode::{ResponseCollector, StreamTranscoder},
};

/// Shared, immutable per-process state. The driver map never changes once
/// the server is up; the sink is the only mutable collaborator.
pub(crate) struct ProxyState {
    pub drivers: std::collections::BTreeMap<String, Arc<dyn Driver>>,
    pub hints: ProviderHints,
    pub send_reasoning: bool,
    pub sink: Arc<dyn DebugSink>,
    pub passthrough: Passthrough,
}

impl ProxyState {
    /// The driver servicing bare model ids: the entry named `anthropic`,
    /// or failing that any registered Anthropic-kind driver.
    fn fallback_anthropic_driver(&self) -> Option<&Arc<dyn Driver>> {
        self.drivers
            .get("anthropic")
            .filter(|driver| driver.kind() == ProviderType::Anthropic)
            .or_else(|| {
                self.drivers
                    .values()
                    .find(|driver| driver.kind() == ProviderType::Anthropic)
            })
    }
}

pub(crate) async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({"status": "ok"}))
}

/// `POST /v1/messages`.
pub(crate) async fn messages(
    State(state): State<Arc<ProxyState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let request: MessagesRequest = match sonic_rs::from_slice(&body) {
        Ok(request) => request,
        Err(error) => {
            return LlmError::ProtocolInvariant(format!("invalid request body: {error}"))
                .into_response();
        }
    };

    // Route by model prefix. Bare model ids go to a registered Anthropic
    // driver when there is one, otherwise the original bytes are proxied
    // unchanged.
    let (driver, upstream_model) = match request.model.split_once('/') {
        Some((provider, model)) => {
            let Some(driver) = state.drivers.get(provider) else {
                return LlmError::UnknownProvider(provider.to_string()).into_response();
            };
            (driver.clone(), model.to_string())
        }
        None => match state.fallback_anthropic_driver() {
            Some(driver) => (driver.clone(), request.model.clone()),
            None => return state.passthrough.forward_messages(&headers, body).await,
        },
    };

    match dispatch(state, driver, upstream_model, request).await {
        Ok(response) => response,
        Err(error) => error.into_response(),
    }
}

async fn dispatch(
    state: Arc<ProxyState>,
    driver: Arc<dyn Driver>,
    upstream_model: String,
    request: MessagesRequest,
) -> LlmResult<Response> {
    let client_model = request.model.clone();
    let streaming = request.stream.unwrap_or(false);

    let converted =
        crate::messages::neutral::from_anthropic::convert(request.system, request.messages, request.tools)?;

    // Per-tool schema adaptation for the target provider.
    let tools: Vec<NeutralTool> = converted
        .tools
        .into_iter()
        .map(|tool| match tool {
            NeutralTool::Function {
                name,
                description,
                input_schema,
            } => NeutralTool::Function {
                name,
                description,
                input_schema: schema::adapt(driver.kind(), input_schema),
            },
            other => other,
        })
        .collect();

    let invoke = InvokeRequest {
        model: upstream_model,
        prompt: converted.prompt,
        tools,
        max_output_tokens: request.max_tokens,
        temperature: request.temperature,
        top_p: request.top_p,
        top_k: request.top_k,
        stop_sequences: request.stop_sequences.unwrap_or_default(),
        user_id: request.metadata.and_then(|metadata| metadata.user_id),
        hints: state.hints,
    };

    let events = driver.invoke(invoke).await.inspect_err(|error| {
        record_failure(&state.sink, error, &client_model, None);
    })?;

    if streaming {
        Ok(stream_response(state, events, client_model))
    } else {
        collect_response(state, events, client_model).await
    }
}

/// Pipe the driver's events through the transcoder and out as SSE.
///
/// The transcoder and its block index live inside the stream closure and
/// die with the response. Dropping the response mid-stream drops the
/// driver stream, which aborts the upstream call.
fn stream_response(
    state: Arc<ProxyState>,
    events: crate::provider::EventStream,
    client_model: String,
) -> Response {
    let mut transcoder = StreamTranscoder::new(client_model.clone());
    let chunk_log: Option<Arc<Mutex<Vec<String>>>> = state
        .sink
        .capture_streams()
        .then(|| Arc::new(Mutex::new(Vec::new())));

    let sse = events.flat_map(move |event| {
        if let NeutralEvent::Error(error) = &event {
            let chunks = chunk_log
                .as_ref()
                .and_then(|log| log.lock().ok().map(|chunks| chunks.clone()));
            record_stream_failure(&state.sink, error, &client_model, chunks);
        }

        let frames: Vec<Result<Event, std::convert::Infallible>> = transcoder
            .transcode(event)
            .into_iter()
            .map(|frame| {
                let payload = sonic_rs::to_string(&frame).unwrap_or_else(|e| {
                    log::error!("failed to serialize stream event: {e}");
                    r#"{"type":"ping"}"#.to_string()
                });

                if let Some(log) = &chunk_log
                    && let Ok(mut chunks) = log.lock()
                {
                    chunks.push(payload.clone());
                }

                Ok(Event::default().event(frame.event_name()).data(payload))
            })
            .collect();

        futures::stream::iter(frames)
    });

    Sse::new(sse).into_response()
}

/// Drive the stream to completion and answer with a single JSON body.
async fn collect_response(
    state: Arc<ProxyState>,
    mut events: crate::provider::EventStream,
    client_model: String,
) -> LlmResult<Response> {
    let mut collector = ResponseCollector::new();

    while let Some(event) = events.next().await {
        collector.absorb(event);
    }

    let response = match collector.finish(&client_model, state.send_reasoning) {
        Ok(response) => response,
        Err(error) => {
            record_failure(&state.sink, &error, &client_model, None);
            return Err(error);
        }
    };

    Ok(Json(response).into_response())
}

fn record_failure(sink: &Arc<dyn DebugSink>, error: &LlmError, model: &str, chunks: Option<Vec<String>>) {
    let (LlmError::DriverUpstream(driver_error) | LlmError::DriverStream(driver_error)) = error
    else {
        return;
    };

    let (status, detail) = classify(driver_error);

    let mut report = FailureReport::new(detail.error_type, model, detail.message);
    report.provider = Some(driver_error.provider.clone());
    report.status = Some(status.as_u16());
    report.raw = driver_error.raw.clone();
    report.stream_chunks = chunks;

    sink.record(report);
}

fn record_stream_failure(
    sink: &Arc<dyn DebugSink>,
    error: &crate::error::DriverError,
    model: &str,
    chunks: Option<Vec<String>>,
) {
    let (_, detail) = classify(error);

    let mut report = FailureReport::new(detail.error_type, model, detail.message);
    report.provider = Some(error.provider.clone());
    report.raw = error.raw.clone();
    report.stream_chunks = chunks;

    sink.record(report);
}
