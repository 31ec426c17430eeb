//! v2 API endpoints and the step-wise generation drivers.
//!
//! The machine is externally driven: a `step` starts one generation, which
//! pauses into `TOOL_PENDING` when the stream completes a runnable tool
//! block. Only an explicit confirm (or a positive auto-confirm budget)
//! advances past that boundary; after tool output is appended, generation
//! resumes so the model can react. Interrupts cancel whatever is in
//! flight and return the session to idle.
//!
//! All log mutation for a conversation happens under its async mutex, so
//! events and appends are totally ordered per conversation while separate
//! conversations proceed in parallel.

use super::session::{Event, MessageView, ToolExecution, ToolStatus};
use super::AppState;
use crate::interrupt::{CancelToken, INTERRUPT_MARKER};
use crate::llm::{ModelMeta, get_model};
use crate::logmanager::{LoadOptions, LogManager, list_conversations as list_logs};
use crate::message::{Message, Role};
use crate::tooluse::{ToolFormat, ToolUse, ToolUseScanner};
use crate::tools::{always_confirm, execute_tooluse};
use axum::Json;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::sse::{Event as SseEvent, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use futures::StreamExt;
use serde::Deserialize;
use serde_json::json;
use std::convert::Infallible;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// Error wrapper mapping runtime errors onto status codes.
pub struct ApiError(crate::Error);

impl From<crate::Error> for ApiError {
    fn from(err: crate::Error) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            crate::Error::ConversationNotFound(_)
            | crate::Error::SessionNotFound(_)
            | crate::Error::ToolNotFound(_) => StatusCode::NOT_FOUND,
            crate::Error::ConversationExists(_) => StatusCode::CONFLICT,
            crate::Error::InvalidInput(_) | crate::Error::Config(_) => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, Json(json!({ "error": self.0.to_string() }))).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

// Request bodies
// --------------

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    pub limit: Option<usize>,
}

#[derive(Debug, Deserialize)]
pub struct IncomingMessage {
    pub role: Role,
    pub content: String,
    pub timestamp: Option<chrono::DateTime<chrono::Utc>>,
    #[serde(default)]
    pub files: Vec<PathBuf>,
}

impl IncomingMessage {
    fn into_message(self) -> Message {
        let mut msg = Message::new(self.role, self.content).with_files(self.files);
        if let Some(timestamp) = self.timestamp {
            msg.timestamp = timestamp;
        }
        msg
    }
}

#[derive(Debug, Deserialize)]
pub struct CreateBody {
    #[serde(default)]
    pub messages: Vec<IncomingMessage>,
}

#[derive(Debug, Deserialize)]
pub struct AppendBody {
    pub role: Role,
    pub content: String,
    #[serde(default)]
    pub files: Vec<PathBuf>,
    pub branch: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct EventsQuery {
    pub session_id: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct StepBody {
    pub session_id: String,
    pub model: Option<String>,
    pub branch: Option<String>,
    pub auto_confirm: Option<u32>,
}

#[derive(Debug, Deserialize)]
pub struct ConfirmBody {
    pub session_id: String,
    pub tool_id: String,
    pub action: String,
    pub content: Option<String>,
    pub count: Option<u32>,
}

#[derive(Debug, Deserialize)]
pub struct InterruptBody {
    pub session_id: String,
}

// Handlers
// --------

/// Liveness.
pub async fn api_root() -> Json<serde_json::Value> {
    Json(json!({ "message": "toolchat v2 API" }))
}

pub async fn list_conversations(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ListQuery>,
) -> ApiResult<Json<serde_json::Value>> {
    let items = list_logs(&state.logs_home, query.limit.unwrap_or(100))?;
    Ok(Json(json!(items)))
}

pub async fn get_conversation(
    State(state): State<Arc<AppState>>,
    Path(conversation_id): Path<String>,
) -> ApiResult<Json<serde_json::Value>> {
    let manager = LogManager::load(
        state.logdir(&conversation_id),
        LoadOptions {
            lock: false,
            branch: None,
        },
    )?;
    Ok(Json(json!(manager.snapshot()?)))
}

pub async fn create_conversation(
    State(state): State<Arc<AppState>>,
    Path(conversation_id): Path<String>,
    Json(body): Json<CreateBody>,
) -> ApiResult<Json<serde_json::Value>> {
    let msgs = body
        .messages
        .into_iter()
        .map(IncomingMessage::into_message)
        .collect();
    LogManager::create(state.logdir(&conversation_id), msgs)?;
    let session_id = state.sessions.create_session(&conversation_id);
    Ok(Json(json!({
        "status": "ok",
        "conversation_id": conversation_id,
        "session_id": session_id,
    })))
}

pub async fn append_message(
    State(state): State<Arc<AppState>>,
    Path(conversation_id): Path<String>,
    Json(body): Json<AppendBody>,
) -> ApiResult<Json<serde_json::Value>> {
    let lock = state.conversation_lock(&conversation_id);
    let _guard = lock.lock().await;

    let mut manager = LogManager::load(
        state.logdir(&conversation_id),
        LoadOptions {
            lock: false,
            branch: body.branch.clone(),
        },
    )?;
    let msg = Message::new(body.role, body.content).with_files(body.files);
    manager.append(msg.clone())?;

    state.sessions.add_event(
        &conversation_id,
        Event::MessageAdded {
            message: MessageView::from(&msg),
        },
    );
    Ok(Json(json!({ "status": "ok" })))
}

pub async fn create_session(
    State(state): State<Arc<AppState>>,
    Path(conversation_id): Path<String>,
) -> ApiResult<Json<serde_json::Value>> {
    // Probe without taking the write lock.
    LogManager::load(
        state.logdir(&conversation_id),
        LoadOptions {
            lock: false,
            branch: None,
        },
    )?;
    let session_id = state.sessions.create_session(&conversation_id);
    Ok(Json(json!({ "status": "ok", "session_id": session_id })))
}

/// SSE event stream for one session.
pub async fn events(
    State(state): State<Arc<AppState>>,
    Path(conversation_id): Path<String>,
    Query(query): Query<EventsQuery>,
) -> ApiResult<Sse<impl futures::Stream<Item = Result<SseEvent, Infallible>>>> {
    let session_id = match query.session_id {
        Some(id) => {
            if !state.sessions.session_exists(&id) {
                return Err(crate::Error::SessionNotFound(id).into());
            }
            id
        }
        None => state.sessions.create_session(&conversation_id),
    };

    let sessions = state.sessions.clone();
    let stream = async_stream::stream! {
        let client_id = uuid::Uuid::new_v4().to_string();
        sessions.add_client(&session_id, &client_id);
        let _guard = ClientGuard {
            sessions: sessions.clone(),
            session_id: session_id.clone(),
            client_id,
        };

        yield Ok(sse_frame(&Event::Connected { session_id: session_id.clone() }));

        let mut index = 0;
        loop {
            match sessions.events_since(&session_id, index) {
                None => break,
                Some(new_events) => {
                    index += new_events.len();
                    for event in new_events {
                        yield Ok(sse_frame(&event));
                    }
                }
            }
            yield Ok(sse_frame(&Event::Ping));
            tokio::time::sleep(Duration::from_secs(1)).await;
        }
    };

    Ok(Sse::new(stream).keep_alive(KeepAlive::new().interval(Duration::from_secs(15))))
}

fn sse_frame(event: &Event) -> SseEvent {
    let data = serde_json::to_string(event).unwrap_or_else(|_| "{}".to_string());
    SseEvent::default().data(data)
}

/// Removes the subscriber from the session when the SSE stream drops.
struct ClientGuard {
    sessions: Arc<super::SessionManager>,
    session_id: String,
    client_id: String,
}

impl Drop for ClientGuard {
    fn drop(&mut self) {
        self.sessions.remove_client(&self.session_id, &self.client_id);
    }
}

/// Begins one step of the agent loop.
pub async fn step(
    State(state): State<Arc<AppState>>,
    Path(conversation_id): Path<String>,
    Json(body): Json<StepBody>,
) -> ApiResult<Response> {
    let already_generating = state.sessions.with_session(&body.session_id, |session| {
        if session.generating {
            return true;
        }
        session.generating = true;
        session.cancel.reset();
        if let Some(model) = body.model.clone() {
            session.model = Some(model);
        }
        if let Some(branch) = body.branch.clone() {
            session.branch = branch;
        }
        if let Some(count) = body.auto_confirm {
            session.auto_confirm_count = count;
        }
        false
    })?;

    if already_generating {
        return Ok((
            StatusCode::CONFLICT,
            Json(json!({ "error": "generation already in progress" })),
        )
            .into_response());
    }

    let session_id = body.session_id.clone();
    tokio::spawn(run_step(state.clone(), conversation_id, session_id.clone(), false));

    Ok(Json(json!({
        "status": "ok",
        "message": "generation started",
        "session_id": session_id,
    }))
    .into_response())
}

/// Advances the tool FSM for one pending tool.
pub async fn tool_confirm(
    State(state): State<Arc<AppState>>,
    Path(conversation_id): Path<String>,
    Json(body): Json<ConfirmBody>,
) -> ApiResult<Json<serde_json::Value>> {
    let known = state
        .sessions
        .with_session(&body.session_id, |session| {
            session.pending_tools.contains_key(&body.tool_id)
        })?;
    if !known {
        return Err(crate::Error::ToolNotFound(body.tool_id).into());
    }

    match body.action.as_str() {
        "confirm" => {
            tokio::spawn(confirm_flow(
                state.clone(),
                conversation_id,
                body.session_id,
                body.tool_id,
                None,
            ));
        }
        "edit" => {
            let content = body.content.ok_or_else(|| {
                crate::Error::invalid_input("content is required for the edit action")
            })?;
            tokio::spawn(confirm_flow(
                state.clone(),
                conversation_id,
                body.session_id,
                body.tool_id,
                Some(content),
            ));
        }
        "skip" => {
            tokio::spawn(skip_flow(
                state.clone(),
                conversation_id,
                body.session_id,
                body.tool_id,
            ));
        }
        "auto" => {
            let count = body.count.unwrap_or(1);
            if count == 0 {
                return Err(crate::Error::invalid_input("count must be positive").into());
            }
            state
                .sessions
                .with_session(&body.session_id, |session| {
                    session.auto_confirm_count = count;
                })?;
            tokio::spawn(confirm_flow(
                state.clone(),
                conversation_id,
                body.session_id,
                body.tool_id,
                None,
            ));
        }
        other => {
            return Err(crate::Error::invalid_input(format!("unknown action: {other}")).into());
        }
    }

    Ok(Json(json!({ "status": "ok" })))
}

/// Cancels the current generation and/or discards pending tools.
pub async fn interrupt(
    State(state): State<Arc<AppState>>,
    Path(conversation_id): Path<String>,
    Json(body): Json<InterruptBody>,
) -> ApiResult<Json<serde_json::Value>> {
    let (generating, had_pending, branch, cancel) =
        state.sessions.with_session(&body.session_id, |session| {
            let had_pending = !session.pending_tools.is_empty();
            session.pending_tools.clear();
            (
                session.generating,
                had_pending,
                session.branch.clone(),
                session.cancel.clone(),
            )
        })?;

    if !generating && !had_pending {
        return Err(
            crate::Error::invalid_input("no active generation or tool execution to interrupt")
                .into(),
        );
    }

    if generating {
        // The in-flight driver observes the flag, appends the marker, and
        // emits the interrupted event itself.
        cancel.cancel();
    } else {
        let lock = state.conversation_lock(&conversation_id);
        let _guard = lock.lock().await;
        append_to_log(&state, &conversation_id, &branch, Message::system(INTERRUPT_MARKER))?;
        state
            .sessions
            .add_event(&conversation_id, Event::Interrupted);
    }

    Ok(Json(json!({ "status": "ok", "message": "interrupted" })))
}

// Generation drivers
// ------------------

enum GenOutcome {
    Completed(String),
    ToolFound { output: String, tooluse: ToolUse },
    Interrupted(String),
}

enum ExecOutcome {
    /// Tool finished (or failed recoverably); generation should resume.
    Resume,
    /// Terminal for this step; back to idle.
    Stop,
}

/// The step loop: generate, pause at tool boundaries, auto-confirm while
/// budget remains, resume after execution.
pub async fn run_step(
    state: Arc<AppState>,
    conversation_id: String,
    session_id: String,
    mut resuming: bool,
) {
    let lock = state.conversation_lock(&conversation_id);
    let _guard = lock.lock().await;

    loop {
        let session_state = state.sessions.with_session(&session_id, |session| {
            session.generating = true;
            (
                session
                    .model
                    .clone()
                    .unwrap_or_else(|| state.default_model.clone()),
                session.branch.clone(),
                session.cancel.clone(),
                session.auto_confirm_count,
            )
        });
        let Ok((model_id, branch, cancel, auto_count)) = session_state else {
            return;
        };

        state.sessions.add_event(
            &conversation_id,
            if resuming {
                Event::GenerationResuming
            } else {
                Event::GenerationStarted
            },
        );

        let meta = get_model(&model_id);
        let outcome = generate_once(&state, &conversation_id, &meta, &branch, &cancel).await;

        match outcome {
            Err(err) => {
                tracing::error!(conversation = %conversation_id, error = %err, "generation failed");
                state.sessions.add_event(
                    &conversation_id,
                    Event::Error {
                        error: err.to_string(),
                    },
                );
                set_idle(&state, &session_id);
                return;
            }
            Ok(GenOutcome::Interrupted(output)) => {
                let content = if output.trim().is_empty() {
                    Message::system(INTERRUPT_MARKER)
                } else {
                    Message::assistant(format!("{output}\n{INTERRUPT_MARKER}"))
                };
                if let Err(err) = append_to_log(&state, &conversation_id, &branch, content) {
                    tracing::error!(error = %err, "failed to record interrupt marker");
                }
                let _ = state.sessions.with_session(&session_id, |session| {
                    session.pending_tools.clear();
                });
                state
                    .sessions
                    .add_event(&conversation_id, Event::Interrupted);
                set_idle(&state, &session_id);
                return;
            }
            Ok(GenOutcome::Completed(output)) => {
                if output.trim().is_empty() {
                    // Nothing to append; the generation still finished.
                    state.sessions.add_event(
                        &conversation_id,
                        Event::GenerationComplete {
                            message: MessageView::from(&Message::assistant("")),
                        },
                    );
                } else {
                    match append_to_log(
                        &state,
                        &conversation_id,
                        &branch,
                        Message::assistant(&output).quiet(),
                    ) {
                        Ok(msg) => state.sessions.add_event(
                            &conversation_id,
                            Event::GenerationComplete {
                                message: MessageView::from(&msg),
                            },
                        ),
                        Err(err) => state.sessions.add_event(
                            &conversation_id,
                            Event::Error {
                                error: err.to_string(),
                            },
                        ),
                    }
                }
                set_idle(&state, &session_id);
                return;
            }
            Ok(GenOutcome::ToolFound { output, tooluse }) => {
                state.sessions.add_event(
                    &conversation_id,
                    Event::GenerationComplete {
                        message: MessageView::from(&Message::assistant(&output)),
                    },
                );

                let auto = auto_count > 0;
                let tool_id = uuid::Uuid::new_v4().to_string();
                let exec = ToolExecution {
                    id: tool_id.clone(),
                    tool: tooluse.tool.clone(),
                    args: tooluse.args.clone(),
                    content: tooluse.content.clone(),
                    assistant_content: output,
                    status: ToolStatus::Pending,
                    result: None,
                    auto_confirm: auto,
                    edited_content: None,
                };
                let _ = state.sessions.with_session(&session_id, |session| {
                    session.pending_tools.insert(tool_id.clone(), exec);
                });
                state.sessions.add_event(
                    &conversation_id,
                    Event::ToolPending {
                        tool_id: tool_id.clone(),
                        tool: tooluse.tool.clone(),
                        args: tooluse.args.clone(),
                        content: tooluse.content.clone(),
                        auto_confirm: auto,
                    },
                );

                if auto {
                    let _ = state.sessions.with_session(&session_id, |session| {
                        session.auto_confirm_count = session.auto_confirm_count.saturating_sub(1);
                    });
                    match execute_pending_tool(&state, &conversation_id, &session_id, &tool_id, None)
                        .await
                    {
                        Ok(ExecOutcome::Resume) => {
                            resuming = true;
                            continue;
                        }
                        Ok(ExecOutcome::Stop) | Err(_) => {
                            set_idle(&state, &session_id);
                            return;
                        }
                    }
                }

                // Wait for the client's decision.
                set_idle(&state, &session_id);
                return;
            }
        }
    }
}

/// Confirm/edit flow: execute the pending tool, then resume generation.
pub async fn confirm_flow(
    state: Arc<AppState>,
    conversation_id: String,
    session_id: String,
    tool_id: String,
    edited: Option<String>,
) {
    let lock = state.conversation_lock(&conversation_id);
    let guard = lock.lock().await;
    let _ = state.sessions.with_session(&session_id, |session| {
        session.cancel.reset();
        session.generating = true;
    });

    match execute_pending_tool(&state, &conversation_id, &session_id, &tool_id, edited).await {
        Ok(ExecOutcome::Resume) => {
            drop(guard);
            run_step(state, conversation_id, session_id, true).await;
        }
        Ok(ExecOutcome::Stop) => {
            set_idle(&state, &session_id);
        }
        Err(err) => {
            state.sessions.add_event(
                &conversation_id,
                Event::Error {
                    error: err.to_string(),
                },
            );
            set_idle(&state, &session_id);
        }
    }
}

/// Skip flow: record the assistant message, mark skipped, resume.
pub async fn skip_flow(
    state: Arc<AppState>,
    conversation_id: String,
    session_id: String,
    tool_id: String,
) {
    let lock = state.conversation_lock(&conversation_id);
    let guard = lock.lock().await;

    let exec = state
        .sessions
        .with_session(&session_id, |session| {
            session.pending_tools.remove(&tool_id).map(|mut exec| {
                exec.status = ToolStatus::Skipped;
                exec
            })
        })
        .ok()
        .flatten();
    let Some(exec) = exec else {
        return;
    };

    let branch = state
        .sessions
        .with_session(&session_id, |session| session.branch.clone())
        .unwrap_or_else(|_| "main".to_string());
    if let Err(err) = append_to_log(
        &state,
        &conversation_id,
        &branch,
        Message::assistant(exec.assistant_content).quiet(),
    ) {
        tracing::error!(error = %err, "failed to append assistant message on skip");
    }
    state.sessions.add_event(
        &conversation_id,
        Event::ToolSkipped {
            tool_id: tool_id.clone(),
        },
    );

    drop(guard);
    let _ = state.sessions.with_session(&session_id, |session| {
        session.cancel.reset();
        session.generating = true;
    });
    run_step(state, conversation_id, session_id, true).await;
}

/// Streams one generation, watching for runnable tool-uses and the
/// session's cancellation flag.
async fn generate_once(
    state: &Arc<AppState>,
    conversation_id: &str,
    meta: &ModelMeta,
    branch: &str,
    cancel: &CancelToken,
) -> crate::Result<GenOutcome> {
    let manager = LogManager::load(
        state.logdir(conversation_id),
        LoadOptions {
            lock: false,
            branch: Some(branch.to_string()),
        },
    )?;
    let workspace = manager.workspace();
    let msgs = crate::context::prepare_messages(
        manager.log().messages(),
        Some(&workspace),
        meta,
        state.counter.as_ref(),
    );
    if msgs.is_empty() {
        return Err(crate::Error::invalid_input("no messages to process"));
    }

    let tool_format: ToolFormat = std::env::var("TOOL_FORMAT")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or_default();
    let tools = (tool_format == ToolFormat::Tool).then(|| state.registry.as_ref());

    let mut output = String::new();

    if meta.supports_streaming {
        let mut stream = state.provider.stream(&msgs, meta, tools).await?;
        let mut scanner = ToolUseScanner::new();
        let break_on_tool = crate::chat::break_on_tooluse();
        let poll_interval = Duration::from_millis(50);

        loop {
            if cancel.is_cancelled() {
                return Ok(GenOutcome::Interrupted(output));
            }
            let chunk = match tokio::time::timeout(poll_interval, stream.next()).await {
                Err(_) => continue,
                Ok(None) => break,
                Ok(Some(chunk)) => chunk?,
            };

            output.push_str(&chunk);
            state.sessions.add_event(
                conversation_id,
                Event::GenerationProgress {
                    token: chunk.clone(),
                },
            );

            if break_on_tool {
                if let Some(tooluse) = scanner.push(&chunk, &state.registry) {
                    return Ok(GenOutcome::ToolFound { output, tooluse });
                }
            }
        }
    } else {
        output = state.provider.chat(&msgs, meta, tools).await?;
        if cancel.is_cancelled() {
            return Ok(GenOutcome::Interrupted(output));
        }
        state.sessions.add_event(
            conversation_id,
            Event::GenerationProgress {
                token: output.clone(),
            },
        );
    }

    // The stream ended naturally; a complete tool block may still be
    // sitting in the output (unterminated final line, chat fallback, or
    // mid-stream breaking disabled).
    let found = ToolUse::iter_from_content(&output, &state.registry)
        .into_iter()
        .find(|tu| tu.is_runnable(&state.registry));
    match found {
        Some(tooluse) => Ok(GenOutcome::ToolFound { output, tooluse }),
        None => Ok(GenOutcome::Completed(output)),
    }
}

/// Executes one pending tool: appends the assistant message, streams tool
/// output into the log, and emits the tool FSM events.
///
/// Callers hold the conversation lock.
async fn execute_pending_tool(
    state: &Arc<AppState>,
    conversation_id: &str,
    session_id: &str,
    tool_id: &str,
    edited: Option<String>,
) -> crate::Result<ExecOutcome> {
    let (exec, branch, cancel) = state.sessions.with_session(session_id, |session| {
        let exec = session.pending_tools.get_mut(tool_id).map(|exec| {
            exec.status = ToolStatus::Executing;
            exec.edited_content = edited.clone();
            exec.clone()
        });
        (exec, session.branch.clone(), session.cancel.clone())
    })?;
    let Some(exec) = exec else {
        return Err(crate::Error::ToolNotFound(tool_id.to_string()));
    };

    state.sessions.add_event(
        conversation_id,
        Event::ToolExecuting {
            tool_id: tool_id.to_string(),
        },
    );

    // The assistant message is recorded verbatim, before any outputs.
    let assistant_msg = append_to_log(
        state,
        conversation_id,
        &branch,
        Message::assistant(&exec.assistant_content).quiet(),
    )?;

    // Resolve what actually runs: the original invocation, or the edited
    // content reparsed.
    let tooluse = if let Some(edited_content) = &edited {
        append_to_log(
            state,
            conversation_id,
            &branch,
            Message::system("(content was edited by user)").quiet(),
        )?;

        let reparsed = ToolUse::iter_from_content(edited_content, &state.registry)
            .into_iter()
            .find(|tu| tu.is_runnable(&state.registry));
        match reparsed {
            Some(tooluse) => tooluse,
            None => {
                // Plain edited text (no markup) reuses the original tool.
                let fallback = ToolUse::new(
                    exec.tool.clone(),
                    exec.args.clone(),
                    edited_content.clone(),
                );
                if !edited_content.contains("```") && fallback.is_runnable(&state.registry) {
                    fallback
                } else {
                    return fail_tool(
                        state,
                        conversation_id,
                        session_id,
                        tool_id,
                        "could not parse edited content as a runnable tool use",
                    );
                }
            }
        }
    } else {
        let mut tooluse = ToolUse::new(exec.tool.clone(), exec.args.clone(), exec.content.clone());
        tooluse.call_id = parse_call_id(&exec.assistant_content, &exec.tool);
        tooluse
    };

    let mut stream = match execute_tooluse(&tooluse, &state.registry, always_confirm()) {
        Ok(stream) => stream,
        Err(err) => {
            return fail_tool(state, conversation_id, session_id, tool_id, &err.to_string());
        }
    };

    let mut outputs: Vec<Message> = Vec::new();
    while let Some(result) = stream.next().await {
        // Cooperative cancellation: skip the next yield and discard the
        // rest, leaving already-appended output in the log.
        if cancel.is_cancelled() {
            append_to_log(state, conversation_id, &branch, Message::system(INTERRUPT_MARKER))?;
            let _ = state.sessions.with_session(session_id, |session| {
                session.pending_tools.clear();
            });
            state
                .sessions
                .add_event(conversation_id, Event::Interrupted);
            return Ok(ExecOutcome::Stop);
        }

        match result {
            Ok(mut msg) => {
                if msg.call_id.is_none() {
                    msg.call_id = tooluse.call_id.clone();
                }
                let appended = append_to_log(state, conversation_id, &branch, msg)?;
                state.sessions.add_event(
                    conversation_id,
                    Event::ToolOutput {
                        tool_id: tool_id.to_string(),
                        output: MessageView::from(&appended),
                    },
                );
                outputs.push(appended);
            }
            Err(err) => {
                // Surface the failure to the model and the client alike.
                append_to_log(
                    state,
                    conversation_id,
                    &branch,
                    Message::system(format!("Error: {err}")),
                )?;
                let _ = state.sessions.with_session(session_id, |session| {
                    if let Some(exec) = session.pending_tools.get_mut(tool_id) {
                        exec.status = ToolStatus::Failed;
                        exec.result = Some(err.to_string());
                    }
                    session.pending_tools.remove(tool_id);
                });
                state.sessions.add_event(
                    conversation_id,
                    Event::ToolFailed {
                        tool_id: tool_id.to_string(),
                        error: err.to_string(),
                    },
                );
                return Ok(ExecOutcome::Resume);
            }
        }
    }

    let result_text = outputs
        .iter()
        .map(|msg| msg.content.clone())
        .collect::<Vec<_>>()
        .join("\n");
    let _ = state.sessions.with_session(session_id, |session| {
        if let Some(exec) = session.pending_tools.get_mut(tool_id) {
            exec.status = ToolStatus::Completed;
            exec.result = Some(result_text.clone());
        }
        session.pending_tools.remove(tool_id);
    });

    let added_view = outputs
        .last()
        .map(MessageView::from)
        .unwrap_or_else(|| MessageView::from(&assistant_msg));
    state.sessions.add_event(
        conversation_id,
        Event::MessageAdded {
            message: added_view,
        },
    );

    Ok(ExecOutcome::Resume)
}

fn fail_tool(
    state: &Arc<AppState>,
    conversation_id: &str,
    session_id: &str,
    tool_id: &str,
    reason: &str,
) -> crate::Result<ExecOutcome> {
    let _ = state.sessions.with_session(session_id, |session| {
        if let Some(exec) = session.pending_tools.get_mut(tool_id) {
            exec.status = ToolStatus::Failed;
            exec.result = Some(reason.to_string());
        }
        session.pending_tools.remove(tool_id);
    });
    state.sessions.add_event(
        conversation_id,
        Event::ToolFailed {
            tool_id: tool_id.to_string(),
            error: reason.to_string(),
        },
    );
    Ok(ExecOutcome::Stop)
}

/// Recovers the provider call id for native-format invocations, so tool
/// results can carry it.
fn parse_call_id(assistant_content: &str, tool: &str) -> Option<String> {
    let prefix = format!("@{tool}(");
    assistant_content.lines().find_map(|line| {
        let rest = line.trim().strip_prefix(&prefix)?;
        let end = rest.find(')')?;
        let id = &rest[..end];
        (!id.is_empty()).then(|| id.to_string())
    })
}

fn set_idle(state: &Arc<AppState>, session_id: &str) {
    let _ = state.sessions.with_session(session_id, |session| {
        session.generating = false;
    });
}

/// Appends one message to a conversation branch, returning the message as
/// stored (timestamps may be clamped).
///
/// Callers hold the conversation's async lock.
fn append_to_log(
    state: &Arc<AppState>,
    conversation_id: &str,
    branch: &str,
    msg: Message,
) -> crate::Result<Message> {
    let mut manager = LogManager::load(
        state.logdir(conversation_id),
        LoadOptions {
            lock: false,
            branch: Some(branch.to_string()),
        },
    )?;
    manager.append(msg)?;
    Ok(manager
        .log()
        .last()
        .cloned()
        .expect("append left the log non-empty"))
}
