use crate::config::AssistantConfig;
use crate::error::{AppError, Result};
use crate::models::ToolCallLog;
use crate::service::tools;
use dashmap::DashMap;
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use sqlx::PgPool;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, OwnedMutexGuard};

#[derive(Debug, Deserialize)]
struct Thread {
    id: String,
}

#[derive(Debug, Deserialize)]
struct Run {
    id: String,
    status: String,
    required_action: Option<RequiredAction>,
    last_error: Option<RunError>,
}

#[derive(Debug, Deserialize)]
struct RequiredAction {
    submit_tool_outputs: SubmitToolOutputs,
}

#[derive(Debug, Deserialize)]
struct SubmitToolOutputs {
    tool_calls: Vec<RunToolCall>,
}

#[derive(Debug, Deserialize)]
struct RunToolCall {
    id: String,
    function: FunctionCall,
}

#[derive(Debug, Deserialize)]
struct FunctionCall {
    name: String,
    #[serde(default)]
    arguments: String,
}

#[derive(Debug, Deserialize)]
struct RunError {
    code: Option<String>,
    message: Option<String>,
}

#[derive(Debug, Deserialize)]
struct MessageList {
    data: Vec<ThreadMessage>,
}

#[derive(Debug, Deserialize)]
struct ThreadMessage {
    role: String,
    #[serde(default)]
    content: Vec<ContentPart>,
}

#[derive(Debug, Deserialize)]
struct ContentPart {
    #[serde(rename = "type")]
    kind: String,
    text: Option<TextValue>,
}

#[derive(Debug, Deserialize)]
struct TextValue {
    value: String,
}

/// run 状态归类
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RunPhase {
    Pending,
    NeedsTools,
    Completed,
    Failed,
}

fn phase(status: &str) -> RunPhase {
    match status {
        "queued" | "in_progress" | "cancelling" => RunPhase::Pending,
        "requires_action" => RunPhase::NeedsTools,
        "completed" => RunPhase::Completed,
        _ => RunPhase::Failed,
    }
}

/// 聊天结果
#[derive(Debug, Clone, Serialize)]
pub struct ChatReply {
    pub reply: String,
    pub thread_id: String,
    pub run_id: String,
    pub tool_calls: Vec<ToolCallLog>,
}

/// 托管 assistant 客户端, 工具调用回调到本地数据库查询
pub struct AssistantService {
    client: Client,
    config: AssistantConfig,
    pool: PgPool,
    /// 同一 thread 同时只能有一个 run
    thread_locks: DashMap<String, Arc<Mutex<()>>>,
}

impl AssistantService {
    pub fn new(config: AssistantConfig, pool: PgPool) -> Result<Self> {
        let client = Client::builder().timeout(Duration::from_secs(30)).build()?;
        Ok(Self {
            client,
            config,
            pool,
            thread_locks: DashMap::new(),
        })
    }

    pub async fn chat(&self, message: &str, thread_id: Option<String>) -> Result<ChatReply> {
        if self.config.api_key.is_empty() || self.config.assistant_id.is_empty() {
            return Err(AppError::Internal(
                "assistant.api_key / assistant.assistant_id are not configured".to_string(),
            ));
        }

        let thread_id = match thread_id.filter(|t| !t.trim().is_empty()) {
            Some(id) => id,
            None => {
                let thread: Thread = self.post("threads", &json!({})).await?;
                tracing::info!(thread_id = %thread.id, "created assistant thread");
                thread.id
            }
        };

        let _turn = self.lock_thread(&thread_id).await;
        self.run_turn(&thread_id, message).await
    }

    async fn lock_thread(&self, thread_id: &str) -> ThreadTurn<'_> {
        let lock = self
            .thread_locks
            .entry(thread_id.to_string())
            .or_default()
            .value()
            .clone();
        ThreadTurn {
            locks: &self.thread_locks,
            thread_id: thread_id.to_string(),
            guard: Some(lock.lock_owned().await),
        }
    }

    async fn run_turn(&self, thread_id: &str, message: &str) -> Result<ChatReply> {
        let _: Value = self
            .post(
                &format!("threads/{}/messages", thread_id),
                &json!({ "role": "user", "content": message }),
            )
            .await?;

        let mut run: Run = self
            .post(
                &format!("threads/{}/runs", thread_id),
                &json!({ "assistant_id": self.config.assistant_id }),
            )
            .await?;

        let mut tool_calls = Vec::new();
        let mut polls = 0u32;

        loop {
            match phase(&run.status) {
                RunPhase::Completed => break,
                RunPhase::NeedsTools => {
                    run = self
                        .submit_tool_outputs(thread_id, &run, &mut tool_calls)
                        .await?;
                }
                RunPhase::Pending => {
                    if polls >= self.config.max_polls {
                        return Err(AppError::upstream(
                            "assistant",
                            format!("run {} still {} after {} polls", run.id, run.status, polls),
                        ));
                    }
                    polls += 1;
                    tokio::time::sleep(Duration::from_millis(self.config.poll_interval_ms)).await;
                    run = self
                        .get(&format!("threads/{}/runs/{}", thread_id, run.id))
                        .await?;
                }
                RunPhase::Failed => {
                    let detail = run
                        .last_error
                        .as_ref()
                        .map(|e| {
                            format!(
                                "{}: {}",
                                e.code.as_deref().unwrap_or("error"),
                                e.message.as_deref().unwrap_or("")
                            )
                        })
                        .unwrap_or_default();
                    return Err(AppError::upstream(
                        "assistant",
                        format!("run {} {} {}", run.id, run.status, detail),
                    ));
                }
            }
        }

        let messages: MessageList = self
            .get(&format!(
                "threads/{}/messages?run_id={}&order=desc&limit=20",
                thread_id, run.id
            ))
            .await?;
        let reply = latest_assistant_text(&messages);

        tracing::info!(
            thread_id,
            run_id = %run.id,
            polls,
            tools = tool_calls.len(),
            "assistant run completed"
        );

        Ok(ChatReply {
            reply,
            thread_id: thread_id.to_string(),
            run_id: run.id,
            tool_calls,
        })
    }

    async fn submit_tool_outputs(
        &self,
        thread_id: &str,
        run: &Run,
        log: &mut Vec<ToolCallLog>,
    ) -> Result<Run> {
        let calls = run
            .required_action
            .as_ref()
            .map(|a| a.submit_tool_outputs.tool_calls.as_slice())
            .unwrap_or_default();

        let mut outputs = Vec::with_capacity(calls.len());
        for call in calls {
            let (output, ok) =
                tools::dispatch(&self.pool, &call.function.name, &call.function.arguments).await;
            tracing::info!(tool = %call.function.name, ok, "assistant tool call");
            log.push(ToolCallLog {
                name: call.function.name.clone(),
                arguments: call.function.arguments.clone(),
                ok,
            });
            outputs.push(json!({ "tool_call_id": call.id, "output": output }));
        }

        self.post(
            &format!("threads/{}/runs/{}/submit_tool_outputs", thread_id, run.id),
            &json!({ "tool_outputs": outputs }),
        )
        .await
    }

    async fn post<T: DeserializeOwned>(&self, path: &str, body: &Value) -> Result<T> {
        let response = self
            .client
            .post(self.url(path))
            .bearer_auth(self.config.api_key.expose())
            .header("OpenAI-Beta", "assistants=v2")
            .json(body)
            .send()
            .await?;
        decode(response).await
    }

    async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        let response = self
            .client
            .get(self.url(path))
            .bearer_auth(self.config.api_key.expose())
            .header("OpenAI-Beta", "assistants=v2")
            .send()
            .await?;
        decode(response).await
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.config.base_url.trim_end_matches('/'), path)
    }
}

/// 持有 thread 锁; 释放时 (包括请求被取消) 清理空闲的锁条目
struct ThreadTurn<'a> {
    locks: &'a DashMap<String, Arc<Mutex<()>>>,
    thread_id: String,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for ThreadTurn<'_> {
    fn drop(&mut self) {
        self.guard.take();
        self.locks
            .remove_if(&self.thread_id, |_, l| Arc::strong_count(l) == 1);
    }
}

async fn decode<T: DeserializeOwned>(response: reqwest::Response) -> Result<T> {
    if !response.status().is_success() {
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        return Err(AppError::upstream("assistant", format!("{status}: {body}")));
    }
    Ok(response.json().await?)
}

/// 列表按时间倒序, 取第一条 assistant 消息的文本
fn latest_assistant_text(messages: &MessageList) -> String {
    messages
        .data
        .iter()
        .find(|m| m.role == "assistant")
        .map(|m| {
            m.content
                .iter()
                .filter(|part| part.kind == "text")
                .filter_map(|part| part.text.as_ref().map(|t| t.value.as_str()))
                .collect::<Vec<_>>()
                .join("\n")
        })
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Secret;
    use axum::extract::{Path, State};
    use axum::http::StatusCode;
    use axum::routing::{get, post};
    use axum::{Json, Router};
    use sqlx::postgres::PgPoolOptions;

    /// 本地假 assistant 服务的 run 行为
    #[derive(Clone, Copy)]
    enum Script {
        /// 第一次轮询要求调用工具, 提交结果后完成
        ToolThenComplete,
        /// 一直 in_progress
        Stuck,
        /// 轮询时报 expired
        Expired,
        /// 稍作停顿后完成
        SlowComplete,
    }

    #[derive(Default)]
    struct Counters {
        polls: u32,
        submitted: Vec<Value>,
        active_runs: u32,
        max_active_runs: u32,
    }

    struct Fake {
        script: Script,
        counters: std::sync::Mutex<Counters>,
    }

    type FakeState = State<Arc<Fake>>;

    async fn create_thread() -> Json<Value> {
        Json(json!({"id": "thread_new"}))
    }

    async fn add_message() -> Json<Value> {
        Json(json!({"id": "msg_1", "role": "user"}))
    }

    async fn create_run(State(fake): FakeState) -> Json<Value> {
        let mut c = fake.counters.lock().unwrap();
        c.active_runs += 1;
        c.max_active_runs = c.max_active_runs.max(c.active_runs);
        Json(json!({"id": "run_1", "status": "queued"}))
    }

    async fn get_run(State(fake): FakeState, Path((_t, run_id)): Path<(String, String)>) -> Json<Value> {
        if matches!(fake.script, Script::SlowComplete) {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        let mut c = fake.counters.lock().unwrap();
        c.polls += 1;
        let run = match fake.script {
            Script::ToolThenComplete if c.submitted.is_empty() => json!({
                "id": run_id,
                "status": "requires_action",
                "required_action": {
                    "type": "submit_tool_outputs",
                    "submit_tool_outputs": {"tool_calls": [{
                        "id": "call_1",
                        "type": "function",
                        "function": {"name": "get_weather", "arguments": "{}"}
                    }]}
                }
            }),
            Script::Stuck => json!({"id": run_id, "status": "in_progress"}),
            Script::Expired => json!({
                "id": run_id,
                "status": "expired",
                "last_error": {"code": "timeout", "message": "run expired"}
            }),
            _ => {
                c.active_runs -= 1;
                json!({"id": run_id, "status": "completed"})
            }
        };
        Json(run)
    }

    async fn submit_outputs(State(fake): FakeState, Json(body): Json<Value>) -> Json<Value> {
        fake.counters.lock().unwrap().submitted.push(body);
        Json(json!({"id": "run_1", "status": "in_progress"}))
    }

    async fn list_messages() -> Json<Value> {
        Json(json!({"data": [
            {"role": "assistant", "content": [{"type": "text", "text": {"value": "No invoices from that vendor."}}]}
        ]}))
    }

    async fn spawn_fake(script: Script) -> (String, Arc<Fake>) {
        let fake = Arc::new(Fake {
            script,
            counters: std::sync::Mutex::new(Counters::default()),
        });
        let app = Router::new()
            .route("/threads", post(create_thread))
            .route("/threads/:thread_id/messages", post(add_message).get(list_messages))
            .route("/threads/:thread_id/runs", post(create_run))
            .route("/threads/:thread_id/runs/:run_id", get(get_run))
            .route(
                "/threads/:thread_id/runs/:run_id/submit_tool_outputs",
                post(submit_outputs),
            )
            .with_state(fake.clone());

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        (format!("http://{}", addr), fake)
    }

    fn service(base_url: String, max_polls: u32, poll_interval_ms: u64) -> AssistantService {
        let config = AssistantConfig {
            base_url,
            api_key: Secret::new("sk-test"),
            assistant_id: "asst_test".to_string(),
            poll_interval_ms,
            max_polls,
        };
        let pool = PgPoolOptions::new()
            .connect_lazy("postgres://localhost/rental_audit_test")
            .unwrap();
        AssistantService::new(config, pool).unwrap()
    }

    #[tokio::test]
    async fn tool_outputs_are_submitted_and_polling_continues() {
        let (url, fake) = spawn_fake(Script::ToolThenComplete).await;
        let assistant = service(url, 5, 1);

        let reply = assistant.chat("Any invoices from Acme?", None).await.unwrap();
        assert_eq!(reply.thread_id, "thread_new");
        assert_eq!(reply.run_id, "run_1");
        assert_eq!(reply.reply, "No invoices from that vendor.");
        assert_eq!(reply.tool_calls.len(), 1);
        assert_eq!(reply.tool_calls[0].name, "get_weather");
        assert!(!reply.tool_calls[0].ok);

        let c = fake.counters.lock().unwrap();
        assert_eq!(c.polls, 2);
        let outputs = &c.submitted[0]["tool_outputs"];
        assert_eq!(outputs[0]["tool_call_id"], "call_1");
        assert!(outputs[0]["output"].as_str().unwrap().contains("unknown tool"));
        assert!(assistant.thread_locks.is_empty());
    }

    #[tokio::test]
    async fn exhausted_polls_are_bad_gateway() {
        let (url, fake) = spawn_fake(Script::Stuck).await;
        let assistant = service(url, 3, 1);

        let err = assistant.chat("hello", Some("thread_9".into())).await.unwrap_err();
        assert_eq!(err.status(), StatusCode::BAD_GATEWAY);
        assert!(err.to_string().contains("after 3 polls"));
        assert_eq!(fake.counters.lock().unwrap().polls, 3);
        assert!(assistant.thread_locks.is_empty());
    }

    #[tokio::test]
    async fn expired_run_is_bad_gateway() {
        let (url, _fake) = spawn_fake(Script::Expired).await;
        let assistant = service(url, 5, 1);

        let err = assistant.chat("hello", Some("thread_9".into())).await.unwrap_err();
        assert_eq!(err.status(), StatusCode::BAD_GATEWAY);
        let message = err.to_string();
        assert!(message.contains("expired"));
        assert!(message.contains("timeout: run expired"));
    }

    #[tokio::test]
    async fn runs_on_one_thread_do_not_overlap() {
        let (url, fake) = spawn_fake(Script::SlowComplete).await;
        let assistant = service(url, 5, 1);

        let (a, b) = tokio::join!(
            assistant.chat("first", Some("thread_shared".into())),
            assistant.chat("second", Some("thread_shared".into())),
        );
        assert!(a.is_ok());
        assert!(b.is_ok());

        let c = fake.counters.lock().unwrap();
        assert_eq!(c.max_active_runs, 1);
        assert_eq!(c.active_runs, 0);
        assert!(assistant.thread_locks.is_empty());
    }

    #[tokio::test]
    async fn cancelled_chat_releases_thread_lock() {
        let (url, _fake) = spawn_fake(Script::Stuck).await;
        let assistant = service(url, 100, 50);

        let cancelled = tokio::time::timeout(
            Duration::from_millis(30),
            assistant.chat("hello", Some("thread_gone".into())),
        )
        .await;
        assert!(cancelled.is_err());
        assert!(assistant.thread_locks.is_empty());
    }

    #[test]
    fn run_status_phases() {
        assert_eq!(phase("queued"), RunPhase::Pending);
        assert_eq!(phase("in_progress"), RunPhase::Pending);
        assert_eq!(phase("requires_action"), RunPhase::NeedsTools);
        assert_eq!(phase("completed"), RunPhase::Completed);
        assert_eq!(phase("expired"), RunPhase::Failed);
        assert_eq!(phase("incomplete"), RunPhase::Failed);
    }

    #[test]
    fn decodes_required_tool_calls() {
        let run: Run = serde_json::from_value(json!({
            "id": "run_1",
            "status": "requires_action",
            "required_action": {
                "type": "submit_tool_outputs",
                "submit_tool_outputs": {
                    "tool_calls": [{
                        "id": "call_1",
                        "type": "function",
                        "function": {"name": "get_invoice", "arguments": "{\"invoice_id\": 3}"}
                    }]
                }
            },
            "last_error": null
        }))
        .unwrap();

        let calls = &run.required_action.unwrap().submit_tool_outputs.tool_calls;
        assert_eq!(calls[0].id, "call_1");
        assert_eq!(calls[0].function.name, "get_invoice");
    }

    #[test]
    fn picks_latest_assistant_text() {
        let messages: MessageList = serde_json::from_value(json!({
            "data": [
                {"role": "assistant", "content": [
                    {"type": "text", "text": {"value": "You overpaid $350", "annotations": []}},
                    {"type": "image_file", "image_file": {"file_id": "f"}}
                ]},
                {"role": "user", "content": [{"type": "text", "text": {"value": "How much?"}}]}
            ]
        }))
        .unwrap();
        assert_eq!(latest_assistant_text(&messages), "You overpaid $350");

        let empty: MessageList = serde_json::from_value(json!({"data": []})).unwrap();
        assert_eq!(latest_assistant_text(&empty), "");
    }
}
