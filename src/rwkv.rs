use anyhow::{anyhow, bail, Context, Result};
use async_stream::try_stream;
use async_trait::async_trait;
use futures_core::stream::Stream;
use rand::{thread_rng, Rng};
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use std::pin::Pin;
use std::time::Duration;

/// Stop-token ids the RWKV server expects by default.
pub const DEFAULT_STOP_TOKENS: [i64; 3] = [0, 261, 24281];

const ALPHA_DECAY: f64 = 0.996;
const CHUNK_SIZE: u32 = 128;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

/// Sampling knobs forwarded to the inference endpoint.
#[derive(Debug, Clone)]
pub struct SamplingParams {
    pub max_tokens: u32,
    pub temperature: f64,
    pub top_p: f64,
    pub top_k: u32,
    pub alpha_presence: f64,
    pub alpha_frequency: f64,
    pub stop_tokens: Vec<i64>,
}

#[derive(Serialize)]
struct GenerateBody<'a> {
    contents: &'a [String],
    stream: bool,
    password: &'a str,
    max_tokens: u32,
    temperature: f64,
    top_p: f64,
    top_k: u32,
    alpha_presence: f64,
    alpha_frequency: f64,
    alpha_decay: f64,
    chunk_size: u32,
    pad_zero: bool,
    stop_tokens: &'a [i64],
}

#[derive(Debug, Deserialize)]
struct ChoiceMessage {
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChoiceDelta {
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: Option<ChoiceMessage>,
    delta: Option<ChoiceDelta>,
    text: Option<String>,
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GenerateResponse {
    choices: Option<Vec<Choice>>,
    text: Option<String>,
    content: Option<String>,
}

fn choice_text(choice: Choice) -> Option<String> {
    if let Some(content) = choice.message.and_then(|m| m.content) {
        return Some(content);
    }
    if let Some(content) = choice.delta.and_then(|d| d.content) {
        return Some(content);
    }
    choice.text
}

/// Pull completion texts out of a response, tolerating the field layouts the
/// server has been observed to use: `choices[].message.content`,
/// `choices[].delta.content`, `choices[].text`, then top-level `text` or
/// `content` as a last resort.
fn extract_texts(resp: GenerateResponse) -> Vec<String> {
    if let Some(choices) = resp.choices {
        let texts: Vec<String> = choices.into_iter().filter_map(choice_text).collect();
        if !texts.is_empty() {
            return texts;
        }
    }
    if let Some(text) = resp.text {
        return vec![text];
    }
    if let Some(content) = resp.content {
        return vec![content];
    }
    Vec::new()
}

enum StreamEvent {
    Skip,
    Done,
    Chunk { text: Option<String>, finished: bool },
}

fn parse_stream_line(line: &str) -> StreamEvent {
    let line = line.trim();
    if line.is_empty() || line.starts_with(':') {
        return StreamEvent::Skip;
    }
    if line == "data: [DONE]" {
        return StreamEvent::Done;
    }
    let Some(data) = line.strip_prefix("data: ") else {
        return StreamEvent::Skip;
    };
    let Ok(event) = serde_json::from_str::<GenerateResponse>(data) else {
        return StreamEvent::Skip;
    };
    let Some(choice) = event.choices.and_then(|c| c.into_iter().next()) else {
        return StreamEvent::Skip;
    };
    let finished = matches!(choice.finish_reason.as_deref(), Some("stop") | Some("length"));
    let text = choice.delta.and_then(|d| d.content);
    StreamEvent::Chunk { text, finished }
}

/// Render a chat history into the single conversation string the RWKV server
/// consumes: system text first, then `User:` / `Assistant:` turns, ending on
/// an open assistant turn. With thinking disabled the think block is closed
/// up front so the model answers directly.
pub fn render_conversation(messages: &[ChatMessage], enable_think: bool) -> String {
    let mut system = String::new();
    let mut user_prompt = String::new();
    let mut history = String::new();

    for msg in messages {
        match msg.role.as_str() {
            "system" => {
                system.push_str(&msg.content);
                system.push('\n');
            }
            "user" => {
                if history.is_empty() {
                    user_prompt.push_str(&msg.content);
                    user_prompt.push('\n');
                } else {
                    history.push_str(&format!("User: {}\n", msg.content));
                }
            }
            "assistant" => {
                history.push_str(&format!("Assistant: {}\n", msg.content));
            }
            _ => {}
        }
    }

    let mut content = system.trim().to_string();
    if !user_prompt.trim().is_empty() {
        content.push_str(&format!("\n\nUser: {}", user_prompt.trim()));
    }
    if !history.trim().is_empty() {
        content.push_str(&format!("\n\n{}", history.trim()));
    }
    if enable_think {
        content.push_str("\n\nAssistant: <think");
    } else {
        content.push_str("\n\nAssistant: <think>\n</think>");
    }
    content
}

/// HTTP client for one RWKV endpoint. Owned by the caller and passed where
/// needed; there is no shared global instance.
pub struct RwkvClient {
    http: Client,
    endpoint: String,
    password: String,
}

impl RwkvClient {
    pub fn new(
        endpoint: impl Into<String>,
        password: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self> {
        let http = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            http,
            endpoint: endpoint.into(),
            password: password.into(),
        })
    }

    /// Batch generation: one prompt per requested choice, all identical for
    /// multi-choice completion. Returns one raw text per usable choice.
    pub async fn generate(&self, prompts: &[String], params: &SamplingParams) -> Result<Vec<String>> {
        let body = GenerateBody {
            contents: prompts,
            stream: false,
            password: &self.password,
            max_tokens: params.max_tokens,
            temperature: params.temperature,
            top_p: params.top_p,
            top_k: params.top_k,
            alpha_presence: params.alpha_presence,
            alpha_frequency: params.alpha_frequency,
            alpha_decay: ALPHA_DECAY,
            chunk_size: CHUNK_SIZE,
            pad_zero: true,
            stop_tokens: &params.stop_tokens,
        };

        let res = with_retries(|| async {
            let resp = self.http.post(&self.endpoint).json(&body).send().await?;
            Ok::<_, anyhow::Error>(resp)
        })
        .await?;

        if res.status() != StatusCode::OK {
            let status = res.status();
            let text = res.text().await.unwrap_or_default();
            bail!("rwkv endpoint error {}: {}", status, text);
        }

        let parsed: GenerateResponse = res.json().await.context("parsing rwkv response JSON")?;
        let texts = extract_texts(parsed);
        if texts.is_empty() {
            bail!("rwkv response carried no recognizable text field");
        }
        Ok(texts)
    }

    /// Streaming generation over server-sent events. Yields incremental text
    /// chunks until the `[DONE]` sentinel, a terminal finish reason, or
    /// connection close.
    pub async fn generate_stream(
        &self,
        prompt: &str,
        params: &SamplingParams,
    ) -> Result<Pin<Box<dyn Stream<Item = Result<String>> + Send>>> {
        let prompts = vec![prompt.to_string()];
        let body = GenerateBody {
            contents: &prompts,
            stream: true,
            password: &self.password,
            max_tokens: params.max_tokens,
            temperature: params.temperature,
            top_p: params.top_p,
            top_k: params.top_k,
            alpha_presence: params.alpha_presence,
            alpha_frequency: params.alpha_frequency,
            alpha_decay: ALPHA_DECAY,
            chunk_size: CHUNK_SIZE,
            pad_zero: true,
            stop_tokens: &params.stop_tokens,
        };

        let res = with_retries(|| async {
            let resp = self
                .http
                .post(&self.endpoint)
                .header("Accept", "text/event-stream")
                .json(&body)
                .send()
                .await?;
            Ok::<_, anyhow::Error>(resp)
        })
        .await?;

        if res.status() != StatusCode::OK {
            let status = res.status();
            let text = res.text().await.unwrap_or_default();
            bail!("rwkv endpoint error {}: {}", status, text);
        }

        let byte_stream = res.bytes_stream();
        let s = try_stream! {
            use futures_util::StreamExt;
            futures_util::pin_mut!(byte_stream);
            // SSE events can straddle network chunks; keep the partial line.
            let mut buf = String::new();
            let mut done = false;
            while !done {
                let Some(chunk) = byte_stream.next().await else { break };
                let bytes = chunk.map_err(|e| anyhow!(e))?;
                buf.push_str(&String::from_utf8_lossy(&bytes));
                while let Some(pos) = buf.find('\n') {
                    let line: String = buf.drain(..=pos).collect();
                    match parse_stream_line(&line) {
                        StreamEvent::Skip => {}
                        StreamEvent::Done => {
                            done = true;
                            break;
                        }
                        StreamEvent::Chunk { text, finished } => {
                            if let Some(text) = text {
                                yield text;
                            }
                            if finished {
                                done = true;
                                break;
                            }
                        }
                    }
                }
            }
        };
        Ok(Box::pin(s))
    }
}

pub async fn with_retries<F, Fut, T>(mut f: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, anyhow::Error>>,
{
    let mut attempt = 0u32;
    let max_retries = 3u32;
    loop {
        match f().await {
            Ok(v) => return Ok(v),
            Err(e) => {
                attempt += 1;
                if attempt > max_retries {
                    return Err(e).context("request failed after retries");
                }
                let backoff_ms = (2u64.pow(attempt) * 100) + thread_rng().gen_range(0..100);
                tokio::time::sleep(Duration::from_millis(backoff_ms)).await;
            }
        }
    }
}

/// Seam between the completion engine and the inference service.
#[async_trait]
pub trait CompletionBackend: Send + Sync {
    /// Generate `num_choices` raw candidates for one prompt.
    async fn generate(&self, prompt: &str, num_choices: usize) -> Result<Vec<String>>;
}

pub struct RwkvBackend {
    client: RwkvClient,
    params: SamplingParams,
}

impl RwkvBackend {
    pub fn new(client: RwkvClient, params: SamplingParams) -> Self {
        Self { client, params }
    }
}

#[async_trait]
impl CompletionBackend for RwkvBackend {
    async fn generate(&self, prompt: &str, num_choices: usize) -> Result<Vec<String>> {
        let prompts = vec![prompt.to_string(); num_choices.max(1)];
        self.client.generate(&prompts, &self.params).await
    }
}

/// Deterministic offline backend, selected with the `mock` endpoint. Echoes
/// the last prompt line inside a code fence plus one fresh statement, which
/// exercises the full cleaning pipeline without a server.
pub struct MockBackend;

#[async_trait]
impl CompletionBackend for MockBackend {
    async fn generate(&self, prompt: &str, num_choices: usize) -> Result<Vec<String>> {
        let last = prompt
            .lines()
            .rev()
            .find(|l| !l.trim().is_empty())
            .unwrap_or_default();
        Ok(vec![
            format!("```\n{last}\nlet done = true;\n```");
            num_choices.max(1)
        ])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_message_content_shape() {
        let resp: GenerateResponse = serde_json::from_str(
            r#"{"choices":[{"message":{"content":"one"}},{"message":{"content":"two"}}]}"#,
        )
        .unwrap();
        assert_eq!(extract_texts(resp), vec!["one", "two"]);
    }

    #[test]
    fn extracts_choice_text_shape() {
        let resp: GenerateResponse =
            serde_json::from_str(r#"{"choices":[{"text":"plain"}]}"#).unwrap();
        assert_eq!(extract_texts(resp), vec!["plain"]);
    }

    #[test]
    fn extracts_top_level_fallbacks() {
        let resp: GenerateResponse = serde_json::from_str(r#"{"text":"top"}"#).unwrap();
        assert_eq!(extract_texts(resp), vec!["top"]);
        let resp: GenerateResponse = serde_json::from_str(r#"{"content":"deep"}"#).unwrap();
        assert_eq!(extract_texts(resp), vec!["deep"]);
    }

    #[test]
    fn empty_response_yields_nothing() {
        let resp: GenerateResponse = serde_json::from_str(r#"{"choices":[{}]}"#).unwrap();
        assert!(extract_texts(resp).is_empty());
    }

    #[test]
    fn stream_line_parses_delta() {
        let line = r#"data: {"choices":[{"delta":{"content":"tok"}}]}"#;
        match parse_stream_line(line) {
            StreamEvent::Chunk { text, finished } => {
                assert_eq!(text.as_deref(), Some("tok"));
                assert!(!finished);
            }
            _ => panic!("expected chunk"),
        }
    }

    #[test]
    fn stream_line_detects_finish() {
        let line = r#"data: {"choices":[{"delta":{},"finish_reason":"stop"}]}"#;
        match parse_stream_line(line) {
            StreamEvent::Chunk { text, finished } => {
                assert!(text.is_none());
                assert!(finished);
            }
            _ => panic!("expected chunk"),
        }
    }

    #[test]
    fn stream_line_skips_comments_and_ends_on_sentinel() {
        assert!(matches!(parse_stream_line(": keepalive"), StreamEvent::Skip));
        assert!(matches!(parse_stream_line(""), StreamEvent::Skip));
        assert!(matches!(parse_stream_line("data: [DONE]"), StreamEvent::Done));
        assert!(matches!(parse_stream_line("data: not json"), StreamEvent::Skip));
    }

    #[test]
    fn renders_single_user_turn() {
        let msgs = vec![
            ChatMessage { role: "system".into(), content: "Be terse.".into() },
            ChatMessage { role: "user".into(), content: "hi".into() },
        ];
        let out = render_conversation(&msgs, false);
        assert_eq!(out, "Be terse.\n\nUser: hi\n\nAssistant: <think>\n</think>");
    }

    #[test]
    fn renders_history_turns() {
        let msgs = vec![
            ChatMessage { role: "user".into(), content: "first".into() },
            ChatMessage { role: "assistant".into(), content: "reply".into() },
            ChatMessage { role: "user".into(), content: "second".into() },
        ];
        let out = render_conversation(&msgs, true);
        assert!(out.starts_with("\n\nUser: first"));
        assert!(out.contains("Assistant: reply\nUser: second"));
        assert!(out.ends_with("Assistant: <think"));
    }

    #[tokio::test]
    async fn mock_backend_echoes_last_line() {
        let out = MockBackend.generate("let a = 1;\nlet b = 2;", 2).await.unwrap();
        assert_eq!(out.len(), 2);
        assert!(out[0].contains("let b = 2;"));
        assert!(out[0].contains("let done = true;"));
    }
}
