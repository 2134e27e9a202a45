use std::collections::VecDeque;
use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{Stream, StreamExt};
use serde::Deserialize;
use tracing::{debug, warn};

use crate::raw_event::RawEvent;
use crate::runtime::{
    AgentRuntime, ChildSession, EventStream, PermissionResponse, Result, RuntimeError,
};

// ---------------------------------------------------------------------------
// OpenCodeClient
// ---------------------------------------------------------------------------

/// [`AgentRuntime`] backed by an OpenCode server's HTTP API.
///
/// Every request carries `?directory=<work_dir>` so the server routes it to
/// the workspace of that worktree.
pub struct OpenCodeClient {
    client: reqwest::Client,
    base_url: String,
    request_timeout: Duration,
}

#[derive(Deserialize)]
struct SessionWire {
    id: String,
    #[serde(default)]
    title: String,
}

impl OpenCodeClient {
    pub fn new(base_url: impl Into<String>, request_timeout: Duration) -> Self {
        Self {
            // No client-wide timeout: it would also cut the event stream.
            client: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            request_timeout,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn session_path(session_id: &str, suffix: &str) -> String {
        format!("/session/{}{}", urlencoding::encode(session_id), suffix)
    }

    fn get(&self, path: &str, work_dir: &Path) -> reqwest::RequestBuilder {
        self.client
            .get(self.url(path))
            .query(&[("directory", work_dir.to_string_lossy())])
            .timeout(self.request_timeout)
    }

    fn post(&self, path: &str, work_dir: &Path) -> reqwest::RequestBuilder {
        self.client
            .post(self.url(path))
            .query(&[("directory", work_dir.to_string_lossy())])
            .timeout(self.request_timeout)
    }

    async fn send(&self, req: reqwest::RequestBuilder) -> Result<reqwest::Response> {
        let resp = req
            .send()
            .await
            .map_err(|e| RuntimeError::Transport(e.to_string()))?;
        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }
        let body = resp.text().await.unwrap_or_default();
        Err(RuntimeError::Status {
            status: status.as_u16(),
            body,
        })
    }

    async fn json<T: serde::de::DeserializeOwned>(resp: reqwest::Response) -> Result<T> {
        resp.json::<T>()
            .await
            .map_err(|e| RuntimeError::Decode(e.to_string()))
    }
}

#[async_trait]
impl AgentRuntime for OpenCodeClient {
    async fn create_session(&self, work_dir: &Path, title: &str) -> Result<String> {
        let resp = self
            .send(
                self.post("/session", work_dir)
                    .json(&serde_json::json!({ "title": title })),
            )
            .await?;
        let session: SessionWire = Self::json(resp).await?;
        debug!(session = %session.id, title, "runtime session created");
        Ok(session.id)
    }

    async fn is_alive(&self, work_dir: &Path, session_id: &str) -> Result<bool> {
        match self
            .send(self.get(&Self::session_path(session_id, ""), work_dir))
            .await
        {
            Ok(_) => Ok(true),
            Err(RuntimeError::Status { status: 404, .. }) => Ok(false),
            Err(e) => Err(e),
        }
    }

    async fn inject_system_context(
        &self,
        work_dir: &Path,
        session_id: &str,
        text: &str,
    ) -> Result<()> {
        let body = serde_json::json!({
            "noReply": true,
            "parts": [{ "type": "text", "text": text, "synthetic": true }],
        });
        self.send(
            self.post(&Self::session_path(session_id, "/message"), work_dir)
                .json(&body),
        )
        .await?;
        Ok(())
    }

    async fn send_command(
        &self,
        work_dir: &Path,
        session_id: &str,
        command: &str,
        args: &str,
    ) -> Result<()> {
        let body = serde_json::json!({ "command": command, "arguments": args });
        self.send(
            self.post(&Self::session_path(session_id, "/command"), work_dir)
                .json(&body),
        )
        .await?;
        Ok(())
    }

    async fn get_child_sessions(
        &self,
        work_dir: &Path,
        parent_id: &str,
    ) -> Result<Vec<ChildSession>> {
        let resp = self
            .send(self.get(&Self::session_path(parent_id, "/children"), work_dir))
            .await?;
        let sessions: Vec<SessionWire> = Self::json(resp).await?;
        Ok(sessions
            .into_iter()
            .map(|s| ChildSession {
                id: s.id,
                title: s.title,
            })
            .collect())
    }

    async fn subscribe_events(&self, work_dir: &Path) -> Result<EventStream> {
        let req = self
            .client
            .get(self.url("/event"))
            .query(&[("directory", work_dir.to_string_lossy())])
            .header(reqwest::header::ACCEPT, "text/event-stream");
        let resp = self.send(req).await?;

        Ok(Box::pin(decode_events(resp.bytes_stream())))
    }

    async fn respond_to_permission(
        &self,
        work_dir: &Path,
        session_id: &str,
        permission_id: &str,
        response: PermissionResponse,
    ) -> Result<bool> {
        let path = Self::session_path(
            session_id,
            &format!("/permissions/{}", urlencoding::encode(permission_id)),
        );
        let resp = self
            .send(
                self.post(&path, work_dir)
                    .json(&serde_json::json!({ "response": response.as_str() })),
            )
            .await?;
        Ok(Self::json::<bool>(resp).await.unwrap_or(true))
    }

    async fn abort_session(&self, work_dir: &Path, session_id: &str) -> Result<bool> {
        let resp = self
            .send(self.post(&Self::session_path(session_id, "/abort"), work_dir))
            .await?;
        Ok(Self::json::<bool>(resp).await.unwrap_or(true))
    }
}

// ---------------------------------------------------------------------------
// Server-sent events
// ---------------------------------------------------------------------------

/// Incremental `text/event-stream` decoder yielding `data` payloads.
///
/// Bytes are buffered until a full line is available, so a UTF-8 sequence
/// split across chunks decodes intact. Multi-line `data:` fields are joined
/// with `\n`; comments and other fields are dropped.
#[derive(Debug, Default)]
pub struct SseDecoder {
    buffer: Vec<u8>,
    data: Vec<String>,
}

impl SseDecoder {
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buffer.extend_from_slice(chunk);
        let mut out = Vec::new();

        while let Some(pos) = self.buffer.iter().position(|&b| b == b'\n') {
            let raw: Vec<u8> = self.buffer.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&raw);
            let line = line.trim_end_matches(['\n', '\r']);

            if line.is_empty() {
                if !self.data.is_empty() {
                    out.push(self.data.join("\n"));
                    self.data.clear();
                }
            } else if let Some(value) = line.strip_prefix("data:") {
                self.data.push(value.strip_prefix(' ').unwrap_or(value).to_string());
            }
        }
        out
    }
}

/// Decode an event-stream body into runtime events. Ends with the body or
/// at the first transport error.
fn decode_events<S, B, E>(bytes: S) -> impl Stream<Item = RawEvent> + Send + 'static
where
    S: Stream<Item = std::result::Result<B, E>> + Send + 'static,
    B: AsRef<[u8]> + Send,
    E: std::fmt::Display + Send,
{
    futures_util::stream::unfold(
        (Box::pin(bytes), SseDecoder::default(), VecDeque::<String>::new()),
        |(mut bytes, mut decoder, mut queue)| async move {
            loop {
                if let Some(payload) = queue.pop_front() {
                    let event = RawEvent::from_json(&payload);
                    return Some((event, (bytes, decoder, queue)));
                }
                match bytes.next().await {
                    Some(Ok(chunk)) => queue.extend(decoder.push(chunk.as_ref())),
                    Some(Err(e)) => {
                        warn!(error = %e, "runtime event stream failed");
                        return None;
                    }
                    None => return None,
                }
            }
        },
    )
}
