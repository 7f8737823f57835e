//! StreamAdapter: one provider-agnostic streaming call.
//!
//! Resolves the provider for a model through the [`ProviderRegistry`],
//! prepares image attachments for what that provider accepts, and folds the
//! provider's [`StreamEvent`]s into the canonical [`Chunk`] sequence:
//! zero or more `Content`/`Thinking` chunks followed by exactly one
//! `Complete` or `Error`. Nothing escapes the stream as an `Err`.

use std::sync::Arc;
use std::time::Instant;

use base64::Engine as _;
use futures_util::StreamExt;

use crate::registry::ProviderRegistry;
use crate::traits::{ChatRequest, LlmProvider, ProviderOptions};
use crate::util::from_reqwest;
use cs_domain::error::{Error, Result};
use cs_domain::message::{ContentPart, Message, MessageContent, Role};
use cs_domain::stream::{BoxStream, Chunk, StreamEvent, Usage};
use cs_domain::trace::TraceEvent;

/// Largest image accepted for inlining.
const MAX_IMAGE_BYTES: usize = 20 * 1024 * 1024;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Request
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Everything one streaming call needs.
#[derive(Debug, Clone, Default)]
pub struct StreamRequest {
    pub model: String,
    pub messages: Vec<Message>,
    /// Image URLs (`https:` or `data:`) attached to the last user message.
    pub images: Vec<String>,
    pub options: ProviderOptions,
    pub max_tokens: Option<u32>,
    pub temperature: Option<f32>,
    /// Only used to correlate trace events.
    pub step_id: Option<String>,
}

impl StreamRequest {
    pub fn prompt(model: impl Into<String>, prompt: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            messages: vec![Message::user(prompt)],
            ..Default::default()
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Adapter
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Clone)]
pub struct StreamAdapter {
    registry: Arc<ProviderRegistry>,
    http: reqwest::Client,
    default_max_tokens: u32,
    default_temperature: f32,
}

impl StreamAdapter {
    pub fn new(
        registry: Arc<ProviderRegistry>,
        default_max_tokens: u32,
        default_temperature: f32,
    ) -> Self {
        Self {
            registry,
            http: reqwest::Client::new(),
            default_max_tokens,
            default_temperature,
        }
    }

    pub fn registry(&self) -> &Arc<ProviderRegistry> {
        &self.registry
    }

    /// Single-prompt convenience over [`StreamAdapter::stream_messages`].
    pub fn stream(
        &self,
        model: &str,
        prompt: &str,
        images: Vec<String>,
        options: ProviderOptions,
    ) -> BoxStream<'static, Chunk> {
        self.stream_messages(StreamRequest {
            images,
            options,
            ..StreamRequest::prompt(model, prompt)
        })
    }

    /// Start a streaming call. Nothing happens until the stream is polled;
    /// dropping it drops the upstream HTTP request.
    pub fn stream_messages(&self, req: StreamRequest) -> BoxStream<'static, Chunk> {
        let this = self.clone();
        Box::pin(async_stream::stream! {
            let started = Instant::now();
            let Some(provider) = this.registry.resolve(&req.model) else {
                yield Chunk::Error {
                    message: format!("no provider configured for model '{}'", req.model),
                };
                return;
            };
            let provider_id = provider.provider_id().to_string();
            let model = req.model.clone();
            let step_id = req.step_id.clone();

            let chat = match this.prepare(provider.as_ref(), req).await {
                Ok(chat) => chat,
                Err(e) => {
                    yield Chunk::Error { message: e.to_string() };
                    return;
                }
            };

            let upstream = match provider.chat_stream(chat).await {
                Ok(s) => s,
                Err(e) => {
                    tracing::warn!(provider = %provider_id, model = %model, error = %e, "provider call failed");
                    TraceEvent::LlmRequest {
                        provider: provider_id,
                        model,
                        step_id,
                        duration_ms: started.elapsed().as_millis() as u64,
                        prompt_tokens: 0,
                        completion_tokens: 0,
                        ok: false,
                    }
                    .emit();
                    yield Chunk::Error { message: e.to_string() };
                    return;
                }
            };

            let mut folded = fold_events(upstream);
            let mut usage = Usage::default();
            let mut ok = true;
            while let Some(chunk) = folded.next().await {
                match &chunk {
                    Chunk::Complete { usage: u, .. } => usage = *u,
                    Chunk::Error { .. } => ok = false,
                    _ => {}
                }
                yield chunk;
            }

            TraceEvent::LlmRequest {
                provider: provider_id,
                model,
                step_id,
                duration_ms: started.elapsed().as_millis() as u64,
                prompt_tokens: usage.prompt_tokens,
                completion_tokens: usage.completion_tokens,
                ok,
            }
            .emit();
        })
    }

    /// Build the provider request, attaching images the way the provider
    /// accepts them.
    async fn prepare(&self, provider: &dyn LlmProvider, req: StreamRequest) -> Result<ChatRequest> {
        let caps = provider.capabilities();
        let mut messages = req.messages;

        if !req.images.is_empty() {
            if !caps.supports_vision {
                tracing::warn!(
                    provider = %provider.provider_id(),
                    count = req.images.len(),
                    "provider has no vision support, dropping images"
                );
            } else {
                let mut parts = Vec::with_capacity(req.images.len());
                for url in &req.images {
                    parts.push(if caps.requires_inline_images {
                        self.inline_image(url).await?
                    } else {
                        ContentPart::ImageUrl { url: url.clone() }
                    });
                }
                attach_to_last_user(&mut messages, parts);
            }
        }

        Ok(ChatRequest {
            messages,
            temperature: Some(req.temperature.unwrap_or(self.default_temperature)),
            max_tokens: Some(req.max_tokens.unwrap_or(self.default_max_tokens)),
            model: Some(req.model),
            options: req.options,
        })
    }

    async fn inline_image(&self, url: &str) -> Result<ContentPart> {
        if let Some(part) = decode_data_url(url) {
            return Ok(part);
        }

        let resp = self.http.get(url).send().await.map_err(from_reqwest)?;
        if !resp.status().is_success() {
            return Err(Error::Http(format!(
                "failed to fetch image {url}: HTTP {}",
                resp.status().as_u16()
            )));
        }
        let header_type = resp
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.split(';').next().unwrap_or(v).trim().to_string())
            .filter(|v| v.starts_with("image/"));
        let bytes = resp.bytes().await.map_err(from_reqwest)?;
        if bytes.len() > MAX_IMAGE_BYTES {
            return Err(Error::Validation(format!(
                "image {url} exceeds {} MB",
                MAX_IMAGE_BYTES / (1024 * 1024)
            )));
        }

        Ok(ContentPart::InlineImage {
            media_type: header_type.unwrap_or_else(|| guess_media_type(url).to_string()),
            data: base64::engine::general_purpose::STANDARD.encode(&bytes),
        })
    }
}

fn attach_to_last_user(messages: &mut Vec<Message>, images: Vec<ContentPart>) {
    let idx = match messages.iter().rposition(|m| m.role == Role::User) {
        Some(i) => i,
        None => {
            messages.push(Message::user_parts(Vec::new()));
            messages.len() - 1
        }
    };
    let msg = &mut messages[idx];
    let mut parts = match std::mem::replace(&mut msg.content, MessageContent::Parts(Vec::new())) {
        MessageContent::Text(t) => vec![ContentPart::Text { text: t }],
        MessageContent::Parts(p) => p,
    };
    parts.extend(images);
    msg.content = MessageContent::Parts(parts);
}

/// `data:image/png;base64,AAAA` → inline image, without any fetch.
fn decode_data_url(url: &str) -> Option<ContentPart> {
    let rest = url.strip_prefix("data:")?;
    let (meta, data) = rest.split_once(',')?;
    let media_type = meta.strip_suffix(";base64")?;
    Some(ContentPart::InlineImage {
        media_type: if media_type.is_empty() {
            "image/png".into()
        } else {
            media_type.to_string()
        },
        data: data.to_string(),
    })
}

fn guess_media_type(url: &str) -> &'static str {
    let path = url.split(['?', '#']).next().unwrap_or(url).to_ascii_lowercase();
    if path.ends_with(".png") {
        "image/png"
    } else if path.ends_with(".gif") {
        "image/gif"
    } else if path.ends_with(".webp") {
        "image/webp"
    } else {
        "image/jpeg"
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Event fold
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Fold provider events into canonical chunks.
///
/// Content deltas are concatenated into the terminal `Complete`; usage
/// reports are merged. The first error ends the sequence.
pub fn fold_events(
    mut upstream: BoxStream<'static, Result<StreamEvent>>,
) -> BoxStream<'static, Chunk> {
    Box::pin(async_stream::stream! {
        let mut content = String::new();
        let mut usage = Usage::default();
        let mut splitter = ThinkTagSplitter::default();

        while let Some(event) = upstream.next().await {
            match event {
                Ok(StreamEvent::Token { text }) => {
                    for seg in splitter.push(&text) {
                        match seg {
                            Segment::Content(t) => {
                                content.push_str(&t);
                                yield Chunk::Content { text: t };
                            }
                            Segment::Thinking(t) => yield Chunk::Thinking { text: t },
                        }
                    }
                }
                Ok(StreamEvent::Thinking { text }) => yield Chunk::Thinking { text },
                Ok(StreamEvent::Done { usage: Some(u), .. }) => usage.merge(&u),
                Ok(StreamEvent::Done { usage: None, .. }) => {}
                Ok(StreamEvent::Error { message }) => {
                    yield Chunk::Error { message };
                    return;
                }
                Err(e) => {
                    yield Chunk::Error { message: e.to_string() };
                    return;
                }
            }
        }

        for seg in splitter.finish() {
            match seg {
                Segment::Content(t) => {
                    content.push_str(&t);
                    yield Chunk::Content { text: t };
                }
                Segment::Thinking(t) => yield Chunk::Thinking { text: t },
            }
        }
        yield Chunk::Complete { content, usage };
    })
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// <think> tag splitter
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

const OPEN_TAG: &str = "<think>";
const CLOSE_TAG: &str = "</think>";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Segment {
    Content(String),
    Thinking(String),
}

/// Splits `<think>…</think>` sections out of streamed text.
///
/// Tags may arrive split across deltas; a trailing fragment that could
/// still become a tag is held back until the next push.
#[derive(Debug, Default)]
pub struct ThinkTagSplitter {
    inside: bool,
    carry: String,
    /// Drop whitespace right after a closing tag.
    trim_next_content: bool,
}

impl ThinkTagSplitter {
    pub fn push(&mut self, text: &str) -> Vec<Segment> {
        let mut buf = std::mem::take(&mut self.carry);
        buf.push_str(text);
        let mut out = Vec::new();

        loop {
            let tag = if self.inside { CLOSE_TAG } else { OPEN_TAG };
            if let Some(pos) = buf.find(tag) {
                self.emit(&mut out, &buf[..pos]);
                self.inside = !self.inside;
                if !self.inside {
                    self.trim_next_content = true;
                }
                buf.drain(..pos + tag.len());
                continue;
            }
            let keep = partial_tag_suffix(&buf, tag);
            let cut = buf.len() - keep;
            self.emit(&mut out, &buf[..cut]);
            self.carry = buf[cut..].to_string();
            break;
        }
        out
    }

    /// Release whatever is held back at end of stream.
    pub fn finish(&mut self) -> Vec<Segment> {
        let rest = std::mem::take(&mut self.carry);
        let mut out = Vec::new();
        self.emit(&mut out, &rest);
        out
    }

    fn emit(&mut self, out: &mut Vec<Segment>, text: &str) {
        if self.inside {
            if !text.is_empty() {
                push_merged(out, Segment::Thinking(text.to_string()));
            }
            return;
        }
        let text = if self.trim_next_content {
            let t = text.trim_start();
            if !t.is_empty() {
                self.trim_next_content = false;
            }
            t
        } else {
            text
        };
        if !text.is_empty() {
            push_merged(out, Segment::Content(text.to_string()));
        }
    }
}

fn push_merged(out: &mut Vec<Segment>, seg: Segment) {
    match (out.last_mut(), seg) {
        (Some(Segment::Content(a)), Segment::Content(b)) => a.push_str(&b),
        (Some(Segment::Thinking(a)), Segment::Thinking(b)) => a.push_str(&b),
        (_, seg) => out.push(seg),
    }
}

/// Length of the longest suffix of `buf` that is a proper prefix of `tag`.
fn partial_tag_suffix(buf: &str, tag: &str) -> usize {
    (1..tag.len())
        .rev()
        .find(|&k| {
            k <= buf.len()
                && buf.is_char_boundary(buf.len() - k)
                && tag.starts_with(&buf[buf.len() - k..])
        })
        .unwrap_or(0)
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[cfg(test)]
mod tests {
    use super::*;

    fn events(list: Vec<Result<StreamEvent>>) -> BoxStream<'static, Result<StreamEvent>> {
        Box::pin(futures_util::stream::iter(list))
    }

    fn token(t: &str) -> Result<StreamEvent> {
        Ok(StreamEvent::Token { text: t.into() })
    }

    #[test]
    fn splitter_handles_tags_split_across_deltas() {
        let mut s = ThinkTagSplitter::default();
        let mut out = Vec::new();
        for piece in ["<thi", "nk>step one", " and two</th", "ink>\n\nThe answer", " is 4"] {
            out.extend(s.push(piece));
        }
        out.extend(s.finish());
        assert_eq!(
            out,
            vec![
                Segment::Thinking("step one".into()),
                Segment::Thinking(" and two".into()),
                Segment::Content("The answer".into()),
                Segment::Content(" is 4".into()),
            ]
        );
    }

    #[test]
    fn splitter_passes_lookalike_text_through() {
        let mut s = ThinkTagSplitter::default();
        let mut out = s.push("a < b and <thin");
        out.extend(s.push("g> is not a tag"));
        out.extend(s.finish());
        let text: String = out
            .into_iter()
            .map(|seg| match seg {
                Segment::Content(t) => t,
                Segment::Thinking(_) => panic!("no thinking expected"),
            })
            .collect();
        assert_eq!(text, "a < b and <thing> is not a tag");
    }

    #[tokio::test]
    async fn content_deltas_concatenate_to_complete() {
        let chunks: Vec<Chunk> = fold_events(events(vec![
            token("Hel"),
            Ok(StreamEvent::Thinking { text: "hmm".into() }),
            token("lo"),
            token(" world"),
            Ok(StreamEvent::Done {
                usage: Some(Usage::new(3, 2)),
                finish_reason: Some("stop".into()),
            }),
        ]))
        .collect()
        .await;

        let deltas: String = chunks
            .iter()
            .filter_map(|c| match c {
                Chunk::Content { text } => Some(text.as_str()),
                _ => None,
            })
            .collect();
        match chunks.last().unwrap() {
            Chunk::Complete { content, usage } => {
                assert_eq!(*content, deltas);
                assert_eq!(content, "Hello world");
                assert_eq!(*usage, Usage::new(3, 2));
            }
            other => panic!("expected Complete, got {other:?}"),
        }
        assert_eq!(chunks.iter().filter(|c| c.is_terminal()).count(), 1);
    }

    #[tokio::test]
    async fn error_mid_stream_yields_single_error_chunk() {
        let chunks: Vec<Chunk> = fold_events(events(vec![
            token("partial"),
            Err(Error::Http("connection reset".into())),
            token("never seen"),
        ]))
        .collect()
        .await;
        assert_eq!(chunks.len(), 2);
        assert!(matches!(&chunks[1], Chunk::Error { message } if message.contains("connection reset")));
    }

    #[tokio::test]
    async fn clean_close_without_usage_synthesizes_complete() {
        let chunks: Vec<Chunk> = fold_events(events(vec![token("ok")])).collect().await;
        assert_eq!(
            chunks.last(),
            Some(&Chunk::Complete {
                content: "ok".into(),
                usage: Usage::default()
            })
        );
    }

    #[test]
    fn data_urls_are_decoded_without_fetching() {
        match decode_data_url("data:image/webp;base64,UklGRg==") {
            Some(ContentPart::InlineImage { media_type, data }) => {
                assert_eq!(media_type, "image/webp");
                assert_eq!(data, "UklGRg==");
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(decode_data_url("https://example.com/a.png").is_none());
    }

    #[test]
    fn images_attach_to_last_user_message() {
        let mut messages = vec![
            Message::system("sys"),
            Message::user("first"),
            Message::assistant("reply"),
            Message::user("look"),
        ];
        attach_to_last_user(
            &mut messages,
            vec![ContentPart::ImageUrl { url: "https://x/y.png".into() }],
        );
        assert!(!messages[1].content.has_images());
        assert!(messages[3].content.has_images());
        assert_eq!(messages[3].content.extract_all_text(), "look");
    }

    #[test]
    fn media_type_guess_ignores_query() {
        assert_eq!(guess_media_type("https://cdn/x.PNG?sig=1"), "image/png");
        assert_eq!(guess_media_type("https://cdn/x"), "image/jpeg");
    }
}
