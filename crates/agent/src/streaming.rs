use std::fmt::Display;

use futures::{Stream, StreamExt};
use serde::Deserialize;
use tracing::debug;

use crate::llm::{LlmError, LlmTurn, ToolCallDirective, Usage};
use crate::notify::NotificationSink;

#[derive(Debug, Default, Deserialize)]
struct StreamChunk {
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    choices: Vec<StreamChoice>,
    #[serde(default)]
    usage: Option<Usage>,
    #[serde(default)]
    error: Option<StreamFailure>,
}

#[derive(Debug, Default, Deserialize)]
struct StreamFailure {
    #[serde(default)]
    message: String,
}

#[derive(Debug, Default, Deserialize)]
struct StreamChoice {
    #[serde(default)]
    delta: StreamDelta,
}

#[derive(Debug, Default, Deserialize)]
struct StreamDelta {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    tool_calls: Option<Vec<ToolCallDelta>>,
}

#[derive(Debug, Default, Deserialize)]
struct ToolCallDelta {
    #[serde(default)]
    index: Option<usize>,
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    function: Option<FunctionDelta>,
}

#[derive(Debug, Default, Deserialize)]
struct FunctionDelta {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    arguments: Option<String>,
}

#[derive(Debug, Default)]
struct PartialToolCall {
    id: String,
    name: String,
    arguments: String,
}

#[derive(Debug, Default)]
struct StreamAssembly {
    text: String,
    tool_calls: Vec<PartialToolCall>,
    usage: Option<Usage>,
    response_id: Option<String>,
}

impl StreamAssembly {
    fn apply_tool_call_deltas(&mut self, deltas: Vec<ToolCallDelta>) {
        for delta in deltas {
            let index = delta.index.unwrap_or(self.tool_calls.len());
            while self.tool_calls.len() <= index {
                self.tool_calls.push(PartialToolCall::default());
            }
            let call = &mut self.tool_calls[index];
            if let Some(id) = delta.id.filter(|id| !id.is_empty()) {
                call.id = id;
            }
            if let Some(function) = delta.function {
                if let Some(name) = function.name.filter(|name| !name.is_empty()) {
                    if call.name.is_empty() {
                        call.name = name;
                    } else if !call.name.ends_with(&name) {
                        call.name.push_str(&name);
                    }
                }
                if let Some(arguments) = function.arguments {
                    call.arguments.push_str(&arguments);
                }
            }
        }
    }

    fn finish(self) -> LlmTurn {
        let tool_calls = self
            .tool_calls
            .into_iter()
            .enumerate()
            .filter(|(_, call)| !call.name.is_empty())
            .map(|(index, call)| ToolCallDirective {
                id: if call.id.is_empty() { format!("call_{index}") } else { call.id },
                name: call.name,
                arguments: call.arguments,
            })
            .collect();

        LlmTurn {
            text: (!self.text.is_empty()).then_some(self.text),
            tool_calls,
            usage: self.usage,
            response_id: self.response_id,
        }
    }
}

enum Frame {
    Continue,
    Done,
}

async fn process_line(
    line: &str,
    assembly: &mut StreamAssembly,
    sink: &mut NotificationSink,
) -> Result<Frame, LlmError> {
    let line = line.trim_end_matches('\r');
    let Some(payload) = line.strip_prefix("data:") else {
        return Ok(Frame::Continue);
    };
    let payload = payload.trim();
    if payload.is_empty() {
        return Ok(Frame::Continue);
    }
    if payload == "[DONE]" {
        return Ok(Frame::Done);
    }

    let chunk: StreamChunk = serde_json::from_str(payload)
        .map_err(|error| LlmError::Decode(format!("stream frame: {error}")))?;
    if let Some(failure) = chunk.error {
        return Err(LlmError::Stream(failure.message));
    }
    if assembly.response_id.is_none() {
        assembly.response_id = chunk.id.filter(|id| !id.is_empty());
    }
    if let Some(usage) = chunk.usage {
        assembly.usage.get_or_insert_with(Usage::default).accumulate(&usage);
    }
    for choice in chunk.choices {
        if let Some(text) = choice.delta.content.filter(|text| !text.is_empty()) {
            assembly.text.push_str(&text);
            sink.push_answer_delta(&text).await;
        }
        if let Some(deltas) = choice.delta.tool_calls {
            assembly.apply_tool_call_deltas(deltas);
        }
    }
    Ok(Frame::Continue)
}

/// Consumes a `data: <json>` event stream, forwarding text increments to the
/// sink in batches and reassembling index-correlated tool-call fragments.
pub async fn relay_stream<S, B, E>(
    stream: S,
    sink: &mut NotificationSink,
) -> Result<LlmTurn, LlmError>
where
    S: Stream<Item = Result<B, E>>,
    B: AsRef<[u8]>,
    E: Display,
{
    let mut stream = std::pin::pin!(stream);
    let mut buffer: Vec<u8> = Vec::new();
    let mut assembly = StreamAssembly::default();
    let mut done = false;

    'read: while let Some(chunk) = stream.next().await {
        let bytes = chunk.map_err(|error| LlmError::Stream(error.to_string()))?;
        buffer.extend_from_slice(bytes.as_ref());

        while let Some(position) = buffer.iter().position(|byte| *byte == b'\n') {
            let line = buffer.drain(..=position).collect::<Vec<_>>();
            let line = String::from_utf8_lossy(&line[..line.len() - 1]).into_owned();
            if let Frame::Done = process_line(&line, &mut assembly, sink).await? {
                done = true;
                break 'read;
            }
        }
    }

    if !done && !buffer.is_empty() {
        let line = String::from_utf8_lossy(&buffer).into_owned();
        if let Frame::Done = process_line(&line, &mut assembly, sink).await? {
            done = true;
        }
    }
    sink.flush().await;

    debug!(
        event_name = "agent.streaming.finished",
        correlation_id = sink.channel_key(),
        terminated = done,
        text_len = assembly.text.len(),
        tool_calls = assembly.tool_calls.len(),
        "llm stream consumed"
    );
    Ok(assembly.finish())
}

#[cfg(test)]
mod tests {
    use std::convert::Infallible;
    use std::sync::Arc;

    use futures::stream;

    use super::relay_stream;
    use crate::llm::LlmError;
    use crate::notify::{NotificationSink, ProgressEvent};
    use crate::testing::RecordingChannel;

    fn chunks(parts: &[&str]) -> impl futures::Stream<Item = Result<Vec<u8>, Infallible>> {
        let owned = parts.iter().map(|part| Ok(part.as_bytes().to_vec())).collect::<Vec<_>>();
        stream::iter(owned)
    }

    #[tokio::test]
    async fn text_fragments_are_joined_and_relayed_in_batches() {
        let channel = Arc::new(RecordingChannel::default());
        let mut sink = NotificationSink::new(channel.clone(), "thread-1", 2);
        let body = chunks(&[
            "data: {\"id\":\"resp_1\",\"choices\":[{\"delta\":{\"content\":\"Two \"}}]}\n",
            "data: {\"choices\":[{\"delta\":{\"content\":\"chan",
            "nels\"}}]}\n\ndata: {\"choices\":[{\"delta\":{\"content\":\" found.\"}}]}\n",
            "data: {\"choices\":[],\"usage\":{\"prompt_tokens\":12,\"completion_tokens\":4,\"total_tokens\":16}}\n",
            "data: [DONE]\n",
        ]);

        let turn = relay_stream(body, &mut sink).await.expect("stream should parse");

        assert_eq!(turn.text.as_deref(), Some("Two channels found."));
        assert_eq!(turn.response_id.as_deref(), Some("resp_1"));
        assert_eq!(turn.usage.map(|usage| usage.total_tokens), Some(16));
        let batches = channel.batches();
        assert_eq!(batches.iter().map(|(_, events)| events.len()).collect::<Vec<_>>(), vec![2, 1]);
        assert_eq!(batches[1].1, vec![ProgressEvent::AnswerDelta { text: " found.".to_string() }]);
    }

    #[tokio::test]
    async fn tool_call_arguments_are_concatenated_per_index() {
        let body = chunks(&[
            "data: {\"choices\":[{\"delta\":{\"tool_calls\":[{\"index\":0,\"id\":\"call_a\",\"function\":{\"name\":\"list_channels\",\"arguments\":\"\"}}]}}]}\n",
            "data: {\"choices\":[{\"delta\":{\"tool_calls\":[{\"index\":1,\"id\":\"call_b\",\"function\":{\"name\":\"search_users\",\"arguments\":\"{\\\"te\"}}]}}]}\n",
            "data: {\"choices\":[{\"delta\":{\"tool_calls\":[{\"index\":0,\"function\":{\"arguments\":\"{\\\"limit\\\":\"}}]}}]}\n",
            "data: {\"choices\":[{\"delta\":{\"tool_calls\":[{\"index\":1,\"function\":{\"arguments\":\"rm\\\":\\\"al\"}}]}}]}\n",
            "data: {\"choices\":[{\"delta\":{\"tool_calls\":[{\"index\":0,\"function\":{\"arguments\":\"5}\"}}]}}]}\n",
            "data: {\"choices\":[{\"delta\":{\"tool_calls\":[{\"index\":1,\"function\":{\"arguments\":\"ice\\\"}\"}}]}}]}\n",
            "data: [DONE]\n",
        ]);

        let turn = relay_stream(body, &mut NotificationSink::noop()).await.expect("stream");

        assert_eq!(turn.text, None);
        assert_eq!(turn.tool_calls.len(), 2);
        assert_eq!(turn.tool_calls[0].id, "call_a");
        assert_eq!(turn.tool_calls[0].name, "list_channels");
        assert_eq!(turn.tool_calls[0].arguments, "{\"limit\":5}");
        assert_eq!(turn.tool_calls[1].name, "search_users");
        assert_eq!(turn.tool_calls[1].arguments, "{\"term\":\"alice\"}");
    }

    #[tokio::test]
    async fn unterminated_final_line_is_still_processed() {
        let body = chunks(&["data: {\"choices\":[{\"delta\":{\"content\":\"ok\"}}]}"]);
        let turn = relay_stream(body, &mut NotificationSink::noop()).await.expect("stream");
        assert_eq!(turn.text.as_deref(), Some("ok"));
    }

    #[tokio::test]
    async fn provider_error_frame_fails_the_stream() {
        let body = chunks(&["data: {\"error\":{\"message\":\"overloaded\"}}\n"]);
        let error = relay_stream(body, &mut NotificationSink::noop()).await.expect_err("error frame");
        assert_eq!(error, LlmError::Stream("overloaded".to_string()));
    }
}
