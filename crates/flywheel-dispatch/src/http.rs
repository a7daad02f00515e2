use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures::{Stream, StreamExt};
use std::collections::VecDeque;
use tracing::debug;

use flywheel_core::dispatch::{ExecutionTransport, WorkEvent, WorkRequest, WorkStream, WorkerAssignment};
use flywheel_core::errors::DispatchError;

/// Execution transport over HTTP. The worker exposes POST /execute and
/// answers with newline-delimited JSON work events; the body stream is
/// decoded incrementally so chunk boundaries may fall anywhere in a line.
pub struct HttpExecutionTransport {
    client: reqwest::Client,
}

impl HttpExecutionTransport {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }

    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }
}

impl Default for HttpExecutionTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ExecutionTransport for HttpExecutionTransport {
    async fn execute(
        &self,
        assignment: &WorkerAssignment,
        request: &WorkRequest,
    ) -> Result<WorkStream, DispatchError> {
        let url = format!("{}/execute", assignment.url.trim_end_matches('/'));
        debug!(worker_id = %assignment.worker_id, session_id = %request.session_id, %url, "dispatching work request");

        let response = self
            .client
            .post(&url)
            .json(request)
            .send()
            .await
            .map_err(|e| DispatchError::WorkerUnreachable(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(DispatchError::WorkerStatus {
                status: status.as_u16(),
                body,
            });
        }

        Ok(Box::pin(decode_work_events(Box::pin(response.bytes_stream()))))
    }
}

struct DecodeState<S> {
    inner: S,
    buf: BytesMut,
    queued: VecDeque<Result<WorkEvent, DispatchError>>,
    eof: bool,
}

/// Decode a byte stream of newline-delimited JSON into work events.
/// Partial lines are buffered until their terminating newline arrives; a
/// trailing unterminated line is decoded at end of stream.
pub fn decode_work_events<S, E>(inner: S) -> impl Stream<Item = Result<WorkEvent, DispatchError>>
where
    S: Stream<Item = Result<Bytes, E>> + Unpin,
    E: std::fmt::Display,
{
    let state = DecodeState {
        inner,
        buf: BytesMut::new(),
        queued: VecDeque::new(),
        eof: false,
    };

    futures::stream::unfold(state, |mut st| async move {
        loop {
            if let Some(item) = st.queued.pop_front() {
                return Some((item, st));
            }
            if st.eof {
                return None;
            }

            match st.inner.next().await {
                Some(Ok(chunk)) => {
                    st.buf.extend_from_slice(&chunk);
                    drain_lines(&mut st.buf, &mut st.queued);
                }
                Some(Err(e)) => {
                    st.eof = true;
                    st.queued
                        .push_back(Err(DispatchError::WorkerUnreachable(e.to_string())));
                }
                None => {
                    st.eof = true;
                    flush_trailing(&mut st.buf, &mut st.queued);
                }
            }
        }
    })
}

fn drain_lines(buf: &mut BytesMut, out: &mut VecDeque<Result<WorkEvent, DispatchError>>) {
    while let Some(pos) = buf.iter().position(|&b| b == b'\n') {
        let line = buf.split_to(pos + 1);
        push_line(&line[..pos], out);
    }
}

fn flush_trailing(buf: &mut BytesMut, out: &mut VecDeque<Result<WorkEvent, DispatchError>>) {
    if !buf.is_empty() {
        let line = buf.split();
        push_line(&line, out);
    }
}

fn push_line(raw: &[u8], out: &mut VecDeque<Result<WorkEvent, DispatchError>>) {
    let line = match std::str::from_utf8(raw) {
        Ok(s) => s.trim(),
        Err(e) => {
            out.push_back(Err(DispatchError::Protocol(format!("invalid utf-8: {e}"))));
            return;
        }
    };
    if line.is_empty() {
        return;
    }
    match serde_json::from_str::<WorkEvent>(line) {
        Ok(event) => out.push_back(Ok(event)),
        Err(e) => out.push_back(Err(DispatchError::Protocol(format!("bad event line: {e}")))),
    }
}
