use crate::core::{Result, RunStateError};
use crate::resolver::StreamResolver;
use crate::stream::{MuxEvent, MuxOptions, SseDecoder, spawn_mux};
use async_trait::async_trait;
use futures::StreamExt;
use futures::stream::BoxStream;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Header an upstream auth layer sets for signed-in viewers
pub const VIEWER_HEADER: &str = "x-runstate-viewer";

pub type EventStream = BoxStream<'static, Result<MuxEvent>>;

/// Opens one multiplexed connection for a single stream.
///
/// Dropping the returned stream closes the connection.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, stream_id: &str, start_index: u64) -> Result<EventStream>;
}

/// In-process connector that talks to a resolver directly
pub struct LocalConnector {
    resolver: Arc<StreamResolver>,
    visibility: Vec<String>,
    options: MuxOptions,
}

impl LocalConnector {
    pub fn new(resolver: Arc<StreamResolver>, options: MuxOptions) -> Self {
        Self {
            resolver,
            visibility: vec!["auth:public".to_string()],
            options,
        }
    }

    /// Replace the tags that make a stream visible
    pub fn with_visibility<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.visibility = tags.into_iter().map(Into::into).collect();
        self
    }
}

#[async_trait]
impl Connector for LocalConnector {
    async fn connect(&self, stream_id: &str, start_index: u64) -> Result<EventStream> {
        let ids = [stream_id.to_string()];
        let visible = self.resolver.visible_streams(&ids, &self.visibility).await?;
        let sources = self.resolver.open_readers(&visible, start_index).await?;

        let cancel = CancellationToken::new();
        let guard = cancel.clone().drop_guard();
        let mut rx = spawn_mux(sources, cancel, self.options);

        let events = async_stream::stream! {
            let _guard = guard;
            while let Some(event) = rx.recv().await {
                yield Ok::<_, RunStateError>(event);
            }
        };
        Ok(events.boxed())
    }
}

/// Connector that reads the SSE endpoint of a remote server
pub struct HttpConnector {
    client: reqwest::Client,
    base_url: String,
    viewer: Option<String>,
}

impl HttpConnector {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            viewer: None,
        }
    }

    /// Send requests as a signed-in viewer
    pub fn with_viewer(mut self, viewer: impl Into<String>) -> Self {
        self.viewer = Some(viewer.into());
        self
    }

    fn http_error(stream_id: &str, err: reqwest::Error) -> RunStateError {
        RunStateError::stream_read(stream_id, err.to_string())
    }
}

#[async_trait]
impl Connector for HttpConnector {
    async fn connect(&self, stream_id: &str, start_index: u64) -> Result<EventStream> {
        let url = format!("{}/api/stream", self.base_url);
        let start = start_index.to_string();
        let mut request = self
            .client
            .get(&url)
            .query(&[("stream", stream_id), ("startIndex", start.as_str())]);
        if let Some(viewer) = &self.viewer {
            request = request.header(VIEWER_HEADER, viewer);
        }

        let response = request
            .send()
            .await
            .and_then(|response| response.error_for_status())
            .map_err(|err| Self::http_error(stream_id, err))?;
        debug!(url = %url, stream = stream_id, start_index, "sse connected");

        let stream_id = stream_id.to_string();
        let mut body = Box::pin(response.bytes_stream());
        let events = async_stream::stream! {
            let mut decoder = SseDecoder::new();
            while let Some(chunk) = body.next().await {
                let chunk = match chunk {
                    Ok(chunk) => chunk,
                    Err(err) => {
                        yield Err(Self::http_error(&stream_id, err));
                        break;
                    }
                };
                match decoder.push(&chunk) {
                    Ok(decoded) => {
                        for event in decoded {
                            yield Ok(event);
                        }
                    }
                    Err(err) => {
                        yield Err(err);
                        break;
                    }
                }
            }
        };
        Ok(events.boxed())
    }
}
