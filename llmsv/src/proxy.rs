//! リクエストルーター / プロキシ
//!
//! `ready` のデプロイメントにのみ推論リクエストを転送する。
//! ペイロードの `"stream": true` でストリーミング転送を選択し、
//! バックエンドのチャンクを受信順にそのまま中継する。

use crate::common::error::{CommonError, SvError, SvResult};
use crate::config::ProxyConfig;
use crate::registry::ModelRegistry;
use crate::types::DeploymentStatus;
use axum::body::{Body, Bytes};
use axum::http::{header, HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use futures::{stream, Stream, StreamExt, TryStreamExt};
use reqwest::Client;
use serde_json::Value;
use std::fmt;
use std::pin::Pin;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// 中継ストリーム
pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes, SvError>> + Send>>;

/// 転送先のOpenAI互換エンドポイント
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InferenceEndpoint {
    /// `/v1/chat/completions`
    ChatCompletions,
    /// `/v1/completions`
    Completions,
}

impl InferenceEndpoint {
    /// `/v1/` 以下のパス
    pub fn path(&self) -> &'static str {
        match self {
            Self::ChatCompletions => "chat/completions",
            Self::Completions => "completions",
        }
    }
}

/// 転送するリクエスト
#[derive(Debug, Clone)]
pub struct ProxyRequest {
    /// 転送先エンドポイント
    pub endpoint: InferenceEndpoint,
    /// JSONペイロード（そのまま転送する）
    pub payload: Value,
    /// Content-Type（未指定なら application/json）
    pub content_type: Option<String>,
    /// Authorization
    pub authorization: Option<String>,
}

impl ProxyRequest {
    /// ペイロードから作成
    pub fn new(endpoint: InferenceEndpoint, payload: Value) -> Self {
        Self {
            endpoint,
            payload,
            content_type: None,
            authorization: None,
        }
    }

    /// 受信ヘッダーのうち Content-Type と Authorization のみを引き継ぐ
    pub fn with_headers(mut self, headers: &HeaderMap) -> Self {
        let read = |name: header::HeaderName| {
            headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string)
        };
        self.content_type = read(header::CONTENT_TYPE);
        self.authorization = read(header::AUTHORIZATION);
        self
    }

    /// ストリーミング要求か（`"stream": true`）
    pub fn is_streaming(&self) -> bool {
        self.payload
            .get("stream")
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }
}

/// 転送結果
pub enum ProxyResponse {
    /// 全体を受信してから返す
    Buffered {
        /// バックエンドのステータス
        status: StatusCode,
        /// バックエンドのContent-Type
        content_type: Option<String>,
        /// レスポンスボディ
        body: Bytes,
    },
    /// チャンクを逐次中継する
    Streamed {
        /// バックエンドのステータス
        status: StatusCode,
        /// バックエンドのContent-Type
        content_type: Option<String>,
        /// チャンク列（バックエンドが閉じるか、レコードが削除されると終了）
        stream: ByteStream,
    },
}

impl ProxyResponse {
    /// バックエンドのステータス
    pub fn status(&self) -> StatusCode {
        match self {
            Self::Buffered { status, .. } | Self::Streamed { status, .. } => *status,
        }
    }

    /// ストリーミング応答か
    pub fn is_streamed(&self) -> bool {
        matches!(self, Self::Streamed { .. })
    }
}

impl fmt::Debug for ProxyResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Buffered {
                status,
                content_type,
                body,
            } => f
                .debug_struct("Buffered")
                .field("status", status)
                .field("content_type", content_type)
                .field("body_len", &body.len())
                .finish(),
            Self::Streamed {
                status,
                content_type,
                ..
            } => f
                .debug_struct("Streamed")
                .field("status", status)
                .field("content_type", content_type)
                .finish_non_exhaustive(),
        }
    }
}

fn content_type_header(content_type: Option<String>, fallback: &'static str) -> HeaderValue {
    content_type
        .and_then(|value| HeaderValue::from_str(&value).ok())
        .unwrap_or(HeaderValue::from_static(fallback))
}

impl IntoResponse for ProxyResponse {
    fn into_response(self) -> Response {
        let (status, content_type, body) = match self {
            Self::Buffered {
                status,
                content_type,
                body,
            } => (
                status,
                content_type_header(content_type, "application/json"),
                Body::from(body),
            ),
            Self::Streamed {
                status,
                content_type,
                stream,
            } => (
                status,
                content_type_header(content_type, "text/event-stream"),
                Body::from_stream(stream),
            ),
        };
        let mut response = Response::new(body);
        *response.status_mut() = status;
        response
            .headers_mut()
            .insert(header::CONTENT_TYPE, content_type);
        response
    }
}

/// reqwestのエラーを呼び出し側の語彙に変換する
///
/// 接続・タイムアウト・送受信の失敗は `Unavailable`、それ以外は `Internal`。
fn map_transport_error(identity: &str, error: reqwest::Error) -> SvError {
    if error.is_connect()
        || error.is_timeout()
        || error.is_request()
        || error.is_body()
        || error.is_decode()
    {
        SvError::Unavailable(format!("{identity}: {error}"))
    } else {
        SvError::Internal(format!("{identity}: {error}"))
    }
}

/// レコードが削除されるまでチャンクを中継する
///
/// 削除で打ち切られた場合は、正常終了と区別できるよう最後に `Unavailable` を流す。
fn relay_until_removed(
    upstream: ByteStream,
    lifetime: CancellationToken,
    identity: String,
) -> ByteStream {
    let relay = stream::unfold(Some(upstream), move |state| {
        let lifetime = lifetime.clone();
        let identity = identity.clone();
        async move {
            let mut upstream = state?;
            tokio::select! {
                biased;
                _ = lifetime.cancelled_owned() => {
                    debug!(identity = %identity, "Deployment removed, cutting stream");
                    let error = SvError::Unavailable(format!("{identity}: deployment removed"));
                    Some((Err(error), None))
                }
                item = upstream.next() => item.map(|item| (item, Some(upstream))),
            }
        }
    });
    Box::pin(relay)
}

/// リクエストルーター
#[derive(Clone)]
pub struct RequestRouter {
    registry: ModelRegistry,
    client: Client,
    config: ProxyConfig,
}

impl RequestRouter {
    /// 共有HTTPクライアントを指定して作成
    pub fn new(registry: ModelRegistry, client: Client, config: ProxyConfig) -> Self {
        Self {
            registry,
            client,
            config,
        }
    }

    /// identityまたは表示名で解決したデプロイメントにリクエストを転送する
    ///
    /// `ready` 以外のレコードには外部通信を行わず `NotReady` を返す。
    pub async fn route(&self, key: &str, request: ProxyRequest) -> SvResult<ProxyResponse> {
        let (record, lifetime) = self.registry.resolve(key).await?;
        if record.status != DeploymentStatus::Ready {
            return Err(SvError::NotReady {
                identity: record.identity,
                status: record.status,
            });
        }

        let streaming = request.is_streaming();
        let url = format!(
            "{}/v1/{}",
            record.endpoint_url.trim_end_matches('/'),
            request.endpoint.path()
        );
        let timeout = if streaming {
            self.config.streaming_timeout
        } else {
            self.config.buffered_timeout
        };
        let body = serde_json::to_vec(&request.payload).map_err(CommonError::from)?;

        let mut builder = self
            .client
            .post(&url)
            .header(
                header::CONTENT_TYPE,
                request
                    .content_type
                    .as_deref()
                    .unwrap_or("application/json"),
            )
            .timeout(timeout)
            .body(body);
        if let Some(authorization) = request.authorization.as_deref() {
            builder = builder.header(header::AUTHORIZATION, authorization);
        }

        debug!(identity = %record.identity, url = %url, streaming, "Forwarding request");
        let response = builder
            .send()
            .await
            .map_err(|e| map_transport_error(&record.identity, e))?;

        let status = response.status();
        let content_type = response
            .headers()
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);

        if !status.is_success() {
            let body = response
                .bytes()
                .await
                .map_err(|e| map_transport_error(&record.identity, e))?;
            warn!(
                identity = %record.identity,
                status = %status,
                body_len = body.len(),
                "Model server returned error"
            );
            return Err(SvError::Upstream {
                status,
                content_type,
                body,
            });
        }

        if streaming {
            let identity = record.identity.clone();
            let upstream: ByteStream = Box::pin(
                response
                    .bytes_stream()
                    .map_err(move |e| map_transport_error(&identity, e)),
            );
            return Ok(ProxyResponse::Streamed {
                status,
                content_type,
                stream: relay_until_removed(upstream, lifetime, record.identity),
            });
        }

        let body = response
            .bytes()
            .await
            .map_err(|e| map_transport_error(&record.identity, e))?;
        Ok(ProxyResponse::Buffered {
            status,
            content_type,
            body,
        })
    }
}
