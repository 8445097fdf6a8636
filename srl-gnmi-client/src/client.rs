//! One-shot gNMI client.
//!
//! The channel is created lazily: nothing is dialed until the first call, and
//! a dropped connection is re-established by the next call.

use std::collections::VecDeque;
use std::time::Duration;

use futures::StreamExt;
use futures::stream::BoxStream;
use hyper_util::rt::TokioIo;
use srl_exporter_common::TelemetryEvent;
use thiserror::Error;
use tokio::net::UnixStream;
use tonic::Request;
use tonic::client::Grpc;
use tonic::codec::ProstCodec;
use tonic::codegen::http::uri::PathAndQuery;
use tonic::transport::{Channel, Endpoint, Uri};
use tower::service_fn;
use tracing::debug;

use crate::config::{Credentials, GnmiAddress, GnmiConfig};
use crate::event::notification_to_events;
use crate::path::parse_path;
use crate::proto::{
    DataType, Encoding, GET_METHOD, GetRequest, GetResponse, Notification, SUBSCRIBE_METHOD,
    SubscribeRequest, SubscribeResponse, Subscription, SubscriptionList, subscribe_request,
    subscribe_response, subscription_list_mode,
};

/// gNMI client errors.
#[derive(Debug, Error)]
pub enum GnmiError {
    #[error("Invalid gNMI address '{address}': {reason}")]
    Address { address: String, reason: String },

    #[error("gNMI transport error: {0}")]
    Transport(String),

    #[error("gNMI call failed: {0}")]
    Status(#[from] tonic::Status),

    #[error("Invalid credentials metadata: {0}")]
    Metadata(#[from] tonic::metadata::errors::InvalidMetadataValue),

    #[error("gNMI server error {code}: {message}")]
    Server { code: u32, message: String },
}

/// Finite stream of events produced by a ONCE subscription.
pub type EventStream = BoxStream<'static, Result<TelemetryEvent, GnmiError>>;

/// Client for the node-local gNMI server.
#[derive(Debug, Clone)]
pub struct GnmiClient {
    channel: Channel,
    encoding: Encoding,
}

impl GnmiClient {
    /// Create a client with a lazily connected channel.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn connect_lazy(config: &GnmiConfig) -> Result<Self, GnmiError> {
        let timeout = Duration::from_millis(config.timeout_ms);

        let channel = match config.target() {
            GnmiAddress::Unix(path) => {
                // The authority is ignored by the connector below.
                let endpoint = Endpoint::from_static("http://localhost").connect_timeout(timeout);
                endpoint.connect_with_connector_lazy(service_fn(move |_: Uri| {
                    let path = path.clone();
                    async move { Ok::<_, std::io::Error>(TokioIo::new(UnixStream::connect(path).await?)) }
                }))
            }
            GnmiAddress::Tcp(addr) => Endpoint::from_shared(format!("http://{}", addr))
                .map_err(|e| GnmiError::Address {
                    address: config.address.clone(),
                    reason: e.to_string(),
                })?
                .connect_timeout(timeout)
                .connect_lazy(),
        };

        Ok(Self {
            channel,
            encoding: Encoding::JsonIetf,
        })
    }

    /// Issue a single `Subscribe` in ONCE mode over all `paths`.
    ///
    /// The returned stream ends when the server sends `sync_response` or
    /// closes the RPC.
    pub async fn subscribe_once(
        &self,
        paths: &[String],
        credentials: Option<&Credentials>,
    ) -> Result<EventStream, GnmiError> {
        let subscription = paths
            .iter()
            .map(|p| Subscription {
                path: Some(parse_path(p)),
                ..Default::default()
            })
            .collect();

        let subscribe_request = SubscribeRequest {
            request: Some(subscribe_request::Request::Subscribe(SubscriptionList {
                subscription,
                mode: subscription_list_mode::ONCE,
                encoding: self.encoding.to_proto(),
                ..Default::default()
            })),
        };

        let mut request = Request::new(futures::stream::iter(vec![subscribe_request]));
        if let Some(creds) = credentials {
            request
                .metadata_mut()
                .insert("username", creds.username.parse()?);
            request
                .metadata_mut()
                .insert("password", creds.password.parse()?);
        }

        let mut grpc = self.ready().await?;
        let codec: ProstCodec<SubscribeRequest, SubscribeResponse> = ProstCodec::default();
        let response = grpc
            .streaming(request, PathAndQuery::from_static(SUBSCRIBE_METHOD), codec)
            .await?;

        debug!(paths = paths.len(), "gNMI ONCE subscription established");

        let stream = futures::stream::unfold(
            (response.into_inner(), VecDeque::new(), false),
            |(mut inner, mut pending, mut done)| async move {
                loop {
                    if let Some(event) = pending.pop_front() {
                        return Some((Ok(event), (inner, pending, done)));
                    }
                    if done {
                        return None;
                    }
                    match inner.message().await {
                        Ok(Some(msg)) => match msg.response {
                            Some(subscribe_response::Response::Update(notification)) => {
                                pending.extend(notification_to_events(&notification));
                            }
                            Some(subscribe_response::Response::SyncResponse(_)) => done = true,
                            Some(subscribe_response::Response::Error(err)) => {
                                let err = GnmiError::Server {
                                    code: err.code,
                                    message: err.message,
                                };
                                return Some((Err(err), (inner, pending, true)));
                            }
                            None => {}
                        },
                        Ok(None) => done = true,
                        Err(status) => {
                            return Some((Err(status.into()), (inner, pending, true)));
                        }
                    }
                }
            },
        );

        Ok(stream.boxed())
    }

    /// Issue a `Get` for `paths` and return the notifications.
    pub async fn get(
        &self,
        paths: &[&str],
        data_type: DataType,
        encoding: Encoding,
        credentials: Option<&Credentials>,
    ) -> Result<Vec<Notification>, GnmiError> {
        let get_request = GetRequest {
            prefix: None,
            path: paths.iter().map(|p| parse_path(p)).collect(),
            r#type: data_type.to_proto(),
            encoding: encoding.to_proto(),
        };

        let mut request = Request::new(get_request);
        if let Some(creds) = credentials {
            request
                .metadata_mut()
                .insert("username", creds.username.parse()?);
            request
                .metadata_mut()
                .insert("password", creds.password.parse()?);
        }

        let mut grpc = self.ready().await?;
        let codec: ProstCodec<GetRequest, GetResponse> = ProstCodec::default();
        let response = grpc
            .unary(request, PathAndQuery::from_static(GET_METHOD), codec)
            .await?;

        Ok(response.into_inner().notification)
    }

    async fn ready(&self) -> Result<Grpc<Channel>, GnmiError> {
        let mut grpc = Grpc::new(self.channel.clone());
        grpc.ready()
            .await
            .map_err(|e| GnmiError::Transport(e.to_string()))?;
        Ok(grpc)
    }
}
