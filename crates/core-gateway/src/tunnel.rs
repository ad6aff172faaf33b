use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::response::Response;
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use http::header::AUTHORIZATION;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame as UpstreamCloseFrame;
use tokio_tungstenite::tungstenite::{self, Message as UpstreamMessage};
use tracing::{debug, info, warn};

use crate::error::GatewayError;
use crate::forward::bearer_header;
use crate::target::ProxyTarget;

type UpstreamSocket =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

/// Dial the upstream first, then accept the browser's upgrade and relay
/// frames both ways until either side closes or fails.
///
/// A failed dial is answered with the upstream's own status when it
/// replied, and 502 otherwise. The browser connection is never upgraded in
/// that case.
pub(crate) async fn forward_websocket(
    upgrade: WebSocketUpgrade,
    target: &ProxyTarget,
) -> Result<Response, GatewayError> {
    let ws_url = target.websocket_url();
    let mut request = ws_url.as_str().into_client_request()?;
    if let Some(bearer) = &target.bearer {
        request
            .headers_mut()
            .insert(AUTHORIZATION, bearer_header(bearer)?);
    }

    let upstream = match tokio_tungstenite::connect_async(request).await {
        Ok((socket, _)) => socket,
        Err(tungstenite::Error::Http(response)) => {
            let status = response.status();
            warn!(url = %ws_url, %status, "core upstream refused websocket");
            return Err(GatewayError::UpstreamRefused { status });
        }
        Err(err) => {
            warn!(url = %ws_url, %err, "core upstream websocket dial failed");
            return Err(GatewayError::Dial(err));
        }
    };

    info!(url = %ws_url, "core websocket tunnel opened");
    Ok(upgrade.on_upgrade(move |socket| async move {
        relay(socket, upstream).await;
        debug!(url = %ws_url, "core websocket tunnel closed");
    }))
}

async fn relay(client: WebSocket, upstream: UpstreamSocket) {
    let (mut client_tx, mut client_rx) = client.split();
    let (mut upstream_tx, mut upstream_rx) = upstream.split();

    tokio::select! {
        () = pump(&mut client_rx, &mut upstream_tx, to_upstream) => {}
        () = pump(&mut upstream_rx, &mut client_tx, to_client) => {}
    }

    let _ = upstream_tx.close().await;
    let _ = client_tx.close().await;
}

/// Copy frames from `source` to `sink` until a close frame, a read error or
/// a write error. Control frames are answered locally and not relayed.
async fn pump<R, W, M, N, RE, WE>(source: &mut R, sink: &mut W, convert: fn(M) -> Option<N>)
where
    R: Stream<Item = Result<M, RE>> + Unpin,
    W: Sink<N, Error = WE> + Unpin,
    M: IsClose,
    RE: std::fmt::Display,
    WE: std::fmt::Display,
{
    while let Some(next) = source.next().await {
        let message = match next {
            Ok(message) => message,
            Err(err) => {
                debug!(%err, "tunnel read failed");
                return;
            }
        };
        let closing = message.is_close();
        if let Some(out) = convert(message) {
            if let Err(err) = sink.send(out).await {
                debug!(%err, "tunnel write failed");
                return;
            }
        }
        if closing {
            return;
        }
    }
}

trait IsClose {
    fn is_close(&self) -> bool;
}

impl IsClose for Message {
    fn is_close(&self) -> bool {
        matches!(self, Message::Close(_))
    }
}

impl IsClose for UpstreamMessage {
    fn is_close(&self) -> bool {
        matches!(self, UpstreamMessage::Close(_))
    }
}

fn to_upstream(message: Message) -> Option<UpstreamMessage> {
    match message {
        Message::Text(text) => Some(UpstreamMessage::text(text.as_str().to_owned())),
        Message::Binary(bytes) => Some(UpstreamMessage::Binary(bytes)),
        Message::Close(frame) => Some(UpstreamMessage::Close(frame.map(|f| {
            UpstreamCloseFrame {
                code: CloseCode::from(f.code),
                reason: f.reason.as_str().to_owned().into(),
            }
        }))),
        Message::Ping(_) | Message::Pong(_) => None,
    }
}

fn to_client(message: UpstreamMessage) -> Option<Message> {
    match message {
        UpstreamMessage::Text(text) => Some(Message::Text(text.as_str().to_owned().into())),
        UpstreamMessage::Binary(bytes) => Some(Message::Binary(bytes)),
        UpstreamMessage::Close(frame) => Some(Message::Close(frame.map(|f| CloseFrame {
            code: f.code.into(),
            reason: f.reason.as_str().to_owned().into(),
        }))),
        UpstreamMessage::Ping(_) | UpstreamMessage::Pong(_) | UpstreamMessage::Frame(_) => None,
    }
}
