//! Thin JSON-typed wrapper over the voice gateway websocket.

use crate::model::{Event, GatewayMsg};
use futures::{SinkExt, StreamExt, TryStreamExt};
use serde_json::Error as JsonError;
use tokio::{
    net::TcpStream,
    time::{timeout, Duration},
};
use tokio_tungstenite::{
    connect_async,
    tungstenite::{protocol::CloseFrame, Error as TungsteniteError, Message},
    MaybeTlsStream,
    WebSocketStream,
};
use tracing::debug;
use url::Url;

pub(crate) type Result<T> = std::result::Result<T, Error>;

#[derive(Debug)]
pub(crate) enum Error {
    Json(JsonError),

    /// The voice gateway does not offer compression; only text frames are
    /// expected.
    UnexpectedBinaryMessage(Vec<u8>),

    Ws(TungsteniteError),

    WsClosed(Option<CloseFrame<'static>>),
}

impl From<JsonError> for Error {
    fn from(e: JsonError) -> Error {
        Error::Json(e)
    }
}

impl From<TungsteniteError> for Error {
    fn from(e: TungsteniteError) -> Error {
        Error::Ws(e)
    }
}

pub(crate) struct WsStream {
    inner: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

impl WsStream {
    pub(crate) async fn connect(url: Url) -> Result<Self> {
        let (inner, _) = connect_async(url.as_str()).await?;
        Ok(Self { inner })
    }

    pub(crate) async fn recv_json(&mut self) -> Result<Option<GatewayMsg>> {
        const TIMEOUT: Duration = Duration::from_millis(500);

        let message = match timeout(TIMEOUT, self.inner.next()).await {
            Ok(Some(Ok(v))) => Some(v),
            Ok(Some(Err(e))) => return Err(e.into()),
            Ok(None) | Err(_) => None,
        };

        convert_ws_message(message)
    }

    pub(crate) async fn recv_json_no_timeout(&mut self) -> Result<Option<GatewayMsg>> {
        convert_ws_message(self.inner.try_next().await?)
    }

    pub(crate) async fn send_json(&mut self, value: &Event) -> Result<()> {
        let body = serde_json::to_string(value)?;
        Ok(self.inner.send(Message::Text(body)).await?)
    }
}

fn convert_ws_message(message: Option<Message>) -> Result<Option<GatewayMsg>> {
    Ok(match message {
        Some(Message::Text(payload)) => serde_json::from_str(&payload)
            .map_err(|e| {
                debug!("Unexpected JSON {payload:?}: {e}.");
                e
            })
            .ok(),
        Some(Message::Binary(bytes)) => {
            return Err(Error::UnexpectedBinaryMessage(bytes));
        },
        Some(Message::Close(frame)) => {
            return Err(Error::WsClosed(frame));
        },
        // Ping/Pong message behaviour is internally handled by tungstenite.
        _ => None,
    })
}
