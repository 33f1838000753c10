//! WebSocket host for DataBox sockets
//!
//! Clients connect with `?system=<s>&version=<v>&apiLevel=<n>` and then talk
//! in JSON frames; see `databox_protocol` for the envelopes.

use databox_core::{next_socket_id, Anonymous, AuthState, ConnectionContext, OutboundEvent, Socket};
use databox_protocol::ServerFrame;
use futures_util::{SinkExt, StreamExt};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::{accept_hdr_async, tungstenite::Message};
use tracing::{debug, error, info};

use crate::handler::ConnectHandler;

/// Resolves the auth state of a connection from its handshake query
pub type AuthResolver = Arc<dyn Fn(&HashMap<String, String>) -> Arc<dyn AuthState> + Send + Sync>;

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// WebSocket server for DataBox
pub struct WebSocketServer {
    handler: Arc<ConnectHandler>,
    addr: SocketAddr,
    auth: Option<AuthResolver>,
}

impl WebSocketServer {
    pub fn new(handler: Arc<ConnectHandler>, addr: SocketAddr) -> Self {
        Self {
            handler,
            addr,
            auth: None,
        }
    }

    /// Attach an auth state to every socket from its handshake query
    pub fn with_auth(mut self, auth: AuthResolver) -> Self {
        self.auth = Some(auth);
        self
    }

    /// Start the WebSocket server
    pub async fn run(&self) -> Result<(), BoxError> {
        let listener = TcpListener::bind(self.addr).await?;
        info!(addr = %self.addr, "DataBox WebSocket server listening");

        loop {
            match listener.accept().await {
                Ok((stream, peer_addr)) => {
                    let handler = self.handler.clone();
                    let auth = self.auth.clone();

                    tokio::spawn(async move {
                        if let Err(e) = Self::handle_connection(stream, handler, auth).await {
                            error!(peer = %peer_addr, error = %e, "WebSocket connection error");
                        }
                    });
                }
                Err(e) => {
                    error!(error = %e, "Failed to accept connection");
                }
            }
        }
    }

    async fn handle_connection(
        stream: TcpStream,
        handler: Arc<ConnectHandler>,
        auth: Option<AuthResolver>,
    ) -> Result<(), BoxError> {
        let mut query = String::new();
        let ws_stream = accept_hdr_async(stream, |request: &Request, response: Response| -> Result<Response, ErrorResponse> {
            query = request.uri().query().unwrap_or_default().to_string();
            Ok(response)
        })
        .await?;

        let params = parse_query(&query);
        let auth_state: Arc<dyn AuthState> = match &auth {
            Some(resolve) => resolve(&params),
            None => Arc::new(Anonymous),
        };
        let context = connection_context(&params).with_auth(auth_state);

        let (socket, outbound) = Socket::new(next_socket_id(), context);
        info!(socket = socket.id(), system = %socket.context().system, "WebSocket client connected");
        handler.record_socket_open();

        let result = Self::serve(ws_stream, &socket, outbound, &handler).await;

        // runs every unregister hook of the socket
        socket.disconnect();
        handler.record_socket_close();
        info!(socket = socket.id(), "WebSocket client disconnected");
        result
    }

    async fn serve(
        ws_stream: tokio_tungstenite::WebSocketStream<TcpStream>,
        socket: &Arc<Socket>,
        mut outbound: tokio::sync::mpsc::UnboundedReceiver<OutboundEvent>,
        handler: &ConnectHandler,
    ) -> Result<(), BoxError> {
        let (mut write, mut read) = ws_stream.split();

        loop {
            tokio::select! {
                // Handle incoming WebSocket messages
                msg = read.next() => {
                    match msg {
                        Some(Ok(Message::Text(text))) => {
                            handler.record_frame();
                            if let Some(reply) = handler.handle_frame(socket, &text).await {
                                write.send(Message::Text(reply.to_text())).await?;
                            }
                        }
                        Some(Ok(Message::Ping(data))) => {
                            write.send(Message::Pong(data)).await?;
                        }
                        Some(Ok(Message::Close(_))) | None => {
                            break;
                        }
                        Some(Ok(_)) => {
                            // Binary and other message types are not part of the protocol
                        }
                        Some(Err(e)) => {
                            error!(socket = socket.id(), error = %e, "WebSocket read error");
                            break;
                        }
                    }
                }

                // Push DataBox events queued for this socket
                event = outbound.recv() => {
                    let Some(event) = event else { break };
                    handler.record_event(&event);
                    debug!(socket = socket.id(), event = %event.event, "Pushing event");
                    let frame = ServerFrame::event(event.event, event.payload);
                    write.send(Message::Text(frame.to_text())).await?;
                }
            }
        }

        Ok(())
    }
}

/// Split `a=1&b=2` into pairs; later keys win
fn parse_query(query: &str) -> HashMap<String, String> {
    query
        .split('&')
        .filter(|pair| !pair.is_empty())
        .map(|pair| match pair.split_once('=') {
            Some((key, value)) => (key.to_string(), value.to_string()),
            None => (pair.to_string(), String::new()),
        })
        .collect()
}

fn connection_context(params: &HashMap<String, String>) -> ConnectionContext {
    let defaults = ConnectionContext::default();
    let system = params
        .get("system")
        .filter(|s| !s.is_empty())
        .cloned()
        .unwrap_or(defaults.system);
    let version = params
        .get("version")
        .and_then(|v| v.parse::<f64>().ok())
        .unwrap_or(defaults.version);

    let context = ConnectionContext::new(system, version);
    match params.get("apiLevel").and_then(|l| l.parse::<u32>().ok()) {
        Some(level) if level > 0 => context.with_api_level(level),
        _ => context,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_context_from_query() {
        let params = parse_query("system=ios&version=2.5&apiLevel=3&flag");
        assert_eq!(params.get("flag").map(String::as_str), Some(""));

        let ctx = connection_context(&params);
        assert_eq!(ctx.system, "ios");
        assert_eq!(ctx.version, 2.5);
        assert_eq!(ctx.api_level, Some(3));
    }

    #[test]
    fn test_context_defaults() {
        let ctx = connection_context(&parse_query("version=abc&apiLevel=0"));
        assert_eq!(ctx.system, "default");
        assert_eq!(ctx.version, 1.0);
        assert_eq!(ctx.api_level, None);
    }
}
