//! Connection handler - resolves connect requests and routes client frames

use databox_core::{
    AnyDataBox, ConnectionContext, DataBox, DataBoxFamily, DataBoxRegistry, Error, OutboundEvent, Result, Socket,
};
use databox_protocol::{ClientFrame, ConnectRequest, ConnectResponse, ServerFrame, CONNECT_EVENT};
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, info, warn};

#[cfg(feature = "metrics")]
use crate::metrics::Metrics;

/// Limits applied while connecting sockets
#[derive(Debug, Clone)]
pub struct ConnectConfig {
    /// Api level assumed when neither the request nor the socket names one
    pub default_api_level: u32,
    /// How many DataBoxes (or family members) one socket may attach to
    pub max_data_boxes_per_socket: usize,
}

impl Default for ConnectConfig {
    fn default() -> Self {
        Self {
            default_api_level: 1,
            max_data_boxes_per_socket: 30,
        }
    }
}

/// Handles the connect handshake and session traffic of every socket
pub struct ConnectHandler {
    registry: Arc<DataBoxRegistry>,
    config: ConnectConfig,
    #[cfg(feature = "metrics")]
    metrics: Option<Arc<Metrics>>,
}

impl ConnectHandler {
    pub fn new(registry: Arc<DataBoxRegistry>, config: ConnectConfig) -> Self {
        Self {
            registry,
            config,
            #[cfg(feature = "metrics")]
            metrics: None,
        }
    }

    #[cfg(feature = "metrics")]
    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    #[cfg(feature = "metrics")]
    pub fn metrics(&self) -> Option<&Arc<Metrics>> {
        self.metrics.as_ref()
    }

    pub fn registry(&self) -> &Arc<DataBoxRegistry> {
        &self.registry
    }

    pub fn config(&self) -> &ConnectConfig {
        &self.config
    }

    /// Attach a socket to the DataBox named in `payload`
    pub async fn connect(&self, socket: &Arc<Socket>, payload: &Value) -> Result<ConnectResponse> {
        let result = self.try_connect(socket, payload).await;

        match &result {
            Ok(response) => {
                debug!(
                    socket = socket.id(),
                    input = %response.input_key,
                    used_token = response.used_token,
                    "Socket connected to DataBox"
                );
            }
            Err(e) => {
                info!(socket = socket.id(), error = %e, "DataBox connect rejected");
            }
        }
        self.record(&result);

        result
    }

    #[cfg(feature = "metrics")]
    fn record(&self, result: &Result<ConnectResponse>) {
        if let Some(metrics) = &self.metrics {
            match result {
                Ok(_) => metrics.record_connect(),
                Err(e) => metrics.record_connect_error(e.name()),
            }
        }
    }

    #[cfg(not(feature = "metrics"))]
    fn record(&self, _result: &Result<ConnectResponse>) {}

    #[cfg(feature = "metrics")]
    pub(crate) fn record_socket_open(&self) {
        if let Some(metrics) = &self.metrics {
            metrics.record_socket_open();
        }
    }

    #[cfg(not(feature = "metrics"))]
    pub(crate) fn record_socket_open(&self) {}

    #[cfg(feature = "metrics")]
    pub(crate) fn record_socket_close(&self) {
        if let Some(metrics) = &self.metrics {
            metrics.record_socket_close();
        }
    }

    #[cfg(not(feature = "metrics"))]
    pub(crate) fn record_socket_close(&self) {}

    #[cfg(feature = "metrics")]
    pub(crate) fn record_frame(&self) {
        if let Some(metrics) = &self.metrics {
            metrics.record_frame();
        }
    }

    #[cfg(not(feature = "metrics"))]
    pub(crate) fn record_frame(&self) {}

    #[cfg(feature = "metrics")]
    pub(crate) fn record_event(&self, event: &OutboundEvent) {
        if let (Some(metrics), Some(action)) = (&self.metrics, event.payload.get("a").and_then(Value::as_str)) {
            metrics.record_event(action);
        }
    }

    #[cfg(not(feature = "metrics"))]
    pub(crate) fn record_event(&self, _event: &OutboundEvent) {}

    async fn try_connect(&self, socket: &Arc<Socket>, payload: &Value) -> Result<ConnectResponse> {
        let request = ConnectRequest::from_value(payload)?;
        let api_level = request
            .api_level
            .or(socket.context().api_level)
            .unwrap_or(self.config.default_api_level);

        let data_box = self.registry.get_data_box(&request.name, api_level)?;

        match (data_box, request.member) {
            (AnyDataBox::Family(family), Some(member)) => {
                self.connect_member(socket, &family, &member, request.token.as_deref())
                    .await
            }
            (AnyDataBox::Family(_), None) => Err(Error::IdMissing(request.name)),
            (AnyDataBox::Single(data_box), None) => {
                self.connect_single(socket, &data_box, request.token.as_deref())
                    .await
            }
            (AnyDataBox::Single(_), Some(_)) => Err(Error::UnknownId(request.name)),
        }
    }

    fn check_limit(&self, socket: &Socket, key: &str) -> Result<()> {
        let limit = self.config.max_data_boxes_per_socket;
        if socket.can_attach(key, limit) {
            Ok(())
        } else {
            Err(Error::DataBoxLimitReached { limit })
        }
    }

    async fn connect_single(
        &self,
        socket: &Arc<Socket>,
        data_box: &DataBox,
        token: Option<&str>,
    ) -> Result<ConnectResponse> {
        self.check_limit(socket, &data_box.attachment_key())?;
        data_box.check_access(socket.context()).await?;

        let session = token.and_then(|t| data_box.verify_session_token(t));
        let used_token = session.is_some();
        let attachment = data_box.register_socket(socket, session)?;

        Ok(ConnectResponse {
            used_token,
            last_cud_id: attachment.last_cud_id,
            input_key: attachment.input_key,
            output_key: attachment.output_key,
        })
    }

    async fn connect_member(
        &self,
        socket: &Arc<Socket>,
        family: &DataBoxFamily,
        member: &str,
        token: Option<&str>,
    ) -> Result<ConnectResponse> {
        self.check_limit(socket, &family.attachment_key(member))?;
        let ctx: &ConnectionContext = socket.context();
        family.is_id_valid(member, ctx).await?;
        family.check_access(ctx).await?;

        let session = token.and_then(|t| family.verify_session_token(member, t));
        let used_token = session.is_some();
        let attachment = family.register_socket(member, socket, session)?;

        Ok(ConnectResponse {
            used_token,
            last_cud_id: attachment.last_cud_id,
            input_key: attachment.input_key,
            output_key: attachment.output_key,
        })
    }

    /// Process one text frame of a socket. Returns the reply to send, if the
    /// client asked for one.
    pub async fn handle_frame(&self, socket: &Arc<Socket>, text: &str) -> Option<ServerFrame> {
        let frame = match ClientFrame::parse(text) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(socket = socket.id(), error = %e, "Dropping malformed frame");
                return None;
            }
        };

        let result = if frame.event == CONNECT_EVENT {
            self.connect(socket, &frame.data)
                .await
                .map(|response| response.to_value())
        } else {
            socket.dispatch(&frame.event, frame.data).await
        };

        if let Err(e) = &result {
            if !e.is_client_error() {
                warn!(socket = socket.id(), event = %frame.event, error = %e, "Request failed");
            }
        }

        let request_id = frame.request_id?;
        Some(match result {
            Ok(data) => ServerFrame::reply(request_id, data),
            Err(e) => ServerFrame::error(request_id, &e),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use databox_core::{
        next_socket_id, AccessConfig, AccessRule, DataBoxConfig, DataBoxDefinition, DataBoxEnv, DataBoxHooks,
        IdValidity, LocalExchange, SystemRule,
    };
    use serde_json::json;
    use tokio::sync::mpsc::UnboundedReceiver;

    async fn handler(limit: usize) -> ConnectHandler {
        let env = DataBoxEnv::new("w1", Arc::new(LocalExchange::new()), b"secret".to_vec());
        let chat_hooks = DataBoxHooks::new().is_id_valid(|id, _ctx| async move {
            match id.as_str() {
                "banned" => IdValidity::Rejected(json!({ "reason": "banned" })),
                _ => IdValidity::Valid,
            }
        });
        let registry = DataBoxRegistry::prepare(
            vec![
                DataBoxDefinition::family("chat").variant(1, DataBoxConfig::new().with_hooks(chat_hooks)),
                DataBoxDefinition::single("feed").default_variant(DataBoxConfig::new()),
                DataBoxDefinition::single("admin").default_variant(DataBoxConfig::new().with_access(AccessConfig {
                    access: AccessRule::Authenticated,
                    ..Default::default()
                })),
                DataBoxDefinition::single("ios").default_variant(DataBoxConfig::new().with_access(AccessConfig {
                    system: SystemRule::Only(vec!["ios".into()]),
                    ..Default::default()
                })),
                DataBoxDefinition::single("next").variant(5, DataBoxConfig::new()),
            ],
            &env,
        )
        .await
        .unwrap();

        ConnectHandler::new(
            Arc::new(registry),
            ConnectConfig {
                default_api_level: 1,
                max_data_boxes_per_socket: limit,
            },
        )
    }

    fn socket() -> (Arc<Socket>, UnboundedReceiver<OutboundEvent>) {
        Socket::new(next_socket_id(), ConnectionContext::new("web", 1.0))
    }

    async fn connect_err(handler: &ConnectHandler, socket: &Arc<Socket>, payload: Value) -> &'static str {
        handler.connect(socket, &payload).await.unwrap_err().name()
    }

    #[tokio::test]
    async fn test_connect_family_member() {
        let handler = handler(30).await;
        let (s, _rx) = socket();

        let response = handler
            .connect(&s, &json!({ "d": "chat", "i": "room42", "al": 1 }))
            .await
            .unwrap();

        assert_eq!(
            response.to_value(),
            json!({
                "ut": false,
                "ci": "",
                "i": "DB-chat-1-room42.in",
                "o": "DB-chat-1-room42.out"
            })
        );
    }

    #[tokio::test]
    async fn test_connect_errors() {
        let handler = handler(30).await;
        let (s, _rx) = socket();

        assert_eq!(connect_err(&handler, &s, json!({ "i": 1 })).await, "InvalidRequest");
        assert_eq!(connect_err(&handler, &s, json!({ "d": "nope" })).await, "UnknownDataBox");
        assert_eq!(connect_err(&handler, &s, json!({ "d": "next" })).await, "ApiLevelNotCompatible");
        assert_eq!(connect_err(&handler, &s, json!({ "d": "chat" })).await, "IdMissing");
        assert_eq!(connect_err(&handler, &s, json!({ "d": "feed", "i": "x" })).await, "UnknownId");
        assert_eq!(connect_err(&handler, &s, json!({ "d": "admin" })).await, "AccessDenied");
        assert_eq!(connect_err(&handler, &s, json!({ "d": "ios" })).await, "NoAccessWithSystem");

        let err = handler
            .connect(&s, &json!({ "d": "chat", "i": "banned" }))
            .await
            .unwrap_err();
        assert_eq!(err.name(), "IdIsNotValid");
        assert_eq!(err.info(), Some(json!({ "reason": "banned" })));
        assert_eq!(s.attachment_count(), 0);
    }

    #[tokio::test]
    async fn test_connect_after_disconnect_is_rejected() {
        let handler = handler(30).await;
        let (s, _rx) = socket();
        s.disconnect();

        assert_eq!(
            connect_err(&handler, &s, json!({ "d": "chat", "i": "room42" })).await,
            "SocketDisconnected"
        );
        assert_eq!(connect_err(&handler, &s, json!({ "d": "feed" })).await, "SocketDisconnected");
        assert_eq!(s.attachment_count(), 0);
    }

    #[tokio::test]
    async fn test_attachment_limit() {
        let handler = handler(2).await;
        let (s, _rx) = socket();

        handler.connect(&s, &json!({ "d": "chat", "i": 1 })).await.unwrap();
        handler.connect(&s, &json!({ "d": "feed" })).await.unwrap();
        // reconnecting to an attached box does not count
        handler.connect(&s, &json!({ "d": "feed" })).await.unwrap();

        assert_eq!(
            connect_err(&handler, &s, json!({ "d": "chat", "i": 2 })).await,
            "DataBoxLimitReached"
        );
    }

    #[tokio::test]
    async fn test_token_resumes_session() {
        let handler = handler(30).await;
        let (first, _rx) = socket();
        let response = handler
            .connect(&first, &json!({ "d": "chat", "i": "room1" }))
            .await
            .unwrap();
        let reply = first
            .dispatch(&response.input_key, json!({ "a": "resetSession" }))
            .await
            .unwrap();
        let token = reply["t"].as_str().unwrap().to_string();

        let (second, _rx) = socket();
        let resumed = handler
            .connect(&second, &json!({ "d": "chat", "i": "room1", "t": token }))
            .await
            .unwrap();
        assert!(resumed.used_token);

        // a token is only good for the member that issued it
        let (third, _rx) = socket();
        let other = handler
            .connect(&third, &json!({ "d": "chat", "i": "room2", "t": token }))
            .await
            .unwrap();
        assert!(!other.used_token);

        let garbage = handler
            .connect(&third, &json!({ "d": "feed", "t": "garbage" }))
            .await
            .unwrap();
        assert!(!garbage.used_token);
    }

    #[tokio::test]
    async fn test_handle_frame_replies() {
        let handler = handler(30).await;
        let (s, _rx) = socket();

        let reply = handler
            .handle_frame(&s, r#"{"e":"databox:connect","d":{"d":"feed"},"r":1}"#)
            .await
            .unwrap();
        let wire: Value = serde_json::from_str(&reply.to_text()).unwrap();
        assert_eq!(wire["r"], 1);
        assert_eq!(wire["d"]["i"], "DB-feed-default.in");

        let reply = handler
            .handle_frame(&s, r#"{"e":"DB-feed-default.in","d":{"a":"getData"},"r":2}"#)
            .await
            .unwrap();
        let wire: Value = serde_json::from_str(&reply.to_text()).unwrap();
        assert_eq!(wire["err"]["name"], "NoMoreDataAvailable");

        // no request id, no reply
        assert!(handler
            .handle_frame(&s, r#"{"e":"DB-feed-default.in","d":{"a":"close"}}"#)
            .await
            .is_none());
        assert_eq!(s.attachment_count(), 0);

        assert!(handler.handle_frame(&s, "garbage").await.is_none());
    }
}
