//! Server setup, lifecycle and the line-delimited JSON stdio adapter.
//!
//! One request per line in, one response per line out:
//!
//! ```text
//! {"id": 1, "operation": "list_domains", "arguments": {"state": "running"}, "user": "ops"}
//! {"id": 1, "result": [...]}
//! {"id": 2, "error": {"kind": "not_found", "message": "Domain ghost not found"}}
//! ```

use anyhow::Result;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use libvirt_mcp_hypervisor::{ConnectionManager, Connector, HypervisorError, MockConnector, VirtClient};

use crate::config::Config;
use crate::dispatcher::Dispatcher;
use crate::security::{CallerContext, SecurityGate};

const CLIENT_NAME: &str = "stdio";

/// One inbound request line.
#[derive(Debug, Deserialize)]
pub struct Request {
    #[serde(default)]
    pub id: Value,
    pub operation: String,
    #[serde(default)]
    pub arguments: Value,
    #[serde(default)]
    pub user: Option<String>,
}

#[derive(Debug, Serialize, PartialEq, Eq)]
pub struct ErrorBody {
    pub kind: String,
    pub message: String,
}

/// One outbound response line.
#[derive(Debug, Serialize)]
pub struct Response {
    pub id: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorBody>,
}

impl Response {
    fn ok(id: Value, result: Value) -> Self {
        Self {
            id,
            result: Some(result),
            error: None,
        }
    }

    fn error(id: Value, kind: &str, message: impl Into<String>) -> Self {
        Self {
            id,
            result: None,
            error: Some(ErrorBody {
                kind: kind.to_string(),
                message: message.into(),
            }),
        }
    }

    fn to_line(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|e| {
            format!(
                r#"{{"id":null,"error":{{"kind":"operation_error","message":"Failed to encode response: {}"}}}}"#,
                e
            )
        })
    }
}

/// Handle one request line and produce the response line.
pub async fn handle_request_line(dispatcher: &Dispatcher, line: &str) -> String {
    let request: Request = match serde_json::from_str(line) {
        Ok(request) => request,
        Err(e) => {
            warn!(error = %e, "Malformed request line");
            return Response::error(Value::Null, "invalid_request", format!("Malformed request: {}", e))
                .to_line();
        }
    };

    let caller = CallerContext::new(request.user, Some(CLIENT_NAME.to_string()));
    debug!(id = %request.id, operation = %request.operation, "Request received");

    let response = match dispatcher.dispatch(&request.operation, request.arguments, &caller).await {
        Ok(result) => Response::ok(request.id, result),
        Err(e) => error_response(request.id, &e),
    };
    response.to_line()
}

fn error_response(id: Value, e: &HypervisorError) -> Response {
    Response::error(id, e.kind(), e.message())
}

/// Serve requests from `reader` until EOF, writing responses to `writer`.
///
/// Requests run concurrently; responses are written as they complete.
/// All in-flight requests finish before this returns.
pub async fn serve<R, W>(dispatcher: Arc<Dispatcher>, reader: R, writer: W) -> Result<()>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (tx, mut rx) = mpsc::unbounded_channel::<String>();

    let writer_task = tokio::spawn(async move {
        let mut writer = writer;
        while let Some(line) = rx.recv().await {
            if let Err(e) = write_line(&mut writer, &line).await {
                error!(error = %e, "Failed to write response");
                break;
            }
        }
    });

    let mut requests = JoinSet::new();
    let mut lines = reader.lines();

    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        let dispatcher = dispatcher.clone();
        let tx = tx.clone();
        requests.spawn(async move {
            let response = handle_request_line(&dispatcher, &line).await;
            // Receiver only closes when the writer failed, already logged
            let _ = tx.send(response);
        });
    }

    debug!(pending = requests.len(), "Input closed, draining requests");
    while let Some(joined) = requests.join_next().await {
        if let Err(e) = joined {
            error!(error = %e, "Request task failed");
        }
    }

    drop(tx);
    writer_task
        .await
        .map_err(|e| anyhow::anyhow!("Response writer failed: {}", e))?;

    Ok(())
}

async fn write_line<W: AsyncWrite + Unpin>(writer: &mut W, line: &str) -> std::io::Result<()> {
    writer.write_all(line.as_bytes()).await?;
    writer.write_all(b"\n").await?;
    writer.flush().await
}

fn build_connector(dev: bool) -> Arc<dyn Connector> {
    if dev {
        warn!("Development mode: using in-memory mock hypervisor");
        return Arc::new(MockConnector::new());
    }

    #[cfg(feature = "libvirt")]
    {
        info!("Using libvirt hypervisor backend");
        Arc::new(libvirt_mcp_hypervisor::LibvirtConnector::new())
    }
    #[cfg(not(feature = "libvirt"))]
    {
        warn!("Libvirt backend not compiled in, falling back to mock");
        Arc::new(MockConnector::new())
    }
}

/// Wire the components together from configuration.
pub fn build_dispatcher(config: &Config, connector: Arc<dyn Connector>) -> Dispatcher {
    let allowed = Arc::new(config.allow_list());
    let manager = ConnectionManager::new(connector, config.connection_settings());
    let client = VirtClient::new(manager, allowed.clone()).with_images_dir(&config.storage.images_dir);
    let gate = SecurityGate::new(&config.security, allowed);
    Dispatcher::new(Arc::new(client), Arc::new(gate))
}

/// Run the server on stdin/stdout until EOF or Ctrl-C.
pub async fn run(config: Config, dev: bool) -> Result<()> {
    let dispatcher = Arc::new(build_dispatcher(&config, build_connector(dev)));

    if let Err(e) = dispatcher.client().connection().connect().await {
        warn!(error = %e, "Initial connection failed, will retry on first request");
    }

    let summary = dispatcher.gate().summary().await;
    info!(
        audit_enabled = summary.audit_enabled,
        auth_required = summary.auth_required,
        allowed_operations = summary.allowed_operations.len(),
        max_concurrent_ops = summary.max_concurrent_ops,
        "Security configuration"
    );
    if summary.auth_required {
        warn!("auth_required is set but the stdio transport carries no credentials; callers are identified, not authenticated");
    }

    info!(
        uri = %config.libvirt.uri,
        readonly = config.libvirt.readonly,
        libvirt_compiled = libvirt_mcp_hypervisor::libvirt::is_available(),
        "Serving requests on stdio"
    );

    let reader = BufReader::new(tokio::io::stdin());
    let writer = tokio::io::stdout();

    tokio::select! {
        result = serve(dispatcher.clone(), reader, writer) => {
            match result {
                Ok(()) => info!("Input closed, shutting down"),
                Err(ref e) => error!(error = %e, "Server failed"),
            }
            result?;
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Interrupted, shutting down");
        }
    }

    dispatcher.client().connection().disconnect().await;
    info!("Disconnected");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio::io::AsyncReadExt;

    fn dev_dispatcher() -> Dispatcher {
        let mut config = Config::default();
        config.security.allowed_operations.push("domain.create".to_string());
        build_dispatcher(&config, Arc::new(MockConnector::new()))
    }

    #[tokio::test]
    async fn test_handle_request_line() {
        let dispatcher = dev_dispatcher();

        let line = handle_request_line(&dispatcher, r#"{"id": 7, "operation": "host_info"}"#).await;
        let value: Value = serde_json::from_str(&line).unwrap();
        assert_eq!(value["id"], 7);
        assert_eq!(value["result"]["hostname"], "mock-host");
        assert!(value.get("error").is_none());

        let line = handle_request_line(
            &dispatcher,
            r#"{"id": "a", "operation": "domain_info", "arguments": {"name": "ghost"}}"#,
        )
        .await;
        let value: Value = serde_json::from_str(&line).unwrap();
        assert_eq!(value["id"], "a");
        assert_eq!(value["error"]["kind"], "not_found");
        assert_eq!(value["error"]["message"], "Domain ghost not found");
    }

    #[tokio::test]
    async fn test_malformed_line() {
        let dispatcher = dev_dispatcher();
        let line = handle_request_line(&dispatcher, "{not json").await;
        let value: Value = serde_json::from_str(&line).unwrap();
        assert_eq!(value["id"], Value::Null);
        assert_eq!(value["error"]["kind"], "invalid_request");
    }

    #[tokio::test]
    async fn test_serve_until_eof() {
        let dispatcher = Arc::new(dev_dispatcher());
        let (client_end, server_end) = tokio::io::duplex(64 * 1024);
        let (server_read, server_write) = tokio::io::split(server_end);
        let (mut client_read, mut client_write) = tokio::io::split(client_end);

        let server = tokio::spawn(serve(dispatcher, BufReader::new(server_read), server_write));

        let requests = [
            json!({"id": 1, "operation": "create_domain", "arguments": {"name": "vm1"}}),
            json!({"id": 2, "operation": "list_networks"}),
            json!({"id": 3, "operation": "reformat_host"}),
        ];
        for request in &requests {
            client_write.write_all(format!("{}\n\n", request).as_bytes()).await.unwrap();
        }
        client_write.shutdown().await.unwrap();
        drop(client_write);

        server.await.unwrap().unwrap();

        let mut output = String::new();
        client_read.read_to_string(&mut output).await.unwrap();
        let responses: Vec<Value> = output.lines().map(|l| serde_json::from_str(l).unwrap()).collect();
        assert_eq!(responses.len(), 3);

        let by_id = |id: i64| responses.iter().find(|r| r["id"] == id).unwrap();
        assert_eq!(by_id(1)["result"]["success"], true);
        assert_eq!(by_id(2)["result"][0]["name"], "default");
        assert_eq!(by_id(3)["error"]["kind"], "operation_error");
    }
}
