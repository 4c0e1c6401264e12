use anyhow::{bail, Result};
use log::{debug, info, warn};
use serde_json::Value;
use signal_indexer::{AnnotationService, IndexerError, ServiceEvent};
use signal_protocol::{
    serialize_json, ItemDataRequest, Operation, RequestEnvelope, ResponseEnvelope,
    SetAnnotationRequest, ERROR_EVENT,
};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc};

pub const MAX_LINE_BYTES: usize = if cfg!(test) { 1024 } else { 1024 * 1024 };
const OUTBOUND_CAPACITY: usize = 64;
const SHUTDOWN_GRACE: Duration = Duration::from_millis(200);

/// Reads one `\n`-terminated line. `Ok(None)` on a clean end of stream.
async fn read_line_limited<R: AsyncBufRead + Unpin>(
    reader: &mut R,
    max_bytes: usize,
) -> Result<Option<Vec<u8>>> {
    let mut out = Vec::new();
    let limit = u64::try_from(max_bytes).unwrap_or(u64::MAX).saturating_add(1);
    let n = (&mut *reader).take(limit).read_until(b'\n', &mut out).await?;
    if n == 0 {
        return Ok(None);
    }
    if out.last() == Some(&b'\n') {
        out.pop();
    } else if out.len() > max_bytes {
        bail!("message exceeds {max_bytes} bytes");
    }
    if out.last() == Some(&b'\r') {
        out.pop();
    }
    Ok(Some(out))
}

/// Runs one request against the service and builds its reply.
pub async fn dispatch(
    service: &AnnotationService,
    request: RequestEnvelope,
    connected: usize,
) -> ResponseEnvelope {
    let meta = request.meta;
    let Some(op) = Operation::from_event(&request.event) else {
        warn!("Unknown event {}", request.event);
        return ResponseEnvelope::error(
            "unknown_event",
            format!("Unknown event {}", request.event),
            meta,
        );
    };
    info!("Handling event {}", op.event_name());

    match execute(service, op, request.data, connected).await {
        Ok(data) => {
            info!("Sending response {}", op.response_event());
            ResponseEnvelope {
                event: op.response_event().to_string(),
                data,
                meta,
            }
        }
        Err(err) => {
            let code = err
                .downcast_ref::<IndexerError>()
                .map_or("invalid_request", IndexerError::code);
            warn!("{} failed: {err}", op.event_name());
            ResponseEnvelope::error(code, err.to_string(), meta)
        }
    }
}

async fn execute(
    service: &AnnotationService,
    op: Operation,
    data: Value,
    connected: usize,
) -> Result<Value> {
    let value = match op {
        Operation::GetAnnotationList => serde_json::to_value(service.annotation_list().await)?,
        Operation::GetCommonAnnotationList => {
            serde_json::to_value(service.common_annotation_list().await)?
        }
        Operation::GetList => serde_json::to_value(service.record_list().await)?,
        Operation::GetItemData => {
            let req: ItemDataRequest = serde_json::from_value(data)?;
            serde_json::to_value(service.item_data(&req.id).await?)?
        }
        Operation::SetAnnotation => {
            let req: SetAnnotationRequest = serde_json::from_value(data)?;
            service.set_annotation(&req.id, req.annotation).await?;
            serde_json::json!({ "id": req.id })
        }
        Operation::DumpSignals => serde_json::to_value(service.dump_signals().await?)?,
        Operation::Shutdown => {
            service.check_shutdown(connected)?;
            Value::Null
        }
    };
    Ok(value)
}

fn push_line(event: &ServiceEvent) -> Result<Option<Arc<str>>> {
    let envelope = match event {
        ServiceEvent::RecordList(list) => ResponseEnvelope::reply(Operation::GetList, list, Value::Null)?,
        ServiceEvent::CommonAnnotations(common) => {
            ResponseEnvelope::reply(Operation::GetCommonAnnotationList, common, Value::Null)?
        }
        ServiceEvent::Shutdown | ServiceEvent::Fatal(_) => return Ok(None),
    };
    Ok(Some(Arc::from(serialize_json(&envelope)?)))
}

/// Accepts clients until the service asks to shut down.
///
/// Returns an error when the service reports a fatal fault.
pub async fn serve(listener: TcpListener, service: AnnotationService) -> Result<()> {
    let connections = Arc::new(AtomicUsize::new(0));
    let (push_tx, _) = broadcast::channel::<Arc<str>>(OUTBOUND_CAPACITY);
    let mut events = service.subscribe();
    if let Ok(addr) = listener.local_addr() {
        info!("Listening on {addr}");
    }

    let outcome = loop {
        tokio::select! {
            res = listener.accept() => {
                let (stream, peer) = match res {
                    Ok(pair) => pair,
                    Err(err) => {
                        warn!("accept failed: {err}");
                        continue;
                    }
                };
                let service = service.clone();
                let pushes = push_tx.subscribe();
                let connections = connections.clone();
                tokio::spawn(async move {
                    if let Err(err) = handle_conn(stream, peer, service, pushes, connections).await {
                        warn!("connection {peer} error: {err:#}");
                    }
                });
            }
            event = events.recv() => {
                match event {
                    Ok(ServiceEvent::Shutdown) => {
                        tokio::time::sleep(SHUTDOWN_GRACE).await;
                        break Ok(());
                    }
                    Ok(ServiceEvent::Fatal(reason)) => {
                        break Err(anyhow::anyhow!("annotation service halted: {reason}"));
                    }
                    Ok(event) => match push_line(&event) {
                        Ok(Some(line)) => {
                            let _ = push_tx.send(line);
                        }
                        Ok(None) => {}
                        Err(err) => warn!("failed to encode push: {err}"),
                    },
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!("Dropped {skipped} service events");
                    }
                    Err(broadcast::error::RecvError::Closed) => break Ok(()),
                }
            }
        }
    };

    service.close().await;
    outcome
}

async fn handle_conn(
    stream: TcpStream,
    peer: SocketAddr,
    service: AnnotationService,
    pushes: broadcast::Receiver<Arc<str>>,
    connections: Arc<AtomicUsize>,
) -> Result<()> {
    let connected = connections.fetch_add(1, Ordering::SeqCst) + 1;
    info!("Client connected: {peer} ({connected} connected)");
    let result = serve_conn(stream, &service, pushes, &connections).await;
    let left = connections.fetch_sub(1, Ordering::SeqCst) - 1;
    info!("Client disconnected: {peer} ({left} connected)");
    result
}

async fn serve_conn(
    stream: TcpStream,
    service: &AnnotationService,
    mut pushes: broadcast::Receiver<Arc<str>>,
    connections: &AtomicUsize,
) -> Result<()> {
    let (read_half, mut write_half) = stream.into_split();
    let (out_tx, mut out_rx) = mpsc::channel::<Arc<str>>(OUTBOUND_CAPACITY);

    let writer = tokio::spawn(async move {
        while let Some(line) = out_rx.recv().await {
            write_half.write_all(line.as_bytes()).await?;
            write_half.write_all(b"\n").await?;
            write_half.flush().await?;
        }
        Ok::<_, std::io::Error>(())
    });

    let push_out = out_tx.clone();
    let forwarder = tokio::spawn(async move {
        loop {
            match pushes.recv().await {
                Ok(line) => {
                    if push_out.send(line).await.is_err() {
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    debug!("client lagged, {skipped} pushes dropped");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    });

    let mut reader = BufReader::new(read_half);
    let result = async {
        while let Some(line) = read_line_limited(&mut reader, MAX_LINE_BYTES).await? {
            if line.iter().all(u8::is_ascii_whitespace) {
                continue;
            }
            let reply = match serde_json::from_slice::<RequestEnvelope>(&line) {
                Ok(request) => {
                    let is_shutdown = Operation::from_event(&request.event) == Some(Operation::Shutdown);
                    let connected = connections.load(Ordering::SeqCst);
                    let reply = dispatch(service, request, connected).await;
                    if is_shutdown && reply.event != ERROR_EVENT {
                        out_tx.send(Arc::from(serialize_json(&reply)?)).await?;
                        service.shutdown(connected)?;
                        continue;
                    }
                    reply
                }
                Err(err) => {
                    warn!("Malformed request: {err}");
                    ResponseEnvelope::error("invalid_request", err.to_string(), Value::Null)
                }
            };
            out_tx.send(Arc::from(serialize_json(&reply)?)).await?;
        }
        Ok::<_, anyhow::Error>(())
    }
    .await;

    forwarder.abort();
    drop(out_tx);
    match writer.await {
        Ok(Err(err)) if result.is_ok() => return Err(err.into()),
        _ => {}
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use tokio::io::AsyncWriteExt;

    #[tokio::test]
    async fn read_line_limited_rejects_oversized_messages() {
        let (mut client, server) = tokio::io::duplex(4096);
        let handle = tokio::spawn(async move {
            let payload = vec![b'a'; MAX_LINE_BYTES + 1];
            client.write_all(&payload).await.expect("write");
            client.write_all(b"\n").await.expect("write newline");
            client.flush().await.expect("flush");
        });

        let mut reader = BufReader::new(server);
        let err = read_line_limited(&mut reader, MAX_LINE_BYTES)
            .await
            .expect_err("expected size limit error");
        assert!(
            err.to_string().contains("exceeds"),
            "unexpected error: {err}"
        );

        handle.await.expect("writer task");
    }

    #[tokio::test]
    async fn read_line_limited_keeps_pipelined_lines() {
        let (mut client, server) = tokio::io::duplex(4096);
        client
            .write_all(b"{\"event\":\"GET_LIST\"}\r\n{\"event\":\"GET_ANNOTATION_LIST\"}\n")
            .await
            .expect("write");
        drop(client);

        let mut reader = BufReader::new(server);
        let first = read_line_limited(&mut reader, MAX_LINE_BYTES).await.unwrap();
        let second = read_line_limited(&mut reader, MAX_LINE_BYTES).await.unwrap();
        let end = read_line_limited(&mut reader, MAX_LINE_BYTES).await.unwrap();
        assert_eq!(first.as_deref(), Some(&b"{\"event\":\"GET_LIST\"}"[..]));
        assert_eq!(
            second.as_deref(),
            Some(&b"{\"event\":\"GET_ANNOTATION_LIST\"}"[..])
        );
        assert_eq!(end, None);
    }

    #[test]
    fn pushes_use_reply_event_names() {
        let line = push_line(&ServiceEvent::RecordList(Vec::new()))
            .unwrap()
            .unwrap();
        let envelope: ResponseEnvelope = serde_json::from_str(&line).unwrap();
        assert_eq!(envelope.event, "GOT_LIST");
        assert_eq!(envelope.data, serde_json::json!([]));
        assert!(push_line(&ServiceEvent::Shutdown).unwrap().is_none());
    }
}
