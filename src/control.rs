//! Control-channel TCP accept loop and per-client state machine (spec §4.G).
//!
//! `AwaitingRegister` accepts only a `register` frame; `Registered` accepts
//! only `response` frames and dispatches them into the pending table.

use std::fs::File;
use std::io::BufReader;
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::io::{split, AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio_rustls::rustls::pki_types::{CertificateDer, PrivateKeyDer};
use tokio_rustls::rustls::server::WebPkiClientVerifier;
use tokio_rustls::rustls::{RootCertStore, ServerConfig};
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::cache::is_valid_token_format;
use crate::config::CtrlTlsConfig;
use crate::error::{RelayError, Result};
use crate::pending::Owner;
use crate::relay::Relay;
use crate::session::ClientSession;
use crate::wire::{decode_body, redact_for_logging, strip_hop_by_hop, Frame, FrameReader, ReadOutcome};

/// Runs the control-channel accept loop until `shutdown` is cancelled.
pub async fn run(relay: Arc<Relay>, shutdown: CancellationToken) -> Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], relay.config.ctrl_port));
    let listener = TcpListener::bind(addr).await?;
    info!(%addr, "control channel listening");

    let acceptor = match &relay.config.ctrl_tls {
        Some(tls) => Some(build_acceptor(tls)?),
        None => None,
    };

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                info!("control channel accept loop shutting down");
                return Ok(());
            }
            accepted = listener.accept() => {
                let (stream, remote_addr) = match accepted {
                    Ok(pair) => pair,
                    Err(e) => {
                        warn!(error = %e, "failed to accept control connection");
                        continue;
                    }
                };
                let relay = relay.clone();
                let acceptor = acceptor.clone();
                tokio::spawn(async move {
                    match acceptor {
                        Some(acceptor) => match acceptor.accept(stream).await {
                            Ok(tls_stream) => serve_connection(relay, tls_stream, remote_addr).await,
                            Err(e) => warn!(%remote_addr, error = %e, "control TLS handshake failed"),
                        },
                        None => serve_connection(relay, stream, remote_addr).await,
                    }
                });
            }
        }
    }
}

fn build_acceptor(tls: &CtrlTlsConfig) -> Result<TlsAcceptor> {
    let certs = load_certs(&tls.cert_path)?;
    let key = load_key(&tls.key_path)?;
    let builder = ServerConfig::builder();

    let config = if tls.insecure || tls.ca_path.is_none() {
        builder
            .with_no_client_auth()
            .with_single_cert(certs, key)
            .map_err(|e| RelayError::Tls(e.to_string()))?
    } else {
        let ca_path = tls.ca_path.as_ref().expect("checked above");
        let mut roots = RootCertStore::empty();
        for ca in load_certs(ca_path)? {
            roots.add(ca).map_err(|e| RelayError::Tls(e.to_string()))?;
        }
        let verifier = WebPkiClientVerifier::builder(Arc::new(roots))
            .build()
            .map_err(|e| RelayError::Tls(e.to_string()))?;
        builder
            .with_client_cert_verifier(verifier)
            .with_single_cert(certs, key)
            .map_err(|e| RelayError::Tls(e.to_string()))?
    };

    Ok(TlsAcceptor::from(Arc::new(config)))
}

fn load_certs(path: &str) -> Result<Vec<CertificateDer<'static>>> {
    let mut reader = BufReader::new(File::open(path)?);
    rustls_pemfile::certs(&mut reader)
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| RelayError::Tls(format!("failed to parse certs in {path}: {e}")))
}

fn load_key(path: &str) -> Result<PrivateKeyDer<'static>> {
    let mut reader = BufReader::new(File::open(path)?);
    rustls_pemfile::private_key(&mut reader)
        .map_err(|e| RelayError::Tls(format!("failed to parse key in {path}: {e}")))?
        .ok_or_else(|| RelayError::Tls(format!("no private key found in {path}")))
}

async fn serve_connection<S>(relay: Arc<Relay>, stream: S, remote_addr: SocketAddr)
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    let (read_half, write_half) = split(stream);
    let mut reader = FrameReader::new(read_half, relay.config.max_request_size);

    let (token, session) = match await_register(&relay, &mut reader, write_half, remote_addr).await {
        Some(pair) => pair,
        None => return,
    };

    serve_registered(&relay, &mut reader, &session).await;

    relay.registry.deregister(&token, &session);
    session.mark_destroyed();
    info!(%token, %remote_addr, "client session closed");
}

async fn write_line<W: AsyncWrite + Unpin>(write_half: &mut W, frame: &Frame) -> Result<()> {
    let mut line = frame.to_line()?;
    line.push('\n');
    write_half.write_all(line.as_bytes()).await.map_err(RelayError::Io)
}

async fn await_register<R, W>(
    relay: &Arc<Relay>,
    reader: &mut FrameReader<R>,
    mut write_half: W,
    remote_addr: SocketAddr,
) -> Option<(String, Arc<ClientSession>)>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Send + Unpin + 'static,
{
    let frame = match reader.next_frame().await {
        Ok(ReadOutcome::Frame(frame)) => frame,
        Ok(ReadOutcome::TooLarge) => {
            let _ = write_line(&mut write_half, &Frame::error("frame too large")).await;
            return None;
        }
        Ok(ReadOutcome::Malformed(msg)) => {
            let _ = write_line(&mut write_half, &Frame::error(format!("malformed frame: {msg}"))).await;
            return None;
        }
        Ok(ReadOutcome::Eof) => return None,
        Err(e) => {
            warn!(%remote_addr, error = %e, "control read error before registration");
            return None;
        }
    };

    let (token, target_port) = match frame {
        Frame::Register { token, target_port } => (token, target_port),
        _ => {
            let _ = write_line(&mut write_half, &Frame::error("expected register frame")).await;
            return None;
        }
    };

    if !is_valid_token_format(&token) {
        let _ = write_line(&mut write_half, &Frame::error("invalid token format")).await;
        return None;
    }

    if !relay.validate_token(&token).await {
        warn!(%token, %remote_addr, "registration rejected: invalid token");
        let _ = write_line(&mut write_half, &Frame::error("invalid token")).await;
        return None;
    }

    let session = Arc::new(ClientSession::new(
        token.clone(),
        target_port,
        remote_addr,
        Box::new(write_half),
    ));
    relay.registry.register(&token, session.clone());

    if let Err(e) = session.send(&Frame::Registered).await {
        warn!(%token, error = %e, "failed to ack registration");
        relay.registry.deregister(&token, &session);
        return None;
    }

    info!(%token, target_port, %remote_addr, "client registered");
    Some((token, session))
}

async fn serve_registered<R>(relay: &Arc<Relay>, reader: &mut FrameReader<R>, session: &Arc<ClientSession>)
where
    R: AsyncRead + Unpin,
{
    loop {
        let outcome = match reader.next_frame().await {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!(token = %session.token, error = %e, "control read error");
                return;
            }
        };

        match outcome {
            ReadOutcome::Frame(Frame::Response { id, status, mut headers, body }) => {
                debug!(
                    token = %session.token,
                    id = %id,
                    status,
                    headers = ?redact_for_logging(&headers),
                    "received response frame",
                );
                strip_hop_by_hop(&mut headers);
                let body = decode_body(&body);
                let body_len = body.len();
                match relay.pending.complete(&id, status, headers, body) {
                    Some(Owner { token, alias }) => {
                        relay.stats.record_response(&token, alias.as_deref(), status, body_len);
                    }
                    None => debug!(id = %id, token = %session.token, "response for unknown pending id"),
                }
            }
            ReadOutcome::Frame(_) => {
                warn!(token = %session.token, "unexpected frame type while registered, closing");
                let _ = session.send(&Frame::error("expected response frame")).await;
                return;
            }
            ReadOutcome::TooLarge => {
                warn!(token = %session.token, "oversize frame on control channel, closing");
                let _ = session.send(&Frame::error("frame too large")).await;
                return;
            }
            ReadOutcome::Malformed(msg) => {
                warn!(token = %session.token, error = %msg, "malformed frame on control channel, closing");
                let _ = session.send(&Frame::error(format!("malformed frame: {msg}"))).await;
                return;
            }
            ReadOutcome::Eof => {
                debug!(token = %session.token, "control channel closed by client");
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::time::Duration;

    use base64::Engine;

    use crate::config::Config;

    /// Drives `serve_connection` over an in-memory duplex pair, playing the
    /// role of the tunnel client on the other end: register, receive a
    /// request frame dispatched the way the ingress handler would dispatch
    /// it, and answer with a response frame carrying a hop-by-hop header
    /// that must not survive to the pending table's caller.
    #[tokio::test]
    async fn register_request_response_round_trip() {
        let relay = Relay::new(Config::default());
        let remote_addr: SocketAddr = "127.0.0.1:9999".parse().unwrap();
        let (client_stream, server_stream) = tokio::io::duplex(8192);

        let server_relay = relay.clone();
        let server_task =
            tokio::spawn(async move { serve_connection(server_relay, server_stream, remote_addr).await });

        let (client_read, mut client_write) = split(client_stream);
        let mut client_reader = FrameReader::new(client_read, relay.config.max_request_size);

        write_line(
            &mut client_write,
            &Frame::Register { token: "abc12345".to_string(), target_port: 3000 },
        )
        .await
        .unwrap();
        match client_reader.next_frame().await.unwrap() {
            ReadOutcome::Frame(Frame::Registered) => {}
            _ => panic!("expected a registered frame"),
        }

        // Simulate the ingress handler dispatching a request to the now
        //-registered session and waiting on the pending table.
        let session = relay.registry.lookup("abc12345").expect("session registered");
        let owner = Owner { token: "abc12345".to_string(), alias: None };
        let (rx, _guard) = relay.pending.allocate("req-1".to_string(), owner, Duration::from_secs(5));
        let request_frame = Frame::request("req-1", "GET", "/ping", HashMap::new(), b"");
        session.send(&request_frame).await.unwrap();

        match client_reader.next_frame().await.unwrap() {
            ReadOutcome::Frame(Frame::Request { id, method, path, .. }) => {
                assert_eq!(id, "req-1");
                assert_eq!(method, "GET");
                assert_eq!(path, "/ping");
            }
            _ => panic!("expected a request frame"),
        }

        let mut response_headers = HashMap::new();
        response_headers.insert("Connection".to_string(), "keep-alive".to_string());
        response_headers.insert("Content-Type".to_string(), "text/plain".to_string());
        write_line(
            &mut client_write,
            &Frame::Response {
                id: "req-1".to_string(),
                status: 200,
                headers: response_headers,
                body: base64::engine::general_purpose::STANDARD.encode(b"pong"),
            },
        )
        .await
        .unwrap();

        let served = rx.await.unwrap();
        assert_eq!(served.status, 200);
        assert_eq!(served.body, b"pong");
        assert!(!served.headers.contains_key("Connection"), "hop-by-hop header must be stripped");
        assert_eq!(served.headers.get("Content-Type").map(String::as_str), Some("text/plain"));

        drop(client_write);
        drop(client_reader);
        server_task.await.unwrap();
        assert!(relay.registry.lookup("abc12345").is_none(), "session must deregister on close");
    }

    /// `invalid token format` is rejected before any control-plane call.
    #[tokio::test]
    async fn register_with_malformed_token_is_rejected() {
        let relay = Relay::new(Config::default());
        let remote_addr: SocketAddr = "127.0.0.1:9999".parse().unwrap();
        let (client_stream, server_stream) = tokio::io::duplex(8192);

        let server_relay = relay.clone();
        let server_task =
            tokio::spawn(async move { serve_connection(server_relay, server_stream, remote_addr).await });

        let (client_read, mut client_write) = split(client_stream);
        let mut client_reader = FrameReader::new(client_read, relay.config.max_request_size);

        write_line(&mut client_write, &Frame::Register { token: "ab".to_string(), target_port: 3000 })
            .await
            .unwrap();

        match client_reader.next_frame().await.unwrap() {
            ReadOutcome::Frame(Frame::Error { .. }) => {}
            other => panic!("expected an error frame, got a different outcome: {other:?}"),
        }
        assert!(relay.registry.lookup("ab").is_none());

        drop(client_write);
        server_task.await.unwrap();
    }
}
