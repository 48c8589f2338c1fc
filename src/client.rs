//! Transport client for peer requests.
//!
//! Submits HTTPS POSTs carrying either a binary property-list document
//! or a raw archive stream, classifies the completion, and hands exactly
//! one outcome per non-cancelled call to the dispatcher. Each call runs
//! on its own worker task; calls are independent and no failure is
//! retried here.

use crate::codec::{self, Dictionary};
use crate::dispatch::Dispatcher;
use crate::errors::{Cause, TransportError};
use crate::transport::connect::{InterfaceBinding, LinkLocalConnector};
use crate::transport::security::{TrustMaterial, make_tls_connector};
use bytes::Bytes;
use futures::TryStreamExt as _;
use http_body_util::combinators::UnsyncBoxBody;
use http_body_util::{BodyExt as _, Full, StreamBody};
use hyper::body::Frame;
use hyper::header::{CONTENT_TYPE, HOST};
use hyper::{Method, Request, StatusCode, Uri};
use hyper_util::rt::TokioIo;
use rustls::pki_types::ServerName;
use std::convert::Infallible;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::io::AsyncRead;
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tokio_rustls::TlsConnector;
use tokio_util::io::ReaderStream;

/// Completion of a transport call, delivered through the dispatcher.
pub type Outcome = Result<Dictionary, TransportError>;

/// Content type of encoded document payloads.
const DOCUMENT_CONTENT_TYPE: &str = "application/octet-stream";

/// Content type of raw archive payloads.
const ARCHIVE_CONTENT_TYPE: &str = "application/x-cpio";

#[derive(Clone)]
pub struct ClientOptions {
    /// Bound on establishing the TCP connection.
    pub connect_timeout: Duration,

    /// Optional bound on the whole exchange after the TCP connection is
    /// up. None by default; archive uploads may be arbitrarily long.
    pub request_timeout: Option<Duration>,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            request_timeout: None,
        }
    }
}

/// HTTPS client for posting to share peers.
///
/// Cheap to clone; clones share the interface binding.
#[derive(Clone)]
pub struct ShareClient {
    tls: TlsConnector,
    sockets: Arc<LinkLocalConnector>,
    dispatcher: Dispatcher,
    options: ClientOptions,
}

impl ShareClient {
    /// Create a client that trusts the given material and delivers
    /// completions through the given dispatcher.
    pub fn new(trust: TrustMaterial, dispatcher: Dispatcher) -> anyhow::Result<Self> {
        Self::with_options(trust, dispatcher, ClientOptions::default())
    }

    pub fn with_options(
        trust: TrustMaterial,
        dispatcher: Dispatcher,
        options: ClientOptions,
    ) -> anyhow::Result<Self> {
        Ok(Self {
            tls: make_tls_connector(trust)?,
            sockets: Arc::new(LinkLocalConnector::new()),
            dispatcher,
            options,
        })
    }

    /// Bind the interface used to scope link-local destinations for
    /// subsequent connects.
    pub fn bind_interface(&self, iface: &InterfaceBinding) {
        self.sockets.bind(iface);
    }

    /// POST a document, binary-encoded, to the given URL.
    ///
    /// An encode failure skips the network entirely; like every other
    /// outcome it is delivered through the dispatcher, never from this
    /// call.
    pub fn post_document(
        &self,
        url: &str,
        document: &Dictionary,
        on_complete: impl FnOnce(Outcome) + Send + 'static,
    ) -> PendingCall {
        match codec::encode(document) {
            Ok(encoded) => self.post(url, DOCUMENT_CONTENT_TYPE, full_body(encoded), on_complete),
            Err(err) => self.fail_before_send(url, err, on_complete),
        }
    }

    /// POST a raw archive stream to the given URL.
    ///
    /// The reader is consumed once and dropped after the write finishes,
    /// whether the call succeeds or not.
    pub fn post_stream<R>(
        &self,
        url: &str,
        archive: R,
        on_complete: impl FnOnce(Outcome) + Send + 'static,
    ) -> PendingCall
    where
        R: AsyncRead + Send + 'static,
    {
        self.post(url, ARCHIVE_CONTENT_TYPE, stream_body(archive), on_complete)
    }

    fn fail_before_send(
        &self,
        url: &str,
        err: TransportError,
        on_complete: impl FnOnce(Outcome) + Send + 'static,
    ) -> PendingCall {
        log::warn!("Request to {url} failed before send: {err}");
        let cancelled = Arc::new(AtomicBool::new(false));
        self.dispatcher
            .post(Arc::clone(&cancelled), move || on_complete(Err(err)));
        PendingCall {
            cancelled,
            task: None,
        }
    }

    fn post(
        &self,
        url: &str,
        content_type: &'static str,
        body: UnsyncBoxBody<Bytes, io::Error>,
        on_complete: impl FnOnce(Outcome) + Send + 'static,
    ) -> PendingCall {
        let cancelled = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&cancelled);
        let client = self.clone();
        let dispatcher = self.dispatcher.clone();
        let url = url.to_string();
        let task = tokio::spawn(async move {
            let outcome = client.execute(&url, content_type, body).await;
            if flag.load(Ordering::Acquire) {
                if let Err(err) = &outcome {
                    log::warn!("Request to {url} canceled: {err}");
                }
                return;
            }
            if let Err(err) = &outcome {
                log::error!("Request to {url} failed: {err}");
            }
            dispatcher.post(flag, move || on_complete(outcome));
        });
        PendingCall {
            cancelled,
            task: Some(task),
        }
    }

    /// Run one request and classify its completion.
    async fn execute(
        &self,
        url: &str,
        content_type: &'static str,
        body: UnsyncBoxBody<Bytes, io::Error>,
    ) -> Outcome {
        let target = resolve(url).await?;

        let stream = self
            .sockets
            .connect(target.addr, self.options.connect_timeout)
            .await
            .map_err(network)?;

        let exchange = Self::exchange(&self.tls, stream, &target, content_type, body);
        let (status, bytes) = match self.options.request_timeout {
            Some(limit) => tokio::time::timeout(limit, exchange).await.map_err(|_| {
                network(io::Error::new(io::ErrorKind::TimedOut, "request timed out"))
            })??,
            None => exchange.await?,
        };

        if status != StatusCode::OK {
            return Err(TransportError::Status(status.as_u16()));
        }
        if bytes.is_empty() {
            return Err(TransportError::EmptyBody);
        }
        codec::decode(&bytes)
    }

    /// TLS handshake and one POST over the established TCP stream.
    ///
    /// The response body is only read on 200; other statuses are
    /// classified without parsing.
    async fn exchange(
        tls: &TlsConnector,
        stream: TcpStream,
        target: &Target,
        content_type: &'static str,
        body: UnsyncBoxBody<Bytes, io::Error>,
    ) -> Result<(StatusCode, Bytes), TransportError> {
        let tls_stream = tls
            .connect(target.server_name.clone(), stream)
            .await
            .map_err(network)?;

        let (mut sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(tls_stream))
            .await
            .map_err(network)?;
        tokio::spawn(async move {
            if let Err(err) = conn.await {
                log::debug!("Connection task ended: {err}");
            }
        });

        let request = Request::builder()
            .method(Method::POST)
            .uri(target.path.as_str())
            .header(HOST, target.authority.as_str())
            .header(CONTENT_TYPE, content_type)
            .body(body)
            .map_err(network)?;

        let response = sender.send_request(request).await.map_err(network)?;
        let status = response.status();
        if status != StatusCode::OK {
            return Ok((status, Bytes::new()));
        }
        let bytes = response
            .into_body()
            .collect()
            .await
            .map_err(network)?
            .to_bytes();
        Ok((status, bytes))
    }
}

/// Cancellable handle for a submitted request.
///
/// Dropping the handle does not cancel the call.
pub struct PendingCall {
    cancelled: Arc<AtomicBool>,
    task: Option<JoinHandle<()>>,
}

impl PendingCall {
    /// Withdraw interest in the outcome. Idempotent.
    ///
    /// No callback is delivered for this call afterwards, even if the
    /// network side already produced a result; a still-running request
    /// is aborted.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
        if let Some(task) = &self.task {
            task.abort();
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }
}

/// Resolved connect target for one request.
struct Target {
    addr: SocketAddr,
    server_name: ServerName<'static>,
    authority: String,
    path: String,
}

/// Resolve a URL the way the discovery layer published it: a literal
/// (usually IPv6) host and a port. Any scope information is absent here
/// on purpose; the connector adds it at connect time.
async fn resolve(url: &str) -> Result<Target, TransportError> {
    let uri: Uri = url.parse().map_err(network)?;
    if uri.scheme_str() != Some("https") {
        return Err(network_msg(format!("not an https URL: {url}")));
    }
    let authority = uri
        .authority()
        .ok_or_else(|| network_msg(format!("URL has no authority: {url}")))?;

    let host = authority.host();
    let host = host
        .strip_prefix('[')
        .and_then(|h| h.strip_suffix(']'))
        .unwrap_or(host);
    let port = uri.port_u16().unwrap_or(443);

    let addr = tokio::net::lookup_host((host, port))
        .await
        .map_err(network)?
        .next()
        .ok_or_else(|| network_msg(format!("no address found for {host}")))?;
    let server_name = ServerName::try_from(host.to_string()).map_err(network)?;
    let path = uri
        .path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_else(|| "/".to_string());

    Ok(Target {
        addr,
        server_name,
        authority: authority.to_string(),
        path,
    })
}

fn network(err: impl Into<Cause>) -> TransportError {
    TransportError::Network(err.into())
}

fn network_msg(msg: String) -> TransportError {
    TransportError::Network(msg.into())
}

fn full_body(encoded: Vec<u8>) -> UnsyncBoxBody<Bytes, io::Error> {
    Full::new(Bytes::from(encoded))
        .map_err(|never: Infallible| match never {})
        .boxed_unsync()
}

fn stream_body<R>(archive: R) -> UnsyncBoxBody<Bytes, io::Error>
where
    R: AsyncRead + Send + 'static,
{
    StreamBody::new(ReaderStream::new(archive).map_ok(Frame::data)).boxed_unsync()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::Value;
    use crate::transport::security::testing;
    use crate::utils::async_utils::AbortOnDrop;
    use crate::utils::logging;
    use std::pin::Pin;
    use std::sync::atomic::AtomicUsize;
    use std::task::{Context, Poll};
    use tokio::io::{AsyncReadExt as _, AsyncWriteExt as _, ReadBuf};
    use tokio::net::TcpListener;
    use tokio::sync::oneshot;
    use tokio_rustls::TlsAcceptor;

    struct Fixture {
        client: ShareClient,
    }

    impl Fixture {
        fn setup() -> anyhow::Result<Self> {
            logging::try_init();

            Ok(Self {
                client: ShareClient::new(testing::client_trust(), Dispatcher::spawn())?,
            })
        }

        fn url(&self, addr: SocketAddr, path: &str) -> String {
            format!("https://{addr}{path}")
        }

        fn submit_document(
            &self,
            url: &str,
            document: &Dictionary,
        ) -> (PendingCall, oneshot::Receiver<Outcome>) {
            let (tx, rx) = oneshot::channel();
            let call = self.client.post_document(url, document, move |outcome| {
                let _ = tx.send(outcome);
            });
            (call, rx)
        }

        fn submit_stream<R>(&self, url: &str, archive: R) -> (PendingCall, oneshot::Receiver<Outcome>)
        where
            R: AsyncRead + Send + 'static,
        {
            let (tx, rx) = oneshot::channel();
            let call = self.client.post_stream(url, archive, move |outcome| {
                let _ = tx.send(outcome);
            });
            (call, rx)
        }
    }

    fn status_doc() -> Dictionary {
        let mut doc = Dictionary::new();
        doc.insert("Status".to_string(), Value::Integer(0i64.into()));
        doc
    }

    #[tokio::test]
    async fn posts_document_and_decodes_binary_response() -> anyhow::Result<()> {
        let fixture = Fixture::setup()?;
        let response = codec::encode(&status_doc())?;
        let (addr, server, head_rx) =
            serve_once(testing::server_acceptor(), "200 OK", response).await?;

        let (_call, rx) = fixture.submit_document(&fixture.url(addr, "/Ask"), &status_doc());
        assert_eq!(status_doc(), rx.await??);

        let head = head_rx.await?;
        assert!(head.starts_with("POST /Ask HTTP/1.1"), "{head}");
        assert!(
            head.to_ascii_lowercase()
                .contains("content-type: application/octet-stream"),
            "{head}"
        );

        server.join().await?;
        Ok(())
    }

    #[tokio::test]
    async fn decodes_xml_response() -> anyhow::Result<()> {
        let fixture = Fixture::setup()?;
        let response = r#"<?xml version="1.0" encoding="UTF-8"?>
<!DOCTYPE plist PUBLIC "-//Apple//DTD PLIST 1.0//EN" "http://www.apple.com/DTDs/PropertyList-1.0.dtd">
<plist version="1.0">
<dict><key>Status</key><integer>0</integer></dict>
</plist>
"#;
        let (addr, _server, _head_rx) = serve_once(
            testing::server_acceptor(),
            "200 OK",
            response.as_bytes().to_vec(),
        )
        .await?;

        let (_call, rx) = fixture.submit_document(&fixture.url(addr, "/Ask"), &status_doc());
        assert_eq!(status_doc(), rx.await??);

        Ok(())
    }

    #[tokio::test]
    async fn non_200_is_status_error_without_parsing() -> anyhow::Result<()> {
        let fixture = Fixture::setup()?;
        let (addr, _server, _head_rx) = serve_once(
            testing::server_acceptor(),
            "404 Not Found",
            b"<html>not a property list</html>".to_vec(),
        )
        .await?;

        let (_call, rx) = fixture.submit_document(&fixture.url(addr, "/Ask"), &status_doc());
        assert!(matches!(rx.await?, Err(TransportError::Status(404))));

        Ok(())
    }

    #[tokio::test]
    async fn empty_body_is_an_error() -> anyhow::Result<()> {
        let fixture = Fixture::setup()?;
        let (addr, _server, _head_rx) =
            serve_once(testing::server_acceptor(), "200 OK", Vec::new()).await?;

        let (_call, rx) = fixture.submit_document(&fixture.url(addr, "/Ask"), &status_doc());
        assert!(matches!(rx.await?, Err(TransportError::EmptyBody)));

        Ok(())
    }

    #[tokio::test]
    async fn unparsable_body_is_decode_error() -> anyhow::Result<()> {
        let fixture = Fixture::setup()?;
        let (addr, _server, _head_rx) = serve_once(
            testing::server_acceptor(),
            "200 OK",
            b"neither binary nor markup".to_vec(),
        )
        .await?;

        let (_call, rx) = fixture.submit_document(&fixture.url(addr, "/Ask"), &status_doc());
        assert!(matches!(rx.await?, Err(TransportError::Decode(_))));

        Ok(())
    }

    #[tokio::test]
    async fn untrusted_server_is_network_error() -> anyhow::Result<()> {
        let fixture = Fixture::setup()?;
        let (addr, _server, _head_rx) =
            serve_once(testing::rogue_acceptor(), "200 OK", Vec::new()).await?;

        let (_call, rx) = fixture.submit_document(&fixture.url(addr, "/Ask"), &status_doc());
        assert!(matches!(rx.await?, Err(TransportError::Network(_))));

        Ok(())
    }

    #[tokio::test]
    async fn invalid_url_is_network_error() -> anyhow::Result<()> {
        let fixture = Fixture::setup()?;

        let (_call, rx) = fixture.submit_document("http://unencrypted.example/Ask", &status_doc());
        assert!(matches!(rx.await?, Err(TransportError::Network(_))));

        Ok(())
    }

    #[tokio::test]
    async fn cancel_before_completion_suppresses_delivery() -> anyhow::Result<()> {
        let fixture = Fixture::setup()?;
        let (addr, _server) = serve_stalled(testing::server_acceptor()).await?;

        let (call, rx) = fixture.submit_document(&fixture.url(addr, "/Ask"), &status_doc());
        call.cancel();
        call.cancel(); // idempotent
        assert!(call.is_cancelled());

        // The callback was dropped undelivered.
        assert!(rx.await.is_err());

        Ok(())
    }

    #[tokio::test]
    async fn stream_post_sends_archive_and_closes_reader_once() -> anyhow::Result<()> {
        let fixture = Fixture::setup()?;
        let response = codec::encode(&status_doc())?;
        let (addr, _server, head_rx) =
            serve_once(testing::server_acceptor(), "200 OK", response).await?;

        let drops = Arc::new(AtomicUsize::new(0));
        let reader = CountingReader {
            drops: Arc::clone(&drops),
        };
        let (_call, rx) = fixture.submit_stream(&fixture.url(addr, "/Upload"), reader);
        rx.await??;

        let head = head_rx.await?;
        assert!(
            head.to_ascii_lowercase()
                .contains("content-type: application/x-cpio"),
            "{head}"
        );

        // The zero-length stream was consumed and dropped exactly once.
        for _ in 0..100 {
            if drops.load(Ordering::Acquire) == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(1, drops.load(Ordering::Acquire));

        Ok(())
    }

    #[tokio::test]
    async fn link_local_destination_is_scoped() -> anyhow::Result<()> {
        let fixture = Fixture::setup()?;
        fixture
            .client
            .bind_interface(&InterfaceBinding::new("wlan0", 7));

        let target = resolve("https://[fe80::1]:8771/Ask").await?;
        assert_eq!("[fe80::1]:8771".parse::<SocketAddr>()?, target.addr);
        assert_eq!("[fe80::1]:8771", target.authority);
        assert_eq!("/Ask", target.path);

        match fixture.client.sockets.scoped(target.addr) {
            SocketAddr::V6(v6) => {
                assert_eq!(7, v6.scope_id());
                assert_eq!(8771, v6.port());
            }
            other => panic!("unexpected address {other}"),
        }

        Ok(())
    }

    #[tokio::test]
    async fn default_port_is_443() -> anyhow::Result<()> {
        let target = resolve("https://[fe80::1]/Ask").await?;
        assert_eq!(443, target.addr.port());

        Ok(())
    }

    /// Zero-length archive stream that counts how often it is dropped.
    struct CountingReader {
        drops: Arc<AtomicUsize>,
    }

    impl AsyncRead for CountingReader {
        fn poll_read(
            self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            _buf: &mut ReadBuf<'_>,
        ) -> Poll<io::Result<()>> {
            // Immediate EOF.
            Poll::Ready(Ok(()))
        }
    }

    impl Drop for CountingReader {
        fn drop(&mut self) {
            self.drops.fetch_add(1, Ordering::AcqRel);
        }
    }

    /// Minimal property-list peer: accepts one TLS connection, consumes
    /// one request, answers with the given status line and body, and
    /// reports the request head it saw.
    async fn serve_once(
        acceptor: TlsAcceptor,
        status: &'static str,
        body: Vec<u8>,
    ) -> anyhow::Result<(SocketAddr, AbortOnDrop<()>, oneshot::Receiver<String>)> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let (head_tx, head_rx) = oneshot::channel();

        let handle = AbortOnDrop::new(tokio::spawn(async move {
            let Ok((tcp, _)) = listener.accept().await else {
                return;
            };
            let Ok(mut tls) = acceptor.accept(tcp).await else {
                return;
            };
            let Ok(head) = read_request(&mut tls).await else {
                return;
            };
            let _ = head_tx.send(head);

            let response = format!(
                "HTTP/1.1 {status}\r\ncontent-length: {}\r\nconnection: close\r\n\r\n",
                body.len()
            );
            let _ = tls.write_all(response.as_bytes()).await;
            let _ = tls.write_all(&body).await;
            let _ = tls.shutdown().await;
        }));

        Ok((addr, handle, head_rx))
    }

    /// Accepts the TLS connection, then never answers.
    async fn serve_stalled(acceptor: TlsAcceptor) -> anyhow::Result<(SocketAddr, AbortOnDrop<()>)> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;

        let handle = AbortOnDrop::new(tokio::spawn(async move {
            let Ok((tcp, _)) = listener.accept().await else {
                return;
            };
            let Ok(_tls) = acceptor.accept(tcp).await else {
                return;
            };
            tokio::time::sleep(Duration::from_secs(60)).await;
        }));

        Ok((addr, handle))
    }

    /// Read one full request: headers, then a content-length or chunked
    /// body.
    async fn read_request<S>(stream: &mut S) -> anyhow::Result<String>
    where
        S: tokio::io::AsyncRead + Unpin,
    {
        let mut buf = Vec::new();
        let mut chunk = [0u8; 4096];
        let head_end = loop {
            let n = stream.read(&mut chunk).await?;
            anyhow::ensure!(n > 0, "connection closed before headers");
            buf.extend_from_slice(&chunk[..n]);
            if let Some(pos) = find(&buf, b"\r\n\r\n") {
                break pos + 4;
            }
        };
        let head = String::from_utf8_lossy(&buf[..head_end]).to_string();
        let lower = head.to_ascii_lowercase();

        if let Some(len) = content_length(&lower) {
            while buf.len() - head_end < len {
                let n = stream.read(&mut chunk).await?;
                anyhow::ensure!(n > 0, "connection closed mid-body");
                buf.extend_from_slice(&chunk[..n]);
            }
        } else if lower.contains("transfer-encoding: chunked") {
            while find(&buf[head_end..], b"0\r\n\r\n").is_none() {
                let n = stream.read(&mut chunk).await?;
                anyhow::ensure!(n > 0, "connection closed mid-chunks");
                buf.extend_from_slice(&chunk[..n]);
            }
        }

        Ok(head)
    }

    fn content_length(lower_head: &str) -> Option<usize> {
        lower_head
            .lines()
            .find_map(|line| line.strip_prefix("content-length:"))
            .and_then(|v| v.trim().parse().ok())
    }

    fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
        haystack.windows(needle.len()).position(|w| w == needle)
    }
}
