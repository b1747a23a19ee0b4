//! One-shot fetcher: exactly one HTTP/1.1 GET and one handler call.
//!
//! Responsibilities of this module:
//!   1) Dial the target: plain TCP, or TLS with verification disabled.
//!   2) Send a fixed-shape GET request.
//!   3) Read the status line + header block, then the body (chunked or
//!      Content-Length framing), then inflate gzip/deflate content.
//!   4) Hand the finished response to the document handler.
//!
//! Every failure is terminal for this URL only: logged, connection
//! dropped, gates released. Gate release and termination accounting ride
//! on RAII guards so that early returns (and even a panicking handler)
//! release exactly once.

use std::io::{self, Read};
use std::sync::Arc;

use flate2::read::{DeflateDecoder, GzDecoder};
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{DigitallySignedStruct, SignatureScheme};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::OwnedSemaphorePermit;
use tokio_rustls::TlsConnector;

use super::Crawl;
use crate::error::FetchError;
use crate::response::Response;
use crate::url::CrawlUrl;

/// Plain or TLS byte stream; the fetcher does not care which.
trait Transport: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> Transport for T {}

type Connection = BufReader<Box<dyn Transport>>;

/// Both gate permits for one fetch, released together when the task
/// finishes: per-host first, then global (field order is drop order).
pub(super) struct GatePermits {
    pub(super) host: OwnedSemaphorePermit,
    pub(super) global: OwnedSemaphorePermit,
}

/// Marks the URL finished in the termination accounting when dropped.
struct DoneGuard {
    crawl: Crawl,
}

impl Drop for DoneGuard {
    fn drop(&mut self) {
        self.crawl.task_done();
    }
}

/// Entry point of one fetch task.
pub(super) async fn run(crawl: Crawl, url: String, permits: GatePermits) {
    // Locals drop in reverse declaration order: the permits go first
    // (host, then global), then the done marker fires. A panic anywhere
    // below unwinds through the same guards.
    let _done = DoneGuard {
        crawl: crawl.clone(),
    };
    let _permits = permits;

    match crawl.deadline() {
        Some(limit) => {
            if tokio::time::timeout(limit, fetch_one(&crawl, &url))
                .await
                .is_err()
            {
                crawl
                    .logger()
                    .log(format_args!("({}) GET {url}", FetchError::Timeout));
            }
        }
        None => fetch_one(&crawl, &url).await,
    }
}

async fn fetch_one(crawl: &Crawl, url: &str) {
    let target = CrawlUrl::parse(url);

    let mut stream = match connect(crawl, &target).await {
        Ok(stream) => stream,
        Err(e) => {
            crawl.logger().log(format_args!("({e}) GET {url}"));
            return;
        }
    };

    if let Err(e) = send_request(crawl, &mut stream, &target).await {
        crawl.logger().log(format_args!("({e}) GET {url}"));
        return;
    }

    let header_block = match read_header_block(&mut stream).await {
        Ok(block) => block,
        Err(e) => {
            crawl.logger().log(format_args!("({e}) GET {url}"));
            return;
        }
    };

    let mut response = match Response::parse(url, &header_block) {
        Ok(response) => response,
        Err(e) => {
            crawl.logger().log(format_args!("({e}) GET {url}"));
            Response::unparsed(url)
        }
    };

    let body = if response.get("Transfer-Encoding") == Some("chunked") {
        read_chunked(&mut stream).await
    } else {
        let length = response
            .get("Content-Length")
            .and_then(|v| v.trim().parse::<usize>().ok())
            .unwrap_or(0);
        read_sized(&mut stream, length).await
    };
    let body = match body {
        Ok(body) => body,
        Err(e) => {
            crawl.logger().log(format_args!("({e}) GET {url}"));
            Vec::new()
        }
    };

    // Connection reuse is a non-goal; the socket closes here regardless
    // of the keep-alive request hint.
    drop(stream);

    if body.is_empty() {
        return;
    }

    let body = match response.get("Content-Encoding") {
        Some("gzip") => gzip_decompress(&body),
        Some("deflate") => deflate_decompress(&body),
        _ => Ok(body),
    };
    let body = match body {
        Ok(body) => body,
        Err(e) => {
            crawl.logger().log(format_args!("({e}) GET {url}"));
            Vec::new()
        }
    };

    response.set_body(body);

    let code = response
        .code()
        .map_or_else(|| "-".to_string(), |c| c.to_string());
    crawl.logger().log(format_args!("({code}) GET {url}"));
    crawl.mark_completed();

    let handler = crawl.handler();
    if let Err(e) = handler.handle_document(crawl, response).await {
        let e = FetchError::Handler(e);
        crawl.logger().log(format_args!("({e}) GET {url}"));
    }
}

/// Dial the target's host:port; wrap in TLS when the scheme is https.
async fn connect(crawl: &Crawl, target: &CrawlUrl) -> Result<Connection, FetchError> {
    let tcp = TcpStream::connect((target.host(), target.port()))
        .await
        .map_err(FetchError::Connect)?;

    let transport: Box<dyn Transport> = if target.scheme() == "https" {
        let name = ServerName::try_from(target.host().to_string())
            .map_err(|e| FetchError::Connect(io::Error::new(io::ErrorKind::InvalidInput, e)))?;
        let tls = crawl
            .tls()
            .connect(name, tcp)
            .await
            .map_err(FetchError::Connect)?;
        Box::new(tls)
    } else {
        Box::new(tcp)
    };

    Ok(BufReader::new(transport))
}

async fn send_request(
    crawl: &Crawl,
    stream: &mut Connection,
    target: &CrawlUrl,
) -> Result<(), FetchError> {
    let request = compose_request(target, &crawl.agent().user_agent());
    stream
        .write_all(request.as_bytes())
        .await
        .map_err(FetchError::Write)?;
    stream.flush().await.map_err(FetchError::Write)?;
    Ok(())
}

/// `path` alone, or `path?query` when a query is present.
fn request_target(target: &CrawlUrl) -> String {
    if target.query().is_empty() {
        target.path().to_string()
    } else {
        format!("{}?{}", target.path(), target.query())
    }
}

fn compose_request(target: &CrawlUrl, agent: &str) -> String {
    format!(
        "GET {} HTTP/1.1\r\n\
         Host: {}\r\n\
         Connection: keep-alive\r\n\
         Pragma: no-cache\r\n\
         Cache-Control: no-cache\r\n\
         Upgrade-Insecure-Requests: 1\r\n\
         User-Agent: {}\r\n\
         Accept: text/html,application/xhtml+xml,application/xml;q=0.9,\
         image/webp,image/apng,*/*;q=0.8,application/signed-exchange;v=b3;q=0.9\r\n\
         Accept-Language: zh-CN,zh;q=0.9\r\n\
         Accept-Encoding: gzip, deflate\r\n\
         \r\n",
        request_target(target),
        target.host(),
        agent,
    )
}

/// Read CRLF lines until the blank line that terminates the header
/// block; the returned bytes include every separator.
async fn read_header_block(stream: &mut Connection) -> Result<Vec<u8>, FetchError> {
    let mut block = Vec::new();
    loop {
        let n = stream
            .read_until(b'\n', &mut block)
            .await
            .map_err(FetchError::ReadHeader)?;
        if n == 0 {
            return Err(FetchError::ReadHeader(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "eof before end of headers",
            )));
        }
        if n == 2 && block.ends_with(b"\r\n\r\n") {
            return Ok(block);
        }
    }
}

/// Read exactly `length` body bytes (zero is legal and yields an empty
/// body immediately).
async fn read_sized(stream: &mut Connection, length: usize) -> Result<Vec<u8>, FetchError> {
    let mut body = vec![0u8; length];
    stream
        .read_exact(&mut body)
        .await
        .map_err(FetchError::Frame)?;
    Ok(body)
}

/// Assemble a chunk-framed body: hex length line, payload + CRLF,
/// repeated until the `0` length line. Trailers are not processed.
async fn read_chunked(stream: &mut Connection) -> Result<Vec<u8>, FetchError> {
    let mut content = Vec::new();
    loop {
        let mut line = Vec::new();
        let n = stream
            .read_until(b'\n', &mut line)
            .await
            .map_err(FetchError::Frame)?;
        if n == 0 {
            return Err(FetchError::Frame(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "eof inside chunked body",
            )));
        }
        if line == b"0\r\n" {
            return Ok(content);
        }

        let size = std::str::from_utf8(&line)
            .ok()
            .and_then(|s| usize::from_str_radix(s.trim_end(), 16).ok())
            .ok_or_else(|| {
                FetchError::Frame(io::Error::new(
                    io::ErrorKind::InvalidData,
                    "bad chunk length line",
                ))
            })?;

        let mut chunk = vec![0u8; size + 2];
        stream
            .read_exact(&mut chunk)
            .await
            .map_err(FetchError::Frame)?;
        chunk.truncate(size); // drop the trailing CRLF
        content.append(&mut chunk);
    }
}

fn gzip_decompress(data: &[u8]) -> Result<Vec<u8>, FetchError> {
    let mut out = Vec::new();
    GzDecoder::new(data)
        .read_to_end(&mut out)
        .map_err(FetchError::Decode)?;
    Ok(out)
}

/// Raw DEFLATE stream, no zlib envelope.
fn deflate_decompress(data: &[u8]) -> Result<Vec<u8>, FetchError> {
    let mut out = Vec::new();
    DeflateDecoder::new(data)
        .read_to_end(&mut out)
        .map_err(FetchError::Decode)?;
    Ok(out)
}

/// TLS connector that accepts any certificate and skips hostname
/// checks: crawl reach is traded for trust, like a browser with
/// verification turned off.
pub(super) fn tls_connector() -> TlsConnector {
    let _ = rustls::crypto::ring::default_provider().install_default();

    let verifier = AcceptAnyCert(rustls::crypto::ring::default_provider());
    let config = rustls::ClientConfig::builder()
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(verifier))
        .with_no_client_auth();

    TlsConnector::from(Arc::new(config))
}

#[derive(Debug)]
struct AcceptAnyCert(CryptoProvider);

impl ServerCertVerifier for AcceptAnyCert {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.0.signature_verification_algorithms.supported_schemes()
    }
}
