//! Raw HTTP(S) file streaming for lease device URLs and datastore files.
//!
//! Bodies are never buffered whole: downloads are written chunk by chunk
//! as they arrive and uploads are read from disk in `transferChunkSize`
//! pieces.

use crate::config::VcenterConfig;
use crate::error::{VcenterError, VcenterResult};

use futures::StreamExt;
use log::debug;
use reqwest::header::{CONNECTION, CONTENT_LENGTH, CONTENT_TYPE};
use reqwest::{Body, Client, Method, RequestBuilder, Response};
use std::path::Path;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

/// Content type the NFC import endpoints expect for disk uploads.
pub const STREAM_VMDK: &str = "application/x-vnd.vmware-streamVmdk";

/// Longest slice of a server response body kept in error messages.
const BODY_EXCERPT: usize = 500;

/// Extra request headers (session cookie etc.).
pub type Headers = [(String, String)];

#[derive(Debug, Clone)]
pub struct TransportClient {
    client: Client,
    chunk_size: usize,
}

impl TransportClient {
    /// `verify_tls = false` accepts self-signed host certificates.
    pub fn new(verify_tls: bool, chunk_size: usize) -> VcenterResult<Self> {
        let client = Client::builder()
            .danger_accept_invalid_certs(!verify_tls)
            .connect_timeout(Duration::from_secs(60))
            .build()
            .map_err(|e| VcenterError::connection(format!("Failed to build HTTP client: {e}")))?;
        Ok(Self { client, chunk_size: chunk_size.max(1) })
    }

    pub fn from_config(config: &VcenterConfig) -> VcenterResult<Self> {
        Self::new(config.verify_tls, config.transfer_chunk_size)
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    /// GET `url` and hand back the response for streaming.
    pub async fn get(&self, url: &str, headers: &Headers) -> VcenterResult<Response> {
        let req = with_headers(self.client.get(url), headers);
        check_status(Method::GET, url, req.send().await?).await
    }

    /// Stream `url` into `dest`, returning the number of bytes written.
    pub async fn download_to_file(&self, url: &str, dest: &Path, headers: &Headers) -> VcenterResult<u64> {
        let resp = self.get(url, headers).await?;
        let mut file = tokio::fs::File::create(dest).await?;
        let mut stream = resp.bytes_stream();
        let mut written: u64 = 0;

        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            file.write_all(&chunk).await?;
            written += chunk.len() as u64;
        }
        file.flush().await?;

        debug!("Downloaded {written} bytes from {url} to {}", dest.display());
        Ok(written)
    }

    /// POST a disk image to an NFC import URL.
    pub async fn upload_file(&self, url: &str, src: &Path, headers: &Headers) -> VcenterResult<()> {
        let mut all: Vec<(String, String)> = headers.to_vec();
        all.push((CONTENT_TYPE.to_string(), STREAM_VMDK.to_string()));
        all.push((CONNECTION.to_string(), "Keep-Alive".to_string()));
        self.send_file(Method::POST, url, src, &all, None).await
    }

    /// PUT a file (datastore `/folder` uploads).
    pub async fn put_file(
        &self,
        url: &str,
        src: &Path,
        headers: &Headers,
        auth: Option<(&str, &str)>,
    ) -> VcenterResult<()> {
        let mut all: Vec<(String, String)> = headers.to_vec();
        all.push((CONTENT_TYPE.to_string(), "application/octet-stream".to_string()));
        self.send_file(Method::PUT, url, src, &all, auth).await
    }

    pub async fn delete(&self, url: &str, headers: &Headers, auth: Option<(&str, &str)>) -> VcenterResult<()> {
        let mut req = with_headers(self.client.delete(url), headers);
        if let Some((user, pass)) = auth {
            req = req.basic_auth(user, Some(pass));
        }
        check_status(Method::DELETE, url, req.send().await?).await?;
        Ok(())
    }

    async fn send_file(
        &self,
        method: Method,
        url: &str,
        src: &Path,
        headers: &Headers,
        auth: Option<(&str, &str)>,
    ) -> VcenterResult<()> {
        let file = tokio::fs::File::open(src).await?;
        let len = file.metadata().await?.len();
        let body = Body::wrap_stream(chunked(file, self.chunk_size));

        let mut req = with_headers(self.client.request(method.clone(), url), headers)
            .header(CONTENT_LENGTH, len)
            .body(body);
        if let Some((user, pass)) = auth {
            req = req.basic_auth(user, Some(pass));
        }

        check_status(method, url, req.send().await?).await?;
        debug!("Uploaded {len} bytes from {} to {url}", src.display());
        Ok(())
    }
}

/// Read `file` as a stream of at most `chunk_size`-byte buffers.
fn chunked(
    file: tokio::fs::File,
    chunk_size: usize,
) -> impl futures::Stream<Item = Result<Vec<u8>, std::io::Error>> {
    futures::stream::unfold(Some(file), move |state| async move {
        let mut file = state?;
        let mut buf = vec![0u8; chunk_size];
        match file.read(&mut buf).await {
            Ok(0) => None,
            Ok(n) => {
                buf.truncate(n);
                Some((Ok(buf), Some(file)))
            }
            Err(e) => Some((Err(e), None)),
        }
    })
}

fn with_headers(mut req: RequestBuilder, headers: &Headers) -> RequestBuilder {
    for (k, v) in headers {
        req = req.header(k.as_str(), v.as_str());
    }
    req
}

async fn check_status(method: Method, url: &str, resp: Response) -> VcenterResult<Response> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let body = resp.text().await.unwrap_or_default();
    Err(VcenterError::transfer(format!(
        "{method} {url} returned {}: {}",
        status.as_u16(),
        body_excerpt(&body)
    )))
}

/// Leading part of a response body, cut on a char boundary.
pub(crate) fn body_excerpt(body: &str) -> &str {
    let mut end = body.len().min(BODY_EXCERPT);
    while !body.is_char_boundary(end) {
        end -= 1;
    }
    &body[..end]
}
