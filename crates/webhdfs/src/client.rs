//! The WebHDFS client proper.
//!
//! One [`Client`] talks to one name node. Metadata operations are plain
//! JSON calls; OPEN and CREATE are two-step dances where the name node
//! answers with a 307 redirect naming the data node that will actually
//! move the bytes, so both agents run with automatic redirects disabled.

use std::io::Read as _;
use std::sync::mpsc;
use std::time::Duration;

use http::{Method, StatusCode};
use percent_encoding::{AsciiSet, CONTROLS, utf8_percent_encode};
use tracing::debug;

use crate::error::WebHdfsError;
use crate::models::{
    BooleanEnvelope, ContentSummary, ContentSummaryEnvelope, FileStatus, FileStatusEnvelope,
    FileStatusesEnvelope, RemoteExceptionEnvelope,
};

/// Characters escaped inside path segments. `/` stays literal.
const PATH_ESCAPE: &AsciiSet = &CONTROLS
    .add(b' ')
    .add(b'"')
    .add(b'#')
    .add(b'%')
    .add(b'?')
    .add(b'+')
    .add(b'<')
    .add(b'>')
    .add(b'[')
    .add(b']')
    .add(b'{')
    .add(b'}');

const METADATA_TIMEOUT: Duration = Duration::from_secs(30);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Upload chunks are capped so back-pressure reaches the writer quickly.
const WRITE_CHANNEL_DEPTH: usize = 16;

/// A blocking WebHDFS client bound to a single name node address.
#[derive(Debug, Clone)]
pub struct Client {
    /// Short-deadline agent for metadata calls.
    agent: ureq::Agent,
    /// No global deadline: streams may legitimately live for hours.
    transfer_agent: ureq::Agent,
    base: String,
    user: String,
}

impl Client {
    /// Build a client for `address` (`host:port` of a name node HTTP
    /// endpoint), authenticating as `user` via simple auth.
    #[must_use]
    pub fn new(address: &str, user: &str) -> Self {
        let agent = ureq::Agent::config_builder()
            .timeout_global(Some(METADATA_TIMEOUT))
            .max_redirects(0)
            // Status codes are inspected manually so remote exceptions can
            // be decoded from error bodies.
            .http_status_as_error(false)
            .build()
            .new_agent();
        let transfer_agent = ureq::Agent::config_builder()
            .timeout_connect(Some(CONNECT_TIMEOUT))
            .max_redirects(0)
            .http_status_as_error(false)
            .build()
            .new_agent();
        Self {
            agent,
            transfer_agent,
            base: format!("http://{address}"),
            user: user.to_owned(),
        }
    }

    fn url(&self, path: &str, op: &str, params: &[(&str, String)]) -> String {
        let escaped = utf8_percent_encode(path, PATH_ESCAPE);
        let mut url = format!(
            "{}/webhdfs/v1{escaped}?op={op}&user.name={}",
            self.base, self.user
        );
        for (k, v) in params {
            url.push('&');
            url.push_str(k);
            url.push('=');
            url.push_str(v);
        }
        url
    }

    fn run(
        &self,
        agent: &ureq::Agent,
        method: Method,
        url: &str,
    ) -> Result<http::Response<ureq::Body>, WebHdfsError> {
        let request = http::Request::builder()
            .method(method)
            .uri(url)
            .body(())
            .map_err(|e| WebHdfsError::Other(Box::new(e)))?;
        agent.run(request).map_err(WebHdfsError::from_ureq)
    }

    /// Read the whole body and decode it as `T`, or decode the remote
    /// exception carried by a non-2xx response.
    fn parse_json<T: serde::de::DeserializeOwned>(
        response: http::Response<ureq::Body>,
    ) -> Result<T, WebHdfsError> {
        let (parts, body) = response.into_parts();
        let mut bytes = Vec::new();
        body.into_reader()
            .read_to_end(&mut bytes)
            .map_err(|e| WebHdfsError::Connection(e.to_string()))?;

        if parts.status.is_success() {
            Ok(serde_json::from_slice(&bytes)?)
        } else {
            Err(Self::error_from_body(parts.status, &bytes))
        }
    }

    /// Check an empty-body operation for success.
    fn expect_ok(response: http::Response<ureq::Body>) -> Result<(), WebHdfsError> {
        let (parts, body) = response.into_parts();
        if parts.status.is_success() {
            return Ok(());
        }
        let mut bytes = Vec::new();
        body.into_reader()
            .read_to_end(&mut bytes)
            .map_err(|e| WebHdfsError::Connection(e.to_string()))?;
        Err(Self::error_from_body(parts.status, &bytes))
    }

    fn error_from_body(status: StatusCode, bytes: &[u8]) -> WebHdfsError {
        match serde_json::from_slice::<RemoteExceptionEnvelope>(bytes) {
            Ok(env) => WebHdfsError::from_remote(status.as_u16(), env.remote_exception),
            Err(_) => WebHdfsError::Remote {
                status: status.as_u16(),
                exception: "HttpError".to_owned(),
                message: String::from_utf8_lossy(bytes).into_owned(),
            },
        }
    }

    /// GETFILESTATUS.
    pub fn get_file_status(&self, path: &str) -> Result<FileStatus, WebHdfsError> {
        let url = self.url(path, "GETFILESTATUS", &[]);
        let env: FileStatusEnvelope = Self::parse_json(self.run(&self.agent, Method::GET, &url)?)?;
        Ok(env.file_status)
    }

    /// LISTSTATUS.
    pub fn list_status(&self, path: &str) -> Result<Vec<FileStatus>, WebHdfsError> {
        let url = self.url(path, "LISTSTATUS", &[]);
        let env: FileStatusesEnvelope =
            Self::parse_json(self.run(&self.agent, Method::GET, &url)?)?;
        Ok(env.file_statuses.file_status)
    }

    /// GETCONTENTSUMMARY.
    pub fn content_summary(&self, path: &str) -> Result<ContentSummary, WebHdfsError> {
        let url = self.url(path, "GETCONTENTSUMMARY", &[]);
        let env: ContentSummaryEnvelope =
            Self::parse_json(self.run(&self.agent, Method::GET, &url)?)?;
        Ok(env.content_summary)
    }

    /// MKDIRS with the given octal permission.
    pub fn mkdirs(&self, path: &str, permission: u16) -> Result<(), WebHdfsError> {
        let url = self.url(
            path,
            "MKDIRS",
            &[("permission", format!("{permission:o}"))],
        );
        let env: BooleanEnvelope = Self::parse_json(self.run(&self.agent, Method::PUT, &url)?)?;
        if env.boolean {
            Ok(())
        } else {
            Err(WebHdfsError::Rejected("mkdirs"))
        }
    }

    /// RENAME. The name node reports an un-renameable destination as a
    /// plain `false` rather than an exception.
    pub fn rename(&self, src: &str, dst: &str) -> Result<(), WebHdfsError> {
        let url = self.url(
            src,
            "RENAME",
            &[(
                "destination",
                utf8_percent_encode(dst, PATH_ESCAPE).to_string(),
            )],
        );
        let env: BooleanEnvelope = Self::parse_json(self.run(&self.agent, Method::PUT, &url)?)?;
        if env.boolean {
            Ok(())
        } else {
            Err(WebHdfsError::Rejected("rename"))
        }
    }

    /// DELETE, recursively.
    pub fn delete(&self, path: &str) -> Result<(), WebHdfsError> {
        let url = self.url(path, "DELETE", &[("recursive", "true".to_owned())]);
        let env: BooleanEnvelope = Self::parse_json(self.run(&self.agent, Method::DELETE, &url)?)?;
        if env.boolean {
            Ok(())
        } else {
            Err(WebHdfsError::Rejected("delete"))
        }
    }

    /// SETPERMISSION.
    pub fn set_permission(&self, path: &str, permission: u16) -> Result<(), WebHdfsError> {
        let url = self.url(
            path,
            "SETPERMISSION",
            &[("permission", format!("{permission:o}"))],
        );
        Self::expect_ok(self.run(&self.agent, Method::PUT, &url)?)
    }

    /// SETOWNER. Either of `owner` and `group` may be omitted.
    pub fn set_owner(
        &self,
        path: &str,
        owner: Option<&str>,
        group: Option<&str>,
    ) -> Result<(), WebHdfsError> {
        let mut params = Vec::new();
        if let Some(owner) = owner {
            params.push(("owner", owner.to_owned()));
        }
        if let Some(group) = group {
            params.push(("group", group.to_owned()));
        }
        let url = self.url(path, "SETOWNER", &params);
        Self::expect_ok(self.run(&self.agent, Method::PUT, &url)?)
    }

    /// Resolve the data-node URL for a redirected operation.
    fn redirect_location(
        response: http::Response<ureq::Body>,
    ) -> Result<String, WebHdfsError> {
        let (parts, body) = response.into_parts();
        if parts.status != StatusCode::TEMPORARY_REDIRECT {
            let mut bytes = Vec::new();
            body.into_reader()
                .read_to_end(&mut bytes)
                .map_err(|e| WebHdfsError::Connection(e.to_string()))?;
            if parts.status.is_success() {
                return Err(WebHdfsError::Redirect(format!(
                    "expected 307 from name node, got {}",
                    parts.status
                )));
            }
            return Err(Self::error_from_body(parts.status, &bytes));
        }
        parts
            .headers
            .get(http::header::LOCATION)
            .and_then(|v| v.to_str().ok())
            .map(str::to_owned)
            .ok_or_else(|| WebHdfsError::Redirect("307 without a Location header".to_owned()))
    }

    /// OPEN at `offset`. Returns a lazily-connected positional reader.
    pub fn open(&self, path: &str, offset: u64) -> Result<FileReader, WebHdfsError> {
        let mut reader = FileReader {
            client: self.clone(),
            path: path.to_owned(),
            offset,
            body: None,
        };
        // Connect eagerly so open errors (missing path, dead data node)
        // surface here rather than on the first read.
        reader.connect()?;
        Ok(reader)
    }

    /// CREATE with `overwrite=true`. Bytes are streamed to the data node
    /// from a bounded channel; `FileWriter::close` completes the upload.
    pub fn create(&self, path: &str, permission: u16) -> Result<FileWriter, WebHdfsError> {
        let url = self.url(
            path,
            "CREATE",
            &[
                ("permission", format!("{permission:o}")),
                ("overwrite", "true".to_owned()),
            ],
        );
        let location = Self::redirect_location(self.run(&self.transfer_agent, Method::PUT, &url)?)?;
        debug!(path, "create redirected to data node");

        let (tx, rx) = mpsc::sync_channel::<Vec<u8>>(WRITE_CHANNEL_DEPTH);
        let agent = self.transfer_agent.clone();
        let thread = std::thread::Builder::new()
            .name("webhdfs-upload".into())
            .spawn(move || upload(&agent, &location, rx))
            .map_err(|e| WebHdfsError::Other(Box::new(e)))?;

        Ok(FileWriter {
            tx: Some(tx),
            thread: Some(thread),
        })
    }
}

/// Drive the PUT to the data node, pulling chunks off the channel.
fn upload(
    agent: &ureq::Agent,
    location: &str,
    rx: mpsc::Receiver<Vec<u8>>,
) -> Result<(), WebHdfsError> {
    let mut reader = ChannelReader {
        rx,
        chunk: Vec::new(),
        pos: 0,
    };
    let request = http::Request::builder()
        .method(Method::PUT)
        .uri(location)
        .header(http::header::CONTENT_TYPE, "application/octet-stream")
        .body(ureq::SendBody::from_reader(&mut reader))
        .map_err(|e| WebHdfsError::Other(Box::new(e)))?;
    let response = agent.run(request).map_err(WebHdfsError::from_ureq)?;
    Client::expect_ok(response)
}

/// Adapts the upload channel into `std::io::Read` for the request body.
struct ChannelReader {
    rx: mpsc::Receiver<Vec<u8>>,
    chunk: Vec<u8>,
    pos: usize,
}

impl std::io::Read for ChannelReader {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        while self.pos >= self.chunk.len() {
            match self.rx.recv() {
                Ok(chunk) => {
                    self.chunk = chunk;
                    self.pos = 0;
                }
                // Sender dropped: the upload body is complete.
                Err(_) => return Ok(0),
            }
        }
        let n = buf.len().min(self.chunk.len() - self.pos);
        buf[..n].copy_from_slice(&self.chunk[self.pos..self.pos + n]);
        self.pos += n;
        Ok(n)
    }
}

/// A positional read stream over one remote file.
///
/// Reading is sequential over one HTTP body; `seek` simply drops the body
/// and remembers the offset, and the next `read` reconnects there.
pub struct FileReader {
    client: Client,
    path: String,
    offset: u64,
    body: Option<Box<dyn std::io::Read + Send>>,
}

impl FileReader {
    fn connect(&mut self) -> Result<(), WebHdfsError> {
        let url = self.client.url(
            &self.path,
            "OPEN",
            &[("offset", self.offset.to_string())],
        );
        let response = self
            .client
            .run(&self.client.transfer_agent, Method::GET, &url)?;
        let location = Client::redirect_location(response)?;
        let data_response =
            self.client
                .run(&self.client.transfer_agent, Method::GET, &location)?;
        let (parts, body) = data_response.into_parts();
        if !parts.status.is_success() {
            let mut bytes = Vec::new();
            body.into_reader()
                .read_to_end(&mut bytes)
                .map_err(|e| WebHdfsError::Connection(e.to_string()))?;
            return Err(Client::error_from_body(parts.status, &bytes));
        }
        self.body = Some(Box::new(body.into_reader()));
        Ok(())
    }

    /// Read at the current offset, reconnecting if needed. `Ok(0)` is end
    /// of file.
    pub fn read(&mut self, buf: &mut [u8]) -> Result<usize, WebHdfsError> {
        if self.body.is_none() {
            self.connect()?;
        }
        let body = self.body.as_mut().expect("connected above");
        let n = body
            .read(buf)
            .map_err(|e| WebHdfsError::Connection(e.to_string()))?;
        self.offset += n as u64;
        Ok(n)
    }

    /// Reposition the stream. No backend traffic until the next `read`.
    pub fn seek(&mut self, pos: u64) {
        if pos != self.offset {
            self.body = None;
            self.offset = pos;
        }
    }

    /// The current absolute offset.
    #[must_use]
    pub fn position(&self) -> u64 {
        self.offset
    }

    /// Drop the connection.
    pub fn close(&mut self) {
        self.body = None;
    }
}

/// A write stream produced by [`Client::create`].
pub struct FileWriter {
    tx: Option<mpsc::SyncSender<Vec<u8>>>,
    thread: Option<std::thread::JoinHandle<Result<(), WebHdfsError>>>,
}

impl FileWriter {
    /// Queue `buf` for upload. Blocks when the data node falls behind.
    pub fn write(&mut self, buf: &[u8]) -> Result<usize, WebHdfsError> {
        let Some(tx) = self.tx.as_ref() else {
            return Err(WebHdfsError::Connection("writer already closed".to_owned()));
        };
        if tx.send(buf.to_vec()).is_err() {
            // The upload thread bailed; close() surfaces its error.
            return Err(self
                .finish()
                .err()
                .unwrap_or_else(|| WebHdfsError::Connection("upload aborted".to_owned())));
        }
        Ok(buf.len())
    }

    /// Finish the upload and surface the data node's verdict.
    pub fn close(&mut self) -> Result<(), WebHdfsError> {
        self.finish()
    }

    fn finish(&mut self) -> Result<(), WebHdfsError> {
        // Dropping the sender terminates the request body.
        self.tx = None;
        match self.thread.take() {
            Some(handle) => handle
                .join()
                .map_err(|_| WebHdfsError::Connection("upload thread panicked".to_owned()))?,
            None => Ok(()),
        }
    }
}

impl Drop for FileWriter {
    fn drop(&mut self) {
        let _ = self.finish();
    }
}
