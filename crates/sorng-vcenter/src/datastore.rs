//! Datastore paths and direct file access through the `/folder` endpoint.

use crate::config::VcenterConfig;
use crate::error::{VcenterError, VcenterResult};
use crate::session::SessionManager;

use log::info;
use std::fmt;
use std::path::Path;
use url::Url;

/// A `[datastore] relative/path` reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatastorePath {
    pub datastore: String,
    pub path: String,
}

impl DatastorePath {
    pub fn new(datastore: impl Into<String>, path: impl Into<String>) -> Self {
        Self { datastore: datastore.into(), path: path.into() }
    }

    pub fn parse(s: &str) -> VcenterResult<Self> {
        let rest = s
            .trim()
            .strip_prefix('[')
            .ok_or_else(|| VcenterError::parse(format!("Not a datastore path: '{s}'")))?;
        let (datastore, path) = rest
            .split_once(']')
            .ok_or_else(|| VcenterError::parse(format!("Not a datastore path: '{s}'")))?;
        Ok(Self::new(datastore, path.trim_start()))
    }

    /// Containing directory (the VM folder for a `.vmx` path).
    pub fn parent(&self) -> Self {
        let dir = match self.path.rsplit_once('/') {
            Some((dir, _)) => dir,
            None => "",
        };
        Self::new(self.datastore.clone(), dir)
    }

    pub fn join(&self, name: &str) -> Self {
        if self.path.is_empty() {
            Self::new(self.datastore.clone(), name)
        } else {
            Self::new(self.datastore.clone(), format!("{}/{name}", self.path.trim_end_matches('/')))
        }
    }
}

impl fmt::Display for DatastorePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.datastore, self.path)
    }
}

/// `host` may carry its own scheme (`http://127.0.0.1:8080`); otherwise
/// HTTPS on the configured port.
fn endpoint(config: &VcenterConfig) -> String {
    if config.host.contains("://") {
        config.host.trim_end_matches('/').to_string()
    } else {
        format!("https://{}:{}", config.host, config.port)
    }
}

/// `https://{host}:{port}/folder/{path}?dcPath={dc}&dsName={ds}`
pub fn datastore_file_url(config: &VcenterConfig, datacenter: &str, file: &DatastorePath) -> VcenterResult<String> {
    let mut url = Url::parse(&endpoint(config))
        .map_err(|e| VcenterError::config(format!("Invalid host '{}': {e}", config.host)))?;
    url.path_segments_mut()
        .map_err(|_| VcenterError::config(format!("Host '{}' cannot carry a path", config.host)))?
        .clear()
        .push("folder")
        .extend(file.path.split('/').filter(|s| !s.is_empty()));
    url.query_pairs_mut()
        .append_pair("dcPath", datacenter)
        .append_pair("dsName", &file.datastore);
    Ok(url.into())
}

/// Direct datastore file transfer for one session.
pub struct DatastoreFiles<'a> {
    session: &'a SessionManager,
}

impl<'a> DatastoreFiles<'a> {
    pub fn new(session: &'a SessionManager) -> Self {
        Self { session }
    }

    pub(crate) async fn url_for(&self, file: &DatastorePath) -> VcenterResult<String> {
        let dc = self.session.datacenter().await?;
        datastore_file_url(self.session.config(), &dc.name, file)
    }

    fn auth(&self) -> Option<(&str, &str)> {
        let cfg = self.session.config();
        Some((cfg.username.as_str(), cfg.password.as_str()))
    }

    pub async fn download(&self, file: &DatastorePath, dest: &Path) -> VcenterResult<u64> {
        self.session.validate_connection().await?;
        let url = self.url_for(file).await?;
        let headers = self.session.api().transfer_headers().await;
        let n = self
            .session
            .transport()
            .download_to_file(&url, dest, &headers)
            .await
            .map_err(|e| e.context(format!("Failed to download {file}")))?;
        info!("Downloaded {file} ({n} bytes) to {}", dest.display());
        Ok(n)
    }

    pub async fn upload(&self, src: &Path, file: &DatastorePath) -> VcenterResult<()> {
        self.session.validate_connection().await?;
        let url = self.url_for(file).await?;
        let headers = self.session.api().transfer_headers().await;
        self.session
            .transport()
            .put_file(&url, src, &headers, self.auth())
            .await
            .map_err(|e| e.context(format!("Failed to upload {}", src.display())))?;
        info!("Uploaded {} to {file}", src.display());
        Ok(())
    }

    pub async fn delete(&self, file: &DatastorePath) -> VcenterResult<()> {
        let url = self.url_for(file).await?;
        let headers = self.session.api().transfer_headers().await;
        self.session
            .transport()
            .delete(&url, &headers, self.auth())
            .await
            .map_err(|e| e.context(format!("Failed to delete {file}")))
    }
}
