//! Byte-range access to remotely hosted raster files.
//!
//! Cloud-Optimized GeoTIFFs are read via partial-content HTTP requests so
//! no local copy of a layer is ever needed. The trait abstraction allows
//! dependency injection of local files or in-memory buffers in tests.
//!
//! Transient-network retry is an external concern of the raster hosting
//! layer; failures here propagate as-is.

use crate::error::PipelineError;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::Path;
use std::sync::Mutex;
use tracing::{debug, trace};

/// Random-access byte source for one raster file.
pub trait RangeFetch: Send + Sync {
    /// Read exactly `len` bytes starting at `start`.
    fn fetch(&self, start: u64, len: usize) -> Result<Vec<u8>, PipelineError>;

    /// Total size of the underlying object in bytes.
    fn len(&self) -> Result<u64, PipelineError>;

    fn is_empty(&self) -> Result<bool, PipelineError> {
        Ok(self.len()? == 0)
    }
}

/// HTTP range-request fetcher backed by a blocking reqwest client.
pub struct HttpRangeFetcher {
    client: reqwest::blocking::Client,
    url: String,
}

impl HttpRangeFetcher {
    pub fn new(client: reqwest::blocking::Client, url: String) -> Self {
        Self { client, url }
    }

    /// Build the shared blocking client used for all layer requests.
    pub fn build_client() -> Result<reqwest::blocking::Client, PipelineError> {
        reqwest::blocking::Client::builder()
            .timeout(std::time::Duration::from_secs(60))
            .build()
            .map_err(|e| PipelineError::Http {
                url: String::new(),
                message: format!("failed to create HTTP client: {e}"),
            })
    }

    fn http_err(&self, message: String) -> PipelineError {
        PipelineError::Http {
            url: self.url.clone(),
            message,
        }
    }
}

impl RangeFetch for HttpRangeFetcher {
    fn fetch(&self, start: u64, len: usize) -> Result<Vec<u8>, PipelineError> {
        if len == 0 {
            return Ok(Vec::new());
        }
        let end = start + len as u64 - 1;
        trace!(url = %self.url, start, len, "range request");

        let response = self
            .client
            .get(&self.url)
            .header(reqwest::header::RANGE, format!("bytes={start}-{end}"))
            .send()
            .map_err(|e| self.http_err(format!("request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            return Err(self.http_err(format!("HTTP {status}")));
        }

        let body = response
            .bytes()
            .map_err(|e| self.http_err(format!("failed to read body: {e}")))?;

        // A server that ignores Range returns the whole object with 200.
        let bytes = if status == reqwest::StatusCode::OK && body.len() as u64 > len as u64 {
            let s = start as usize;
            if s + len > body.len() {
                return Err(self.http_err("range past end of object".into()));
            }
            body[s..s + len].to_vec()
        } else {
            body.to_vec()
        };

        if bytes.len() != len {
            return Err(self.http_err(format!(
                "short range read: wanted {len} bytes, got {}",
                bytes.len()
            )));
        }
        Ok(bytes)
    }

    fn len(&self) -> Result<u64, PipelineError> {
        let response = self
            .client
            .head(&self.url)
            .send()
            .map_err(|e| self.http_err(format!("HEAD failed: {e}")))?;
        if !response.status().is_success() {
            return Err(self.http_err(format!("HEAD returned HTTP {}", response.status())));
        }
        response
            .content_length()
            .ok_or_else(|| self.http_err("no content length on HEAD response".into()))
    }
}

/// Fetcher over a local file. Used for locally staged layers and tests.
pub struct FileRangeFetcher {
    file: Mutex<File>,
    size: u64,
}

impl FileRangeFetcher {
    pub fn open(path: &Path) -> Result<Self, PipelineError> {
        let file = File::open(path)?;
        let size = file.metadata()?.len();
        debug!(path = %path.display(), size, "opened local raster");
        Ok(Self {
            file: Mutex::new(file),
            size,
        })
    }
}

impl RangeFetch for FileRangeFetcher {
    fn fetch(&self, start: u64, len: usize) -> Result<Vec<u8>, PipelineError> {
        let mut file = self.file.lock().expect("raster file lock poisoned");
        file.seek(SeekFrom::Start(start))?;
        let mut buf = vec![0u8; len];
        file.read_exact(&mut buf)?;
        Ok(buf)
    }

    fn len(&self) -> Result<u64, PipelineError> {
        Ok(self.size)
    }
}

#[cfg(test)]
pub mod tests {
    use super::*;

    /// In-memory fetcher for unit tests.
    pub struct MemoryFetcher(pub Vec<u8>);

    impl RangeFetch for MemoryFetcher {
        fn fetch(&self, start: u64, len: usize) -> Result<Vec<u8>, PipelineError> {
            let s = start as usize;
            if s + len > self.0.len() {
                return Err(PipelineError::raster("memory", "read past end"));
            }
            Ok(self.0[s..s + len].to_vec())
        }

        fn len(&self) -> Result<u64, PipelineError> {
            Ok(self.0.len() as u64)
        }
    }

    #[test]
    fn file_fetcher_reads_ranges() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bytes.bin");
        std::fs::write(&path, (0u8..100).collect::<Vec<_>>()).unwrap();

        let fetcher = FileRangeFetcher::open(&path).unwrap();
        assert_eq!(fetcher.len().unwrap(), 100);
        assert_eq!(fetcher.fetch(10, 3).unwrap(), vec![10, 11, 12]);
        assert_eq!(fetcher.fetch(97, 3).unwrap(), vec![97, 98, 99]);
        assert!(fetcher.fetch(98, 3).is_err());
    }
}
