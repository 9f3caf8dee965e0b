use std::fs::File;
use std::path::Path;
use std::thread;
use std::time::Duration;

use reqwest::blocking::Client;
use reqwest::header::{HeaderMap, HeaderValue, USER_AGENT};
use tracing::{info, warn};

use crate::error::LdmError;

/// One GET of `url` written to `destination`, truncating whatever is there.
pub trait Transport: Send + Sync {
    fn get_to_file(&self, url: &str, destination: &Path) -> Result<u64, LdmError>;
}

#[derive(Clone)]
pub struct HttpTransport {
    client: Client,
}

impl HttpTransport {
    pub fn new() -> Result<Self, LdmError> {
        let mut headers = HeaderMap::new();
        headers.insert(
            USER_AGENT,
            HeaderValue::from_str(&format!("ldm-snapshot/{}", env!("CARGO_PKG_VERSION")))
                .map_err(|err| LdmError::Http(err.to_string()))?,
        );
        // Large archives; only bound the connect phase.
        let client = Client::builder()
            .default_headers(headers)
            .connect_timeout(Duration::from_secs(30))
            .timeout(None)
            .build()
            .map_err(|err| LdmError::Http(err.to_string()))?;
        Ok(Self { client })
    }
}

impl Transport for HttpTransport {
    fn get_to_file(&self, url: &str, destination: &Path) -> Result<u64, LdmError> {
        let mut response = self
            .client
            .get(url)
            .send()
            .map_err(|err| LdmError::Http(err.to_string()))?;
        if !response.status().is_success() {
            return Err(LdmError::HttpStatus {
                status: response.status().as_u16(),
                url: url.to_string(),
            });
        }
        let mut file =
            File::create(destination).map_err(|err| LdmError::Filesystem(err.to_string()))?;
        std::io::copy(&mut response, &mut file).map_err(|err| LdmError::Http(err.to_string()))
    }
}

/// Wraps a transport with bounded retries and `base_delay * 2^attempt`
/// backoff between attempts.
#[derive(Clone)]
pub struct RetryingDownloader<T: Transport> {
    transport: T,
    base_delay: Duration,
}

impl<T: Transport> RetryingDownloader<T> {
    pub fn new(transport: T) -> Self {
        Self {
            transport,
            base_delay: Duration::from_secs(1),
        }
    }

    pub fn with_base_delay(mut self, base_delay: Duration) -> Self {
        self.base_delay = base_delay;
        self
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn download(
        &self,
        url: &str,
        destination: &Path,
        max_attempts: u32,
        verbose: bool,
    ) -> Result<(), LdmError> {
        let max_attempts = max_attempts.max(1);
        for attempt in 1..=max_attempts {
            if verbose {
                info!(url, attempt, max_attempts, "downloading");
            }
            match self.transport.get_to_file(url, destination) {
                Ok(bytes) => {
                    if verbose {
                        info!(
                            destination = %destination.display(),
                            size_mb = %format!("{:.1}", bytes as f64 / 1_048_576.0),
                            "download complete"
                        );
                    }
                    return Ok(());
                }
                Err(err) => {
                    warn!(url, attempt, max_attempts, error = %err, "download attempt failed");
                    if attempt < max_attempts {
                        thread::sleep(backoff_delay(self.base_delay, attempt));
                    }
                }
            }
        }
        Err(LdmError::Download {
            url: url.to_string(),
            attempts: max_attempts,
        })
    }
}

pub fn backoff_delay(base: Duration, attempt: u32) -> Duration {
    base.saturating_mul(2u32.saturating_pow(attempt))
}
