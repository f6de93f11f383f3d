use serde::{Deserialize, Serialize};
use url::Url;

use crate::config::{DEFAULT_HOST, DEFAULT_PORT};

/// Where the model server lives.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Settings {
    pub host: String,
    pub port: u16,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
        }
    }
}

impl Settings {
    /// `http://host:port`, or the host verbatim when it already names a scheme.
    pub fn base_url(&self) -> Result<Url, url::ParseError> {
        let host = self.host.trim().trim_end_matches('/');
        if host.starts_with("http://") || host.starts_with("https://") {
            let mut url = Url::parse(host)?;
            if url.port().is_none() {
                // Only fails for cannot-be-a-base URLs, which http(s) never are.
                let _ = url.set_port(Some(self.port));
            }
            Ok(url)
        } else {
            Url::parse(&format!("http://{}:{}", host, self.port))
        }
    }
}
