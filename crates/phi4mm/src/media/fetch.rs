use std::path::Path;

use log::debug;

use crate::error::Phi4MmError;

/// Retrieves the raw bytes behind a request's `content_url`.
///
/// `http://` and `https://` urls are fetched with a blocking GET. `file://` urls
/// and plain paths are read from the local filesystem, unless local files are
/// disallowed.
pub struct MediaFetcher {
    client: reqwest::blocking::Client,
    allow_local_files: bool,
}

impl MediaFetcher {
    pub fn new(allow_local_files: bool) -> Result<Self, Phi4MmError> {
        let client = reqwest::blocking::Client::builder()
            .user_agent(concat!("phi4mm/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self {
            client,
            allow_local_files,
        })
    }

    pub fn fetch(&self, content_url: &str) -> Result<Vec<u8>, Phi4MmError> {
        if content_url.starts_with("http://") || content_url.starts_with("https://") {
            debug!("Fetching media from {content_url}");
            let response = self.client.get(content_url).send()?;
            let status = response.status();
            if !status.is_success() {
                return Err(Phi4MmError::HttpStatus {
                    url: content_url.to_string(),
                    status: status.as_u16(),
                });
            }
            let bytes = response.bytes()?;
            debug!("Fetched {} bytes", bytes.len());
            return Ok(bytes.to_vec());
        }

        let path = match content_url.strip_prefix("file://") {
            Some(path) => path,
            None if content_url.contains("://") => {
                return Err(Phi4MmError::UnsupportedUrl(content_url.to_string()));
            }
            None => content_url,
        };
        if !self.allow_local_files {
            return Err(Phi4MmError::UnsupportedUrl(content_url.to_string()));
        }

        Ok(std::fs::read(path)?)
    }
}

/// Lowercase file extension of the url path, ignoring any query or fragment.
pub(crate) fn url_extension(content_url: &str) -> Option<String> {
    let path = content_url
        .split(['?', '#'])
        .next()
        .unwrap_or(content_url);
    Path::new(path)
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.to_ascii_lowercase())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fetch_local_path_and_file_url() -> Result<(), Phi4MmError> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("clip.bin");
        std::fs::write(&path, [1u8, 2, 3, 4])?;

        let fetcher = MediaFetcher::new(true)?;
        let path_str = path.to_string_lossy().to_string();
        assert_eq!(fetcher.fetch(&path_str)?, vec![1, 2, 3, 4]);
        assert_eq!(fetcher.fetch(&format!("file://{path_str}"))?, vec![1, 2, 3, 4]);
        Ok(())
    }

    #[test]
    fn test_fetch_missing_file() -> Result<(), Phi4MmError> {
        let fetcher = MediaFetcher::new(true)?;
        let err = fetcher.fetch("/definitely/not/here.wav").unwrap_err();
        assert!(matches!(err, Phi4MmError::IoError(_)));
        Ok(())
    }

    #[test]
    fn test_fetch_local_files_disallowed() -> Result<(), Phi4MmError> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("clip.bin");
        std::fs::write(&path, [1u8, 2, 3, 4])?;

        let fetcher = MediaFetcher::new(false)?;
        let path_str = path.to_string_lossy().to_string();
        for url in [path_str.clone(), format!("file://{path_str}")] {
            let err = fetcher.fetch(&url).unwrap_err();
            assert!(matches!(err, Phi4MmError::UnsupportedUrl(_)));
        }
        Ok(())
    }

    #[test]
    fn test_fetch_unsupported_scheme() -> Result<(), Phi4MmError> {
        let fetcher = MediaFetcher::new(true)?;
        let err = fetcher.fetch("ftp://example.com/a.png").unwrap_err();
        assert!(matches!(err, Phi4MmError::UnsupportedUrl(_)));
        Ok(())
    }

    #[test]
    fn test_url_extension() {
        assert_eq!(
            url_extension("https://host/stopsigns/australia.JPG"),
            Some("jpg".to_string())
        );
        assert_eq!(
            url_extension("https://host/a/clip.flac?raw=true#t=2"),
            Some("flac".to_string())
        );
        assert_eq!(url_extension("https://host/audio"), None);
    }
}
