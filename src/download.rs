//! Fetch a single url into a file of the download directory.
//!
//! Bytes are streamed into `<name>.part` and renamed to `<name>` once complete,
//! so an interrupted or failed download never leaves a file that looks finished.

use std::future::Future;
use std::path::{Path, PathBuf};

use reqwest::{Client, IntoUrl};
use thiserror::Error;
use tokio::fs::{create_dir_all, File};
use tokio::io::{AsyncWriteExt, BufWriter};

/// The extension appended to files while they are being downloaded.
pub const PART_EXTENSION: &str = "part";

#[non_exhaustive]
#[derive(Error, Debug)]
pub enum DownloadError {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Reqwest(#[from] reqwest::Error),
    #[error("There is no content to download")]
    ZeroContentLength,
    #[error("Failed to allocate file size: {0}")]
    FileAllocationFailed(std::io::Error),
}

/// The path a download of `file_path` is written to before it is complete.
pub fn part_path(file_path: &Path) -> PathBuf {
    let mut part = file_path.as_os_str().to_owned();
    part.push(".");
    part.push(PART_EXTENSION);
    part.into()
}

pub struct Downloader {
    client: Client,
    download_dir: PathBuf,
}

impl Downloader {
    pub fn session(client: Client, download_dir: impl Into<PathBuf>) -> Self {
        let download_dir = download_dir.into();
        Self {
            client,
            download_dir,
        }
    }

    #[inline]
    pub async fn ensure(self) -> std::io::Result<Self> {
        create_dir_all(&self.download_dir).await?;
        Ok(self)
    }

    /// Build a future downloading `url` into `file_name` of the download directory.
    ///
    /// The future owns everything it needs, so it can be spawned.
    /// An existing `file_name` is replaced only once the download succeeded.
    pub fn fetch<U>(
        &self,
        url: U,
        file_name: &str,
    ) -> impl Future<Output = Result<PathBuf, DownloadError>> + Send + 'static
    where
        U: IntoUrl + Send + 'static,
    {
        let client = self.client.clone();
        let file_path = self.download_dir.join(file_name);

        async move {
            let part_path = part_path(&file_path);
            match Self::write_part(client, url, &part_path).await {
                Ok(()) => {
                    tokio::fs::rename(&part_path, &file_path).await?;
                    Ok::<PathBuf, DownloadError>(file_path)
                }
                Err(err) => {
                    // the partial file is useless, and must not be taken for a finished one
                    let _ = tokio::fs::remove_file(&part_path).await;
                    Err(err)
                }
            }
        }
    }

    async fn write_part<U: IntoUrl>(
        client: Client,
        url: U,
        part_path: &Path,
    ) -> Result<(), DownloadError> {
        let mut response = client.get(url).send().await?.error_for_status()?;

        // pre-allocate file size
        let content_length = response.content_length();
        if content_length == Some(0) {
            return Err(DownloadError::ZeroContentLength);
        }
        let mut file_buf = BufWriter::new(File::create(part_path).await?);
        if let Some(content_length) = content_length {
            file_buf
                .get_ref()
                .set_len(content_length)
                .await
                // if disk is full, this will fail
                .map_err(DownloadError::FileAllocationFailed)?;
        }

        let mut written: u64 = 0;
        while let Some(mut chunk) = response.chunk().await? {
            written += chunk.len() as u64;
            file_buf.write_all_buf(&mut chunk).await?;
        }
        if written == 0 {
            return Err(DownloadError::ZeroContentLength);
        }

        file_buf.flush().await?;
        Ok(())
    }
}
