use std::path::{Path, PathBuf};

use futures_util::StreamExt;
use indicatif::{ProgressBar, ProgressStyle};
use reqwest::StatusCode;
use reqwest::header::RANGE;
use tokio::io::AsyncWriteExt;

use crate::error::HostkitError;

fn is_remote(source: &str) -> bool {
    source.starts_with("http://") || source.starts_with("https://")
}

/// File name a source is stored under: the last path segment.
pub fn file_name(source: &str) -> Result<String, HostkitError> {
    let name = if is_remote(source) {
        source
            .split(['?', '#'])
            .next()
            .and_then(|s| s.rsplit('/').next())
    } else {
        Path::new(source).file_name().and_then(|n| n.to_str())
    };
    name.filter(|n| !n.is_empty())
        .map(str::to_string)
        .ok_or_else(|| HostkitError::Validation {
            message: format!("cannot derive a file name from '{source}'"),
        })
}

/// Make sure `source` is present in `dest_dir` under its file name.
///
/// URLs are downloaded with resume support: a `.part` file from an
/// interrupted run is continued with a `Range` request. Anything else is a
/// local file and is copied. An existing destination is reused as is.
pub async fn ensure_present(source: &str, dest_dir: &Path) -> Result<PathBuf, HostkitError> {
    let dest = dest_dir.join(file_name(source)?);
    if dest.exists() {
        tracing::info!(path = %dest.display(), "using cached install media");
        return Ok(dest);
    }

    if is_remote(source) {
        download(source, &dest).await?;
    } else {
        let src = Path::new(source);
        if !src.is_file() {
            return Err(HostkitError::ResourceNotFound {
                what: "install media".into(),
                path: src.to_path_buf(),
            });
        }
        tokio::fs::copy(src, &dest)
            .await
            .map_err(|e| HostkitError::Io {
                context: format!("copying {} to {}", src.display(), dest.display()),
                source: e,
            })?;
        tracing::info!(from = %src.display(), to = %dest.display(), "copied install media");
    }

    Ok(dest)
}

async fn download(url: &str, dest: &Path) -> Result<(), HostkitError> {
    let part = partial_path(dest);
    let offset = tokio::fs::metadata(&part)
        .await
        .map(|m| m.len())
        .unwrap_or(0);

    let mut request = reqwest::Client::new().get(url);
    if offset > 0 {
        tracing::info!(url, offset, "resuming download");
        request = request.header(RANGE, format!("bytes={offset}-"));
    } else {
        tracing::info!(url, "downloading install media");
    }

    let response = request.send().await.map_err(|e| HostkitError::Download {
        url: url.to_string(),
        message: "request failed".into(),
        source: Some(e),
    })?;

    let append = match response.status() {
        StatusCode::PARTIAL_CONTENT => true,
        s if s.is_success() => false,
        // The partial file already holds the whole body.
        StatusCode::RANGE_NOT_SATISFIABLE if offset > 0 => {
            return finish(&part, dest).await;
        }
        s => {
            return Err(HostkitError::Download {
                url: url.to_string(),
                message: format!("HTTP {s}"),
                source: None,
            });
        }
    };

    let start = if append { offset } else { 0 };
    let total = response.content_length().map(|len| start + len).unwrap_or(0);

    let pb = ProgressBar::new(total);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} [{bar:40.cyan/blue}] {bytes}/{total_bytes} ({eta})")
            .map(|s| s.progress_chars("#>-"))
            .unwrap_or_else(|_| ProgressStyle::default_bar()),
    );
    pb.set_position(start);

    // The .part file is left behind on failure so the next run can resume.
    write_body(&part, response, append, &pb).await?;
    pb.finish_and_clear();

    finish(&part, dest).await
}

async fn write_body(
    path: &Path,
    response: reqwest::Response,
    append: bool,
    pb: &ProgressBar,
) -> Result<(), HostkitError> {
    let mut file = tokio::fs::OpenOptions::new()
        .create(true)
        .write(true)
        .append(append)
        .truncate(!append)
        .open(path)
        .await
        .map_err(|e| HostkitError::Io {
            context: format!("opening {}", path.display()),
            source: e,
        })?;

    let url = response.url().to_string();
    let mut stream = response.bytes_stream();
    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(|e| HostkitError::Download {
            url: url.clone(),
            message: "error reading response body".into(),
            source: Some(e),
        })?;
        file.write_all(&chunk).await.map_err(|e| HostkitError::Io {
            context: format!("writing {}", path.display()),
            source: e,
        })?;
        pb.inc(chunk.len() as u64);
    }

    file.flush().await.map_err(|e| HostkitError::Io {
        context: format!("flushing {}", path.display()),
        source: e,
    })
}

async fn finish(part: &Path, dest: &Path) -> Result<(), HostkitError> {
    tokio::fs::rename(part, dest)
        .await
        .map_err(|e| HostkitError::Io {
            context: format!("renaming {} to {}", part.display(), dest.display()),
            source: e,
        })?;
    tracing::info!(path = %dest.display(), "install media cached");
    Ok(())
}

fn partial_path(dest: &Path) -> PathBuf {
    let mut name = dest.file_name().unwrap_or_default().to_os_string();
    name.push(".part");
    dest.with_file_name(name)
}
