//! Artifact fetch-back from a slave's file server.

use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use uuid::Uuid;

use crate::digest::content_digest;
use crate::error::{DistbuildError, Result};

const FETCH_TIMEOUT: Duration = Duration::from_secs(300);

pub fn client() -> Result<reqwest::Client> {
    Ok(reqwest::Client::builder().timeout(FETCH_TIMEOUT).build()?)
}

/// Downloads each output from `http://<slave>/<path>` into `work_dir`,
/// checking it against the digest the slave reported. A file is only
/// moved into place once its digest matches.
pub async fn fetch_outputs(
    client: &reqwest::Client,
    slave: SocketAddr,
    work_dir: &Path,
    outputs: &[String],
    digests: &[String],
) -> Result<()> {
    if outputs.len() != digests.len() {
        return Err(DistbuildError::Internal(format!(
            "{} outputs but {} digests",
            outputs.len(),
            digests.len()
        )));
    }
    for (path, digest) in outputs.iter().zip(digests) {
        fetch_artifact(client, slave, work_dir, path, digest).await?;
    }
    Ok(())
}

/// Each path segment is percent-encoded, so `#`, `?` and `%` stay in the path.
fn artifact_url(slave: SocketAddr, path: &str) -> Result<reqwest::Url> {
    let mut url = reqwest::Url::parse(&format!("http://{}/", slave))
        .map_err(|e| DistbuildError::Internal(format!("bad slave address {}: {}", slave, e)))?;
    url.path_segments_mut()
        .map_err(|_| DistbuildError::Internal(format!("cannot build a path on {}", slave)))?
        .pop_if_empty()
        .extend(path.trim_start_matches('/').split('/'));
    Ok(url)
}

pub async fn fetch_artifact(
    client: &reqwest::Client,
    slave: SocketAddr,
    work_dir: &Path,
    path: &str,
    expected: &str,
) -> Result<()> {
    let url = artifact_url(slave, path)?;
    let response = client.get(url).send().await?;
    if !response.status().is_success() {
        return Err(DistbuildError::FetchStatus {
            path: path.to_string(),
            status: response.status().as_u16(),
        });
    }
    let body = response.bytes().await?;

    let dest = work_dir.join(path);
    let actual = content_digest(&body);
    if actual != expected {
        return Err(DistbuildError::DigestMismatch {
            path: dest,
            expected: expected.to_string(),
            actual,
        });
    }

    if let Some(parent) = dest.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let tmp = dest.with_file_name(format!(
        ".{}.{}.tmp",
        dest.file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default(),
        Uuid::new_v4()
    ));
    tokio::fs::write(&tmp, &body).await?;
    if let Err(e) = tokio::fs::rename(&tmp, &dest).await {
        let _ = tokio::fs::remove_file(&tmp).await;
        return Err(e.into());
    }

    tracing::debug!(path, bytes = body.len(), "Fetched artifact");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn artifact_url_encodes_segments() {
        let slave: SocketAddr = "127.0.0.1:18080".parse().unwrap();

        let url = artifact_url(slave, "out/a#1 ?%.o").unwrap();
        assert_eq!(url.as_str(), "http://127.0.0.1:18080/out/a%231%20%3F%25.o");

        let url = artifact_url(slave, "/abs.txt").unwrap();
        assert_eq!(url.as_str(), "http://127.0.0.1:18080/abs.txt");
    }
}
