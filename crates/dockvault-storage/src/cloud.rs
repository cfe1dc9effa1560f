use crate::hash::sha256_file;
use anyhow::{anyhow, Context, Result};
use aws_credential_types::Credentials;
use aws_sdk_s3::config::Region;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::Client;
use dockvault_core::remote::RemoteSync;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tokio::runtime::Runtime;
use tracing::{debug, info};
use walkdir::WalkDir;

const HASH_METADATA: &str = "sha256";

#[derive(Debug, Clone)]
pub struct S3Config {
    pub endpoint: String,
    pub bucket: String,
    pub access_key: String,
    pub secret_key: String,
    pub prefix: String,
    pub region: String,
}

/// Mirrors a repository directory into an S3-compatible bucket.
///
/// Owns a single-threaded runtime; every trait call blocks on it.
pub struct S3Remote {
    runtime: Runtime,
    client: Client,
    bucket: String,
    prefix: String,
}

impl S3Remote {
    pub fn new(config: S3Config) -> Result<Self> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .context("failed to start async runtime")?;
        let client = runtime.block_on(build_client(&config));
        Ok(Self {
            runtime,
            client,
            bucket: config.bucket,
            prefix: config.prefix.trim_matches('/').to_string(),
        })
    }

    async fn remote_objects(&self) -> Result<BTreeMap<String, u64>> {
        let mut objects = BTreeMap::new();
        let mut token: Option<String> = None;
        loop {
            let page = self
                .client
                .list_objects_v2()
                .bucket(&self.bucket)
                .prefix(&self.prefix)
                .set_continuation_token(token.take())
                .send()
                .await
                .with_context(|| format!("failed to list s3://{}/{}", self.bucket, self.prefix))?;
            for object in page.contents() {
                if let Some(key) = object.key() {
                    let size = object.size().unwrap_or(0).max(0) as u64;
                    objects.insert(key.to_string(), size);
                }
            }
            match (page.is_truncated(), page.next_continuation_token()) {
                (Some(true), Some(next)) => token = Some(next.to_string()),
                _ => break,
            }
        }
        Ok(objects)
    }

    async fn remote_hash(&self, key: &str) -> Result<Option<String>> {
        let head = self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .with_context(|| format!("failed to inspect {key}"))?;
        Ok(head
            .metadata()
            .and_then(|meta| meta.get(HASH_METADATA))
            .cloned())
    }

    async fn upload_object(&self, key: &str, path: &Path, hash: &str) -> Result<()> {
        let body = ByteStream::from_path(path)
            .await
            .with_context(|| format!("failed to read file for upload: {}", path.display()))?;
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .metadata(HASH_METADATA, hash)
            .body(body)
            .send()
            .await
            .with_context(|| format!("failed to upload {key}"))?;
        Ok(())
    }

    async fn download_object(&self, key: &str, path: &Path) -> Result<()> {
        let output = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .with_context(|| format!("failed to download {key}"))?;

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        let mut file = tokio::fs::File::create(path)
            .await
            .with_context(|| format!("failed to create download file: {}", path.display()))?;
        let mut body = output.body.into_async_read();
        tokio::io::copy(&mut body, &mut file)
            .await
            .with_context(|| format!("failed to write downloaded file: {}", path.display()))?;
        file.flush()
            .await
            .with_context(|| format!("failed to flush downloaded file: {}", path.display()))?;
        Ok(())
    }

    async fn delete_object(&self, key: &str) -> Result<()> {
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .with_context(|| format!("failed to delete {key}"))?;
        Ok(())
    }

    async fn mirror(&self, local: &Path) -> Result<()> {
        let files = local_files(local)?;
        let mut remote = self.remote_objects().await?;
        let (mut uploaded, mut unchanged) = (0usize, 0usize);
        for (relative, (path, size)) in &files {
            let key = object_key(&self.prefix, relative);
            let hash = sha256_file(path)?;
            let same = match remote.remove(&key) {
                Some(remote_size) if remote_size == *size => {
                    self.remote_hash(&key).await?.as_deref() == Some(hash.as_str())
                }
                _ => false,
            };
            if same {
                unchanged += 1;
                continue;
            }
            debug!(key = %key, "uploading");
            self.upload_object(&key, path, &hash).await?;
            uploaded += 1;
        }
        // Whatever is left remotely no longer exists locally.
        for key in remote.keys() {
            debug!(key = %key, "deleting");
            self.delete_object(key).await?;
        }
        info!(
            bucket = %self.bucket,
            uploaded,
            unchanged,
            deleted = remote.len(),
            "repository mirrored"
        );
        Ok(())
    }

    async fn fetch_all(&self, staging: &Path) -> Result<()> {
        let objects = self.remote_objects().await?;
        if objects.is_empty() {
            return Err(anyhow!("nothing stored at s3://{}/{}", self.bucket, self.prefix));
        }
        for key in objects.keys() {
            let relative = relative_key(&self.prefix, key);
            self.download_object(key, &staging.join(relative)).await?;
        }
        info!(objects = objects.len(), destination = %staging.display(), "repository fetched");
        Ok(())
    }
}

async fn build_client(config: &S3Config) -> Client {
    let creds = Credentials::new(
        config.access_key.clone(),
        config.secret_key.clone(),
        None,
        None,
        "dockvault",
    );
    let shared = aws_credential_types::provider::SharedCredentialsProvider::new(creds);
    let sdk_config = aws_config::from_env()
        .region(Region::new(config.region.clone()))
        .endpoint_url(config.endpoint.clone())
        .credentials_provider(shared)
        .load()
        .await;
    let s3_config = aws_sdk_s3::config::Builder::from(&sdk_config)
        .force_path_style(true)
        .build();
    Client::from_conf(s3_config)
}

impl RemoteSync for S3Remote {
    fn describe(&self) -> String {
        format!("s3://{}/{}", self.bucket, self.prefix)
    }

    fn push(&self, local: &Path) -> Result<()> {
        self.runtime.block_on(self.mirror(local))
    }

    fn list(&self) -> Result<Vec<String>> {
        let objects = self.runtime.block_on(self.remote_objects())?;
        Ok(objects
            .keys()
            .map(|key| relative_key(&self.prefix, key).to_string())
            .collect())
    }

    fn pull(&self, staging: &Path) -> Result<()> {
        self.runtime.block_on(self.fetch_all(staging))
    }
}

/// Regular files under `root`, keyed by their `/`-separated relative path.
pub fn local_files(root: &Path) -> Result<BTreeMap<String, (PathBuf, u64)>> {
    let mut files = BTreeMap::new();
    for entry in WalkDir::new(root).follow_links(false) {
        let entry = entry.with_context(|| format!("failed to walk {}", root.display()))?;
        if !entry.file_type().is_file() {
            continue;
        }
        let relative = entry
            .path()
            .strip_prefix(root)
            .with_context(|| format!("{} is outside {}", entry.path().display(), root.display()))?;
        let key = relative
            .components()
            .map(|c| c.as_os_str().to_string_lossy().into_owned())
            .collect::<Vec<_>>()
            .join("/");
        let size = entry
            .metadata()
            .with_context(|| format!("failed to stat {}", entry.path().display()))?
            .len();
        files.insert(key, (entry.path().to_path_buf(), size));
    }
    Ok(files)
}

pub fn object_key(prefix: &str, relative: &str) -> String {
    if prefix.is_empty() {
        relative.to_string()
    } else {
        format!("{prefix}/{relative}")
    }
}

pub fn relative_key<'a>(prefix: &str, key: &'a str) -> &'a str {
    if prefix.is_empty() {
        return key;
    }
    key.strip_prefix(prefix)
        .map(|rest| rest.trim_start_matches('/'))
        .unwrap_or(key)
}
