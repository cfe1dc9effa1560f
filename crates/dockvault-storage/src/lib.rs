pub mod cloud;
pub mod hash;
pub mod rclone;

use anyhow::Result;
use dockvault_core::config::Remote;
use dockvault_core::remote::RemoteSync;

/// Build the configured remote.
pub fn remote_from_config(remote: &Remote) -> Result<Box<dyn RemoteSync>> {
    Ok(match remote {
        Remote::Rclone { alias, binary } => Box::new(rclone::RcloneRemote::new(binary, alias)),
        Remote::S3 {
            endpoint,
            bucket,
            access_key,
            secret_key,
            prefix,
            region,
        } => Box::new(cloud::S3Remote::new(cloud::S3Config {
            endpoint: endpoint.clone(),
            bucket: bucket.clone(),
            access_key: access_key.clone(),
            secret_key: secret_key.clone(),
            prefix: prefix.clone(),
            region: region.clone(),
        })?),
    })
}
