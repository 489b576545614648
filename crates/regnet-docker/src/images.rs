//! Local Docker image catalog.

use bollard::Docker;
use bollard::image::{CreateImageOptions, ListImagesOptions};
use futures_util::StreamExt;
use regnet_core::constants::IMAGE_REPOSITORY;
use regnet_core::topology::missing_images;
use regnet_core::{Error, Network, Result};
use tracing::{debug, info};

/// Strip the image repository prefix from a docker tag, giving the
/// `name:version` id nodes are matched against.
pub fn canonical_image_id(tag: &str) -> &str {
    tag.strip_prefix(IMAGE_REPOSITORY)
        .and_then(|rest| rest.strip_prefix('/'))
        .unwrap_or(tag)
}

/// The full docker reference for a `name:version` image id.
pub fn qualified_image(id: &str) -> String {
    format!("{IMAGE_REPOSITORY}/{id}")
}

fn docker_error(e: bollard::errors::Error) -> Error {
    Error::Docker(e.to_string())
}

/// Lists and pulls node images through the local Docker daemon.
#[derive(Debug, Clone)]
pub struct ImageCatalog {
    docker: Docker,
}

impl ImageCatalog {
    /// Connect to the local daemon.
    pub fn new() -> Result<Self> {
        let docker = Docker::connect_with_local_defaults().map_err(docker_error)?;
        Ok(Self { docker })
    }

    /// Connect through a specific socket.
    pub fn with_socket(socket_path: &str) -> Result<Self> {
        let docker = Docker::connect_with_socket(socket_path, 120, bollard::API_DEFAULT_VERSION)
            .map_err(docker_error)?;
        Ok(Self { docker })
    }

    /// Check that the daemon answers.
    pub async fn ping(&self) -> Result<()> {
        self.docker.ping().await.map_err(docker_error)?;
        Ok(())
    }

    /// Canonical ids of every tagged image present locally.
    pub async fn list_images(&self) -> Result<Vec<String>> {
        let images = self
            .docker
            .list_images(Some(ListImagesOptions::<String> {
                all: false,
                ..Default::default()
            }))
            .await
            .map_err(docker_error)?;

        let mut ids: Vec<String> = images
            .iter()
            .flat_map(|image| image.repo_tags.iter())
            .filter(|tag| tag.as_str() != "<none>:<none>")
            .map(|tag| canonical_image_id(tag).to_string())
            .collect();
        ids.sort();
        ids.dedup();
        Ok(ids)
    }

    /// Whether the image with canonical id `id` is present locally.
    pub async fn image_exists(&self, id: &str) -> Result<bool> {
        Ok(self.list_images().await?.iter().any(|image| image == id))
    }

    /// Pull the image with canonical id `id`.
    pub async fn pull_image(&self, id: &str) -> Result<()> {
        let reference = qualified_image(id);
        info!(image = %reference, "pulling image");

        let options = CreateImageOptions {
            from_image: reference.as_str(),
            ..Default::default()
        };
        let mut stream = self.docker.create_image(Some(options), None, None);
        while let Some(progress) = stream.next().await {
            let progress = progress
                .map_err(|e| Error::Docker(format!("failed to pull image {reference}: {e}")))?;
            if let Some(status) = progress.status {
                debug!(image = %reference, %status, "pull progress");
            }
        }
        Ok(())
    }

    /// Images `network` needs that are not present locally.
    pub async fn missing_for(&self, network: &Network) -> Result<Vec<String>> {
        let available = self.list_images().await?;
        Ok(missing_images(network, &available))
    }

    /// Pull whatever `network` is missing. Returns the ids that were pulled.
    pub async fn ensure_images(&self, network: &Network) -> Result<Vec<String>> {
        let missing = self.missing_for(network).await?;
        for id in &missing {
            self.pull_image(id).await?;
        }
        Ok(missing)
    }
}
