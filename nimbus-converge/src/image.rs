//! Asynchronous image creation with background readiness polling.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, PoisonError};
use std::task::{Context, Poll};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::ConvergeConfig;
use crate::error::{ConvergeError, ProviderError, Result};
use crate::retry::RetryablePredicate;

/// Lifecycle status of a machine image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ImageStatus {
    Pending,
    Available,
    Failed,
    Deleted,
    Unrecognized,
}

impl fmt::Display for ImageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ImageStatus::Pending => "PENDING",
            ImageStatus::Available => "AVAILABLE",
            ImageStatus::Failed => "FAILED",
            ImageStatus::Deleted => "DELETED",
            ImageStatus::Unrecognized => "UNRECOGNIZED",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Image {
    pub id: String,
    pub name: String,
    pub status: ImageStatus,
    pub description: Option<String>,
}

/// Request to bake an image from an existing node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageTemplate {
    pub name: String,
    pub source_node_id: String,
    pub description: Option<String>,
}

impl ImageTemplate {
    pub fn from_node(name: impl Into<String>, source_node_id: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            source_node_id: source_node_id.into(),
            description: None,
        }
    }
}

/// Provider primitives for image baking.
#[async_trait]
pub trait ImageService: Send + Sync {
    /// Start the bake and return the provisional image id.
    async fn begin_image_creation(&self, template: &ImageTemplate) -> std::result::Result<String, ProviderError>;

    async fn describe_image(&self, id: &str) -> std::result::Result<Option<Image>, ProviderError>;

    async fn delete_image(&self, id: &str) -> std::result::Result<(), ProviderError>;
}

/// Handle to an image bake that is being polled in the background.
///
/// Await it for the finished [`Image`]. Dropping it leaves the poll running;
/// [`cancel`](Self::cancel) stops the poll but does not undo the bake.
#[derive(Debug)]
pub struct ImageCreation {
    image_id: String,
    task: JoinHandle<Result<Image>>,
}

impl ImageCreation {
    pub fn image_id(&self) -> &str {
        &self.image_id
    }

    pub fn cancel(&self) {
        debug!(image_id = %self.image_id, "Cancelling image poll");
        self.task.abort();
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

impl Future for ImageCreation {
    type Output = Result<Image>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        match Pin::new(&mut this.task).poll(cx) {
            Poll::Pending => Poll::Pending,
            Poll::Ready(Ok(result)) => Poll::Ready(result),
            Poll::Ready(Err(e)) if e.is_cancelled() => Poll::Ready(Err(ConvergeError::Cancelled(
                format!("polling for image {} was cancelled", this.image_id),
            ))),
            Poll::Ready(Err(e)) => Poll::Ready(Err(ConvergeError::Cancelled(format!(
                "polling task for image {} failed: {}",
                this.image_id, e
            )))),
        }
    }
}

/// Submits image bakes and polls them to AVAILABLE on a background task.
pub struct ImageReadyPoller<S> {
    service: Arc<S>,
    max_wait: Duration,
    period: Duration,
    max_period: Duration,
}

impl<S: ImageService + 'static> ImageReadyPoller<S> {
    pub fn new(service: Arc<S>, config: &ConvergeConfig) -> Self {
        Self {
            service,
            max_wait: config.image_max_wait(),
            period: config.image_poll_period(),
            max_period: config.image_max_poll_period(),
        }
    }

    pub fn with_max_wait(mut self, max_wait: Duration) -> Self {
        self.max_wait = max_wait;
        self
    }

    /// Fixed polling when `max_period` equals `period`.
    pub fn with_period(mut self, period: Duration, max_period: Duration) -> Self {
        self.period = period;
        self.max_period = max_period;
        self
    }

    /// Submit the bake, then poll for it in the background.
    ///
    /// A rejected submission is returned here and nothing is polled.
    pub async fn create_image(&self, template: &ImageTemplate) -> Result<ImageCreation> {
        let image_id = self
            .service
            .begin_image_creation(template)
            .await
            .map_err(|source| ConvergeError::Submission {
                operation: format!("image creation '{}' from node {}", template.name, template.source_node_id),
                source,
            })?;

        info!(
            image_id = %image_id,
            name = %template.name,
            node_id = %template.source_node_id,
            "Image creation submitted"
        );

        let retry = RetryablePredicate::new(self.max_wait, self.period).with_max_period(self.max_period);
        let task = tokio::spawn(wait_for_image(Arc::clone(&self.service), image_id.clone(), retry));

        Ok(ImageCreation { image_id, task })
    }

    /// Best-effort delete. Provider errors become `false`.
    pub async fn delete_image(&self, id: &str) -> bool {
        match self.service.delete_image(id).await {
            Ok(()) => {
                info!(image_id = %id, "Image deleted");
                true
            }
            Err(e) => {
                warn!(image_id = %id, error = %e, "Failed to delete image");
                false
            }
        }
    }
}

async fn wait_for_image<S: ImageService>(
    service: Arc<S>,
    image_id: String,
    retry: RetryablePredicate,
) -> Result<Image> {
    let latest: &Mutex<Option<Image>> = &Mutex::new(None);
    let service = service.as_ref();
    let id = image_id.as_str();

    let ready = retry
        .apply::<_, _, ConvergeError>(move || async move {
            let Some(image) = service.describe_image(id).await? else {
                return Err(ConvergeError::ResourceDisappeared {
                    id: id.to_string(),
                    target: ImageStatus::Available.to_string(),
                });
            };
            let status = image.status;
            debug!(image_id = %id, status = %status, "Polled image");
            *latest.lock().unwrap_or_else(PoisonError::into_inner) = Some(image);

            match status {
                ImageStatus::Available => Ok(true),
                ImageStatus::Failed | ImageStatus::Deleted => Err(ConvergeError::ImageFailed {
                    id: id.to_string(),
                    status,
                }),
                _ => Ok(false),
            }
        })
        .await;

    let last = latest.lock().unwrap_or_else(PoisonError::into_inner).take();
    match (ready?, last) {
        (true, Some(image)) => {
            info!(image_id = %image.id, name = %image.name, "Image available");
            Ok(image)
        }
        (_, last) => {
            let last_status = last.map(|i| i.status).unwrap_or(ImageStatus::Pending);
            warn!(
                image_id = %image_id,
                max_wait_secs = retry.timeout().as_secs(),
                status = %last_status,
                "Image not available in time"
            );
            Err(ConvergeError::ImageTimeout {
                id: image_id,
                max_wait_secs: retry.timeout().as_secs(),
                last_status,
            })
        }
    }
}
