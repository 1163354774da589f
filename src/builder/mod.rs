//! Container image builders
//!
//! Builders turn a prepared build context into a tagged image. The
//! orchestrator only sees the [`ImageBuilder`] trait; the CLI backends for
//! Docker and Podman live in [`cli`].

pub mod cli;

pub use cli::{BuilderKind, CliBuilder};

use crate::error::UvImageResult;
use crate::spec::{Platform, SecretMount};
use async_trait::async_trait;
use std::path::PathBuf;

/// Everything a builder needs for one image build
#[derive(Debug, Clone)]
pub struct BuildRequest {
    /// Build context directory
    pub context_dir: PathBuf,
    /// Dockerfile path (inside the context)
    pub dockerfile: PathBuf,
    /// Full image reference to tag (`repo:tag`)
    pub image: String,
    pub platform: Platform,
    /// Secrets forwarded from the caller's environment
    pub secrets: Vec<SecretMount>,
}

/// Abstract container image builder
#[async_trait]
pub trait ImageBuilder: Send + Sync {
    /// Builder name and version (`docker 27.0.1`); part of the fingerprint
    async fn version(&self) -> UvImageResult<String>;

    /// Build (and optionally push) an image, streaming output lines to `on_output`
    async fn build(
        &self,
        request: &BuildRequest,
        on_output: &(dyn Fn(String) + Send + Sync),
    ) -> UvImageResult<()>;

    /// Get the human-readable builder name for display
    fn builder_name(&self) -> &'static str;
}

#[cfg(test)]
pub(crate) mod testing {
    //! Recording builder shared by orchestrator and pipeline tests

    use super::*;
    use crate::error::UvImageError;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;

    pub struct FakeBuilder {
        pub builds: AtomicUsize,
        pub delay: Duration,
        pub fail: bool,
        pub images: Mutex<Vec<String>>,
    }

    impl FakeBuilder {
        pub fn new() -> Self {
            Self {
                builds: AtomicUsize::new(0),
                delay: Duration::ZERO,
                fail: false,
                images: Mutex::new(Vec::new()),
            }
        }

        pub fn with_delay(mut self, delay: Duration) -> Self {
            self.delay = delay;
            self
        }

        pub fn failing(mut self) -> Self {
            self.fail = true;
            self
        }

        pub fn builds(&self) -> usize {
            self.builds.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl ImageBuilder for FakeBuilder {
        async fn version(&self) -> UvImageResult<String> {
            Ok("fake 1.0.0".to_string())
        }

        async fn build(
            &self,
            request: &BuildRequest,
            on_output: &(dyn Fn(String) + Send + Sync),
        ) -> UvImageResult<()> {
            self.builds.fetch_add(1, Ordering::SeqCst);
            on_output("STEP 1/1: FROM scratch".to_string());
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            if self.fail {
                return Err(UvImageError::BuildFailed {
                    image: request.image.clone(),
                    log: "RUN exit 1".to_string(),
                });
            }
            assert!(request.dockerfile.exists(), "context must exist during build");
            self.images.lock().unwrap().push(request.image.clone());
            Ok(())
        }

        fn builder_name(&self) -> &'static str {
            "fake"
        }
    }
}
