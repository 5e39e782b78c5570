// HTTP surface: the upload endpoint, health check, and static SPA hosting.

mod app;
mod error;
mod extract_request_data;
mod handlers;
mod listeners;
mod models;

pub use app::create_app;
pub use listeners::create_listener;

use crate::format::FormatNegotiator;
use crate::remover::RemovalAdapter;
use crate::temp_storage::TempStorage;
use std::sync::Arc;

/// Default ceiling for a single uploaded image (3 MiB).
pub const DEFAULT_MAX_FILE_SIZE: usize = 3 * 1024 * 1024;

/// Room left in the request body for multipart framing and the other form fields.
const MULTIPART_OVERHEAD_BYTES: usize = 1024 * 1024;

/// Which uploads the endpoint accepts.
#[derive(Debug, Clone)]
pub struct UploadPolicy {
    pub allowed_types: Vec<mime::Mime>,
    pub max_file_size: usize,
}

#[cfg(test)]
impl Default for UploadPolicy {
    fn default() -> Self {
        Self {
            allowed_types: vec![
                mime::IMAGE_JPEG,
                mime::IMAGE_PNG,
                "image/webp".parse().expect("static MIME type"),
            ],
            max_file_size: DEFAULT_MAX_FILE_SIZE,
        }
    }
}

impl UploadPolicy {
    pub fn allows(&self, content_type: &mime::Mime) -> bool {
        self.allowed_types
            .iter()
            .any(|allowed| allowed.essence_str() == content_type.essence_str())
    }

    /// Hard limit on the whole request body.
    pub fn body_limit(&self) -> usize {
        self.max_file_size
            .saturating_mul(2)
            .saturating_add(MULTIPART_OVERHEAD_BYTES)
    }
}

#[derive(Clone)]
pub struct AppState {
    pub policy: Arc<UploadPolicy>,
    pub storage: TempStorage,
    pub negotiator: FormatNegotiator,
    pub remover: RemovalAdapter,
    /// Include internal error details in 500 responses.
    pub verbose_errors: bool,
}
