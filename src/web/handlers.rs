// API handlers for the web server

use super::{
    AppState,
    error::ApiError,
    extract_request_data::extract_upload,
    models::HealthResponse,
};
use crate::temp_storage::{recover_utf8, sanitize_file_name};
use axum::{
    Json,
    extract::{Request, State},
    http::{HeaderValue, header},
    response::{IntoResponse, Response},
};
use std::time::Instant;
use tracing::{debug, info};
use uuid::Uuid;

// --- GET /api/health ---
pub async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
    })
}

// --- POST /api/remove-background ---
// Multipart fields: `image` (required) and `outputFormat` (optional).
pub async fn remove_background(
    State(state): State<AppState>,
    request: Request,
) -> Result<Response, ApiError> {
    let request_id = Uuid::new_v4();

    let upload = extract_upload(request, &state.policy)
        .await
        .inspect_err(|e| debug!("Rejected upload, request_id={}: {:?}", request_id, e))?;
    info!(
        "Remove background request: request_id={}, file={:?}, type={}, size={}",
        request_id,
        upload.file_name,
        upload.content_type,
        upload.data.len()
    );

    let asset = state
        .storage
        .store(&upload.file_name, &upload.data)
        .await
        .map_err(|e| {
            ApiError::internal(
                "Failed to store the uploaded image.",
                &e,
                state.verbose_errors,
            )
        })?;
    debug!("request_id={} persisted as {}", request_id, asset.file_name());

    let output = state.negotiator.resolve(upload.output_format.as_deref());

    // The asset is released whatever the outcome; dropping it would do the same if
    // this future is cancelled while the removal is running.
    let started = Instant::now();
    let result = state.remover.remove(asset.path(), &output).await;
    asset.release().await;

    let data = result.map_err(|e| {
        ApiError::internal(
            "Failed to remove the background from the image.",
            &e,
            state.verbose_errors,
        )
    })?;

    info!(
        "Background removed: request_id={}, output={}, size={}, elapsed={:?}",
        request_id,
        output.mime(),
        data.len(),
        started.elapsed()
    );

    let disposition = HeaderValue::from_str(&format!(
        "inline; filename=\"{}\"",
        download_name(&upload.file_name, output.format.extension())
    ))
    .unwrap_or_else(|_| HeaderValue::from_static("inline"));

    Ok((
        [
            (header::CONTENT_TYPE, HeaderValue::from_static(output.mime())),
            (header::CONTENT_DISPOSITION, disposition),
        ],
        data,
    )
        .into_response())
}

/// `<stem>_no_bg.<ext>`, restricted to ASCII so it fits in a quoted header parameter.
fn download_name(original: &str, extension: &str) -> String {
    let sanitized = sanitize_file_name(&recover_utf8(original));
    let stem = match sanitized.rsplit_once('.') {
        Some((stem, _)) if !stem.is_empty() => stem,
        _ => sanitized.as_str(),
    };
    let stem: String = stem
        .chars()
        .map(|c| if c.is_ascii() { c } else { '_' })
        .collect();
    format!("{}_no_bg.{}", stem, extension)
}

#[cfg(test)]
mod tests {
    use super::super::{UploadPolicy, create_app, models::ErrorBody};
    use super::*;
    use crate::format::FormatNegotiator;
    use crate::remover::testing::{FailingRemover, StaticRemover};
    use crate::remover::{BackgroundRemover, RemovalAdapter};
    use crate::temp_storage::TempStorage;
    use axum::{Router, body::Body, http, http::StatusCode};
    use http_body_util::BodyExt;
    use std::io::Cursor;
    use std::path::Path;
    use std::sync::Arc;
    use std::sync::atomic::Ordering;
    use std::time::Duration;
    use tower::ServiceExt;

    const BOUNDARY: &str = "cutout-test-boundary";
    const PROCESSED: &[u8] = b"processed-image-bytes";

    fn encode(format: image::ImageFormat) -> Vec<u8> {
        let img = image::RgbImage::from_pixel(8, 8, image::Rgb([200, 40, 40]));
        let mut buffer = Cursor::new(Vec::new());
        img.write_to(&mut buffer, format).unwrap();
        buffer.into_inner()
    }

    #[derive(Default)]
    struct Form {
        body: Vec<u8>,
    }

    impl Form {
        fn file(mut self, field: &str, file_name: &str, content_type: &str, data: &[u8]) -> Self {
            self.body.extend_from_slice(
                format!(
                    "--{}\r\nContent-Disposition: form-data; name=\"{}\"; filename=\"{}\"\r\nContent-Type: {}\r\n\r\n",
                    BOUNDARY, field, file_name, content_type
                )
                .as_bytes(),
            );
            self.body.extend_from_slice(data);
            self.body.extend_from_slice(b"\r\n");
            self
        }

        fn text(mut self, field: &str, value: &str) -> Self {
            self.body.extend_from_slice(
                format!(
                    "--{}\r\nContent-Disposition: form-data; name=\"{}\"\r\n\r\n{}\r\n",
                    BOUNDARY, field, value
                )
                .as_bytes(),
            );
            self
        }

        fn into_request(mut self, with_length: bool) -> Request {
            self.body
                .extend_from_slice(format!("--{}--\r\n", BOUNDARY).as_bytes());
            let mut builder = http::Request::builder()
                .method("POST")
                .uri("/api/remove-background")
                .header(
                    header::CONTENT_TYPE,
                    format!("multipart/form-data; boundary={}", BOUNDARY),
                );
            if with_length {
                builder = builder.header(header::CONTENT_LENGTH, self.body.len());
            }
            builder.body(Body::from(self.body)).unwrap()
        }
    }

    struct TestServer {
        app: Router,
        upload_dir: tempfile::TempDir,
    }

    impl TestServer {
        async fn new(remover: Arc<dyn BackgroundRemover>, policy: UploadPolicy, verbose: bool) -> Self {
            let upload_dir = tempfile::tempdir().unwrap();
            let storage = TempStorage::open(upload_dir.path()).await.unwrap();
            let state = AppState {
                policy: Arc::new(policy),
                storage,
                negotiator: FormatNegotiator::default(),
                remover: RemovalAdapter::new(remover, 2, Duration::from_secs(5)),
                verbose_errors: verbose,
            };
            Self {
                app: create_app(state, None),
                upload_dir,
            }
        }

        async fn send(&self, request: Request) -> (StatusCode, Option<String>, Vec<u8>) {
            let response = self.app.clone().oneshot(request).await.unwrap();
            let status = response.status();
            let content_type = response
                .headers()
                .get(header::CONTENT_TYPE)
                .map(|v| v.to_str().unwrap().to_string());
            let body = response.into_body().collect().await.unwrap().to_bytes();
            (status, content_type, body.to_vec())
        }

        fn leftover_files(&self) -> usize {
            count_files(self.upload_dir.path())
        }
    }

    fn count_files(dir: &Path) -> usize {
        std::fs::read_dir(dir).unwrap().count()
    }

    fn error_body(body: &[u8]) -> ErrorBody {
        serde_json::from_slice(body).unwrap()
    }

    #[tokio::test]
    async fn test_jpeg_to_webp() {
        let remover = Arc::new(StaticRemover::new(PROCESSED));
        let server = TestServer::new(remover.clone(), UploadPolicy::default(), false).await;

        let request = Form::default()
            .file("image", "cat.jpg", "image/jpeg", &encode(image::ImageFormat::Jpeg))
            .text("outputFormat", "webp")
            .into_request(true);
        let response = server.app.clone().oneshot(request).await.unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[header::CONTENT_TYPE], "image/webp");
        assert_eq!(
            response.headers()[header::CONTENT_DISPOSITION],
            "inline; filename=\"cat_no_bg.webp\""
        );
        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&body[..], PROCESSED);
        assert_eq!(remover.calls.load(Ordering::SeqCst), 1);
        assert_eq!(server.leftover_files(), 0);
    }

    #[tokio::test]
    async fn test_default_output_is_png() {
        let server = TestServer::new(
            Arc::new(StaticRemover::new(PROCESSED)),
            UploadPolicy::default(),
            false,
        )
        .await;

        let request = Form::default()
            .text("outputFormat", "tiff")
            .file("image", "dog.png", "image/png", &encode(image::ImageFormat::Png))
            .into_request(false);
        let (status, content_type, body) = server.send(request).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(content_type.as_deref(), Some("image/png"));
        assert_eq!(body, PROCESSED);
        assert_eq!(server.leftover_files(), 0);
    }

    #[tokio::test]
    async fn test_oversized_declared_length_is_rejected() {
        let remover = Arc::new(StaticRemover::new(PROCESSED));
        let server = TestServer::new(remover.clone(), UploadPolicy::default(), false).await;

        let mut big = encode(image::ImageFormat::Png);
        big.resize(10 * 1024 * 1024, 0);
        let request = Form::default()
            .file("image", "huge.png", "image/png", &big)
            .into_request(true);
        let (status, content_type, body) = server.send(request).await;

        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(content_type.as_deref(), Some("application/json"));
        assert!(error_body(&body).error.contains("maximum file size"));
        assert_eq!(remover.calls.load(Ordering::SeqCst), 0);
        assert_eq!(server.leftover_files(), 0);
    }

    #[tokio::test]
    async fn test_oversized_stream_is_rejected() {
        let remover = Arc::new(StaticRemover::new(PROCESSED));
        let policy = UploadPolicy {
            max_file_size: 1024,
            ..UploadPolicy::default()
        };
        let server = TestServer::new(remover.clone(), policy, false).await;

        let mut big = encode(image::ImageFormat::Png);
        big.resize(4096, 0);
        let request = Form::default()
            .file("image", "big.png", "image/png", &big)
            .into_request(false);
        let (status, _, body) = server.send(request).await;

        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(error_body(&body).error.contains("1.0 KiB"));
        assert_eq!(remover.calls.load(Ordering::SeqCst), 0);
        assert_eq!(server.leftover_files(), 0);
    }

    #[tokio::test]
    async fn test_disallowed_type_is_rejected() {
        let remover = Arc::new(StaticRemover::new(PROCESSED));
        let server = TestServer::new(remover.clone(), UploadPolicy::default(), false).await;

        let request = Form::default()
            .file("image", "anim.gif", "image/gif", b"GIF89a....")
            .into_request(true);
        let (status, _, body) = server.send(request).await;

        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(error_body(&body).error.contains("image/gif"));
        assert_eq!(remover.calls.load(Ordering::SeqCst), 0);
        assert_eq!(server.leftover_files(), 0);
    }

    #[tokio::test]
    async fn test_mislabeled_content_is_rejected() {
        let server = TestServer::new(
            Arc::new(StaticRemover::new(PROCESSED)),
            UploadPolicy::default(),
            false,
        )
        .await;

        let request = Form::default()
            .file("image", "fake.png", "image/png", &encode(image::ImageFormat::Jpeg))
            .into_request(true);
        let (status, _, body) = server.send(request).await;

        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(error_body(&body).error.contains("not a valid image/png"));
        assert_eq!(server.leftover_files(), 0);
    }

    #[tokio::test]
    async fn test_missing_and_empty_image() {
        let server = TestServer::new(
            Arc::new(StaticRemover::new(PROCESSED)),
            UploadPolicy::default(),
            false,
        )
        .await;

        let request = Form::default()
            .text("outputFormat", "png")
            .into_request(true);
        let (status, _, body) = server.send(request).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(error_body(&body).error.contains("No image"));

        let request = Form::default()
            .file("image", "empty.png", "image/png", b"")
            .into_request(true);
        let (status, _, body) = server.send(request).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(error_body(&body).error.contains("empty"));
        assert_eq!(server.leftover_files(), 0);
    }

    #[tokio::test]
    async fn test_second_image_field_is_rejected() {
        let remover = Arc::new(StaticRemover::new(PROCESSED));
        let server = TestServer::new(remover.clone(), UploadPolicy::default(), false).await;

        let png = encode(image::ImageFormat::Png);
        let request = Form::default()
            .file("image", "a.png", "image/png", &png)
            .file("image", "b.png", "image/png", &png)
            .into_request(true);
        let (status, _, _) = server.send(request).await;

        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(remover.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_non_multipart_request_is_rejected() {
        let server = TestServer::new(
            Arc::new(StaticRemover::new(PROCESSED)),
            UploadPolicy::default(),
            false,
        )
        .await;

        let request = http::Request::builder()
            .method("POST")
            .uri("/api/remove-background")
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from("{}"))
            .unwrap();
        let (status, content_type, body) = server.send(request).await;

        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(content_type.as_deref(), Some("application/json"));
        assert!(error_body(&body).error.contains("multipart/form-data"));
    }

    #[tokio::test]
    async fn test_removal_failure_returns_json_and_cleans_up() {
        let server = TestServer::new(Arc::new(FailingRemover), UploadPolicy::default(), false).await;

        let request = Form::default()
            .file("image", "cat.png", "image/png", &encode(image::ImageFormat::Png))
            .into_request(true);
        let (status, content_type, body) = server.send(request).await;

        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(content_type.as_deref(), Some("application/json"));
        let error = error_body(&body);
        assert_eq!(error.error, "Failed to remove the background from the image.");
        assert!(error.details.is_none());
        assert_eq!(server.leftover_files(), 0);
    }

    #[tokio::test]
    async fn test_storage_failure_returns_json_without_calling_remover() {
        let remover = Arc::new(StaticRemover::new(PROCESSED));
        let server = TestServer::new(remover.clone(), UploadPolicy::default(), false).await;
        std::fs::remove_dir(server.upload_dir.path()).unwrap();

        let request = Form::default()
            .file("image", "cat.png", "image/png", &encode(image::ImageFormat::Png))
            .into_request(true);
        let (status, content_type, body) = server.send(request).await;

        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(content_type.as_deref(), Some("application/json"));
        let error = error_body(&body);
        assert_eq!(error.error, "Failed to store the uploaded image.");
        assert!(error.details.is_none());
        assert_eq!(remover.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_long_multibyte_file_name_is_accepted() {
        let remover = Arc::new(StaticRemover::new(PROCESSED));
        let server = TestServer::new(remover.clone(), UploadPolicy::default(), false).await;

        let name = format!("{}.png", "写".repeat(100));
        let request = Form::default()
            .file("image", &name, "image/png", &encode(image::ImageFormat::Png))
            .into_request(true);
        let (status, content_type, body) = server.send(request).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(content_type.as_deref(), Some("image/png"));
        assert_eq!(body, PROCESSED);
        assert_eq!(remover.calls.load(Ordering::SeqCst), 1);
        assert_eq!(server.leftover_files(), 0);
    }

    #[tokio::test]
    async fn test_verbose_errors_include_details() {
        let server = TestServer::new(Arc::new(FailingRemover), UploadPolicy::default(), true).await;

        let request = Form::default()
            .file("image", "cat.png", "image/png", &encode(image::ImageFormat::Png))
            .into_request(true);
        let (status, _, body) = server.send(request).await;

        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        let details = error_body(&body).details.unwrap();
        assert!(details.contains("model inference crashed"));
        assert_eq!(server.leftover_files(), 0);
    }

    #[tokio::test]
    async fn test_health() {
        let server = TestServer::new(
            Arc::new(StaticRemover::new(PROCESSED)),
            UploadPolicy::default(),
            false,
        )
        .await;

        let request = http::Request::builder()
            .uri("/api/health")
            .body(Body::empty())
            .unwrap();
        let (status, _, body) = server.send(request).await;

        assert_eq!(status, StatusCode::OK);
        let health: HealthResponse = serde_json::from_slice(&body).unwrap();
        assert_eq!(health.status, "ok");
    }

    #[test]
    fn test_download_name() {
        assert_eq!(download_name("cat.jpg", "png"), "cat_no_bg.png");
        assert_eq!(download_name("my photo.final.jpeg", "webp"), "my_photo.final_no_bg.webp");
        assert_eq!(download_name("café.png", "png"), "caf__no_bg.png");
        // "café" after a Latin-1 round trip is recovered first.
        assert_eq!(download_name("cafÃ©.png", "png"), "caf__no_bg.png");
        assert_eq!(download_name(".hidden", "jpg"), ".hidden_no_bg.jpg");
        assert_eq!(download_name("", "png"), "upload_no_bg.png");
    }
}
