use axum::{
    extract::{FromRequest, Multipart, Request, multipart::MultipartError},
    http::{StatusCode, header},
};
use headers::{ContentLength, HeaderMapExt};
use tracing::debug;

use super::{UploadPolicy, error::ApiError};

const IMAGE_FIELD: &str = "image";
const OUTPUT_FORMAT_FIELD: &str = "outputFormat";
const FALLBACK_FILE_NAME: &str = "upload";

/// An upload that passed validation. Nothing has touched the disk yet.
#[derive(Debug)]
pub struct ImageUpload {
    pub file_name: String,
    pub content_type: mime::Mime,
    pub data: Vec<u8>,
    pub output_format: Option<String>,
}

/// Reads the `image` and `outputFormat` fields of a multipart upload,
/// enforcing the MIME allow-list and the size ceiling while the bytes arrive.
pub async fn extract_upload(
    request: Request,
    policy: &UploadPolicy,
) -> Result<ImageUpload, ApiError> {
    let is_multipart = request
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.starts_with("multipart/form-data"));
    if !is_multipart {
        return Err(ApiError::BadRequest(format!(
            "Expected a multipart/form-data request with an '{}' field.",
            IMAGE_FIELD
        )));
    }

    if let Some(ContentLength(length)) = request.headers().typed_get::<ContentLength>() {
        if length > policy.body_limit() as u64 {
            debug!("Rejecting request with Content-Length {}", length);
            return Err(ApiError::too_large(policy.max_file_size));
        }
    }

    let mut multipart = Multipart::from_request(request, &())
        .await
        .map_err(|e| ApiError::BadRequest(format!("Failed to process multipart request: {}", e)))?;

    let mut upload: Option<(String, mime::Mime, Vec<u8>)> = None;
    let mut output_format = None;

    while let Some(mut field) = multipart
        .next_field()
        .await
        .map_err(|e| multipart_error(e, policy))?
    {
        let name = field.name().map(str::to_string);
        match name.as_deref() {
            Some(IMAGE_FIELD) => {
                if upload.is_some() {
                    return Err(ApiError::BadRequest(format!(
                        "Only one '{}' file may be uploaded per request.",
                        IMAGE_FIELD
                    )));
                }

                let declared = field.content_type().unwrap_or("").to_string();
                let content_type = declared
                    .parse::<mime::Mime>()
                    .ok()
                    .filter(|m| policy.allows(m))
                    .ok_or_else(|| unsupported_type(&declared, policy))?;

                let file_name = field
                    .file_name()
                    .filter(|name| !name.is_empty())
                    .unwrap_or(FALLBACK_FILE_NAME)
                    .to_string();

                let mut data = Vec::new();
                while let Some(chunk) = field
                    .chunk()
                    .await
                    .map_err(|e| multipart_error(e, policy))?
                {
                    if data.len() + chunk.len() > policy.max_file_size {
                        debug!("Upload {:?} exceeds {} bytes", file_name, policy.max_file_size);
                        return Err(ApiError::too_large(policy.max_file_size));
                    }
                    data.extend_from_slice(&chunk);
                }

                if data.is_empty() {
                    return Err(ApiError::BadRequest(
                        "The uploaded image is empty.".to_string(),
                    ));
                }

                check_signature(&data, &content_type)?;
                upload = Some((file_name, content_type, data));
            }
            Some(OUTPUT_FORMAT_FIELD) => {
                let value = field
                    .text()
                    .await
                    .map_err(|e| multipart_error(e, policy))?;
                output_format = Some(value);
            }
            other => {
                debug!("Ignoring multipart field: {}", other.unwrap_or("unnamed"));
            }
        }
    }

    let (file_name, content_type, data) = upload.ok_or_else(|| {
        ApiError::BadRequest(format!(
            "No image was provided. Send it in the '{}' field.",
            IMAGE_FIELD
        ))
    })?;

    Ok(ImageUpload {
        file_name,
        content_type,
        data,
        output_format,
    })
}

fn multipart_error(err: MultipartError, policy: &UploadPolicy) -> ApiError {
    if err.status() == StatusCode::PAYLOAD_TOO_LARGE {
        return ApiError::too_large(policy.max_file_size);
    }
    ApiError::BadRequest(format!("Invalid multipart request: {}", err.body_text()))
}

fn unsupported_type(declared: &str, policy: &UploadPolicy) -> ApiError {
    let allowed = policy
        .allowed_types
        .iter()
        .map(|m| m.essence_str())
        .collect::<Vec<_>>()
        .join(", ");
    let declared = if declared.is_empty() { "none" } else { declared };
    ApiError::BadRequest(format!(
        "Unsupported file type ({}). Allowed types: {}.",
        declared, allowed
    ))
}

// The declared type comes from the client; make sure the bytes agree with it.
fn check_signature(data: &[u8], content_type: &mime::Mime) -> Result<(), ApiError> {
    let Some(expected) = image::ImageFormat::from_mime_type(content_type.essence_str()) else {
        return Ok(());
    };
    match image::guess_format(data) {
        Ok(actual) if actual == expected => Ok(()),
        _ => Err(ApiError::BadRequest(format!(
            "The file content is not a valid {} image.",
            content_type.essence_str()
        ))),
    }
}
