// Rust definitions for the C ABI a background-removal plugin exports.
//
//   int32_t cutout_plugin_initialize(void);
//   int32_t cutout_plugin_shutdown(void);
//   int32_t cutout_plugin_remove_background(const char *input_url,
//                                           const char *output_mime,
//                                           float quality,
//                                           uint8_t **out_data,
//                                           size_t *out_size);
//   void    cutout_plugin_free_buffer(uint8_t *data, size_t size);
//
// Strings are NUL-terminated UTF-8. A buffer returned through `out_data` is owned by
// the plugin and must be handed back to `cutout_plugin_free_buffer`.

use std::os::raw::c_char;

pub type CutoutStatus = i32;

pub const CUTOUT_SUCCESS: CutoutStatus = 0;
pub const CUTOUT_ERROR_INVALID_ARGUMENT: CutoutStatus = 1;
pub const CUTOUT_ERROR_UNREADABLE_INPUT: CutoutStatus = 2;
pub const CUTOUT_ERROR_UNSUPPORTED_IMAGE: CutoutStatus = 3;
pub const CUTOUT_ERROR_INFERENCE_FAILED: CutoutStatus = 4;
pub const CUTOUT_ERROR_ENCODE_FAILED: CutoutStatus = 5;

pub type InitializeFn = unsafe extern "C" fn() -> CutoutStatus;
pub type ShutdownFn = unsafe extern "C" fn() -> CutoutStatus;
pub type RemoveBackgroundFn = unsafe extern "C" fn(
    input_url: *const c_char,
    output_mime: *const c_char,
    quality: f32,
    out_data: *mut *mut u8,
    out_size: *mut usize,
) -> CutoutStatus;
pub type FreeBufferFn = unsafe extern "C" fn(data: *mut u8, size: usize);

pub fn describe_status(status: CutoutStatus) -> &'static str {
    match status {
        CUTOUT_SUCCESS => "success",
        CUTOUT_ERROR_INVALID_ARGUMENT => "invalid argument",
        CUTOUT_ERROR_UNREADABLE_INPUT => "input could not be read",
        CUTOUT_ERROR_UNSUPPORTED_IMAGE => "unsupported image",
        CUTOUT_ERROR_INFERENCE_FAILED => "inference failed",
        CUTOUT_ERROR_ENCODE_FAILED => "output encoding failed",
        _ => "unknown error",
    }
}
