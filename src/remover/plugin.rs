// Loads a background-removal plugin from a shared library and calls it through FFI.

use super::plugin_ffi::{self, CutoutStatus};
use super::{BackgroundRemover, RemovalError};
use crate::format::OutputSpec;
use async_trait::async_trait;
use libloading::{Library, Symbol};
use std::ffi::CString;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, trace};
use url::Url;

struct PluginLibrary {
    _lib: Library,
    path: PathBuf,
    shutdown: plugin_ffi::ShutdownFn,
    remove_background: plugin_ffi::RemoveBackgroundFn,
    free_buffer: plugin_ffi::FreeBufferFn,
}

impl Drop for PluginLibrary {
    fn drop(&mut self) {
        info!("Shutting down plugin {:?}", self.path);
        let status = unsafe { (self.shutdown)() };
        if status != plugin_ffi::CUTOUT_SUCCESS {
            debug!(
                "Plugin {:?} shutdown returned {} ({})",
                self.path,
                status,
                plugin_ffi::describe_status(status)
            );
        }
    }
}

// Function pointers stay valid while `_lib` is loaded; plugins must be thread-safe.
unsafe impl Send for PluginLibrary {}
unsafe impl Sync for PluginLibrary {}

impl PluginLibrary {
    /// Calls into the plugin. Blocking; run it off the async executor.
    fn remove_blocking(
        &self,
        source: &CString,
        mime: &CString,
        quality: f32,
    ) -> Result<Vec<u8>, RemovalError> {
        let mut out_data: *mut u8 = std::ptr::null_mut();
        let mut out_size: usize = 0;

        trace!("{:?}: Calling cutout_plugin_remove_background", self.path);
        let status: CutoutStatus = unsafe {
            (self.remove_background)(
                source.as_ptr(),
                mime.as_ptr(),
                quality,
                &mut out_data,
                &mut out_size,
            )
        };

        // Copy out and return the buffer to the plugin before looking at the status,
        // so a buffer handed back alongside an error is not leaked.
        let data = if out_data.is_null() {
            Vec::new()
        } else {
            let copied = unsafe { std::slice::from_raw_parts(out_data, out_size) }.to_vec();
            unsafe { (self.free_buffer)(out_data, out_size) };
            copied
        };

        if status != plugin_ffi::CUTOUT_SUCCESS {
            return Err(RemovalError::Plugin(format!(
                "plugin returned {} ({})",
                status,
                plugin_ffi::describe_status(status)
            )));
        }
        Ok(data)
    }
}

pub struct PluginRemover {
    library: Arc<PluginLibrary>,
}

impl PluginRemover {
    /// Loads and initializes the plugin at `path`.
    ///
    /// # Safety
    /// Loading a library runs its initialization routines; the library must implement
    /// the `cutout_plugin_*` ABI described in `plugin_ffi`.
    pub unsafe fn load(path: &Path) -> Result<Self, RemovalError> {
        unsafe {
            let lib = Library::new(path).map_err(|e| {
                RemovalError::Plugin(format!(
                    "Failed to load shared library from {:?}: {}",
                    path, e
                ))
            })?;

            macro_rules! get_symbol {
                ($lib:expr, $name:expr) => {
                    $lib.get($name).map_err(|e| {
                        RemovalError::Plugin(format!(
                            "Failed to load symbol '{}' from {:?}: {}",
                            String::from_utf8_lossy($name),
                            path,
                            e
                        ))
                    })
                };
            }

            let initialize: Symbol<plugin_ffi::InitializeFn> =
                get_symbol!(lib, b"cutout_plugin_initialize\0")?;
            let shutdown: Symbol<plugin_ffi::ShutdownFn> =
                get_symbol!(lib, b"cutout_plugin_shutdown\0")?;
            let remove_background: Symbol<plugin_ffi::RemoveBackgroundFn> =
                get_symbol!(lib, b"cutout_plugin_remove_background\0")?;
            let free_buffer: Symbol<plugin_ffi::FreeBufferFn> =
                get_symbol!(lib, b"cutout_plugin_free_buffer\0")?;

            trace!("{:?}: Calling cutout_plugin_initialize", path);
            let status = initialize();
            if status != plugin_ffi::CUTOUT_SUCCESS {
                return Err(RemovalError::Plugin(format!(
                    "Plugin at {:?} failed to initialize: {} ({})",
                    path,
                    status,
                    plugin_ffi::describe_status(status)
                )));
            }

            let shutdown = *shutdown;
            let remove_background = *remove_background;
            let free_buffer = *free_buffer;

            info!("Loaded background removal plugin from {:?}", path);
            Ok(Self {
                library: Arc::new(PluginLibrary {
                    _lib: lib,
                    path: path.to_path_buf(),
                    shutdown,
                    remove_background,
                    free_buffer,
                }),
            })
        }
    }
}

#[async_trait]
impl BackgroundRemover for PluginRemover {
    async fn remove(&self, source: &Url, output: &OutputSpec) -> Result<Vec<u8>, RemovalError> {
        let source = CString::new(source.as_str())
            .map_err(|e| RemovalError::Plugin(format!("locator contains NUL: {}", e)))?;
        let mime = CString::new(output.mime())
            .map_err(|e| RemovalError::Plugin(format!("MIME type contains NUL: {}", e)))?;
        let quality = output.quality;
        let library = self.library.clone();

        tokio::task::spawn_blocking(move || library.remove_blocking(&source, &mime, quality))
            .await
            .map_err(|e| RemovalError::Plugin(format!("plugin task failed: {}", e)))?
    }
}
