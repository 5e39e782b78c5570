// Runs an external program to remove the background of one image.
//
// Argument templates:
//   {input}       file:// URL of the uploaded image
//   {input_path}  the same image as a local path
//   {format}      requested output MIME type
//   {quality}     requested encoder quality (0.0 - 1.0)
//
// The program must write the encoded result to stdout and exit with status 0.

use super::{BackgroundRemover, RemovalError};
use crate::format::OutputSpec;
use async_trait::async_trait;
use std::process::Stdio;
use std::str::from_utf8;
use tracing::{debug, warn};
use url::Url;

pub struct CommandRemover {
    program: String,
    args: Vec<String>,
}

impl CommandRemover {
    pub fn new(program: String, args: Vec<String>) -> Self {
        Self { program, args }
    }

    fn expand_args(&self, source: &Url, output: &OutputSpec) -> Result<Vec<String>, RemovalError> {
        let input_path = source
            .to_file_path()
            .map_err(|_| RemovalError::Failed(format!("not a local file locator: {}", source)))?;
        let input_path = input_path.to_string_lossy();
        let quality = output.quality.to_string();

        Ok(self
            .args
            .iter()
            .map(|arg| {
                arg.replace("{input_path}", &input_path)
                    .replace("{input}", source.as_str())
                    .replace("{format}", output.mime())
                    .replace("{quality}", &quality)
            })
            .collect())
    }
}

#[async_trait]
impl BackgroundRemover for CommandRemover {
    async fn remove(&self, source: &Url, output: &OutputSpec) -> Result<Vec<u8>, RemovalError> {
        let args = self.expand_args(source, output)?;
        debug!("Running {} {:?}", self.program, args);

        let result = tokio::process::Command::new(&self.program)
            .args(&args)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await?;

        if result.status.success() {
            let stderr_str = from_utf8(&result.stderr).unwrap_or_default().trim();
            if !stderr_str.is_empty() {
                debug!("{} stderr: {}", self.program, stderr_str);
            }
            return Ok(result.stdout);
        }

        let stderr_str = match from_utf8(&result.stderr) {
            Ok(msg) => msg.trim(),
            Err(_) => "stderr contains invalid utf-8",
        };
        warn!(
            "{} exited with {}: {}",
            self.program, result.status, stderr_str
        );
        Err(RemovalError::Failed(if stderr_str.is_empty() {
            format!("{} exited with {}", self.program, result.status)
        } else {
            format!("{} exited with {}: {}", self.program, result.status, stderr_str)
        }))
    }
}
