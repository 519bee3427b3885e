//! Command implementations

pub mod echo;
pub mod frame;
pub mod inspect;

use std::path::Path;

use anyhow::{Context, Result};
use tokio::io::AsyncRead;

/// Open `file`, or stdin when none is given
pub(crate) async fn open_input(file: Option<&Path>) -> Result<Box<dyn AsyncRead + Unpin + Send>> {
    match file {
        Some(path) => {
            let file = tokio::fs::File::open(path)
                .await
                .with_context(|| format!("Failed to open {}", path.display()))?;
            Ok(Box::new(file))
        }
        None => Ok(Box::new(tokio::io::stdin())),
    }
}
