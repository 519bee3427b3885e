//! Frame command implementation

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Args;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};

use crate::infra::transport::write_frame;

#[derive(Args, Debug)]
pub struct FrameArgs {
    /// Newline-delimited JSON input (stdin when omitted)
    pub file: Option<PathBuf>,
}

pub async fn execute(args: FrameArgs) -> Result<()> {
    let input = super::open_input(args.file.as_deref()).await?;
    let mut stdout = tokio::io::stdout();
    let written = frame_lines(input, &mut stdout).await?;
    tracing::debug!(written, "Frame finished");
    Ok(())
}

/// Frame each non-blank line as one compact JSON payload
async fn frame_lines<R, W>(input: R, out: &mut W) -> Result<usize>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut lines = BufReader::new(input).lines();
    let mut line_no = 0;
    let mut written = 0;

    while let Some(line) = lines.next_line().await? {
        line_no += 1;
        if line.trim().is_empty() {
            continue;
        }
        let value: Value = serde_json::from_str(&line)
            .with_context(|| format!("Line {line_no} is not valid JSON"))?;
        write_frame(out, serde_json::to_string(&value)?.as_bytes()).await?;
        written += 1;
    }
    out.flush().await?;
    Ok(written)
}
