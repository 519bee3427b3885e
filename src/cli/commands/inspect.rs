//! Inspect command implementation

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Args;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};

use crate::cli::DialectArg;
use crate::infra::transport::FrameReader;
use crate::protocol::Dialect;

#[derive(Args, Debug)]
pub struct InspectArgs {
    /// Message dialect of the stream
    #[arg(short, long, value_enum, default_value_t = DialectArg::Lsp)]
    pub dialect: DialectArg,

    /// Framed input (stdin when omitted)
    pub file: Option<PathBuf>,
}

pub async fn execute(args: InspectArgs) -> Result<()> {
    let input = super::open_input(args.file.as_deref()).await?;
    let mut stdout = tokio::io::stdout();
    let frames = inspect(args.dialect.into(), input, &mut stdout).await?;
    tracing::debug!(frames, "Inspect finished");
    Ok(())
}

/// Write one JSON line per envelope; returns the number of frames read.
async fn inspect<R, W>(dialect: Dialect, input: R, out: &mut W) -> Result<usize>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut frames = FrameReader::new(input);
    let mut count = 0;

    while let Some(payload) = frames
        .read_frame()
        .await
        .with_context(|| format!("Framing error after {count} frame(s)"))?
    {
        count += 1;
        for envelope in dialect.parse(&payload).envelopes {
            let mut line = serde_json::to_vec(&envelope)?;
            line.push(b'\n');
            out.write_all(&line).await?;
        }
    }
    out.flush().await?;
    Ok(count)
}
