//! External reshaping filter
//!
//! The raw input is piped through an executable that writes line-delimited
//! JSON to stdout. Its output is decoded like any other NDJSON input. The
//! process is awaited once its output ends; a failed exit surfaces as the
//! last item of the stream and is fatal to the run.

use crate::error::{IngestError, IngestResult};
use crate::stream::ndjson_records;
use crate::transform::RawRecord;
use futures::{Stream, StreamExt};
use std::io::ErrorKind;
use std::path::Path;
use std::process::Stdio;
use tokio::io::{AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tracing::{debug, info};

/// Spawn `program`, feed it `input`, and decode its stdout as NDJSON
pub fn filtered_records<R>(
    input: R,
    program: impl AsRef<Path>,
) -> IngestResult<impl Stream<Item = IngestResult<RawRecord>> + Send>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    let program = program.as_ref();
    let name = program.display().to_string();

    let mut child = Command::new(program)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::inherit())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| filter_error(&name, format!("failed to start: {}", e)))?;

    info!(filter = %name, pid = ?child.id(), "Started reshaping filter");

    let mut stdin = child
        .stdin
        .take()
        .ok_or_else(|| filter_error(&name, "stdin was not captured"))?;
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| filter_error(&name, "stdout was not captured"))?;

    let pump = tokio::spawn(async move {
        let mut input = input;
        let copied = tokio::io::copy(&mut input, &mut stdin).await;
        // Closing stdin lets the filter see end of input.
        drop(stdin);
        copied
    });

    let completion = futures::stream::once(finish(child, pump, name))
        .filter_map(|result| async move { result.err().map(Err::<RawRecord, _>) });

    Ok(ndjson_records(BufReader::new(stdout)).chain(completion))
}

async fn finish(
    mut child: Child,
    pump: JoinHandle<std::io::Result<u64>>,
    name: String,
) -> IngestResult<()> {
    let status = child
        .wait()
        .await
        .map_err(|e| filter_error(&name, format!("failed to wait for process: {}", e)))?;

    if !status.success() {
        return Err(filter_error(&name, format!("exited with {}", status)));
    }

    match pump.await {
        Ok(Ok(bytes)) => {
            debug!(filter = %name, bytes, "Reshaping filter finished");
            Ok(())
        },
        // The filter may legitimately stop reading before the input ends.
        Ok(Err(e)) if e.kind() == ErrorKind::BrokenPipe => Ok(()),
        Ok(Err(e)) => Err(filter_error(&name, format!("failed to write input: {}", e))),
        Err(e) => Err(filter_error(&name, format!("input pump did not complete: {}", e))),
    }
}

fn filter_error(program: &str, message: impl Into<String>) -> IngestError {
    IngestError::Filter {
        program: program.to_string(),
        message: message.into(),
    }
}
