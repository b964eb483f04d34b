//! JSON-lines telemetry input
//!
//! One `PointValue` object per line. Blank lines are ignored; lines that do
//! not parse are logged and skipped.

use edge_rules::{PointValue, TelemetryHandler};
use futures::StreamExt;
use tokio::io::AsyncRead;
use tokio_util::codec::{FramedRead, LinesCodec};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

const MAX_LINE_LENGTH: usize = 64 * 1024;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct IngestStats {
    pub accepted: u64,
    pub rejected: u64,
}

/// Feed every value read from `reader` to `handler` until EOF or shutdown
///
/// `observe` sees each accepted value before it is dispatched.
pub async fn ingest<R, F>(
    reader: R,
    handler: &dyn TelemetryHandler,
    mut observe: F,
    shutdown: CancellationToken,
) -> IngestStats
where
    R: AsyncRead + Unpin,
    F: FnMut(&PointValue),
{
    let mut lines = FramedRead::new(reader, LinesCodec::new_with_max_length(MAX_LINE_LENGTH));
    let mut stats = IngestStats::default();

    loop {
        let next = tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            next = lines.next() => next,
        };

        let line = match next {
            Some(Ok(line)) => line,
            Some(Err(e)) => {
                warn!(error = %e, "Failed to read telemetry line");
                stats.rejected += 1;
                continue;
            },
            None => break,
        };

        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        match serde_json::from_str::<PointValue>(line) {
            Ok(value) => {
                observe(&value);
                handler.on_value(value);
                stats.accepted += 1;
            },
            Err(e) => {
                warn!(error = %e, "Invalid telemetry line");
                stats.rejected += 1;
            },
        }
    }

    debug!(accepted = stats.accepted, rejected = stats.rejected, "Telemetry input closed");
    stats
}
