use std::io::Write;

use futures::future::BoxFuture;

use trellis_core::error::Result;
use trellis_core::traits::Surface;

/// Prints each delivery to stdout as it happens.
pub struct StdoutSurface;

impl Surface for StdoutSurface {
    fn deliver(&self, agent_id: &str, content: &str) -> BoxFuture<'_, Result<()>> {
        let line = format!("[{}] {}\n", agent_id, content);
        Box::pin(async move {
            let mut stdout = std::io::stdout().lock();
            stdout.write_all(line.as_bytes())?;
            stdout.flush()?;
            Ok(())
        })
    }
}
