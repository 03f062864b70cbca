//! `conduit invoke`: run one invocation and print its events as JSON lines.

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::io::{AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use conduit_core::{InvocationRequest, Orchestrator, OutboundEvent};

/// Run `request` to completion. Returns the agent's exit code.
///
/// Without a prompt the agent runs interactively: each line read from stdin
/// is forwarded as a user message, and end of stdin closes the agent's input.
/// Ctrl-C cancels the invocation; the completion event is still printed.
pub async fn run_invoke(orchestrator: Orchestrator, request: InvocationRequest) -> Result<i32> {
    let interactive = request.prompt_text().is_none();
    let (tx, mut rx) = mpsc::channel(orchestrator.config().event_buffer.max(1));

    let handle = orchestrator
        .invoke(request, Arc::new(tx))
        .await
        .context("failed to start agent")?;
    let session = handle.session_id().to_string();

    if interactive {
        tokio::spawn(forward_stdin(orchestrator.clone(), session.clone()));
    }

    let mut stdout = tokio::io::stdout();
    let mut cancelled = false;
    loop {
        tokio::select! {
            event = rx.recv() => match event {
                Some(event) => write_event(&mut stdout, &event).await?,
                None => break,
            },
            Ok(()) = tokio::signal::ctrl_c(), if !cancelled => {
                cancelled = true;
                info!(session_id = %session, "interrupted; cancelling agent");
                orchestrator.cancel(&session).await;
            }
        }
    }

    let outcome = handle.wait().await.context("invocation task failed")?;
    debug!(session_id = %outcome.session_id, exit_code = outcome.exit_code, "invocation done");
    Ok(outcome.exit_code)
}

/// Write one event as a single JSON line.
pub async fn write_event<W>(out: &mut W, event: &OutboundEvent) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut line = serde_json::to_vec(event).context("failed to serialize event")?;
    line.push(b'\n');
    out.write_all(&line).await.context("failed to write event")?;
    out.flush().await.context("failed to flush event")?;
    Ok(())
}

async fn forward_stdin(orchestrator: Orchestrator, session: String) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) if line.trim().is_empty() => continue,
            Ok(Some(line)) => {
                if let Err(e) = orchestrator.send(&session, &line).await {
                    warn!(error = %e, "could not forward input to agent");
                    return;
                }
            }
            Ok(None) => break,
            Err(e) => {
                warn!(error = %e, "failed reading stdin");
                break;
            }
        }
    }
    if let Err(e) = orchestrator.close_input(&session).await {
        debug!(error = %e, "agent input already closed");
    }
}
