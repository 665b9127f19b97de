use futures::stream::{self, Stream};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use weft_core::error::{Result, WeftError};
use weft_core::event::WorkflowEvent;
use weft_core::message::{Payload, WorkflowMessage};
use weft_core::types::{RequestId, RunId};

use crate::builder::Workflow;
use crate::checkpoint::Checkpoint;
use crate::runner::{RunOptions, RunStatus, WorkflowRunner};

enum Command {
    Respond {
        request_id: RequestId,
        payload: Payload,
        reply: oneshot::Sender<Result<()>>,
    },
    Checkpoint {
        reply: oneshot::Sender<Result<Checkpoint>>,
    },
}

/// A run driven on a background task, observed as a stream of events.
///
/// Events are delivered in emission order. The stream ends once the run
/// reaches a terminal state. A halted run waits for [`respond`] calls.
///
/// [`respond`]: StreamingRun::respond
pub struct StreamingRun {
    run_id: RunId,
    events: mpsc::Receiver<WorkflowEvent>,
    commands: mpsc::Sender<Command>,
    cancel: CancellationToken,
}

impl StreamingRun {
    /// Move a runner onto a background task.
    pub fn spawn(runner: WorkflowRunner, event_buffer: usize) -> Self {
        let (event_tx, events) = mpsc::channel(event_buffer.max(1));
        let (commands, command_rx) = mpsc::channel(16);
        let run_id = runner.run_id().clone();
        let cancel = runner.cancel_token();
        tokio::spawn(drive(runner, event_tx, command_rx));
        Self {
            run_id,
            events,
            commands,
            cancel,
        }
    }

    pub fn run_id(&self) -> &RunId {
        &self.run_id
    }

    /// Next event, or `None` once the run has finished and every event was read.
    pub async fn next_event(&mut self) -> Option<WorkflowEvent> {
        self.events.recv().await
    }

    pub fn into_stream(self) -> impl Stream<Item = WorkflowEvent> {
        stream::unfold(self, |mut run| async move {
            run.next_event().await.map(|event| (event, run))
        })
    }

    /// Read events until the run halts or finishes.
    pub async fn drain_until_idle(&mut self) -> Vec<WorkflowEvent> {
        let mut events = Vec::new();
        while let Some(event) = self.next_event().await {
            let idle = event.is_terminal();
            events.push(event);
            if idle {
                break;
            }
        }
        events
    }

    pub async fn respond(&self, request_id: &RequestId, payload: Payload) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Respond {
            request_id: request_id.clone(),
            payload,
            reply,
        })
        .await?;
        rx.await.map_err(|_| finished())?
    }

    pub async fn respond_with<T: WorkflowMessage>(&self, request_id: &RequestId, value: &T) -> Result<()> {
        self.respond(request_id, Payload::new(value)?).await
    }

    /// Snapshot the run at its current superstep boundary.
    pub async fn checkpoint(&self) -> Result<Checkpoint> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Checkpoint { reply }).await?;
        rx.await.map_err(|_| finished())?
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    async fn send(&self, command: Command) -> Result<()> {
        self.commands.send(command).await.map_err(|_| finished())
    }
}

fn finished() -> WeftError {
    WeftError::InvalidArgument("run is no longer active".into())
}

fn serve(runner: &mut WorkflowRunner, command: Command) {
    match command {
        Command::Respond {
            request_id,
            payload,
            reply,
        } => {
            let _ = reply.send(runner.respond(&request_id, payload));
        }
        Command::Checkpoint { reply } => {
            let _ = reply.send(runner.checkpoint());
        }
    }
}

async fn forward(tx: &mut Option<mpsc::Sender<WorkflowEvent>>, events: Vec<WorkflowEvent>) {
    let Some(sender) = tx.as_ref() else {
        return;
    };
    for event in events {
        if sender.send(event).await.is_err() {
            // Nobody is listening; keep driving the run anyway.
            *tx = None;
            return;
        }
    }
}

async fn drive(
    mut runner: WorkflowRunner,
    event_tx: mpsc::Sender<WorkflowEvent>,
    mut commands: mpsc::Receiver<Command>,
) {
    let cancel = runner.cancel_token();
    let mut tx = Some(event_tx);
    loop {
        while let Ok(command) = commands.try_recv() {
            serve(&mut runner, command);
        }
        match runner.status() {
            RunStatus::Created | RunStatus::Running => {
                let events = runner.step().await;
                forward(&mut tx, events).await;
            }
            RunStatus::Halted => {
                tokio::select! {
                    command = commands.recv() => match command {
                        Some(command) => serve(&mut runner, command),
                        None => break,
                    },
                    _ = cancel.cancelled() => {
                        let events = runner.step().await;
                        forward(&mut tx, events).await;
                    }
                }
            }
            RunStatus::Completed | RunStatus::Failed | RunStatus::Cancelled => {
                // Closing the event channel ends the stream; commands are
                // still answered until the handle is dropped.
                tx = None;
                match commands.recv().await {
                    Some(command) => serve(&mut runner, command),
                    None => break,
                }
            }
        }
    }
    debug!(run_id = %runner.run_id(), status = ?runner.status(), "Streaming run task finished");
}

impl Workflow {
    /// Start a run on a background task and stream its events.
    pub fn stream<T: WorkflowMessage>(&self, input: &T, options: RunOptions) -> Result<StreamingRun> {
        let buffer = options.runtime.event_buffer;
        let runner = WorkflowRunner::start(self, input, options)?;
        Ok(StreamingRun::spawn(runner, buffer))
    }

    /// Resume a checkpoint on a background task and stream its events.
    pub fn stream_from_checkpoint(&self, checkpoint: Checkpoint, options: RunOptions) -> Result<StreamingRun> {
        let buffer = options.runtime.event_buffer;
        let runner = WorkflowRunner::resume(self, checkpoint, options)?;
        Ok(StreamingRun::spawn(runner, buffer))
    }
}
