//! Single-task driver for a [`WorksheetSession`].
//!
//! The session lives inside one tokio task. Callers talk to it through a
//! cloneable [`SessionHandle`]; each call is a command with a oneshot reply
//! channel. Between commands the task performs due update checks and
//! periodic liveness pings, so at most one request is in flight at a time
//! and session state is never shared.

use std::time::Duration;

use log::{debug, info, warn};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, Interval, MissedTickBehavior};

use crate::cell::{CellKind, CellSnapshot};
use crate::clock::Clock;
use crate::events::WorksheetEvent;
use crate::introspection::{IntrospectionKey, KeyOutcome};
use crate::session::{InsertPosition, SessionError, WorksheetSession};
use crate::transport::Transport;
use crate::CellId;

type Reply<T> = oneshot::Sender<Result<T, SessionError>>;

/// Commands sent from handles to the session task.
enum SessionCommand {
    Load {
        auto_evaluate: bool,
        reply: Reply<()>,
    },
    UpdateCell {
        cell_id: CellId,
        auto_evaluate: bool,
        reply: Reply<()>,
    },
    EditInput {
        cell_id: CellId,
        input: String,
        reply: Reply<()>,
    },
    SubmitInput {
        cell_id: CellId,
        reply: Reply<()>,
    },
    Evaluate {
        cell_id: CellId,
        reply: Reply<Option<CellId>>,
    },
    EvaluateAll {
        reply: Reply<()>,
    },
    Introspect {
        cell_id: CellId,
        input: String,
        cursor: usize,
        reply: Reply<()>,
    },
    IntrospectionKey {
        cell_id: CellId,
        key: IntrospectionKey,
        cursor: usize,
        reply: Reply<KeyOutcome>,
    },
    CancelIntrospection {
        cell_id: CellId,
    },
    InsertCell {
        anchor: CellId,
        position: InsertPosition,
        kind: CellKind,
        input: String,
        reply: Reply<CellId>,
    },
    DeleteCell {
        cell_id: CellId,
        reply: Reply<bool>,
    },
    DeleteOutput {
        cell_id: CellId,
        reply: Reply<()>,
    },
    DeleteAllOutput {
        reply: Reply<bool>,
    },
    SetAllHidden {
        hidden: bool,
        reply: Reply<()>,
    },
    Interrupt {
        reply: Reply<bool>,
    },
    Restart {
        reply: Reply<()>,
    },
    Ping {
        reply: Reply<bool>,
    },
    GetCells {
        reply: oneshot::Sender<Vec<CellSnapshot>>,
    },
    Subscribe {
        reply: oneshot::Sender<mpsc::UnboundedReceiver<WorksheetEvent>>,
    },
    /// Resolves once every queued computation has finished or been halted.
    WaitIdle {
        reply: Reply<()>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

/// Handle to a running session task.
///
/// Cheap to clone; the task stops when every handle is dropped.
#[derive(Clone)]
pub struct SessionHandle {
    tx: mpsc::Sender<SessionCommand>,
}

/// Move `session` into a background task.
pub fn spawn_session<T, C>(session: WorksheetSession<T, C>) -> (SessionHandle, JoinHandle<()>)
where
    T: Transport + 'static,
    C: Clock + Clone + 'static,
{
    let (tx, rx) = mpsc::channel(32);
    let task = tokio::spawn(run_session_task(session, rx));
    (SessionHandle { tx }, task)
}

impl SessionHandle {
    async fn send<R>(
        &self,
        command: SessionCommand,
        reply_rx: oneshot::Receiver<R>,
    ) -> Result<R, SessionError> {
        self.tx
            .send(command)
            .await
            .map_err(|_| SessionError::ChannelClosed)?;
        reply_rx.await.map_err(|_| SessionError::ChannelClosed)
    }

    /// Fetch the cell list, optionally running `%auto` cells.
    pub async fn load(&self, auto_evaluate: bool) -> Result<(), SessionError> {
        let (reply, rx) = oneshot::channel();
        self.send(SessionCommand::Load { auto_evaluate, reply }, rx)
            .await?
    }

    pub async fn update_cell(
        &self,
        cell_id: CellId,
        auto_evaluate: bool,
    ) -> Result<(), SessionError> {
        let (reply, rx) = oneshot::channel();
        self.send(
            SessionCommand::UpdateCell {
                cell_id,
                auto_evaluate,
                reply,
            },
            rx,
        )
        .await?
    }

    pub async fn edit_input(&self, cell_id: CellId, input: &str) -> Result<(), SessionError> {
        let (reply, rx) = oneshot::channel();
        self.send(
            SessionCommand::EditInput {
                cell_id,
                input: input.to_string(),
                reply,
            },
            rx,
        )
        .await?
    }

    pub async fn submit_input(&self, cell_id: CellId) -> Result<(), SessionError> {
        let (reply, rx) = oneshot::channel();
        self.send(SessionCommand::SubmitInput { cell_id, reply }, rx)
            .await?
    }

    /// Submit a cell. Returns the cell that should take focus next.
    pub async fn evaluate(&self, cell_id: CellId) -> Result<Option<CellId>, SessionError> {
        let (reply, rx) = oneshot::channel();
        self.send(SessionCommand::Evaluate { cell_id, reply }, rx)
            .await?
    }

    pub async fn evaluate_all(&self) -> Result<(), SessionError> {
        let (reply, rx) = oneshot::channel();
        self.send(SessionCommand::EvaluateAll { reply }, rx).await?
    }

    pub async fn introspect(
        &self,
        cell_id: CellId,
        input: &str,
        cursor: usize,
    ) -> Result<(), SessionError> {
        let (reply, rx) = oneshot::channel();
        self.send(
            SessionCommand::Introspect {
                cell_id,
                input: input.to_string(),
                cursor,
                reply,
            },
            rx,
        )
        .await?
    }

    pub async fn introspection_key(
        &self,
        cell_id: CellId,
        key: IntrospectionKey,
        cursor: usize,
    ) -> Result<KeyOutcome, SessionError> {
        let (reply, rx) = oneshot::channel();
        self.send(
            SessionCommand::IntrospectionKey {
                cell_id,
                key,
                cursor,
                reply,
            },
            rx,
        )
        .await?
    }

    pub async fn cancel_introspection(&self, cell_id: CellId) -> Result<(), SessionError> {
        self.tx
            .send(SessionCommand::CancelIntrospection { cell_id })
            .await
            .map_err(|_| SessionError::ChannelClosed)
    }

    pub async fn insert_cell(
        &self,
        anchor: CellId,
        position: InsertPosition,
        kind: CellKind,
        input: &str,
    ) -> Result<CellId, SessionError> {
        let (reply, rx) = oneshot::channel();
        self.send(
            SessionCommand::InsertCell {
                anchor,
                position,
                kind,
                input: input.to_string(),
                reply,
            },
            rx,
        )
        .await?
    }

    pub async fn delete_cell(&self, cell_id: CellId) -> Result<bool, SessionError> {
        let (reply, rx) = oneshot::channel();
        self.send(SessionCommand::DeleteCell { cell_id, reply }, rx)
            .await?
    }

    pub async fn delete_output(&self, cell_id: CellId) -> Result<(), SessionError> {
        let (reply, rx) = oneshot::channel();
        self.send(SessionCommand::DeleteOutput { cell_id, reply }, rx)
            .await?
    }

    pub async fn delete_all_output(&self) -> Result<bool, SessionError> {
        let (reply, rx) = oneshot::channel();
        self.send(SessionCommand::DeleteAllOutput { reply }, rx)
            .await?
    }

    pub async fn hide_all(&self) -> Result<(), SessionError> {
        let (reply, rx) = oneshot::channel();
        self.send(SessionCommand::SetAllHidden { hidden: true, reply }, rx)
            .await?
    }

    pub async fn show_all(&self) -> Result<(), SessionError> {
        let (reply, rx) = oneshot::channel();
        self.send(SessionCommand::SetAllHidden { hidden: false, reply }, rx)
            .await?
    }

    pub async fn interrupt(&self) -> Result<bool, SessionError> {
        let (reply, rx) = oneshot::channel();
        self.send(SessionCommand::Interrupt { reply }, rx).await?
    }

    pub async fn restart(&self) -> Result<(), SessionError> {
        let (reply, rx) = oneshot::channel();
        self.send(SessionCommand::Restart { reply }, rx).await?
    }

    /// Ping now instead of waiting for the next interval.
    pub async fn ping(&self) -> Result<bool, SessionError> {
        let (reply, rx) = oneshot::channel();
        self.send(SessionCommand::Ping { reply }, rx).await?
    }

    pub async fn get_cells(&self) -> Result<Vec<CellSnapshot>, SessionError> {
        let (reply, rx) = oneshot::channel();
        self.send(SessionCommand::GetCells { reply }, rx).await
    }

    pub async fn subscribe(
        &self,
    ) -> Result<mpsc::UnboundedReceiver<WorksheetEvent>, SessionError> {
        let (reply, rx) = oneshot::channel();
        self.send(SessionCommand::Subscribe { reply }, rx).await
    }

    /// Stop the session task, even if other handles are still alive.
    pub async fn shutdown(&self) -> Result<(), SessionError> {
        let (reply, rx) = oneshot::channel();
        self.send(SessionCommand::Shutdown { reply }, rx).await
    }

    /// Drive update checks to completion before answering.
    pub async fn wait_idle(&self) -> Result<(), SessionError> {
        let (reply, rx) = oneshot::channel();
        self.send(SessionCommand::WaitIdle { reply }, rx).await?
    }
}

async fn next_ping(ping: &mut Option<Interval>) {
    match ping {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}

async fn run_session_task<T, C>(
    mut session: WorksheetSession<T, C>,
    mut cmd_rx: mpsc::Receiver<SessionCommand>,
) where
    T: Transport,
    C: Clock + Clone,
{
    info!("[actor] Starting");

    let ping_every = session.settings().ping_interval();
    let mut ping = (!ping_every.is_zero()).then(|| {
        let mut interval = interval_at(Instant::now() + ping_every, ping_every);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        interval
    });

    loop {
        let poll_wait: Option<Duration> = session.next_poll_in();
        let clock = session.clock().clone();
        let poll_due = async move {
            match poll_wait {
                Some(wait) => clock.sleep(wait).await,
                None => std::future::pending().await,
            }
        };

        tokio::select! {
            biased;

            cmd_opt = cmd_rx.recv() => {
                match cmd_opt {
                    Some(SessionCommand::Shutdown { reply }) => {
                        info!("[actor] Shutdown requested");
                        let _ = reply.send(());
                        break;
                    }
                    Some(cmd) => dispatch(&mut session, cmd).await,
                    None => {
                        info!("[actor] Command channel closed (handle dropped)");
                        break;
                    }
                }
            }

            _ = poll_due => {
                if let Err(e) = session.poll_once().await {
                    warn!("[actor] Update check failed: {}", e);
                }
            }

            _ = next_ping(&mut ping) => {
                match session.ping().await {
                    Ok(true) => info!("[actor] Reloaded stale worksheet"),
                    Ok(false) => {}
                    Err(e) => debug!("[actor] Ping failed: {}", e),
                }
            }
        }
    }

    info!("[actor] Stopped");
}

async fn dispatch<T, C>(session: &mut WorksheetSession<T, C>, cmd: SessionCommand)
where
    T: Transport,
    C: Clock,
{
    match cmd {
        SessionCommand::Load {
            auto_evaluate,
            reply,
        } => {
            let _ = reply.send(session.load(auto_evaluate).await);
        }
        SessionCommand::UpdateCell {
            cell_id,
            auto_evaluate,
            reply,
        } => {
            let _ = reply.send(session.update_cell(&cell_id, auto_evaluate).await);
        }
        SessionCommand::EditInput {
            cell_id,
            input,
            reply,
        } => {
            let _ = reply.send(session.edit_input(&cell_id, input));
        }
        SessionCommand::SubmitInput { cell_id, reply } => {
            let _ = reply.send(session.submit_input(&cell_id).await);
        }
        SessionCommand::Evaluate { cell_id, reply } => {
            let _ = reply.send(session.evaluate(&cell_id).await);
        }
        SessionCommand::EvaluateAll { reply } => {
            let _ = reply.send(session.evaluate_all().await);
        }
        SessionCommand::Introspect {
            cell_id,
            input,
            cursor,
            reply,
        } => {
            let _ = reply.send(session.introspect(&cell_id, &input, cursor).await);
        }
        SessionCommand::IntrospectionKey {
            cell_id,
            key,
            cursor,
            reply,
        } => {
            let _ = reply.send(session.introspection_key(&cell_id, key, cursor).await);
        }
        SessionCommand::CancelIntrospection { cell_id } => {
            session.cancel_introspection(&cell_id);
        }
        SessionCommand::InsertCell {
            anchor,
            position,
            kind,
            input,
            reply,
        } => {
            let result = session.insert_cell(&anchor, position, kind, &input).await;
            let _ = reply.send(result);
        }
        SessionCommand::DeleteCell { cell_id, reply } => {
            let _ = reply.send(session.delete_cell(&cell_id).await);
        }
        SessionCommand::DeleteOutput { cell_id, reply } => {
            let _ = reply.send(session.delete_output(&cell_id).await);
        }
        SessionCommand::DeleteAllOutput { reply } => {
            let _ = reply.send(session.delete_all_output().await);
        }
        SessionCommand::SetAllHidden { hidden, reply } => {
            let result = if hidden {
                session.hide_all().await
            } else {
                session.show_all().await
            };
            let _ = reply.send(result);
        }
        SessionCommand::Interrupt { reply } => {
            let _ = reply.send(session.interrupt().await);
        }
        SessionCommand::Restart { reply } => {
            let _ = reply.send(session.restart().await);
        }
        SessionCommand::Ping { reply } => {
            let _ = reply.send(session.ping().await);
        }
        SessionCommand::GetCells { reply } => {
            let _ = reply.send(session.snapshot());
        }
        SessionCommand::Subscribe { reply } => {
            let _ = reply.send(session.subscribe());
        }
        SessionCommand::WaitIdle { reply } => {
            let _ = reply.send(session.run_until_idle().await);
        }
        SessionCommand::Shutdown { reply } => {
            let _ = reply.send(());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Command;
    use crate::testing::{ManualClock, MockTransport};
    use crate::SyncSettings;

    fn spawn(transport: &MockTransport) -> (SessionHandle, JoinHandle<()>) {
        let session = WorksheetSession::new(
            transport.clone(),
            ManualClock::new(),
            SyncSettings::default(),
        );
        spawn_session(session)
    }

    #[tokio::test]
    async fn test_handle_round_trip() {
        let transport = MockTransport::new();
        transport.respond(
            Command::CellList,
            r#"{"state_number":3,"cell_list":[{"id":1,"input":"1+1"},{"id":2,"type":"text","input":"notes"}]}"#,
        );
        let (handle, _task) = spawn(&transport);

        handle.load(false).await.unwrap();
        let cells = handle.get_cells().await.unwrap();
        assert_eq!(cells.len(), 2);
        assert_eq!(cells[0].input, "1+1");
        assert_eq!(cells[1].kind, CellKind::Text);
    }

    #[tokio::test]
    async fn test_evaluation_is_polled_to_completion() {
        let transport = MockTransport::new();
        transport.respond(Command::CellList, r#"{"state_number":0,"cell_list":[{"id":5,"input":"2+2"}]}"#);
        transport.respond(Command::Eval, r#"{"id":5}"#);
        transport.respond(Command::CellUpdate, r#"{"id":5,"status":"w","output":""}"#);
        transport.respond(Command::CellUpdate, r#"{"id":5,"status":"d","output":"4","interrupted":"false"}"#);
        let (handle, _task) = spawn(&transport);
        let mut events = handle.subscribe().await.unwrap();

        handle.load(false).await.unwrap();
        handle.evaluate(CellId::Number(5)).await.unwrap();

        loop {
            match events.recv().await {
                Some(WorksheetEvent::CellEvaluated { cell_id }) => {
                    assert_eq!(cell_id, CellId::Number(5));
                    break;
                }
                Some(_) => continue,
                None => panic!("session task ended early"),
            }
        }
        let cells = handle.get_cells().await.unwrap();
        assert!(!cells[0].running);
        assert!(cells[0].evaluated);
    }

    #[tokio::test]
    async fn test_task_stops_when_handles_dropped() {
        let transport = MockTransport::new();
        let (handle, task) = spawn(&transport);
        let clone = handle.clone();
        drop(handle);
        drop(clone);
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_stops_task_with_live_handles() {
        let transport = MockTransport::new();
        let (handle, task) = spawn(&transport);
        let other = handle.clone();
        handle.shutdown().await.unwrap();
        task.await.unwrap();
        assert!(matches!(
            other.get_cells().await,
            Err(SessionError::ChannelClosed)
        ));
    }

    #[tokio::test]
    async fn test_closed_channel_error() {
        let transport = MockTransport::new();
        let (handle, task) = spawn(&transport);
        task.abort();
        let _ = task.await;
        assert!(matches!(
            handle.interrupt().await,
            Err(SessionError::ChannelClosed)
        ));
    }
}
