use tokio::sync::mpsc;

use crate::database::{
    BanTarget, Database, DatabaseClient, DisconnectUpdate, ReportRow, ResultRow, StatsRow,
};
use crate::event::Event;

/// Work whose blocking latency must stay off the main loop: database
/// writes and the second phase of a lobby reset.
#[derive(Debug)]
pub enum AsyncTask {
    RecordConnection(StatsRow),
    RecordDisconnection(DisconnectUpdate),
    WriteResults(Vec<ResultRow>),
    InsertReport(ReportRow),
    RecordBan { target: BanTarget, reason: String },
    StoreHostIdCeiling(u32),
    /// Marker for the asynchronous half of a lobby reset; completion
    /// re-enters the main loop as `ResetPhaseTwoDone`.
    ResetPhaseTwo,
}

/// Completions the worker posts back onto the main event queue.
#[derive(Debug)]
pub enum TaskOutcome {
    /// A database write finished; `error` is logged, never fatal.
    Db {
        what: &'static str,
        error: Option<String>,
    },
    ResetPhaseTwoDone,
}

/// Spawns the single async worker and returns its task queue. The
/// worker owns its database handle; the main loop only ever enqueues.
pub fn spawn_worker(
    db: DatabaseClient,
    events: mpsc::UnboundedSender<Event>,
) -> mpsc::UnboundedSender<AsyncTask> {
    let (tx, mut rx) = mpsc::unbounded_channel::<AsyncTask>();

    tokio::spawn(async move {
        while let Some(task) = rx.recv().await {
            let outcome = match task {
                AsyncTask::RecordConnection(row) => TaskOutcome::Db {
                    what: "record_connection",
                    error: db.record_connection(&row).await.err().map(|e| e.to_string()),
                },
                AsyncTask::RecordDisconnection(update) => TaskOutcome::Db {
                    what: "record_disconnection",
                    error: db
                        .record_disconnection(&update)
                        .await
                        .err()
                        .map(|e| e.to_string()),
                },
                AsyncTask::WriteResults(rows) => TaskOutcome::Db {
                    what: "write_results",
                    error: db.write_results(&rows).await.err().map(|e| e.to_string()),
                },
                AsyncTask::InsertReport(row) => TaskOutcome::Db {
                    what: "insert_report",
                    error: db.insert_report(&row).await.err().map(|e| e.to_string()),
                },
                AsyncTask::RecordBan { target, reason } => TaskOutcome::Db {
                    what: "record_ban",
                    error: db
                        .add_ban(&target, &reason)
                        .await
                        .err()
                        .map(|e| e.to_string()),
                },
                AsyncTask::StoreHostIdCeiling(ceiling) => TaskOutcome::Db {
                    what: "store_host_id_ceiling",
                    error: db
                        .set_host_id_ceiling(ceiling)
                        .await
                        .err()
                        .map(|e| e.to_string()),
                },
                AsyncTask::ResetPhaseTwo => TaskOutcome::ResetPhaseTwoDone,
            };
            if events.send(Event::Task(outcome)).is_err() {
                // Main loop is gone; nothing left to report to.
                break;
            }
        }
    });

    tx
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::MockDatabase;

    #[tokio::test]
    async fn worker_runs_tasks_and_reports_back() {
        let mock = MockDatabase::new();
        let db = DatabaseClient::Mock(mock.clone());
        let (event_tx, mut event_rx) = mpsc::unbounded_channel();
        let tasks = spawn_worker(db, event_tx);

        tasks.send(AsyncTask::StoreHostIdCeiling(17)).unwrap();
        tasks.send(AsyncTask::ResetPhaseTwo).unwrap();

        match event_rx.recv().await.unwrap() {
            Event::Task(TaskOutcome::Db { what, error }) => {
                assert_eq!(what, "store_host_id_ceiling");
                assert!(error.is_none());
            }
            other => panic!("unexpected event {:?}", other),
        }
        match event_rx.recv().await.unwrap() {
            Event::Task(TaskOutcome::ResetPhaseTwoDone) => {}
            other => panic!("unexpected event {:?}", other),
        }
        assert_eq!(mock.with_state(|s| s.host_id_ceiling), 17);
    }
}
