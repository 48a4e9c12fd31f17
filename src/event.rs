use crate::server::ServerEvent;
use crate::task::TaskOutcome;

/// Everything the main loop consumes, over a single queue: transport
/// callbacks, async-worker completions and the fixed-rate tick.
#[derive(Debug)]
pub enum Event {
    Server(ServerEvent),
    Task(TaskOutcome),
    Tick,
}
