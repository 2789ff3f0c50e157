// Library root: the relay, the reconnecting client, job dispatch, tab
// orchestration and the per-site automation engine. Binaries in the sibling
// crates wire these together with a concrete browser host.

pub mod automation;
pub mod client;
pub mod config;
pub mod dispatch;
pub mod host;
pub mod orchestrator;
pub mod protocol;
pub mod relay;
