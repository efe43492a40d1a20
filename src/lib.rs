pub mod bundle;
pub mod channel;
pub mod encoder;
pub mod frame;
pub mod poller;
pub mod postproc;
pub mod queue;
pub mod registry;
pub mod reprocess;
pub mod save;
pub mod worker;
