//! Testfan Core - distributed test scheduling
//!
//! This is the core crate of the testfan project. It decides which worker
//! process runs which test item, and lets workers sharing a scope agree on who
//! performs the scope's one-time setup and teardown.
//!
//! Schedulers are synchronous state machines driven one event at a time,
//! either directly or through the async [`Session`] driver. The
//! [`barrier`] module coordinates workers through a shared filesystem.

pub mod barrier;
pub mod collection;
pub mod config;
pub mod error;
pub mod grouping;
pub mod scheduler;
pub mod session;
pub mod testing;
pub mod types;
pub mod worker;
pub mod workset;

pub use barrier::{CountingBarrier, SetupContext, SetupCoordinator, TeardownContext};
pub use collection::{CollectionMismatch, CollectionValidator};
pub use config::{BarrierConfig, DistMode, SchedulerConfig};
pub use error::{CoordinationError, SchedulerError};
pub use grouping::{GroupOverride, Grouping};
pub use scheduler::{
    CustomGroupScheduler, IsoScopeScheduler, LoadScheduler, Scheduler, SchedulerBuilder,
};
pub use session::{Session, SessionEvent, SessionReport, SessionSummary};
pub use types::{GroupKey, ItemIndex, WorkItem, WorkerId};
pub use worker::{ChannelWorker, WorkerCommand, WorkerHandle};
