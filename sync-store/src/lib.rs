pub mod change_log;
pub mod conflicts;
pub mod error;
pub mod model;
pub mod sqlite;
pub mod subscribers;

pub use change_log::ChangeRecordStore;
pub use conflicts::ConflictStore;
pub use error::{Result, StoreError};
pub use model::{
    ChangeOperation, ChangeRecord, ChangeRecordWire, Conflict, NewChange, NewConflict, Page,
    ProcessingStatus, ResolutionChoice, ResolutionStatus, Snapshot,
};
pub use model::snapshot_msisdn;
pub use sqlite::SqliteStore;
pub use subscribers::SubscriberStore;
