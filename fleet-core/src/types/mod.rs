//! Core domain types for the fleet.

pub mod history;
pub mod showback;
pub mod vm;

// Re-exports
pub use history::{HistoryRecord, RecordFilter};
pub use showback::{ShowbackRange, ShowbackRecord, YearMonth};
pub use vm::{LcmState, NewVm, TransitionKey, Vm, VmState, VmTemplate};
