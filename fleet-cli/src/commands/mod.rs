//! CLI command implementations

pub mod acct;
pub mod hooks;
pub mod showback;
pub mod vm;

pub use acct::acct;
pub use hooks::hooks;
