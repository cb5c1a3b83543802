//! Remote-slave components: C4 SlaveManager (master side), C3 SlaveExecutor
//! (runs on the slave host), C10 SlaveInstaller (one-shot bootstrap).

pub mod backend;
pub mod executor;
pub mod installer;
pub mod manager;

pub use executor::SlaveExecutorState;
pub use installer::{InstallReport, SlaveInstaller};
pub use manager::SlaveManager;
