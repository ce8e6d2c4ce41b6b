pub mod breakpoint;
pub mod cli;
pub mod coverage;
pub mod dispatch;
pub mod error;
pub mod inferior;
pub mod logging;
pub mod nr;
pub mod proc;
pub mod remote;
pub mod supervisor;
pub mod task;
pub mod traced_task;
