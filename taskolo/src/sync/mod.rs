mod qutex;
pub use qutex::{Qutex, QutexGuard};

mod rendez;
pub use rendez::Rendez;

mod deadline;
pub use deadline::Deadline;
