pub use cross_thread_queue::CrossThreadQueue;
pub use shutdown::{Shutdown, ShutdownSignal};
pub use time::{current_system_time, format_system_time};

mod cross_thread_queue;
mod shutdown;
mod time;
