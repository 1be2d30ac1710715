pub mod db;
pub mod depfile;
pub mod engine;
pub mod queue;
pub mod run;
pub mod signal;
pub mod trace;
pub mod value;

#[cfg(not(windows))]
use jemallocator::Jemalloc;

#[cfg(not(windows))]
#[global_allocator]
static GLOBAL: Jemalloc = Jemalloc;
