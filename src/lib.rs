pub mod build_log;
pub mod canon;
pub mod densemap;
pub mod depfile;
pub mod deps_log;
pub mod dyndep;
pub mod eval;
pub mod fs;
pub mod graph;
pub mod hash;
pub mod jobserver;
pub mod load;
pub mod parse;
pub mod process;
#[cfg(unix)]
mod process_posix;
#[cfg(windows)]
mod process_win;
pub mod progress;
pub mod run;
pub mod scanner;
mod signal;
pub mod smallmap;
pub mod task;
mod terminal;
pub mod trace;
pub mod work;

#[cfg(not(windows))]
use jemallocator::Jemalloc;

#[cfg(not(windows))]
#[global_allocator]
static GLOBAL: Jemalloc = Jemalloc;
