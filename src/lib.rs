pub mod command;
pub mod db;
pub mod densemap;
pub mod depfile;
pub mod engine;
pub mod fs;
pub mod graph;
pub mod hash;
pub mod key;
pub mod load;
pub mod parse;
pub mod process;
pub mod queue;
pub mod run;
pub mod scanner;
pub mod signal;
pub mod smallmap;
pub mod system;
pub mod tasks;
pub mod tools;
pub mod trace;
pub mod value;

#[cfg(not(windows))]
use jemallocator::Jemalloc;

#[cfg(not(windows))]
#[global_allocator]
static GLOBAL: Jemalloc = Jemalloc;
