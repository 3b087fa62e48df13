pub mod instrumented;
pub mod repo_mem;

pub use instrumented::InstrumentedStore;
pub use repo_mem::InMemoryCollabStore;
