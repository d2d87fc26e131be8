pub mod data_pool;
pub mod ring;
pub mod thread_group;

pub use data_pool::DataPool;
pub use ring::DataRing;
pub use thread_group::ThreadGroup;
