pub mod accounting;
pub mod dependency;
pub mod message_queue;
pub mod ordering;
pub mod queue_config;
pub mod slot_pool;
pub mod sorter;
