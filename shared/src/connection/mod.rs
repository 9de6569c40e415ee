pub mod ack_block;
pub mod big_state;
pub mod big_state_pool;
pub mod cipher;
pub mod endpoint;
pub mod endpoint_config;
pub mod error;
pub mod events;
pub mod header_table;
pub mod heartbeat;
pub mod message_sink;
pub mod packet_type;
pub mod packet_writer;
pub mod sequence_state;
