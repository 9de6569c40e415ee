pub mod helpers;
pub mod local_socket;
pub mod test_protocol;

pub use helpers::*;
pub use local_socket::{LinkConditions, LinkStats, LocalSocket, LocalSocketPair};
pub use test_protocol::{protocol, DATA, SPAWN, SNAPSHOT};
