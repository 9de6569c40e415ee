pub mod assertions;
pub mod test_link;
pub mod test_peer;

pub use assertions::{assert_in_order, assert_no_duplicates, numbered, numbers_of};
pub use test_link::{TestLink, TICK};
pub use test_peer::TestPeer;
