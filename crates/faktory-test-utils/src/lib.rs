// faktory-test-utils: A mock Faktory server for testing the client.
// Never a dependency of production crates.

mod mock_server;

pub use mock_server::{MockServer, MockServerConfig};
