//! Skips wiremock-backed tests where localhost sockets cannot be bound.

use std::net::TcpListener;

use wiremock::MockServer;

/// Set to `1`, `true` or `yes` to turn a skip into a failure.
const REQUIRE_ENV: &str = "TRANSFER_REQUIRE_SOCKET_TESTS";

fn sockets_required() -> bool {
    std::env::var(REQUIRE_ENV)
        .is_ok_and(|value| matches!(value.to_ascii_lowercase().as_str(), "1" | "true" | "yes"))
}

#[allow(dead_code)]
#[track_caller]
pub fn start_mock_server_or_skip() -> impl std::future::Future<Output = Option<MockServer>> {
    let caller = std::panic::Location::caller();
    let bindable = TcpListener::bind("127.0.0.1:0").map(drop);
    async move {
        match bindable {
            Ok(()) => Some(MockServer::start().await),
            Err(error) => {
                assert!(
                    !sockets_required(),
                    "{REQUIRE_ENV} is set but {caller} cannot bind localhost: {error}"
                );
                eprintln!("skipping socket-bound test at {caller}: {error}");
                None
            }
        }
    }
}

/// Value a skipped test returns.
#[allow(dead_code)]
pub fn socket_skip_return() {}
