//! `test-utils` is used for testing in both `balancer-lib` and `balancer-bin`.
//! This crate does not depend on either of them, else we would get dependency cycles.
//! Macros are used instead, so that the importer is responsible for providing the
//! dependencies (`wiremock` and `http`).

/// Create a mock web server, which responds with a predefined status to
/// every `GET` request.
///
/// Further arguments are applied to the `wiremock::ResponseTemplate`, e.g.
/// `insert_header("x-ms-ratelimit-remaining-subscription-reads", "42")` to
/// report a remaining quota.
#[macro_export]
macro_rules! mock_server {
    ($status:expr $(, $func:tt ($($arg:expr),*))*) => {{
        let mock_server = wiremock::MockServer::start().await;
        let response_template = wiremock::ResponseTemplate::new(http::StatusCode::from($status));
        let template = response_template$(.$func($($arg),*))*;
        wiremock::Mock::given(wiremock::matchers::method("GET")).respond_with(template).mount(&mock_server).await;
        mock_server
    }};
}

/// Create a mock web server whose responses report a falling quota.
///
/// The `n`-th response (counting from zero) carries the header `$header`
/// with the value `$budget - n - 1`, saturating at zero, like an upstream
/// instance that counts down its quota for every request it serves.
#[macro_export]
macro_rules! countdown_server {
    ($header:expr, $budget:expr) => {{
        struct Countdown {
            header: &'static str,
            budget: u64,
            served: std::sync::atomic::AtomicU64,
        }

        impl wiremock::Respond for Countdown {
            fn respond(&self, _request: &wiremock::Request) -> wiremock::ResponseTemplate {
                let served = self
                    .served
                    .fetch_add(1, std::sync::atomic::Ordering::SeqCst)
                    + 1;
                let remaining = self.budget.saturating_sub(served);
                wiremock::ResponseTemplate::new(http::StatusCode::OK)
                    .insert_header(self.header, remaining.to_string().as_str())
            }
        }

        let mock_server = wiremock::MockServer::start().await;
        wiremock::Mock::given(wiremock::matchers::method("GET"))
            .respond_with(Countdown {
                header: $header,
                budget: $budget,
                served: std::sync::atomic::AtomicU64::new(0),
            })
            .mount(&mock_server)
            .await;
        mock_server
    }};
}
