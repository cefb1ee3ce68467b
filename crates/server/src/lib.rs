use db::DBService;

pub mod error;
pub mod http;
pub mod routes;

/// Shared state for the HTTP surface. The scheduling engine gets its own
/// `ServiceContext`; the API only ever touches the store.
#[derive(Clone)]
pub struct AppState {
    pub db: DBService,
}
