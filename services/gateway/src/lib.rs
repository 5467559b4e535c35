// Gateway service: WebSocket sessions, the broadcast fan-in endpoint, and
// process wiring for the hub, cluster, CDC, and tenant layers.
pub mod app;
pub mod config;
pub mod http;
pub mod observability;
pub mod session;
