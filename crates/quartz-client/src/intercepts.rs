//! Process-wide connection intercepts.
//!
//! An intercept rewrites `(host, port)` to a different `(host, port)` at
//! connect time, letting tests point a client configured for production
//! endpoints at a local mock without touching DNS. The table is global to
//! the process and consulted only when a connection is opened.

use std::collections::HashMap;
use std::sync::{Mutex, OnceLock};

use crate::config::Endpoint;
use crate::sync;

type InterceptMap = HashMap<(String, u16), (String, u16)>;

fn table() -> &'static Mutex<InterceptMap> {
    static TABLE: OnceLock<Mutex<InterceptMap>> = OnceLock::new();
    TABLE.get_or_init(|| Mutex::new(HashMap::new()))
}

/// Redirects future connections to `(host, port)` towards `(to_host, to_port)`.
pub fn add_intercept(host: impl Into<String>, port: u16, to_host: impl Into<String>, to_port: u16) {
    sync::lock(table()).insert((host.into(), port), (to_host.into(), to_port));
}

/// Removes every intercept.
pub fn clear_intercepts() {
    sync::lock(table()).clear();
}

/// Applies the intercept table to a connect-time target.
pub(crate) fn resolve(endpoint: &Endpoint) -> Endpoint {
    let table = sync::lock(table());
    match table.get(&(endpoint.host.clone(), endpoint.port)) {
        Some((host, port)) => Endpoint::new(host.clone(), *port),
        None => endpoint.clone(),
    }
}
