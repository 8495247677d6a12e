//! Authentication for the Flint web server.
//!
//! Two gates sit behind a per-client rate limiter:
//! - the web gate admits browsers holding a session cookie and otherwise
//!   runs the passphrase login flow
//! - the API gate admits a `Bearer` API key or a session cookie

pub mod login;
pub mod middleware;
pub mod rate_limit;
pub mod session;

pub use middleware::{api_gate, json_error, rate_limit_middleware, web_gate, AuthState};
pub use rate_limit::{client_ip, RateLimiter};
pub use session::{SessionManager, SweeperHandle, SESSION_COOKIE, SWEEP_INTERVAL};
