//! Network Layer
//!
//! WebSocket server, wire protocol, token login and per-user sessions.
//! Collection rules live in `collect/`; this layer only sequences them.

pub mod auth;
pub mod protocol;
pub mod session;
pub mod server;

pub use auth::{AuthConfig, TokenClaims, AuthError, validate_token};
pub use protocol::{
    ClientMessage, ServerMessage, AvatarMove, UserState, UserSummary, MoveResult,
    CollectedItem, ErrorCode,
};
pub use session::{MoveOutcome, SessionError, SessionManager, UserSession};
pub use server::{RoamieServer, ServerConfig, RoamieServerError};
