//! Server-side session tracking for Tether.
//!
//! The [`SessionDirectory`] is the single source of truth for which
//! connections exist, which identity each one established, and which
//! in-game player (if any) it is bound to. Every connection task on the
//! server shares one directory.
//!
//! # How it fits in the stack
//!
//! ```text
//! Server handler (above)  ← identifies, looks up, and stops sessions
//!     ↕
//! Session Layer (this crate)  ← connection → identity → player
//!     ↕
//! Protocol / Transport (below)  ← envelopes, identities, connections
//! ```

mod directory;
mod error;

pub use directory::{SessionDirectory, SessionRecord};
pub use error::SessionError;
