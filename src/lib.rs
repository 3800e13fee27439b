//! Siren: automated emergency-call intake over telephony media streams.
//!
//! An inbound call is relayed, audio both ways, between the telephony
//! provider's media stream and a realtime speech service that plays the
//! dispatcher. The orchestrator tracks the conversation as it happens and
//! triggers dispatch once enough is known (or a turn ceiling is hit).
//!
//! # Architecture
//!
//! One call is one task group wired by async channels:
//! Media WebSocket → frame codec → speech session → frame codec → Media
//! WebSocket, with the conversation state and dispatch decision sitting on
//! the event path. Around the core:
//! - **Gateway**: axum webhooks, the media socket, and the operator API
//! - **Fallback IVR**: a gather/respond question chain used when the
//!   streaming speech service is unavailable
//! - **Store**: in-memory call records behind an async trait
//!
//! Calls progress `initiating → processing → active → dispatched →
//! on-scene → closed`; the one legal reversal is `dispatched → active`
//! when an assignment is withdrawn.

pub mod call;
pub mod config;
pub mod conversation;
pub mod dispatch;
pub mod error;
pub mod gateway;
pub mod ivr;
pub mod media;
pub mod orchestrator;
pub mod speech;
pub mod store;
pub mod turn;

pub use call::{Call, CallStatus, Speaker, Utterance};
pub use config::SirenConfig;
pub use conversation::ConversationState;
pub use dispatch::DispatchPolicy;
pub use error::{Result, SirenError};
pub use orchestrator::CallOrchestrator;
pub use speech::{SpeechChannel, SpeechEvent};
pub use store::{CallPatch, CallStore, MemoryStore};
pub use turn::TurnDetector;
