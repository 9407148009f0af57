//! evalbridge wire layer: bencode framing and call correlation.
//!
//! Lets one runtime ask another to execute an operation over a byte-stream
//! transport and match the answer back to the caller.
//!
//! ## Architecture
//!
//! - **WireValue** / [`bencode`]: the four-case value algebra and its codec
//! - **ProtocolSession**: one TCP conversation with a bencode eval peer
//! - **MessageIdGenerator**: time-ordered 128-bit correlation ids
//! - **RequestRegistry**: pending calls keyed by id, settled exactly once
//! - [`envelope`]: bridge envelopes to and from wire dicts

pub mod bencode;
pub mod envelope;
pub mod frame;
pub mod id;
pub mod registry;
pub mod session;

pub use bencode::{decode, decode_prefix, encode, FrameScanner, WireValue};
pub use frame::WireError;
pub use id::{Clock, MessageId, MessageIdGenerator, SystemClock};
pub use registry::{PendingHandle, RequestRegistry, SettleOutcome};
pub use session::{EvalOutcome, EvalResult, ProtocolSession, SessionOptions};
