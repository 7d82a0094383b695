//! Protocol module containing the frame codec, the token cipher, and the
//! request/response envelopes exchanged with the remote service.

pub mod cipher;
pub mod endpoints;
pub mod envelope;
pub mod frame;

pub use cipher::{CipherError, TokenCipher};
pub use envelope::{ErrorKind, RequestEnvelope, ResponseStatus, ServerResponse};
pub use frame::{decode_frame, encode_frame, FrameError, FrameHeader, HEADER_SIZE, MAGIC, VERSION};
