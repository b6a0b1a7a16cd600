//! WebSocket protocol core (RFC 6455): frames, masking, validation,
//! reassembly and handshake primitives.

pub mod assembler;
pub mod frame;
pub mod handshake;
pub mod mask;
pub mod opcode;
pub mod utf8;
pub mod validation;

pub use assembler::MessageAssembler;
pub use frame::{Frame, FrameHeader};
pub use handshake::{WS_GUID, compute_accept_key};
pub use mask::{MaskGenerator, apply_mask, apply_mask_at};
pub use opcode::OpCode;
pub use utf8::{Utf8Validator, validate_utf8};
pub use validation::FrameValidator;
