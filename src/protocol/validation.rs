//! Incoming frame header validation (RFC 6455 Sections 5.1-5.5).
//!
//! Runs on each header as soon as it is decoded, before any payload byte is
//! read, so a hostile peer cannot make us buffer a frame we would reject.

use crate::connection::Role;
use crate::error::{Error, Result};
use crate::protocol::OpCode;
use crate::protocol::frame::{FrameHeader, MAX_CONTROL_FRAME_PAYLOAD};

#[derive(Debug, Clone, Copy)]
pub struct FrameValidator {
    role: Role,
    compression: bool,
}

impl FrameValidator {
    #[must_use]
    pub fn new(role: Role) -> Self {
        Self {
            role,
            compression: false,
        }
    }

    /// Allow RSV1 on message-initiating frames (permessage-deflate).
    #[must_use]
    pub fn with_compression(mut self, enabled: bool) -> Self {
        self.compression = enabled;
        self
    }

    #[must_use]
    pub fn role(&self) -> Role {
        self.role
    }

    #[must_use]
    pub fn compression(&self) -> bool {
        self.compression
    }

    /// Check masking, reserved bits and control frame rules.
    ///
    /// # Errors
    ///
    /// - `Error::UnmaskedClientFrame` / `Error::MaskedServerFrame` on a
    ///   masking direction mismatch
    /// - `Error::ReservedBitsSet` for RSV2/RSV3, or RSV1 without compression
    ///   or outside the first frame of a message
    /// - `Error::FragmentedControlFrame` / `Error::ControlFrameTooLarge`
    pub fn validate(&self, header: &FrameHeader) -> Result<()> {
        self.validate_masking(header.mask.is_some())?;

        if header.rsv2 || header.rsv3 {
            return Err(Error::ReservedBitsSet);
        }
        if header.rsv1
            && !(self.compression && matches!(header.opcode, OpCode::Text | OpCode::Binary))
        {
            return Err(Error::ReservedBitsSet);
        }

        if header.opcode.is_control() {
            if !header.fin {
                return Err(Error::FragmentedControlFrame);
            }
            if header.payload_len > MAX_CONTROL_FRAME_PAYLOAD as u64 {
                return Err(Error::ControlFrameTooLarge(
                    usize::try_from(header.payload_len).unwrap_or(usize::MAX),
                ));
            }
        }
        Ok(())
    }

    fn validate_masking(&self, masked: bool) -> Result<()> {
        match self.role {
            Role::Server if !masked => Err(Error::UnmaskedClientFrame),
            Role::Client if masked => Err(Error::MaskedServerFrame),
            _ => Ok(()),
        }
    }
}
